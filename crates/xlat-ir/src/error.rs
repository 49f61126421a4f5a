use thiserror::Error;

use crate::node::NodeId;
use crate::passes::validation::ValidationReport;

pub type Result<T> = std::result::Result<T, IrError>;

#[derive(Debug, Error)]
pub enum IrError {
    #[error("%ssa{node} operand {operand} references %ssa{target}, which is no longer in the IR")]
    DanglingReference {
        node: u32,
        operand: usize,
        target: u32,
    },

    #[error("node %ssa{} is not a {expected}", .node.0)]
    UnexpectedNode { node: NodeId, expected: &'static str },

    #[error("IR failed validation:\n{0}")]
    Validation(ValidationReport),

    #[error("corrupt serialized IR: {0}")]
    Corrupt(&'static str),
}
