use thiserror::Error;

pub type Result<T> = std::result::Result<T, RaDataError>;

/// Failure decoding serialized allocation data.
///
/// Running out of registers is not an error; see [`crate::AllocationOutcome`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RaDataError {
    #[error("truncated register allocation data")]
    Truncated,

    #[error("invalid register class {0}")]
    InvalidClass(u8),

    #[error("temporary register entry references node %ssa{node} beyond {count} nodes")]
    TempOutOfRange { node: u32, count: u32 },
}
