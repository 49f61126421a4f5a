//! Linear live ranges over the region's program order.
//!
//! Every linked node gets a position `2 * i` where `i` is its index in block order. A value lives
//! from its definition to its last use. Values used outside their defining block live until the
//! end of the region, since a loop back edge may carry them around again. Instruction-local
//! temporaries occupy `[2i - 1, 2i + 1]`, overlapping both the operands and the result of their
//! node.

use xlat_ir::{IrContainer, NodeId, Opcode, RegisterClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LiveRange {
    pub begin: u32,
    pub end: u32,
    pub block: u32,
    pub escapes: bool,
}

impl LiveRange {
    #[inline]
    pub fn overlaps(&self, other: &LiveRange) -> bool {
        !(self.begin >= other.end || other.begin >= self.end)
    }
}

#[derive(Debug)]
pub(crate) struct Liveness {
    /// Range of each value, indexed by node ID.
    pub values: Vec<Option<LiveRange>>,
    pub positions: Vec<u32>,
    pub value_count: usize,
}

pub(crate) fn compute(ir: &IrContainer) -> Liveness {
    let mut values: Vec<Option<LiveRange>> = vec![None; ir.node_count()];
    let mut positions = vec![u32::MAX; ir.node_count()];
    let mut value_count = 0;
    let mut last = 0u32;

    for (i, (block, node)) in ir.all_code().enumerate() {
        let pos = 2 * (i as u32 + 1);
        positions[node.index()] = pos;
        last = pos;
        let op = ir.op(node);

        for arg in op.args() {
            if let Some(Some(range)) = values.get_mut(arg.index()) {
                range.end = range.end.max(pos);
                if range.block != block.0 {
                    range.escapes = true;
                }
            }
        }

        if op.dest_class().is_some() {
            values[node.index()] = Some(LiveRange {
                begin: pos,
                end: pos,
                block: block.0,
                escapes: false,
            });
            value_count += 1;
        }
    }

    let region_end = last + 1;
    for range in values.iter_mut().flatten() {
        if range.escapes {
            range.end = region_end;
        }
    }

    Liveness {
        values,
        positions,
        value_count,
    }
}

pub(crate) fn temp_range(position: u32, block: u32) -> LiveRange {
    LiveRange {
        begin: position - 1,
        end: position + 1,
        block,
        escapes: false,
    }
}

/// Scratch register class needed by `node` while it executes.
pub(crate) fn temp_class(ir: &IrContainer, node: NodeId) -> Option<RegisterClass> {
    match ir.op(node).opcode() {
        Opcode::CasPair => Some(RegisterClass::General),
        _ => None,
    }
}

/// ABI-fixed destination register of `node`.
pub(crate) fn pinned_index(ir: &IrContainer, node: NodeId) -> Option<u8> {
    match ir.op(node).opcode() {
        Opcode::Syscall => Some(0),
        _ => None,
    }
}

/// Operand that must share the destination register of `node`.
///
/// The tie only holds when the operand dies at `node` and has the same class as the result;
/// otherwise code generation copies and the two are allocated independently.
pub(crate) fn tied_operand(ir: &IrContainer, live: &Liveness, node: NodeId) -> Option<NodeId> {
    let op = ir.op(node);
    if op.opcode() != Opcode::CasPair {
        return None;
    }
    let src = op.arg(0);
    let src_op = ir.op(src);
    let src_range = live.values.get(src.index()).copied().flatten()?;
    let pos = live.positions[node.index()];
    if src_op.dest_class() == op.dest_class() && src_range.end == pos && !src_range.escapes {
        Some(src)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xlat_ir::IrBuilder;

    #[test]
    fn escaping_values_live_to_region_end() {
        let mut b = IrBuilder::new(0);
        let next = b.create_block();
        let local = b.constant(8, 1);
        let escaping = b.constant(8, 2);
        let sum = b.add(8, local, local);
        b.jump(next);
        b.end_block(1);
        b.set_current_block(next);
        b.exit_function(escaping);
        b.end_block(1);
        let ir = b.finish();

        let live = compute(&ir);
        let local_range = live.values[local.index()].unwrap();
        assert_eq!(local_range.end, live.positions[sum.index()]);
        assert!(!local_range.escapes);

        let escaping_range = live.values[escaping.index()].unwrap();
        assert!(escaping_range.escapes);
        assert!(live.positions.iter().filter(|&&p| p != u32::MAX).all(|&p| p < escaping_range.end));
        assert_eq!(live.value_count, 3);
    }

    #[test]
    fn operand_and_result_of_one_node_do_not_overlap() {
        let a = LiveRange {
            begin: 2,
            end: 6,
            block: 1,
            escapes: false,
        };
        let b = LiveRange {
            begin: 6,
            end: 8,
            block: 1,
            escapes: false,
        };
        assert!(!a.overlaps(&b));
        assert!(temp_range(6, 1).overlaps(&a));
        assert!(temp_range(6, 1).overlaps(&b));
    }
}
