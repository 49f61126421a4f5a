//! Multi-block dead flag/GPR/FPR store elimination.
//!
//! 1. Collect, per block, which flags/GPRs/FPRs are read and written. This is deliberately
//!    order-insensitive: a block that both reads and writes a location counts as reading it.
//! 2. For every block, a store is dead when every successor overwrites the location without
//!    reading it first. The result is folded back into the block's write set and propagated for a
//!    fixed number of rounds so that chains of blocks are caught.
//! 3. Remove the stores that hit the kill set.

use crate::container::IrContainer;
use crate::context::{FS_BASE_OFFSET, GPR_OFFSET, XMM_COUNT, XMM_OFFSET};
use crate::error::Result;
use crate::node::{NodeId, Opcode};

pub const PROPAGATION_ROUNDS: usize = 5;

#[derive(Debug, Clone, Copy, Default)]
struct Sets {
    reads: u64,
    writes: u64,
    kill: u64,
}

impl Sets {
    /// `kill = target.writes & !target.reads & !self.reads`
    fn kill_through(&self, target: &Sets) -> u64 {
        target.writes & !target.reads & !self.reads
    }

    fn fold_kill(&mut self) {
        self.writes |= self.kill & !self.reads;
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BlockSets {
    flag: Sets,
    gpr: Sets,
    fpr: Sets,
}

fn is_gpr(offset: u32) -> bool {
    (GPR_OFFSET..FS_BASE_OFFSET).contains(&offset)
}

fn is_full_gpr(offset: u32, size: u8) -> bool {
    size == 8 && offset % 8 == 0 && is_gpr(offset)
}

fn gpr_bit(offset: u32) -> u64 {
    if !is_gpr(offset) {
        return 0;
    }
    1 << ((offset - GPR_OFFSET) / 8)
}

/// Bits of the `stride`-sized registers starting at `base` that `[offset, offset + size)`
/// overlaps, `width` bits per register.
fn span_bits(offset: u32, size: u8, base: u32, end: u32, stride: u32, width: u32) -> u64 {
    let lo = offset.max(base);
    let hi = offset.saturating_add(u32::from(size.max(1))).min(end);
    if lo >= hi {
        return 0;
    }
    let unit = (1u64 << width) - 1;
    ((lo - base) / stride..=(hi - 1 - base) / stride).fold(0, |bits, reg| bits | unit << (reg * width))
}

fn gpr_span(offset: u32, size: u8) -> u64 {
    span_bits(offset, size, GPR_OFFSET, FS_BASE_OFFSET, 8, 1)
}

fn fpr_span(offset: u32, size: u8) -> u64 {
    span_bits(offset, size, XMM_OFFSET, XMM_OFFSET + XMM_COUNT as u32 * 16, 16, 3)
}

fn is_fpr(offset: u32) -> bool {
    let end = XMM_OFFSET + XMM_COUNT as u32 * 16;
    (XMM_OFFSET..end).contains(&offset)
}

fn is_tracked_fpr_write(offset: u32, size: u8) -> bool {
    matches!(size, 16 | 8 | 4) && offset % 16 == 0 && is_fpr(offset)
}

/// Three bits per vector register: low 4 bytes, low 8 bytes, full 16 bytes.
fn fpr_bits(offset: u32, size: u8) -> u64 {
    if !is_fpr(offset) {
        return 0;
    }
    let shift = ((offset - XMM_OFFSET) / 16) * 3;
    if !is_tracked_fpr_write(offset, size) {
        return 0b111 << shift;
    }
    match size {
        16 => 0b111 << shift,
        8 => 0b011 << shift,
        _ => 0b001 << shift,
    }
}

pub fn run(ir: &mut IrContainer) -> Result<bool> {
    let blocks: Vec<NodeId> = ir.blocks().collect();
    let mut index_of = vec![usize::MAX; ir.node_count()];
    for (i, block) in blocks.iter().enumerate() {
        index_of[block.index()] = i;
    }
    let mut info = vec![BlockSets::default(); blocks.len()];

    // Pass 1: per-block read/write sets.
    for (i, &block) in blocks.iter().enumerate() {
        let sets = &mut info[i];
        for node in ir.code(block) {
            let op = ir.op(node);
            match op.opcode() {
                Opcode::StoreFlag => sets.flag.writes |= 1 << (op.imm(0) & 63),
                Opcode::InvalidateFlags => sets.flag.writes |= op.imm(0),
                Opcode::LoadFlag => sets.flag.reads |= 1 << (op.imm(0) & 63),
                Opcode::StoreContext => {
                    let offset = op.imm(0) as u32;
                    if is_full_gpr(offset, op.size()) {
                        sets.gpr.writes |= gpr_bit(offset);
                    } else {
                        sets.gpr.reads |= gpr_span(offset, op.size());
                    }
                    if is_tracked_fpr_write(offset, op.size()) {
                        sets.fpr.writes |= fpr_bits(offset, op.size());
                    } else {
                        sets.fpr.reads |= fpr_span(offset, op.size());
                    }
                }
                Opcode::LoadContext => {
                    let offset = op.imm(0) as u32;
                    sets.gpr.reads |= gpr_span(offset, op.size());
                    sets.fpr.reads |= fpr_span(offset, op.size());
                }
                Opcode::LoadContextIndexed | Opcode::StoreContextIndexed => {
                    // The accessed register is not known statically.
                    sets.gpr.reads = u64::MAX;
                    sets.fpr.reads = u64::MAX;
                }
                _ => {}
            }
        }
    }

    // Pass 2: propagate kills from successors.
    let successors: Vec<Vec<usize>> = blocks
        .iter()
        .map(|&block| {
            ir.code(block)
                .flat_map(|node| {
                    let op = ir.op(node);
                    op.opcode()
                        .block_operands()
                        .iter()
                        .map(|&slot| op.arg(slot))
                        .collect::<Vec<_>>()
                })
                .filter_map(|target| index_of.get(target.index()).copied())
                .filter(|&idx| idx != usize::MAX)
                .collect()
        })
        .collect();

    for _ in 0..PROPAGATION_ROUNDS {
        for (i, succs) in successors.iter().enumerate() {
            if succs.is_empty() {
                continue;
            }
            let mut cur = info[i];
            cur.flag.kill = u64::MAX;
            cur.gpr.kill = u64::MAX;
            cur.fpr.kill = u64::MAX;
            for &s in succs {
                let target = info[s];
                cur.flag.kill &= cur.flag.kill_through(&target.flag);
                cur.gpr.kill &= cur.gpr.kill_through(&target.gpr);
                cur.fpr.kill &= cur.fpr.kill_through(&target.fpr);
            }
            cur.flag.fold_kill();
            cur.gpr.fold_kill();
            cur.fpr.fold_kill();
            info[i] = cur;
        }
    }

    // Pass 3: drop the dead stores.
    let mut changed = false;
    for (i, &block) in blocks.iter().enumerate() {
        let sets = info[i];
        let dead: Vec<NodeId> = ir
            .code(block)
            .filter(|&node| {
                let op = ir.op(node);
                match op.opcode() {
                    Opcode::StoreFlag => sets.flag.kill & (1 << (op.imm(0) & 63)) != 0,
                    Opcode::StoreContext => {
                        let offset = op.imm(0) as u32;
                        let size = op.size();
                        if is_full_gpr(offset, size) {
                            sets.gpr.kill & gpr_bit(offset) != 0
                        } else if is_tracked_fpr_write(offset, size) {
                            let fpr = fpr_bits(offset, size);
                            sets.fpr.kill & fpr == fpr
                        } else {
                            false
                        }
                    }
                    _ => false,
                }
            })
            .collect();
        for node in dead {
            ir.remove(block, node)?;
            changed = true;
        }
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::IrBuilder;
    use crate::context::{gpr_offset, xmm_offset};
    use crate::node::RegisterClass;

    fn opcodes(ir: &IrContainer, block: NodeId) -> Vec<Opcode> {
        ir.code(block).map(|n| ir.op(n).opcode()).collect()
    }

    #[test]
    fn gpr_store_overwritten_by_successor_is_removed() {
        let mut b = IrBuilder::new(0);
        let next = b.create_block();
        let v = b.constant(8, 1);
        b.store_context(8, RegisterClass::General, gpr_offset(3), v);
        b.jump(next);
        b.end_block(4);
        b.set_current_block(next);
        b.store_context(8, RegisterClass::General, gpr_offset(3), v);
        b.exit_function(v);
        b.end_block(4);
        let entry = b.entry_block();
        let mut ir = b.finish();

        assert!(run(&mut ir).unwrap());
        assert!(!opcodes(&ir, entry).contains(&Opcode::StoreContext));
        assert!(opcodes(&ir, next).contains(&Opcode::StoreContext));
    }

    #[test]
    fn partial_gpr_write_is_not_a_kill() {
        let mut b = IrBuilder::new(0);
        let next = b.create_block();
        let v = b.constant(8, 1);
        b.store_context(8, RegisterClass::General, gpr_offset(0), v);
        b.jump(next);
        b.end_block(4);
        b.set_current_block(next);
        b.store_context(4, RegisterClass::General, gpr_offset(0), v);
        b.exit_function(v);
        b.end_block(4);
        let mut ir = b.finish();

        assert!(!run(&mut ir).unwrap());
    }

    #[test]
    fn wide_load_reads_every_register_it_spans() {
        let mut b = IrBuilder::new(0);
        let next = b.create_block();
        let v = b.constant(8, 1);
        b.store_context(8, RegisterClass::General, gpr_offset(1), v);
        b.jump(next);
        b.end_block(4);
        b.set_current_block(next);
        let pair = b.load_context(16, RegisterClass::Float, gpr_offset(0));
        b.store_context(16, RegisterClass::Float, xmm_offset(0), pair);
        b.store_context(8, RegisterClass::General, gpr_offset(1), v);
        b.exit_function(v);
        b.end_block(4);
        let entry = b.entry_block();
        let mut ir = b.finish();

        assert!(!run(&mut ir).unwrap());
        assert!(opcodes(&ir, entry).contains(&Opcode::StoreContext));
    }

    #[test]
    fn wide_store_is_never_killed_through_its_first_register() {
        let mut b = IrBuilder::new(0);
        let next = b.create_block();
        let v = b.load_context(16, RegisterClass::Float, xmm_offset(3));
        b.store_context(16, RegisterClass::Float, gpr_offset(4), v);
        b.jump(next);
        b.end_block(4);
        b.set_current_block(next);
        let w = b.constant(8, 9);
        b.store_context(8, RegisterClass::General, gpr_offset(4), w);
        b.exit_function(w);
        b.end_block(4);
        let entry = b.entry_block();
        let mut ir = b.finish();

        run(&mut ir).unwrap();
        assert!(opcodes(&ir, entry).contains(&Opcode::StoreContext));
    }

    #[test]
    fn span_bits_cover_partial_overlaps() {
        assert_eq!(gpr_span(gpr_offset(0), 16), 0b11);
        assert_eq!(gpr_span(gpr_offset(2) + 4, 8), 0b1100);
        assert_eq!(gpr_span(xmm_offset(0), 16), 0);
        assert_eq!(fpr_span(xmm_offset(1) + 8, 16), 0b111_111 << 3);
    }

    #[test]
    fn indexed_access_blocks_elimination() {
        let mut b = IrBuilder::new(0);
        let next = b.create_block();
        let v = b.constant(8, 1);
        b.store_context(8, RegisterClass::General, gpr_offset(5), v);
        b.jump(next);
        b.end_block(4);
        b.set_current_block(next);
        let idx = b.constant(8, 2);
        b.load_context_indexed(8, RegisterClass::General, GPR_OFFSET, 8, idx);
        b.store_context(8, RegisterClass::General, gpr_offset(5), v);
        b.exit_function(v);
        b.end_block(4);
        let mut ir = b.finish();

        assert!(!run(&mut ir).unwrap());
    }

    #[test]
    fn narrow_fpr_write_does_not_kill_full_store() {
        let mut b = IrBuilder::new(0);
        let next = b.create_block();
        let v = b.load_context(16, RegisterClass::Float, xmm_offset(1));
        b.store_context(16, RegisterClass::Float, xmm_offset(2), v);
        b.jump(next);
        b.end_block(4);
        b.set_current_block(next);
        b.store_context(8, RegisterClass::Float, xmm_offset(2), v);
        let rip = b.constant(8, 0);
        b.exit_function(rip);
        b.end_block(4);
        let mut ir = b.finish();
        assert!(!run(&mut ir).unwrap());
    }

    #[test]
    fn full_fpr_write_kills_narrow_store() {
        let mut b = IrBuilder::new(0);
        let next = b.create_block();
        let v = b.load_context(16, RegisterClass::Float, xmm_offset(1));
        b.store_context(8, RegisterClass::Float, xmm_offset(2), v);
        b.jump(next);
        b.end_block(4);
        b.set_current_block(next);
        b.store_context(16, RegisterClass::Float, xmm_offset(2), v);
        let rip = b.constant(8, 0);
        b.exit_function(rip);
        b.end_block(4);
        let entry = b.entry_block();
        let mut ir = b.finish();

        assert!(run(&mut ir).unwrap());
        assert!(!opcodes(&ir, entry).contains(&Opcode::StoreContext));
    }
}
