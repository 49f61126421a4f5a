//! Rebuilds an IR container into fresh, dense arenas.
//!
//! Layout of the result: the header at node 0, then every block node in block-list order, then
//! the code of each block in order. Node IDs therefore increase monotonically along program
//! order, and compacting an already compact container reproduces it exactly.

use crate::container::{BlockInfo, Header, IrContainer};
use crate::error::{IrError, Result};
use crate::node::{NodeId, Opcode};

pub fn compact(ir: &IrContainer) -> Result<IrContainer> {
    let old_header = ir.header()?;
    let blocks: Vec<NodeId> = ir.blocks().collect();

    let mut out = IrContainer::new();
    let mut remap: Vec<Option<NodeId>> = vec![None; ir.node_count()];

    let header = out.push_node(Opcode::IrHeader, 0, 0, &[], &[0; 3], false);
    remap[NodeId::HEADER.index()] = Some(header);

    let none = u64::from(u32::MAX);
    let mut new_blocks = Vec::with_capacity(blocks.len());
    for &block in &blocks {
        let new = out.push_node(Opcode::CodeBlock, 0, 0, &[], &[none; 3], false);
        remap[block.index()] = Some(new);
        new_blocks.push(new);
    }

    out.set_header(Header {
        first_block: new_blocks.first().copied(),
        guest_rip: old_header.guest_rip,
        block_count: new_blocks.len() as u32,
    });

    // Copy code with the old operand IDs; they are rewritten once every node has a new home.
    let mut copied: Vec<(NodeId, NodeId)> = Vec::new();
    for (i, &block) in blocks.iter().enumerate() {
        let mut prev: Option<NodeId> = None;
        let mut begin = None;
        for node in ir.code(block) {
            let op = ir.op(node);
            let args: Vec<NodeId> = op.args().collect();
            let mut imms: Vec<u64> = (0..op.num_imms()).map(|i| op.imm(i)).collect();
            if op.opcode() == Opcode::BeginBlock {
                imms[0] = u64::from(new_blocks[i].0);
            }
            let new = out.push_node(
                op.opcode(),
                op.size(),
                op.elem_size(),
                &args,
                &imms,
                false,
            );
            remap[node.index()] = Some(new);
            copied.push((node, new));
            match prev {
                Some(p) => out.link_after(p, new),
                None => begin = Some(new),
            }
            prev = Some(new);
        }
        let next = new_blocks.get(i + 1).copied();
        out.set_block(
            new_blocks[i],
            BlockInfo {
                begin,
                last: prev,
                next,
            },
        );
    }

    for (old, new) in copied {
        let op = ir.op(old);
        for idx in 0..op.num_args() {
            let target = op.arg(idx);
            let mapped = remap
                .get(target.index())
                .copied()
                .flatten()
                .ok_or(IrError::DanglingReference {
                    node: old.0,
                    operand: idx,
                    target: target.0,
                })?;
            let at = out.list[new.index()].data.0 as usize + crate::node::OP_HEADER_LEN + idx * 4;
            out.data[at..at + 4].copy_from_slice(&mapped.0.to_le_bytes());
        }
    }

    out.recompute_uses();
    Ok(out)
}

/// Swaps `ir` for its compacted form. Reports a change when the layout actually moved.
pub fn run(ir: &mut IrContainer) -> Result<bool> {
    let compacted = compact(ir)?;
    if compacted == *ir {
        return Ok(false);
    }
    *ir = compacted;
    Ok(true)
}
