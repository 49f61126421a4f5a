use crate::container::IrContainer;
use crate::error::Result;
use crate::node::NodeId;

/// Removes values with no remaining uses and no side effects.
///
/// Blocks and their code are walked back to front so that a chain of dead values disappears in a
/// single run.
pub fn run(ir: &mut IrContainer) -> Result<bool> {
    let mut changed = false;
    let blocks: Vec<NodeId> = ir.blocks().collect();
    for &block in blocks.iter().rev() {
        let code: Vec<NodeId> = ir.code(block).collect();
        for &node in code.iter().rev() {
            let op = ir.op(node);
            if op.has_dest() && !op.has_side_effects() && ir.uses(node) == 0 {
                ir.remove(block, node)?;
                changed = true;
            }
        }
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::IrBuilder;
    use crate::node::Opcode;

    #[test]
    fn dead_chain_is_removed_in_one_run() {
        let mut b = IrBuilder::new(0);
        let a = b.constant(8, 1);
        let c = b.constant(8, 2);
        let sum = b.add(8, a, c);
        let _unused = b.xor(8, sum, a);
        let rip = b.constant(8, 0x10);
        b.syscall(rip, rip, rip);
        b.exit_function(rip);
        b.end_block(1);
        let entry = b.entry_block();
        let mut ir = b.finish();

        assert!(run(&mut ir).unwrap());
        let left: Vec<Opcode> = ir.code(entry).map(|n| ir.op(n).opcode()).collect();
        assert_eq!(
            left,
            vec![
                Opcode::BeginBlock,
                Opcode::Constant,
                Opcode::Syscall,
                Opcode::ExitFunction,
                Opcode::EndBlock
            ],
            "unused syscall result must survive because the call has side effects"
        );
        assert!(!run(&mut ir).unwrap());
    }
}
