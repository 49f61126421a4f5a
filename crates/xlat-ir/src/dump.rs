use std::fmt;

use crate::container::IrContainer;
use crate::node::Opcode;

/// Textual listing used in diagnostics, e.g.
///
/// ```text
/// IrHeader rip=0x1000 blocks=1
/// %ssa1: CodeBlock
///   (%ssa2) BeginBlock 0x1
///   %ssa3 i64 = Constant 0x7
///   (%ssa4) StoreContext %ssa3 i64, 0x8, 0x0
/// ```
impl fmt::Display for IrContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = match self.header() {
            Ok(header) => header,
            Err(err) => return writeln!(f, "<invalid IR: {err}>"),
        };
        writeln!(
            f,
            "IrHeader rip={:#x} blocks={}",
            header.guest_rip, header.block_count
        )?;

        for block in self.blocks() {
            writeln!(f, "{block}: CodeBlock")?;
            for node in self.code(block) {
                let op = self.op(node);
                if op.has_dest() {
                    write!(f, "  {node} i{} = {}", u32::from(op.size()) * 8, op.opcode().name())?;
                } else {
                    write!(f, "  ({node}) {}", op.opcode().name())?;
                }

                let mut sep = " ";
                for arg in op.args() {
                    write!(f, "{sep}{arg}")?;
                    if self.contains(arg) && self.op(arg).opcode() != Opcode::CodeBlock {
                        write!(f, " i{}", u32::from(self.op(arg).size()) * 8)?;
                    }
                    sep = ", ";
                }
                for idx in 0..op.num_imms() {
                    write!(f, "{sep}{:#x}", op.imm(idx))?;
                    sep = ", ";
                }
                if self.uses(node) == 0 && op.has_dest() {
                    write!(f, " ; unused")?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}
