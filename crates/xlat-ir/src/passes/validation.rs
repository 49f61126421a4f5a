//! Non-mutating structural checks over an IR container.

use std::fmt;

use crate::container::IrContainer;
use crate::node::{NodeId, Opcode};

/// Read access to register allocation results, so validation can check that every value got a
/// register without this crate depending on the allocator.
pub trait AllocationView {
    fn is_assigned(&self, node: NodeId) -> bool;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, msg: String) {
        self.errors.push(msg);
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.errors.is_empty() {
            writeln!(f, "Errors:")?;
            for e in &self.errors {
                writeln!(f, "  {e}")?;
            }
        }
        if !self.warnings.is_empty() {
            writeln!(f, "Warnings:")?;
            for w in &self.warnings {
                writeln!(f, "  {w}")?;
            }
        }
        Ok(())
    }
}

pub fn validate(ir: &IrContainer, ra: Option<&dyn AllocationView>) -> ValidationReport {
    let mut report = ValidationReport::default();

    if let Err(err) = ir.header() {
        report.error(format!("{err}"));
        return report;
    }

    let blocks: Vec<NodeId> = ir.blocks().collect();
    let mut block_index = vec![usize::MAX; ir.node_count()];
    for (i, b) in blocks.iter().enumerate() {
        block_index[b.index()] = i;
    }
    // Defining block of every linked code node.
    let mut def_block = vec![usize::MAX; ir.node_count()];
    let mut expected_uses = vec![0u32; ir.node_count()];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); blocks.len()];

    for (bi, &block) in blocks.iter().enumerate() {
        if let Err(err) = ir.block(block) {
            report.error(format!("{err}"));
            continue;
        }
        let code: Vec<NodeId> = ir.code(block).collect();
        if code.len() < 3 {
            report.error(format!("{block} has no code besides its markers"));
        }

        for &node in &code {
            def_block[node.index()] = bi;
            let op = ir.op(node);

            if op.has_dest() {
                if op.size() == 0 {
                    report.error(format!("{node}: had destination but with no size"));
                }
                if ir.uses(node) == 0 {
                    report
                        .warnings
                        .push(format!("{node}: destination created but had no uses"));
                }
            }

            for (i, arg) in op.args().enumerate() {
                if arg >= node {
                    report.error(format!(
                        "{node}: Arg[{i}] has definition after use at {arg}"
                    ));
                }
                if let Some(count) = expected_uses.get_mut(arg.index()) {
                    *count += 1;
                }
            }

            for &slot in op.opcode().block_operands() {
                let target = op.arg(slot);
                let is_block = ir.contains(target) && ir.op(target).opcode() == Opcode::CodeBlock;
                match block_index.get(target.index()) {
                    Some(&t) if is_block && t != usize::MAX => successors[bi].push(t),
                    _ => report.error(format!(
                        "{} {node}: target {target} isn't the beginning of a block",
                        op.opcode().name()
                    )),
                }
            }

            if let Some(ra) = ra {
                if op.has_dest() && !ra.is_assigned(node) {
                    report.error(format!("{node}: value has no register assigned"));
                }
            }
        }

        if successors[bi].len() > 2 {
            report.error(format!(
                "{block} has {} successors which is too many",
                successors[bi].len()
            ));
        }

        let last = code.last().map(|&n| ir.op(n).opcode());
        if last != Some(Opcode::EndBlock) {
            report.error(format!("{block} failed to end block with EndBlock"));
        }
        let exit = code
            .len()
            .checked_sub(2)
            .map(|i| ir.op(code[i]).opcode());
        if !exit.map_or(false, Opcode::is_block_exit) {
            report.error(format!(
                "{block} didn't have an exit IR op as its last instruction"
            ));
        }
        if code.first().map(|&n| ir.op(n).opcode()) != Some(Opcode::BeginBlock) {
            report.error(format!("{block} doesn't start with BeginBlock"));
        }
    }

    for (_, node) in ir.all_code() {
        if ir.uses(node) != expected_uses[node.index()] {
            report.error(format!(
                "{node}: use count {} doesn't match {} operand references",
                ir.uses(node),
                expected_uses[node.index()]
            ));
        }
    }

    check_dominance(ir, &blocks, &successors, &def_block, &mut report);
    report
}

/// Iterative dominator sets; block 0 is the entry.
fn dominators(successors: &[Vec<usize>]) -> Vec<Vec<bool>> {
    let n = successors.len();
    let mut preds: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (b, succs) in successors.iter().enumerate() {
        for &s in succs {
            preds[s].push(b);
        }
    }

    let mut dom = vec![vec![true; n]; n];
    if n == 0 {
        return dom;
    }
    dom[0] = vec![false; n];
    dom[0][0] = true;

    let mut changed = true;
    while changed {
        changed = false;
        for b in 1..n {
            let mut new = vec![true; n];
            if preds[b].is_empty() {
                // Unreachable: only dominated by itself.
                new = vec![false; n];
            }
            for &p in &preds[b] {
                for (i, slot) in new.iter_mut().enumerate() {
                    *slot &= dom[p][i];
                }
            }
            new[b] = true;
            if new != dom[b] {
                dom[b] = new;
                changed = true;
            }
        }
    }
    dom
}

fn check_dominance(
    ir: &IrContainer,
    blocks: &[NodeId],
    successors: &[Vec<usize>],
    def_block: &[usize],
    report: &mut ValidationReport,
) {
    let dom = dominators(successors);
    for (use_block, &block) in blocks.iter().enumerate() {
        for node in ir.code(block) {
            let op = ir.op(node);
            let block_slots = op.opcode().block_operands();
            for (i, arg) in op.args().enumerate() {
                if block_slots.contains(&i) {
                    continue;
                }
                let def = def_block.get(arg.index()).copied().unwrap_or(usize::MAX);
                if def == usize::MAX {
                    report.error(format!("{node}: Arg[{i}] {arg} is not defined in any block"));
                } else if def != use_block && !dom[use_block][def] {
                    report.error(format!(
                        "{node}: Arg[{i}] {arg} is defined in {} which doesn't dominate {}",
                        blocks[def], block
                    ));
                }
            }
        }
    }
}

pub fn run(ir: &IrContainer) -> ValidationReport {
    validate(ir, None)
}
