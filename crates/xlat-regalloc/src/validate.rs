use xlat_ir::passes::validation;
use xlat_ir::{IrContainer, NodeId, ValidationReport};

use crate::data::RegisterAllocationData;
use crate::inventory::{ConflictTable, PhysicalRegister};
use crate::liveness::{self, LiveRange};

/// Checks an allocation against the IR it was computed for.
///
/// On top of the structural IR checks this verifies that no two simultaneously live values (or
/// temporaries) share a register or hold conflicting registers, and that tied operands share
/// their result's register.
pub fn validate_allocation(
    ir: &IrContainer,
    data: &RegisterAllocationData,
    conflicts: &ConflictTable,
) -> ValidationReport {
    let mut report = validation::validate(ir, Some(data));
    let live = liveness::compute(ir);

    let mut occupants: Vec<(String, LiveRange, PhysicalRegister)> = Vec::new();
    for (block, node) in ir.all_code() {
        if let (Some(range), Some(reg)) = (live.values[node.index()], data.get(node)) {
            occupants.push((node.to_string(), range, reg));
        }
        if let Some(reg) = data.temp(node) {
            let range = liveness::temp_range(live.positions[node.index()], block.0);
            occupants.push((format!("temp of {node}"), range, reg));
        }
    }

    for (i, (a, ra, reg_a)) in occupants.iter().enumerate() {
        for (b, rb, reg_b) in &occupants[i + 1..] {
            if !ra.overlaps(rb) {
                continue;
            }
            if reg_a == reg_b {
                report
                    .errors
                    .push(format!("{a} and {b} are live together in {reg_a}"));
            } else if conflicts.conflicts(*reg_a, *reg_b) {
                report.errors.push(format!(
                    "{a} in {reg_a} conflicts with {b} in {reg_b} while both are live"
                ));
            }
        }
    }

    for (_, node) in ir.all_code() {
        let Some(src) = liveness::tied_operand(ir, &live, node) else {
            continue;
        };
        let (dest_reg, src_reg) = (data.get(node), data.get(src));
        if dest_reg != src_reg {
            report.errors.push(format!(
                "{node} is tied to {src} but they were given {} and {}",
                display(dest_reg),
                display(src_reg)
            ));
        }
    }

    report
}

fn display(reg: Option<PhysicalRegister>) -> String {
    reg.map_or_else(|| "nothing".to_owned(), |r| r.to_string())
}

/// Node IDs that hold `reg` in `data`.
pub fn holders(data: &RegisterAllocationData, reg: PhysicalRegister) -> Vec<NodeId> {
    data.assignments()
        .filter(|&(_, r)| r == reg)
        .map(|(n, _)| n)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::RegisterAllocator;
    use xlat_ir::{IrBuilder, RegisterClass};

    fn sample() -> (IrContainer, NodeId, NodeId) {
        let mut b = IrBuilder::new(0);
        let a = b.constant(8, 1);
        let c = b.constant(8, 2);
        let sum = b.add(8, a, c);
        b.store_context(8, RegisterClass::General, 8, sum);
        b.exit_function(a);
        b.end_block(1);
        (b.finish(), a, c)
    }

    #[test]
    fn fresh_allocation_validates() {
        let (ir, _, _) = sample();
        let alloc = RegisterAllocator::default();
        let data = alloc.allocate(&ir).into_data().unwrap();
        let report = validate_allocation(&ir, &data, alloc.conflicts());
        assert!(report.is_ok(), "{report}");
    }

    #[test]
    fn shared_register_between_live_values_is_reported() {
        let (ir, a, c) = sample();
        let alloc = RegisterAllocator::default();
        let mut data = alloc.allocate(&ir).into_data().unwrap();
        let reg = data.get(a).unwrap();
        data.set(c, reg);
        assert_eq!(holders(&data, reg).len(), 2);

        let report = validate_allocation(&ir, &data, alloc.conflicts());
        assert!(
            report.errors.iter().any(|e| e.contains("live together")),
            "{report}"
        );
    }
}
