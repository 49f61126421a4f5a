//! First-fit graph allocation without spilling.
//!
//! One graph node is created per SSA value plus one per instruction-local temporary. Nodes whose
//! live ranges overlap interfere. Assignment order is: ABI-pinned values, then temporaries, then
//! the remaining values in reverse ID order. Each node takes the lowest index of its class that
//! neither an assigned neighbour holds nor conflicts with a neighbour's register. Tied operands
//! are assigned together as one unit.
//!
//! Allocation never spills. When the highest index used in some class reaches the inventory for
//! that class, the whole region fails with [`AllocationOutcome::CapacityExceeded`].

use xlat_ir::{IrContainer, NodeId, RegisterClass};

use crate::data::RegisterAllocationData;
use crate::inventory::{ConflictTable, PhysicalRegister, RegisterInventory};
use crate::liveness::{self, LiveRange, Liveness};

/// Above this many values, interference is only computed between values of the same block and
/// against values that escape their block.
pub const BLOCK_LOCAL_INTERFERENCE_THRESHOLD: usize = 2048;

const MAX_INDEX: u32 = u8::MAX as u32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationOutcome {
    Allocated(RegisterAllocationData),
    /// `pressure` is the highest used index + 1 for `class`, which exceeds the inventory.
    CapacityExceeded {
        class: RegisterClass,
        pressure: u32,
        inventory: u32,
    },
    /// An ABI-fixed register was already taken by an interfering value.
    PinnedUnavailable {
        node: NodeId,
        register: PhysicalRegister,
    },
}

impl AllocationOutcome {
    pub fn is_allocated(&self) -> bool {
        matches!(self, AllocationOutcome::Allocated(_))
    }

    pub fn into_data(self) -> Option<RegisterAllocationData> {
        match self {
            AllocationOutcome::Allocated(data) => Some(data),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Value(NodeId),
    Temp(NodeId),
}

#[derive(Debug, Clone)]
struct GraphNode {
    kind: Kind,
    class: RegisterClass,
    range: LiveRange,
    pinned: Option<u8>,
    reg: Option<PhysicalRegister>,
    /// Index of the group this node is tied into, if any.
    tied: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct RegisterAllocator {
    inventory: RegisterInventory,
    conflicts: ConflictTable,
    block_local_threshold: usize,
}

impl Default for RegisterAllocator {
    fn default() -> Self {
        let inventory = RegisterInventory::default();
        Self::new(inventory, ConflictTable::pair_aliasing(&inventory))
    }
}

impl RegisterAllocator {
    pub fn new(inventory: RegisterInventory, conflicts: ConflictTable) -> Self {
        Self {
            inventory,
            conflicts,
            block_local_threshold: BLOCK_LOCAL_INTERFERENCE_THRESHOLD,
        }
    }

    pub fn with_block_local_threshold(mut self, threshold: usize) -> Self {
        self.block_local_threshold = threshold;
        self
    }

    pub fn inventory(&self) -> &RegisterInventory {
        &self.inventory
    }

    pub fn conflicts(&self) -> &ConflictTable {
        &self.conflicts
    }

    pub fn allocate(&self, ir: &IrContainer) -> AllocationOutcome {
        let live = liveness::compute(ir);
        let (mut nodes, groups) = build_nodes(ir, &live);

        let adjacency = if live.value_count >= self.block_local_threshold {
            block_local_interference(&nodes)
        } else {
            full_interference(&nodes)
        };

        let mut order: Vec<usize> = Vec::with_capacity(nodes.len());
        order.extend((0..nodes.len()).filter(|&i| nodes[i].pinned.is_some()));
        order.extend(
            (0..nodes.len())
                .filter(|&i| nodes[i].pinned.is_none() && matches!(nodes[i].kind, Kind::Temp(_))),
        );
        let mut values: Vec<usize> = (0..nodes.len())
            .filter(|&i| nodes[i].pinned.is_none() && matches!(nodes[i].kind, Kind::Value(_)))
            .collect();
        values.sort_by_key(|&i| match nodes[i].kind {
            Kind::Value(id) | Kind::Temp(id) => std::cmp::Reverse(id),
        });
        order.extend(values);

        for i in order {
            if nodes[i].reg.is_some() {
                continue;
            }
            let unit: Vec<usize> = match nodes[i].tied {
                Some(g) => groups[g].clone(),
                None => vec![i],
            };
            let class = nodes[i].class;

            if let Some(index) = nodes[i].pinned {
                let reg = PhysicalRegister::new(class, index);
                if !self.is_free(&nodes, &adjacency, &unit, reg) {
                    let node = match nodes[i].kind {
                        Kind::Value(id) | Kind::Temp(id) => id,
                    };
                    tracing::warn!(%node, %reg, "pinned register is held by an interfering value");
                    return AllocationOutcome::PinnedUnavailable {
                        node,
                        register: reg,
                    };
                }
                for &m in &unit {
                    nodes[m].reg = Some(reg);
                }
                continue;
            }

            let found = (0..=MAX_INDEX)
                .map(|idx| PhysicalRegister::new(class, idx as u8))
                .find(|&reg| self.is_free(&nodes, &adjacency, &unit, reg));
            match found {
                Some(reg) => {
                    for &m in &unit {
                        nodes[m].reg = Some(reg);
                    }
                }
                None => {
                    return AllocationOutcome::CapacityExceeded {
                        class,
                        pressure: MAX_INDEX + 1,
                        inventory: self.inventory.count(class),
                    }
                }
            }
        }

        let mut data = RegisterAllocationData::with_node_count(ir.node_count());
        for node in &nodes {
            let Some(reg) = node.reg else { continue };
            match node.kind {
                Kind::Value(id) => data.set(id, reg),
                Kind::Temp(id) => data.set_temp(id, reg),
            }
        }

        for class in RegisterClass::ALL {
            let pressure = data.pressure(class);
            let inventory = self.inventory.count(class);
            if pressure > inventory {
                tracing::debug!(?class, pressure, inventory, "register pressure exceeds inventory");
                return AllocationOutcome::CapacityExceeded {
                    class,
                    pressure,
                    inventory,
                };
            }
        }
        AllocationOutcome::Allocated(data)
    }

    fn is_free(
        &self,
        nodes: &[GraphNode],
        adjacency: &[Vec<usize>],
        unit: &[usize],
        reg: PhysicalRegister,
    ) -> bool {
        unit.iter().all(|&m| {
            adjacency[m]
                .iter()
                .filter(|n| !unit.contains(n))
                .filter_map(|&n| nodes[n].reg)
                .all(|other| other != reg && !self.conflicts.conflicts(other, reg))
        })
    }
}

fn build_nodes(ir: &IrContainer, live: &Liveness) -> (Vec<GraphNode>, Vec<Vec<usize>>) {
    let mut nodes = Vec::with_capacity(live.value_count);
    let mut graph_index = vec![usize::MAX; ir.node_count()];

    for (_, node) in ir.all_code() {
        let Some(range) = live.values[node.index()] else {
            continue;
        };
        let Some(class) = ir.op(node).dest_class() else {
            continue;
        };
        graph_index[node.index()] = nodes.len();
        nodes.push(GraphNode {
            kind: Kind::Value(node),
            class,
            range,
            pinned: liveness::pinned_index(ir, node),
            reg: None,
            tied: None,
        });
    }

    for (block, node) in ir.all_code() {
        if let Some(class) = liveness::temp_class(ir, node) {
            nodes.push(GraphNode {
                kind: Kind::Temp(node),
                class,
                range: liveness::temp_range(live.positions[node.index()], block.0),
                pinned: None,
                reg: None,
                tied: None,
            });
        }
    }

    let mut groups: Vec<Vec<usize>> = Vec::new();
    for (_, node) in ir.all_code() {
        let Some(src) = liveness::tied_operand(ir, live, node) else {
            continue;
        };
        let (dest, src) = (graph_index[node.index()], graph_index[src.index()]);
        if dest == usize::MAX || src == usize::MAX {
            continue;
        }
        match nodes[src].tied {
            Some(g) => {
                groups[g].push(dest);
                nodes[dest].tied = Some(g);
            }
            None => {
                nodes[src].tied = Some(groups.len());
                nodes[dest].tied = Some(groups.len());
                groups.push(vec![src, dest]);
            }
        }
    }

    (nodes, groups)
}

fn full_interference(nodes: &[GraphNode]) -> Vec<Vec<usize>> {
    let mut adjacency = vec![Vec::new(); nodes.len()];
    for i in 0..nodes.len() {
        for j in i + 1..nodes.len() {
            if nodes[i].range.overlaps(&nodes[j].range) {
                adjacency[i].push(j);
                adjacency[j].push(i);
            }
        }
    }
    adjacency
}

fn block_local_interference(nodes: &[GraphNode]) -> Vec<Vec<usize>> {
    let mut adjacency = vec![Vec::new(); nodes.len()];
    let mut by_block: Vec<(u32, usize)> = Vec::new();
    let mut escaping: Vec<usize> = Vec::new();
    for (i, node) in nodes.iter().enumerate() {
        if node.range.escapes {
            escaping.push(i);
        } else {
            by_block.push((node.range.block, i));
        }
    }
    by_block.sort_unstable();

    let mut start = 0;
    while start < by_block.len() {
        let block = by_block[start].0;
        let end = by_block[start..]
            .iter()
            .position(|&(b, _)| b != block)
            .map_or(by_block.len(), |n| start + n);
        let run = &by_block[start..end];
        for (x, &(_, i)) in run.iter().enumerate() {
            for &(_, j) in &run[x + 1..] {
                if nodes[i].range.overlaps(&nodes[j].range) {
                    adjacency[i].push(j);
                    adjacency[j].push(i);
                }
            }
        }
        start = end;
    }

    for (x, &i) in escaping.iter().enumerate() {
        let others = escaping[x + 1..]
            .iter()
            .copied()
            .chain(by_block.iter().map(|&(_, j)| j));
        for j in others {
            if nodes[i].range.overlaps(&nodes[j].range) {
                adjacency[i].push(j);
                adjacency[j].push(i);
            }
        }
    }
    adjacency
}

#[cfg(test)]
mod tests {
    use super::*;
    use xlat_ir::IrBuilder;

    fn chain(values: usize) -> IrContainer {
        let mut b = IrBuilder::new(0);
        let live: Vec<NodeId> = (0..values).map(|i| b.constant(8, i as u64)).collect();
        let mut acc = live[0];
        for &v in &live[1..] {
            acc = b.add(8, acc, v);
        }
        b.exit_function(acc);
        b.end_block(1);
        b.finish()
    }

    #[test]
    fn simultaneously_live_values_get_distinct_registers() {
        let ir = chain(4);
        let data = RegisterAllocator::default().allocate(&ir).into_data().unwrap();
        let consts: Vec<PhysicalRegister> = ir
            .all_code()
            .filter(|&(_, n)| ir.op(n).opcode() == xlat_ir::Opcode::Constant)
            .map(|(_, n)| data.get(n).unwrap())
            .collect();
        for (i, a) in consts.iter().enumerate() {
            for b in &consts[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert!(data.pressure(RegisterClass::General) <= 5);
    }

    #[test]
    fn too_many_live_values_fail_instead_of_spilling() {
        let ir = chain(20);
        let outcome = RegisterAllocator::default().allocate(&ir);
        assert!(
            matches!(
                outcome,
                AllocationOutcome::CapacityExceeded {
                    class: RegisterClass::General,
                    inventory: 16,
                    ..
                }
            ),
            "{outcome:?}"
        );
    }

    #[test]
    fn syscall_result_is_pinned_and_cas_pair_is_tied() {
        let mut b = IrBuilder::new(0);
        let addr = b.constant(8, 0x1000);
        let lo = b.constant(8, 1);
        let hi = b.constant(8, 2);
        let expected = b.create_element_pair(8, lo, hi);
        let desired = b.create_element_pair(8, hi, lo);
        let old = b.cas_pair(8, expected, desired, addr);
        let ret = b.syscall(addr, addr, addr);
        let sum = b.add(8, ret, addr);
        b.store_mem(16, RegisterClass::GeneralPair, sum, old);
        b.exit_function(sum);
        b.end_block(1);
        let ir = b.finish();

        let data = RegisterAllocator::default().allocate(&ir).into_data().unwrap();
        assert_eq!(data.get(ret), Some(PhysicalRegister::gpr(0)));
        assert_eq!(data.get(old), data.get(expected));
        assert_ne!(data.get(old), data.get(desired));
        let temp = data.temp(old).unwrap();
        assert_eq!(temp.class, RegisterClass::General);
        assert_ne!(Some(temp), data.get(addr));
        assert!(xlat_ir::passes::validation::validate(&ir, Some(&data)).is_ok());
    }

    #[test]
    fn pair_registers_avoid_their_aliased_halves() {
        let mut b = IrBuilder::new(0);
        let a = b.constant(8, 1);
        let c = b.constant(8, 2);
        let pair = b.create_element_pair(8, a, c);
        let d = b.constant(8, 3);
        let e = b.constant(8, 4);
        let sum = b.add(8, d, e);
        b.store_mem(16, RegisterClass::GeneralPair, sum, pair);
        b.exit_function(sum);
        b.end_block(1);
        let ir = b.finish();

        let alloc = RegisterAllocator::default();
        let data = alloc.allocate(&ir).into_data().unwrap();
        let p = data.get(pair).unwrap();
        for v in [d, e, sum] {
            let r = data.get(v).unwrap();
            assert!(!alloc.conflicts().conflicts(p, r), "{p} aliases {r}");
        }
    }

    #[test]
    fn block_local_mode_matches_full_interference() {
        let mut b = IrBuilder::new(0);
        let next = b.create_block();
        let shared = b.constant(8, 7);
        let x = b.constant(8, 1);
        let y = b.add(8, x, shared);
        b.store_context(8, RegisterClass::General, 8, y);
        b.jump(next);
        b.end_block(1);
        b.set_current_block(next);
        let z = b.constant(8, 2);
        let w = b.add(8, z, shared);
        b.exit_function(w);
        b.end_block(1);
        let ir = b.finish();

        let full = RegisterAllocator::default().allocate(&ir);
        let local = RegisterAllocator::default()
            .with_block_local_threshold(0)
            .allocate(&ir);
        assert!(full.is_allocated());
        assert_eq!(full, local);
    }
}
