//! Block-local redundant context load/store elimination.
//!
//! Tracks the last full-width access to every guest register file member and flag within a block:
//! - a load after a full store of the same class/size reuses the stored value;
//! - a load after a full load of the same class/size reuses the earlier load;
//! - a full store after a full store with no read in between makes the earlier store dead.
//!
//! Partial-width accesses, indexed accesses and side-effecting ops that may observe the context
//! (syscalls, breaks) drop what is known.

use std::collections::HashMap;

use crate::container::IrContainer;
use crate::context::{self, FLAG_COUNT, MEMBER_COUNT};
use crate::error::Result;
use crate::node::{NodeId, Opcode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Unknown,
    Write {
        store: NodeId,
        value: NodeId,
        class: u64,
        size: u8,
    },
    Read {
        load: NodeId,
        class: u64,
        size: u8,
    },
}

struct Tracker {
    members: [Access; MEMBER_COUNT],
    flags: [Access; FLAG_COUNT],
}

impl Tracker {
    fn new() -> Self {
        Self {
            members: [Access::Unknown; MEMBER_COUNT],
            flags: [Access::Unknown; FLAG_COUNT],
        }
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}

enum Action {
    Forward { load: NodeId, value: NodeId },
    RemoveStore(NodeId),
}

pub fn run(ir: &mut IrContainer) -> Result<bool> {
    let mut changed = false;
    let blocks: Vec<NodeId> = ir.blocks().collect();
    for block in blocks {
        changed |= run_block(ir, block)?;
    }
    Ok(changed)
}

fn run_block(ir: &mut IrContainer, block: NodeId) -> Result<bool> {
    let mut tracker = Tracker::new();
    let mut actions = Vec::new();
    // Loads already queued for forwarding, mapped to the value that replaces them. Values picked
    // up later in the scan are resolved through this so no action names a removed load.
    let mut forwarded: HashMap<NodeId, NodeId> = HashMap::new();

    for node in ir.code(block) {
        let op = ir.op(node);
        match op.opcode() {
            Opcode::StoreContext | Opcode::LoadContext => {
                let offset = op.imm(0) as u32;
                let class = op.imm(1);
                let size = op.size();
                let Some((idx, member)) = context::member_at(offset) else {
                    continue;
                };
                if member.offset != offset || member.size != size {
                    for touched in context::members_overlapping(offset, size) {
                        tracker.members[touched] = Access::Unknown;
                    }
                    continue;
                }
                let slot = &mut tracker.members[idx];
                if op.opcode() == Opcode::StoreContext {
                    if let Access::Write { store, .. } = *slot {
                        actions.push(Action::RemoveStore(store));
                    }
                    *slot = Access::Write {
                        store: node,
                        value: resolve(&forwarded, op.arg(0)),
                        class,
                        size,
                    };
                } else {
                    *slot = track_load(*slot, node, class, size, &mut actions, &mut forwarded);
                }
            }
            Opcode::StoreFlag | Opcode::LoadFlag => {
                let flag = op.imm(0) as usize;
                let Some(slot) = tracker.flags.get_mut(flag) else {
                    continue;
                };
                if op.opcode() == Opcode::StoreFlag {
                    if let Access::Write { store, .. } = *slot {
                        actions.push(Action::RemoveStore(store));
                    }
                    *slot = Access::Write {
                        store: node,
                        value: resolve(&forwarded, op.arg(0)),
                        class: 0,
                        size: 1,
                    };
                } else {
                    *slot = track_load(*slot, node, 0, 1, &mut actions, &mut forwarded);
                }
            }
            Opcode::InvalidateFlags => {
                let mask = op.imm(0);
                for (flag, slot) in tracker.flags.iter_mut().enumerate() {
                    if mask & (1 << flag) != 0 {
                        *slot = Access::Unknown;
                    }
                }
            }
            Opcode::LoadContextIndexed
            | Opcode::StoreContextIndexed
            | Opcode::Syscall
            | Opcode::Break => tracker.reset(),
            _ => {}
        }
    }

    let changed = !actions.is_empty();
    for action in actions {
        match action {
            Action::Forward { load, value } => {
                ir.replace_all_uses_with(load, value);
                ir.remove(block, load)?;
            }
            Action::RemoveStore(store) => ir.remove(block, store)?,
        }
    }
    Ok(changed)
}

fn resolve(forwarded: &HashMap<NodeId, NodeId>, mut value: NodeId) -> NodeId {
    while let Some(&next) = forwarded.get(&value) {
        value = next;
    }
    value
}

fn track_load(
    prev: Access,
    load: NodeId,
    class: u64,
    size: u8,
    actions: &mut Vec<Action>,
    forwarded: &mut HashMap<NodeId, NodeId>,
) -> Access {
    let value = match prev {
        Access::Write {
            value,
            class: c,
            size: s,
            ..
        } if c == class && s == size => value,
        Access::Read {
            load: earlier,
            class: c,
            size: s,
        } if c == class && s == size => earlier,
        _ => return Access::Read { load, class, size },
    };
    let value = resolve(forwarded, value);
    forwarded.insert(load, value);
    actions.push(Action::Forward { load, value });
    prev
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::IrBuilder;
    use crate::context::{gpr_offset, xmm_offset};
    use crate::node::RegisterClass;

    #[test]
    fn load_after_store_reuses_stored_value() {
        let mut b = IrBuilder::new(0);
        let v = b.constant(8, 42);
        b.store_context(8, RegisterClass::General, gpr_offset(1), v);
        let reload = b.load_context(8, RegisterClass::General, gpr_offset(1));
        let sum = b.add(8, reload, reload);
        b.exit_function(sum);
        b.end_block(1);
        let entry = b.entry_block();
        let mut ir = b.finish();

        assert!(run(&mut ir).unwrap());
        assert_eq!(ir.op(sum).arg(0), v);
        assert_eq!(ir.op(sum).arg(1), v);
        assert!(ir.code(entry).all(|n| n != reload));
    }

    #[test]
    fn second_load_reuses_first() {
        let mut b = IrBuilder::new(0);
        let first = b.load_context(16, RegisterClass::Float, xmm_offset(0));
        let second = b.load_context(16, RegisterClass::Float, xmm_offset(0));
        let x = b.vxor(16, second, first);
        b.store_context(16, RegisterClass::Float, xmm_offset(1), x);
        let rip = b.constant(8, 0);
        b.exit_function(rip);
        b.end_block(1);
        let mut ir = b.finish();

        assert!(run(&mut ir).unwrap());
        assert_eq!(ir.op(x).arg(0), first);
        assert_eq!(ir.uses(second), 0);
    }

    #[test]
    fn overwritten_store_is_removed_but_read_store_is_kept() {
        let mut b = IrBuilder::new(0);
        let a = b.constant(8, 1);
        let c = b.constant(8, 2);
        let dead = b.store_context(8, RegisterClass::General, gpr_offset(2), a);
        let live = b.store_context(8, RegisterClass::General, gpr_offset(2), c);
        b.syscall(a, a, a);
        b.store_context(8, RegisterClass::General, gpr_offset(2), a);
        b.exit_function(c);
        b.end_block(1);
        let entry = b.entry_block();
        let mut ir = b.finish();

        assert!(run(&mut ir).unwrap());
        let code: Vec<NodeId> = ir.code(entry).collect();
        assert!(!code.contains(&dead));
        assert!(code.contains(&live), "a syscall may observe the context");
    }

    #[test]
    fn copy_of_a_reused_load_forwards_to_the_surviving_load() {
        // mov rcx, rax; add rcx, rax
        let mut b = IrBuilder::new(0);
        let first = b.load_context(8, RegisterClass::General, gpr_offset(0));
        let second = b.load_context(8, RegisterClass::General, gpr_offset(0));
        b.store_context(8, RegisterClass::General, gpr_offset(1), second);
        let copy = b.load_context(8, RegisterClass::General, gpr_offset(1));
        let sum = b.add(8, copy, first);
        b.store_context(8, RegisterClass::General, gpr_offset(1), sum);
        b.exit_function(sum);
        b.end_block(1);
        let entry = b.entry_block();
        let mut ir = b.finish();

        assert!(run(&mut ir).unwrap());
        assert_eq!(ir.op(sum).arg(0), first);
        assert_eq!(ir.op(sum).arg(1), first);
        let code: Vec<NodeId> = ir.code(entry).collect();
        assert!(!code.contains(&second));
        assert!(!code.contains(&copy));
        crate::passes::compaction::run(&mut ir).unwrap();
    }

    #[test]
    fn wide_store_drops_every_register_it_covers() {
        let mut b = IrBuilder::new(0);
        let v = b.constant(8, 7);
        b.store_context(8, RegisterClass::General, gpr_offset(1), v);
        let wide = b.load_context(16, RegisterClass::Float, xmm_offset(0));
        b.store_context(16, RegisterClass::Float, gpr_offset(0), wide);
        let reload = b.load_context(8, RegisterClass::General, gpr_offset(1));
        b.exit_function(reload);
        b.end_block(1);
        let entry = b.entry_block();
        let mut ir = b.finish();

        run(&mut ir).unwrap();
        assert!(ir.code(entry).any(|n| n == reload), "r1 was overwritten by the wide store");
    }

    #[test]
    fn partial_load_is_not_forwarded() {
        let mut b = IrBuilder::new(0);
        let v = b.constant(8, 42);
        b.store_context(8, RegisterClass::General, gpr_offset(1), v);
        let low = b.load_context(4, RegisterClass::General, gpr_offset(1));
        b.exit_function(low);
        b.end_block(1);
        let mut ir = b.finish();

        assert!(!run(&mut ir).unwrap());
    }
}
