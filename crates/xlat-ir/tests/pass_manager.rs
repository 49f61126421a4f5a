use proptest::prelude::*;
use xlat_ir::context::{gpr_offset, xmm_offset};
use xlat_ir::passes::compaction::compact;
use xlat_ir::passes::validation::validate;
use xlat_ir::{
    IrBuilder, IrContainer, NodeId, PassManager, PassManagerConfig, RegisterClass, ValidationMode,
};

#[derive(Debug, Clone)]
enum Op {
    Const(u64),
    Add,
    StoreGpr { reg: usize, wide: bool },
    LoadGpr(usize),
    StoreFlag(u32),
    LoadFlag(u32),
    InvalidateFlags(u64),
    StoreXmm { reg: usize, size: u8 },
    LoadXmm(usize),
    /// `mov to, from`: reload `from` and store it to `to`.
    Copy { from: usize, to: usize },
    /// A 16 byte read straddling two GPRs.
    LoadGprPair(usize),
    Syscall,
}

#[derive(Debug, Clone)]
enum Term {
    Jump(usize),
    Branch(usize, usize),
    Exit,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        2 => any::<u64>().prop_map(Op::Const),
        2 => Just(Op::Add),
        2 => (0usize..4, any::<bool>()).prop_map(|(reg, wide)| Op::StoreGpr { reg, wide }),
        3 => (0usize..4).prop_map(Op::LoadGpr),
        1 => (0u32..4).prop_map(Op::StoreFlag),
        1 => (0u32..4).prop_map(Op::LoadFlag),
        1 => (0u64..16).prop_map(Op::InvalidateFlags),
        1 => (0usize..2, prop_oneof![Just(4u8), Just(8u8), Just(16u8)])
            .prop_map(|(reg, size)| Op::StoreXmm { reg, size }),
        1 => (0usize..2).prop_map(Op::LoadXmm),
        3 => (0usize..4, 0usize..4).prop_map(|(from, to)| Op::Copy { from, to }),
        1 => (0usize..3).prop_map(Op::LoadGprPair),
        1 => Just(Op::Syscall),
    ]
}

fn term_strategy() -> impl Strategy<Value = Term> {
    prop_oneof![
        (0usize..8).prop_map(Term::Jump),
        (0usize..8, 0usize..8).prop_map(|(t, f)| Term::Branch(t, f)),
        Just(Term::Exit),
    ]
}

fn region_strategy() -> impl Strategy<Value = Vec<(Vec<Op>, Term)>> {
    proptest::collection::vec(
        (proptest::collection::vec(op_strategy(), 0..12), term_strategy()),
        1..6,
    )
}

/// Builds IR where every value is consumed only inside the block that defines it.
fn build(region: &[(Vec<Op>, Term)]) -> IrContainer {
    let mut b = IrBuilder::new(0x40_0000);
    let mut blocks = vec![b.entry_block()];
    for _ in 1..region.len() {
        blocks.push(b.create_block());
    }

    for (i, (ops, term)) in region.iter().enumerate() {
        b.set_current_block(blocks[i]);
        let mut ints: Vec<NodeId> = Vec::new();
        let mut vecs: Vec<NodeId> = Vec::new();

        fn int(b: &mut IrBuilder, ints: &mut Vec<NodeId>) -> NodeId {
            match ints.last() {
                Some(&v) => v,
                None => {
                    let v = b.constant(8, 0);
                    ints.push(v);
                    v
                }
            }
        }

        for op in ops {
            match *op {
                Op::Const(v) => ints.push(b.constant(8, v)),
                Op::Add => {
                    let lhs = int(&mut b, &mut ints);
                    let rhs = ints[ints.len().saturating_sub(2)];
                    ints.push(b.add(8, lhs, rhs));
                }
                Op::StoreGpr { reg, wide } => {
                    let v = int(&mut b, &mut ints);
                    let size = if wide { 8 } else { 4 };
                    b.store_context(size, RegisterClass::General, gpr_offset(reg), v);
                }
                Op::LoadGpr(reg) => {
                    ints.push(b.load_context(8, RegisterClass::General, gpr_offset(reg)))
                }
                Op::StoreFlag(flag) => {
                    let v = int(&mut b, &mut ints);
                    b.store_flag(flag, v);
                }
                Op::LoadFlag(flag) => ints.push(b.load_flag(flag)),
                Op::InvalidateFlags(mask) => {
                    b.invalidate_flags(mask);
                }
                Op::StoreXmm { reg, size } => {
                    let v = match vecs.last() {
                        Some(&v) => v,
                        None => {
                            let v = b.load_context(16, RegisterClass::Float, xmm_offset(3));
                            vecs.push(v);
                            v
                        }
                    };
                    b.store_context(size, RegisterClass::Float, xmm_offset(reg), v);
                }
                Op::LoadXmm(reg) => {
                    vecs.push(b.load_context(16, RegisterClass::Float, xmm_offset(reg)))
                }
                Op::Copy { from, to } => {
                    let v = b.load_context(8, RegisterClass::General, gpr_offset(from));
                    b.store_context(8, RegisterClass::General, gpr_offset(to), v);
                    ints.push(v);
                }
                Op::LoadGprPair(reg) => {
                    vecs.push(b.load_context(16, RegisterClass::Float, gpr_offset(reg)))
                }
                Op::Syscall => {
                    let v = int(&mut b, &mut ints);
                    ints.push(b.syscall(v, v, v));
                }
            }
        }

        let n = blocks.len();
        match *term {
            Term::Jump(t) => {
                b.jump(blocks[t % n]);
            }
            Term::Branch(t, f) => {
                let cond = int(&mut b, &mut ints);
                b.cond_jump(cond, blocks[t % n], blocks[f % n]);
            }
            Term::Exit => {
                let rip = int(&mut b, &mut ints);
                b.exit_function(rip);
            }
        }
        b.end_block(4);
    }
    b.finish()
}

fn assert_no_forward_refs(ir: &IrContainer) {
    for (_, node) in ir.all_code() {
        for arg in ir.op(node).args() {
            assert!(arg < node, "{node} references later {arg}\n{ir}");
        }
    }
}

fn fatal_manager() -> PassManager {
    PassManager::new(PassManagerConfig {
        validation: ValidationMode::Fatal,
        ..PassManagerConfig::default()
    })
}

proptest! {
    #[test]
    fn pass_pipeline_is_idempotent(region in region_strategy()) {
        let mut ir = build(&region);
        prop_assert!(validate(&ir, None).is_ok());

        let pm = fatal_manager();
        let first = pm.run(&mut ir).unwrap();
        assert_no_forward_refs(&ir);
        prop_assume!(first.reached_fixed_point);

        let snapshot = ir.clone();
        let second = pm.run(&mut ir).unwrap();
        prop_assert!(!second.changed);
        prop_assert_eq!(second.rounds, 1);
        prop_assert_eq!(ir, snapshot);
    }

    #[test]
    fn compaction_is_stable(region in region_strategy()) {
        let ir = build(&region);
        assert_no_forward_refs(&ir);

        let once = compact(&ir).unwrap();
        assert_no_forward_refs(&once);
        let twice = compact(&once).unwrap();
        prop_assert_eq!(&twice, &once);
        prop_assert_eq!(once.live_node_count(), ir.live_node_count());
        prop_assert_eq!(once.node_count(), once.live_node_count());
    }

    #[test]
    fn serialized_ir_survives_compaction(region in region_strategy()) {
        let ir = compact(&build(&region)).unwrap();
        let decoded = IrContainer::from_bytes(&ir.to_bytes()).unwrap();
        prop_assert_eq!(decoded.to_string(), ir.to_string());
    }
}

#[test]
fn round_limit_is_reported() {
    let region = vec![
        (vec![Op::Const(1), Op::StoreFlag(0)], Term::Jump(1)),
        (vec![Op::Const(2), Op::StoreFlag(0)], Term::Exit),
    ];
    let mut ir = build(&region);
    let pm = PassManager::new(PassManagerConfig {
        max_rounds: 1,
        validation: ValidationMode::Fatal,
        ..PassManagerConfig::default()
    });
    let report = pm.run(&mut ir).unwrap();
    assert_eq!(report.rounds, 1);
    assert!(report.changed);
    assert!(!report.reached_fixed_point);
}

#[test]
fn reloaded_copy_of_a_reused_load_compiles() {
    // mov rcx, rax; mov rdx, rax; add rdx, rcx
    let region = vec![(
        vec![
            Op::LoadGpr(0),
            Op::Copy { from: 0, to: 1 },
            Op::LoadGpr(1),
            Op::Copy { from: 0, to: 2 },
            Op::Add,
            Op::StoreGpr { reg: 2, wide: true },
        ],
        Term::Exit,
    )];
    let mut ir = build(&region);
    let report = fatal_manager().run(&mut ir).unwrap();
    assert!(report.changed);
    assert_no_forward_refs(&ir);
    assert!(validate(&ir, None).is_ok());

    let loads = ir
        .all_code()
        .filter(|&(_, n)| ir.op(n).opcode() == xlat_ir::Opcode::LoadContext)
        .count();
    assert_eq!(loads, 1, "every reload folds into the first read of rax\n{ir}");
}
