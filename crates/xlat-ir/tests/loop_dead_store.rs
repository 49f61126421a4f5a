use xlat_ir::context::gpr_offset;
use xlat_ir::passes::dead_store;
use xlat_ir::{
    IrBuilder, IrContainer, NodeId, Opcode, PassManager, PassManagerConfig, RegisterClass,
    ValidationMode,
};

const FLAG: u32 = 2;

/// entry -> body -> (body | exit), with `body` writing `FLAG` and `exit` either overwriting it or
/// reading it first.
fn tight_loop(exit_reads_flag: bool) -> IrContainer {
    let mut b = IrBuilder::new(0x1000);
    let body = b.create_block();
    let exit = b.create_block();

    b.jump(body);
    b.end_block(2);

    b.set_current_block(body);
    let one = b.constant(1, 1);
    b.store_flag(FLAG, one);
    let counter = b.load_context(8, RegisterClass::General, gpr_offset(1));
    b.cond_jump(counter, body, exit);
    b.end_block(6);

    b.set_current_block(exit);
    let rip = if exit_reads_flag {
        b.load_flag(FLAG)
    } else {
        b.constant(8, 0x1010)
    };
    let zero = b.constant(1, 0);
    b.store_flag(FLAG, zero);
    b.exit_function(rip);
    b.end_block(3);

    b.finish()
}

fn flag_stores(ir: &IrContainer, block: NodeId) -> usize {
    ir.code(block)
        .filter(|&n| ir.op(n).opcode() == Opcode::StoreFlag)
        .count()
}

fn body_and_exit(ir: &IrContainer) -> (NodeId, NodeId) {
    let blocks: Vec<NodeId> = ir.blocks().collect();
    (blocks[1], blocks[2])
}

#[test]
fn loop_flag_write_overwritten_on_every_path_is_removed() {
    let mut ir = tight_loop(false);
    assert!(dead_store::run(&mut ir).unwrap());

    let (body, exit) = body_and_exit(&ir);
    assert_eq!(flag_stores(&ir, body), 0);
    assert_eq!(flag_stores(&ir, exit), 1, "exit has no successor to kill its write");
}

#[test]
fn loop_flag_write_read_by_exit_is_kept() {
    let mut ir = tight_loop(true);
    assert!(!dead_store::run(&mut ir).unwrap());

    let (body, exit) = body_and_exit(&ir);
    assert_eq!(flag_stores(&ir, body), 1);
    assert_eq!(flag_stores(&ir, exit), 1);
}

#[test]
fn full_pipeline_agrees_on_the_loop() {
    let pm = PassManager::new(PassManagerConfig {
        validation: ValidationMode::Fatal,
        ..PassManagerConfig::default()
    });

    let mut dead = tight_loop(false);
    pm.run(&mut dead).unwrap();
    let (body, _) = body_and_exit(&dead);
    assert_eq!(flag_stores(&dead, body), 0);
    assert!(
        !dead
            .code(body)
            .any(|n| dead.op(n).opcode() == Opcode::Constant),
        "the stored constant dies with its store:\n{dead}"
    );

    let mut live = tight_loop(true);
    pm.run(&mut live).unwrap();
    let (body, _) = body_and_exit(&live);
    assert_eq!(flag_stores(&live, body), 1);
}
