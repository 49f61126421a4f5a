#![allow(dead_code)]

//! A toy guest ISA for driving the engine end to end.
//!
//! Instructions, one per block:
//! - `0x01 <target:u64>` jumps to `target`.
//! - `0x02` exits the thread.
//! - `0x03 <next:u64>` sums 24 constants into guest RAX, then continues at `next`. Built
//!   naively, every constant is live at once and the block does not fit 16 registers.
//!
//! Anything else fails to decode.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use xlat_aot::GuestMemory;
use xlat_core::{
    BlockExit, BuildOptions, CodeGenerator, CompileError, EngineConfig, Executor, Frontend,
    FrontendOutput, ThreadState,
};
use xlat_ir::context::gpr_offset;
use xlat_ir::{IrBuilder, IrContainer, Opcode, RegisterClass};
use xlat_regalloc::RegisterAllocationData;

pub const BASE: u64 = 0x1000;
pub const OP_JUMP: u8 = 0x01;
pub const OP_EXIT: u8 = 0x02;
pub const OP_HEAVY: u8 = 0x03;
pub const HEAVY_VALUES: u64 = 24;

#[derive(Debug, Default)]
pub struct Assembler {
    bytes: Vec<u8>,
}

impl Assembler {
    pub fn at(&self) -> u64 {
        BASE + self.bytes.len() as u64
    }

    pub fn pad_to(&mut self, addr: u64) -> &mut Self {
        self.bytes.resize((addr - BASE) as usize, 0xcc);
        self
    }

    pub fn jump(&mut self, target: u64) -> &mut Self {
        self.bytes.push(OP_JUMP);
        self.bytes.extend_from_slice(&target.to_le_bytes());
        self
    }

    pub fn heavy(&mut self, next: u64) -> &mut Self {
        self.bytes.push(OP_HEAVY);
        self.bytes.extend_from_slice(&next.to_le_bytes());
        self
    }

    pub fn exit(&mut self) -> &mut Self {
        self.bytes.push(OP_EXIT);
        self
    }

    pub fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    pub fn finish(&self) -> Vec<u8> {
        self.bytes.clone()
    }
}

/// `0x1000: jump 0x1010; 0x1010: heavy -> 0x1020; 0x1020: jump 0x1030; 0x1030: exit;
/// 0x1040: <garbage>`
pub fn sample_program() -> Vec<u8> {
    let mut asm = Assembler::default();
    asm.jump(0x1010)
        .pad_to(0x1010)
        .heavy(0x1020)
        .pad_to(0x1020)
        .jump(0x1030)
        .pad_to(0x1030)
        .exit()
        .pad_to(0x1040)
        .bytes(&[0xff]);
    asm.finish()
}

#[derive(Debug)]
pub struct Image {
    pub bytes: Vec<u8>,
}

impl GuestMemory for Image {
    fn read(&self, addr: u64, len: usize) -> Option<&[u8]> {
        let start = usize::try_from(addr.checked_sub(BASE)?).ok()?;
        self.bytes.get(start..start.checked_add(len)?)
    }
}

#[derive(Debug)]
pub struct ToyFrontend {
    pub image: Image,
    pub builds: AtomicUsize,
    pub reduced_builds: AtomicUsize,
}

impl ToyFrontend {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            image: Image { bytes },
            builds: AtomicUsize::new(0),
            reduced_builds: AtomicUsize::new(0),
        }
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    fn read_u64(&self, addr: u64) -> Option<u64> {
        let bytes = self.image.read(addr, 8)?;
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }
}

fn decode_error(addr: u64, reason: &str) -> CompileError {
    CompileError::Frontend {
        addr,
        reason: reason.to_owned(),
    }
}

impl Frontend for ToyFrontend {
    fn build(&self, guest: u64, options: BuildOptions) -> Result<FrontendOutput, CompileError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if options.reduced_pressure {
            self.reduced_builds.fetch_add(1, Ordering::SeqCst);
        }
        let op = *self
            .image
            .read(guest, 1)
            .and_then(|b| b.first())
            .ok_or_else(|| decode_error(guest, "outside guest memory"))?;

        let mut b = IrBuilder::new(guest);
        let len = match op {
            OP_JUMP => {
                let target = self
                    .read_u64(guest + 1)
                    .ok_or_else(|| decode_error(guest, "truncated jump"))?;
                let target = b.constant(8, target);
                b.exit_function(target);
                9
            }
            OP_EXIT => {
                b.break_(0);
                1
            }
            OP_HEAVY => {
                let next = self
                    .read_u64(guest + 1)
                    .ok_or_else(|| decode_error(guest, "truncated heavy"))?;
                let sum = if options.reduced_pressure {
                    let mut acc = b.constant(8, 0);
                    for i in 1..=HEAVY_VALUES {
                        let v = b.constant(8, i);
                        acc = b.add(8, acc, v);
                    }
                    acc
                } else {
                    let values: Vec<_> = (0..=HEAVY_VALUES).map(|i| b.constant(8, i)).collect();
                    let mut acc = values[0];
                    for &v in &values[1..] {
                        acc = b.add(8, acc, v);
                    }
                    acc
                };
                b.store_context(8, RegisterClass::General, gpr_offset(0), sum);
                let next = b.constant(8, next);
                b.exit_function(next);
                9
            }
            _ => return Err(decode_error(guest, "unknown opcode")),
        };
        b.end_block(len);
        Ok(FrontendOutput {
            ir: b.finish(),
            guest_len: len,
            code_ranges: vec![(guest, len)],
        })
    }

    fn memory(&self) -> &dyn GuestMemory {
        &self.image
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Jump(u64),
    Halt,
}

/// How the block leaves, read off its IR.
pub fn block_exit(ir: &IrContainer) -> Exit {
    for (_, node) in ir.all_code() {
        let op = ir.op(node);
        match op.opcode() {
            Opcode::ExitFunction => return Exit::Jump(ir.op(op.arg(0)).imm(0)),
            Opcode::Break => return Exit::Halt,
            _ => {}
        }
    }
    Exit::Halt
}

pub const KIND_NATIVE: u8 = 0;
pub const KIND_HALT: u8 = 1;
pub const KIND_INTERPRETED: u8 = 2;

/// Emits a 16 byte descriptor `[kind, 0 x 7, next_rip:u64]` that [`DescriptorExecutor`] runs.
#[derive(Debug, Default)]
pub struct DescriptorCodegen {
    pub emitted: AtomicUsize,
    pub stubs: AtomicUsize,
}

fn descriptor(kind: u8, exit: Exit, out: &mut Vec<u8>) {
    let (kind, next) = match exit {
        Exit::Jump(next) => (kind, next),
        Exit::Halt => (KIND_HALT, 0),
    };
    out.push(kind);
    out.extend_from_slice(&[0; 7]);
    out.extend_from_slice(&next.to_le_bytes());
}

impl CodeGenerator for DescriptorCodegen {
    fn emit(
        &self,
        _guest: u64,
        ir: &IrContainer,
        _ra: &RegisterAllocationData,
        out: &mut Vec<u8>,
    ) -> Result<(), CompileError> {
        self.emitted.fetch_add(1, Ordering::SeqCst);
        descriptor(KIND_NATIVE, block_exit(ir), out);
        Ok(())
    }

    fn emit_interpreter_stub(
        &self,
        _guest: u64,
        ir: &IrContainer,
        out: &mut Vec<u8>,
    ) -> Result<(), CompileError> {
        self.stubs.fetch_add(1, Ordering::SeqCst);
        descriptor(KIND_INTERPRETED, block_exit(ir), out);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct DescriptorExecutor {
    pub executed: AtomicUsize,
    pub interpreted: AtomicUsize,
}

impl Executor for DescriptorExecutor {
    fn execute(&self, host: usize, thread: NonNull<ThreadState>) -> BlockExit {
        // SAFETY: the code cache holds a 16 byte descriptor at `host`.
        let code = unsafe { std::slice::from_raw_parts(host as *const u8, 16) };
        self.executed.fetch_add(1, Ordering::SeqCst);
        match code[0] {
            KIND_HALT => BlockExit::Exit,
            kind => {
                if kind == KIND_INTERPRETED {
                    self.interpreted.fetch_add(1, Ordering::SeqCst);
                }
                let next = u64::from_le_bytes(code[8..16].try_into().unwrap());
                // SAFETY: the dispatcher holds no reference into the state during the call.
                unsafe { (*thread.as_ptr()).cpu.rip = next };
                BlockExit::Continue
            }
        }
    }
}

pub fn small_config() -> EngineConfig {
    EngineConfig {
        code_buffer_size: 64 * 1024,
        l2_address_bits: 20,
        l1_entries: 64,
        ..EngineConfig::default()
    }
}

pub struct Harness {
    pub frontend: Arc<ToyFrontend>,
    pub codegen: Arc<DescriptorCodegen>,
    pub executor: Arc<DescriptorExecutor>,
    pub unwind: Arc<xlat_core::NullUnwindRegistry>,
    pub engine: Arc<xlat_core::Engine>,
}

/// Routes engine logs through the test harness. `RUST_LOG` is not consulted.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

impl Harness {
    pub fn new(config: EngineConfig, program: Vec<u8>) -> Self {
        init_logging();
        let frontend = Arc::new(ToyFrontend::new(program));
        let codegen = Arc::new(DescriptorCodegen::default());
        let executor = Arc::new(DescriptorExecutor::default());
        let unwind = Arc::new(xlat_core::NullUnwindRegistry::default());
        let engine = Arc::new(xlat_core::Engine::new(
            config,
            frontend.clone(),
            codegen.clone(),
            unwind.clone(),
        ));
        Self {
            frontend,
            codegen,
            executor,
            unwind,
            engine,
        }
    }

    pub fn dispatcher(&self) -> xlat_core::Dispatcher {
        let mut d = xlat_core::Dispatcher::new(self.engine.clone(), self.executor.clone());
        d.cpu_mut().rip = BASE;
        d
    }
}
