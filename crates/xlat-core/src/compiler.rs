//! Guest address → host code.
//!
//! [`Compiler::translate`] runs: AOT lookup, front end, pass manager, register allocation (with
//! the configured [`RaFailurePolicy`] on failure) and code generation. Installing the result is
//! the engine's job.

use std::sync::Arc;

use xlat_aot::{AotCache, GuestMemory};
use xlat_ir::{IrContainer, PassManager};
use xlat_regalloc::{AllocationOutcome, ConflictTable, RegisterAllocationData, RegisterAllocator};

use crate::config::{EngineConfig, RaFailurePolicy};
use crate::error::CompileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildOptions {
    /// Follow branches and build a multi-block region.
    pub multiblock: bool,
    /// Emit IR that keeps fewer values live at once, at the cost of more context traffic.
    pub reduced_pressure: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrontendOutput {
    pub ir: IrContainer,
    /// Guest bytes covered, starting at the entry address.
    pub guest_len: u64,
    /// `(start, len)` ranges of guest memory the region was decoded from.
    pub code_ranges: Vec<(u64, u64)>,
}

/// Decodes guest code into IR.
pub trait Frontend: Send + Sync {
    fn build(&self, guest: u64, options: BuildOptions) -> Result<FrontendOutput, CompileError>;

    /// Guest memory the front end decodes from. Used to hash code for the AOT cache.
    fn memory(&self) -> &dyn GuestMemory;
}

/// Emits host code for allocated IR.
pub trait CodeGenerator: Send + Sync {
    fn emit(
        &self,
        guest: u64,
        ir: &IrContainer,
        ra: &RegisterAllocationData,
        out: &mut Vec<u8>,
    ) -> Result<(), CompileError>;

    /// Emits an entry that hands `ir` to the interpreter instead of running it natively.
    fn emit_interpreter_stub(
        &self,
        guest: u64,
        ir: &IrContainer,
        out: &mut Vec<u8>,
    ) -> Result<(), CompileError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSource {
    Frontend,
    Aot,
    /// The block did not fit the register file and runs through the interpreter.
    Interpreter,
}

/// Everything needed to install and persist one translated region.
#[derive(Debug)]
pub struct Translation {
    pub guest_start: u64,
    pub guest_len: u64,
    pub code_ranges: Vec<(u64, u64)>,
    pub code: Vec<u8>,
    pub source: BlockSource,
    pub pass_rounds: u32,
    /// Present when the block can be written to the AOT cache.
    pub persist: Option<(IrContainer, RegisterAllocationData)>,
}

pub struct Compiler {
    frontend: Arc<dyn Frontend>,
    codegen: Arc<dyn CodeGenerator>,
    passes: PassManager,
    allocator: RegisterAllocator,
    policy: RaFailurePolicy,
    multiblock: bool,
    aot: Option<Arc<AotCache>>,
}

impl std::fmt::Debug for Compiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compiler")
            .field("policy", &self.policy)
            .field("multiblock", &self.multiblock)
            .field("aot", &self.aot.is_some())
            .finish_non_exhaustive()
    }
}

impl Compiler {
    pub fn new(
        config: &EngineConfig,
        frontend: Arc<dyn Frontend>,
        codegen: Arc<dyn CodeGenerator>,
        aot: Option<Arc<AotCache>>,
    ) -> Self {
        Self {
            frontend,
            codegen,
            passes: PassManager::new(config.passes.clone()),
            allocator: RegisterAllocator::new(
                config.registers,
                ConflictTable::pair_aliasing(&config.registers),
            ),
            policy: config.ra_failure_policy,
            multiblock: config.multiblock,
            aot,
        }
    }

    pub fn frontend(&self) -> &Arc<dyn Frontend> {
        &self.frontend
    }

    pub fn aot(&self) -> Option<&Arc<AotCache>> {
        self.aot.as_ref()
    }

    pub fn translate(&self, guest: u64) -> Result<Translation, CompileError> {
        if let Some(translation) = self.translate_from_aot(guest)? {
            return Ok(translation);
        }

        let options = BuildOptions {
            multiblock: self.multiblock,
            reduced_pressure: false,
        };
        let (built, rounds) = self.build(guest, options)?;
        let outcome = self.allocator.allocate(&built.ir);
        match outcome {
            AllocationOutcome::Allocated(ra) => self.emit(guest, built, ra, rounds),
            AllocationOutcome::PinnedUnavailable { node, register } => {
                tracing::warn!(guest, node = node.0, %register, "fixed register unavailable");
                Err(CompileError::PinnedRegister { addr: guest })
            }
            AllocationOutcome::CapacityExceeded {
                class,
                pressure,
                inventory,
            } => {
                let failure = CompileError::RegisterAllocation {
                    addr: guest,
                    class,
                    pressure,
                    inventory,
                };
                self.recover_from_pressure(guest, built, rounds, failure)
            }
        }
    }

    fn build(&self, guest: u64, options: BuildOptions) -> Result<(FrontendOutput, u32), CompileError> {
        let mut built = self.frontend.build(guest, options)?;
        let report = self
            .passes
            .run(&mut built.ir)
            .map_err(|source| CompileError::Internal { addr: guest, source })?;
        if !report.reached_fixed_point {
            tracing::debug!(guest, rounds = report.rounds, "pass pipeline hit its round limit");
        }
        Ok((built, report.rounds))
    }

    fn recover_from_pressure(
        &self,
        guest: u64,
        built: FrontendOutput,
        rounds: u32,
        failure: CompileError,
    ) -> Result<Translation, CompileError> {
        match self.policy {
            RaFailurePolicy::Abort => Err(failure),
            RaFailurePolicy::Interpret => {
                tracing::warn!(guest, %failure, "falling back to the interpreter");
                let mut code = Vec::new();
                self.codegen
                    .emit_interpreter_stub(guest, &built.ir, &mut code)?;
                Ok(Translation {
                    guest_start: guest,
                    guest_len: built.guest_len,
                    code_ranges: built.code_ranges,
                    code,
                    source: BlockSource::Interpreter,
                    pass_rounds: rounds,
                    persist: None,
                })
            }
            RaFailurePolicy::RecompileWithSpills => {
                tracing::warn!(guest, %failure, "rebuilding in reduced pressure mode");
                let options = BuildOptions {
                    multiblock: self.multiblock,
                    reduced_pressure: true,
                };
                let (rebuilt, rounds) = self.build(guest, options)?;
                match self.allocator.allocate(&rebuilt.ir) {
                    AllocationOutcome::Allocated(ra) => self.emit(guest, rebuilt, ra, rounds),
                    AllocationOutcome::CapacityExceeded {
                        class,
                        pressure,
                        inventory,
                    } => Err(CompileError::RegisterAllocation {
                        addr: guest,
                        class,
                        pressure,
                        inventory,
                    }),
                    AllocationOutcome::PinnedUnavailable { .. } => {
                        Err(CompileError::PinnedRegister { addr: guest })
                    }
                }
            }
        }
    }

    fn emit(
        &self,
        guest: u64,
        built: FrontendOutput,
        ra: RegisterAllocationData,
        rounds: u32,
    ) -> Result<Translation, CompileError> {
        let mut code = Vec::new();
        self.codegen.emit(guest, &built.ir, &ra, &mut code)?;
        tracing::debug!(
            guest,
            guest_len = built.guest_len,
            host_len = code.len(),
            nodes = built.ir.live_node_count(),
            rounds,
            "compiled block"
        );
        Ok(Translation {
            guest_start: guest,
            guest_len: built.guest_len,
            code_ranges: built.code_ranges,
            code,
            source: BlockSource::Frontend,
            pass_rounds: rounds,
            persist: Some((built.ir, ra)),
        })
    }

    fn translate_from_aot(&self, guest: u64) -> Result<Option<Translation>, CompileError> {
        let Some(aot) = &self.aot else {
            return Ok(None);
        };
        if !aot.config().load {
            return Ok(None);
        }
        let Some(entry) = aot.lookup(guest, self.frontend.memory()) else {
            return Ok(None);
        };
        let mut code = Vec::new();
        self.codegen.emit(guest, &entry.ir, &entry.ra_data, &mut code)?;
        tracing::debug!(guest, guest_len = entry.guest_len, "compiled block from AOT cache");
        Ok(Some(Translation {
            guest_start: guest,
            guest_len: entry.guest_len,
            code_ranges: vec![(guest, entry.guest_len)],
            code,
            source: BlockSource::Aot,
            pass_rounds: 0,
            persist: None,
        }))
    }

    /// Queues `translation` for the AOT cache if it came from the front end.
    pub fn persist(&self, translation: &Translation) -> bool {
        let (Some(aot), Some((ir, ra))) = (&self.aot, &translation.persist) else {
            return false;
        };
        aot.store(
            translation.guest_start,
            translation.guest_len,
            self.frontend.memory(),
            ir,
            ra,
        )
    }
}
