use std::path::PathBuf;

use xlat_aot::AotConfig;
use xlat_ir::PassManagerConfig;
use xlat_regalloc::RegisterInventory;

/// What to do when a block needs more registers than the host has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RaFailurePolicy {
    /// Fail the compilation; the dispatcher reports the address as uncompilable.
    Abort,
    /// Install an entry that runs the block through the interpreter.
    #[default]
    Interpret,
    /// Rebuild the block in the front end's reduced-pressure mode and allocate again. A second
    /// failure aborts.
    RecompileWithSpills,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub ra_failure_policy: RaFailurePolicy,
    /// Check for pause requests after every block instead of relying on the pause signal.
    pub single_step: bool,
    /// Let the front end follow branches into multi-block regions.
    pub multiblock: bool,

    pub aot_load: bool,
    pub aot_store: bool,
    pub aot_dir: Option<PathBuf>,

    /// Size of each executable mapping that blocks are bump-allocated from.
    pub code_buffer_size: usize,
    /// Per-thread direct-mapped cache entries. Must be a power of two.
    pub l1_entries: usize,
    /// Guest addresses below `1 << l2_address_bits` get page-table lookups; the rest only use
    /// the block map.
    pub l2_address_bits: u32,

    pub passes: PassManagerConfig,
    pub registers: RegisterInventory,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ra_failure_policy: RaFailurePolicy::default(),
            single_step: false,
            multiblock: true,
            aot_load: false,
            aot_store: false,
            aot_dir: None,
            code_buffer_size: 16 * 1024 * 1024,
            l1_entries: 1024,
            l2_address_bits: 32,
            passes: PassManagerConfig::default(),
            registers: RegisterInventory::default(),
        }
    }
}

impl EngineConfig {
    /// The AOT cache configuration, if any AOT use is enabled and a directory is set.
    pub fn aot_config(&self) -> Option<AotConfig> {
        if !(self.aot_load || self.aot_store) {
            return None;
        }
        let dir = self.aot_dir.clone()?;
        Some(AotConfig {
            dir,
            load: self.aot_load,
            store: self.aot_store,
            ..AotConfig::default()
        })
    }
}
