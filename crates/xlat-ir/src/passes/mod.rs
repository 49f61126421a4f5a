//! IR-to-IR passes and the fixed-point pass manager.

pub mod compaction;
pub mod context_load_store;
pub mod dead_code;
pub mod dead_store;
pub mod validation;

use crate::container::IrContainer;
use crate::error::{IrError, Result};

/// One stage of the optimization pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassKind {
    /// Block-local store→load forwarding and redundant context access removal.
    ContextLoadStoreElimination,
    /// Cross-block dead flag/register store removal.
    DeadStoreElimination,
    /// Removal of unused, side-effect free values.
    DeadCodeElimination,
    /// Rebuild into dense arenas.
    Compaction,
    /// Structural checks; never changes the IR.
    Validation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Skip validation entirely.
    Off,
    /// Log violations and keep going.
    Report,
    /// Fail the pipeline on the first violating round.
    Fatal,
}

impl Default for ValidationMode {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            ValidationMode::Fatal
        } else {
            ValidationMode::Off
        }
    }
}

#[derive(Debug, Clone)]
pub struct PassManagerConfig {
    /// Upper bound on full pipeline repetitions.
    pub max_rounds: u32,
    pub validation: ValidationMode,
    pub passes: Vec<PassKind>,
}

impl Default for PassManagerConfig {
    fn default() -> Self {
        Self {
            max_rounds: 8,
            validation: ValidationMode::default(),
            passes: vec![
                PassKind::ContextLoadStoreElimination,
                PassKind::DeadStoreElimination,
                PassKind::DeadCodeElimination,
                PassKind::Compaction,
                PassKind::Validation,
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    pub rounds: u32,
    /// Whether any pass changed the IR.
    pub changed: bool,
    /// `false` when the round limit stopped the pipeline while passes still reported changes.
    pub reached_fixed_point: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PassManager {
    config: PassManagerConfig,
}

impl PassManager {
    pub fn new(config: PassManagerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PassManagerConfig {
        &self.config
    }

    /// Runs the pipeline until no pass reports a change, or the round limit is reached.
    pub fn run(&self, ir: &mut IrContainer) -> Result<PassReport> {
        let mut report = PassReport {
            rounds: 0,
            changed: false,
            reached_fixed_point: false,
        };

        while report.rounds < self.config.max_rounds {
            report.rounds += 1;
            let mut round_changed = false;
            for &pass in &self.config.passes {
                let changed = self.run_pass(pass, ir)?;
                if changed {
                    tracing::trace!(?pass, round = report.rounds, "pass changed IR");
                }
                round_changed |= changed;
            }
            report.changed |= round_changed;
            if !round_changed {
                report.reached_fixed_point = true;
                break;
            }
        }

        if !report.reached_fixed_point {
            tracing::debug!(
                rounds = report.rounds,
                "pass pipeline stopped at round limit before reaching a fixed point"
            );
        }
        Ok(report)
    }

    fn run_pass(&self, pass: PassKind, ir: &mut IrContainer) -> Result<bool> {
        match pass {
            PassKind::ContextLoadStoreElimination => context_load_store::run(ir),
            PassKind::DeadStoreElimination => dead_store::run(ir),
            PassKind::DeadCodeElimination => dead_code::run(ir),
            PassKind::Compaction => compaction::run(ir),
            PassKind::Validation => {
                self.validate(ir)?;
                Ok(false)
            }
        }
    }

    fn validate(&self, ir: &IrContainer) -> Result<()> {
        if self.config.validation == ValidationMode::Off {
            return Ok(());
        }
        let report = validation::validate(ir, None);
        for warning in &report.warnings {
            tracing::trace!("IR validation warning: {warning}");
        }
        if report.is_ok() {
            return Ok(());
        }
        tracing::error!("IR validation failed:\n{report}\n{ir}");
        match self.config.validation {
            ValidationMode::Fatal => Err(IrError::Validation(report)),
            _ => Ok(()),
        }
    }
}
