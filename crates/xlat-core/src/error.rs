use std::io;

use thiserror::Error;
use xlat_ir::{IrError, RegisterClass};

/// Why a guest address could not be turned into host code.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("front end failed to decode guest code at {addr:#x}: {reason}")]
    Frontend { addr: u64, reason: String },

    #[error("register allocation failed at {addr:#x}: {class:?} pressure {pressure} exceeds {inventory}")]
    RegisterAllocation {
        addr: u64,
        class: RegisterClass,
        pressure: u32,
        inventory: u32,
    },

    #[error("register allocation failed at {addr:#x}: a fixed register was unavailable")]
    PinnedRegister { addr: u64 },

    #[error("internal IR error at {addr:#x}: {source}")]
    Internal {
        addr: u64,
        #[source]
        source: IrError,
    },

    #[error("code generation failed at {addr:#x}: {reason}")]
    Codegen { addr: u64, reason: String },

    #[error(transparent)]
    CodeBuffer(#[from] CodeBufferError),
}

impl CompileError {
    pub fn addr(&self) -> Option<u64> {
        match *self {
            CompileError::Frontend { addr, .. }
            | CompileError::RegisterAllocation { addr, .. }
            | CompileError::PinnedRegister { addr }
            | CompileError::Internal { addr, .. }
            | CompileError::Codegen { addr, .. } => Some(addr),
            CompileError::CodeBuffer(_) => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CodeBufferError {
    #[error("failed to map {size} byte code buffer: {source}")]
    Map {
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to change code buffer protection: {0}")]
    Protect(#[source] io::Error),

    #[error("{requested} byte block does not fit in a {capacity} byte code buffer")]
    BlockTooLarge { requested: usize, capacity: usize },
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("sigaction({signal}) failed: {source}")]
    Install {
        signal: i32,
        #[source]
        source: io::Error,
    },

    #[error("pthread_kill failed: {0}")]
    Deliver(#[source] io::Error),
}
