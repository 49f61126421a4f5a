//! Translation and execution engine.
//!
//! An [`Engine`] holds what every guest thread shares: the [`LookupCache`], executable memory
//! ([`CodeCache`]), the [`Compiler`] pipeline, and the optional AOT cache. Each guest thread runs
//! a [`Dispatcher`], which owns that thread's [`ThreadState`] and its private L1 cache.
//!
//! Guest decode and host code emission are supplied by the embedder through the [`Frontend`]
//! and [`CodeGenerator`] traits.

pub mod code_buffer;
pub mod compiler;
pub mod config;
pub mod dispatcher;
pub mod engine;
#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
pub mod entry;
pub mod error;
pub mod lookup_cache;
pub mod signal;
pub mod thread_state;
pub mod unwind;

pub use code_buffer::{CodeBuffer, CodeCache};
pub use compiler::{
    BlockSource, BuildOptions, CodeGenerator, Compiler, Frontend, FrontendOutput, Translation,
};
pub use config::{EngineConfig, RaFailurePolicy};
pub use dispatcher::{BlockExit, Dispatcher, Executor, ExitReason, NativeExecutor, StepOutcome};
pub use engine::Engine;
pub use error::{CodeBufferError, CompileError, SignalError};
pub use lookup_cache::{L1Cache, LookupCache, GUEST_PAGE_SIZE};
pub use thread_state::ThreadState;
pub use unwind::{HostAbi, HostUnwindRegistry, NullUnwindRegistry, UnwindRegistry};
