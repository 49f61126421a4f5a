//! Persistent, memory-mapped cache of optimized IR and register allocation results.
//!
//! One file per guest module. See [`format`] for the on-disk layout.

mod cache;
pub mod error;
pub mod format;
mod queue;
mod reader;
mod writer;

pub use cache::{
    file_id, merge, merge_module, AotCache, AotConfig, FileIdFlags, FlatMemory, GuestMemory,
    AOT_EXTENSION,
};
pub use error::{AotError, Result};
pub use format::{Record, AOT_MAGIC};
pub use queue::{WriteQueue, DEFAULT_FLUSH_THRESHOLD};
pub use reader::{AotEntry, AotModule};
pub use writer::AotFileWriter;
