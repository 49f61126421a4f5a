//! `xlat-ir` is the intermediate representation of the translator.
//!
//! - [`container`]: arena storage of nodes and op payloads, plus the read/mutation API.
//! - [`builder`]: typed emission of blocks and ops for front-ends.
//! - [`passes`]: context load/store forwarding, dead store and dead code elimination,
//!   compaction and validation, driven to a fixed point by [`passes::PassManager`].
//! - [`context`]: the guest register file layout that context offsets refer to.
//!
//! Containers serialize to a flat little-endian byte image (see [`IrContainer::to_bytes`]) which
//! the AOT cache stores verbatim.

pub mod builder;
pub mod container;
pub mod context;
mod dump;
pub mod error;
pub mod node;
pub mod passes;
mod serialize;

pub use builder::IrBuilder;
pub use container::{BlockInfo, Header, IrContainer, IrView, OpRef, LIST_NODE_STRIDE};
pub use context::GuestCpuState;
pub use error::{IrError, Result};
pub use node::{CondCode, NodeId, OpFlags, OpInfo, Opcode, RegisterClass};
pub use passes::validation::{AllocationView, ValidationReport};
pub use passes::{PassKind, PassManager, PassManagerConfig, PassReport, ValidationMode};
