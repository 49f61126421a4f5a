//! Register allocation for `xlat-ir` regions.
//!
//! [`RegisterAllocator::allocate`] either assigns every value a physical register or reports that
//! the region does not fit the declared [`RegisterInventory`]. It never spills; the caller decides
//! how to recover (see the failure policy of the compiler pipeline).

mod allocator;
mod data;
pub mod error;
mod inventory;
mod liveness;
mod validate;

pub use allocator::{AllocationOutcome, RegisterAllocator, BLOCK_LOCAL_INTERFERENCE_THRESHOLD};
pub use data::RegisterAllocationData;
pub use error::{RaDataError, Result};
pub use inventory::{ConflictTable, PhysicalRegister, RegisterInventory};
pub use validate::{holders, validate_allocation};
