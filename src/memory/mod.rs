//! Memory model: allocations, their byte contents, and the copy-on-write address space that
//! binds them together.

pub mod address_space;
pub mod manager;
pub mod object;
pub mod object_state;
pub mod predicate;

pub use address_space::{
    AddressSpace, GepBase, HostBuffer, HostMemory, ObjectPair, ResolutionList,
};
pub use manager::{AllocationRequest, MemoryManager};
pub use object::{AllocSite, LocationInfo, MemoryObject, ObjectFlags, ObjectId};
pub use object_state::ObjectState;
pub use predicate::ObjectPredicate;
