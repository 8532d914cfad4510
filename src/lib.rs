//! Symbolic memory for a symbolic executor.
//!
//! A copy-on-write address space that resolves symbolic pointers to the objects they may
//! reference, per-state bookkeeping for symcretes (symbolic sizes and addresses pinned to
//! concrete values), and the repair engine that re-concretizes stale size bindings when a
//! proof only held because of them.

pub mod error;
pub mod expr;
pub mod memory;
pub mod solver;
pub mod state;
pub mod utils;

pub use error::{ContractViolation, Result, SolverError, SpaceError};
pub use expr::{ArrayId, ArraySource, Assignment, ConstraintSet, Expr};
pub use memory::{AddressSpace, MemoryManager, MemoryObject, ObjectState};
pub use solver::{Solver, TimingSolver, Z3Solver};
pub use state::ExecutionState;
pub use utils::config::SpaceConfig;
