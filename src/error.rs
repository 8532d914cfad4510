use thiserror::Error;

pub type Result<T> = std::result::Result<T, SpaceError>;

#[derive(Debug, Error)]
pub enum SpaceError {
    #[error("solver error: {0}")]
    Solver(#[from] SolverError),
    #[error("contract violation: {0}")]
    Contract(#[from] ContractViolation),
    #[error("invalid configuration: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SolverError {
    #[error("solver query timed out")]
    Timeout,
    #[error("solver returned unknown: {0}")]
    Unknown(String),
    #[error("solver backend failure: {0}")]
    Backend(String),
    #[error("constraints are unsatisfiable while computing {0}")]
    Unsatisfiable(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContractViolation {
    #[error("object {object} state is owned by epoch {owner}, cannot bind into epoch {epoch}")]
    AlreadyOwned { object: u64, owner: u64, epoch: u64 },
    #[error("object {0} is read-only")]
    ReadOnly(u64),
    #[error("object {0} is not bound in this address space")]
    NotBound(u64),
    #[error("state for object {state} cannot be bound to object {object}")]
    ObjectMismatch { object: u64, state: u64 },
    #[error("offset {offset} out of range for object {object} of {size} bytes")]
    OffsetOutOfRange { object: u64, offset: u64, size: u64 },
    #[error("symcrete array `{0}` is already bound")]
    SymcreteAlreadyBound(String),
    #[error("symcrete array `{array}` declares {declared} bytes, binding has {actual}")]
    SymcreteLengthMismatch {
        array: String,
        declared: u64,
        actual: usize,
    },
    #[error("array `{0}` is not a symbolic source")]
    NotSymbolicArray(String),
    #[error("array `{0}` is not a registered size symcrete")]
    UnknownSizeSymcrete(String),
    #[error("size symcrete `{0}` has no concrete binding")]
    SizeNotConcretized(String),
    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(u64),
    #[error("allocation of {size} bytes exhausts the address range ending at {limit:#x}")]
    AddressSpaceExhausted { size: u64, limit: u64 },
    #[error("object of {size} bytes exceeds the {limit}-byte object size limit")]
    ObjectTooLarge { size: u64, limit: u64 },
    #[error("no stack frame to pop")]
    EmptyStack,
}
