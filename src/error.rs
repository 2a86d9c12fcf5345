use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GCError {
    #[error("Collector is not initialized")]
    NotInitialized,

    #[error("Collector is already initialized")]
    AlreadyInitialized,

    #[error("Collector has been shut down")]
    ShutDown,

    #[error("Invalid allocation layout for a payload of {0} bytes")]
    InvalidLayout(usize),

    #[error("Memory allocation failed for a payload of {0} bytes")]
    AllocationFailed(usize),

    #[error("Internal error: {0}")]
    Internal(String),
}

