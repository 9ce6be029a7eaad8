//! Error taxonomy for loading, registering, planning and invoking.
//!
//! Every failure is reported to the caller as a value. [`Error::status`]
//! collapses an error into the closed [`Status`] enumeration used by the
//! C ABI.

use crate::registry::OpKind;

/// Malformed, truncated or unsupported model buffer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VerifyError {
    #[error("buffer too small: need {needed} bytes, got {actual}")]
    TooSmall { needed: usize, actual: usize },

    #[error("invalid magic bytes (expected PLTE)")]
    BadMagic,

    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u32),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("inconsistent model: {0}")]
    Inconsistent(String),
}

/// Failures while populating a registry or resolving an operator against it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistrationError {
    #[error("operator {0} has no built-in kernel")]
    Unsupported(OpKind),

    #[error("operator {0} is already registered")]
    Duplicate(String),

    #[error("registry capacity of {capacity} entries exceeded")]
    CapacityExceeded { capacity: usize },

    #[error("custom operator name must not be empty")]
    InvalidName,

    #[error("node {node}: operator {op} is not registered")]
    Unregistered { node: usize, op: String },
}

/// Arena capacity insufficient for the planned layout.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    #[error("arena exhausted: requested {requested} bytes, {available} available")]
    Exhausted { requested: usize, available: usize },

    #[error("cannot reserve an arena of {requested} bytes")]
    OutOfMemory { requested: usize },
}

/// Shape inference or operand validation rejected a node.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ShapeError {
    #[error("node {node} output {tensor}: declared shape {declared:?}, inferred {inferred:?}")]
    Mismatch {
        node: usize,
        tensor: usize,
        declared: Vec<usize>,
        inferred: Vec<usize>,
    },

    #[error("node {node} ({op}): {reason}")]
    Invalid { node: usize, op: String, reason: String },
}

/// A kernel failed while the plan was executing.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutionError {
    #[error("node {node} ({op}): {reason}")]
    Kernel { node: usize, op: String, reason: String },

    #[error("node {node}: tensor slot {slot} is not available")]
    MissingTensor { node: usize, slot: usize },

    #[error("node {node}: overlapping buffers")]
    Aliased { node: usize },
}

/// Top-level error for this crate.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("verification failed: {0}")]
    Verification(#[from] VerifyError),

    #[error("registration failed: {0}")]
    Registration(#[from] RegistrationError),

    #[error("allocation failed: {0}")]
    Allocation(#[from] AllocationError),

    #[error("shape error: {0}")]
    Shape(#[from] ShapeError),

    #[error("execution failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("invalid interpreter state: {0}")]
    InvalidState(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Closed status enumeration shared with C callers.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok = 0,
    VerificationError = 1,
    RegistrationError = 2,
    AllocationError = 3,
    ShapeError = 4,
    ExecutionError = 5,
    InvalidState = 6,
    InvalidArgument = 7,
}

impl Status {
    /// Static, NUL-terminated description.
    pub fn message(&self) -> &'static str {
        match self {
            Status::Ok => "ok\0",
            Status::VerificationError => "model verification failed\0",
            Status::RegistrationError => "operator registration failed\0",
            Status::AllocationError => "arena allocation failed\0",
            Status::ShapeError => "shape inference failed\0",
            Status::ExecutionError => "kernel execution failed\0",
            Status::InvalidState => "invalid interpreter state\0",
            Status::InvalidArgument => "invalid argument\0",
        }
    }
}

impl Error {
    pub fn status(&self) -> Status {
        match self {
            Error::Verification(_) => Status::VerificationError,
            Error::Registration(_) => Status::RegistrationError,
            Error::Allocation(_) => Status::AllocationError,
            Error::Shape(_) => Status::ShapeError,
            Error::Execution(_) => Status::ExecutionError,
            Error::InvalidState(_) => Status::InvalidState,
            Error::InvalidArgument(_) => Status::InvalidArgument,
        }
    }
}

impl From<Result<()>> for Status {
    fn from(r: Result<()>) -> Self {
        match r {
            Ok(()) => Status::Ok,
            Err(e) => e.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let e: Error = AllocationError::Exhausted { requested: 10, available: 4 }.into();
        assert_eq!(e.status(), Status::AllocationError);
        let e: Error = RegistrationError::Unregistered { node: 1, op: "Relu".into() }.into();
        assert_eq!(e.status(), Status::RegistrationError);
        let e: Error = AllocationError::OutOfMemory { requested: usize::MAX }.into();
        assert_eq!(e.status(), Status::AllocationError);
        assert_eq!(Status::from(Ok(())), Status::Ok);
    }

    #[test]
    fn test_messages_nul_terminated() {
        for s in [Status::Ok, Status::ShapeError, Status::InvalidArgument] {
            assert!(s.message().ends_with('\0'));
        }
    }

    #[test]
    fn test_display() {
        let e = ShapeError::Mismatch { node: 2, tensor: 5, declared: vec![1, 4], inferred: vec![1, 3] };
        assert_eq!(e.to_string(), "node 2 output 5: declared shape [1, 4], inferred [1, 3]");
    }
}
