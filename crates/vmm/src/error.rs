use core::fmt;

use crate::AllocError;

/// Errors reported by address-space operations and the fault resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Not enough physical frames to back the request.
    OutOfMemory,
    /// The fault code is not one the resolver understands.
    InvalidArgument,
    /// Fault with no current process or no address space; not retryable.
    HardFault,
    /// The address is outside every region of the address space.
    BadAddress,
    /// The request exceeds what an address space supports.
    Unimplemented,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::OutOfMemory => write!(f, "out of memory"),
            VmError::InvalidArgument => write!(f, "invalid argument"),
            VmError::HardFault => write!(f, "fault outside of any process"),
            VmError::BadAddress => write!(f, "bad address"),
            VmError::Unimplemented => write!(f, "unimplemented"),
        }
    }
}

impl From<AllocError> for VmError {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::OutOfMemory => VmError::OutOfMemory,
        }
    }
}
