//! Kernel-specific error types.

use holonet_types::error::{HolonetError, RegistryError};
use holonet_wire::WireError;
use thiserror::Error;

/// Kernel error type wrapping HolonetError with kernel-specific context.
#[derive(Error, Debug)]
pub enum KernelError {
    /// A wrapped HolonetError.
    #[error(transparent)]
    Holonet(#[from] HolonetError),

    /// A wire layer failure.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// A handler module refused to start.
    #[error("Module '{module}' failed to start: {reason}")]
    ModuleStart { module: String, reason: String },
}

impl From<RegistryError> for KernelError {
    fn from(e: RegistryError) -> Self {
        Self::Holonet(HolonetError::Registry(e))
    }
}

/// Alias for kernel results.
pub type KernelResult<T> = Result<T, KernelError>;
