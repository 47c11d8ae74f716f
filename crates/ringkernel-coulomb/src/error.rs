//! Error types for accelerator-side Coulomb evaluation.

use thiserror::Error;

/// Errors surfaced by buffers, kernel launches and the driver.
///
/// Every variant corresponds to a failure the accelerator API can report;
/// none of them alter the atomic accumulation protocol of the kernels.
#[derive(Debug, Error)]
pub enum CoulombError {
    /// Device allocation could not be satisfied.
    #[error("Allocation failed: requested {requested} bytes, {available} bytes available")]
    AllocationFailed {
        /// Requested size in bytes, saturated at `usize::MAX` on overflow.
        requested: usize,
        /// Bytes still available on the device.
        available: usize,
    },

    /// Host-side staging memory could not be allocated.
    #[error("Host allocation failed: requested {requested} bytes")]
    HostAllocationFailed {
        /// Requested size in bytes, saturated at `usize::MAX` on overflow.
        requested: usize,
    },

    /// Host/device copy failed.
    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    /// Kernel launch was rejected.
    #[error("Launch failed: {0}")]
    LaunchFailed(String),

    /// Synchronization reported an execution fault.
    #[error("Synchronization failed: {0}")]
    SyncFailed(String),

    /// Invalid configuration or inconsistent inputs.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The requested backend is not compiled in or has no device.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),
}

/// Result type for Coulomb operations.
pub type Result<T> = std::result::Result<T, CoulombError>;
