//! Closed error set for the scheduler-and-worker subsystem.

use std::fmt;

/// Every failure the core can produce. Backend/tensor-broker collaborators
/// return their own opaque errors at the trait boundary; this crate only
/// ever maps them into one of these six kinds.
#[derive(Debug, thiserror::Error)]
pub enum BandError {
    /// Config or API misuse (bad worker id, malformed config, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Unknown path, id, or key.
    #[error("not found: {0}")]
    NotFound(String),
    /// Platform capability missing (e.g. resource monitor on non-Linux).
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// Invariant breach; indicates a programmer error in this crate.
    #[error("internal invariant violated: {0}")]
    Internal(String),
    /// Retriable backend failure. Never surfaced to the client; triggers
    /// the worker throttling path.
    #[error("device error (retriable): {0}")]
    DeviceError(String),
    /// Non-retriable backend failure. Terminates the job.
    #[error("fatal invoke error: {0}")]
    FatalInvoke(String),
}

pub type Result<T> = std::result::Result<T, BandError>;

impl BandError {
    pub fn invalid_argument(msg: impl fmt::Display) -> Self {
        BandError::InvalidArgument(msg.to_string())
    }

    pub fn not_found(msg: impl fmt::Display) -> Self {
        BandError::NotFound(msg.to_string())
    }

    pub fn unavailable(msg: impl fmt::Display) -> Self {
        BandError::Unavailable(msg.to_string())
    }

    pub fn internal(msg: impl fmt::Display) -> Self {
        BandError::Internal(msg.to_string())
    }

    pub fn device_error(msg: impl fmt::Display) -> Self {
        BandError::DeviceError(msg.to_string())
    }

    pub fn fatal_invoke(msg: impl fmt::Display) -> Self {
        BandError::FatalInvoke(msg.to_string())
    }
}
