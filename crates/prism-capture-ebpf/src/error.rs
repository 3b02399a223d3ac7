//! Capture errors

use crate::attach::AttachError;
use crate::capability::KernelVersion;
use thiserror::Error;

/// Conditions that stop the sensor from starting
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("network interface '{0}' not found")]
    InterfaceNotFound(String),

    #[error("kernel {found} is too old, {required} or newer is required")]
    KernelTooOld {
        found: KernelVersion,
        required: KernelVersion,
    },

    #[error("could not determine kernel version: {0}")]
    KernelVersionUnavailable(String),

    #[error("failed to load probe: {0}")]
    ProbeLoad(String),

    #[error("map {0} not found in probe object")]
    MapNotFound(&'static str),

    #[error("failed to set up transport: {0}")]
    TransportSetup(String),

    #[error(transparent)]
    Attach(#[from] AttachError),
}

/// Result type for capture operations
pub type CaptureResult<T> = Result<T, CaptureError>;
