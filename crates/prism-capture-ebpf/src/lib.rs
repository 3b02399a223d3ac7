//! Linux TC capture for the Prism sensor
//!
//! Loads a classifier pair onto an interface's ingress and egress hooks and
//! streams every plausible HTTP-over-IPv4/TCP frame prefix to userspace. The
//! transport (ring buffer or per-CPU perf buffers) is picked from the kernel
//! version at startup.

pub mod attach;
pub mod capability;
pub mod error;

#[cfg(target_os = "linux")]
pub mod probe;

#[cfg(target_os = "linux")]
pub mod transport;

#[cfg(target_os = "linux")]
mod tc_capture;

pub use attach::{AttachError, AttachmentManager, BindingState, TcBackend};
pub use capability::{select_transport, KernelVersion, MIN_KERNEL, RING_BUFFER_KERNEL};
pub use error::{CaptureError, CaptureResult};

#[cfg(target_os = "linux")]
pub use tc_capture::{interface_index, TcCaptureConfig, TcHttpCapture};
