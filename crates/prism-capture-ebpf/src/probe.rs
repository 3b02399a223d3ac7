//! Probe object loading
//!
//! Two objects are built from the probe crate, one per transport. The one
//! matching the selected [`TransportMode`] is loaded.

use crate::error::{CaptureError, CaptureResult};
use aya::Ebpf;
use prism_core::TransportMode;
use std::path::Path;
use tracing::info;

#[cfg(embedded_probe)]
static RINGBUF_OBJECT: &[u8] =
    aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/prism-probe-ringbuf"));

#[cfg(embedded_probe)]
static PERF_OBJECT: &[u8] =
    aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/prism-probe-perf"));

/// File name of the object for a transport
pub const fn object_name(mode: TransportMode) -> &'static str {
    match mode {
        TransportMode::RingBuffer => "prism-probe-ringbuf",
        TransportMode::PerfBuffer => "prism-probe-perf",
    }
}

/// Whether the probe objects were embedded at build time
pub const fn is_embedded() -> bool {
    cfg!(embedded_probe)
}

#[cfg(embedded_probe)]
fn embedded_object(mode: TransportMode) -> Option<&'static [u8]> {
    Some(match mode {
        TransportMode::RingBuffer => RINGBUF_OBJECT,
        TransportMode::PerfBuffer => PERF_OBJECT,
    })
}

#[cfg(not(embedded_probe))]
fn embedded_object(_mode: TransportMode) -> Option<&'static [u8]> {
    None
}

/// Load the probe object for `mode`.
///
/// `probe_dir`, when set, takes precedence over the embedded objects.
pub fn load_probe(mode: TransportMode, probe_dir: Option<&Path>) -> CaptureResult<Ebpf> {
    let name = object_name(mode);

    if let Some(dir) = probe_dir {
        let path = dir.join(name);
        let bytecode = std::fs::read(&path).map_err(|e| {
            CaptureError::ProbeLoad(format!("failed to read {}: {}", path.display(), e))
        })?;
        info!("Loading probe {} ({} bytes)", path.display(), bytecode.len());
        return Ebpf::load(&bytecode).map_err(|e| CaptureError::ProbeLoad(e.to_string()));
    }

    let bytecode = embedded_object(mode).ok_or_else(|| {
        CaptureError::ProbeLoad(format!(
            "{} was not embedded at build time; set capture.probe_dir",
            name
        ))
    })?;
    info!("Loading embedded probe {} ({} bytes)", name, bytecode.len());
    Ebpf::load(bytecode).map_err(|e| CaptureError::ProbeLoad(e.to_string()))
}
