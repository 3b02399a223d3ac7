//! Kernel capability detection
//!
//! The transport is chosen once, from the running kernel version, and never
//! renegotiated.

use crate::error::CaptureError;
use prism_core::TransportMode;
use std::fmt;
use std::path::Path;
use tracing::warn;

/// Kernel release as `major.minor.patch`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

/// Oldest kernel the sensor will run on. The frame copy in the probe is a
/// bounded loop, which the verifier accepts from 5.3 on.
pub const MIN_KERNEL: KernelVersion = KernelVersion::new(5, 3, 0);

/// First kernel with `BPF_MAP_TYPE_RINGBUF`
pub const RING_BUFFER_KERNEL: KernelVersion = KernelVersion::new(5, 8, 0);

impl KernelVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse a release string such as `5.15.0-91-generic` or `6.1.55+`.
    pub fn parse(release: &str) -> Option<Self> {
        let mut parts = release.trim().split('.');

        let major = leading_number(parts.next()?)?;
        let minor = leading_number(parts.next()?)?;
        let patch = parts.next().and_then(leading_number).unwrap_or(0);

        Some(Self::new(major, minor, patch))
    }

    /// Read the running kernel's version from `/proc/sys/kernel/osrelease`
    pub fn current() -> Result<Self, CaptureError> {
        let release = std::fs::read_to_string("/proc/sys/kernel/osrelease")
            .map_err(|e| CaptureError::KernelVersionUnavailable(e.to_string()))?;
        Self::parse(&release).ok_or_else(|| {
            CaptureError::KernelVersionUnavailable(format!(
                "unrecognised release string {:?}",
                release.trim()
            ))
        })
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

fn leading_number(part: &str) -> Option<u32> {
    let end = part
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(part.len());
    part[..end].parse().ok()
}

/// Pick the transport for a kernel version.
///
/// Pure function of the version: below [`MIN_KERNEL`] is fatal, at or above
/// [`RING_BUFFER_KERNEL`] gets the ring buffer, anything between gets the
/// per-CPU perf buffers.
pub fn select_transport(version: KernelVersion) -> Result<TransportMode, CaptureError> {
    if version < MIN_KERNEL {
        return Err(CaptureError::KernelTooOld {
            found: version,
            required: MIN_KERNEL,
        });
    }

    if version >= RING_BUFFER_KERNEL {
        Ok(TransportMode::RingBuffer)
    } else {
        Ok(TransportMode::PerfBuffer)
    }
}

/// Read the kernel version and pick the transport
pub fn detect() -> Result<(KernelVersion, TransportMode), CaptureError> {
    let version = KernelVersion::current()?;
    let mode = select_transport(version)?;
    Ok((version, mode))
}

/// Check if eBPF is available on this system
pub fn check_ebpf_available() -> bool {
    if !bpf_fs_mounted() {
        warn!("BPF filesystem not mounted at /sys/fs/bpf");
        return false;
    }
    true
}

pub fn bpf_fs_mounted() -> bool {
    Path::new("/sys/fs/bpf").exists()
}

pub fn btf_available() -> bool {
    Path::new("/sys/kernel/btf/vmlinux").exists()
}

/// Check if running as root
#[cfg(target_os = "linux")]
pub fn is_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

#[cfg(not(target_os = "linux"))]
pub fn is_root() -> bool {
    false
}

/// Bump memlock rlimit for eBPF (required on kernels before 5.11)
#[cfg(target_os = "linux")]
pub fn bump_memlock_rlimit() -> bool {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to remove limit on locked memory (ret={})", ret);
        false
    } else {
        true
    }
}
