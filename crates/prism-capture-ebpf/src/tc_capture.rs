//! TC HTTP capture - ties capability detection, probe loading, transport
//! setup and interface attachment together

use crate::attach::{AttachmentManager, AyaTcBackend, BindingState};
use crate::capability::{self, KernelVersion};
use crate::error::{CaptureError, CaptureResult};
use crate::probe;
use crate::transport::{PerfBufReader, PerfReaderConfig, RingBufReader};
use aya::maps::RingBuf;
use prism_core::config::CaptureSettings;
use prism_core::{Shutdown, TransportMode, TransportReader};
use prism_ebpf_common::EVENTS_MAP;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// TC capture configuration
#[derive(Debug, Clone)]
pub struct TcCaptureConfig {
    /// Interface to tap
    pub interface: String,

    /// Directory holding the probe objects, if not embedded
    pub probe_dir: Option<PathBuf>,

    /// Perf transport settings (ignored on the ring buffer path)
    pub perf: PerfReaderConfig,
}

impl Default for TcCaptureConfig {
    fn default() -> Self {
        Self {
            interface: "lo".to_string(),
            probe_dir: None,
            perf: PerfReaderConfig::default(),
        }
    }
}

impl From<&CaptureSettings> for TcCaptureConfig {
    fn from(settings: &CaptureSettings) -> Self {
        Self {
            interface: settings.interface.clone(),
            probe_dir: settings.probe_dir.as_ref().map(PathBuf::from),
            perf: PerfReaderConfig {
                page_count: settings.perf_buffer_pages,
                merge_capacity: settings.perf_merge_capacity,
            },
        }
    }
}

/// Look up an interface index by name
pub fn interface_index(name: &str) -> CaptureResult<u32> {
    nix::net::if_::if_nametoindex(name)
        .map_err(|_| CaptureError::InterfaceNotFound(name.to_string()))
}

/// A loaded probe with its transport reader and interface binding
pub struct TcHttpCapture {
    kernel: KernelVersion,
    mode: TransportMode,
    binding: AttachmentManager<AyaTcBackend>,
    reader: Option<Box<dyn TransportReader>>,
}

impl TcHttpCapture {
    /// Detect capabilities, load the matching probe and open its transport.
    ///
    /// Nothing is attached to the interface yet.
    pub fn open(config: &TcCaptureConfig, shutdown: &Shutdown) -> CaptureResult<Self> {
        let ifindex = interface_index(&config.interface)?;

        let (kernel, mode) = capability::detect()?;
        info!("Kernel {} detected, using {} transport", kernel, mode);

        capability::check_ebpf_available();
        capability::bump_memlock_rlimit();

        let mut ebpf = probe::load_probe(mode, config.probe_dir.as_deref())?;

        let map = ebpf
            .take_map(EVENTS_MAP)
            .ok_or(CaptureError::MapNotFound(EVENTS_MAP))?;
        let reader: Box<dyn TransportReader> = match mode {
            TransportMode::RingBuffer => {
                let ring = RingBuf::try_from(map)
                    .map_err(|e| CaptureError::TransportSetup(e.to_string()))?;
                let reader = RingBufReader::new(ring, shutdown.subscribe())
                    .map_err(|e| CaptureError::TransportSetup(e.to_string()))?;
                debug!("{} ring buffer initialized", EVENTS_MAP);
                Box::new(reader)
            }
            TransportMode::PerfBuffer => {
                Box::new(PerfBufReader::open(map, &config.perf, shutdown)?)
            }
        };

        let backend = AyaTcBackend::new(ebpf)?;
        let binding = AttachmentManager::new(backend, config.interface.clone(), ifindex);

        Ok(Self {
            kernel,
            mode,
            binding,
            reader: Some(reader),
        })
    }

    /// Install the ingress and egress filters
    pub fn attach(&mut self) -> CaptureResult<()> {
        self.binding.attach()?;
        Ok(())
    }

    /// Hand the transport reader to the read loop. Only the first call
    /// returns it.
    pub fn take_reader(&mut self) -> Option<Box<dyn TransportReader>> {
        self.reader.take()
    }

    /// Remove both filters. Failures are logged, never fatal.
    pub fn detach(&mut self) {
        let errors = self.binding.detach();
        if !errors.is_empty() {
            warn!(
                "{} filter(s) could not be removed from {}",
                errors.len(),
                self.binding.interface()
            );
        }
    }

    pub fn kernel_version(&self) -> KernelVersion {
        self.kernel
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn interface(&self) -> &str {
        self.binding.interface()
    }

    pub fn ifindex(&self) -> u32 {
        self.binding.ifindex()
    }

    pub fn is_attached(&self) -> bool {
        self.binding.state() == BindingState::BothAttached
    }
}
