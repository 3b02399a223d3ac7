//! Perf buffer transport (kernels 5.3 to 5.7)
//!
//! One perf buffer per online CPU, each drained by its own task. The tasks
//! feed a single bounded channel, so order holds within one CPU's stream
//! but not across CPUs.

use crate::error::{CaptureError, CaptureResult};
use async_trait::async_trait;
use aya::maps::perf::{Events, PerfEventArray, PerfEventArrayBuffer};
use aya::maps::{Map, MapData};
use aya::util::online_cpus;
use bytes::BytesMut;
use prism_core::pipeline::{TransportError, TransportMode, TransportReader, TransportResult};
use prism_core::{Shutdown, ShutdownSignal};
use prism_ebpf_common::EVENT_SIZE;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Samples read per `read_events` call
const READ_BATCH: usize = 16;

/// Perf reader settings
#[derive(Debug, Clone)]
pub struct PerfReaderConfig {
    /// Pages per CPU buffer (power of two)
    pub page_count: usize,
    /// Capacity of the channel merging the per-CPU streams
    pub merge_capacity: usize,
}

impl Default for PerfReaderConfig {
    fn default() -> Self {
        Self {
            page_count: 1,
            merge_capacity: 256,
        }
    }
}

/// What a per-CPU task reports to the reader
#[derive(Debug)]
enum CpuMessage {
    Sample(Vec<u8>),
    Lost { cpu: u32, count: u64 },
    Failed { cpu: u32, reason: String },
}

/// Merges the per-CPU perf buffers into one record stream
pub struct PerfBufReader {
    rx: mpsc::Receiver<CpuMessage>,
    shutdown: ShutdownSignal,
    closed: bool,
    lost: u64,
    workers: Vec<JoinHandle<()>>,
}

impl PerfBufReader {
    /// Open a buffer on every online CPU and start draining them
    pub fn open(map: Map, config: &PerfReaderConfig, shutdown: &Shutdown) -> CaptureResult<Self> {
        let mut array = PerfEventArray::try_from(map)
            .map_err(|e| CaptureError::TransportSetup(e.to_string()))?;
        let cpus = online_cpus()
            .map_err(|(msg, err)| CaptureError::TransportSetup(format!("{msg}: {err}")))?;

        let (tx, rx) = mpsc::channel(config.merge_capacity);
        let mut workers = Vec::with_capacity(cpus.len());
        for cpu in cpus {
            let buf = array.open(cpu, Some(config.page_count)).map_err(|e| {
                CaptureError::TransportSetup(format!("perf buffer on CPU {}: {}", cpu, e))
            })?;
            workers.push(tokio::spawn(drain_cpu(
                cpu,
                buf,
                tx.clone(),
                shutdown.subscribe(),
            )));
        }

        info!(
            "Opened perf buffers on {} CPUs ({} pages each)",
            workers.len(),
            config.page_count
        );
        Ok(Self::from_parts(rx, shutdown.subscribe(), workers))
    }

    fn from_parts(
        rx: mpsc::Receiver<CpuMessage>,
        shutdown: ShutdownSignal,
        workers: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            rx,
            shutdown,
            closed: false,
            lost: 0,
            workers,
        }
    }

    fn close(&mut self) -> TransportError {
        self.closed = true;
        TransportError::Closed
    }
}

#[async_trait]
impl TransportReader for PerfBufReader {
    fn mode(&self) -> TransportMode {
        TransportMode::PerfBuffer
    }

    async fn read_record(&mut self) -> TransportResult<Vec<u8>> {
        loop {
            if self.closed {
                return Err(TransportError::Closed);
            }

            let next = tokio::select! {
                biased;
                _ = self.shutdown.recv() => None,
                msg = self.rx.recv() => msg,
            };

            match next {
                // Shutdown, or every CPU task has exited
                None => return Err(self.close()),
                Some(CpuMessage::Sample(record)) => return Ok(record),
                Some(CpuMessage::Lost { cpu, count }) => {
                    self.lost += count;
                    warn!("Lost {} samples on CPU {} (perf buffer full)", count, cpu);
                }
                Some(CpuMessage::Failed { cpu, reason }) => {
                    return Err(TransportError::Perf(format!("CPU {}: {}", cpu, reason)));
                }
            }
        }
    }

    fn lost_samples(&self) -> u64 {
        self.lost
    }
}

impl Drop for PerfBufReader {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

/// Drain one CPU's buffer until shutdown or until the reader goes away
async fn drain_cpu(
    cpu: u32,
    mut buf: PerfEventArrayBuffer<MapData>,
    tx: mpsc::Sender<CpuMessage>,
    mut shutdown: ShutdownSignal,
) {
    let fd: RawFd = buf.as_fd().as_raw_fd();
    let async_fd = match AsyncFd::new(fd) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = tx
                .send(CpuMessage::Failed {
                    cpu,
                    reason: e.to_string(),
                })
                .await;
            return;
        }
    };

    let mut buffers = (0..READ_BATCH)
        .map(|_| BytesMut::with_capacity(EVENT_SIZE))
        .collect::<Vec<_>>();

    loop {
        let stopping = tokio::select! {
            biased;
            _ = shutdown.recv() => true,
            ready = async_fd.readable() => match ready {
                Ok(mut guard) => {
                    guard.clear_ready();
                    false
                }
                Err(e) => {
                    warn!("Perf buffer on CPU {} is no longer pollable: {}", cpu, e);
                    true
                }
            },
        };
        if stopping {
            break;
        }

        while buf.readable() {
            let Events { read, lost } = match buf.read_events(&mut buffers) {
                Ok(events) => events,
                Err(e) => {
                    let failed = CpuMessage::Failed {
                        cpu,
                        reason: e.to_string(),
                    };
                    if tx.send(failed).await.is_err() {
                        return;
                    }
                    break;
                }
            };

            if lost > 0 {
                let lost = CpuMessage::Lost {
                    cpu,
                    count: lost as u64,
                };
                if tx.send(lost).await.is_err() {
                    return;
                }
            }

            for sample in buffers.iter().take(read) {
                if tx.send(CpuMessage::Sample(sample.to_vec())).await.is_err() {
                    return;
                }
            }
        }
    }

    debug!("Perf reader for CPU {} stopped", cpu);
}
