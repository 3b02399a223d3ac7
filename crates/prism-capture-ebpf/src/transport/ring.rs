//! Ring buffer transport (kernel >= 5.8)

use async_trait::async_trait;
use aya::maps::{MapData, RingBuf};
use prism_core::pipeline::{TransportError, TransportMode, TransportReader, TransportResult};
use prism_core::ShutdownSignal;
use std::os::fd::{AsRawFd, RawFd};
use tokio::io::unix::AsyncFd;
use tracing::warn;

/// Reads records from the shared `HTTP_EVENTS` ring buffer.
///
/// Records are drained in submission order. The reader waits on the map's
/// epoll readiness rather than polling.
pub struct RingBufReader {
    // Declared before `ring` so the fd is deregistered before the map closes it
    async_fd: AsyncFd<RawFd>,
    ring: RingBuf<MapData>,
    shutdown: ShutdownSignal,
    closed: bool,
}

impl RingBufReader {
    pub fn new(ring: RingBuf<MapData>, shutdown: ShutdownSignal) -> std::io::Result<Self> {
        let async_fd = AsyncFd::new(ring.as_raw_fd())?;
        Ok(Self {
            async_fd,
            ring,
            shutdown,
            closed: false,
        })
    }

    fn close(&mut self) -> TransportError {
        self.closed = true;
        TransportError::Closed
    }
}

#[async_trait]
impl TransportReader for RingBufReader {
    fn mode(&self) -> TransportMode {
        TransportMode::RingBuffer
    }

    async fn read_record(&mut self) -> TransportResult<Vec<u8>> {
        loop {
            if self.closed || self.shutdown.is_triggered() {
                return Err(self.close());
            }

            if let Some(item) = self.ring.next() {
                return Ok(item.to_vec());
            }

            let stopping = tokio::select! {
                biased;
                _ = self.shutdown.recv() => true,
                ready = self.async_fd.readable() => match ready {
                    Ok(mut guard) => {
                        guard.clear_ready();
                        false
                    }
                    Err(e) => {
                        warn!("Ring buffer is no longer pollable: {}", e);
                        true
                    }
                },
            };
            if stopping {
                return Err(self.close());
            }
        }
    }
}
