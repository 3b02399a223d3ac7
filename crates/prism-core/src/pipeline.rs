//! Capture pipeline - moves raw records from a transport reader into the dispatch queue

use crate::events::{DecodeError, DispatchTask};
use crate::shutdown::{Shutdown, ShutdownSignal};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default dispatch queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// First pause after a transport error; doubles per consecutive error
const TRANSPORT_RETRY_MIN: Duration = Duration::from_millis(10);

/// Cap on the pause between retries of a failing transport
const TRANSPORT_RETRY_MAX: Duration = Duration::from_secs(1);

/// Errors surfaced by a transport reader
#[derive(Debug, Error)]
pub enum TransportError {
    /// The reader has been shut down. Ends the read loop cleanly.
    #[error("transport reader closed")]
    Closed,

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("perf buffer error: {0}")]
    Perf(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Which kernel-to-userspace transport is in use.
///
/// Fixed once at startup and never changes for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Single shared ring buffer (kernel >= 5.8)
    RingBuffer,
    /// One perf buffer per CPU
    PerfBuffer,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::RingBuffer => "ring buffer",
            TransportMode::PerfBuffer => "perf buffer",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lazy, non-restartable source of raw records.
///
/// `read_record` waits until a record is available or the reader has been
/// closed. Once it has returned [`TransportError::Closed`] it keeps doing so.
#[async_trait]
pub trait TransportReader: Send {
    /// Transport this reader drains
    fn mode(&self) -> TransportMode;

    /// Wait for the next raw record
    async fn read_record(&mut self) -> TransportResult<Vec<u8>>;

    /// Samples the kernel reported as lost, if the transport tracks them
    fn lost_samples(&self) -> u64 {
        0
    }
}

/// Sending half of the dispatch queue
pub type DispatchSender = mpsc::Sender<DispatchTask>;

/// Receiving half of the dispatch queue, drained by the parsing stage
pub type DispatchReceiver = mpsc::Receiver<DispatchTask>;

/// Create a bounded FIFO dispatch queue. Sends wait while the queue is full.
pub fn dispatch_queue(capacity: usize) -> (DispatchSender, DispatchReceiver) {
    mpsc::channel(capacity)
}

/// Counters kept by the read loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadLoopStats {
    pub records_read: u64,
    pub dispatched: u64,
    pub decode_errors: u64,
    pub transport_errors: u64,
    pub lost_samples: u64,
}

impl fmt::Display for ReadLoopStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "read={} dispatched={} decode_errors={} transport_errors={} lost={}",
            self.records_read,
            self.dispatched,
            self.decode_errors,
            self.transport_errors,
            self.lost_samples
        )
    }
}

/// Drain `reader` into `queue` until the reader closes, shutdown fires, or
/// the consumer goes away.
///
/// The loop owns the only sender; it is dropped on return, which is what
/// signals end-of-stream to the consumer. No send can happen after that.
pub async fn run_read_loop(
    mut reader: Box<dyn TransportReader>,
    queue: DispatchSender,
    mut shutdown: ShutdownSignal,
) -> ReadLoopStats {
    let mode = reader.mode();
    let mut stats = ReadLoopStats::default();
    let mut retry_delay = TRANSPORT_RETRY_MIN;
    info!("Read loop started ({})", mode);

    loop {
        let result = tokio::select! {
            biased;
            _ = shutdown.recv() => {
                debug!("Read loop observed shutdown");
                break;
            }
            result = reader.read_record() => result,
        };

        let record = match result {
            Ok(record) => record,
            Err(TransportError::Closed) => {
                info!("Transport reader closed");
                break;
            }
            Err(e) => {
                stats.transport_errors += 1;
                warn!(
                    "Error reading from {}: {} (retrying in {:?})",
                    mode, e, retry_delay
                );
                let stopping = tokio::select! {
                    biased;
                    _ = shutdown.recv() => true,
                    _ = tokio::time::sleep(retry_delay) => false,
                };
                if stopping {
                    debug!("Read loop observed shutdown while backing off");
                    break;
                }
                retry_delay = (retry_delay * 2).min(TRANSPORT_RETRY_MAX);
                continue;
            }
        };
        retry_delay = TRANSPORT_RETRY_MIN;
        stats.records_read += 1;

        let task = match DispatchTask::decode(&record) {
            Ok(task) => task,
            Err(e) => {
                stats.decode_errors += 1;
                log_dropped_record(&e, record.len());
                continue;
            }
        };

        // Waits while the queue is full; shutdown still gets through.
        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                debug!("Read loop observed shutdown while queue was full");
                break;
            }
            sent = queue.send(task) => {
                if sent.is_err() {
                    warn!("Dispatch queue consumer went away, stopping read loop");
                    break;
                }
                stats.dispatched += 1;
            }
        }
    }

    stats.lost_samples = reader.lost_samples();
    drop(queue);
    stats
}

fn log_dropped_record(err: &DecodeError, len: usize) {
    warn!("Dropping malformed record ({} bytes): {}", len, err);
}

/// Pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline already running")]
    AlreadyRunning,
}

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Dispatch queue capacity
    pub queue_capacity: usize,

    /// Bound on waiting for the read loop to exit after shutdown
    pub shutdown_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&crate::config::PipelineSettings> for PipelineConfig {
    fn from(settings: &crate::config::PipelineSettings) -> Self {
        Self {
            queue_capacity: settings.queue_capacity,
            shutdown_timeout: settings.shutdown_timeout(),
        }
    }
}

/// Owns the read loop task
pub struct Pipeline {
    config: PipelineConfig,
    read_loop: Option<JoinHandle<ReadLoopStats>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            read_loop: None,
        }
    }

    /// Spawn the read loop and hand back the consumer end of the dispatch queue
    pub fn start(
        &mut self,
        reader: Box<dyn TransportReader>,
        shutdown: &Shutdown,
    ) -> Result<DispatchReceiver, PipelineError> {
        if self.read_loop.is_some() {
            return Err(PipelineError::AlreadyRunning);
        }

        let (tx, rx) = dispatch_queue(self.config.queue_capacity);
        let signal = shutdown.subscribe();
        self.read_loop = Some(tokio::spawn(run_read_loop(reader, tx, signal)));

        info!(
            "Pipeline started (queue capacity {})",
            self.config.queue_capacity
        );
        Ok(rx)
    }

    /// Wait for the read loop to exit after shutdown has been triggered.
    ///
    /// Returns `None` if it did not exit within the configured timeout; the
    /// task is aborted in that case, which drops its sender and still closes
    /// the queue.
    pub async fn stop(&mut self) -> Option<ReadLoopStats> {
        let mut handle = self.read_loop.take()?;

        match tokio::time::timeout(self.config.shutdown_timeout, &mut handle).await {
            Ok(Ok(stats)) => {
                info!("Pipeline stopped");
                Some(stats)
            }
            Ok(Err(e)) => {
                warn!("Read loop task failed: {}", e);
                None
            }
            Err(_) => {
                warn!(
                    "Read loop did not exit within {:?}, aborting it",
                    self.config.shutdown_timeout
                );
                handle.abort();
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{encode_record, Direction};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    enum Step {
        Record(Vec<u8>),
        Fail(TransportError),
    }

    /// Replays a fixed script, then either closes or waits for shutdown
    struct ScriptedReader {
        steps: VecDeque<Step>,
        close_when_done: bool,
        shutdown: Option<ShutdownSignal>,
        lost: u64,
    }

    impl ScriptedReader {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: steps.into(),
                close_when_done: true,
                shutdown: None,
                lost: 0,
            }
        }

        /// Block after the script until shutdown fires, like a real reader
        fn blocking_until(mut self, signal: ShutdownSignal) -> Self {
            self.close_when_done = false;
            self.shutdown = Some(signal);
            self
        }
    }

    #[async_trait]
    impl TransportReader for ScriptedReader {
        fn mode(&self) -> TransportMode {
            TransportMode::RingBuffer
        }

        async fn read_record(&mut self) -> TransportResult<Vec<u8>> {
            match self.steps.pop_front() {
                Some(Step::Record(r)) => Ok(r),
                Some(Step::Fail(e)) => Err(e),
                None if self.close_when_done => Err(TransportError::Closed),
                None => {
                    if let Some(signal) = self.shutdown.as_mut() {
                        signal.recv().await;
                    } else {
                        std::future::pending::<()>().await;
                    }
                    Err(TransportError::Closed)
                }
            }
        }

        fn lost_samples(&self) -> u64 {
            self.lost
        }
    }

    fn record(direction: u32, fill: u8, len: usize) -> Step {
        Step::Record(encode_record(direction, &vec![fill; len], len as u32))
    }

    #[tokio::test]
    async fn test_read_loop_preserves_order() {
        let reader = ScriptedReader::new(vec![
            record(1, 0xa1, 100),
            record(0, 0xb2, 150),
            record(1, 0xc3, 200),
        ]);
        let shutdown = Shutdown::new();
        let (tx, mut rx) = dispatch_queue(DEFAULT_QUEUE_CAPACITY);

        let stats = run_read_loop(Box::new(reader), tx, shutdown.subscribe()).await;
        assert_eq!(stats.records_read, 3);
        assert_eq!(stats.dispatched, 3);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.direction, Direction::Ingress);
        assert_eq!(first.payload, vec![0xa1; 100]);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.direction, Direction::Egress);
        assert_eq!(second.payload.len(), 150);
        let third = rx.recv().await.unwrap();
        assert_eq!(third.payload[0], 0xc3);

        // Sender dropped with the loop: end of stream
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_read_loop_skips_malformed_records() {
        let reader = ScriptedReader::new(vec![
            Step::Record(vec![0u8; 10]),
            Step::Record(encode_record(9, &[0u8; 100], 100)),
            Step::Record(encode_record(1, &[0u8; 100], 5000)),
            record(0, 0x55, 120),
        ]);
        let shutdown = Shutdown::new();
        let (tx, mut rx) = dispatch_queue(4);

        let stats = run_read_loop(Box::new(reader), tx, shutdown.subscribe()).await;
        assert_eq!(stats.records_read, 4);
        assert_eq!(stats.decode_errors, 3);
        assert_eq!(stats.dispatched, 1);

        let task = rx.recv().await.unwrap();
        assert_eq!(task.payload, vec![0x55; 120]);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_read_loop_continues_after_transport_error() {
        let reader = ScriptedReader::new(vec![
            Step::Fail(TransportError::Io(std::io::Error::other("EAGAIN storm"))),
            Step::Fail(TransportError::Perf("bad sample".into())),
            record(1, 0x01, 92),
        ]);
        let shutdown = Shutdown::new();
        let (tx, mut rx) = dispatch_queue(4);

        let stats = run_read_loop(Box::new(reader), tx, shutdown.subscribe()).await;
        assert_eq!(stats.transport_errors, 2);
        assert_eq!(stats.dispatched, 1);
        assert!(rx.recv().await.is_some());
    }

    /// Fails every read, counting attempts
    struct BrokenReader {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TransportReader for BrokenReader {
        fn mode(&self) -> TransportMode {
            TransportMode::RingBuffer
        }

        async fn read_record(&mut self) -> TransportResult<Vec<u8>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Io(std::io::Error::other("fd not pollable")))
        }
    }

    #[tokio::test]
    async fn test_read_loop_backs_off_on_persistent_errors() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let reader = BrokenReader {
            attempts: attempts.clone(),
        };
        let shutdown = Shutdown::new();
        let (tx, mut rx) = dispatch_queue(4);

        let handle = tokio::spawn(run_read_loop(Box::new(reader), tx, shutdown.subscribe()));
        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown.trigger();

        let stats = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        // 10 + 20 + 40 + 80 ms of backoff fit in the window
        let tries = attempts.load(Ordering::SeqCst);
        assert!((2..=8).contains(&tries), "read {} times", tries);
        assert_eq!(stats.transport_errors as usize, tries);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_read_loop_reports_lost_samples() {
        let mut reader = ScriptedReader::new(vec![record(1, 0, 100)]);
        reader.lost = 17;
        let shutdown = Shutdown::new();
        let (tx, _rx) = dispatch_queue(4);

        let stats = run_read_loop(Box::new(reader), tx, shutdown.subscribe()).await;
        assert_eq!(stats.lost_samples, 17);
    }

    #[tokio::test]
    async fn test_read_loop_stops_when_consumer_gone() {
        let reader = ScriptedReader::new(vec![record(1, 0, 100), record(1, 0, 100)]);
        let shutdown = Shutdown::new();
        let (tx, rx) = dispatch_queue(4);
        drop(rx);

        let stats = run_read_loop(Box::new(reader), tx, shutdown.subscribe()).await;
        assert_eq!(stats.records_read, 1);
        assert_eq!(stats.dispatched, 0);
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_full_queue() {
        let steps = (0..10).map(|_| record(0, 0, 100)).collect();
        let reader = ScriptedReader::new(steps);
        let shutdown = Shutdown::new();
        let (tx, mut rx) = dispatch_queue(2);

        let handle = tokio::spawn(run_read_loop(Box::new(reader), tx, shutdown.subscribe()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.trigger();

        let stats = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("read loop should exit promptly")
            .unwrap();
        assert_eq!(stats.dispatched, 2);

        // Queue drains then reports closed
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_pipeline_start_stop() {
        let shutdown = Shutdown::new();
        let reader = ScriptedReader::new(vec![record(1, 0x47, 100)])
            .blocking_until(shutdown.subscribe());

        let mut pipeline = Pipeline::new(PipelineConfig {
            queue_capacity: 8,
            shutdown_timeout: Duration::from_secs(1),
        });
        let mut rx = pipeline.start(Box::new(reader), &shutdown).unwrap();

        let task = rx.recv().await.unwrap();
        assert_eq!(task.direction, Direction::Ingress);

        shutdown.trigger();
        let stats = pipeline.stop().await.unwrap();
        assert_eq!(stats.dispatched, 1);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_pipeline_start_twice_fails() {
        let shutdown = Shutdown::new();
        let mut pipeline = Pipeline::new(PipelineConfig::default());

        let first = ScriptedReader::new(vec![]).blocking_until(shutdown.subscribe());
        let _rx = pipeline.start(Box::new(first), &shutdown).unwrap();

        let second = ScriptedReader::new(vec![]);
        assert!(matches!(
            pipeline.start(Box::new(second), &shutdown),
            Err(PipelineError::AlreadyRunning)
        ));

        shutdown.trigger();
        assert!(pipeline.stop().await.is_some());
    }

    #[tokio::test]
    async fn test_pipeline_stop_without_start() {
        let mut pipeline = Pipeline::new(PipelineConfig::default());
        assert!(pipeline.stop().await.is_none());
    }
}
