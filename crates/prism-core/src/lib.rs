//! Prism Core - configuration, handoff types, and the capture read loop
//!
//! This crate holds everything in the capture pipeline that does not talk to
//! the kernel:
//!
//! - **Config**: the immutable sensor configuration and its loader
//! - **Events**: the wire record decoder and the [`DispatchTask`] handed downstream
//! - **Pipeline**: the [`TransportReader`] contract, the read loop, and the dispatch queue
//! - **Shutdown**: the single cancellation signal shared by every stage

pub mod config;
pub mod events;
pub mod pipeline;
pub mod shutdown;

pub use config::{ConfigLoader, SensorConfig};
pub use events::{DecodeError, Direction, DispatchTask};
pub use pipeline::{
    Pipeline, PipelineConfig, ReadLoopStats, TransportError, TransportMode, TransportReader,
};
pub use shutdown::{Shutdown, ShutdownSignal, TerminationSignals};

/// Sensor version
pub const SENSOR_VERSION: &str = env!("CARGO_PKG_VERSION");
