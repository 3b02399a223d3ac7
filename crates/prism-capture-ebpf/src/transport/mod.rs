//! Transport readers
//!
//! Both variants implement [`prism_core::TransportReader`] and yield raw
//! records in the probe's wire layout. Decoding happens in the read loop.

mod perf;
mod ring;

pub use perf::{PerfBufReader, PerfReaderConfig};
pub use ring::RingBufReader;
