//! Device session contract.
//!
//! The supervisor only talks to the hardware through [`DeviceSession`]. The
//! serial implementation lives in [`crate::serial`]; tests provide their own.
//!
//! While a receive is in progress the foreground never touches the device. It
//! observes the run through a [`ReceiveMonitor`], whose fields are plain
//! atomics so a poll never blocks and never sees a partial value.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::errors::Result;
use crate::output::OutputSink;

/// Parameters of a streaming receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRequest {
    /// Number of batches to read. `None` reads until the source is exhausted.
    pub batches: Option<u32>,
    /// Device readout mode.
    pub mode: u32,
}

impl Default for StreamRequest {
    fn default() -> Self {
        Self {
            batches: None,
            mode: 1,
        }
    }
}

impl StreamRequest {
    /// Batch count as the device expects it, `-1` meaning unbounded.
    pub fn batch_arg(&self) -> i64 {
        self.batches.map(i64::from).unwrap_or(-1)
    }
}

/// Status cell shared between a receive task and whoever supervises it.
#[derive(Debug, Default)]
pub struct ReceiveMonitor {
    running: AtomicBool,
    bytes_received: AtomicU64,
    stop_requested: AtomicBool,
}

impl ReceiveMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Account for `n` more bytes read from the device. Returns the new total.
    pub fn add_bytes(&self, n: u64) -> u64 {
        self.bytes_received.fetch_add(n, Ordering::Relaxed) + n
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }
}

/// A connected wuBase (or anything that behaves like one).
///
/// Methods take `&self`: a session is shared between the supervisor and the
/// receive task, so implementations serialise access to the link internally.
pub trait DeviceSession: Send + Sync {
    /// Stable device identifier.
    fn identifier(&self) -> Result<String>;

    /// Human readable device status.
    fn query_status(&self) -> Result<String>;

    /// Send one command and return its reply.
    fn execute(&self, command: &str) -> Result<String>;

    /// Read acquired data until `monitor.stop_requested()` or the source is
    /// exhausted, copying it to `sink` when one is given and counting every
    /// byte in `monitor`. Returns the number of bytes read by this call.
    fn stream_receive(
        &self,
        request: &StreamRequest,
        sink: Option<&OutputSink>,
        monitor: &ReceiveMonitor,
    ) -> Result<u64>;
}
