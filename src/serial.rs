//! wuBase session over a serial (UART) link.
//!
//! The link is line oriented: a command is its text followed by `\n` and the
//! device answers with one reply line. Replies are passed through untouched;
//! interpreting them is left to the caller.
//!
//! # Receive window
//!
//! `stream_receive` sends `send_batch <n> <mode>` and then treats everything
//! the device sends as raw data until asked to stop or until the line goes
//! quiet. The port lock is held for the whole window, so no other command can
//! interleave with a running readout. Other callers wait for the lock only for
//! a bounded time and get [`DriverError::NotReady`] otherwise.
//!
//! The link has no command that halts a batch. When a receive is stopped
//! early, whatever the device still sends is discarded for up to
//! `DRAIN_TIMEOUT` before the port is released. A device that keeps streaming
//! past that can still leave data bytes in front of the next reply.

use std::io::{ErrorKind, Read, Write};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::errors::{DriverError, Result};
use crate::output::OutputSink;
use crate::session::{DeviceSession, ReceiveMonitor, StreamRequest};

// ============================================================================
// Constants
// ============================================================================

/// Default UART baud rate of the wuBase.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Per-read timeout of the serial port.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// Maximum time to wait for a command reply line.
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Maximum time a command waits for the port while a receive holds it.
const LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Quiet time after data has started that ends a receive.
const IDLE_TIMEOUT: Duration = Duration::from_secs(2);

/// Quiet time before any data that ends a receive.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest reply line accepted before giving up on a terminator.
const MAX_REPLY_LEN: usize = 512;

/// Longest time spent discarding data after a receive is stopped early.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 4096;

// ============================================================================
// Transport Abstraction
// ============================================================================

/// Trait for Read + Write + Send, allowing different transport backends.
trait Transport: Read + Write + Send {}
impl<T: Read + Write + Send> Transport for T {}

// ============================================================================
// Serial Session
// ============================================================================

/// A wuBase attached to a serial port.
///
/// ```ignore
/// let session = SerialSession::open("/dev/ttyUSB0", DEFAULT_BAUD, DEFAULT_TIMEOUT)?;
/// println!("wuBase UID: {}", session.identifier()?);
/// println!("{}", session.query_status()?);
/// ```
pub struct SerialSession {
    port: Mutex<Box<dyn Transport>>,
    label: String,
    reply_timeout: Duration,
    lock_timeout: Duration,
    idle_timeout: Duration,
    startup_timeout: Duration,
}

impl SerialSession {
    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    /// Open the serial port at `path`.
    pub fn open(path: &str, baud: u32, timeout: Duration) -> Result<Self> {
        let port = serialport::new(path, baud).timeout(timeout).open()?;
        info!("opened {} at {} baud", path, baud);
        Ok(Self::from_transport(path, port))
    }

    /// Build a session on top of an already open byte stream.
    pub fn from_transport(
        label: impl Into<String>,
        transport: impl Read + Write + Send + 'static,
    ) -> Self {
        Self {
            port: Mutex::new(Box::new(transport)),
            label: label.into(),
            reply_timeout: REPLY_TIMEOUT,
            lock_timeout: LOCK_TIMEOUT,
            idle_timeout: IDLE_TIMEOUT,
            startup_timeout: STARTUP_TIMEOUT,
        }
    }

    /// Override how long a receive tolerates silence before and after data starts.
    pub fn with_receive_timeouts(mut self, startup: Duration, idle: Duration) -> Self {
        self.startup_timeout = startup;
        self.idle_timeout = idle;
        self
    }

    /// Override the reply and port-lock timeouts used by commands.
    pub fn with_command_timeouts(mut self, reply: Duration, lock: Duration) -> Self {
        self.reply_timeout = reply;
        self.lock_timeout = lock;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    // ------------------------------------------------------------------------
    // Internal Methods
    // ------------------------------------------------------------------------

    /// Take the port, waiting at most `lock_timeout` for a running receive.
    fn acquire(&self) -> Result<MutexGuard<'_, Box<dyn Transport>>> {
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match self.port.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(poisoned)) => {
                    warn!("{}: port lock poisoned, recovering", self.label);
                    return Ok(poisoned.into_inner());
                }
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(DriverError::NotReady(format!(
                            "{}: command channel busy",
                            self.label
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
        }
    }

    fn send_line(port: &mut Box<dyn Transport>, text: &str) -> Result<()> {
        port.write_all(text.as_bytes())?;
        port.write_all(b"\n")?;
        port.flush()?;
        Ok(())
    }

    /// Read one reply line, skipping leading line terminators.
    fn read_line(&self, port: &mut Box<dyn Transport>) -> Result<String> {
        let mut response = Vec::with_capacity(64);
        let deadline = Instant::now() + self.reply_timeout;

        loop {
            let mut byte = [0u8; 1];
            match port.read(&mut byte) {
                Ok(1) => {
                    if byte[0] == b'\n' || byte[0] == b'\r' || byte[0] == 0 {
                        if !response.is_empty() {
                            break;
                        }
                        continue;
                    }
                    response.push(byte[0]);
                    if response.len() >= MAX_REPLY_LEN {
                        return Err(DriverError::Protocol(format!(
                            "reply longer than {MAX_REPLY_LEN} bytes without terminator"
                        )));
                    }
                }
                Ok(_) => std::thread::sleep(Duration::from_millis(1)),
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }

            if Instant::now() > deadline {
                return Err(DriverError::Timeout(format!(
                    "no reply within {:?} (partial: {:?})",
                    self.reply_timeout,
                    String::from_utf8_lossy(&response)
                )));
            }
        }

        Ok(String::from_utf8_lossy(&response).trim().to_string())
    }

    /// Discard incoming data until the line is quiet or `DRAIN_TIMEOUT` passes.
    fn drain_input(&self, port: &mut Box<dyn Transport>) -> Result<u64> {
        let mut buf = vec![0u8; READ_CHUNK];
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        let mut discarded = 0u64;
        loop {
            match port.read(&mut buf) {
                Ok(0) => return Ok(discarded),
                Ok(n) => discarded += n as u64,
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    return Ok(discarded)
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }

            if Instant::now() >= deadline {
                warn!(
                    "{}: device still sending {:?} after stop, giving up",
                    self.label, DRAIN_TIMEOUT
                );
                return Ok(discarded);
            }
        }
    }

    /// Drop whatever is pending on the input side.
    fn flush_input(port: &mut Box<dyn Transport>) -> Result<()> {
        let mut buf = [0u8; 256];
        let start = Instant::now();
        let max_flush = Duration::from_millis(200);
        let mut iterations = 0usize;
        loop {
            iterations += 1;
            match port.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => trace!("discarded {} stale bytes", n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }

            if iterations > 64 || start.elapsed() > max_flush {
                break;
            }
        }
        Ok(())
    }
}

/// A reply the device uses to reject a command.
fn is_rejection(reply: &str) -> bool {
    reply.starts_with('?') || reply.to_ascii_uppercase().starts_with("ERR")
}

impl DeviceSession for SerialSession {
    fn identifier(&self) -> Result<String> {
        self.execute("uid")
    }

    fn query_status(&self) -> Result<String> {
        self.execute("status")
    }

    fn execute(&self, command: &str) -> Result<String> {
        let mut port = self.acquire()?;
        Self::flush_input(&mut port)?;
        Self::send_line(&mut port, command)?;
        let reply = self.read_line(&mut port)?;
        trace!("{}: {} -> {}", self.label, command, reply);

        if is_rejection(&reply) {
            return Err(DriverError::Command(format!("{command}: {reply}")));
        }
        Ok(reply)
    }

    fn stream_receive(
        &self,
        request: &StreamRequest,
        sink: Option<&OutputSink>,
        monitor: &ReceiveMonitor,
    ) -> Result<u64> {
        let mut port = self.acquire()?;
        Self::flush_input(&mut port)?;
        let command = format!("send_batch {} {}", request.batch_arg(), request.mode);
        Self::send_line(&mut port, &command)?;
        debug!("{}: receive started ({})", self.label, command);

        let started = Instant::now();
        let mut last_data: Option<Instant> = None;
        let mut total = 0u64;
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            if monitor.stop_requested() {
                debug!("{}: receive stopped on request", self.label);
                let discarded = self.drain_input(&mut port)?;
                if discarded > 0 {
                    debug!("{}: discarded {} bytes after stop", self.label, discarded);
                }
                break;
            }

            match port.read(&mut buf) {
                Ok(0) => std::thread::sleep(Duration::from_millis(1)),
                Ok(n) => {
                    if let Some(sink) = sink {
                        sink.write_all(&buf[..n])?;
                    }
                    total += n as u64;
                    monitor.add_bytes(n as u64);
                    last_data = Some(Instant::now());
                    continue;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }

            match last_data {
                Some(t) if t.elapsed() >= self.idle_timeout => {
                    debug!("{}: source exhausted after {} bytes", self.label, total);
                    break;
                }
                None if started.elapsed() >= self.startup_timeout => {
                    warn!(
                        "{}: no data within {:?} of `{}`",
                        self.label, self.startup_timeout, command
                    );
                    break;
                }
                _ => {}
            }
        }

        if let Some(sink) = sink {
            sink.flush()?;
        }
        Ok(total)
    }
}
