//! The byte channel to the REPL process.
//!
//! `ReplChannel` is the platform capability the session drives: write, poll-read, signal, wait.
//! The pty implementation lives in `pty`; tests plug in fakes that replay canned output.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::SessionError;
use crate::marker::locate_boundary;

const READ_CHUNK_BYTES: usize = 4096;
// Deadlines past this are clamped; `Instant` arithmetic panics on overflow.
const FARTHEST_DEADLINE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were copied into the buffer.
    Data(usize),
    /// Nothing arrived within the poll timeout.
    Idle,
    /// The other side is gone; no more bytes will arrive.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplSignal {
    Interrupt,
    Terminate,
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Code(i32),
    Signal(i32),
    Unknown,
}

impl std::fmt::Display for ChildExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChildExit::Code(code) => write!(f, "exit status {code}"),
            ChildExit::Signal(signal) => write!(f, "signal {signal}"),
            ChildExit::Unknown => write!(f, "unknown status"),
        }
    }
}

/// Delivers signals to the child. Cloned out of the channel so it can be used while another
/// thread is blocked reading.
pub trait ProcessSignaller: Send + Sync {
    fn signal(&self, signal: ReplSignal) -> Result<(), SessionError>;
}

pub trait ReplChannel: Send {
    fn pid(&self) -> Option<u32>;

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), SessionError>;

    fn poll_read(&mut self, buf: &mut [u8], timeout: Duration)
    -> Result<ReadOutcome, SessionError>;

    fn signaller(&self) -> Arc<dyn ProcessSignaller>;

    fn try_wait(&mut self) -> Result<Option<ChildExit>, SessionError>;

    fn wait(&mut self) -> Result<ChildExit, SessionError>;
}

pub trait ChannelLauncher: Send + Sync {
    fn launch(&self, program: &Path, args: &[String]) -> Result<Box<dyn ReplChannel>, SessionError>;
}

/// `now + timeout`, clamped for timeouts too large to represent.
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout.min(FARTHEST_DEADLINE)).unwrap_or(now)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkEnd {
    Deadline,
    Closed,
    Cancelled,
}

/// Lazy sequence of byte chunks read from a channel until a deadline.
///
/// Each `next` polls in `tick` steps. The iterator ends at the deadline, when the channel closes,
/// or when `cancel` fires; `end()` reports which. It cannot be resumed once it has ended.
pub struct Chunks<'a> {
    channel: &'a mut dyn ReplChannel,
    deadline: Instant,
    tick: Duration,
    cancel: &'a CancellationToken,
    buf: Vec<u8>,
    end: Option<ChunkEnd>,
}

impl<'a> Chunks<'a> {
    pub fn new(
        channel: &'a mut dyn ReplChannel,
        deadline: Instant,
        tick: Duration,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            channel,
            deadline,
            tick: tick.max(Duration::from_millis(1)),
            cancel,
            buf: vec![0u8; READ_CHUNK_BYTES],
            end: None,
        }
    }

    pub fn end(&self) -> Option<ChunkEnd> {
        self.end
    }

    fn finish(&mut self, end: ChunkEnd) -> Option<Result<Vec<u8>, SessionError>> {
        self.end = Some(end);
        None
    }
}

impl Iterator for Chunks<'_> {
    type Item = Result<Vec<u8>, SessionError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.end.is_some() {
            return None;
        }
        loop {
            if self.cancel.is_cancelled() {
                return self.finish(ChunkEnd::Cancelled);
            }
            let now = Instant::now();
            if now >= self.deadline {
                return self.finish(ChunkEnd::Deadline);
            }
            let wait = self.tick.min(self.deadline - now);
            match self.channel.poll_read(&mut self.buf, wait) {
                Ok(ReadOutcome::Data(n)) => return Some(Ok(self.buf[..n].to_vec())),
                Ok(ReadOutcome::Idle) => continue,
                Ok(ReadOutcome::Closed) => return self.finish(ChunkEnd::Closed),
                Err(err) => {
                    self.end = Some(ChunkEnd::Closed);
                    return Some(Err(err));
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    /// Bytes before the boundary, or everything read when the boundary never showed up.
    pub bytes: Vec<u8>,
    pub found: bool,
    pub end: Option<ChunkEnd>,
}

impl Capture {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Accumulates output until `boundary` appears or the deadline passes.
///
/// A missing boundary is not an error: the caller gets whatever arrived. Bytes after the
/// boundary are dropped.
pub fn read_until_boundary(
    channel: &mut dyn ReplChannel,
    boundary: &[u8],
    timeout: Duration,
    tick: Duration,
    cancel: &CancellationToken,
) -> Result<Capture, SessionError> {
    let mut chunks = Chunks::new(channel, deadline_after(timeout), tick, cancel);
    let mut bytes = Vec::new();
    for chunk in chunks.by_ref() {
        let chunk = chunk?;
        let search_from = bytes.len().saturating_sub(boundary.len().saturating_sub(1));
        bytes.extend_from_slice(&chunk);
        let (before, found) = locate_boundary(&bytes[search_from..], boundary);
        if found {
            let pos = search_from + before.len();
            bytes.truncate(pos);
            return Ok(Capture {
                bytes,
                found: true,
                end: None,
            });
        }
    }
    Ok(Capture {
        bytes,
        found: false,
        end: chunks.end(),
    })
}

/// Reads until the channel has been quiet for `idle` after producing something, or until
/// `timeout`. Used to swallow startup banners and stale output.
pub fn drain_until_idle(
    channel: &mut dyn ReplChannel,
    idle: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Capture, SessionError> {
    let started = Instant::now();
    let mut bytes = Vec::new();
    let mut end = None;
    loop {
        let remaining = timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            end = Some(ChunkEnd::Deadline);
            break;
        }
        let window = if bytes.is_empty() {
            remaining
        } else {
            idle.min(remaining)
        };
        let mut chunks = Chunks::new(channel, deadline_after(window), idle, cancel);
        match chunks.next() {
            Some(chunk) => bytes.extend_from_slice(&chunk?),
            None => {
                end = chunks.end();
                break;
            }
        }
    }
    Ok(Capture {
        bytes,
        found: false,
        end,
    })
}
