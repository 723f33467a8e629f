//! The in-memory request/response types the dispatcher (C5) pulls off its
//! queue. Each `Request` owns a `crossbeam_channel::Sender` back to its
//! caller rather than a callback, the same completion style the teacher's
//! worker-pool crates use for cross-thread request/response plumbing.

use crossbeam_channel::Sender;

use crate::error::{BackingError, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
    Verify,
    FormatTracks,
    /// `length` carries the requested new total size in bytes.
    Grow,
}

pub struct Request {
    pub kind: RequestKind,
    pub offset: u64,
    pub length: u64,
    /// Write payload; empty for reads, verifies, and flushes.
    pub payload: Vec<u8>,
    pub completion: Sender<RequestOutcome>,
}

pub enum RequestOutcome {
    Read(Vec<u8>),
    Written(u64),
    Verified(u64),
    Formatted,
    Grown(u64),
    Failed(ErrorKind),
}

impl Request {
    pub fn fail(self, err: &BackingError) {
        let _ = self.completion.send(RequestOutcome::Failed(err.into()));
    }
}
