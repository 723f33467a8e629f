//! Request Dispatcher (C5): the per-device single-threaded service loop
//! (spec.md §4.5). One FIFO, one `request_available` signal folded into the
//! channel receive itself, one `terminate_requested` signal, and a 5-second
//! idle timeout that only ever evicts the last-I/O cache. Grounded on the
//! teacher's `crossbeam_channel::select!`-driven worker loops for per-
//! connection service threads, generalized from a fixed command set to the
//! five request kinds this device model needs.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use vb_proxy::CancelToken;

use crate::backing::BackingStore;
use crate::device::DeviceRecord;
use crate::error::BackingError;
use crate::request::{Request, RequestKind, RequestOutcome};

/// Shared handle to a device's live record: the dispatcher thread is the
/// sole writer, but the manager needs to read it for `query_device` without
/// round-tripping through the request queue (spec.md §3 "mutated only by
/// the owning dispatcher thread").
pub type SharedRecord = Arc<RwLock<DeviceRecord>>;

const CACHE_IDLE_TIMEOUT: Duration = Duration::from_secs(5);
const FORMAT_FILL_BYTE: u8 = 0xF6;

/// Format-tracks sentinel byte (spec.md GLOSSARY "Track fill").
pub const TRACK_FILL: u8 = FORMAT_FILL_BYTE;

/// Bounce buffers never shrink below this size when halving on allocation
/// failure (spec.md §4.5/§7 "retry with progressively halved sizes"),
/// mirroring `SlidingWindow::remap`'s halving floor.
const MIN_BOUNCE_CHUNK: u64 = 4096;

/// Allocates a zeroed buffer for `requested` bytes, halving the request on
/// allocation failure until it either succeeds or hits `MIN_BOUNCE_CHUNK`.
/// A buffer shorter than `requested` means the caller must read or write in
/// multiple passes of that shorter length.
fn alloc_bounce_chunk(requested: u64) -> Result<Vec<u8>, BackingError> {
    let mut chunk = requested;
    loop {
        let mut buf = Vec::new();
        if buf.try_reserve_exact(chunk as usize).is_ok() {
            buf.resize(chunk as usize, 0);
            return Ok(buf);
        }
        if chunk <= MIN_BOUNCE_CHUNK {
            return Err(BackingError::InsufficientResources);
        }
        tracing::warn!(requested, chunk, "bounce buffer allocation failed, halving and retrying");
        chunk /= 2;
    }
}

struct LastIoCache {
    offset: u64,
    buffer: Vec<u8>,
}

impl LastIoCache {
    fn covers(&self, offset: u64, len: u64) -> bool {
        offset >= self.offset && offset - self.offset + len <= self.buffer.len() as u64
    }

    fn slice(&self, offset: u64, len: u64) -> &[u8] {
        let start = (offset - self.offset) as usize;
        &self.buffer[start..start + len as usize]
    }
}

/// Reason a device's worker stopped, reported back to the manager so it can
/// clear the device from the bitmap (spec.md §4.5 "Shutdown", §7 "Backing-
/// fatal").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Terminated,
    BackingFatal,
}

/// Handle the Device Manager keeps for a running dispatcher: the request
/// queue's sending half, a one-shot terminate signal, the worker's join
/// handle so shutdown can be observed synchronously when needed, and (for
/// proxy-backed devices) a clone of the backing's cancellation token so a
/// blocking read/write already in flight inside `service()` can be
/// interrupted too (spec.md §4.3 "Cancellation") — the `terminate` channel
/// alone only wakes the `select!` loop between requests, never a request
/// already being serviced.
pub struct DispatcherHandle {
    pub device_id: u32,
    pub requests: Sender<Request>,
    pub terminate: Sender<()>,
    cancel: Option<CancelToken>,
    join: Option<std::thread::JoinHandle<StopReason>>,
}

impl DispatcherHandle {
    pub fn request_terminate(&self) {
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
        let _ = self.terminate.send(());
    }

    /// Blocks until the worker has drained its queue and torn the device
    /// down, per the shutdown sequence in spec.md §4.5.
    pub fn join(&mut self) -> StopReason {
        self.join
            .take()
            .map(|h| h.join().unwrap_or(StopReason::Terminated))
            .unwrap_or(StopReason::Terminated)
    }
}

pub fn spawn(device_id: u32, backing: BackingStore, record: SharedRecord) -> DispatcherHandle {
    let (req_tx, req_rx) = crossbeam_channel::unbounded();
    let (term_tx, term_rx) = crossbeam_channel::bounded(1);
    let cancel = backing.proxy_cancel_token();

    let worker = Worker { device_id, backing, record, cache: None, requests: req_rx, terminate: term_rx };
    let join = std::thread::Builder::new()
        .name(format!("vb-dispatch-{device_id}"))
        .spawn(move || worker.run())
        .expect("failed to spawn dispatcher thread");

    DispatcherHandle { device_id, requests: req_tx, terminate: term_tx, cancel, join: Some(join) }
}

struct Worker {
    device_id: u32,
    backing: BackingStore,
    record: SharedRecord,
    cache: Option<LastIoCache>,
    requests: Receiver<Request>,
    terminate: Receiver<()>,
}

impl Worker {
    fn run(mut self) -> StopReason {
        let mut terminating = false;
        let mut stop_reason = StopReason::Terminated;

        'outer: loop {
            if terminating && self.requests.is_empty() {
                break;
            }

            crossbeam_channel::select! {
                recv(self.requests) -> msg => match msg {
                    Ok(req) => {
                        if let Err(BackingError::Proxy(ref p)) = self.service(req) {
                            if p.is_backing_fatal() {
                                stop_reason = StopReason::BackingFatal;
                                terminating = true;
                            }
                        }
                    }
                    Err(_) => {
                        terminating = true;
                        break 'outer;
                    }
                },
                recv(self.terminate) -> _ => {
                    terminating = true;
                }
                default(CACHE_IDLE_TIMEOUT) => {
                    self.cache = None;
                }
            }
        }

        self.drain_and_shutdown();
        stop_reason
    }

    /// Drains any requests still queued at the moment of shutdown (spec.md
    /// §4.5 "Shutdown": they complete normally, success or error, before
    /// the backing store is closed).
    fn drain_and_shutdown(&mut self) {
        while let Ok(req) = self.requests.try_recv() {
            let _ = self.service(req);
        }
        tracing::info!(device = self.device_id, "dispatcher shutting down");
    }

    fn service(&mut self, req: Request) -> Result<(), BackingError> {
        let result = match req.kind {
            RequestKind::Read => self.handle_read(req.offset, req.length),
            RequestKind::Write => self.handle_write(req.offset, &req.payload),
            RequestKind::Verify => self.handle_verify(),
            RequestKind::FormatTracks => self.handle_format(req.offset, req.length),
            RequestKind::Grow => self.handle_grow(req.length),
        };

        match result {
            Ok(outcome) => {
                let _ = req.completion.send(outcome);
                Ok(())
            }
            Err(err) => {
                let kind: crate::error::ErrorKind = (&err).into();
                if !kind.is_cancellation() {
                    tracing::warn!(device = self.device_id, error = %err, "request failed");
                }
                let _ = req.completion.send(RequestOutcome::Failed(kind));
                Err(err)
            }
        }
    }

    fn handle_read(&mut self, offset: u64, length: u64) -> Result<RequestOutcome, BackingError> {
        let size = self.backing.size();
        if length == 0 || offset >= size {
            return Ok(RequestOutcome::Read(Vec::new()));
        }
        let clamped = length.min(size - offset);

        if matches!(self.backing, BackingStore::Anon(_)) {
            return Ok(RequestOutcome::Read(self.read_bounce(offset, clamped)?));
        }

        if let Some(cache) = &self.cache {
            if cache.covers(offset, clamped) {
                return Ok(RequestOutcome::Read(cache.slice(offset, clamped).to_vec()));
            }
        }
        if let Some(cache) = &self.cache {
            if (cache.buffer.len() as u64) < clamped {
                self.cache = None;
            }
        }

        let buf = self.read_bounce(offset, clamped)?;
        self.cache = Some(LastIoCache { offset, buffer: buf.clone() });
        Ok(RequestOutcome::Read(buf))
    }

    /// Reads `len` bytes at `offset` through a bounce buffer, retrying with
    /// progressively halved chunk sizes if the full-size allocation fails
    /// (spec.md §4.5/§7), the same halving discipline
    /// `vb_winmap::SlidingWindow::remap` applies to its own OOM case.
    fn read_bounce(&mut self, offset: u64, len: u64) -> Result<Vec<u8>, BackingError> {
        let mut chunk = alloc_bounce_chunk(len)?;
        let chunk_len = chunk.len() as u64;
        if chunk_len == len {
            self.backing.read(offset, &mut chunk)?;
            return Ok(chunk);
        }

        let mut out = Vec::with_capacity(len as usize);
        let mut done = 0u64;
        while done < len {
            let n = (len - done).min(chunk_len) as usize;
            self.backing.read(offset + done, &mut chunk[..n])?;
            out.extend_from_slice(&chunk[..n]);
            done += n as u64;
        }
        Ok(out)
    }

    fn handle_write(&mut self, offset: u64, data: &[u8]) -> Result<RequestOutcome, BackingError> {
        if self.record.read().read_only {
            return Err(BackingError::WriteProtected);
        }
        let size = self.backing.size();
        if data.is_empty() || offset >= size {
            return Ok(RequestOutcome::Written(0));
        }
        let clamped = (data.len() as u64).min(size - offset) as usize;

        self.write_bounce(offset, &data[..clamped])?;
        self.record.write().modified = true;

        if !matches!(self.backing, BackingStore::Anon(_)) {
            self.cache = Some(LastIoCache { offset, buffer: data[..clamped].to_vec() });
        }
        Ok(RequestOutcome::Written(clamped as u64))
    }

    /// Writes `data` at `offset`, splitting into progressively halved
    /// chunks if a chunk-sized bounce allocation fails partway through
    /// (mirrors `read_bounce`'s retry for the same resource-exhaustion
    /// case, spec.md §4.5/§7).
    fn write_bounce(&mut self, offset: u64, data: &[u8]) -> Result<(), BackingError> {
        let len = data.len() as u64;
        let chunk = alloc_bounce_chunk(len)?;
        let chunk_len = chunk.len() as u64;
        if chunk_len == len {
            self.backing.write(offset, data)?;
            return Ok(());
        }

        let mut done = 0u64;
        while done < len {
            let n = (len - done).min(chunk_len) as usize;
            self.backing.write(offset + done, &data[done as usize..done as usize + n])?;
            done += n as u64;
        }
        Ok(())
    }

    /// A zero-length read at the backing origin, used purely to probe
    /// proxy liveness (spec.md §4.5 "Verify").
    fn handle_verify(&mut self) -> Result<RequestOutcome, BackingError> {
        let mut probe = [0u8; 0];
        self.backing.read(0, &mut probe)?;
        Ok(RequestOutcome::Verified(self.record.read().media_change_count))
    }

    fn handle_format(&mut self, offset: u64, length: u64) -> Result<RequestOutcome, BackingError> {
        if self.record.read().read_only {
            return Err(BackingError::WriteProtected);
        }
        let size = self.backing.size();
        if offset.checked_add(length).map(|e| e > size).unwrap_or(true) {
            return Err(BackingError::AccessDenied);
        }
        self.backing.format_fill(offset, length, TRACK_FILL)?;
        self.record.write().modified = true;
        self.cache = None;
        Ok(RequestOutcome::Formatted)
    }

    fn handle_grow(&mut self, new_len: u64) -> Result<RequestOutcome, BackingError> {
        let image_offset = self.record.read().image_offset;
        if image_offset != 0 && matches!(self.backing.kind(), crate::backing::BackingKind::File) {
            return Err(BackingError::WrongType);
        }
        if !matches!(self.backing.kind(), crate::backing::BackingKind::Proxy) {
            self.backing.extend(new_len)?;
        }
        self.record.write().geometry.cylinders_total_bytes = new_len as i64;
        Ok(RequestOutcome::Grown(new_len))
    }
}
