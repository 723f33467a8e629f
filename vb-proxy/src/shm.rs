//! Shared-memory rendezvous transport (spec.md §4.3/§6).
//!
//! A fixed-size region whose first 64 bytes are the header slot and whose
//! remainder is the payload area, synchronized by a pair of binary signals
//! that hand a single token back and forth (invariant 6: the client holds
//! the request token or the server holds the response token, never both).
//!
//! The region itself is reserved with raw `mmap`/`munmap`, the same
//! primitive `filemap::MappedFile` uses for its much larger page-list
//! mapping; the two signals are condvar-based binary latches standing in
//! for the named kernel events a cross-process deployment would use
//! (DESIGN.md records this simplification).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::ProxyError;
use crate::wire::*;

pub const HEADER_SLOT_SIZE: usize = 64;

const SIGNAL_POLL_SLICE: Duration = Duration::from_millis(100);

/// A single-owner binary latch: `signal()` sets it and wakes one waiter,
/// `wait()` blocks until set then clears it atomically (the token transfer
/// spec.md §4.3 describes as a ping-pong).
#[derive(Debug, Default)]
pub struct BinarySignal {
    set: Mutex<bool>,
    cv: Condvar,
}

impl BinarySignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        let mut set = self.set.lock().unwrap();
        *set = true;
        self.cv.notify_one();
    }

    pub fn is_set(&self) -> bool {
        *self.set.lock().unwrap()
    }

    /// Blocks until set (consuming the token) or `cancel` fires, whichever
    /// is first, polling `cancel` at `SIGNAL_POLL_SLICE` granularity.
    pub fn wait_or_cancel(&self, cancel: &CancelToken) -> Result<(), ProxyError> {
        let mut set = self.set.lock().unwrap();
        loop {
            if *set {
                *set = false;
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(ProxyError::Cancelled);
            }
            let (guard, _timeout) = self.cv.wait_timeout(set, SIGNAL_POLL_SLICE).unwrap();
            set = guard;
        }
    }
}

/// Owns the mmap'd region backing a shared-memory proxy session. Reserved
/// via anonymous `mmap` the way `filemap::MappedFile::new` reserves its
/// address range, but sized once up front since the payload area never
/// grows after the session is established.
struct ShmRegion {
    base: *mut u8,
    capacity: usize,
}

unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    fn new(payload_capacity: usize) -> std::io::Result<Self> {
        let capacity = HEADER_SLOT_SIZE + payload_capacity;
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_SHARED,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self { base: base as *mut u8, capacity })
    }

    fn header_mut(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.base, HEADER_SLOT_SIZE) }
    }

    fn payload_mut(&self, len: usize) -> &mut [u8] {
        assert!(HEADER_SLOT_SIZE + len <= self.capacity);
        unsafe { std::slice::from_raw_parts_mut(self.base.add(HEADER_SLOT_SIZE), len) }
    }

    fn payload_capacity(&self) -> usize {
        self.capacity - HEADER_SLOT_SIZE
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.capacity);
        }
    }
}

/// The pair of signals plus region shared by both the client and the
/// (in-process, for this crate) server side of a session.
pub struct ShmChannel {
    region: ShmRegion,
    request: BinarySignal,
    response: BinarySignal,
}

impl ShmChannel {
    pub fn new(payload_capacity: usize) -> std::io::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            region: ShmRegion::new(payload_capacity)?,
            request: BinarySignal::new(),
            response: BinarySignal::new(),
        }))
    }

    pub fn payload_capacity(&self) -> usize {
        self.region.payload_capacity()
    }

    pub fn request_signal(&self) -> &BinarySignal {
        &self.request
    }

    pub fn response_signal(&self) -> &BinarySignal {
        &self.response
    }
}

/// Client-side driver of the ping-pong protocol (spec.md §4.3 "Shared-memory
/// transport" steps 1-4).
pub struct ShmClient {
    channel: Arc<ShmChannel>,
    cancel: CancelToken,
}

impl ShmClient {
    pub fn new(channel: Arc<ShmChannel>, cancel: CancelToken) -> Self {
        Self { channel, cancel }
    }

    fn round_trip(&mut self, header: &[u8], payload: &[u8]) -> Result<(), ProxyError> {
        if HEADER_SLOT_SIZE < header.len() {
            return Err(ProxyError::Protocol("header larger than header slot".into()));
        }
        if payload.len() > self.channel.payload_capacity() {
            return Err(ProxyError::Protocol(format!(
                "payload {} exceeds configured capacity {}",
                payload.len(),
                self.channel.payload_capacity()
            )));
        }

        self.channel.region.header_mut()[..header.len()].copy_from_slice(header);
        self.channel.region.payload_mut(payload.len()).copy_from_slice(payload);

        self.channel.request.signal();
        self.channel.response.wait_or_cancel(&self.cancel)
    }

    pub fn info(&mut self, authoritative_size: Option<u64>) -> Result<InfoResponse, ProxyError> {
        let req = MessageHeader { code: MSG_INFO.into() };
        self.round_trip(bytemuck::bytes_of(&req), &[])?;

        let raw = self.channel.region.header_mut();
        let resp: InfoResponse = *bytemuck::from_bytes(&raw[..std::mem::size_of::<InfoResponse>()]);

        let alignment = resp.req_alignment.get();
        if alignment.wrapping_sub(1) > MAX_ALIGNMENT_MASK {
            return Err(ProxyError::UnsupportedAlignment(alignment));
        }
        if resp.file_size.get() == 0 && authoritative_size.is_none() {
            return Err(ProxyError::ZeroFileSize);
        }
        Ok(resp)
    }

    pub fn read(&mut self, offset: u64, length: u64, out: &mut [u8]) -> Result<usize, ProxyError> {
        let req = MessageHeader { code: MSG_READ.into() };
        let tail = ReadRequestTail { offset: offset.into(), length: length.into() };
        let mut header_buf = [0u8; std::mem::size_of::<MessageHeader>() + std::mem::size_of::<ReadRequestTail>()];
        header_buf[..std::mem::size_of::<MessageHeader>()].copy_from_slice(bytemuck::bytes_of(&req));
        header_buf[std::mem::size_of::<MessageHeader>()..].copy_from_slice(bytemuck::bytes_of(&tail));

        self.round_trip(&header_buf, &[])?;

        let raw = self.channel.region.header_mut();
        let header: ReadResponseHeader = *bytemuck::from_bytes(&raw[..std::mem::size_of::<ReadResponseHeader>()]);
        if header.errno.get() != 0 {
            return Err(ProxyError::Protocol(format!("proxy READ failed with errno {}", header.errno.get())));
        }

        let resp_len = header.length.get() as usize;
        if resp_len > out.len() || resp_len > self.channel.payload_capacity() {
            return Err(ProxyError::Protocol("READ response length exceeds capacity".into()));
        }
        out[..resp_len].copy_from_slice(self.channel.region.payload_mut(resp_len));
        Ok(resp_len)
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<usize, ProxyError> {
        let req = MessageHeader { code: MSG_WRITE.into() };
        let tail = WriteRequestTail { offset: offset.into(), length: (data.len() as u64).into() };
        let mut header_buf = [0u8; std::mem::size_of::<MessageHeader>() + std::mem::size_of::<WriteRequestTail>()];
        header_buf[..std::mem::size_of::<MessageHeader>()].copy_from_slice(bytemuck::bytes_of(&req));
        header_buf[std::mem::size_of::<MessageHeader>()..].copy_from_slice(bytemuck::bytes_of(&tail));

        self.round_trip(&header_buf, data)?;

        let raw = self.channel.region.header_mut();
        let header: WriteResponseHeader = *bytemuck::from_bytes(&raw[..std::mem::size_of::<WriteResponseHeader>()]);
        if header.errno.get() != 0 {
            return Err(ProxyError::Protocol(format!("proxy WRITE failed with errno {}", header.errno.get())));
        }
        Ok(header.length.get() as usize)
    }
}

/// Minimal in-process stand-in for the external proxy server, used by tests
/// to drive the other half of the ping-pong and to assert the token-holding
/// invariant from spec.md §4.3/invariant 6.
pub struct ShmServerHandle {
    channel: Arc<ShmChannel>,
    serving: Arc<AtomicBool>,
}

impl ShmServerHandle {
    pub fn spawn_echo_info(channel: Arc<ShmChannel>, file_size: u64, req_alignment: u64) -> Self {
        let serving = Arc::new(AtomicBool::new(true));
        let serving_clone = serving.clone();
        let chan = channel.clone();
        std::thread::spawn(move || {
            let cancel = CancelToken::new();
            while serving_clone.load(Ordering::SeqCst) {
                if chan.request.wait_or_cancel(&cancel).is_err() {
                    break;
                }
                let resp = InfoResponse {
                    file_size: file_size.into(),
                    req_alignment: req_alignment.into(),
                    flags: 0u64.into(),
                };
                chan.region.header_mut()[..std::mem::size_of::<InfoResponse>()]
                    .copy_from_slice(bytemuck::bytes_of(&resp));
                chan.response.signal();
            }
        });
        Self { channel, serving }
    }

    pub fn stop(self) {
        self.serving.store(false, Ordering::SeqCst);
        self.channel.request.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_round_trip_and_token_alternation() {
        let channel = ShmChannel::new(1024 * 1024).unwrap();
        let server = ShmServerHandle::spawn_echo_info(channel.clone(), 4096 * 1000, 512);

        let mut client = ShmClient::new(channel.clone(), CancelToken::new());
        let resp = client.info(None).unwrap();
        assert_eq!(resp.req_alignment.get(), 512);

        // after a completed round trip neither side is left holding both
        // tokens: the request signal was consumed by the server, the
        // response signal was consumed by the client.
        assert!(!channel.request_signal().is_set());
        assert!(!channel.response_signal().is_set());

        server.stop();
    }
}
