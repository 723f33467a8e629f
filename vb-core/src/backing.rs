//! Backing Store (C2, spec.md §4.2): a small tagged union over the four
//! ways a device's bytes can actually be stored. Each variant owns exactly
//! the resources its kind needs and exposes the same `size`/`read`/`write`/
//! `alignment`/`close` surface, so the dispatcher (C5) never has to match on
//! backing kind outside this module.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::BackingError;
use vb_proxy::{CancelToken, ProxyClient, ShmClient, StreamClient};
use vb_winmap::{PageListAllocation, SlidingWindow};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BackingKind {
    File,
    Anon,
    Proxy,
}

/// A regular file or block device opened directly (spec.md §4.2, "file
/// image"). `owns_handle` mirrors ImDisk's distinction between a file this
/// device opened itself and a handle inherited from the create call; only
/// the former is closed on device removal.
struct FileBacking {
    handle: File,
    len: u64,
    owns_handle: bool,
}

/// An anonymous, paging-file-backed image (spec.md §4.2, "VM image"):
/// content lives entirely in a sliding-window-mapped allocation with no
/// durable file behind it.
struct AnonBacking {
    alloc: PageListAllocation,
    window: SlidingWindow,
}

/// A proxy-served image (spec.md §4.2 and §4.3): every read/write is a
/// round trip through whichever transport the proxy client wraps. `cancel`
/// is the same token the client was built with, kept here so the
/// dispatcher can interrupt a blocking read/write in progress from outside
/// the worker thread (spec.md §4.3 "Cancellation").
struct ProxyBacking {
    client: Box<dyn ProxyClient + Send>,
    len: u64,
    alignment: u64,
    cancel: CancelToken,
}

pub enum BackingStore {
    File(FileBacking),
    Anon(AnonBacking),
    Proxy(ProxyBacking),
}

impl BackingStore {
    pub fn open_file(handle: File, owns_handle: bool) -> Result<Self, BackingError> {
        let len = handle.metadata()?.len();
        Ok(BackingStore::File(FileBacking { handle, len, owns_handle }))
    }

    pub fn open_anon(len: u64) -> Result<Self, BackingError> {
        let alloc = PageListAllocation::new(len)?;
        Ok(BackingStore::Anon(AnonBacking {
            alloc,
            window: SlidingWindow::with_default_window(),
        }))
    }

    /// `cancel` must be the same token `client` was constructed with
    /// (e.g. `StreamClient::new(stream, cancel.clone())`), so that
    /// cancelling it here also unblocks the client's in-flight reads/writes.
    pub fn open_proxy_stream<S>(
        client: StreamClient<S>,
        authoritative_size: Option<u64>,
        cancel: CancelToken,
    ) -> Result<Self, BackingError>
    where
        S: Read + Write + std::os::fd::AsRawFd + Send + 'static,
    {
        let mut client = client;
        let info = client.info(authoritative_size)?;
        Ok(BackingStore::Proxy(ProxyBacking {
            client: Box::new(client),
            len: info.file_size.get(),
            alignment: info.req_alignment.get(),
            cancel,
        }))
    }

    /// See `open_proxy_stream` for the `cancel` contract.
    pub fn open_proxy_shm(
        client: ShmClient,
        authoritative_size: Option<u64>,
        cancel: CancelToken,
    ) -> Result<Self, BackingError> {
        let mut client = client;
        let info = client.info(authoritative_size)?;
        Ok(BackingStore::Proxy(ProxyBacking {
            client: Box::new(client),
            len: info.file_size.get(),
            alignment: info.req_alignment.get(),
            cancel,
        }))
    }

    /// The proxy backing's cancellation token, if this is a proxy-backed
    /// device. The dispatcher clones this out at spawn time so
    /// `request_terminate` can interrupt a blocking read/write in progress
    /// (spec.md §4.3 "Cancellation") without needing access to the backing
    /// store itself, which the worker thread owns exclusively.
    pub fn proxy_cancel_token(&self) -> Option<CancelToken> {
        match self {
            BackingStore::Proxy(p) => Some(p.cancel.clone()),
            _ => None,
        }
    }

    pub fn kind(&self) -> BackingKind {
        match self {
            BackingStore::File(_) => BackingKind::File,
            BackingStore::Anon(_) => BackingKind::Anon,
            BackingStore::Proxy(_) => BackingKind::Proxy,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            BackingStore::File(f) => f.len,
            BackingStore::Anon(a) => a.alloc.len(),
            BackingStore::Proxy(p) => p.len,
        }
    }

    /// Required offset/length alignment for this backing, in bytes. File
    /// and anonymous backings have none beyond byte granularity; a proxy
    /// backing enforces whatever `INFO` reported (spec.md §4.3).
    pub fn alignment(&self) -> u64 {
        match self {
            BackingStore::File(_) | BackingStore::Anon(_) => 1,
            BackingStore::Proxy(p) => p.alignment,
        }
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<(), BackingError> {
        let end = offset.checked_add(len as u64).ok_or(BackingError::AccessDenied)?;
        if end > self.size() {
            return Err(BackingError::AccessDenied);
        }
        Ok(())
    }

    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), BackingError> {
        self.check_bounds(offset, buf.len())?;
        match self {
            BackingStore::File(f) => {
                f.handle.seek(SeekFrom::Start(offset))?;
                f.handle.read_exact(buf)?;
                Ok(())
            }
            BackingStore::Anon(a) => {
                let mut done = 0usize;
                while done < buf.len() {
                    let (ptr, usable) =
                        a.window.bring_into_view(&a.alloc, offset + done as u64, buf.len() - done)?;
                    let chunk = usable.min(buf.len() - done);
                    unsafe {
                        std::ptr::copy_nonoverlapping(ptr, buf[done..done + chunk].as_mut_ptr(), chunk);
                    }
                    done += chunk;
                }
                Ok(())
            }
            BackingStore::Proxy(p) => {
                let len = buf.len() as u64;
                p.client.read(offset, len, buf)?;
                Ok(())
            }
        }
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), BackingError> {
        self.check_bounds(offset, data.len())?;
        match self {
            BackingStore::File(f) => {
                f.handle.seek(SeekFrom::Start(offset))?;
                f.handle.write_all(data)?;
                Ok(())
            }
            BackingStore::Anon(a) => {
                let mut done = 0usize;
                while done < data.len() {
                    let (ptr, usable) =
                        a.window.bring_into_view(&a.alloc, offset + done as u64, data.len() - done)?;
                    let chunk = usable.min(data.len() - done);
                    unsafe {
                        std::ptr::copy_nonoverlapping(data[done..done + chunk].as_ptr(), ptr, chunk);
                    }
                    done += chunk;
                }
                Ok(())
            }
            BackingStore::Proxy(p) => {
                p.client.write(offset, data)?;
                Ok(())
            }
        }
    }

    /// Fills `[offset, offset+len)` with the format-tracks sentinel byte
    /// (spec.md §4.5, 0xF6) without an intermediate read.
    pub fn format_fill(&mut self, offset: u64, len: u64, fill: u8) -> Result<(), BackingError> {
        const CHUNK: usize = 64 * 1024;
        let buf = vec![fill; CHUNK.min(len as usize).max(1)];
        let mut remaining = len;
        let mut pos = offset;
        while remaining > 0 {
            let n = (remaining as usize).min(buf.len());
            self.write(pos, &buf[..n])?;
            pos += n as u64;
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Grows a file or anonymous backing in place (spec.md §4.6 "extend").
    /// Proxy backings cannot be grown locally; the server owns their size.
    pub fn extend(&mut self, new_len: u64) -> Result<(), BackingError> {
        match self {
            BackingStore::File(f) => {
                if new_len < f.len {
                    return Err(BackingError::WrongType);
                }
                f.handle.set_len(new_len)?;
                f.len = new_len;
                Ok(())
            }
            BackingStore::Anon(a) => {
                if new_len < a.alloc.len() {
                    return Err(BackingError::WrongType);
                }
                a.alloc = a.alloc.grown_copy(new_len)?;
                a.window = SlidingWindow::new(a.window.window_size());
                Ok(())
            }
            BackingStore::Proxy(_) => Err(BackingError::WrongType),
        }
    }

    pub fn close(self) {
        match self {
            BackingStore::File(f) => {
                if !f.owns_handle {
                    std::mem::forget(f.handle);
                }
            }
            BackingStore::Proxy(p) => {
                let _ = p.client.close();
            }
            BackingStore::Anon(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn file_backing_reads_back_what_it_writes() {
        let mut tmp = tempfile::tempfile().unwrap();
        tmp.write_all(&[0u8; 4096]).unwrap();
        let mut store = BackingStore::open_file(tmp, true).unwrap();
        store.write(100, b"hello").unwrap();
        let mut buf = [0u8; 5];
        store.read(100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn anon_backing_spans_window_boundaries() {
        let mut store = BackingStore::open_anon(4 * 1024 * 1024).unwrap();
        let data = vec![0x42u8; 2048];
        store.write(1024 * 1024 - 512, &data).unwrap();
        let mut back = vec![0u8; 2048];
        store.read(1024 * 1024 - 512, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn out_of_bounds_read_is_rejected() {
        let mut store = BackingStore::open_anon(4096).unwrap();
        let mut buf = [0u8; 16];
        assert!(store.read(4090, &mut buf).is_err());
    }

    #[test]
    fn extend_grows_anon_and_preserves_data() {
        let mut store = BackingStore::open_anon(1024 * 1024).unwrap();
        store.write(0, b"persisted").unwrap();
        store.extend(8 * 1024 * 1024).unwrap();
        assert_eq!(store.size(), 8 * 1024 * 1024);
        let mut buf = [0u8; 9];
        store.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"persisted");
    }
}
