//! Sliding-Window Mapper (C4).
//!
//! Maintains a bounded, double-sized window over a much larger page-list
//! allocation, remapping on demand when a request crosses the current
//! window (spec.md §4.4). Grounded on `filemap::MappedFile`'s
//! reserve-then-`mmap`/`munmap` discipline, generalized from "map the whole
//! file once and never unmap" to "map and unmap a sliding slice", since the
//! paged-memory backing can vastly exceed any single window.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;

use thiserror::Error;

/// Default window size: 16 MiB, spec.md §4.4.
pub const DEFAULT_WINDOW: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum WindowError {
    #[error("requested length {0} exceeds the window size")]
    InvalidParameter(usize),
    #[error("insufficient resources to map a window")]
    InsufficientResources,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The backing allocation: an anonymous, resizable file-like object. Backed
/// by `memfd_create` on Linux and an unlinked `tempfile` elsewhere, the way
/// the teacher's `Cargo.toml` splits macOS- vs. Linux-specific dependencies
/// for the same underlying concern (native region reservation).
pub struct PageListAllocation {
    file: File,
    len: u64,
}

impl PageListAllocation {
    pub fn new(len: u64) -> Result<Self, WindowError> {
        let file = create_anonymous_file()?;
        file.set_len(len)?;
        Ok(Self { file, len })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.file.as_raw_fd()
    }

    /// Grows by allocating a new backing file, copying the live content
    /// across, and returning the replacement. The caller (the dispatcher's
    /// Grow handler) is responsible for atomically swapping it in and
    /// freeing the old allocation only after the swap succeeds, so a
    /// mid-copy failure never corrupts the device that's still serving
    /// requests on the old allocation.
    pub fn grown_copy(&mut self, new_len: u64) -> Result<Self, WindowError> {
        if new_len < self.len {
            return Err(WindowError::InvalidParameter(new_len as usize));
        }
        let mut replacement = Self::new(new_len)?;

        self.file.seek(SeekFrom::Start(0))?;
        replacement.file.seek(SeekFrom::Start(0))?;
        let mut buf = vec![0u8; 4 * 1024 * 1024];
        let mut remaining = self.len;
        while remaining > 0 {
            let chunk = remaining.min(buf.len() as u64) as usize;
            self.file.read_exact(&mut buf[..chunk])?;
            replacement.file.write_all(&buf[..chunk])?;
            remaining -= chunk as u64;
        }
        Ok(replacement)
    }
}

#[cfg(target_os = "linux")]
fn create_anonymous_file() -> std::io::Result<File> {
    use std::ffi::CString;
    let name = CString::new("vblock-winmap").unwrap();
    let fd = unsafe { libc::memfd_create(name.as_ptr(), 0) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { <File as std::os::fd::FromRawFd>::from_raw_fd(fd) })
}

#[cfg(not(target_os = "linux"))]
fn create_anonymous_file() -> std::io::Result<File> {
    tempfile::tempfile()
}

struct MappedView {
    ptr: *mut u8,
    len: usize,
    base_offset: u64,
}

unsafe impl Send for MappedView {}

impl Drop for MappedView {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.len);
            }
        }
    }
}

/// The live `(base_offset, ptr, len)` triple described in spec.md §3: a
/// double-window view onto `PageListAllocation`, remapped on demand.
pub struct SlidingWindow {
    window: usize,
    current: Option<MappedView>,
}

impl SlidingWindow {
    pub fn new(window: usize) -> Self {
        Self { window, current: None }
    }

    pub fn with_default_window() -> Self {
        Self::new(DEFAULT_WINDOW)
    }

    pub fn window_size(&self) -> usize {
        self.window
    }

    fn window_base(&self, offset: u64) -> u64 {
        offset & !((self.window as u64) - 1)
    }

    fn covers(&self, offset: u64, len: usize) -> bool {
        match &self.current {
            Some(view) => {
                offset >= view.base_offset
                    && offset - view.base_offset + len as u64 <= view.len as u64
            }
            None => false,
        }
    }

    /// Brings `byte_offset` into view, remapping if the current window
    /// doesn't cover it, and returns a pointer already advanced to
    /// `byte_offset` plus the number of bytes usable from there before the
    /// window ends.
    pub fn bring_into_view(
        &mut self,
        alloc: &PageListAllocation,
        byte_offset: u64,
        requested_len: usize,
    ) -> Result<(*mut u8, usize), WindowError> {
        if requested_len > self.window {
            return Err(WindowError::InvalidParameter(requested_len));
        }

        if !self.covers(byte_offset, requested_len) {
            self.remap(alloc, byte_offset)?;
        }

        let view = self.current.as_ref().expect("remap always installs a view");
        let delta = (byte_offset - view.base_offset) as usize;
        let ptr = unsafe { view.ptr.add(delta) };
        let usable = view.len - delta;
        Ok((ptr, usable))
    }

    fn remap(&mut self, alloc: &PageListAllocation, byte_offset: u64) -> Result<(), WindowError> {
        let base = self.window_base(byte_offset);
        let double_window = 2 * self.window as u64;
        let remaining = alloc.len().saturating_sub(base);
        let map_len = double_window.min(remaining) as usize;

        // Tear down the old view before mapping a new one: only one window
        // may be live at a time (spec.md §4.4).
        self.current = None;

        match self.map_at(alloc, base, map_len) {
            Ok(view) => {
                self.current = Some(view);
                Ok(())
            }
            Err(WindowError::InsufficientResources) if self.window > 4096 => {
                tracing::warn!(window = self.window, "window map failed, halving and retrying once");
                self.window /= 2;
                let base = self.window_base(byte_offset);
                let double_window = 2 * self.window as u64;
                let remaining = alloc.len().saturating_sub(base);
                let map_len = double_window.min(remaining) as usize;
                let view = self.map_at(alloc, base, map_len)?;
                self.current = Some(view);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn map_at(&self, alloc: &PageListAllocation, base: u64, len: usize) -> Result<MappedView, WindowError> {
        if len == 0 {
            return Ok(MappedView { ptr: std::ptr::null_mut(), len: 0, base_offset: base });
        }
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                alloc.as_raw_fd(),
                base as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOMEM) {
                return Err(WindowError::InsufficientResources);
            }
            return Err(WindowError::Io(err));
        }
        Ok(MappedView { ptr: ptr as *mut u8, len, base_offset: base })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_covers_offset_after_remap() {
        let alloc = PageListAllocation::new(64 * 1024 * 1024).unwrap();
        let mut window = SlidingWindow::new(1024 * 1024);

        let (ptr, usable) = window.bring_into_view(&alloc, 5 * 1024 * 1024 + 100, 4096).unwrap();
        assert!(!ptr.is_null());
        assert!(usable >= 4096);
    }

    #[test]
    fn oversized_request_is_rejected() {
        let alloc = PageListAllocation::new(64 * 1024 * 1024).unwrap();
        let mut window = SlidingWindow::new(1024 * 1024);
        let err = window.bring_into_view(&alloc, 0, 2 * 1024 * 1024).unwrap_err();
        assert!(matches!(err, WindowError::InvalidParameter(_)));
    }

    #[test]
    fn grow_preserves_content() {
        let mut alloc = PageListAllocation::new(16 * 1024 * 1024).unwrap();
        let mut window = SlidingWindow::new(1024 * 1024);

        let write_offset = 15 * 1024 * 1024;
        let (ptr, usable) = window.bring_into_view(&alloc, write_offset, 1024 * 1024).unwrap();
        assert!(usable >= 1024 * 1024);
        unsafe {
            std::ptr::write_bytes(ptr, 0xAA, 1024 * 1024);
        }
        drop(window);

        alloc = alloc.grown_copy(32 * 1024 * 1024).unwrap();

        let mut window = SlidingWindow::new(1024 * 1024);
        let (ptr, _) = window.bring_into_view(&alloc, write_offset, 4096).unwrap();
        let slice = unsafe { std::slice::from_raw_parts(ptr, 4096) };
        assert!(slice.iter().all(|&b| b == 0xAA));
    }
}
