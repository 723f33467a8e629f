//! Backing Store (C2), Request Dispatcher (C5), and Device Manager (C6):
//! the three components that own a live device's lifetime end to end, built
//! on top of `vb-geom`'s geometry resolution, `vb-proxy`'s wire client, and
//! `vb-winmap`'s sliding-window mapper.

pub mod autostart;
pub mod backing;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod manager;
pub mod request;

pub use backing::{BackingKind, BackingStore};
pub use device::{CreateRecord, DecodedFlags, DeviceKind, DeviceRecord, ProxyTransport, AUTO_DEVICE_NUMBER};
pub use dispatcher::{DispatcherHandle, SharedRecord, StopReason};
pub use error::{BackingError, ErrorKind, ManagerError};
pub use manager::{DeviceManager, DeviceSnapshot, DisallowedLetters, MAX_DEVICES};
pub use request::{Request, RequestKind, RequestOutcome};

/// Trait boundary for the host OS block-device framework (device naming,
/// mount-point management, IOCTL plumbing) — out of scope per spec.md §1.
/// This crate ships no implementation; a real driver shim would implement
/// it outside this workspace.
pub trait HostBinding {
    fn bind(&self, device_id: u32, mount_hint: Option<char>) -> Result<(), ErrorKind>;
    fn unbind(&self, device_id: u32);
}
