//! Device Manager (C6, spec.md §4.6): owns the 64-entry device-id bitmap,
//! validates and spawns devices, and coordinates shutdown with the
//! dispatcher. Grounded on the teacher's connection-registry pattern (a
//! single long-lived manager value guarding a bitmap + id-to-handle map
//! behind one lock), generalized from "registry of active connections" to
//! "registry of active devices" — see spec.md §9's note on replacing global
//! mutable state with a manager value owned by the runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::backing::BackingStore;
use crate::device::{AUTO_DEVICE_NUMBER, CreateRecord, DeviceRecord};
use crate::dispatcher::{self, DispatcherHandle, SharedRecord, StopReason};
use crate::error::ManagerError;

pub const MAX_DEVICES: u32 = 64;

const PACKAGE_VERSION: u32 = 1;

struct ManagedDevice {
    handle: DispatcherHandle,
    record: SharedRecord,
}

/// The set of drive letters (`'A'..='Z'`) auto-selection must never hand
/// out, loaded from the persisted autostart config (spec.md §6
/// `DisallowedDriveLetters`).
#[derive(Debug, Default, Clone)]
pub struct DisallowedLetters(pub std::collections::HashSet<char>);

pub struct DeviceManager {
    bitmap: AtomicU64,
    devices: Mutex<HashMap<u32, ManagedDevice>>,
    disallowed_letters: RwLock<DisallowedLetters>,
}

/// A deep, consistent snapshot of one device's state, returned by
/// `query_device` (spec.md §6 `QUERY_DEVICE`).
pub struct DeviceSnapshot {
    pub id: u32,
    pub geometry: vb_geom::Geometry,
    pub image_offset: i64,
    pub read_only: bool,
    pub removable: bool,
    pub modified: bool,
    pub mount_hint: Option<char>,
    pub pinned: bool,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self {
            bitmap: AtomicU64::new(0),
            devices: Mutex::new(HashMap::new()),
            disallowed_letters: RwLock::new(DisallowedLetters::default()),
        }
    }

    pub fn set_disallowed_letters(&self, letters: DisallowedLetters) {
        *self.disallowed_letters.write() = letters;
    }

    pub fn query_version(&self) -> u32 {
        PACKAGE_VERSION
    }

    /// Bitmap of live device ids (spec.md §6 `QUERY_DRIVER`).
    pub fn query_driver(&self) -> u64 {
        self.bitmap.load(Ordering::SeqCst)
    }

    pub fn query_device(&self, id: u32) -> Result<DeviceSnapshot, ManagerError> {
        let devices = self.devices.lock();
        let managed = devices.get(&id).ok_or(crate::error::ErrorKind::NotFound)?;
        let record = managed.record.read();
        Ok(DeviceSnapshot {
            id,
            geometry: record.geometry,
            image_offset: record.image_offset,
            read_only: record.read_only,
            removable: record.removable,
            modified: record.modified,
            mount_hint: record.mount_hint,
            pinned: record.is_pinned(),
        })
    }

    fn allocate_id(&self, requested: u32) -> Result<u32, ManagerError> {
        loop {
            let current = self.bitmap.load(Ordering::SeqCst);
            let id = if requested == AUTO_DEVICE_NUMBER {
                let free = (!current).trailing_zeros();
                if free >= MAX_DEVICES {
                    return Err(ManagerError::TableFull);
                }
                free
            } else {
                if requested >= MAX_DEVICES {
                    return Err(crate::error::ErrorKind::InvalidParameter("device number out of range".into()).into());
                }
                if current & (1 << requested) != 0 {
                    return Err(crate::error::ErrorKind::ObjectNameCollision.into());
                }
                requested
            };
            let updated = current | (1 << id);
            if self
                .bitmap
                .compare_exchange(current, updated, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Ok(id);
            }
        }
    }

    fn free_id(&self, id: u32) {
        self.bitmap.fetch_and(!(1u64 << id), Ordering::SeqCst);
    }

    /// Validates a `CreateRecord`, allocates a device id, opens its backing
    /// store, and spawns the dispatcher thread. Blank names are only valid
    /// for a non-zero-size anonymous device (spec.md §4.6).
    pub fn create_device(
        &self,
        record: CreateRecord,
        backing: BackingStore,
    ) -> Result<u32, ManagerError> {
        self.validate_create(&record, &backing)?;

        let id = self.allocate_id(record.device_number)?;
        let device_record = Arc::new(RwLock::new(DeviceRecord::from_create_record(id, &record)));

        let handle = dispatcher::spawn(id, backing, device_record.clone());
        self.devices.lock().insert(id, ManagedDevice { handle, record: device_record });

        tracing::info!(device = id, name = %record.name, "device created");
        Ok(id)
    }

    fn validate_create(&self, record: &CreateRecord, backing: &BackingStore) -> Result<(), ManagerError> {
        use crate::error::ErrorKind;

        if record.name.is_empty() {
            let is_anon_with_size = matches!(backing, BackingStore::Anon(_)) && backing.size() > 0;
            if !is_anon_with_size {
                return Err(ErrorKind::InvalidParameter("blank name requires a sized anonymous device".into()).into());
            }
        }
        if !matches!(backing, BackingStore::File(_)) && backing.size() == 0 {
            return Err(ErrorKind::InvalidParameter("non-file backings require an explicit size".into()).into());
        }
        if let Some(letter) = record.drive_letter {
            if self.disallowed_letters.read().0.contains(&letter) {
                return Err(ErrorKind::AccessDenied.into());
            }
        }
        Ok(())
    }

    /// Removes a device, waiting (with exponential backoff, bounded) for its
    /// reference count to fall to zero unless `force` bypasses that wait
    /// (spec.md §4.5 "Shutdown", §4.6 `force_remove`).
    pub fn remove_device(&self, id: u32, force: bool) -> Result<StopReason, ManagerError> {
        let pinned = {
            let devices = self.devices.lock();
            let managed = devices.get(&id).ok_or(crate::error::ErrorKind::NotFound)?;
            managed.record.read().is_pinned()
        };
        if pinned && !force {
            return Err(crate::error::ErrorKind::AccessDenied.into());
        }
        if !force {
            self.wait_for_zero_references(id)?;
        }

        let mut managed = self
            .devices
            .lock()
            .remove(&id)
            .ok_or(crate::error::ErrorKind::NotFound)?;

        managed.handle.request_terminate();
        let reason = managed.handle.join();
        self.free_id(id);
        Ok(reason)
    }

    /// Polls `id`'s external reference count with bounded exponential
    /// backoff, returning once it reaches zero or failing with
    /// `AccessDenied` once the iteration budget is exhausted (spec.md §4.5
    /// "Shutdown": "A non-zero external reference count blocks destruction
    /// with an exponential-backoff polling wait up to a bounded number of
    /// iterations").
    fn wait_for_zero_references(&self, id: u32) -> Result<(), ManagerError> {
        const MAX_ITERATIONS: u32 = 10;
        const INITIAL_BACKOFF: Duration = Duration::from_millis(1);

        let mut backoff = INITIAL_BACKOFF;
        for _ in 0..MAX_ITERATIONS {
            let ref_count = {
                let devices = self.devices.lock();
                let managed = devices.get(&id).ok_or(crate::error::ErrorKind::NotFound)?;
                managed.record.read().ref_count
            };
            if ref_count == 0 {
                return Ok(());
            }
            std::thread::sleep(backoff);
            backoff *= 2;
        }

        let devices = self.devices.lock();
        let managed = devices.get(&id).ok_or(crate::error::ErrorKind::NotFound)?;
        if managed.record.read().ref_count == 0 {
            Ok(())
        } else {
            Err(crate::error::ErrorKind::AccessDenied.into())
        }
    }

    /// Applies a read-only/removable flag change, refusing to flip a
    /// special-file-pinned device to read-only (spec.md §4.6).
    pub fn set_flags(&self, id: u32, read_only: Option<bool>, removable: Option<bool>) -> Result<(), ManagerError> {
        let devices = self.devices.lock();
        let managed = devices.get(&id).ok_or(crate::error::ErrorKind::NotFound)?;
        let mut record = managed.record.write();

        if let Some(ro) = read_only {
            if ro && record.is_pinned() {
                return Err(crate::error::ErrorKind::AccessDenied.into());
            }
            record.read_only = ro;
        }
        if let Some(rem) = removable {
            record.removable = rem;
        }
        Ok(())
    }

    /// Enqueues a grow request on the owning dispatcher and waits for the
    /// completion (spec.md §4.6 `EXTEND`, §4.5 "Grow").
    pub fn extend(&self, id: u32, new_len: u64) -> Result<u64, ManagerError> {
        let sender = {
            let devices = self.devices.lock();
            let managed = devices.get(&id).ok_or(crate::error::ErrorKind::NotFound)?;
            managed.handle.requests.clone()
        };

        let (tx, rx) = crossbeam_channel::bounded(1);
        let req = crate::request::Request {
            kind: crate::request::RequestKind::Grow,
            offset: 0,
            length: new_len,
            payload: Vec::new(),
            completion: tx,
        };
        sender.send(req).map_err(|_| crate::error::ErrorKind::NotFound)?;

        match rx.recv() {
            Ok(crate::request::RequestOutcome::Grown(len)) => Ok(len),
            Ok(crate::request::RequestOutcome::Failed(kind)) => Err(kind.into()),
            _ => Err(crate::error::ErrorKind::InsufficientResources.into()),
        }
    }

    /// Privileged cross-context handle passing; not implemented by this
    /// user-space reimplementation (spec.md §4.6 notes it is "reserved").
    pub fn reference_handle(&self, _id: u32) -> Result<(), ManagerError> {
        Err(crate::error::ErrorKind::AccessDenied.into())
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{decode_flags, DecodedFlags, DeviceKind, ProxyTransport};
    use vb_geom::{Geometry, MediaKind};

    fn test_record(name: &str) -> CreateRecord {
        CreateRecord {
            device_number: AUTO_DEVICE_NUMBER,
            geometry: Geometry {
                cylinders_total_bytes: 1024 * 1024,
                heads: 4,
                sectors_per_track: 32,
                bytes_per_sector: 512,
                media_kind: MediaKind::Fixed,
            },
            image_offset: 0,
            flags: DecodedFlags {
                read_only: false,
                removable: false,
                modified: false,
                device_kind: DeviceKind::Hd,
                backing_kind: crate::backing::BackingKind::Anon,
                proxy_transport: ProxyTransport::Direct,
            },
            drive_letter: None,
            name: name.to_string(),
        }
    }

    #[test]
    fn create_then_query_then_remove() {
        let manager = DeviceManager::new();
        let record = test_record("disk0");
        let backing = BackingStore::open_anon(1024 * 1024).unwrap();

        let id = manager.create_device(record, backing).unwrap();
        assert_eq!(manager.query_driver() & (1 << id), 1 << id);

        let snapshot = manager.query_device(id).unwrap();
        assert_eq!(snapshot.id, id);
        assert!(!snapshot.read_only);

        manager.remove_device(id, false).unwrap();
        assert_eq!(manager.query_driver() & (1 << id), 0);
        assert!(manager.query_device(id).is_err());
    }

    #[test]
    fn blank_name_requires_sized_anon_backing() {
        let manager = DeviceManager::new();
        let mut record = test_record("");
        record.flags.backing_kind = crate::backing::BackingKind::Anon;
        let backing = BackingStore::open_anon(0).unwrap();
        assert!(manager.create_device(record, backing).is_err());
    }

    #[test]
    fn grow_updates_geometry() {
        let manager = DeviceManager::new();
        let record = test_record("growable");
        let backing = BackingStore::open_anon(1024 * 1024).unwrap();
        let id = manager.create_device(record, backing).unwrap();

        let new_len = manager.extend(id, 4 * 1024 * 1024).unwrap();
        assert_eq!(new_len, 4 * 1024 * 1024);
        assert_eq!(manager.query_device(id).unwrap().geometry.cylinders_total_bytes, 4 * 1024 * 1024);
    }

    #[test]
    fn decode_flags_smoke() {
        let bits = crate::device::encode_flags(&DecodedFlags {
            read_only: true,
            removable: false,
            modified: false,
            device_kind: DeviceKind::Cd,
            backing_kind: crate::backing::BackingKind::File,
            proxy_transport: ProxyTransport::Direct,
        });
        let decoded = decode_flags(bits);
        assert!(decoded.read_only);
        assert_eq!(decoded.device_kind, DeviceKind::Cd);
    }
}
