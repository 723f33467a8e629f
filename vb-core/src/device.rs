//! Device data model (spec.md §3) and the `CreateRecord` wire format
//! (spec.md §6). Bit layout mirrors the ImDisk driver's own flag word so a
//! `CreateRecord` round-trips through the wire unchanged; see
//! `original_source/inc/imdisk.h` for the constants this module's
//! `decode_flags`/`encode_flags` are grounded on.

use bitflags::bitflags;

use crate::backing::BackingKind;
use vb_geom::{Geometry, MediaKind};

bitflags! {
    /// The single-bit flags in `CreateRecord.flags` (spec.md §6).
    #[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
    pub struct DeviceFlags: u32 {
        const READ_ONLY       = 0x0000_0001;
        const REMOVABLE       = 0x0000_0002;
        const MODIFIED        = 0x0001_0000;
        const FILETYPE_AWEALLOC = 0x0002_0000;
    }
}

const DEVICE_KIND_MASK: u32 = 0x0000_00F0;
const BACKING_KIND_MASK: u32 = 0x0000_0F00;
const PROXY_TRANSPORT_MASK: u32 = 0x0000_F000;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Hd,
    Fd,
    Cd,
}

impl DeviceKind {
    fn from_bits(bits: u32) -> Option<Self> {
        match bits & DEVICE_KIND_MASK {
            0x0000_0010 => Some(DeviceKind::Hd),
            0x0000_0020 => Some(DeviceKind::Fd),
            0x0000_0030 => Some(DeviceKind::Cd),
            _ => None,
        }
    }

    fn to_bits(self) -> u32 {
        match self {
            DeviceKind::Hd => 0x0000_0010,
            DeviceKind::Fd => 0x0000_0020,
            DeviceKind::Cd => 0x0000_0030,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ProxyTransport {
    Direct,
    Stream,
    Shm,
}

impl ProxyTransport {
    fn from_bits(bits: u32) -> Self {
        match bits & PROXY_TRANSPORT_MASK {
            0x0000_1000 => ProxyTransport::Stream,
            0x0000_2000 => ProxyTransport::Shm,
            _ => ProxyTransport::Direct,
        }
    }

    fn to_bits(self) -> u32 {
        match self {
            ProxyTransport::Direct => 0x0000_0000,
            ProxyTransport::Stream => 0x0000_1000,
            ProxyTransport::Shm => 0x0000_2000,
        }
    }
}

/// Decoded view of a `CreateRecord.flags` word.
#[derive(Debug, Clone, Copy)]
pub struct DecodedFlags {
    pub read_only: bool,
    pub removable: bool,
    pub modified: bool,
    pub device_kind: DeviceKind,
    pub backing_kind: BackingKind,
    pub proxy_transport: ProxyTransport,
}

pub fn decode_flags(bits: u32) -> DecodedFlags {
    let flags = DeviceFlags::from_bits_truncate(bits);
    DecodedFlags {
        read_only: flags.contains(DeviceFlags::READ_ONLY),
        removable: flags.contains(DeviceFlags::REMOVABLE),
        modified: flags.contains(DeviceFlags::MODIFIED),
        device_kind: DeviceKind::from_bits(bits).unwrap_or(DeviceKind::Hd),
        backing_kind: match bits & BACKING_KIND_MASK {
            0x0000_0200 => BackingKind::Anon,
            0x0000_0300 => BackingKind::Proxy,
            _ => BackingKind::File,
        },
        proxy_transport: ProxyTransport::from_bits(bits),
    }
}

pub fn encode_flags(decoded: &DecodedFlags) -> u32 {
    let mut bits = 0u32;
    if decoded.read_only {
        bits |= DeviceFlags::READ_ONLY.bits();
    }
    if decoded.removable {
        bits |= DeviceFlags::REMOVABLE.bits();
    }
    if decoded.modified {
        bits |= DeviceFlags::MODIFIED.bits();
    }
    bits |= decoded.device_kind.to_bits();
    bits |= match decoded.backing_kind {
        BackingKind::File => 0x0000_0100,
        BackingKind::Anon => 0x0000_0200,
        BackingKind::Proxy => 0x0000_0300,
    };
    bits |= decoded.proxy_transport.to_bits();
    bits
}

/// Sentinel device number meaning "pick the lowest free id" (spec.md §6).
pub const AUTO_DEVICE_NUMBER: u32 = 0xFFFF_FFFF;

/// The `CreateRecord` wire structure (spec.md §6), minus its trailing
/// variable-length `name` bytes which callers keep as an owned `String`.
#[derive(Debug, Clone)]
pub struct CreateRecord {
    pub device_number: u32,
    pub geometry: Geometry,
    pub image_offset: i64,
    pub flags: DecodedFlags,
    pub drive_letter: Option<char>,
    pub name: String,
}

/// Live, in-memory device record (spec.md §3). Mutated only by the owning
/// dispatcher thread once created; the manager only reads the bitmap/id
/// half of the device's identity.
pub struct DeviceRecord {
    pub id: u32,
    pub geometry: Geometry,
    pub image_offset: i64,
    pub read_only: bool,
    pub removable: bool,
    pub device_kind: DeviceKind,
    pub backing_kind: BackingKind,
    pub proxy_transport: ProxyTransport,
    pub mount_hint: Option<char>,
    pub modified: bool,
    pub special_file_uses: u32,
    pub media_change_count: u64,
    /// External handles currently open on this device (spec.md §3
    /// "Lifecycle", §4.5 "Shutdown"). `remove_device` without `force` waits
    /// for this to fall to zero before tearing the device down.
    pub ref_count: u32,
}

impl DeviceRecord {
    pub fn from_create_record(id: u32, record: &CreateRecord) -> Self {
        Self {
            id,
            geometry: record.geometry,
            image_offset: record.image_offset,
            read_only: record.flags.read_only,
            removable: record.flags.removable,
            device_kind: record.flags.device_kind,
            backing_kind: record.flags.backing_kind,
            proxy_transport: record.flags.proxy_transport,
            mount_hint: record.drive_letter,
            modified: record.flags.modified,
            special_file_uses: 0,
            media_change_count: 0,
            ref_count: 0,
        }
    }

    /// A device pinned for paging/hibernation/dump use cannot be removed
    /// and cannot be flipped read-only (spec.md §4.6, GLOSSARY "Special-file
    /// counter").
    pub fn is_pinned(&self) -> bool {
        self.special_file_uses > 0
    }

    pub fn media_kind(&self) -> MediaKind {
        self.geometry.media_kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_round_trip() {
        let decoded = DecodedFlags {
            read_only: true,
            removable: true,
            modified: false,
            device_kind: DeviceKind::Fd,
            backing_kind: BackingKind::Anon,
            proxy_transport: ProxyTransport::Direct,
        };
        let bits = encode_flags(&decoded);
        let back = decode_flags(bits);
        assert!(back.read_only);
        assert!(back.removable);
        assert_eq!(back.device_kind, DeviceKind::Fd);
        assert_eq!(back.backing_kind, BackingKind::Anon);
    }
}
