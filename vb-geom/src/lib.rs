//! Geometry Resolver (C1).
//!
//! Derives a disk geometry and media kind from a raw byte length and a
//! device-class hint. Pure and allocation-free: no I/O happens here, the
//! caller already knows the backing store's size.

use thiserror::Error;

/// Hint supplied by the caller about what kind of device this is meant to
/// emulate. `Auto` defers to extension/size sniffing (spec.md §4.1 rules 1-2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClassHint {
    Hd,
    Fd,
    Cd,
    Auto,
}

/// Coarse media classification carried alongside geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Fixed,
    Removable,
}

/// Resolved geometry. `cylinders_total_bytes` deliberately carries the full
/// byte length rather than a classical cylinder count — see the module-level
/// note below and spec.md Open Question 1. Callers that need classical CHS
/// cylinders must divide by `heads * sectors_per_track * bytes_per_sector`
/// themselves; this struct does not do it for them, to avoid silently
/// truncating the one field that is load-bearing for size reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// NOT a classical cylinder count: this is the total device size in
    /// bytes. The name is kept for wire compatibility with the ImDisk-style
    /// `CreateRecord.geometry.cylinders` field it mirrors (spec.md §6).
    pub cylinders_total_bytes: i64,
    pub heads: u32,
    pub sectors_per_track: u32,
    pub bytes_per_sector: u32,
    pub media_kind: MediaKind,
}

impl Geometry {
    /// Classical CHS cylinder count, recovered from the overloaded
    /// `cylinders_total_bytes` field.
    pub fn classical_cylinders(&self) -> u64 {
        let bytes_per_cylinder =
            self.heads as u64 * self.sectors_per_track as u64 * self.bytes_per_sector as u64;
        if bytes_per_cylinder == 0 {
            0
        } else {
            self.cylinders_total_bytes as u64 / bytes_per_cylinder
        }
    }
}

#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("total length must be non-negative")]
    NegativeLength,
}

struct FloppyRow {
    total_bytes: i64,
    heads: u32,
    sectors_per_track: u32,
    bytes_per_sector: u32,
}

/// Well-known floppy sizes, spec.md §4.1 rule 2. Values for 1440K/1680K/1722K
/// and the two UHD rows are taken verbatim from the ImDisk driver's own
/// `media_table` (82/80/80 cylinders at 21/21/18 sectors per track for the
/// 3.5" rows; 963 cylinders at 8/32 and 262 cylinders at 32/56 for the UHD
/// rows); the others follow the standard DOS floppy geometries.
const FLOPPY_TABLE: &[FloppyRow] = &[
    FloppyRow { total_bytes: 163_840, heads: 1, sectors_per_track: 8, bytes_per_sector: 512 }, // 160K
    FloppyRow { total_bytes: 184_320, heads: 1, sectors_per_track: 9, bytes_per_sector: 512 }, // 180K
    FloppyRow { total_bytes: 327_680, heads: 2, sectors_per_track: 8, bytes_per_sector: 512 }, // 320K
    FloppyRow { total_bytes: 368_640, heads: 2, sectors_per_track: 9, bytes_per_sector: 512 }, // 360K
    FloppyRow { total_bytes: 655_360, heads: 2, sectors_per_track: 8, bytes_per_sector: 512 }, // 640K
    FloppyRow { total_bytes: 737_280, heads: 2, sectors_per_track: 9, bytes_per_sector: 512 }, // 720K
    FloppyRow { total_bytes: 819_200, heads: 2, sectors_per_track: 10, bytes_per_sector: 512 }, // 820K
    FloppyRow { total_bytes: 1_228_800, heads: 2, sectors_per_track: 15, bytes_per_sector: 512 }, // 1200K
    FloppyRow { total_bytes: 1_474_560, heads: 2, sectors_per_track: 18, bytes_per_sector: 512 }, // 1440K
    FloppyRow { total_bytes: 1_720_320, heads: 2, sectors_per_track: 21, bytes_per_sector: 512 }, // 1680K
    FloppyRow { total_bytes: 1_763_328, heads: 2, sectors_per_track: 21, bytes_per_sector: 512 }, // 1722K
    FloppyRow { total_bytes: 2_949_120, heads: 2, sectors_per_track: 36, bytes_per_sector: 512 }, // 2880K
    FloppyRow { total_bytes: 126_222_336, heads: 8, sectors_per_track: 32, bytes_per_sector: 512 }, // 120M (LS-120)
    FloppyRow { total_bytes: 240_386_048, heads: 32, sectors_per_track: 56, bytes_per_sector: 512 }, // 240M (LS-240)
];

fn floppy_row_for(total_bytes: i64) -> Option<&'static FloppyRow> {
    FLOPPY_TABLE.iter().find(|row| row.total_bytes == total_bytes)
}

fn extension_is_optical(extension: Option<&str>) -> bool {
    matches!(
        extension.map(|e| e.trim_start_matches('.').to_ascii_lowercase()).as_deref(),
        Some("iso") | Some("nrg") | Some("bin")
    )
}

/// Resolve a geometry for a device of `total_bytes` length under `hint`,
/// optionally informed by the backing file's extension. Implements spec.md
/// §4.1 rules 1-4 in order; rule 1 may upgrade `Auto` to `Cd` and force
/// read-only, which is reported back via `forced_read_only` since this
/// function has no device record to mutate directly.
pub fn resolve_geometry(
    total_bytes: i64,
    hint: DeviceClassHint,
    extension: Option<&str>,
) -> Result<(Geometry, bool), GeometryError> {
    if total_bytes < 0 {
        return Err(GeometryError::NegativeLength);
    }

    let mut class = hint;
    let mut forced_read_only = false;

    // Rule 1: extension sniffing promotes Auto to Cd.
    if class == DeviceClassHint::Auto && extension_is_optical(extension) {
        class = DeviceClassHint::Cd;
        forced_read_only = true;
    }

    // Rule 2: well-known floppy sizes promote Auto to Fd and return verbatim.
    if class == DeviceClassHint::Auto {
        if let Some(row) = floppy_row_for(total_bytes) {
            tracing::debug!(total_bytes, "resolved geometry via floppy size table");
            return Ok((
                Geometry {
                    cylinders_total_bytes: total_bytes,
                    heads: row.heads,
                    sectors_per_track: row.sectors_per_track,
                    bytes_per_sector: row.bytes_per_sector,
                    media_kind: MediaKind::Removable,
                },
                forced_read_only,
            ));
        }
    }

    let geometry = match class {
        DeviceClassHint::Cd => resolve_cd_geometry(total_bytes),
        DeviceClassHint::Fd => {
            // An explicit Fd hint that misses the table still gets FD-shaped
            // defaults: single platter worth of sectors, removable media.
            Geometry {
                cylinders_total_bytes: total_bytes,
                heads: 2,
                sectors_per_track: 18,
                bytes_per_sector: 512,
                media_kind: MediaKind::Removable,
            }
        }
        DeviceClassHint::Hd | DeviceClassHint::Auto => resolve_hd_geometry(total_bytes),
    };

    Ok((geometry, forced_read_only))
}

fn resolve_cd_geometry(total_bytes: i64) -> Geometry {
    let bytes_per_sector: u32 = 2048;
    let sectors_per_track: u32 = if total_bytes % 32 == 0 { 32 } else { 1 };
    let classical_cylinders = if sectors_per_track == 0 {
        0
    } else {
        total_bytes as u64 / (sectors_per_track as u64 * bytes_per_sector as u64)
    };
    let heads: u32 = if classical_cylinders % 64 == 0 { 64 } else { 1 };

    Geometry {
        cylinders_total_bytes: total_bytes,
        heads,
        sectors_per_track,
        bytes_per_sector,
        media_kind: MediaKind::Removable,
    }
}

fn resolve_hd_geometry(total_bytes: i64) -> Geometry {
    let bytes_per_sector: u32 = 512;
    let sectors_per_track: u32 = 63;

    // Largest power-of-two heads <= 128 such that the classical cylinder
    // count is >= 1, with a special case bumping to 255 heads once the
    // resulting cylinder count under prior choices would exceed 130,560.
    let mut heads: u32 = 128;
    while heads > 1 {
        let bytes_per_cylinder = heads as u64 * sectors_per_track as u64 * bytes_per_sector as u64;
        let cylinders = (total_bytes as u64) / bytes_per_cylinder.max(1);
        if cylinders >= 1 {
            break;
        }
        heads /= 2;
    }

    let bytes_per_cylinder_128 = 128u64 * sectors_per_track as u64 * bytes_per_sector as u64;
    let cylinders_at_128 = (total_bytes as u64) / bytes_per_cylinder_128.max(1);
    if cylinders_at_128 >= 130_560 {
        heads = 255;
    }

    Geometry {
        cylinders_total_bytes: total_bytes,
        heads,
        sectors_per_track,
        bytes_per_sector,
        media_kind: MediaKind::Fixed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floppy_1_44m_auto() {
        let (geom, ro) = resolve_geometry(1_474_560, DeviceClassHint::Auto, None).unwrap();
        assert_eq!(geom.heads, 2);
        assert_eq!(geom.sectors_per_track, 18);
        assert_eq!(geom.bytes_per_sector, 512);
        assert_eq!(geom.media_kind, MediaKind::Removable);
        assert!(!ro);
    }

    #[test]
    fn uhd_floppy_sizes_resolve_to_integer_cylinders() {
        let (geom_120m, _) = resolve_geometry(126_222_336, DeviceClassHint::Auto, None).unwrap();
        assert_eq!(geom_120m.heads, 8);
        assert_eq!(geom_120m.sectors_per_track, 32);
        assert_eq!(geom_120m.classical_cylinders(), 963);

        let (geom_240m, _) = resolve_geometry(240_386_048, DeviceClassHint::Auto, None).unwrap();
        assert_eq!(geom_240m.heads, 32);
        assert_eq!(geom_240m.sectors_per_track, 56);
        assert_eq!(geom_240m.classical_cylinders(), 262);
    }

    #[test]
    fn iso_extension_forces_cd_and_read_only() {
        let (geom, ro) = resolve_geometry(681_984_000, DeviceClassHint::Auto, Some("iso")).unwrap();
        assert!(ro);
        assert_eq!(geom.bytes_per_sector, 2048);
        assert_eq!(geom.media_kind, MediaKind::Removable);
    }

    #[test]
    fn hd_defaults_are_fixed_media() {
        let (geom, ro) = resolve_geometry(10 * 1024 * 1024 * 1024, DeviceClassHint::Hd, None).unwrap();
        assert!(!ro);
        assert_eq!(geom.media_kind, MediaKind::Fixed);
        assert_eq!(geom.bytes_per_sector, 512);
        assert_eq!(geom.sectors_per_track, 63);
    }

    #[test]
    fn negative_length_rejected() {
        assert!(matches!(
            resolve_geometry(-1, DeviceClassHint::Hd, None),
            Err(GeometryError::NegativeLength)
        ));
    }

    #[test]
    fn classical_cylinders_recovers_chs_count() {
        let (geom, _) = resolve_geometry(1_474_560, DeviceClassHint::Auto, None).unwrap();
        assert_eq!(geom.classical_cylinders(), 80);
    }
}
