// FAT geometry planner
// Picks FAT width, cluster size, FAT length and alignment for a device size

use super::constants::*;
use super::layout::{FatLayout, FatType};
use bootforge_core::{DeviceInfo, FatOptions, PlanError};
use log::{debug, warn};

/// Legacy floppy formats recognised by size.
struct FloppyGeometry {
    kib: u64,
    sectors_per_track: u16,
    heads: u16,
    media: u8,
    sectors_per_cluster: u32,
    root_entries: u16,
}

const FLOPPY_GEOMETRIES: [FloppyGeometry; 5] = [
    FloppyGeometry { kib: 360, sectors_per_track: 9, heads: 2, media: 0xFD, sectors_per_cluster: 2, root_entries: 112 },
    FloppyGeometry { kib: 720, sectors_per_track: 9, heads: 2, media: 0xF9, sectors_per_cluster: 2, root_entries: 112 },
    FloppyGeometry { kib: 1200, sectors_per_track: 15, heads: 2, media: 0xF9, sectors_per_cluster: 1, root_entries: 224 },
    FloppyGeometry { kib: 1440, sectors_per_track: 18, heads: 2, media: 0xF0, sectors_per_cluster: 1, root_entries: 224 },
    FloppyGeometry { kib: 2880, sectors_per_track: 36, heads: 2, media: 0xF0, sectors_per_cluster: 2, root_entries: 224 },
];

/// Default FAT32 cluster size in 512-byte sectors. Bracket bounds are
/// decimal and exclusive, so exactly 8 GB already gets 16 sectors.
fn fat32_cluster_sectors(size_bytes: u64) -> u32 {
    const MB: u64 = 1_000_000;
    const GB: u64 = 1_000_000_000;
    if size_bytes < 260 * MB {
        1
    } else if size_bytes < 8 * GB {
        8
    } else if size_bytes < 16 * GB {
        16
    } else if size_bytes < 32 * GB {
        32
    } else {
        64
    }
}

/// Everything the planner may be told. Only size and sector size are
/// mandatory; the rest is derived when left unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRequest {
    pub size_bytes: u64,
    pub sector_size: u32,
    pub fat_bits: Option<u8>,
    pub sectors_per_cluster: Option<u8>,
    pub num_fats: u8,
    pub root_dir_entries: Option<u16>,
    pub align: bool,
    pub reserved_sectors: Option<u16>,
    pub backup_boot_sector: Option<u16>,
    pub hidden_sectors: u32,
    pub media_descriptor: Option<u8>,
    pub drive_number: Option<u8>,
    /// Heads and sectors per track reported by the device.
    pub geometry: Option<(u16, u16)>,
    pub atari: bool,
    /// The caller chose the sector size. The Atari path then never grows
    /// the logical sector.
    pub sector_size_fixed: bool,
}

impl PlanRequest {
    pub fn new(size_bytes: u64, sector_size: u32) -> Self {
        Self {
            size_bytes,
            sector_size,
            fat_bits: None,
            sectors_per_cluster: None,
            num_fats: 2,
            root_dir_entries: None,
            align: true,
            reserved_sectors: None,
            backup_boot_sector: None,
            hidden_sectors: 0,
            media_descriptor: None,
            drive_number: None,
            geometry: None,
            atari: false,
            sector_size_fixed: false,
        }
    }

    /// Combine what the inspector found with the caller's overrides. A
    /// block device's own sector size wins over the option.
    pub fn from_device(info: &DeviceInfo, options: &FatOptions) -> Self {
        let sector_size = if info.sector_size > 0 {
            info.sector_size
        } else {
            options.sector_size.unwrap_or(512)
        };
        let geometry = match (info.geometry_heads, info.geometry_sectors) {
            (Some(h), Some(s)) if h > 0 && s > 0 => Some((h.min(u16::MAX as u32) as u16, s.min(u16::MAX as u32) as u16)),
            _ => None,
        };
        Self {
            size_bytes: info.size_bytes,
            sector_size,
            fat_bits: options.fat_bits,
            sectors_per_cluster: options.sectors_per_cluster,
            num_fats: options.num_fats,
            root_dir_entries: options.root_dir_entries,
            align: options.align,
            reserved_sectors: options.reserved_sectors,
            backup_boot_sector: options.backup_boot_sector,
            hidden_sectors: options
                .hidden_sectors
                .or(info.partition_start_sector)
                .unwrap_or(0),
            media_descriptor: options.media_descriptor,
            drive_number: options.drive_number,
            geometry,
            atari: options.atari,
            sector_size_fixed: options.sector_size.is_some(),
        }
    }

    pub fn plan(&self) -> Result<FatLayout, PlanError> {
        let device_ss = self.sector_size as u64;
        if !self.sector_size.is_power_of_two() || !(512..=32768).contains(&self.sector_size) {
            return Err(PlanError::SectorSizeUnsupported(self.sector_size));
        }
        let requested = match self.fat_bits {
            Some(bits) => Some(FatType::from_bits(bits).ok_or_else(|| {
                PlanError::InsufficientCapacity(format!("{}-bit FATs do not exist", bits))
            })?),
            None => None,
        };
        if let Some(spc) = self.sectors_per_cluster {
            if !spc.is_power_of_two() {
                return Err(PlanError::InsufficientCapacity(format!(
                    "{} sectors per cluster is not a power of two",
                    spc
                )));
            }
            if spc as u64 * device_ss > MAX_CLUSTER_BYTES {
                return Err(PlanError::InsufficientCapacity(format!(
                    "{} sectors of {} bytes make clusters above 64 KiB",
                    spc, device_ss
                )));
            }
        }
        if self.num_fats == 0 {
            return Err(PlanError::InsufficientCapacity("at least one FAT is required".into()));
        }

        let mut num_sectors = self.size_bytes / device_ss;
        if num_sectors > u32::MAX as u64 {
            warn!(
                "Device has {} sectors, only the first {} are used",
                num_sectors,
                u32::MAX
            );
            num_sectors = u32::MAX as u64;
        }
        if num_sectors == 0 {
            return Err(PlanError::InsufficientCapacity(format!(
                "{} bytes is smaller than one sector",
                self.size_bytes
            )));
        }

        // Defaults by device size
        let floppy = FLOPPY_GEOMETRIES.iter().find(|f| f.kib == self.size_bytes / 1024);
        let (mut spc, mut root_entries, mut media, mut spt, mut heads) = match floppy {
            Some(f) => (
                f.sectors_per_cluster,
                f.root_entries,
                f.media,
                f.sectors_per_track,
                f.heads,
            ),
            None => (
                DEFAULT_SECTORS_PER_CLUSTER,
                DEFAULT_ROOT_ENTRIES,
                MEDIA_FIXED,
                DEFAULT_SECTORS_PER_TRACK,
                DEFAULT_HEADS,
            ),
        };

        let mut fat_type = requested;
        if self.atari {
            // GEMDOS uses FAT12 on floppies and FAT16 on hard disks
            if fat_type.is_none() {
                fat_type = Some(if ATARI_FLOPPY_SECTORS.contains(&num_sectors) {
                    FatType::Fat12
                } else {
                    FatType::Fat16
                });
            }
            spc = ATARI_SECTORS_PER_CLUSTER;
        } else {
            if fat_type.is_none() && self.size_bytes >= AUTO_FAT32_THRESHOLD {
                fat_type = Some(FatType::Fat32);
            }
            if fat_type == Some(FatType::Fat32) {
                spc = (fat32_cluster_sectors(self.size_bytes) * 512 / self.sector_size).max(1);
            }
        }
        if let Some(user_spc) = self.sectors_per_cluster {
            spc = user_spc as u32;
        }
        if let Some(entries) = self.root_dir_entries {
            root_entries = entries;
        }
        if fat_type == Some(FatType::Fat32) {
            root_entries = 0;
        }
        if let Some(m) = self.media_descriptor {
            media = m;
        }
        if let Some((h, s)) = self.geometry {
            heads = h;
            spt = s;
        }

        let min_reserved = if fat_type == Some(FatType::Fat32) {
            FAT32_RESERVED_SECTORS
        } else {
            1
        };
        let reserved = self.reserved_sectors.unwrap_or(min_reserved);
        if reserved < min_reserved {
            return Err(PlanError::ReservedSectorsTooFew {
                requested: reserved,
                minimum: min_reserved,
            });
        }

        let align = !self.atari && self.align && num_sectors > ALIGNMENT_MIN_SECTORS;
        if self.align && !align {
            debug!("Disabling alignment for a {}-sector filesystem", num_sectors);
        }

        let (ss, num_sectors, fat_type, candidate) = match (self.atari, fat_type) {
            (true, Some(fat_type)) => {
                let (ss, num_sectors, candidate) =
                    self.atari_geometry(num_sectors, fat_type, spc, reserved as u64, root_entries)?;
                (ss, num_sectors, fat_type, candidate)
            }
            _ => {
                let (fat_type, candidate) = self.pc_geometry(
                    num_sectors,
                    fat_type,
                    requested,
                    &mut spc,
                    reserved as u64,
                    root_entries,
                    align,
                )?;
                (device_ss, num_sectors, fat_type, candidate)
            }
        };
        let root_dir_sectors = (root_entries as u64 * DIR_ENTRY_SIZE as u64).div_ceil(ss);

        match fat_type {
            FatType::Fat16 if candidate.clusters < FAT16_MIN_CLUSTERS => {
                return Err(PlanError::InsufficientCapacity(format!(
                    "only {} clusters, a 16-bit FAT needs {} or it is read as FAT12",
                    candidate.clusters, FAT16_MIN_CLUSTERS
                )));
            }
            FatType::Fat32 if candidate.clusters < FAT32_MIN_CLUSTERS => {
                return Err(PlanError::InsufficientCapacity(format!(
                    "only {} clusters, a 32-bit FAT needs {}",
                    candidate.clusters, FAT32_MIN_CLUSTERS
                )));
            }
            _ => {}
        }

        if self.atari && fat_type != FatType::Fat32 && self.hidden_sectors > u16::MAX as u32 {
            return Err(PlanError::TooManyHiddenSectors(self.hidden_sectors));
        }

        let spc64 = spc as u64;
        let reserved = align_object(reserved as u64, spc64, align);
        let reserved = u16::try_from(reserved).map_err(|_| {
            PlanError::InconsistentLayout(format!("{} reserved sectors", reserved))
        })?;
        let root_entries = if fat_type == FatType::Fat32 {
            0
        } else if align {
            let entries = align_object(root_dir_sectors, spc64, true) * (ss / DIR_ENTRY_SIZE as u64);
            u16::try_from(entries).map_err(|_| {
                PlanError::InconsistentLayout(format!("{} root directory entries", entries))
            })?
        } else {
            root_entries
        };

        let backup_boot_sector = if fat_type == FatType::Fat32 {
            match self.backup_boot_sector {
                Some(b) if b == 1 || (b != 0 && b >= reserved) => {
                    return Err(PlanError::InvalidBackupSector {
                        requested: b,
                        reserved,
                    });
                }
                Some(b) => b,
                None if reserved >= 7 => FAT32_BACKUP_BOOT_SECTOR,
                None if reserved >= 2 => reserved - 1,
                None => 0,
            }
        } else {
            0
        };

        let drive_number = self.drive_number.unwrap_or(if media == MEDIA_FIXED {
            DRIVE_NUMBER_FIXED
        } else {
            DRIVE_NUMBER_FLOPPY
        });

        let layout = FatLayout {
            fat_type,
            sector_size: ss as u16,
            sectors_per_cluster: spc as u8,
            reserved_sectors: reserved,
            num_fats: self.num_fats,
            root_dir_entries: root_entries,
            fat_length_sectors: candidate.fat_length as u32,
            cluster_count: candidate.clusters,
            total_sectors: num_sectors as u32,
            backup_boot_sector,
            alignment_enabled: align,
            media_descriptor: media,
            sectors_per_track: spt,
            heads,
            hidden_sectors: self.hidden_sectors,
            drive_number,
        };

        let data_start = layout.data_start_sector() as u64;
        if (num_sectors - data_start.min(num_sectors)) * ss < MIN_DATA_BYTES {
            return Err(PlanError::InsufficientCapacity(format!(
                "{} sectors leave no room for data after {} sectors of metadata",
                num_sectors, data_start
            )));
        }
        layout
            .check_invariants()
            .map_err(PlanError::InconsistentLayout)?;

        debug!("Planned {:?}", layout);
        Ok(layout)
    }

    /// Double the cluster size until a FAT width fits. Returns the width
    /// and its candidate; `spc` is left at the size that fitted.
    #[allow(clippy::too_many_arguments)]
    fn pc_geometry(
        &self,
        num_sectors: u64,
        fat_type: Option<FatType>,
        requested: Option<FatType>,
        spc: &mut u32,
        reserved: u64,
        root_entries: u16,
        align: bool,
    ) -> Result<(FatType, Candidate), PlanError> {
        let ss = self.sector_size as u64;
        let root_dir_sectors = (root_entries as u64 * DIR_ENTRY_SIZE as u64).div_ceil(ss);
        let max_spc = self.sectors_per_cluster.map(u32::from).unwrap_or_else(|| {
            MAX_SECTORS_PER_CLUSTER.min((MAX_CLUSTER_BYTES / ss) as u32)
        });
        *spc = (*spc).min(max_spc);
        let nf = self.num_fats as u64;

        let chosen = loop {
            let candidates = Candidates::compute(
                num_sectors,
                ss,
                *spc as u64,
                nf,
                reserved,
                root_dir_sectors,
                align,
                requested,
            );
            debug!("Trying {} sectors/cluster: {:?}", spc, candidates);

            let fits = match fat_type {
                None => candidates.fat12.is_some() || candidates.fat16.is_some(),
                Some(FatType::Fat12) => candidates.fat12.is_some(),
                Some(FatType::Fat16) => candidates.fat16.is_some(),
                Some(FatType::Fat32) => candidates.fat32.is_some(),
            };
            if fits {
                break candidates;
            }

            *spc <<= 1;
            if *spc > max_spc {
                return Err(PlanError::InsufficientCapacity(format!(
                    "no FAT width fits {} sectors of {} bytes with at most {} sectors per cluster",
                    num_sectors, ss, max_spc
                )));
            }
        };

        // FAT16 beats FAT12 when both fit
        let fat_type = fat_type.unwrap_or_else(|| {
            let c12 = chosen.fat12.map(|c| c.clusters).unwrap_or(0);
            let c16 = chosen.fat16.map(|c| c.clusters).unwrap_or(0);
            if c16 > c12 {
                FatType::Fat16
            } else {
                FatType::Fat12
            }
        });
        let candidate = match fat_type {
            FatType::Fat12 => chosen.fat12,
            FatType::Fat16 => chosen.fat16,
            FatType::Fat32 => chosen.fat32,
        }
        .ok_or_else(|| PlanError::InsufficientCapacity("no cluster count fits".into()))?;
        Ok((fat_type, candidate))
    }

    /// GEMDOS keeps 2-sector clusters and fewer than 65531 logical
    /// sectors, so the logical sector grows instead of the cluster.
    /// Returns the logical sector size, the sector count in those units
    /// and the FAT candidate.
    fn atari_geometry(
        &self,
        mut num_sectors: u64,
        fat_type: FatType,
        spc: u32,
        reserved: u64,
        root_entries: u16,
    ) -> Result<(u64, u64, Candidate), PlanError> {
        let mut ss = self.sector_size as u64;
        if !self.sector_size_fixed {
            while num_sectors > GEMDOS_MAX_SECTORS {
                num_sectors >>= 1;
                ss <<= 1;
            }
        }
        debug!("Atari logical sector size {} for {} sectors", ss, num_sectors);

        let bits = fat_type.bits() as u64;
        let nf = self.num_fats as u64;
        let spc = spc as u64;
        let entry_limit: u64 = match fat_type {
            FatType::Fat32 => (1 << 28) - 16,
            _ => (1 << bits) - 0x10,
        };

        let candidate = loop {
            if ss > GEMDOS_MAX_SECTOR_SIZE {
                return Err(PlanError::InsufficientCapacity(format!(
                    "GEMDOS would need {}-byte sectors, it handles at most {}",
                    ss, GEMDOS_MAX_SECTOR_SIZE
                )));
            }
            if spc * ss > MAX_CLUSTER_BYTES {
                return Err(PlanError::InsufficientCapacity(format!(
                    "{} sectors of {} bytes make clusters above 64 KiB",
                    spc, ss
                )));
            }
            let root_dir_sectors = (root_entries as u64 * DIR_ENTRY_SIZE as u64).div_ceil(ss);
            let fatdata = num_sectors
                .checked_sub(root_dir_sectors + reserved)
                .ok_or_else(|| {
                    PlanError::InsufficientCapacity(format!(
                        "{} sectors do not hold the reserved area and root directory",
                        num_sectors
                    ))
                })?;

            // Same cut-off guard as the PC path: factor 2 plus the two reserved entries
            let raw = 2 * (fatdata * ss).saturating_sub(2 * nf * bits / 8)
                / (2 * (spc * ss + nf * bits / 8));
            let fat_length = ((raw + 2) * bits / 8).div_ceil(ss);
            let clusters = fatdata.saturating_sub(nf * fat_length) / spc;
            let addressable = fat_length * ss * 8 / bits;
            debug!(
                "ss={}: {} clusters, FAT of {} sectors addresses {}",
                ss, clusters, fat_length, addressable
            );

            if addressable <= entry_limit && clusters + 2 <= addressable {
                break Candidate {
                    clusters: u32::try_from(clusters).map_err(|_| {
                        PlanError::InconsistentLayout(format!("{} clusters", clusters))
                    })?,
                    fat_length,
                };
            }
            if self.sector_size_fixed {
                return Err(PlanError::InsufficientCapacity(format!(
                    "with {}-byte sectors a {}-bit FAT cannot address every cluster",
                    ss, bits
                )));
            }
            num_sectors >>= 1;
            ss <<= 1;
        };

        if num_sectors >= GEMDOS_MAX_SECTORS {
            return Err(PlanError::InsufficientCapacity(format!(
                "GEMDOS cannot handle {} sectors",
                num_sectors
            )));
        }
        if num_sectors >= OLD_GEMDOS_MAX_SECTORS {
            warn!("More than {} sectors need TOS 1.04 or higher", OLD_GEMDOS_MAX_SECTORS);
        }
        Ok((ss, num_sectors, candidate))
    }
}

/// Plan with default environment parameters.
pub fn plan(
    size_bytes: u64,
    sector_size: u32,
    requested_fat_bits: Option<u8>,
    requested_sectors_per_cluster: Option<u8>,
    num_fats: u8,
    root_dir_entries_hint: Option<u16>,
    align: bool,
) -> Result<FatLayout, PlanError> {
    PlanRequest {
        fat_bits: requested_fat_bits,
        sectors_per_cluster: requested_sectors_per_cluster,
        num_fats,
        root_dir_entries: root_dir_entries_hint,
        align,
        ..PlanRequest::new(size_bytes, sector_size)
    }
    .plan()
}

fn align_object(sectors: u64, cluster_size: u64, align: bool) -> u64 {
    if !align {
        return sectors;
    }
    (sectors + cluster_size - 1) & !(cluster_size - 1)
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    clusters: u32,
    fat_length: u64,
}

#[derive(Debug)]
struct Candidates {
    fat12: Option<Candidate>,
    fat16: Option<Candidate>,
    fat32: Option<Candidate>,
}

impl Candidates {
    #[allow(clippy::too_many_arguments)]
    fn compute(
        num_sectors: u64,
        ss: u64,
        spc: u64,
        nf: u64,
        reserved: u64,
        root_dir_sectors: u64,
        align: bool,
        forced: Option<FatType>,
    ) -> Self {
        let fatdata32 = num_sectors.saturating_sub(align_object(reserved, spc, align));
        let fatdata1216 = fatdata32.saturating_sub(align_object(root_dir_sectors, spc, align));

        // The factor 2 avoids cut-off errors with a single FAT; nf*3 covers
        // the two reserved entries.
        let raw12 = 2 * (fatdata1216 * ss + nf * 3) / (2 * spc * ss + nf * 3);
        let fat12 = Self::settle(fatdata1216, nf, spc, align, raw12, |c| {
            (((c + 2) * 3 + 1) >> 1).div_ceil(ss)
        })
        .filter(|c| {
            let max = (c.fat_length * 2 * ss / 3).min(FAT12_MAX_CLUSTERS as u64 + 1);
            c.clusters > 0 && c.clusters as u64 + 2 <= max
        });

        let raw16 = (fatdata1216 * ss + nf * 4) / (spc * ss + nf * 2);
        let fat16 = Self::settle(fatdata1216, nf, spc, align, raw16, |c| ((c + 2) * 2).div_ceil(ss))
            .filter(|c| {
                let max = (c.fat_length * ss / 2).min(FAT16_MAX_CLUSTERS as u64 + 2);
                c.clusters > 0 && c.clusters as u64 + 2 <= max
            })
            .filter(|c| c.clusters >= FAT16_MIN_CLUSTERS || forced == Some(FatType::Fat16));

        let raw32 = (fatdata32 * ss + nf * 8) / (spc * ss + nf * 4);
        let fat32 = Self::settle(fatdata32, nf, spc, align, raw32, |c| ((c + 2) * 4).div_ceil(ss))
            .filter(|c| {
                let max = (c.fat_length * ss / 4).min(FAT32_MAX_CLUSTERS as u64 + 2);
                c.clusters > 0 && c.clusters as u64 + 2 <= max
            })
            .filter(|c| c.clusters >= FAT32_MIN_CLUSTERS || forced == Some(FatType::Fat32));

        Self { fat12, fat16, fat32 }
    }

    /// Size the FAT for `raw` clusters, align it, then recount the clusters
    /// that really fit next to the aligned FATs.
    fn settle(
        fatdata: u64,
        nf: u64,
        spc: u64,
        align: bool,
        raw: u64,
        fat_length_for: impl Fn(u64) -> u64,
    ) -> Option<Candidate> {
        let fat_length = align_object(fat_length_for(raw), spc, align);
        let clusters = fatdata.checked_sub(nf * fat_length)? / spc;
        Some(Candidate {
            clusters: u32::try_from(clusters).ok()?,
            fat_length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;
    const GIB: u64 = 1024 * MIB;

    #[test]
    fn floppy_image_gets_classic_fat12_geometry() {
        let layout = plan(1_474_560, 512, None, None, 2, None, true).unwrap();
        assert_eq!(layout.fat_type, FatType::Fat12);
        assert_eq!(layout.sectors_per_cluster, 1);
        assert_eq!(layout.root_dir_entries, 224);
        assert_eq!(layout.media_descriptor, 0xF0);
        assert_eq!(layout.sectors_per_track, 18);
        assert_eq!(layout.heads, 2);
        assert_eq!(layout.fat_length_sectors, 9);
        assert_eq!(layout.cluster_count, 2847);
        assert_eq!(layout.drive_number, 0x00);
        assert!(!layout.alignment_enabled);
    }

    #[test]
    fn eight_gigabyte_fat32_uses_sixteen_sector_clusters() {
        let layout = plan(8_000_000_000, 512, Some(32), None, 2, None, true).unwrap();
        assert_eq!(layout.fat_type, FatType::Fat32);
        assert_eq!(layout.sectors_per_cluster, 16);
        assert!(layout.reserved_sectors >= 32);
        assert_eq!(layout.root_dir_entries, 0);
        assert_eq!(layout.backup_boot_sector, 6);
        assert_eq!(layout.drive_number, 0x80);
    }

    #[test]
    fn default_widths_follow_the_size_brackets() {
        let cases = [
            (MIB, FatType::Fat12),
            (16 * MIB, FatType::Fat16),
            (200 * MIB, FatType::Fat16),
            (2 * GIB, FatType::Fat32),
            (32 * GIB, FatType::Fat32),
            (1024 * GIB, FatType::Fat32),
        ];
        for (size, expected) in cases {
            let layout = plan(size, 512, None, None, 2, None, true).unwrap();
            assert_eq!(layout.fat_type, expected, "size {}", size);
            layout.check_invariants().unwrap();
        }
    }

    #[test]
    fn fat32_cluster_brackets() {
        assert_eq!(fat32_cluster_sectors(200_000_000), 1);
        assert_eq!(fat32_cluster_sectors(2 * GIB), 8);
        assert_eq!(fat32_cluster_sectors(12_000_000_000), 16);
        assert_eq!(fat32_cluster_sectors(20_000_000_000), 32);
        assert_eq!(fat32_cluster_sectors(64_000_000_000), 64);
    }

    #[test]
    fn alignment_rounds_metadata_to_clusters() {
        let layout = plan(64 * MIB, 512, Some(16), None, 2, None, true).unwrap();
        let spc = layout.sectors_per_cluster as u32;
        assert!(layout.alignment_enabled);
        assert_eq!(layout.reserved_sectors as u32 % spc, 0);
        assert_eq!(layout.fat_length_sectors % spc, 0);
        assert_eq!(layout.root_dir_sectors() % spc, 0);
        assert_eq!(layout.data_start_sector() % spc, 0);
    }

    #[test]
    fn forced_fat16_below_the_threshold_is_refused() {
        // A few megabytes never reach 4085 clusters at the default cluster size.
        for size in [2 * MIB, 3 * MIB] {
            match plan(size, 512, Some(16), None, 2, None, true) {
                Ok(layout) => {
                    assert!(layout.cluster_count >= FAT16_MIN_CLUSTERS);
                }
                Err(e) => assert!(matches!(e, PlanError::InsufficientCapacity(_)), "{:?}", e),
            }
        }
    }

    #[test]
    fn forced_fat16_on_a_tiny_device_fails() {
        let err = plan(MIB, 512, Some(16), None, 2, None, true).unwrap_err();
        assert!(matches!(err, PlanError::InsufficientCapacity(_)));
    }

    #[test]
    fn forced_fat32_on_a_small_device_fails() {
        let err = plan(16 * MIB, 512, Some(32), None, 2, None, true).unwrap_err();
        assert!(matches!(err, PlanError::InsufficientCapacity(_)));
    }

    #[test]
    fn rejects_odd_sector_sizes() {
        for ss in [256, 520, 65536] {
            assert_eq!(
                plan(64 * MIB, ss, None, None, 2, None, true),
                Err(PlanError::SectorSizeUnsupported(ss))
            );
        }
        assert!(plan(64 * MIB, 4096, None, None, 2, None, true).is_ok());
    }

    #[test]
    fn backup_boot_sector_rules() {
        let mut request = PlanRequest::new(2 * GIB, 512);
        request.backup_boot_sector = Some(1);
        assert!(matches!(request.plan(), Err(PlanError::InvalidBackupSector { requested: 1, .. })));

        request.backup_boot_sector = Some(40);
        assert!(matches!(request.plan(), Err(PlanError::InvalidBackupSector { requested: 40, .. })));

        request.backup_boot_sector = Some(2);
        assert_eq!(request.plan().unwrap().backup_boot_sector, 2);
    }

    #[test]
    fn fat32_needs_its_reserved_area() {
        let mut request = PlanRequest::new(2 * GIB, 512);
        request.reserved_sectors = Some(8);
        assert_eq!(
            request.plan(),
            Err(PlanError::ReservedSectorsTooFew { requested: 8, minimum: 32 })
        );
    }

    #[test]
    fn atari_hidden_sector_field_is_sixteen_bits() {
        let mut request = PlanRequest::new(64 * MIB, 512);
        request.atari = true;
        request.hidden_sectors = 70_000;
        assert_eq!(request.plan(), Err(PlanError::TooManyHiddenSectors(70_000)));

        request.hidden_sectors = 60_000;
        assert_eq!(request.plan().unwrap().hidden_sectors, 60_000);
    }

    fn atari(size_bytes: u64) -> PlanRequest {
        PlanRequest {
            atari: true,
            ..PlanRequest::new(size_bytes, 512)
        }
    }

    #[test]
    fn atari_hard_disk_grows_the_logical_sector() {
        let layout = atari(64 * MIB).plan().unwrap();
        assert_eq!(layout.fat_type, FatType::Fat16);
        assert_eq!(layout.sector_size, 2048);
        assert_eq!(layout.total_sectors, 32768);
        assert!((layout.total_sectors as u64) < GEMDOS_MAX_SECTORS);
        assert_eq!(layout.sectors_per_cluster, 2);
        assert_eq!(layout.fat_length_sectors, 16);
        assert_eq!(layout.cluster_count, 16363);
        assert_eq!(layout.root_dir_entries, 512);
        assert!(!layout.alignment_enabled);
        layout.check_invariants().unwrap();
    }

    #[test]
    fn atari_floppies_stay_fat12_with_two_sector_clusters() {
        for size in [1_474_560, 2_949_120] {
            let layout = atari(size).plan().unwrap();
            assert_eq!(layout.fat_type, FatType::Fat12, "size {}", size);
            assert_eq!(layout.sector_size, 512);
            assert_eq!(layout.sectors_per_cluster, 2);
        }
        let floppy = atari(1_474_560).plan().unwrap();
        assert_eq!(floppy.fat_length_sectors, 5);
        assert_eq!(floppy.cluster_count, 1427);
    }

    #[test]
    fn atari_fixed_sector_size_cannot_exceed_gemdos_sector_count() {
        let mut request = atari(64 * MIB);
        request.sector_size_fixed = true;
        assert!(matches!(request.plan(), Err(PlanError::InsufficientCapacity(_))));
    }

    #[test]
    fn atari_refuses_sectors_above_sixteen_kib() {
        // 2 GiB would need 64 KiB logical sectors
        let err = atari(2 * GIB).plan().unwrap_err();
        assert!(matches!(err, PlanError::InsufficientCapacity(_)), "{:?}", err);

        let layout = atari(512 * MIB).plan().unwrap();
        assert_eq!(layout.sector_size, 16384);
        assert_eq!(layout.total_sectors, 32768);
        assert_eq!(layout.cluster_count, 16381);
    }

    #[test]
    fn atari_small_hard_disk_keeps_fat16_cluster_range() {
        let err = atari(MIB).plan().unwrap_err();
        assert!(matches!(err, PlanError::InsufficientCapacity(_)), "{:?}", err);
    }

    #[test]
    fn clusters_never_exceed_64_kib() {
        for ss in [4096u32, 8192, 16384, 32768] {
            for size in [64 * MIB, 256 * MIB, GIB, 8 * GIB] {
                match plan(size, ss, None, None, 2, None, true) {
                    Ok(layout) => {
                        assert!(layout.bytes_per_cluster() <= 65536, "{} / {}: {:?}", size, ss, layout);
                        layout.check_invariants().unwrap();
                    }
                    Err(e) => assert!(
                        matches!(e, PlanError::InsufficientCapacity(_)),
                        "{} / {}: {:?}",
                        size,
                        ss,
                        e
                    ),
                }
            }
        }
        let err = plan(64 * MIB, 4096, None, Some(32), 2, None, true).unwrap_err();
        assert!(matches!(err, PlanError::InsufficientCapacity(_)));
    }

    #[test]
    fn fixed_cluster_size_is_not_doubled() {
        // 200 MiB with 1-sector clusters has too many clusters for FAT16
        let err = plan(200 * MIB, 512, Some(16), Some(1), 2, None, true).unwrap_err();
        assert!(matches!(err, PlanError::InsufficientCapacity(_)));
        let layout = plan(200 * MIB, 512, Some(16), Some(8), 2, None, true).unwrap();
        assert_eq!(layout.sectors_per_cluster, 8);
    }

    #[test]
    fn device_geometry_and_partition_offset_flow_into_the_layout() {
        let info = DeviceInfo {
            kind: bootforge_core::DeviceKind::BlockDevice,
            size_bytes: 4 * GIB,
            sector_size: 512,
            geometry_heads: Some(64),
            geometry_sectors: Some(32),
            partition_start_sector: Some(2048),
        };
        let layout = PlanRequest::from_device(&info, &FatOptions::default())
            .plan()
            .unwrap();
        assert_eq!(layout.heads, 64);
        assert_eq!(layout.sectors_per_track, 32);
        assert_eq!(layout.hidden_sectors, 2048);
        assert_eq!(layout.fat_type, FatType::Fat32);
    }

    #[test]
    fn huge_devices_are_clamped_to_32_bit_sector_counts() {
        let layout = plan(3 * 1024 * GIB, 512, None, None, 2, None, true).unwrap();
        assert_eq!(layout.total_sectors, u32::MAX);
        layout.check_invariants().unwrap();
    }
}
