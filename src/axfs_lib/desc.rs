/// On-disk structures and codecs for the AXFS volume format.
///
/// All multi-byte integers are big-endian. Three records live on disk: the
/// superblock (sector 0, copy in sector 1), the 80-byte inode, and the
/// 32-byte directory entry. The superblock carries a CRC32 over its fixed
/// 52-byte prefix; the inode carries a CRC16 over its first 78 bytes.
use anyhow::{bail, Result};
use byteorder::{BigEndian, ByteOrder};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use block_dev::CacheStats;

use super::utils::{ceil_div, crc16, crc32};

pub const AXFS_MAGIC: [u8; 4] = *b"AXF2";
pub const AXFS_VERSION: u16 = 2;

/// Inode 0 is never allocated, inode 1 is the root directory.
pub const ROOT_INO: u16 = 1;

pub const INODE_SIZE: usize = 80;
pub const DIR_ENTRY_SIZE: usize = 32;

/// Payload bytes that fit inside the inode itself.
pub const INLINE_MAX: usize = 52;
/// Direct extent slots in the inode before the indirect block is needed.
pub const DIRECT_EXTENTS: usize = 13;

/// CRC-covered leading bytes of the superblock.
pub const SUPERBLOCK_PREFIX: usize = 52;
/// Total packed superblock length (prefix + CRC + label + trailer).
pub const SUPERBLOCK_BYTES: usize = 92;
pub const LABEL_LEN: usize = 16;

/// Extent start blocks are u16, which caps the data region.
pub const MAX_BLOCK_LIMIT: u32 = 65535;

pub const FEAT_CHECKSUMS: u16 = 0x01;
pub const FEAT_COW: u16 = 0x02;

pub const INODE_FLAG_INLINE: u8 = 0x01;
pub const INODE_FLAG_CHECKSUM: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum InodeKind {
    Free = 0,
    File = 1,
    Dir = 2,
    Link = 3,
}

/// Contiguous run of data blocks belonging to one inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extent {
    pub start: u16,
    pub len: u16,
}

// ---------------------------------------------------------------------------
// Superblock

#[derive(Debug, Clone, Default)]
pub struct SuperBlock {
    pub sector_size: u16,
    pub total_sectors: u32,
    pub max_inodes: u16,
    pub free_inodes: u16,
    pub max_blocks: u32,
    pub free_blocks: u32,
    pub data_start: u32,
    pub inode_table_start: u32,
    pub block_bitmap_start: u32,
    pub block_bitmap_sectors: u16,
    pub created: u32,
    pub modified: u32,
    pub generation: u32,
    pub features: u16,
    pub label: String,
    pub checksum_table_start: u32,
    pub checksum_table_sectors: u16,
    pub cow_generation: u32,
    pub lifetime_reads: u32,
    pub lifetime_writes: u32,
}

/// Outcome of inspecting one superblock copy.
pub enum SbProbe {
    Valid(SuperBlock),
    BadMagic,
    BadVersion(u16),
    BadCrc,
}

impl SuperBlock {
    pub fn has_checksums(&self) -> bool {
        self.features & FEAT_CHECKSUMS != 0
    }

    pub fn has_cow(&self) -> bool {
        self.features & FEAT_COW != 0
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut buf = vec![0u8; SUPERBLOCK_BYTES];
        buf[0..4].copy_from_slice(&AXFS_MAGIC);
        BigEndian::write_u16(&mut buf[4..6], AXFS_VERSION);
        BigEndian::write_u16(&mut buf[6..8], self.sector_size);
        BigEndian::write_u32(&mut buf[8..12], self.total_sectors);
        BigEndian::write_u16(&mut buf[12..14], self.max_inodes);
        BigEndian::write_u16(&mut buf[14..16], self.free_inodes);
        BigEndian::write_u32(&mut buf[16..20], self.max_blocks);
        BigEndian::write_u32(&mut buf[20..24], self.free_blocks);
        BigEndian::write_u32(&mut buf[24..28], self.data_start);
        BigEndian::write_u32(&mut buf[28..32], self.inode_table_start);
        BigEndian::write_u32(&mut buf[32..36], self.block_bitmap_start);
        BigEndian::write_u16(&mut buf[36..38], self.block_bitmap_sectors);
        BigEndian::write_u32(&mut buf[38..42], self.created);
        BigEndian::write_u32(&mut buf[42..46], self.modified);
        BigEndian::write_u32(&mut buf[46..50], self.generation);
        BigEndian::write_u16(&mut buf[50..52], self.features);
        let crc = crc32(&buf[..SUPERBLOCK_PREFIX]);
        BigEndian::write_u32(&mut buf[52..56], crc);
        let label = self.label.as_bytes();
        let n = label.len().min(LABEL_LEN);
        buf[56..56 + n].copy_from_slice(&label[..n]);
        BigEndian::write_u32(&mut buf[72..76], self.checksum_table_start);
        BigEndian::write_u16(&mut buf[76..78], self.checksum_table_sectors);
        // Feature mirror for readers that only map the trailer.
        BigEndian::write_u16(&mut buf[78..80], self.features);
        BigEndian::write_u32(&mut buf[80..84], self.cow_generation);
        BigEndian::write_u32(&mut buf[84..88], self.lifetime_reads);
        BigEndian::write_u32(&mut buf[88..92], self.lifetime_writes);
        buf
    }

    /// Inspect one stored copy without deciding policy; `mount` combines
    /// the probes of both copies.
    pub fn probe(buf: &[u8]) -> SbProbe {
        if buf.len() < SUPERBLOCK_BYTES || buf[0..4] != AXFS_MAGIC {
            return SbProbe::BadMagic;
        }
        let version = BigEndian::read_u16(&buf[4..6]);
        if version != AXFS_VERSION {
            return SbProbe::BadVersion(version);
        }
        let stored = BigEndian::read_u32(&buf[52..56]);
        if stored != crc32(&buf[..SUPERBLOCK_PREFIX]) {
            return SbProbe::BadCrc;
        }
        let label = String::from_utf8_lossy(&buf[56..72])
            .trim_end_matches('\0')
            .to_string();
        SbProbe::Valid(SuperBlock {
            sector_size: BigEndian::read_u16(&buf[6..8]),
            total_sectors: BigEndian::read_u32(&buf[8..12]),
            max_inodes: BigEndian::read_u16(&buf[12..14]),
            free_inodes: BigEndian::read_u16(&buf[14..16]),
            max_blocks: BigEndian::read_u32(&buf[16..20]),
            free_blocks: BigEndian::read_u32(&buf[20..24]),
            data_start: BigEndian::read_u32(&buf[24..28]),
            inode_table_start: BigEndian::read_u32(&buf[28..32]),
            block_bitmap_start: BigEndian::read_u32(&buf[32..36]),
            block_bitmap_sectors: BigEndian::read_u16(&buf[36..38]),
            created: BigEndian::read_u32(&buf[38..42]),
            modified: BigEndian::read_u32(&buf[42..46]),
            generation: BigEndian::read_u32(&buf[46..50]),
            features: BigEndian::read_u16(&buf[50..52]),
            label,
            checksum_table_start: BigEndian::read_u32(&buf[72..76]),
            checksum_table_sectors: BigEndian::read_u16(&buf[76..78]),
            cow_generation: BigEndian::read_u32(&buf[80..84]),
            lifetime_reads: BigEndian::read_u32(&buf[84..88]),
            lifetime_writes: BigEndian::read_u32(&buf[88..92]),
        })
    }
}

// ---------------------------------------------------------------------------
// Inode

/// In-memory form of the 80-byte on-disk inode. `extents` holds only the
/// direct slots; when `n_extents` exceeds [`DIRECT_EXTENTS`] the remainder
/// live in the indirect block.
#[derive(Debug, Clone)]
pub struct Inode {
    pub kind: InodeKind,
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub size: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub links: u16,
    pub flags: u8,
    pub n_extents: u16,
    pub extents: Vec<Extent>,
    pub inline: Vec<u8>,
    pub indirect: u16,
    /// CRC verdict from unpack; reads are returned regardless, health
    /// reports the failure.
    pub crc_ok: bool,
}

impl Inode {
    pub fn new(kind: InodeKind, mode: u16, now: u32) -> Self {
        Self {
            kind,
            mode,
            uid: 0,
            gid: 0,
            size: 0,
            ctime: now,
            mtime: now,
            links: 1,
            flags: 0,
            n_extents: 0,
            extents: vec![],
            inline: vec![],
            indirect: 0,
            crc_ok: true,
        }
    }

    pub fn is_inline(&self) -> bool {
        self.flags & INODE_FLAG_INLINE != 0
    }

    pub fn pack(&self) -> [u8; INODE_SIZE] {
        let mut buf = [0u8; INODE_SIZE];
        buf[0] = self.kind.into();
        BigEndian::write_u16(&mut buf[1..3], self.mode);
        BigEndian::write_u16(&mut buf[3..5], self.uid);
        BigEndian::write_u16(&mut buf[5..7], self.gid);
        BigEndian::write_u32(&mut buf[7..11], self.size);
        BigEndian::write_u32(&mut buf[11..15], self.ctime);
        BigEndian::write_u32(&mut buf[15..19], self.mtime);
        BigEndian::write_u16(&mut buf[19..21], self.links);
        buf[21] = self.flags;
        BigEndian::write_u16(&mut buf[22..24], self.n_extents);
        if self.is_inline() {
            let n = self.inline.len().min(INLINE_MAX);
            buf[24..24 + n].copy_from_slice(&self.inline[..n]);
        } else {
            for (i, e) in self.extents.iter().take(DIRECT_EXTENTS).enumerate() {
                let at = 24 + i * 4;
                BigEndian::write_u16(&mut buf[at..at + 2], e.start);
                BigEndian::write_u16(&mut buf[at + 2..at + 4], e.len);
            }
        }
        BigEndian::write_u16(&mut buf[76..78], self.indirect);
        let crc = crc16(&buf[..78]);
        BigEndian::write_u16(&mut buf[78..80], crc);
        buf
    }

    pub fn unpack(buf: &[u8]) -> Inode {
        let kind = InodeKind::try_from(buf[0]).unwrap_or(InodeKind::Free);
        let size = BigEndian::read_u32(&buf[7..11]);
        let flags = buf[21];
        let n_extents = BigEndian::read_u16(&buf[22..24]);
        let mut extents = vec![];
        let mut inline = vec![];
        if flags & INODE_FLAG_INLINE != 0 {
            let n = (size as usize).min(INLINE_MAX);
            inline.extend_from_slice(&buf[24..24 + n]);
        } else {
            for i in 0..(n_extents as usize).min(DIRECT_EXTENTS) {
                let at = 24 + i * 4;
                extents.push(Extent {
                    start: BigEndian::read_u16(&buf[at..at + 2]),
                    len: BigEndian::read_u16(&buf[at + 2..at + 4]),
                });
            }
        }
        let stored = BigEndian::read_u16(&buf[78..80]);
        Inode {
            kind,
            mode: BigEndian::read_u16(&buf[1..3]),
            uid: BigEndian::read_u16(&buf[3..5]),
            gid: BigEndian::read_u16(&buf[5..7]),
            size,
            ctime: BigEndian::read_u32(&buf[11..15]),
            mtime: BigEndian::read_u32(&buf[15..19]),
            links: BigEndian::read_u16(&buf[19..21]),
            flags,
            n_extents,
            extents,
            inline,
            indirect: BigEndian::read_u16(&buf[76..78]),
            crc_ok: stored == crc16(&buf[..78]),
        }
    }
}

// ---------------------------------------------------------------------------
// Directory entry

/// 32-byte directory entry; `ino == 0` marks a tombstone slot.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub ino: u16,
    pub kind: InodeKind,
    pub name: String,
}

impl DirEntry {
    pub fn pack(&self) -> [u8; DIR_ENTRY_SIZE] {
        let mut buf = [0u8; DIR_ENTRY_SIZE];
        BigEndian::write_u16(&mut buf[0..2], self.ino);
        buf[2] = self.kind.into();
        let name = self.name.as_bytes();
        let n = name.len().min(DIR_ENTRY_SIZE - 4);
        buf[3] = n as u8;
        buf[4..4 + n].copy_from_slice(&name[..n]);
        buf
    }

    pub fn unpack(buf: &[u8]) -> DirEntry {
        let ino = BigEndian::read_u16(&buf[0..2]);
        let kind = InodeKind::try_from(buf[2]).unwrap_or(InodeKind::Free);
        let n = (buf[3] as usize).min(DIR_ENTRY_SIZE - 4);
        DirEntry {
            ino,
            kind,
            name: String::from_utf8_lossy(&buf[4..4 + n]).to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ino == 0
    }
}

// ---------------------------------------------------------------------------
// Layout

/// Region offsets derived at format time from the device geometry.
///
/// Sectors 0 and 1 hold the superblock copies, sector 2 the inode bitmap.
/// The inode table, block bitmap, optional checksum table and data region
/// follow back to back. Bitmap and checksum-table sizes depend on the data
/// region they carve out of, resolved by growing the overhead until it
/// covers the blocks that remain.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub inode_bitmap_sector: u32,
    pub inode_table_start: u32,
    pub inode_table_sectors: u32,
    pub block_bitmap_start: u32,
    pub block_bitmap_sectors: u16,
    pub checksum_table_start: u32,
    pub checksum_table_sectors: u16,
    pub data_start: u32,
    pub max_blocks: u32,
}

impl Layout {
    pub fn derive(
        sector_size: u16,
        total_sectors: u32,
        max_inodes: u16,
        checksums: bool,
    ) -> Result<Layout> {
        let ss = sector_size as usize;
        if ss < INODE_SIZE * 2 {
            bail!("Sector size {} too small", sector_size);
        }
        if max_inodes < 3 {
            bail!("Max inodes {} too small", max_inodes);
        }
        if max_inodes as usize > ss * 8 {
            bail!("Max inodes {} exceed one bitmap sector", max_inodes);
        }
        let inodes_per_sector = ss / INODE_SIZE;
        let inode_table_start = 3u32;
        let inode_table_sectors = ceil_div(max_inodes as usize, inodes_per_sector) as u32;
        let block_bitmap_start = inode_table_start + inode_table_sectors;

        let mut bbm_sectors = 1u32;
        let mut csum_sectors = 0u32;
        loop {
            let data_start = block_bitmap_start + bbm_sectors + csum_sectors;
            if data_start + 1 >= total_sectors {
                bail!("Device too small: {} sectors", total_sectors);
            }
            let max_blocks = (total_sectors - data_start).min(MAX_BLOCK_LIMIT);
            let need_bbm = ceil_div(max_blocks as usize, ss * 8) as u32;
            let need_csum = if checksums {
                ceil_div(max_blocks as usize * 4, ss) as u32
            } else {
                0
            };
            // Overhead only ever grows here, so the loop terminates; a
            // one-sector overestimate just shortens the data region.
            if need_bbm <= bbm_sectors && need_csum <= csum_sectors {
                let csum_start = if checksums {
                    block_bitmap_start + bbm_sectors
                } else {
                    0
                };
                return Ok(Layout {
                    inode_bitmap_sector: 2,
                    inode_table_start,
                    inode_table_sectors,
                    block_bitmap_start,
                    block_bitmap_sectors: bbm_sectors as u16,
                    checksum_table_start: csum_start,
                    checksum_table_sectors: csum_sectors as u16,
                    data_start,
                    max_blocks,
                });
            }
            bbm_sectors = bbm_sectors.max(need_bbm);
            csum_sectors = csum_sectors.max(need_csum);
        }
    }
}

// ---------------------------------------------------------------------------
// Public record types

#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub ino: u16,
    pub kind: InodeKind,
    pub size: u32,
    pub mode: u16,
    pub inline: bool,
}

#[derive(Debug, Clone)]
pub struct Stat {
    pub ino: u16,
    pub kind: InodeKind,
    pub size: u32,
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub links: u16,
    pub ctime: u32,
    pub mtime: u32,
    pub inline: bool,
    pub n_extents: u16,
}

#[derive(Debug, Clone)]
pub struct Info {
    pub label: String,
    pub version: u16,
    pub sector_size: u16,
    pub total_sectors: u32,
    pub max_inodes: u16,
    pub max_blocks: u32,
    pub free_inodes: u16,
    pub free_blocks: u32,
    pub data_start: u32,
    pub generation: u32,
    pub checksums: bool,
    pub cow: bool,
    pub checksum_fails: u32,
    pub lifetime_reads: u32,
    pub lifetime_writes: u32,
}

#[derive(Debug, Clone)]
pub struct Health {
    pub ok: bool,
    pub issues: Vec<String>,
    pub cache: CacheStats,
}

#[derive(Debug, Clone)]
pub struct FormatOptions {
    pub label: String,
    pub max_inodes: u16,
    pub checksums: bool,
    pub cow: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            label: String::new(),
            max_inodes: 512,
            checksums: true,
            cow: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub cache_size: usize,
    /// Override the superblock's CoW flag for this mount.
    pub cow: Option<bool>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            cache_size: block_dev::DEFAULT_CACHE_SLOTS,
            cow: None,
        }
    }
}
