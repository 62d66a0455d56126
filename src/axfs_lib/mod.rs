/// Filesystem logics
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;

use anyhow::{anyhow, bail, Result};
use byteorder::{BigEndian, ByteOrder};
use log::*;
use lru::LruCache;

pub use block_dev;
use block_dev::{pad_sector, BlockDevice, CacheStats, ClockCache};

pub mod desc;
pub mod fs;
pub mod utils;

use desc::*;
use utils::*;

/// Resolved full paths memoized per volume.
const PATH_CACHE_CAP: usize = 64;

/// A mounted AXFS volume.
///
/// Owns the sector cache wrapping the device plus every piece of in-memory
/// volume state: the superblock mirror, both bitmaps, the checksum table and
/// its dirty-sector set, and the three coherence-coupled caches (inode, path,
/// directory hash). Single-writer: one owner mutates the volume at a time.
pub struct Volume {
    pub(crate) dev: ClockCache,
    pub sb: SuperBlock,
    pub(crate) cow: bool,
    pub(crate) checksums: bool,
    pub(crate) bitmap_inode: Vec<u8>,
    pub(crate) bitmap_block: Vec<u8>,
    pub(crate) csum_table: Vec<u32>,
    pub(crate) dirty_csum: HashSet<u16>,
    pub(crate) alloc_hint: u32,
    pub(crate) dirty: bool,
    pub(crate) checksum_fails: u32,
    pub(crate) inode_cache: HashMap<u16, Inode>,
    pub(crate) path_cache: LruCache<String, u16>,
    pub(crate) dir_cache: HashMap<u16, HashMap<String, (u16, InodeKind)>>,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume").field("sb", &self.sb).finish_non_exhaustive()
    }
}

/// Create an AXFS volume on `dev`. Everything the device held is gone.
pub fn format(dev: &mut dyn BlockDevice, opts: &FormatOptions) -> Result<()> {
    let ss = dev.sector_size() as usize;
    let layout = Layout::derive(
        dev.sector_size(),
        dev.sector_count(),
        opts.max_inodes,
        opts.checksums,
    )?;
    let now = timestamp_now();
    let mut features = 0u16;
    if opts.checksums {
        features |= FEAT_CHECKSUMS;
    }
    if opts.cow {
        features |= FEAT_COW;
    }
    let sb = SuperBlock {
        sector_size: dev.sector_size(),
        total_sectors: dev.sector_count(),
        max_inodes: opts.max_inodes,
        free_inodes: opts.max_inodes - 2,
        max_blocks: layout.max_blocks,
        free_blocks: layout.max_blocks - 1,
        data_start: layout.data_start,
        inode_table_start: layout.inode_table_start,
        block_bitmap_start: layout.block_bitmap_start,
        block_bitmap_sectors: layout.block_bitmap_sectors,
        created: now,
        modified: now,
        generation: 1,
        features,
        label: opts.label.clone(),
        checksum_table_start: layout.checksum_table_start,
        checksum_table_sectors: layout.checksum_table_sectors,
        cow_generation: 0,
        lifetime_reads: 0,
        lifetime_writes: 0,
    };

    let mut put = |n: u32, data: &[u8]| -> Result<()> {
        if !dev.write_sector(n, data) {
            bail!("Write error at sector {}", n);
        }
        Ok(())
    };

    // Inode bitmap: inode 0 reserved, inode 1 is the root.
    let mut bitmap_inode = vec![0u8; ss];
    bitmap_inode[0] = 0b11;
    put(layout.inode_bitmap_sector, &bitmap_inode)?;

    // Root directory block (data block 0, pre-marked in the block bitmap).
    let mut root_block = vec![0u8; ss];
    let dot = DirEntry {
        ino: ROOT_INO,
        kind: InodeKind::Dir,
        name: ".".to_string(),
    };
    let dotdot = DirEntry {
        ino: ROOT_INO,
        kind: InodeKind::Dir,
        name: "..".to_string(),
    };
    root_block[..DIR_ENTRY_SIZE].copy_from_slice(&dot.pack());
    root_block[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE].copy_from_slice(&dotdot.pack());
    put(layout.data_start, &root_block)?;

    // Inode table: zeroed except the root inode.
    let mut root = Inode::new(InodeKind::Dir, 0o755, now);
    root.links = 2;
    root.size = ss as u32;
    root.n_extents = 1;
    root.extents = vec![Extent { start: 0, len: 1 }];
    if opts.checksums {
        root.flags |= INODE_FLAG_CHECKSUM;
    }
    for i in 0..layout.inode_table_sectors {
        let mut buf = vec![0u8; ss];
        if i == 0 {
            buf[INODE_SIZE..2 * INODE_SIZE].copy_from_slice(&root.pack());
        }
        put(layout.inode_table_start + i, &buf)?;
    }

    // Block bitmap: block 0 (root directory) pre-marked.
    for i in 0..layout.block_bitmap_sectors as u32 {
        let mut buf = vec![0u8; ss];
        if i == 0 {
            buf[0] = 0b1;
        }
        put(layout.block_bitmap_start + i, &buf)?;
    }

    // Checksum table: all "no checksum recorded" except the root block.
    for i in 0..layout.checksum_table_sectors as u32 {
        let mut buf = vec![0u8; ss];
        if i == 0 {
            BigEndian::write_u32(&mut buf[0..4], crc32(&root_block));
        }
        put(layout.checksum_table_start + i, &buf)?;
    }

    // Superblock copies go last.
    let packed = sb.pack();
    put(0, &packed)?;
    put(1, &packed)?;
    info!(
        "formatted AXFS '{}': {} sectors, {} inodes, {} blocks",
        opts.label, sb.total_sectors, sb.max_inodes, sb.max_blocks
    );
    Ok(())
}

impl Volume {
    /// Mount a device: pick the newer valid superblock copy, pull both
    /// bitmaps and the checksum table into memory, pre-warm the inode table.
    pub fn mount(device: Box<dyn BlockDevice>, opts: &MountOptions) -> Result<Volume> {
        let mut dev = ClockCache::new(device, opts.cache_size);
        let probe = |buf: Option<Vec<u8>>| match buf {
            Some(b) => SuperBlock::probe(&b),
            None => SbProbe::BadMagic,
        };
        let p0 = probe(dev.read_sector(0));
        let p1 = probe(dev.read_sector(1));
        let sb = match (p0, p1) {
            (SbProbe::Valid(a), SbProbe::Valid(b)) => {
                if b.generation > a.generation {
                    debug!("superblock copy 1 is newer (gen {})", b.generation);
                    b
                } else {
                    a
                }
            }
            (SbProbe::Valid(a), _) => {
                warn!("superblock copy 1 invalid, using copy 0");
                a
            }
            (_, SbProbe::Valid(b)) => {
                warn!("superblock copy 0 invalid, using copy 1");
                b
            }
            (SbProbe::BadVersion(v), _) | (_, SbProbe::BadVersion(v)) => bail!("Version {}", v),
            (SbProbe::BadCrc, _) | (_, SbProbe::BadCrc) => bail!("Corrupt superblock"),
            _ => bail!("Not AXFS"),
        };
        if sb.sector_size != dev.sector_size() {
            bail!(
                "Sector size mismatch: volume {}, device {}",
                sb.sector_size,
                dev.sector_size()
            );
        }

        let bitmap_inode = dev
            .read_sector(2)
            .ok_or_else(|| anyhow!("Read error at sector 2"))?;

        let bbm_sectors: Vec<u32> = (0..sb.block_bitmap_sectors as u32)
            .map(|i| sb.block_bitmap_start + i)
            .collect();
        let mut bitmap_block = vec![];
        for (i, s) in dev.batch_read(&bbm_sectors).into_iter().enumerate() {
            let s = s.ok_or_else(|| anyhow!("Read error at sector {}", bbm_sectors[i]))?;
            bitmap_block.extend_from_slice(&s);
        }

        let mut csum_table = vec![];
        if sb.has_checksums() && sb.checksum_table_start != 0 {
            let sectors: Vec<u32> = (0..sb.checksum_table_sectors as u32)
                .map(|i| sb.checksum_table_start + i)
                .collect();
            for (i, s) in dev.batch_read(&sectors).into_iter().enumerate() {
                let s = s.ok_or_else(|| anyhow!("Read error at sector {}", sectors[i]))?;
                for w in s.chunks_exact(4) {
                    csum_table.push(BigEndian::read_u32(w));
                }
            }
            csum_table.truncate(sb.max_blocks as usize);
        }

        // Pre-warm the inode table while the request can still be batched.
        let table: Vec<u32> = (sb.inode_table_start..sb.block_bitmap_start).collect();
        dev.batch_read(&table);

        let cow = opts.cow.unwrap_or_else(|| sb.has_cow());
        let checksums = sb.has_checksums();
        info!(
            "AXFS '{}' mounted: {} free inodes, {} free blocks, gen {}",
            sb.label, sb.free_inodes, sb.free_blocks, sb.generation
        );
        Ok(Volume {
            dev,
            sb,
            cow,
            checksums,
            bitmap_inode,
            bitmap_block,
            csum_table,
            dirty_csum: HashSet::new(),
            alloc_hint: 0,
            dirty: false,
            checksum_fails: 0,
            inode_cache: HashMap::new(),
            path_cache: LruCache::new(NonZeroUsize::new(PATH_CACHE_CAP).unwrap()),
            dir_cache: HashMap::new(),
        })
    }

    // -- inode I/O ---------------------------------------------------------

    fn inode_location(&self, ino: u16) -> (u32, usize) {
        let per_sector = self.sb.sector_size as usize / INODE_SIZE;
        let sector = self.sb.inode_table_start + ino as u32 / per_sector as u32;
        let offset = ino as usize % per_sector * INODE_SIZE;
        (sector, offset)
    }

    pub fn get_inode(&mut self, ino: u16) -> Result<Inode> {
        if ino == 0 || ino >= self.sb.max_inodes {
            bail!("Not found: inode {}", ino);
        }
        if let Some(node) = self.inode_cache.get(&ino) {
            return Ok(node.clone());
        }
        let (sector, offset) = self.inode_location(ino);
        let buf = self
            .dev
            .read_sector(sector)
            .ok_or_else(|| anyhow!("Read error at sector {}", sector))?;
        let node = Inode::unpack(&buf[offset..offset + INODE_SIZE]);
        if !node.crc_ok {
            warn!("inode {} fails its CRC", ino);
        }
        self.inode_cache.insert(ino, node.clone());
        Ok(node)
    }

    pub fn set_inode(&mut self, ino: u16, node: &Inode) -> Result<()> {
        let (sector, offset) = self.inode_location(ino);
        let mut buf = self
            .dev
            .read_sector(sector)
            .ok_or_else(|| anyhow!("Read error at sector {}", sector))?;
        buf[offset..offset + INODE_SIZE].copy_from_slice(&node.pack());
        if !self.dev.write_sector(sector, &buf) {
            bail!("Write error at sector {}", sector);
        }
        self.inode_cache.insert(ino, node.clone());
        self.dirty = true;
        Ok(())
    }

    // -- bitmaps and allocation --------------------------------------------

    fn bit_get(bitmap: &[u8], i: usize) -> bool {
        bitmap[i / 8] >> (i % 8) & 1 != 0
    }

    fn bit_put(bitmap: &mut [u8], i: usize, v: bool) {
        if v {
            bitmap[i / 8] |= 1 << (i % 8);
        } else {
            bitmap[i / 8] &= !(1 << (i % 8));
        }
    }

    /// First clear bit in the inode bitmap.
    pub fn alloc_inode(&mut self) -> Result<u16> {
        for i in 0..self.sb.max_inodes as usize {
            if !Self::bit_get(&self.bitmap_inode, i) {
                Self::bit_put(&mut self.bitmap_inode, i, true);
                self.sb.free_inodes -= 1;
                self.dirty = true;
                debug!("alloc inode {}", i);
                return Ok(i as u16);
            }
        }
        bail!("No inodes")
    }

    pub fn free_inode(&mut self, ino: u16) {
        if Self::bit_get(&self.bitmap_inode, ino as usize) {
            Self::bit_put(&mut self.bitmap_inode, ino as usize, false);
            self.sb.free_inodes += 1;
            self.dirty = true;
        }
    }

    fn find_run(&self, lo: u32, hi: u32, count: u32) -> Option<u32> {
        let mut run = 0u32;
        for i in lo..hi {
            if Self::bit_get(&self.bitmap_block, i as usize) {
                run = 0;
            } else {
                run += 1;
                if run == count {
                    return Some(i + 1 - count);
                }
            }
        }
        None
    }

    /// `count` consecutive clear bits in the block bitmap, searched from the
    /// rotating hint first, then from the start of the bitmap.
    pub fn alloc_extent(&mut self, count: u32) -> Option<u16> {
        if count == 0 || count > self.sb.max_blocks {
            return None;
        }
        let start = self
            .find_run(self.alloc_hint, self.sb.max_blocks, count)
            .or_else(|| self.find_run(0, self.alloc_hint, count))?;
        for i in start..start + count {
            Self::bit_put(&mut self.bitmap_block, i as usize, true);
        }
        self.sb.free_blocks -= count;
        self.alloc_hint = (start + count) % self.sb.max_blocks;
        self.dirty = true;
        debug!("alloc extent ({}, {})", start, count);
        Some(start as u16)
    }

    pub fn free_extent(&mut self, start: u16, count: u16) {
        for i in start as usize..start as usize + count as usize {
            Self::bit_put(&mut self.bitmap_block, i, false);
        }
        self.sb.free_blocks += count as u32;
        self.dirty = true;
        debug!("free extent ({}, {})", start, count);
    }

    fn count_used(bitmap: &[u8], bits: usize) -> u32 {
        let mut used = 0u32;
        for i in 0..bits {
            if Self::bit_get(bitmap, i) {
                used += 1;
            }
        }
        used
    }

    pub(crate) fn used_inodes(&self) -> u32 {
        Self::count_used(&self.bitmap_inode, self.sb.max_inodes as usize)
    }

    pub(crate) fn used_blocks(&self) -> u32 {
        Self::count_used(&self.bitmap_block, self.sb.max_blocks as usize)
    }

    // -- checksummed block I/O ---------------------------------------------

    fn block_sector(&self, block: u16) -> u32 {
        self.sb.data_start + block as u32
    }

    fn note_checksum(&mut self, block: u16, padded: &[u8]) {
        if !self.checksums || self.csum_table.is_empty() {
            return;
        }
        self.csum_table[block as usize] = crc32(padded);
        let per_sector = self.sb.sector_size as usize / 4;
        self.dirty_csum.insert((block as usize / per_sector) as u16);
    }

    fn verify_checksum(&mut self, block: u16, data: &[u8]) {
        if !self.checksums || self.csum_table.is_empty() {
            return;
        }
        let want = self.csum_table[block as usize];
        if want != 0 && crc32(data) != want {
            self.checksum_fails += 1;
            warn!("checksum mismatch on block {}", block);
        }
    }

    /// Write one data block, updating its checksum cell.
    pub fn wb(&mut self, block: u16, data: &[u8]) -> Result<()> {
        let padded = pad_sector(data, self.sb.sector_size);
        self.note_checksum(block, &padded);
        let sector = self.block_sector(block);
        if !self.dev.write_sector(sector, &padded) {
            bail!("Write error at sector {}", sector);
        }
        Ok(())
    }

    /// Read one data block. A checksum mismatch is counted, not fatal.
    pub fn rb(&mut self, block: u16) -> Result<Vec<u8>> {
        let sector = self.block_sector(block);
        let data = self
            .dev
            .read_sector(sector)
            .ok_or_else(|| anyhow!("Read error at sector {}", sector))?;
        self.verify_checksum(block, &data);
        Ok(data)
    }

    /// Batch-read data blocks through the sector cache.
    pub fn rb_many(&mut self, blocks: &[u16]) -> Result<Vec<Vec<u8>>> {
        let sectors: Vec<u32> = blocks.iter().map(|&b| self.block_sector(b)).collect();
        let mut out = Vec::with_capacity(blocks.len());
        for (i, s) in self.dev.batch_read(&sectors).into_iter().enumerate() {
            let data = s.ok_or_else(|| anyhow!("Read error at sector {}", sectors[i]))?;
            self.verify_checksum(blocks[i], &data);
            out.push(data);
        }
        Ok(out)
    }

    /// Direct extents plus whatever the indirect block carries.
    pub fn all_extents(&mut self, node: &Inode) -> Result<Vec<Extent>> {
        if node.is_inline() {
            return Ok(vec![]);
        }
        let mut out = node.extents.clone();
        out.truncate(node.n_extents as usize);
        if node.n_extents as usize > DIRECT_EXTENTS && node.indirect != 0 {
            let data = self.rb(node.indirect)?;
            for i in 0..node.n_extents as usize - DIRECT_EXTENTS {
                let at = i * 4;
                out.push(Extent {
                    start: BigEndian::read_u16(&data[at..at + 2]),
                    len: BigEndian::read_u16(&data[at + 2..at + 4]),
                });
            }
        }
        Ok(out)
    }

    /// Free every data block the inode references, indirect block included.
    pub(crate) fn free_inode_blocks(&mut self, node: &Inode) -> Result<()> {
        let extents = self.all_extents(node)?;
        for e in extents {
            self.free_extent(e.start, e.len);
        }
        if !node.is_inline() && node.indirect != 0 {
            self.free_extent(node.indirect, 1);
        }
        Ok(())
    }

    /// Write the inode back as FREE and clear its bitmap bit.
    pub(crate) fn release_inode(&mut self, ino: u16) -> Result<()> {
        let mut node = Inode::new(InodeKind::Free, 0, timestamp_now());
        node.links = 0;
        self.set_inode(ino, &node)?;
        self.free_inode(ino);
        Ok(())
    }

    // -- cache coherence ----------------------------------------------------

    /// Any metadata mutation drops all three caches together.
    pub(crate) fn dirty_meta(&mut self) {
        self.inode_cache.clear();
        self.path_cache.clear();
        self.dir_cache.clear();
    }

    // -- durability ---------------------------------------------------------

    fn put_sector(&mut self, n: u32, data: &[u8], retry: bool) -> bool {
        if self.dev.write_sector(n, data) {
            return true;
        }
        if retry {
            warn!("retrying write of sector {}", n);
            return self.dev.write_sector(n, data);
        }
        false
    }

    fn csum_sector_bytes(&self, index: u16) -> Vec<u8> {
        let per_sector = self.sb.sector_size as usize / 4;
        let mut buf = vec![0u8; self.sb.sector_size as usize];
        let base = index as usize * per_sector;
        for i in 0..per_sector {
            let word = self.csum_table.get(base + i).copied().unwrap_or(0);
            BigEndian::write_u32(&mut buf[i * 4..i * 4 + 4], word);
        }
        buf
    }

    /// Push bitmaps, dirty checksum sectors and both superblock copies out.
    fn write_meta(&mut self, retry: bool) -> bool {
        let mut ok = true;

        let bitmap = self.bitmap_inode.clone();
        ok &= self.put_sector(2, &bitmap, retry);

        let ss = self.sb.sector_size as usize;
        for i in 0..self.sb.block_bitmap_sectors as usize {
            let chunk = self.bitmap_block[i * ss..(i + 1) * ss].to_vec();
            ok &= self.put_sector(self.sb.block_bitmap_start + i as u32, &chunk, retry);
        }

        let mut still_dirty = HashSet::new();
        let mut dirty: Vec<u16> = self.dirty_csum.iter().copied().collect();
        dirty.sort_unstable();
        for index in dirty {
            let buf = self.csum_sector_bytes(index);
            let sector = self.sb.checksum_table_start + index as u32;
            if !self.put_sector(sector, &buf, retry) {
                ok = false;
                still_dirty.insert(index);
            }
        }
        self.dirty_csum = still_dirty;

        // Fold the cache's device counters into the lifetime totals and
        // stamp a new generation before both copies go out.
        self.sb.lifetime_reads = self.sb.lifetime_reads.wrapping_add(self.dev.dev_reads);
        self.sb.lifetime_writes = self.sb.lifetime_writes.wrapping_add(self.dev.dev_writes);
        self.dev.dev_reads = 0;
        self.dev.dev_writes = 0;
        self.sb.modified = timestamp_now();
        self.sb.generation += 1;
        let mut features = 0u16;
        if self.checksums && self.sb.checksum_table_start != 0 {
            features |= FEAT_CHECKSUMS;
        }
        if self.cow {
            features |= FEAT_COW;
        }
        self.sb.features = features;
        let packed = self.sb.pack();
        ok &= self.put_sector(0, &packed, retry);
        ok &= self.put_sector(1, &packed, retry);
        ok
    }

    /// Durability point: after `flush` returns, bitmaps, checksum table and
    /// superblock are on the device.
    pub fn flush(&mut self) -> Result<()> {
        if !self.write_meta(false) {
            bail!("Write error flushing metadata");
        }
        self.dirty = false;
        debug!("flushed, gen {}", self.sb.generation);
        Ok(())
    }

    /// Flush and hand the device back.
    pub fn unmount(mut self) -> Result<Box<dyn BlockDevice>> {
        self.flush()?;
        Ok(self.dev.into_inner())
    }

    /// Memory-pressure relief: flush with one retry per critical sector,
    /// then drop every in-memory cache even if a retry failed.
    pub fn purge_cache(&mut self) -> bool {
        let ok = self.write_meta(true);
        if ok {
            self.dirty = false;
        } else {
            error!("purge_cache could not persist all metadata");
        }
        self.dev.purge();
        self.dirty_meta();
        ok
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.dev.stats()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}
