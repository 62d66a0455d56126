/// Volume operations: path resolution, directories, the CoW write engine
/// and the public filesystem API.
use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};
use byteorder::{BigEndian, ByteOrder};
use log::*;

use block_dev::BlockDevice;

use super::desc::*;
use super::utils::*;
use super::Volume;

/// Blocks of a directory, in entry order. Directories stay on their direct
/// extents; files are the ones that go indirect.
fn dir_blocks(node: &Inode) -> Vec<u16> {
    node.extents
        .iter()
        .flat_map(|e| (0..e.len).map(move |i| e.start + i))
        .collect()
}

impl Volume {
    // -- path resolution ----------------------------------------------------

    /// Tokenize a path, folding `.` and `..` away. `..` never climbs above
    /// the root.
    pub fn split_path(path: &str) -> Vec<String> {
        let mut parts: Vec<String> = vec![];
        for tok in path.split('/') {
            match tok {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                t => parts.push(t.to_string()),
            }
        }
        parts
    }

    /// Walk a path down from the root, memoizing the result.
    pub fn resolve(&mut self, path: &str) -> Result<u16> {
        let parts = Self::split_path(path);
        let key = format!("/{}", parts.join("/"));
        if let Some(&ino) = self.path_cache.get(&key) {
            return Ok(ino);
        }
        let mut cur = ROOT_INO;
        for name in &parts {
            match self.dir_lookup(cur, name)? {
                Some((ino, _)) => cur = ino,
                None => bail!("Not found: {}", name),
            }
        }
        self.path_cache.put(key, cur);
        Ok(cur)
    }

    /// Resolve the parent directory; the final component comes back
    /// separately. The root resolves to itself with an empty name.
    pub fn rpar(&mut self, path: &str) -> Result<(u16, String)> {
        let mut parts = Self::split_path(path);
        match parts.pop() {
            None => Ok((ROOT_INO, String::new())),
            Some(name) => {
                let parent = format!("/{}", parts.join("/"));
                let pino = self.resolve(&parent)?;
                Ok((pino, name))
            }
        }
    }

    // -- directory operations -----------------------------------------------

    /// Build the directory's name hash on first touch; one batch read per
    /// directory until the next metadata mutation drops it.
    fn ensure_dir_map(&mut self, dino: u16) -> Result<()> {
        if self.dir_cache.contains_key(&dino) {
            return Ok(());
        }
        let node = self.get_inode(dino)?;
        if node.kind != InodeKind::Dir {
            bail!("Not a dir");
        }
        let blocks = dir_blocks(&node);
        let datas = self.rb_many(&blocks)?;
        let mut map = HashMap::new();
        for data in &datas {
            for chunk in data.chunks_exact(DIR_ENTRY_SIZE) {
                let e = DirEntry::unpack(chunk);
                if !e.is_empty() {
                    map.insert(e.name, (e.ino, e.kind));
                }
            }
        }
        self.dir_cache.insert(dino, map);
        Ok(())
    }

    fn dir_lookup(&mut self, dino: u16, name: &str) -> Result<Option<(u16, InodeKind)>> {
        self.ensure_dir_map(dino)?;
        Ok(self
            .dir_cache
            .get(&dino)
            .and_then(|m| m.get(name).copied()))
    }

    /// Add an entry: first tombstone slot wins, otherwise the directory
    /// grows by one block.
    fn dadd(&mut self, dino: u16, entry: &DirEntry) -> Result<()> {
        let mut dir = self.get_inode(dino)?;
        if dir.kind != InodeKind::Dir {
            bail!("Not a dir");
        }
        let packed = entry.pack();
        for b in dir_blocks(&dir) {
            let mut data = self.rb(b)?;
            let slot = data
                .chunks_exact(DIR_ENTRY_SIZE)
                .position(|chunk| DirEntry::unpack(chunk).is_empty());
            if let Some(i) = slot {
                data[i * DIR_ENTRY_SIZE..(i + 1) * DIR_ENTRY_SIZE].copy_from_slice(&packed);
                self.wb(b, &data)?;
                dir.mtime = timestamp_now();
                self.set_inode(dino, &dir)?;
                self.dirty_meta();
                return Ok(());
            }
        }
        // No free slot anywhere: grow by one block.
        let nb = match self.alloc_extent(1) {
            Some(b) => b,
            None => bail!("Disk full"),
        };
        let mut data = vec![0u8; self.sb.sector_size as usize];
        data[..DIR_ENTRY_SIZE].copy_from_slice(&packed);
        self.wb(nb, &data)?;
        let adjacent = dir
            .extents
            .last()
            .map_or(false, |last| last.start + last.len == nb);
        if adjacent {
            if let Some(last) = dir.extents.last_mut() {
                last.len += 1;
            }
        } else {
            if dir.extents.len() >= DIRECT_EXTENTS {
                self.free_extent(nb, 1);
                bail!("Full");
            }
            dir.extents.push(Extent { start: nb, len: 1 });
            dir.n_extents = dir.extents.len() as u16;
        }
        dir.size += self.sb.sector_size as u32;
        dir.mtime = timestamp_now();
        self.set_inode(dino, &dir)?;
        self.dirty_meta();
        Ok(())
    }

    /// Remove an entry by zeroing its slot.
    fn dremove(&mut self, dino: u16, name: &str) -> Result<()> {
        let mut dir = self.get_inode(dino)?;
        if dir.kind != InodeKind::Dir {
            bail!("Not a dir");
        }
        for b in dir_blocks(&dir) {
            let mut data = self.rb(b)?;
            for i in 0..data.len() / DIR_ENTRY_SIZE {
                let at = i * DIR_ENTRY_SIZE;
                let e = DirEntry::unpack(&data[at..at + DIR_ENTRY_SIZE]);
                if !e.is_empty() && e.name == name {
                    data[at..at + DIR_ENTRY_SIZE].fill(0);
                    self.wb(b, &data)?;
                    dir.mtime = timestamp_now();
                    self.set_inode(dino, &dir)?;
                    self.dirty_meta();
                    return Ok(());
                }
            }
        }
        bail!("Not found: {}", name)
    }

    fn dir_is_empty(&mut self, node: &Inode) -> Result<bool> {
        for b in dir_blocks(node) {
            let data = self.rb(b)?;
            for chunk in data.chunks_exact(DIR_ENTRY_SIZE) {
                let e = DirEntry::unpack(chunk);
                if !e.is_empty() && e.name != "." && e.name != ".." {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    // -- CoW write engine ---------------------------------------------------

    /// Store `data` as the inode's new payload. New blocks are allocated and
    /// written first; the single inode write is the commit point; old blocks
    /// are freed only afterwards when CoW is on.
    fn write_inode_data(&mut self, ino: u16, node: &mut Inode, data: &[u8]) -> Result<()> {
        let now = timestamp_now();
        let old_extents = self.all_extents(node)?;
        let old_indirect = if node.is_inline() { 0 } else { node.indirect };
        let cow = self.cow;
        if !cow {
            // Fast path frees up front and reuses the blocks in place.
            for e in &old_extents {
                self.free_extent(e.start, e.len);
            }
            if old_indirect != 0 {
                self.free_extent(old_indirect, 1);
            }
        }

        if data.len() <= INLINE_MAX {
            node.flags = INODE_FLAG_INLINE | INODE_FLAG_CHECKSUM;
            node.inline = data.to_vec();
            node.extents.clear();
            node.n_extents = 0;
            node.indirect = 0;
            node.size = data.len() as u32;
            node.mtime = now;
            self.set_inode(ino, node)?;
            if cow {
                for e in &old_extents {
                    self.free_extent(e.start, e.len);
                }
                if old_indirect != 0 {
                    self.free_extent(old_indirect, 1);
                }
                self.sb.cow_generation += 1;
            }
            return Ok(());
        }

        node.flags = INODE_FLAG_CHECKSUM;
        node.inline.clear();
        let ss = self.sb.sector_size as usize;
        let need = ceil_div(data.len(), ss) as u32;

        // Contiguous first; halve the request until something fits.
        let mut new_extents: Vec<Extent> = vec![];
        let mut remaining = need;
        'fill: while remaining > 0 {
            let mut try_len = remaining;
            loop {
                if let Some(start) = self.alloc_extent(try_len) {
                    new_extents.push(Extent {
                        start,
                        len: try_len as u16,
                    });
                    remaining -= try_len;
                    continue 'fill;
                }
                if try_len == 1 {
                    for e in &new_extents {
                        self.free_extent(e.start, e.len);
                    }
                    bail!("Disk full");
                }
                try_len = (try_len + 1) / 2;
            }
        }
        if new_extents.len() > 1 {
            debug!(
                "fragmented write: {} blocks over {} extents",
                need,
                new_extents.len()
            );
        }

        let mut off = 0usize;
        for e in &new_extents {
            for i in 0..e.len {
                let end = (off + ss).min(data.len());
                self.wb(e.start + i, &data[off..end])?;
                off = end;
            }
        }

        let mut indirect = 0u16;
        if new_extents.len() > DIRECT_EXTENTS {
            let spill = &new_extents[DIRECT_EXTENTS..];
            if spill.len() * 4 > ss {
                for e in &new_extents {
                    self.free_extent(e.start, e.len);
                }
                bail!("Disk full");
            }
            indirect = match self.alloc_extent(1) {
                Some(b) => b,
                None => {
                    for e in &new_extents {
                        self.free_extent(e.start, e.len);
                    }
                    bail!("Disk full");
                }
            };
            let mut buf = vec![0u8; ss];
            for (i, e) in spill.iter().enumerate() {
                BigEndian::write_u16(&mut buf[i * 4..i * 4 + 2], e.start);
                BigEndian::write_u16(&mut buf[i * 4 + 2..i * 4 + 4], e.len);
            }
            self.wb(indirect, &buf)?;
        }

        node.n_extents = new_extents.len() as u16;
        node.extents = new_extents.iter().take(DIRECT_EXTENTS).cloned().collect();
        node.indirect = indirect;
        node.size = data.len() as u32;
        node.mtime = now;
        // The one-sector inode write is the atomic commit point.
        self.set_inode(ino, node)?;

        if cow {
            for e in &old_extents {
                self.free_extent(e.start, e.len);
            }
            if old_indirect != 0 {
                self.free_extent(old_indirect, 1);
            }
            self.sb.cow_generation += 1;
        }
        Ok(())
    }

    // -- public API ---------------------------------------------------------

    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let ino = self.resolve(path)?;
        let node = self.get_inode(ino)?;
        match node.kind {
            InodeKind::File | InodeKind::Link => {}
            InodeKind::Dir => bail!("Is dir"),
            InodeKind::Free => bail!("Not file"),
        }
        if node.is_inline() {
            let n = (node.size as usize).min(node.inline.len());
            return Ok(node.inline[..n].to_vec());
        }
        let extents = self.all_extents(&node)?;
        let blocks: Vec<u16> = extents
            .iter()
            .flat_map(|e| (0..e.len).map(move |i| e.start + i))
            .collect();
        let mut out = Vec::with_capacity(node.size as usize);
        for data in self.rb_many(&blocks)? {
            out.extend_from_slice(&data);
        }
        out.truncate(node.size as usize);
        Ok(out)
    }

    pub fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let (pino, name) = self.rpar(path)?;
        if name.is_empty() {
            bail!("Bad path");
        }
        check_name(&name)?;
        match self.dir_lookup(pino, &name)? {
            Some((ino, kind)) => {
                if kind == InodeKind::Dir {
                    bail!("Is dir");
                }
                let mut node = self.get_inode(ino)?;
                self.write_inode_data(ino, &mut node, data)?;
            }
            None => {
                let ino = self.alloc_inode()?;
                let mut node = Inode::new(InodeKind::File, 0o644, timestamp_now());
                if let Err(e) = self.write_inode_data(ino, &mut node, data) {
                    self.free_inode(ino);
                    return Err(e);
                }
                if let Err(e) = self.dadd(
                    pino,
                    &DirEntry {
                        ino,
                        kind: InodeKind::File,
                        name: name.clone(),
                    },
                ) {
                    self.free_inode_blocks(&node).ok();
                    self.release_inode(ino).ok();
                    return Err(e);
                }
            }
        }
        self.dirty_meta();
        Ok(())
    }

    pub fn remove_file(&mut self, path: &str) -> Result<()> {
        let (pino, name) = self.rpar(path)?;
        if name.is_empty() {
            bail!("Bad path");
        }
        let (ino, _) = self
            .dir_lookup(pino, &name)?
            .ok_or_else(|| anyhow!("Not found: {}", name))?;
        let mut node = self.get_inode(ino)?;
        if node.kind == InodeKind::Dir {
            bail!("Is dir");
        }
        self.dremove(pino, &name)?;
        node.links = node.links.saturating_sub(1);
        if node.links == 0 {
            self.free_inode_blocks(&node)?;
            self.release_inode(ino)?;
        } else {
            self.set_inode(ino, &node)?;
        }
        self.dirty_meta();
        Ok(())
    }

    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        let (pino, name) = self.rpar(path)?;
        if name.is_empty() {
            // The root already exists.
            bail!("Exists");
        }
        check_name(&name)?;
        if self.dir_lookup(pino, &name)?.is_some() {
            bail!("Exists");
        }
        let ino = self.alloc_inode()?;
        let block = match self.alloc_extent(1) {
            Some(b) => b,
            None => {
                self.free_inode(ino);
                bail!("Disk full");
            }
        };
        let now = timestamp_now();
        let ss = self.sb.sector_size as usize;
        // One write: `.` points at the new directory, `..` at its parent.
        let mut data = vec![0u8; ss];
        data[..DIR_ENTRY_SIZE].copy_from_slice(
            &DirEntry {
                ino,
                kind: InodeKind::Dir,
                name: ".".to_string(),
            }
            .pack(),
        );
        data[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE].copy_from_slice(
            &DirEntry {
                ino: pino,
                kind: InodeKind::Dir,
                name: "..".to_string(),
            }
            .pack(),
        );
        self.wb(block, &data)?;
        let mut node = Inode::new(InodeKind::Dir, 0o755, now);
        node.links = 2;
        node.size = ss as u32;
        node.n_extents = 1;
        node.extents = vec![Extent { start: block, len: 1 }];
        if self.checksums {
            node.flags |= INODE_FLAG_CHECKSUM;
        }
        self.set_inode(ino, &node)?;
        if let Err(e) = self.dadd(
            pino,
            &DirEntry {
                ino,
                kind: InodeKind::Dir,
                name: name.clone(),
            },
        ) {
            self.free_extent(block, 1);
            self.release_inode(ino).ok();
            return Err(e);
        }
        // dadd already rewrote the parent on disk; re-read it before the
        // link bump so the stale in-memory copy is not written back.
        let mut parent = self.get_inode(pino)?;
        parent.links += 1;
        self.set_inode(pino, &parent)?;
        self.dirty_meta();
        Ok(())
    }

    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        let (pino, name) = self.rpar(path)?;
        if name.is_empty() {
            bail!("Bad path");
        }
        let (ino, _) = self
            .dir_lookup(pino, &name)?
            .ok_or_else(|| anyhow!("Not found: {}", name))?;
        let node = self.get_inode(ino)?;
        if node.kind != InodeKind::Dir {
            bail!("Not dir");
        }
        if !self.dir_is_empty(&node)? {
            bail!("Not empty");
        }
        self.dremove(pino, &name)?;
        for e in node.extents.clone() {
            self.free_extent(e.start, e.len);
        }
        self.release_inode(ino)?;
        let mut parent = self.get_inode(pino)?;
        parent.links = parent.links.saturating_sub(1);
        self.set_inode(pino, &parent)?;
        self.dirty_meta();
        Ok(())
    }

    /// Move an entry: add under the new name, drop the old one, same inode.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        let (opino, oname) = self.rpar(old)?;
        if oname.is_empty() {
            bail!("Bad path");
        }
        let (npino, nname) = self.rpar(new)?;
        if nname.is_empty() {
            bail!("Bad path");
        }
        check_name(&nname)?;
        let (ino, kind) = self
            .dir_lookup(opino, &oname)?
            .ok_or_else(|| anyhow!("Not found: {}", oname))?;
        if self.dir_lookup(npino, &nname)?.is_some() {
            bail!("Exists");
        }
        self.dadd(
            npino,
            &DirEntry {
                ino,
                kind,
                name: nname.clone(),
            },
        )?;
        self.dremove(opino, &oname)?;
        if kind == InodeKind::Dir && opino != npino {
            // The moved directory's `..` now lives under a different parent.
            let node = self.get_inode(ino)?;
            if let Some(first) = node.extents.first().map(|e| e.start) {
                let mut data = self.rb(first)?;
                data[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE].copy_from_slice(
                    &DirEntry {
                        ino: npino,
                        kind: InodeKind::Dir,
                        name: "..".to_string(),
                    }
                    .pack(),
                );
                self.wb(first, &data)?;
            }
            let mut op = self.get_inode(opino)?;
            op.links = op.links.saturating_sub(1);
            self.set_inode(opino, &op)?;
            let mut np = self.get_inode(npino)?;
            np.links += 1;
            self.set_inode(npino, &np)?;
        }
        self.dirty_meta();
        Ok(())
    }

    /// Entries of a directory; `.` and `..` stay out of the listing.
    pub fn list_dir(&mut self, path: &str) -> Result<Vec<Entry>> {
        let ino = self.resolve(path)?;
        let node = self.get_inode(ino)?;
        if node.kind != InodeKind::Dir {
            bail!("Not a dir");
        }
        let blocks = dir_blocks(&node);
        let datas = self.rb_many(&blocks)?;
        let mut out = vec![];
        for data in datas {
            for chunk in data.chunks_exact(DIR_ENTRY_SIZE) {
                let e = DirEntry::unpack(chunk);
                if e.is_empty() || e.name == "." || e.name == ".." {
                    continue;
                }
                let child = self.get_inode(e.ino)?;
                out.push(Entry {
                    name: e.name,
                    ino: e.ino,
                    kind: e.kind,
                    size: child.size,
                    mode: child.mode,
                    inline: child.is_inline(),
                });
            }
        }
        Ok(out)
    }

    pub fn stat(&mut self, path: &str) -> Result<Stat> {
        let ino = self.resolve(path)?;
        let node = self.get_inode(ino)?;
        if node.kind == InodeKind::Free {
            bail!("Not found: {}", path);
        }
        Ok(Stat {
            ino,
            kind: node.kind,
            size: node.size,
            mode: node.mode,
            uid: node.uid,
            gid: node.gid,
            links: node.links,
            ctime: node.ctime,
            mtime: node.mtime,
            inline: node.is_inline(),
            n_extents: node.n_extents,
        })
    }

    pub fn info(&self) -> Info {
        Info {
            label: self.sb.label.clone(),
            version: AXFS_VERSION,
            sector_size: self.sb.sector_size,
            total_sectors: self.sb.total_sectors,
            max_inodes: self.sb.max_inodes,
            max_blocks: self.sb.max_blocks,
            free_inodes: self.sb.free_inodes,
            free_blocks: self.sb.free_blocks,
            data_start: self.sb.data_start,
            generation: self.sb.generation,
            checksums: self.checksums,
            cow: self.cow,
            checksum_fails: self.checksum_fails,
            lifetime_reads: self.sb.lifetime_reads.wrapping_add(self.dev.dev_reads),
            lifetime_writes: self.sb.lifetime_writes.wrapping_add(self.dev.dev_writes),
        }
    }

    /// Verify the stored superblocks, the root inode, and the free counts
    /// against bitmap truth; surface the checksum-failure counter.
    pub fn health(&mut self) -> Health {
        let mut issues = vec![];
        for n in [0u32, 1] {
            match self.dev.read_sector(n) {
                Some(buf) => {
                    if !matches!(SuperBlock::probe(&buf), SbProbe::Valid(_)) {
                        issues.push(format!("superblock copy {} invalid", n));
                    }
                }
                None => issues.push(format!("superblock copy {} unreadable", n)),
            }
        }
        match self.get_inode(ROOT_INO) {
            Ok(root) => {
                if root.kind != InodeKind::Dir {
                    issues.push("root inode is not a directory".to_string());
                }
                if root.links < 2 {
                    issues.push("root inode link count below 2".to_string());
                }
                if !root.crc_ok {
                    issues.push("root inode CRC invalid".to_string());
                }
            }
            Err(e) => issues.push(format!("root inode unreadable: {}", e)),
        }
        let free_inodes = self.sb.max_inodes as u32 - self.used_inodes();
        if free_inodes != self.sb.free_inodes as u32 {
            issues.push(format!(
                "free inode count mismatch: superblock {}, bitmap {}",
                self.sb.free_inodes, free_inodes
            ));
        }
        let free_blocks = self.sb.max_blocks - self.used_blocks();
        if free_blocks != self.sb.free_blocks {
            issues.push(format!(
                "free block count mismatch: superblock {}, bitmap {}",
                self.sb.free_blocks, free_blocks
            ));
        }
        if self.checksum_fails > 0 {
            issues.push(format!("{} checksum failure(s)", self.checksum_fails));
        }
        Health {
            ok: issues.is_empty(),
            issues,
            cache: self.dev.stats(),
        }
    }

    pub fn set_cow(&mut self, on: bool) {
        self.cow = on;
        self.dirty = true;
    }

    /// Checksumming needs the on-disk table the volume was formatted with.
    pub fn set_checksums(&mut self, on: bool) -> Result<()> {
        if on && self.sb.checksum_table_start == 0 {
            bail!("No checksum table");
        }
        self.checksums = on;
        self.dirty = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{format, Volume};
    use super::*;
    use block_dev::MemBlockDevice;

    const SS: usize = 512;

    fn mkfs(sectors: u32, inodes: u16, checksums: bool, cow: bool) -> (MemBlockDevice, Volume) {
        let mut dev = MemBlockDevice::new(SS as u16, sectors);
        format(
            &mut dev,
            &FormatOptions {
                label: "TEST".to_string(),
                max_inodes: inodes,
                checksums,
                cow,
            },
        )
        .unwrap();
        let vol = Volume::mount(Box::new(dev.share()), &MountOptions::default()).unwrap();
        (dev, vol)
    }

    fn remount(vol: Volume) -> Volume {
        let dev = vol.unmount().unwrap();
        Volume::mount(dev, &MountOptions::default()).unwrap()
    }

    #[test]
    fn format_mount_roundtrip() {
        let (_dev, mut vol) = mkfs(4096, 64, true, true);
        assert!(vol.list_dir("/").unwrap().is_empty());
        vol.write_file("/hello.txt", b"hello").unwrap();
        vol.flush().unwrap();
        let mut vol = remount(vol);
        assert_eq!(vol.read_file("/hello.txt").unwrap(), b"hello");
        let st = vol.stat("/hello.txt").unwrap();
        assert_eq!(st.size, 5);
        assert!(st.inline);
        assert_eq!(st.kind, InodeKind::File);
    }

    #[test]
    fn large_file_roundtrip() {
        let (_dev, mut vol) = mkfs(4096, 64, true, true);
        let bytes: Vec<u8> = (0..10_000u32).map(|i| (i * 31 % 251) as u8).collect();
        vol.write_file("/big.bin", &bytes).unwrap();
        let st = vol.stat("/big.bin").unwrap();
        assert_eq!(st.size, 10_000);
        assert!(!st.inline);
        assert!(st.n_extents >= 1);
        assert_eq!(vol.read_file("/big.bin").unwrap(), bytes);
        // Still intact after a flush and remount.
        let mut vol = remount(vol);
        assert_eq!(vol.read_file("/big.bin").unwrap(), bytes);
    }

    #[test]
    fn directory_tree_operations() {
        let (_dev, mut vol) = mkfs(4096, 64, true, true);
        vol.mkdir("/a").unwrap();
        vol.mkdir("/a/b").unwrap();
        vol.write_file("/a/b/c.txt", b"x").unwrap();

        let ls = vol.list_dir("/a").unwrap();
        assert_eq!(ls.len(), 1);
        assert_eq!(ls[0].name, "b");
        assert_eq!(ls[0].kind, InodeKind::Dir);

        let ls = vol.list_dir("/a/b").unwrap();
        assert_eq!(ls.len(), 1);
        assert_eq!(ls[0].name, "c.txt");
        assert_eq!(ls[0].kind, InodeKind::File);
        assert_eq!(ls[0].size, 1);

        assert_eq!(vol.rmdir("/a").unwrap_err().to_string(), "Not empty");
        vol.remove_file("/a/b/c.txt").unwrap();
        vol.rmdir("/a/b").unwrap();
        vol.rmdir("/a").unwrap();
        assert!(vol.list_dir("/").unwrap().is_empty());
    }

    #[test]
    fn mkdir_maintains_parent_links() {
        let (_dev, mut vol) = mkfs(4096, 64, true, true);
        let before = vol.stat("/").unwrap().links;
        vol.mkdir("/sub").unwrap();
        assert_eq!(vol.stat("/").unwrap().links, before + 1);
        assert_eq!(vol.stat("/sub").unwrap().links, 2);
        vol.rmdir("/sub").unwrap();
        assert_eq!(vol.stat("/").unwrap().links, before);
    }

    #[test]
    fn path_canonicalization() {
        let (_dev, mut vol) = mkfs(4096, 64, true, true);
        vol.mkdir("/a").unwrap();
        vol.write_file("/a/f.txt", b"data").unwrap();
        assert_eq!(vol.read_file("/a/./f.txt").unwrap(), b"data");
        assert_eq!(vol.read_file("/a/../a/f.txt").unwrap(), b"data");
        assert_eq!(vol.read_file("//a///f.txt").unwrap(), b"data");
        // `..` does not climb above the root.
        assert_eq!(vol.read_file("/../../a/f.txt").unwrap(), b"data");
    }

    #[test]
    fn stable_error_strings() {
        let (_dev, mut vol) = mkfs(4096, 64, true, true);
        vol.mkdir("/d").unwrap();
        vol.write_file("/f", b"zz").unwrap();
        assert_eq!(vol.read_file("/nope").unwrap_err().to_string(), "Not found: nope");
        assert_eq!(vol.read_file("/d").unwrap_err().to_string(), "Is dir");
        assert_eq!(vol.remove_file("/d").unwrap_err().to_string(), "Is dir");
        assert_eq!(vol.rmdir("/f").unwrap_err().to_string(), "Not dir");
        assert_eq!(vol.mkdir("/d").unwrap_err().to_string(), "Exists");
        assert_eq!(vol.list_dir("/f").unwrap_err().to_string(), "Not a dir");
        assert_eq!(
            vol.write_file("/missing/f", b"x").unwrap_err().to_string(),
            "Not found: missing"
        );
        assert_eq!(
            vol.write_file(&format!("/{}", "n".repeat(28)), b"x")
                .unwrap_err()
                .to_string(),
            "Bad name"
        );
        assert_eq!(vol.remove_file("/").unwrap_err().to_string(), "Bad path");
    }

    #[test]
    fn inline_boundary_is_52_bytes() {
        let (_dev, mut vol) = mkfs(4096, 64, true, true);
        vol.write_file("/at52", &[7u8; 52]).unwrap();
        vol.write_file("/at53", &[7u8; 53]).unwrap();
        let a = vol.stat("/at52").unwrap();
        let b = vol.stat("/at53").unwrap();
        assert!(a.inline);
        assert_eq!(a.n_extents, 0);
        assert!(!b.inline);
        assert_eq!(b.n_extents, 1);
        assert_eq!(vol.read_file("/at52").unwrap(), vec![7u8; 52]);
        assert_eq!(vol.read_file("/at53").unwrap(), vec![7u8; 53]);
    }

    #[test]
    fn overwrite_under_cow_keeps_free_count() {
        let (_dev, mut vol) = mkfs(4096, 64, true, true);
        vol.write_file("/f", &[1u8; 3 * SS]).unwrap();
        let free = vol.info().free_blocks;
        vol.write_file("/f", &[2u8; 3 * SS]).unwrap();
        assert_eq!(vol.info().free_blocks, free);
        assert_eq!(vol.read_file("/f").unwrap(), vec![2u8; 3 * SS]);
        assert!(vol.health().ok);
    }

    #[test]
    fn remove_file_returns_all_blocks() {
        let (_dev, mut vol) = mkfs(4096, 64, true, true);
        let free = vol.info().free_blocks;
        let inodes = vol.info().free_inodes;
        vol.write_file("/f", &[9u8; 5 * SS]).unwrap();
        vol.remove_file("/f").unwrap();
        assert_eq!(vol.info().free_blocks, free);
        assert_eq!(vol.info().free_inodes, inodes);
        assert_eq!(vol.read_file("/f").unwrap_err().to_string(), "Not found: f");
        assert!(vol.health().ok);
    }

    #[test]
    fn rename_preserves_inode_and_content() {
        let (_dev, mut vol) = mkfs(4096, 64, true, true);
        vol.mkdir("/a").unwrap();
        vol.mkdir("/b").unwrap();
        vol.write_file("/a/f", b"payload").unwrap();
        let ino = vol.stat("/a/f").unwrap().ino;
        vol.rename("/a/f", "/b/g").unwrap();
        assert_eq!(vol.stat("/b/g").unwrap().ino, ino);
        assert_eq!(vol.read_file("/b/g").unwrap(), b"payload");
        assert_eq!(vol.read_file("/a/f").unwrap_err().to_string(), "Not found: f");
        assert!(vol.list_dir("/a").unwrap().is_empty());
    }

    #[test]
    fn rename_directory_rewrites_dotdot() {
        let (_dev, mut vol) = mkfs(4096, 64, true, true);
        vol.mkdir("/a").unwrap();
        vol.mkdir("/b").unwrap();
        vol.mkdir("/a/sub").unwrap();
        vol.write_file("/a/sub/f", b"v").unwrap();
        let a_links = vol.stat("/a").unwrap().links;
        vol.rename("/a/sub", "/b/sub").unwrap();
        assert_eq!(vol.read_file("/b/sub/f").unwrap(), b"v");
        assert_eq!(vol.stat("/a").unwrap().links, a_links - 1);
        // The stored `..` entry now carries the new parent's inode.
        let sub = vol.stat("/b/sub").unwrap().ino;
        let b_ino = vol.stat("/b").unwrap().ino;
        let first = vol.get_inode(sub).unwrap().extents[0].start;
        let data = vol.rb(first).unwrap();
        let dotdot = DirEntry::unpack(&data[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE]);
        assert_eq!(dotdot.name, "..");
        assert_eq!(dotdot.ino, b_ino);
        assert_eq!(
            vol.rename("/b/sub", "/b/sub").unwrap_err().to_string(),
            "Exists"
        );
    }

    #[test]
    fn checksum_corruption_is_detected_not_fatal() {
        let (dev, mut vol) = mkfs(4096, 64, true, true);
        let payload = vec![0x5Au8; 2 * SS];
        vol.write_file("/data.bin", &payload).unwrap();
        vol.flush().unwrap();
        let data_start = vol.info().data_start;
        drop(vol.unmount().unwrap());

        // Flip a byte of the file's first data block behind the volume's
        // back. Block 0 is the root directory, the file begins at block 1.
        dev.corrupt(data_start + 1, 100, 0xFF);

        let mut vol = Volume::mount(Box::new(dev.share()), &MountOptions::default()).unwrap();
        let got = vol.read_file("/data.bin").unwrap();
        assert_eq!(got.len(), payload.len());
        assert_ne!(got, payload);
        assert!(vol.info().checksum_fails >= 1);
        let health = vol.health();
        assert!(!health.ok);
        assert!(health
            .issues
            .iter()
            .any(|i| i.contains("checksum failure(s)")));
    }

    #[test]
    fn fragmented_write_spans_multiple_extents() {
        // 17 data blocks: root + 10 single-block files + 6 tail blocks.
        let (_dev, mut vol) = mkfs(32, 64, false, true);
        assert_eq!(vol.info().max_blocks, 17);
        for i in 0..10 {
            vol.write_file(&format!("/f{}", i), &[i as u8; SS]).unwrap();
        }
        for i in (1..10).step_by(2) {
            vol.remove_file(&format!("/f{}", i)).unwrap();
        }
        // Eleven sectors cannot come from any single run now.
        let bytes: Vec<u8> = (0..11 * SS).map(|i| (i % 239) as u8).collect();
        vol.write_file("/spread.bin", &bytes).unwrap();
        let st = vol.stat("/spread.bin").unwrap();
        assert!(st.n_extents > 1, "expected a fragmented allocation");
        assert_eq!(vol.read_file("/spread.bin").unwrap(), bytes);
        assert!(vol.health().ok);
    }

    #[test]
    fn indirect_block_past_13_extents() {
        // 32 data blocks. Thirty single-block files plus one directory
        // growth block fill everything; deleting every other file leaves
        // fifteen isolated holes and no larger run.
        let (_dev, mut vol) = mkfs(47, 64, false, true);
        assert_eq!(vol.info().max_blocks, 32);
        for i in 1..=30 {
            vol.write_file(&format!("/f{}", i), &[i as u8; SS]).unwrap();
        }
        for i in (1..=29).step_by(2) {
            vol.remove_file(&format!("/f{}", i)).unwrap();
        }
        assert_eq!(vol.info().free_blocks, 15);
        // Fourteen data blocks plus the indirect block itself.
        let bytes: Vec<u8> = (0..14 * SS).map(|i| (i % 233) as u8).collect();
        vol.write_file("/many.bin", &bytes).unwrap();
        let st = vol.stat("/many.bin").unwrap();
        assert!(st.n_extents > 13, "n_extents = {}", st.n_extents);
        assert_eq!(vol.info().free_blocks, 0);
        assert_eq!(vol.read_file("/many.bin").unwrap(), bytes);
        // Removing the file frees the indirect block with it.
        vol.remove_file("/many.bin").unwrap();
        assert_eq!(vol.info().free_blocks, 15);
        assert!(vol.health().ok);
    }

    #[test]
    fn allocation_rollback_on_disk_full() {
        let (_dev, mut vol) = mkfs(4096, 64, true, true);
        let free = vol.info().free_blocks;
        vol.write_file("/fill", &vec![0xABu8; (free - 3) as usize * SS])
            .unwrap();
        assert_eq!(vol.info().free_blocks, 3);
        let inodes = vol.info().free_inodes;
        let err = vol
            .write_file("/too_big", &vec![1u8; 4 * SS])
            .unwrap_err();
        assert_eq!(err.to_string(), "Disk full");
        assert_eq!(vol.info().free_blocks, 3);
        assert_eq!(vol.info().free_inodes, inodes);
        assert!(vol.health().ok);
    }

    #[test]
    fn cow_crash_after_commit_leaks_but_stays_consistent() {
        let (dev, mut vol) = mkfs(4096, 64, true, true);
        vol.write_file("/f", &[1u8; 2 * SS]).unwrap();
        vol.flush().unwrap();
        // Old payload lives in blocks 1..3; the overwrite commits the inode
        // to fresh blocks but the crash loses the in-memory bitmap update.
        vol.write_file("/f", &[2u8; 2 * SS]).unwrap();
        drop(vol); // crash: no flush

        let mut vol = Volume::mount(Box::new(dev.share()), &MountOptions::default()).unwrap();
        // The committed inode wins: new data is visible.
        assert_eq!(vol.read_file("/f").unwrap(), vec![2u8; 2 * SS]);
        // Blocks 1 and 2 held the old payload. Nothing references them any
        // more, but their bits are still set: a leak, detectable by
        // reconciling live inodes against the bitmap.
        let ino = vol.stat("/f").unwrap().ino;
        let node = vol.get_inode(ino).unwrap();
        assert!(node.extents.iter().all(|e| e.start > 2));
        assert!(Volume::bit_get(&vol.bitmap_block, 1));
        assert!(Volume::bit_get(&vol.bitmap_block, 2));
    }

    #[test]
    fn purge_cache_is_transparent_to_readers() {
        let (_dev, mut vol) = mkfs(4096, 64, true, true);
        let bytes: Vec<u8> = (0..5 * SS).map(|i| (i % 241) as u8).collect();
        vol.write_file("/keep.bin", &bytes).unwrap();
        let before = vol.read_file("/keep.bin").unwrap();
        assert!(vol.purge_cache());
        assert_eq!(vol.cache_stats().entries, 0);
        assert_eq!(vol.read_file("/keep.bin").unwrap(), before);
        assert!(!vol.is_dirty());
    }

    #[test]
    fn counts_reconcile_after_remount() {
        let (_dev, mut vol) = mkfs(4096, 64, true, true);
        vol.mkdir("/a").unwrap();
        vol.write_file("/a/x", &[1u8; 3 * SS]).unwrap();
        vol.write_file("/a/y", b"inline-sized").unwrap();
        vol.remove_file("/a/x").unwrap();
        vol.mkdir("/a/b").unwrap();
        vol.rmdir("/a/b").unwrap();
        vol.flush().unwrap();
        let mut vol = remount(vol);
        let health = vol.health();
        assert!(health.ok, "issues: {:?}", health.issues);
    }

    #[test]
    fn feature_toggles() {
        let (_dev, mut vol) = mkfs(4096, 64, true, true);
        vol.set_cow(false);
        assert!(!vol.info().cow);
        vol.set_checksums(false).unwrap();
        assert!(!vol.info().checksums);
        vol.set_checksums(true).unwrap();
        vol.flush().unwrap();
        let vol = remount(vol);
        assert!(vol.info().checksums);
        assert!(!vol.info().cow);

        let (_dev2, mut plain) = mkfs(256, 64, false, true);
        assert_eq!(
            plain.set_checksums(true).unwrap_err().to_string(),
            "No checksum table"
        );
    }

    #[test]
    fn non_cow_overwrite_frees_before_allocating() {
        let (_dev, mut vol) = mkfs(4096, 64, true, false);
        vol.write_file("/f", &[1u8; 2 * SS]).unwrap();
        let free = vol.info().free_blocks;
        vol.write_file("/f", &[2u8; 2 * SS]).unwrap();
        assert_eq!(vol.info().free_blocks, free);
        assert_eq!(vol.read_file("/f").unwrap(), vec![2u8; 2 * SS]);
    }

    #[test]
    fn cache_stats_reflect_traffic() {
        let (_dev, mut vol) = mkfs(4096, 64, true, true);
        vol.write_file("/f", &[3u8; 4 * SS]).unwrap();
        vol.read_file("/f").unwrap();
        vol.read_file("/f").unwrap();
        let stats = vol.cache_stats();
        assert!(stats.hits > 0);
        assert!(stats.misses > 0);
        assert!(stats.max_entries >= stats.entries);
        assert!(vol.info().lifetime_writes > 0);
    }
}
