use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::{Context, Result};
use log::warn;

use crate::BlockDevice;

/// Image-file backed device, used by the `axfs` command line tool.
pub struct FileBlockDevice {
    file: File,
    sector_size: u16,
    sector_count: u32,
}

impl FileBlockDevice {
    /// Open an existing image. The sector count is derived from the file
    /// length, rounded down to whole sectors.
    pub fn open(path: &str, sector_size: u16) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open {}", path))?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            sector_size,
            sector_count: (len / sector_size as u64) as u32,
        })
    }

    /// Create (or truncate) a zeroed image of the given geometry.
    pub fn create(path: &str, sector_size: u16, sector_count: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("create {}", path))?;
        file.set_len(sector_size as u64 * sector_count as u64)?;
        Ok(Self {
            file,
            sector_size,
            sector_count,
        })
    }
}

impl BlockDevice for FileBlockDevice {
    fn sector_size(&self) -> u16 {
        self.sector_size
    }

    fn sector_count(&self) -> u32 {
        self.sector_count
    }

    fn read_sector(&mut self, n: u32) -> Option<Vec<u8>> {
        if n >= self.sector_count {
            return None;
        }
        let sz = self.sector_size as usize;
        let mut buf = vec![0u8; sz];
        if let Err(e) = self
            .file
            .seek(SeekFrom::Start(n as u64 * sz as u64))
            .and_then(|_| self.file.read_exact(&mut buf))
        {
            warn!("read sector {} failed: {}", n, e);
            return None;
        }
        Some(buf)
    }

    fn write_sector(&mut self, n: u32, data: &[u8]) -> bool {
        if n >= self.sector_count {
            return false;
        }
        let sz = self.sector_size as usize;
        let mut buf = data.to_vec();
        buf.resize(sz, 0);
        if let Err(e) = self
            .file
            .seek(SeekFrom::Start(n as u64 * sz as u64))
            .and_then(|_| self.file.write_all(&buf))
        {
            warn!("write sector {} failed: {}", n, e);
            return false;
        }
        true
    }
}
