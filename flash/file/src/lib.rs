//! A [`FlashDriver`] backed by a plain file, for persisting a flash image
//! across process runs and for exercising real I/O error paths.

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
};

use log::debug;
use norfs_err::Result;
use norfs_flash::FlashDriver;

pub struct FileFlash {
    file: File,
    sector_size: u32,
    sector_count: u32,
}

impl FileFlash {
    /// Open (creating if necessary) `path` as a flash image of
    /// `sector_count` sectors of `sector_size` bytes each.
    pub fn open(path: impl AsRef<Path>, sector_size: u32, sector_count: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let want_len = sector_size as u64 * sector_count as u64;
        if file.metadata()?.len() != want_len {
            debug!("initializing flash image to {want_len} bytes of 0xFF");
            file.set_len(want_len)?;
            let blank = vec![0xFF; sector_size as usize];
            for sector in 0..sector_count {
                file.write_all_at(&blank, sector as u64 * sector_size as u64)?;
            }
        }
        Ok(Self {
            file,
            sector_size,
            sector_count,
        })
    }
}

impl FlashDriver for FileFlash {
    fn read(&mut self, sector: u32, offset: u32, buf: &mut [u8]) -> Result<()> {
        let at = sector as u64 * self.sector_size as u64 + offset as u64;
        self.file.read_exact_at(buf, at)?;
        Ok(())
    }

    fn prog(&mut self, sector: u32, offset: u32, buf: &[u8]) -> Result<()> {
        let at = sector as u64 * self.sector_size as u64 + offset as u64;
        self.file.write_all_at(buf, at)?;
        Ok(())
    }

    fn erase(&mut self, sector: u32) -> Result<()> {
        let blank = vec![0xFF; self.sector_size as usize];
        self.file
            .write_all_at(&blank, sector as u64 * self.sector_size as u64)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn sector_count(&self) -> u32 {
        self.sector_count
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }
}
