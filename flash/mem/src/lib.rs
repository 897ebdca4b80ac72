//! An in-memory [`FlashDriver`] backed by a `Vec<u8>`.
//!
//! Used by the test scenarios and by anything that wants a throwaway,
//! process-local flash image. Programs are checked against the NOR
//! program rule in debug builds: a byte may only move from `1` to `0`.

use log::trace;
use norfs_err::{Error, Result};
use norfs_flash::FlashDriver;

pub struct MemoryFlash {
    sector_size: u32,
    sectors: Vec<u8>,
}

impl MemoryFlash {
    pub fn new(sector_size: u32, sector_count: u32) -> Self {
        Self {
            sector_size,
            sectors: vec![0xFF; sector_size as usize * sector_count as usize],
        }
    }

    fn offset(&self, sector: u32, offset: u32) -> usize {
        sector as usize * self.sector_size as usize + offset as usize
    }
}

impl FlashDriver for MemoryFlash {
    fn read(&mut self, sector: u32, offset: u32, buf: &mut [u8]) -> Result<()> {
        let start = self.offset(sector, offset);
        if start + buf.len() > self.sectors.len() {
            return Err(Error::Invalid("read out of range"));
        }
        buf.copy_from_slice(&self.sectors[start..start + buf.len()]);
        Ok(())
    }

    fn prog(&mut self, sector: u32, offset: u32, buf: &[u8]) -> Result<()> {
        let start = self.offset(sector, offset);
        if start + buf.len() > self.sectors.len() {
            return Err(Error::Invalid("prog out of range"));
        }
        trace!("prog sector={sector} offset={offset} len={}", buf.len());
        for (dst, src) in self.sectors[start..start + buf.len()].iter_mut().zip(buf) {
            debug_assert_eq!(*dst & !*src, 0, "NOR prog may only clear bits");
            *dst &= *src;
        }
        Ok(())
    }

    fn erase(&mut self, sector: u32) -> Result<()> {
        let start = sector as usize * self.sector_size as usize;
        let end = start + self.sector_size as usize;
        if end > self.sectors.len() {
            return Err(Error::Invalid("erase out of range"));
        }
        trace!("erase sector={sector}");
        self.sectors[start..end].fill(0xFF);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn sector_count(&self) -> u32 {
        self.sectors.len() as u32 / self.sector_size
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erase_resets_to_all_ones() {
        let mut flash = MemoryFlash::new(64, 4);
        flash.prog(0, 0, &[0x00, 0x00]).unwrap();
        flash.erase(0).unwrap();
        let mut buf = [0u8; 2];
        flash.read(0, 0, &mut buf).unwrap();
        assert_eq!(buf, [0xFF, 0xFF]);
    }

    #[test]
    fn prog_only_clears_bits() {
        let mut flash = MemoryFlash::new(64, 1);
        flash.prog(0, 0, &[0b1010_1010]).unwrap();
        flash.prog(0, 0, &[0b0000_1111]).unwrap();
        let mut buf = [0u8; 1];
        flash.read(0, 0, &mut buf).unwrap();
        assert_eq!(buf[0], 0b0000_1010);
    }
}
