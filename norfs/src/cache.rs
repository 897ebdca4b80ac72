//! The byte-granular program cache (pcache) and read cache (rcache) that
//! bridge user I/O to bulk flash operations, plus the direct-path and
//! in-place header-mutation helpers built on top of them.

use norfs_err::Result;
use norfs_flash::FlashDriver;

/// One fixed-size window onto a single sector.
struct CacheLine {
    sector: Option<u32>,
    off: u32,
    valid_size: u32,
    dirty: bool,
    buf: Vec<u8>,
}

impl CacheLine {
    fn new(cache_size: u32) -> Self {
        Self {
            sector: None,
            off: 0,
            valid_size: 0,
            dirty: false,
            buf: vec![0u8; cache_size as usize],
        }
    }

    fn contains(&self, sector: u32, off: u32, len: u32) -> bool {
        self.sector == Some(sector) && off >= self.off && off + len <= self.off + self.valid_size
    }

    fn overlaps(&self, sector: u32, off: u32, len: u32) -> bool {
        self.sector == Some(sector) && off < self.off + self.valid_size && off + len > self.off
    }

    fn read_at(&self, off: u32, dst: &mut [u8]) {
        let start = (off - self.off) as usize;
        dst.copy_from_slice(&self.buf[start..start + dst.len()]);
    }

    fn write_at(&mut self, off: u32, src: &[u8]) {
        let start = (off - self.off) as usize;
        self.buf[start..start + src.len()].copy_from_slice(src);
    }

    fn reset(&mut self, sector: u32, off: u32) {
        self.sector = Some(sector);
        self.off = off;
        self.valid_size = 0;
        self.dirty = false;
    }
}

/// The pcache/rcache pair plus the pending-header-commit list that makes
/// the bit-flip commit protocol work across a buffered, multi-record
/// flush.
pub struct Cache {
    pcache: CacheLine,
    rcache: CacheLine,
    cache_size: u32,
    sector_size: u32,
    /// Absolute `(sector, offset)` of every record header written into the
    /// current pcache extent with `written = 1`; flushed (written bit
    /// cleared) as the second commit pass when the pcache line is flushed.
    pending_headers: Vec<(u32, u32)>,
}

impl Cache {
    pub fn new(cache_size: u32, sector_size: u32) -> Self {
        Self {
            pcache: CacheLine::new(cache_size),
            rcache: CacheLine::new(cache_size),
            cache_size,
            sector_size,
            pending_headers: Vec::new(),
        }
    }

    /// Satisfy a read from pcache, then rcache, then flash (repopulating
    /// rcache on a miss).
    pub fn cache_read<D: FlashDriver>(
        &mut self,
        driver: &mut D,
        sector: u32,
        off: u32,
        buf: &mut [u8],
    ) -> Result<()> {
        let len = buf.len() as u32;
        if self.pcache.contains(sector, off, len) {
            self.pcache.read_at(off, buf);
            return Ok(());
        }
        if self.rcache.contains(sector, off, len) {
            self.rcache.read_at(off, buf);
            return Ok(());
        }
        self.read_to_rcache(driver, sector, off)?;
        self.rcache.read_at(off, buf);
        Ok(())
    }

    /// Force a fresh rcache line covering `sector` starting at the
    /// cache_size-aligned window containing `off`, stitching in any
    /// overlapping dirty pcache bytes so the caller observes the
    /// in-memory-committed state rather than stale flash contents.
    fn read_to_rcache<D: FlashDriver>(&mut self, driver: &mut D, sector: u32, off: u32) -> Result<()> {
        let window_off = (off / self.cache_size) * self.cache_size;
        let window_len = self.cache_size.min(self.sector_size - window_off);
        self.rcache.reset(sector, window_off);
        driver.read(sector, window_off, &mut self.rcache.buf[..window_len as usize])?;
        self.rcache.valid_size = window_len;
        if self.pcache.dirty && self.pcache.overlaps(sector, window_off, window_len) {
            let lo = window_off.max(self.pcache.off);
            let hi = (window_off + window_len).min(self.pcache.off + self.pcache.valid_size);
            if hi > lo {
                let src_start = (lo - self.pcache.off) as usize;
                let len = (hi - lo) as usize;
                let bytes = self.pcache.buf[src_start..src_start + len].to_vec();
                self.rcache.write_at(lo, &bytes);
            }
        }
        Ok(())
    }

    /// Append `buf` to the program cache. If `buf` doesn't extend the
    /// current pcache extent contiguously, the pcache is flushed first and
    /// a fresh extent is begun at `(sector, off)`.
    ///
    /// `header_at_start` marks that the first 4 bytes of `buf` are a
    /// record header programmed with `written = 1`; its absolute location
    /// is remembered so the second commit pass can clear the bit on flush.
    pub fn cache_prog<D: FlashDriver>(
        &mut self,
        driver: &mut D,
        sector: u32,
        off: u32,
        buf: &[u8],
        header_at_start: bool,
    ) -> Result<()> {
        let contiguous = self.pcache.sector == Some(sector) && off == self.pcache.off + self.pcache.valid_size;
        if !contiguous {
            self.cache_flush(driver)?;
            self.pcache.reset(sector, off);
        }
        let start = (off - self.pcache.off) as usize;
        if start + buf.len() > self.pcache.buf.len() {
            // Buffered extent would exceed the cache line: flush what we
            // have and start the new bytes at a fresh extent.
            self.cache_flush(driver)?;
            self.pcache.reset(sector, off);
        }
        self.pcache.write_at(off, buf);
        self.pcache.valid_size = self.pcache.valid_size.max(off - self.pcache.off + buf.len() as u32);
        self.pcache.dirty = true;
        if header_at_start {
            self.pending_headers.push((sector, off));
        }
        Ok(())
    }

    /// Idempotent. Writes the buffered bytes, then re-programs every
    /// pending record header with its written bit cleared.
    pub fn cache_flush<D: FlashDriver>(&mut self, driver: &mut D) -> Result<()> {
        if !self.pcache.dirty {
            self.pending_headers.clear();
            return Ok(());
        }
        let sector = self.pcache.sector.expect("dirty pcache must have a sector");
        driver.prog(sector, self.pcache.off, &self.pcache.buf[..self.pcache.valid_size as usize])?;
        for (hsector, hoff) in std::mem::take(&mut self.pending_headers) {
            if hsector != sector {
                continue;
            }
            let local = (hoff - self.pcache.off) as usize;
            let word = u32::from_be_bytes(self.pcache.buf[local..local + 4].try_into().unwrap());
            let committed = word & !0x4000_0000u32;
            driver.prog(hsector, hoff, &committed.to_be_bytes())?;
            self.pcache.write_at(hoff, &committed.to_be_bytes());
        }
        self.pcache.dirty = false;
        Ok(())
    }

    /// Bypass both caches for a read, e.g. for big-file payload streaming.
    pub fn direct_read<D: FlashDriver>(
        &mut self,
        driver: &mut D,
        sector: u32,
        off: u32,
        buf: &mut [u8],
    ) -> Result<()> {
        driver.read(sector, off, buf)
    }

    /// Bypass both caches for a program, invalidating any cached bytes at
    /// the target location so subsequent cached reads see fresh data.
    pub fn direct_prog<D: FlashDriver>(
        &mut self,
        driver: &mut D,
        sector: u32,
        off: u32,
        buf: &[u8],
    ) -> Result<()> {
        driver.prog(sector, off, buf)?;
        self.invalidate(sector, off, buf.len() as u32);
        Ok(())
    }

    /// Commit a single record via the two-pass written-flag protocol,
    /// bypassing the caches entirely: used when a record is too large to
    /// buffer in pcache (`len >= cache_size`).
    pub fn direct_commit_record<D: FlashDriver>(
        &mut self,
        driver: &mut D,
        sector: u32,
        off: u32,
        header_uncommitted: u32,
        payload: &[u8],
    ) -> Result<()> {
        let mut bytes = Vec::with_capacity(4 + payload.len());
        bytes.extend_from_slice(&header_uncommitted.to_be_bytes());
        bytes.extend_from_slice(payload);
        driver.prog(sector, off, &bytes)?;
        let committed = header_uncommitted & !0x4000_0000u32;
        driver.prog(sector, off, &committed.to_be_bytes())?;
        self.invalidate(sector, off, bytes.len() as u32);
        Ok(())
    }

    /// AND `mask` into the 32-bit word at `(sector, off)`, on flash and in
    /// any cache line that currently holds it. Used for sector-state
    /// transitions and record deletion, both expressed as 1-bit flips.
    pub fn head_validate<D: FlashDriver>(
        &mut self,
        driver: &mut D,
        sector: u32,
        off: u32,
        mask: u32,
    ) -> Result<()> {
        let mut word_buf = [0u8; 4];
        self.cache_read(driver, sector, off, &mut word_buf)?;
        let old = u32::from_be_bytes(word_buf);
        let new = old & mask;
        debug_assert_eq!(old & !new, old & !mask, "head_validate must only clear bits");
        driver.prog(sector, off, &new.to_be_bytes())?;
        if self.pcache.contains(sector, off, 4) {
            self.pcache.write_at(off, &new.to_be_bytes());
        }
        if self.rcache.contains(sector, off, 4) {
            self.rcache.write_at(off, &new.to_be_bytes());
        }
        Ok(())
    }

    /// Drop any cached bytes for `sector` in the given range, e.g. after a
    /// direct program or an erase.
    pub fn invalidate(&mut self, sector: u32, off: u32, len: u32) {
        if self.pcache.overlaps(sector, off, len) && !self.pcache.dirty {
            self.pcache.sector = None;
        }
        if self.rcache.overlaps(sector, off, len) {
            self.rcache.sector = None;
        }
    }

    /// Drop every cache line referencing `sector`, e.g. after erasing it.
    pub fn invalidate_sector(&mut self, sector: u32) {
        if self.pcache.sector == Some(sector) && !self.pcache.dirty {
            self.pcache.sector = None;
        }
        if self.rcache.sector == Some(sector) {
            self.rcache.sector = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use norfs_flash_mem::MemoryFlash;

    #[test]
    fn cache_prog_then_read_sees_buffered_bytes() {
        let mut flash = MemoryFlash::new(256, 4);
        let mut cache = Cache::new(64, 256);
        cache.cache_prog(&mut flash, 0, 0, b"hello", true).unwrap();
        let mut buf = [0u8; 5];
        cache.cache_read(&mut flash, 0, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn flush_clears_written_bit_on_pending_header() {
        let mut flash = MemoryFlash::new(256, 4);
        let mut cache = Cache::new(64, 256);
        let header = 0x4000_0000u32 | 20; // written=1, len=20
        let mut bytes = header.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 16]);
        cache.cache_prog(&mut flash, 0, 0, &bytes, true).unwrap();
        cache.cache_flush(&mut flash).unwrap();
        let mut word = [0u8; 4];
        flash.read(0, 0, &mut word).unwrap();
        assert_eq!(u32::from_be_bytes(word) & 0x4000_0000, 0);
    }

    #[test]
    fn head_validate_only_clears_bits() {
        let mut flash = MemoryFlash::new(256, 4);
        let mut cache = Cache::new(64, 256);
        flash.prog(0, 0, &0xFFFF_FFFFu32.to_be_bytes()).unwrap();
        cache.head_validate(&mut flash, 0, 0, 0xFFFF_FFFE).unwrap();
        let mut word = [0u8; 4];
        flash.read(0, 0, &mut word).unwrap();
        assert_eq!(u32::from_be_bytes(word), 0xFFFF_FFFE);
    }
}
