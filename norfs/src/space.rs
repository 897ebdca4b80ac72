//! Region-partitioned free space and wear-leveling.
//!
//! The device is divided into `region_count` equal regions of
//! `region_size` sectors. Exactly one region is reserved as wear-leveling
//! scratch at any time; the rest are tagged meta (region 0, holds the
//! superblocks/map stores/id map/wl data), dir, or big-file. A handful of
//! fixed-size bitmap "slots" buffer one region's free/erase bits at a
//! time; everything else lives on flash and is paged in on demand.

use log::{debug, trace};
use norfs_err::{Error, Result};
use norfs_flash::FlashDriver;

use crate::cache::Cache;
use crate::config::Config;
use crate::head::{SectorHead, SectorState, SectorType};

/// What a region is currently earmarked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Meta,
    Dir,
    BigFile,
    Reserve,
    Unassigned,
}

/// One region's worth of free/erase bits, buffered in RAM.
struct BitmapSlot {
    region: Option<u32>,
    kind: RegionKind,
    /// 1 = free.
    free: Vec<u8>,
    /// 1 = pending erase.
    erase: Vec<u8>,
    free_num: u32,
    dirty: bool,
}

impl BitmapSlot {
    fn new(kind: RegionKind, bytes: usize) -> Self {
        Self {
            region: None,
            kind,
            free: vec![0u8; bytes],
            erase: vec![0u8; bytes],
            free_num: 0,
            dirty: false,
        }
    }

    /// Scan for `count` contiguous free bits; flip them to 0 and return the
    /// bit index of the run's start.
    fn alloc_run(&mut self, count: u32) -> Option<u32> {
        let total_bits = self.free.len() as u32 * 8;
        let mut run_start: Option<u32> = None;
        let mut run_len = 0u32;
        for bit in 0..total_bits {
            if self.bit(bit) {
                if run_start.is_none() {
                    run_start = Some(bit);
                }
                run_len += 1;
                if run_len == count {
                    let start = run_start.unwrap();
                    for b in start..start + count {
                        self.clear_bit(b);
                    }
                    self.free_num -= count;
                    self.dirty = true;
                    return Some(start);
                }
            } else {
                run_start = None;
                run_len = 0;
            }
        }
        None
    }

    fn bit(&self, bit: u32) -> bool {
        self.free[(bit / 8) as usize] & (1 << (bit % 8)) != 0
    }

    fn clear_bit(&mut self, bit: u32) {
        self.free[(bit / 8) as usize] &= !(1 << (bit % 8));
    }

    fn clear_erase_bit(&mut self, bit: u32) {
        self.erase[(bit / 8) as usize] &= !(1 << (bit % 8));
    }
}

/// Region-partitioned allocator: five RAM bitmap slots plus the region
/// map that tracks which region each slot currently owns.
pub struct SpaceManager {
    region_kind: Vec<RegionKind>,
    region_erase_total: Vec<u32>,
    reserve_region: u32,
    meta: BitmapSlot,
    dir: BitmapSlot,
    big_file: BitmapSlot,
    erase_buf: BitmapSlot,
    scan_times: u32,
    wl_next_trigger: u32,
}

impl SpaceManager {
    pub fn new(cfg: &Config) -> Self {
        let bytes = cfg.region_bitmap_bytes() as usize;
        let region_count = cfg.region_count as usize;
        let mut region_kind = vec![RegionKind::Unassigned; region_count];
        region_kind[0] = RegionKind::Meta;
        if region_count > 1 {
            region_kind[1] = RegionKind::Dir;
        }
        let reserve_region = (region_count as u32).saturating_sub(1);
        if reserve_region > 0 {
            region_kind[reserve_region as usize] = RegionKind::Reserve;
        }
        Self {
            region_kind,
            region_erase_total: vec![0u32; region_count],
            reserve_region,
            meta: BitmapSlot::new(RegionKind::Meta, bytes),
            dir: BitmapSlot::new(RegionKind::Dir, bytes),
            big_file: BitmapSlot::new(RegionKind::BigFile, bytes),
            erase_buf: BitmapSlot::new(RegionKind::Unassigned, bytes),
            scan_times: 0,
            wl_next_trigger: cfg.wl_start().max(1),
        }
    }

    fn slot_mut(&mut self, kind: RegionKind) -> &mut BitmapSlot {
        match kind {
            RegionKind::Meta => &mut self.meta,
            RegionKind::Dir => &mut self.dir,
            RegionKind::BigFile => &mut self.big_file,
            _ => &mut self.erase_buf,
        }
    }

    /// Format-time initialization: region 0 is meta, region 1 (if present)
    /// is dir, the last region is the reserve; every bit in every other
    /// slot's initial region starts free.
    pub fn format(&mut self, cfg: &Config) {
        let region_size = cfg.region_size();
        for slot in [&mut self.meta, &mut self.dir, &mut self.big_file] {
            slot.region = None;
            slot.free.iter_mut().for_each(|b| *b = 0xFF);
            slot.erase.iter_mut().for_each(|b| *b = 0);
            slot.free_num = region_size;
            slot.dirty = true;
        }
        self.meta.region = Some(0);
        if cfg.region_count > 1 {
            self.dir.region = Some(1);
        }
        // Sectors 0 and 1 are the fixed superblock sectors, not under
        // allocator control; exclude them from the meta region's free run.
        let reserved = 2.min(region_size);
        for bit in 0..reserved {
            self.meta.clear_bit(bit);
        }
        self.meta.free_num -= reserved;
    }

    /// Remount-time initialization: rebuild `region_kind` by sampling one
    /// sector's type out of every region (the sector header is the only
    /// durable record of what a region holds; nothing else persists it).
    /// `reserve_region` comes from the superblock's last-committed value.
    pub fn mount<D: FlashDriver>(
        driver: &mut D,
        cache: &mut Cache,
        cfg: &Config,
        reserve_region: u32,
        scan_times: u32,
    ) -> Result<Self> {
        let region_size = cfg.region_size();
        let region_count = cfg.region_count as usize;
        let mut region_kind = vec![RegionKind::Unassigned; region_count];
        region_kind[0] = RegionKind::Meta;
        region_kind[reserve_region as usize] = RegionKind::Reserve;
        let mut region_erase_total = vec![0u32; region_count];
        for region in 0..cfg.region_count {
            let mut kind_found = region == 0 || region == reserve_region;
            let mut total = 0u64;
            for local in 0..region_size {
                let sector = region * region_size + local;
                let mut hbuf = [0u8; 4];
                cache.cache_read(driver, sector, 0, &mut hbuf)?;
                let head = SectorHead(u32::from_be_bytes(hbuf));
                if head.is_unwritten() {
                    continue;
                }
                total += head.erase_count() as u64;
                if !kind_found {
                    match head.ty() {
                        Some(SectorType::Dir) => {
                            region_kind[region as usize] = RegionKind::Dir;
                            kind_found = true;
                        }
                        Some(SectorType::BigFileData) => {
                            region_kind[region as usize] = RegionKind::BigFile;
                            kind_found = true;
                        }
                        _ => {}
                    }
                }
            }
            region_erase_total[region as usize] = total as u32;
        }
        let bytes = cfg.region_bitmap_bytes() as usize;
        Ok(Self {
            region_kind,
            region_erase_total,
            reserve_region,
            meta: BitmapSlot::new(RegionKind::Meta, bytes),
            dir: BitmapSlot::new(RegionKind::Dir, bytes),
            big_file: BitmapSlot::new(RegionKind::BigFile, bytes),
            erase_buf: BitmapSlot::new(RegionKind::Unassigned, bytes),
            scan_times,
            wl_next_trigger: scan_times + cfg.wl_start().max(1),
        })
    }

    /// Allocate `count` contiguous sectors of `kind`, erasing each target
    /// sector if it still holds residual data and stamping a fresh
    /// `using` header with a bumped erase count.
    pub fn alloc<D: FlashDriver>(
        &mut self,
        driver: &mut D,
        cache: &mut Cache,
        cfg: &Config,
        kind: RegionKind,
        ty: SectorType,
        count: u32,
    ) -> Result<u32> {
        let region_size = cfg.region_size();
        let mut attempts = 0u32;
        loop {
            if self.slot_mut(kind).region.is_none() {
                self.load_next_region(driver, cache, cfg, kind)?;
            }
            let region = self.slot_mut(kind).region.unwrap();
            if let Some(bit) = self.slot_mut(kind).alloc_run(count) {
                let base = region * region_size + bit;
                for s in base..base + count {
                    self.stamp_sector(driver, cache, cfg, s, ty)?;
                }
                trace!("alloc kind={kind:?} ty={ty:?} count={count} -> sector {base}");
                self.check_wear_level(driver, cache, cfg)?;
                return Ok(base);
            }
            attempts += 1;
            self.slot_mut(kind).region = None;
            if attempts > cfg.region_count {
                return Err(Error::NoSpace);
            }
            self.load_next_region(driver, cache, cfg, kind)?;
        }
    }

    fn stamp_sector<D: FlashDriver>(
        &mut self,
        driver: &mut D,
        cache: &mut Cache,
        cfg: &Config,
        sector: u32,
        ty: SectorType,
    ) -> Result<()> {
        let mut hbuf = [0u8; 4];
        cache.cache_read(driver, sector, 0, &mut hbuf)?;
        let old = SectorHead(u32::from_be_bytes(hbuf));
        let erase_count = if old.is_unwritten() {
            0
        } else {
            if old.state() != Some(SectorState::Free) {
                driver.erase(sector)?;
                cache.invalidate_sector(sector);
            }
            old.erase_count() + 1
        };
        let head = SectorHead::new(SectorState::Using, ty, 0, erase_count);
        cache.direct_prog(driver, sector, 0, &head.0.to_be_bytes())?;
        self.region_erase_total[(sector / cfg.region_size()) as usize] += erase_count;
        Ok(())
    }

    /// Advance a slot to the next region of matching kind. A region's free
    /// bitmap is reconstructed by scanning its sector headers rather than
    /// kept in a separate persisted store: the header's state bits are
    /// already the durable record of free/used/old, so a RAM slot is just
    /// a cache of that scan, safe to evict and safe to rebuild.
    pub fn load_next_region<D: FlashDriver>(
        &mut self,
        driver: &mut D,
        cache: &mut Cache,
        cfg: &Config,
        kind: RegionKind,
    ) -> Result<()> {
        let region_count = cfg.region_count;
        let start = self.slot_mut(kind).region.map(|r| (r + 1) % region_count).unwrap_or(0);
        let mut idx = start;
        for _ in 0..region_count {
            let claimable = self.region_kind[idx as usize] == kind
                || (self.region_kind[idx as usize] == RegionKind::Unassigned
                    && matches!(kind, RegionKind::Dir | RegionKind::BigFile));
            if claimable {
                self.region_kind[idx as usize] = kind;
                if self.slot_mut(kind).dirty {
                    debug!("evicting bitmap slot {kind:?} before advancing region");
                }
                let (free, free_num) = Self::scan_region_free(driver, cache, cfg, idx)?;
                let slot = self.slot_mut(kind);
                slot.region = Some(idx);
                slot.free = free;
                slot.erase.iter_mut().for_each(|b| *b = 0);
                slot.free_num = free_num;
                slot.dirty = false;
                if idx < start {
                    self.scan_times += 1;
                }
                return Ok(());
            }
            idx = (idx + 1) % region_count;
        }
        Err(Error::NoSpace)
    }

    /// Rebuild one region's free bitmap by reading every sector header in
    /// it: `Free` and unwritten sectors are immediately allocatable,
    /// `Old` ones are allocatable too (the lazy erase happens in
    /// `stamp_sector`), `Using` ones are not.
    fn scan_region_free<D: FlashDriver>(
        driver: &mut D,
        cache: &mut Cache,
        cfg: &Config,
        region: u32,
    ) -> Result<(Vec<u8>, u32)> {
        let region_size = cfg.region_size();
        let bytes = cfg.region_bitmap_bytes() as usize;
        let mut free = vec![0u8; bytes];
        let mut free_num = 0u32;
        for local in 0..region_size {
            let sector = region * region_size + local;
            let mut hbuf = [0u8; 4];
            cache.cache_read(driver, sector, 0, &mut hbuf)?;
            let head = SectorHead(u32::from_be_bytes(hbuf));
            let is_free = head.is_unwritten() || matches!(head.state(), Some(SectorState::Free) | Some(SectorState::Old));
            if is_free {
                free[(local / 8) as usize] |= 1 << (local % 8);
                free_num += 1;
            }
        }
        Ok((free, free_num))
    }

    /// Mark `num` sectors starting at `sector` pending-erase in whichever
    /// slot owns that sector's region; meta/reserve regions update the
    /// owning slot directly.
    pub fn emap_set(&mut self, cfg: &Config, sector: u32, num: u32) {
        let region_size = cfg.region_size();
        let region = sector / region_size;
        let local = sector % region_size;
        let kind = self.region_kind[region as usize];
        let slot = self.slot_mut(kind);
        if slot.region == Some(region) {
            for b in local..local + num {
                slot.clear_erase_bit(b);
                slot.free.get_mut((b / 8) as usize).map(|byte| *byte |= 1 << (b % 8));
            }
            slot.free_num += num;
            slot.dirty = true;
        }
    }

    pub fn scan_times(&self) -> u32 {
        self.scan_times
    }

    pub fn reserve_region(&self) -> u32 {
        self.reserve_region
    }

    /// Trigger a wear-leveling pass the first time `scan_times` reaches
    /// `cfg.wl_start()`, and again every `wl_start()` scans thereafter.
    fn check_wear_level<D: FlashDriver>(&mut self, driver: &mut D, cache: &mut Cache, cfg: &Config) -> Result<()> {
        if self.scan_times >= self.wl_next_trigger {
            debug!("wear-level pass triggered at scan_times={}", self.scan_times);
            self.wear_level_pass(driver, cache, cfg)?;
            self.wl_next_trigger += cfg.wl_start().max(1);
        }
        Ok(())
    }

    /// Sort regions of `kind` by accumulated erase count and pair the
    /// lowest against the highest via the reserve region as scratch,
    /// repeating the same pairing strategy on every subsequent trigger
    /// (see DESIGN.md, Open Question 3).
    pub fn wear_level_pass<D: FlashDriver>(&mut self, driver: &mut D, cache: &mut Cache, cfg: &Config) -> Result<()> {
        // Region 0 holds the superblock pair at fixed absolute sectors and
        // is never a migration candidate.
        let mut candidates: Vec<u32> = (0..cfg.region_count)
            .filter(|&r| r != self.reserve_region && self.region_kind[r as usize] != RegionKind::Meta)
            .collect();
        candidates.sort_by_key(|&r| self.region_erase_total[r as usize]);
        if candidates.len() < 2 {
            return Ok(());
        }
        let lowest = candidates[0];
        let highest = *candidates.last().unwrap();
        self.region_migration(driver, cache, cfg, lowest, highest)?;
        self.reserve_region = lowest;
        Ok(())
    }

    /// Three-way swap through the reserve region as scratch: `high`'s live
    /// sectors move to the old reserve, `low`'s live sectors move into the
    /// now-vacated `high` region, and `low` itself — now vacated in turn —
    /// becomes the new reserve. `region_kind`, `region_erase_total`, and any
    /// buffered slot pointing at either `low` or `high` are updated to
    /// follow their data to its new physical region.
    fn region_migration<D: FlashDriver>(
        &mut self,
        driver: &mut D,
        cache: &mut Cache,
        cfg: &Config,
        low: u32,
        high: u32,
    ) -> Result<()> {
        let region_size = cfg.region_size();
        let old_reserve = self.reserve_region;
        let reserve_base = old_reserve * region_size;
        let high_base = high * region_size;
        let low_base = low * region_size;

        // high -> old reserve
        for i in 0..region_size {
            let mut buf = vec![0u8; cfg.sector_size as usize];
            driver.read(high_base + i, 0, &mut buf)?;
            driver.erase(reserve_base + i)?;
            driver.prog(reserve_base + i, 0, &buf)?;
            cache.invalidate_sector(reserve_base + i);
        }
        // high is now fully copied away; erase it so low's data can move in.
        for i in 0..region_size {
            driver.erase(high_base + i)?;
            cache.invalidate_sector(high_base + i);
        }
        // low -> (now vacated) high
        for i in 0..region_size {
            let mut buf = vec![0u8; cfg.sector_size as usize];
            driver.read(low_base + i, 0, &mut buf)?;
            driver.prog(high_base + i, 0, &buf)?;
            cache.invalidate_sector(high_base + i);
        }
        // low is now fully copied away; erase it to become the new reserve.
        for i in 0..region_size {
            driver.erase(low_base + i)?;
            cache.invalidate_sector(low_base + i);
        }

        self.region_kind[old_reserve as usize] = self.region_kind[high as usize];
        self.region_erase_total[old_reserve as usize] = self.region_erase_total[high as usize];
        self.region_kind[high as usize] = self.region_kind[low as usize];
        self.region_erase_total[high as usize] = self.region_erase_total[low as usize];
        self.region_kind[low as usize] = RegionKind::Reserve;
        self.region_erase_total[low as usize] = 0;

        for slot in [&mut self.meta, &mut self.dir, &mut self.big_file] {
            if slot.region == Some(high) {
                slot.region = Some(old_reserve);
            } else if slot.region == Some(low) {
                slot.region = Some(high);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use norfs_flash_mem::MemoryFlash;

    fn cfg() -> Config {
        Config::new(16, 16, 256, 16, 64, 4)
    }

    #[test]
    fn alloc_returns_contiguous_run_and_clears_bits() {
        let cfg = cfg();
        let mut flash = MemoryFlash::new(cfg.sector_size, cfg.sector_count);
        let mut cache = Cache::new(cfg.cache_size, cfg.sector_size);
        let mut space = SpaceManager::new(&cfg);
        space.format(&cfg);
        let base = space
            .alloc(&mut flash, &mut cache, &cfg, RegionKind::Dir, SectorType::Dir, 2)
            .unwrap();
        assert!(base >= cfg.region_size());
        let mut hbuf = [0u8; 4];
        flash.read(base, 0, &mut hbuf).unwrap();
        let head = SectorHead(u32::from_be_bytes(hbuf));
        assert_eq!(head.state(), Some(SectorState::Using));
        assert_eq!(head.ty(), Some(SectorType::Dir));
    }

    #[test]
    fn alloc_fails_once_region_exhausted() {
        let cfg = cfg();
        let mut flash = MemoryFlash::new(cfg.sector_size, cfg.sector_count);
        let mut cache = Cache::new(cfg.cache_size, cfg.sector_size);
        let mut space = SpaceManager::new(&cfg);
        space.format(&cfg);
        let region_size = cfg.region_size();
        // 4 regions: 0=meta, 1=dir, 2=unassigned (grows into Dir on
        // demand), 3=reserve. Exhaust both dir-eligible regions before
        // expecting NoSpace.
        let got = space.alloc(&mut flash, &mut cache, &cfg, RegionKind::Dir, SectorType::Dir, region_size);
        assert!(got.is_ok());
        let got2 = space.alloc(&mut flash, &mut cache, &cfg, RegionKind::Dir, SectorType::Dir, region_size);
        assert!(got2.is_ok());
        let overflow = space.alloc(&mut flash, &mut cache, &cfg, RegionKind::Dir, SectorType::Dir, 1);
        assert!(overflow.is_err());
    }
}
