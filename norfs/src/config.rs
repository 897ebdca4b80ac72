//! Mount/format configuration and the tunables that are not carried on the
//! wire but still shape behavior.

use norfs_err::{Error, Result};

/// Default upper bound on name length in bytes.
pub const NAME_MAX: u32 = 255;
/// Default upper bound on file size in bytes (32 MiB).
pub const FILE_MAX: u32 = 32 * 1024 * 1024;
/// Total number of object ids available per mount.
pub const ID_MAX: u32 = 8192;
/// Upper bound on `region_count`.
pub const REGION_NUM_MAX: u32 = 1024;
/// Number of wear-leveling candidate regions tracked per type.
pub const RAM_REGION_NUM: usize = 4;
/// Number of scan-time windows after which the wl-start threshold trips by
/// default; overridable for tests via [`Config::set_wl_start`].
pub const WL_START_DEFAULT: u32 = 3000;
/// Region changes between wl candidate-array re-sorts.
pub const WL_MIGRATE_THRESHOLD: u32 = 2 * RAM_REGION_NUM as u32 * 50;
/// Maximum number of simultaneously open files.
pub const FILE_LIST_MAX: usize = 5;
/// Maximum number of simultaneously open directories.
pub const DIR_LIST_MAX: usize = 10;
/// Inline name length stored by value in a tree-cache entry before falling
/// back to a DJB2 hash.
pub const ENTRY_NAME_LEN: usize = 12;
/// Payload size at or below which a file is stored inline in its parent dir.
pub const FILE_SIZE_THRESHOLD: u32 = 64;
/// Size of a file's in-RAM cache buffer.
pub const FILE_CACHE_SIZE: usize = 512;
/// Extent count at which a big file becomes eligible for index GC.
pub const FILE_INDEX_NUM: usize = 20;
/// Extent count at which a big file's index is considered full.
pub const FILE_INDEX_MAX: usize = 42;

/// Mount/format-time configuration, supplied by the embedder.
///
/// Mirrors the reference `N2FS_config` structure: every field here is
/// either an I/O-granularity constraint checked by [`Config::validate`], or
/// a value persisted on flash and checked again against the on-flash copy
/// at every subsequent mount.
#[derive(Debug, Clone)]
pub struct Config {
    pub read_size: u32,
    pub prog_size: u32,
    pub sector_size: u32,
    pub sector_count: u32,
    pub cache_size: u32,
    pub region_count: u32,
    pub name_max: u32,
    pub file_max: u32,

    wl_start: u32,
}

impl Config {
    pub fn new(
        read_size: u32,
        prog_size: u32,
        sector_size: u32,
        sector_count: u32,
        cache_size: u32,
        region_count: u32,
    ) -> Self {
        Self {
            read_size,
            prog_size,
            sector_size,
            sector_count,
            cache_size,
            region_count,
            name_max: NAME_MAX,
            file_max: FILE_MAX,
            wl_start: WL_START_DEFAULT,
        }
    }

    /// Override the wear-leveling trigger threshold (scan_times). Used by
    /// test scenarios that need to observe wl behavior without performing
    /// thousands of map relocations.
    pub fn set_wl_start(&mut self, wl_start: u32) {
        self.wl_start = wl_start;
    }

    pub fn wl_start(&self) -> u32 {
        self.wl_start
    }

    /// Number of sectors in one region.
    pub fn region_size(&self) -> u32 {
        self.sector_count / self.region_count
    }

    /// Bytes needed to hold one free/erase bitmap for a whole region.
    pub fn region_bitmap_bytes(&self) -> u32 {
        self.region_size().div_ceil(8)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_size == 0 || self.read_size == 0 || self.prog_size == 0 {
            return Err(Error::Invalid("read_size/prog_size/cache_size must be nonzero"));
        }
        if self.cache_size % self.read_size != 0 {
            return Err(Error::Invalid("read_size must divide cache_size"));
        }
        if self.cache_size % self.prog_size != 0 {
            return Err(Error::Invalid("prog_size must divide cache_size"));
        }
        if self.sector_size == 0 || self.sector_size % self.cache_size != 0 {
            return Err(Error::Invalid("cache_size must divide sector_size"));
        }
        if self.region_count == 0 || !self.region_count.is_power_of_two() {
            return Err(Error::Invalid("region_count must be a power of two"));
        }
        if self.region_count > REGION_NUM_MAX {
            return Err(Error::Invalid("region_count exceeds REGION_NUM_MAX"));
        }
        if self.sector_count == 0 || self.sector_count % self.region_count != 0 {
            return Err(Error::Invalid("region_count must divide sector_count"));
        }
        if self.sector_count < 4 {
            return Err(Error::Invalid("sector_count must hold at least the superblock and map stores"));
        }
        if self.name_max == 0 || self.name_max > NAME_MAX {
            return Err(Error::Invalid("name_max out of range"));
        }
        if self.file_max == 0 || self.file_max > FILE_MAX {
            return Err(Error::Invalid("file_max out of range"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config::new(16, 16, 4096, 16, 256, 4)
    }

    #[test]
    fn accepts_reference_scenario_config() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_region_count() {
        let mut cfg = base();
        cfg.region_count = 3;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_sector_count_not_multiple_of_regions() {
        let mut cfg = base();
        cfg.sector_count = 15;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_cache_not_dividing_sector() {
        let mut cfg = base();
        cfg.cache_size = 300;
        assert!(cfg.validate().is_err());
    }
}
