//! Small inline files and big extent-indexed files.
//!
//! A file under [`FILE_SIZE_THRESHOLD`] lives as a single small-file-data
//! record in its parent dir's chain. Past that it's promoted to a big
//! file: payload bytes live in dedicated big-file-data sectors, addressed
//! by a big-file-index record listing `(start_sector, start_offset,
//! length)` extents.

use std::collections::HashSet;

use norfs_err::{Error, Result};
use norfs_flash::FlashDriver;

use crate::cache::Cache;
use crate::config::{Config, FILE_INDEX_MAX, FILE_INDEX_NUM, FILE_SIZE_THRESHOLD};
use crate::dir::{data_delete, dir_prog, dir_old_single, Dir};
use crate::head::SectorType;
use crate::record::Record;
use crate::space::{RegionKind, SpaceManager};

pub type Extent = (u32, u32, u32);

/// Offset of the owning file's object id, right after the 4-byte sector
/// head.
pub const BFILE_OWNER_OFF: u32 = 4;
/// Offset of the owning file's parent directory id, right after
/// `BFILE_OWNER_OFF`.
pub const BFILE_PARENT_OFF: u32 = 8;
/// Offset at which a big-file-data sector's payload bytes begin. Every
/// sector in an extent chain carries its own owner/parent words, whether
/// it starts a new extent or continues one, so an orphaned data sector can
/// be attributed to its file without walking any index.
pub const BFILE_DATA_START: u32 = 12;

/// Stamp a freshly allocated run of big-file-data sectors with the owning
/// file's id and that file's parent directory id.
fn stamp_bfile_sectors<D: FlashDriver>(
    driver: &mut D,
    cache: &mut Cache,
    base: u32,
    count: u32,
    owner_id: u16,
    parent_id: u16,
) -> Result<()> {
    for sector in base..base + count {
        cache.direct_prog(driver, sector, BFILE_OWNER_OFF, &(owner_id as u32).to_be_bytes())?;
        cache.direct_prog(driver, sector, BFILE_PARENT_OFF, &(parent_id as u32).to_be_bytes())?;
    }
    Ok(())
}

pub enum FileData {
    Small(Vec<u8>),
    Big(Vec<Extent>),
}

pub struct FileHandle {
    pub id: u16,
    pub pos: u32,
    pub size: u32,
    pub dirty: bool,
    pub data: FileData,
    /// Location of this file's current data record in the parent's chain,
    /// if it has ever been persisted.
    pub record_loc: Option<(u32, u32, u32)>,
}

impl FileHandle {
    pub fn new_empty(id: u16) -> Self {
        Self {
            id,
            pos: 0,
            size: 0,
            dirty: false,
            data: FileData::Small(Vec::new()),
            record_loc: None,
        }
    }
}

/// Segments `(sector, offset, len)` an extent expands into: the first
/// sector starts at the extent's own offset, every following sector
/// starts right after its 4-byte header.
fn extent_segments(start_sector: u32, start_off: u32, length: u32, sector_size: u32) -> Vec<(u32, u32, u32)> {
    let mut segs = Vec::new();
    let mut remaining = length;
    let mut sector = start_sector;
    let mut off = start_off;
    while remaining > 0 {
        let room = sector_size - off;
        let take = room.min(remaining);
        segs.push((sector, off, take));
        remaining -= take;
        sector += 1;
        off = BFILE_DATA_START;
    }
    segs
}

/// Every physical sector an extent list touches, for callers that need to
/// release a file's storage outright (e.g. deleting it).
pub fn sectors_of(extents: &[Extent], sector_size: u32) -> HashSet<u32> {
    extents
        .iter()
        .flat_map(|&(s, o, l)| extent_segments(s, o, l, sector_size))
        .map(|(sector, _, _)| sector)
        .collect()
}

/// Sub-range `[skip, skip+take)` of `extent`'s logical bytes, re-expressed
/// as a standalone extent starting at the right physical location.
fn clip_extent(extent: Extent, skip: u32, take: u32, sector_size: u32) -> Extent {
    let segs = extent_segments(extent.0, extent.1, extent.2, sector_size);
    let mut consumed = 0u32;
    for (sector, off, len) in segs {
        if skip < consumed + len {
            let local = skip - consumed;
            return (sector, off + local, take);
        }
        consumed += len;
    }
    extent
}

fn read_extent<D: FlashDriver>(
    driver: &mut D,
    cache: &mut Cache,
    cfg: &Config,
    extent: Extent,
    dst: &mut [u8],
) -> Result<()> {
    let mut cursor = 0usize;
    for (sector, off, len) in extent_segments(extent.0, extent.1, extent.2, cfg.sector_size) {
        cache.direct_read(driver, sector, off, &mut dst[cursor..cursor + len as usize])?;
        cursor += len as usize;
    }
    Ok(())
}

fn mark_sectors_old<D: FlashDriver>(
    driver: &mut D,
    cache: &mut Cache,
    space: &mut SpaceManager,
    cfg: &Config,
    sectors: impl IntoIterator<Item = u32>,
) -> Result<()> {
    for sector in sectors {
        dir_old_single(driver, cache, space, cfg, sector)?;
    }
    Ok(())
}

/// Replace the file's persisted data record (if any) with a fresh one and
/// update bookkeeping.
fn persist<D: FlashDriver>(
    handle: &mut FileHandle,
    dir: &mut Dir,
    driver: &mut D,
    cache: &mut Cache,
    space: &mut SpaceManager,
    cfg: &Config,
    record: Record,
) -> Result<()> {
    if let Some((sector, off, len)) = handle.record_loc {
        data_delete(driver, cache, Some(dir), sector, off, len)?;
    }
    let (sector, off) = dir_prog(dir, driver, cache, space, cfg, handle.id, &record)?;
    let total_len = 4 + record.encode_payload().len() as u32;
    handle.record_loc = Some((sector, off, total_len));
    Ok(())
}

pub fn read<D: FlashDriver>(
    handle: &mut FileHandle,
    driver: &mut D,
    cache: &mut Cache,
    cfg: &Config,
    buf: &mut [u8],
) -> Result<u32> {
    let avail = handle.size.saturating_sub(handle.pos);
    let want = (buf.len() as u32).min(avail);
    if want == 0 {
        return Ok(0);
    }
    match &handle.data {
        FileData::Small(bytes) => {
            let start = handle.pos as usize;
            buf[..want as usize].copy_from_slice(&bytes[start..start + want as usize]);
        }
        FileData::Big(extents) => {
            let mut produced = 0u32;
            let mut cum = 0u32;
            for &(s, o, l) in extents {
                if produced == want {
                    break;
                }
                let extent_end = cum + l;
                if extent_end > handle.pos {
                    let skip = handle.pos.saturating_sub(cum);
                    let avail_here = l - skip;
                    let take = avail_here.min(want - produced);
                    let sub = clip_extent((s, o, l), skip, take, cfg.sector_size);
                    read_extent(driver, cache, cfg, sub, &mut buf[produced as usize..(produced + take) as usize])?;
                    produced += take;
                }
                cum = extent_end;
            }
        }
    }
    handle.pos += want;
    Ok(want)
}

pub fn write<D: FlashDriver>(
    handle: &mut FileHandle,
    dir: &mut Dir,
    driver: &mut D,
    cache: &mut Cache,
    space: &mut SpaceManager,
    cfg: &Config,
    buf: &[u8],
) -> Result<u32> {
    if buf.is_empty() {
        return Ok(0);
    }
    let end = handle.pos + buf.len() as u32;
    if end > cfg.file_max {
        return Err(Error::FileTooBig);
    }
    match &handle.data {
        FileData::Small(existing) => {
            let mut bytes = existing.clone();
            if bytes.len() < end as usize {
                bytes.resize(end as usize, 0);
            }
            bytes[handle.pos as usize..end as usize].copy_from_slice(buf);
            if end > FILE_SIZE_THRESHOLD {
                convert_to_big(handle, dir, driver, cache, space, cfg, bytes)?;
            } else {
                handle.data = FileData::Small(bytes);
            }
        }
        FileData::Big(_) => {
            if handle.pos == handle.size {
                append_big(handle, dir, driver, cache, space, cfg, buf)?;
            } else {
                random_write_big(handle, dir, driver, cache, space, cfg, buf)?;
            }
        }
    }
    handle.pos = end;
    handle.size = handle.size.max(end);
    handle.dirty = true;
    Ok(buf.len() as u32)
}

fn convert_to_big<D: FlashDriver>(
    handle: &mut FileHandle,
    dir: &mut Dir,
    driver: &mut D,
    cache: &mut Cache,
    space: &mut SpaceManager,
    cfg: &Config,
    bytes: Vec<u8>,
) -> Result<()> {
    let payload_per_sector = cfg.sector_size - BFILE_DATA_START;
    let sectors_needed = (bytes.len() as u32).div_ceil(payload_per_sector).max(1);
    let base = space.alloc(driver, cache, cfg, RegionKind::BigFile, SectorType::BigFileData, sectors_needed)?;
    stamp_bfile_sectors(driver, cache, base, sectors_needed, handle.id, dir.id)?;
    let mut cursor = 0usize;
    let mut sector = base;
    let mut off = BFILE_DATA_START;
    while cursor < bytes.len() {
        let room = (cfg.sector_size - off) as usize;
        let n = room.min(bytes.len() - cursor);
        cache.direct_prog(driver, sector, off, &bytes[cursor..cursor + n])?;
        cursor += n;
        sector += 1;
        off = BFILE_DATA_START;
    }
    let extent = (base, BFILE_DATA_START, bytes.len() as u32);
    handle.data = FileData::Big(vec![extent]);
    persist(handle, dir, driver, cache, space, cfg, Record::BigFileIndex { extents: vec![extent] })?;
    Ok(())
}

fn append_big<D: FlashDriver>(
    handle: &mut FileHandle,
    dir: &mut Dir,
    driver: &mut D,
    cache: &mut Cache,
    space: &mut SpaceManager,
    cfg: &Config,
    buf: &[u8],
) -> Result<()> {
    let mut extents = match &handle.data {
        FileData::Big(e) => e.clone(),
        FileData::Small(_) => unreachable!("big append requires a big file"),
    };
    let mut remaining = buf;
    if let Some(&last) = extents.last() {
        let segs = extent_segments(last.0, last.1, last.2, cfg.sector_size);
        if let Some(&(lsector, loff, llen)) = segs.last() {
            let used = loff + llen;
            let room = cfg.sector_size - used;
            if room > 0 && !remaining.is_empty() {
                let take = (room as usize).min(remaining.len());
                cache.direct_prog(driver, lsector, used, &remaining[..take])?;
                let idx = extents.len() - 1;
                extents[idx].2 += take as u32;
                remaining = &remaining[take..];
            }
        }
    }
    while !remaining.is_empty() {
        let payload_per_sector = cfg.sector_size - BFILE_DATA_START;
        let need = (remaining.len() as u32).div_ceil(payload_per_sector).max(1);
        let base = space.alloc(driver, cache, cfg, RegionKind::BigFile, SectorType::BigFileData, need)?;
        stamp_bfile_sectors(driver, cache, base, need, handle.id, dir.id)?;
        let cap = (need * payload_per_sector) as usize;
        let take = remaining.len().min(cap);
        let mut cursor = 0usize;
        let mut sector = base;
        let mut off = BFILE_DATA_START;
        while cursor < take {
            let room = (cfg.sector_size - off) as usize;
            let n = room.min(take - cursor);
            cache.direct_prog(driver, sector, off, &remaining[cursor..cursor + n])?;
            cursor += n;
            sector += 1;
            off = BFILE_DATA_START;
        }
        let prev_last_sector = extents
            .last()
            .map(|&(s, o, l)| extent_segments(s, o, l, cfg.sector_size).last().unwrap().0);
        if prev_last_sector == Some(base.wrapping_sub(1)) {
            let idx = extents.len() - 1;
            extents[idx].2 += take as u32;
        } else {
            extents.push((base, BFILE_DATA_START, take as u32));
        }
        remaining = &remaining[take..];
    }
    handle.data = FileData::Big(extents.clone());
    persist(handle, dir, driver, cache, space, cfg, Record::BigFileIndex { extents: extents.clone() })?;
    maybe_gc(handle, dir, driver, cache, space, cfg)?;
    Ok(())
}

fn random_write_big<D: FlashDriver>(
    handle: &mut FileHandle,
    dir: &mut Dir,
    driver: &mut D,
    cache: &mut Cache,
    space: &mut SpaceManager,
    cfg: &Config,
    buf: &[u8],
) -> Result<()> {
    let old_extents = match &handle.data {
        FileData::Big(e) => e.clone(),
        FileData::Small(_) => unreachable!("random write requires a big file"),
    };
    let pos = handle.pos;
    let end = pos + buf.len() as u32;

    let mut cum = 0u32;
    let mut begin_idx = 0usize;
    for (idx, &(_, _, len)) in old_extents.iter().enumerate() {
        if pos < cum + len {
            begin_idx = idx;
            break;
        }
        cum += len;
    }
    let begin_cum = cum;
    let prefix_len = pos - begin_cum;
    let begin_clip = if prefix_len > 0 {
        Some(clip_extent(old_extents[begin_idx], 0, prefix_len, cfg.sector_size))
    } else {
        None
    };

    // New extent for the bytes actually being written.
    let payload_per_sector = cfg.sector_size - BFILE_DATA_START;
    let need = (buf.len() as u32).div_ceil(payload_per_sector).max(1);
    let base = space.alloc(driver, cache, cfg, RegionKind::BigFile, SectorType::BigFileData, need)?;
    stamp_bfile_sectors(driver, cache, base, need, handle.id, dir.id)?;
    let mut cursor = 0usize;
    let mut sector = base;
    let mut off = BFILE_DATA_START;
    while cursor < buf.len() {
        let room = (cfg.sector_size - off) as usize;
        let n = room.min(buf.len() - cursor);
        cache.direct_prog(driver, sector, off, &buf[cursor..cursor + n])?;
        cursor += n;
        sector += 1;
        off = BFILE_DATA_START;
    }
    let new_extent = (base, BFILE_DATA_START, buf.len() as u32);

    let mut new_extents = old_extents[..begin_idx].to_vec();
    if let Some(bc) = begin_clip {
        new_extents.push(bc);
    }
    new_extents.push(new_extent);

    if end >= handle.size {
        // Write extends to or past current EOF: drop everything from
        // begin_idx onward besides the retained prefix clip.
        handle.size = end;
    } else {
        let mut cum2 = begin_cum;
        let mut end_idx = begin_idx;
        for (idx, &(_, _, len)) in old_extents.iter().enumerate().skip(begin_idx) {
            if end <= cum2 + len {
                end_idx = idx;
                break;
            }
            cum2 += len;
        }
        let end_cum = cum2;
        let suffix_skip = end - end_cum;
        let suffix_len = old_extents[end_idx].2 - suffix_skip;
        if suffix_len > 0 {
            let end_clip = clip_extent(old_extents[end_idx], suffix_skip, suffix_len, cfg.sector_size);
            new_extents.push(end_clip);
        }
        new_extents.extend_from_slice(&old_extents[end_idx + 1..]);
    }

    let released: Vec<u32> = sectors_of(&old_extents, cfg.sector_size)
        .difference(&sectors_of(&new_extents, cfg.sector_size))
        .copied()
        .collect();
    mark_sectors_old(driver, cache, space, cfg, released)?;

    handle.data = FileData::Big(new_extents.clone());
    persist(handle, dir, driver, cache, space, cfg, Record::BigFileIndex { extents: new_extents })?;
    maybe_gc(handle, dir, driver, cache, space, cfg)?;
    Ok(())
}

/// Collapse the widest run of extents that fits in one region into a
/// single contiguous extent, once the index has grown past
/// [`FILE_INDEX_NUM`] and before it hits [`FILE_INDEX_MAX`].
fn maybe_gc<D: FlashDriver>(
    handle: &mut FileHandle,
    dir: &mut Dir,
    driver: &mut D,
    cache: &mut Cache,
    space: &mut SpaceManager,
    cfg: &Config,
) -> Result<()> {
    let extents = match &handle.data {
        FileData::Big(e) => e.clone(),
        FileData::Small(_) => return Ok(()),
    };
    if extents.len() < FILE_INDEX_NUM || extents.len() >= FILE_INDEX_MAX {
        return Ok(());
    }
    let region_bytes = cfg.region_size() * cfg.sector_size;
    let mut best_i = 0usize;
    let mut best_j = 0usize;
    let mut best_len = 0usize;
    let mut i = 0usize;
    while i < extents.len() {
        let mut total = 0u64;
        let mut j = i;
        while j < extents.len() {
            total += extents[j].2 as u64;
            if total > region_bytes as u64 {
                break;
            }
            j += 1;
        }
        if j > i && j - i > best_len {
            best_len = j - i;
            best_i = i;
            best_j = j;
        }
        i = j.max(i + 1);
    }
    if best_len < 2 {
        return Ok(());
    }
    let run = &extents[best_i..best_j];
    let total_bytes: u32 = run.iter().map(|e| e.2).sum();
    let mut bytes = vec![0u8; total_bytes as usize];
    let mut cursor = 0usize;
    for &e in run {
        let len = e.2 as usize;
        read_extent(driver, cache, cfg, e, &mut bytes[cursor..cursor + len])?;
        cursor += len;
    }
    let payload_per_sector = cfg.sector_size - BFILE_DATA_START;
    let need = total_bytes.div_ceil(payload_per_sector).max(1);
    let base = space.alloc(driver, cache, cfg, RegionKind::BigFile, SectorType::BigFileData, need)?;
    stamp_bfile_sectors(driver, cache, base, need, handle.id, dir.id)?;
    let mut c = 0usize;
    let mut sector = base;
    let mut off = BFILE_DATA_START;
    while c < bytes.len() {
        let room = (cfg.sector_size - off) as usize;
        let n = room.min(bytes.len() - c);
        cache.direct_prog(driver, sector, off, &bytes[c..c + n])?;
        c += n;
        sector += 1;
        off = BFILE_DATA_START;
    }
    let released: Vec<u32> = sectors_of(run, cfg.sector_size).into_iter().collect();
    mark_sectors_old(driver, cache, space, cfg, released)?;

    let mut new_extents = extents[..best_i].to_vec();
    new_extents.push((base, BFILE_DATA_START, total_bytes));
    new_extents.extend_from_slice(&extents[best_j..]);
    handle.data = FileData::Big(new_extents.clone());
    persist(handle, dir, driver, cache, space, cfg, Record::BigFileIndex { extents: new_extents })?;
    Ok(())
}

/// Flush a dirty small file's in-RAM buffer as a persisted record.
pub fn flush<D: FlashDriver>(
    handle: &mut FileHandle,
    dir: &mut Dir,
    driver: &mut D,
    cache: &mut Cache,
    space: &mut SpaceManager,
    cfg: &Config,
) -> Result<()> {
    if !handle.dirty {
        return Ok(());
    }
    if let FileData::Small(bytes) = &handle.data {
        persist(handle, dir, driver, cache, space, cfg, Record::SmallFileData { bytes: bytes.clone() })?;
    }
    cache.cache_flush(driver)?;
    handle.dirty = false;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dir::{stamp_dir_links, Dir, DIR_DATA_START, NO_PREV};
    use crate::head::SectorType as ST;
    use norfs_flash_mem::MemoryFlash;

    fn cfg() -> Config {
        Config::new(16, 16, 256, 32, 64, 4)
    }

    fn setup() -> (MemoryFlash, Cache, SpaceManager, Config, Dir) {
        let cfg = cfg();
        let mut flash = MemoryFlash::new(cfg.sector_size, cfg.sector_count);
        let mut cache = Cache::new(cfg.cache_size, cfg.sector_size);
        let mut space = SpaceManager::new(&cfg);
        space.format(&cfg);
        let sector = space.alloc(&mut flash, &mut cache, &cfg, RegionKind::Dir, ST::Dir, 1).unwrap();
        stamp_dir_links(&mut flash, &mut cache, sector, NO_PREV, 1).unwrap();
        let dir = Dir {
            id: 1,
            parent_id: 1,
            head_sector: sector,
            tail_sector: sector,
            tail_off: DIR_DATA_START,
            old_space: 0,
        };
        (flash, cache, space, cfg, dir)
    }

    #[test]
    fn small_write_then_read_round_trips() {
        let (mut flash, mut cache, mut space, cfg, mut dir) = setup();
        let mut handle = FileHandle::new_empty(5);
        write(&mut handle, &mut dir, &mut flash, &mut cache, &mut space, &cfg, b"hello").unwrap();
        handle.pos = 0;
        let mut buf = [0u8; 5];
        let n = read(&mut handle, &mut flash, &mut cache, &cfg, &mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn crossing_threshold_converts_to_big_file() {
        let (mut flash, mut cache, mut space, cfg, mut dir) = setup();
        let mut handle = FileHandle::new_empty(5);
        let big = vec![b'x'; (FILE_SIZE_THRESHOLD + 10) as usize];
        write(&mut handle, &mut dir, &mut flash, &mut cache, &mut space, &cfg, &big).unwrap();
        assert!(matches!(handle.data, FileData::Big(_)));
        handle.pos = 0;
        let mut buf = vec![0u8; big.len()];
        read(&mut handle, &mut flash, &mut cache, &cfg, &mut buf).unwrap();
        assert_eq!(buf, big);
    }

    #[test]
    fn append_extends_big_file() {
        let (mut flash, mut cache, mut space, cfg, mut dir) = setup();
        let mut handle = FileHandle::new_empty(5);
        let first = vec![b'a'; (FILE_SIZE_THRESHOLD + 10) as usize];
        write(&mut handle, &mut dir, &mut flash, &mut cache, &mut space, &cfg, &first).unwrap();
        write(&mut handle, &mut dir, &mut flash, &mut cache, &mut space, &cfg, b"tail").unwrap();
        handle.pos = 0;
        let mut buf = vec![0u8; first.len() + 4];
        read(&mut handle, &mut flash, &mut cache, &cfg, &mut buf).unwrap();
        assert_eq!(&buf[..first.len()], &first[..]);
        assert_eq!(&buf[first.len()..], b"tail");
    }

    #[test]
    fn random_write_patches_middle_of_big_file() {
        let (mut flash, mut cache, mut space, cfg, mut dir) = setup();
        let mut handle = FileHandle::new_empty(5);
        let original = vec![b'a'; (FILE_SIZE_THRESHOLD + 20) as usize];
        write(&mut handle, &mut dir, &mut flash, &mut cache, &mut space, &cfg, &original).unwrap();
        handle.pos = 10;
        write(&mut handle, &mut dir, &mut flash, &mut cache, &mut space, &cfg, b"PATCH").unwrap();
        handle.pos = 0;
        let mut buf = vec![0u8; original.len()];
        read(&mut handle, &mut flash, &mut cache, &cfg, &mut buf).unwrap();
        assert_eq!(&buf[10..15], b"PATCH");
        assert_eq!(&buf[..10], &original[..10]);
        assert_eq!(&buf[15..], &original[15..]);
    }
}
