//! Directory chains: append-only logs of name, file-data, and bookkeeping
//! records, linked sector-to-sector via an explicit `prev_sector` pointer
//! stored right after each sector's header.

use log::trace;
use norfs_err::{Error, Result};
use norfs_flash::FlashDriver;

use crate::cache::Cache;
use crate::config::Config;
use crate::head::{DataHead, RecordType, SectorHead, SectorState, SectorType, UNWRITTEN};
use crate::record::{EntryKind, Record};
use crate::space::{RegionKind, SpaceManager};

/// Offset of the `prev_sector` pointer, right after the 4-byte sector head.
pub const PREV_PTR_OFF: u32 = 4;
/// Offset of the owning directory's object id, right after `prev_sector`.
/// Lets an orphaned dir sector be attributed to its directory from its
/// header alone, without walking any chain.
pub const OWNER_ID_OFF: u32 = 8;
/// Offset at which the first record of a dir sector begins.
pub const DIR_DATA_START: u32 = 12;
/// Marks the head of a chain: no previous sector.
pub const NO_PREV: u32 = 0xFFFF_FFFF;

/// Stamp a freshly allocated dir sector's `prev_sector` and owner-id header
/// words. Every dir sector in a chain carries the same owning directory id,
/// whether it's the chain's first sector or one grown onto an existing tail.
pub fn stamp_dir_links<D: FlashDriver>(
    driver: &mut D,
    cache: &mut Cache,
    sector: u32,
    prev: u32,
    owner_id: u16,
) -> Result<()> {
    cache.direct_prog(driver, sector, PREV_PTR_OFF, &prev.to_be_bytes())?;
    cache.direct_prog(driver, sector, OWNER_ID_OFF, &(owner_id as u32).to_be_bytes())?;
    Ok(())
}

/// An open directory's cursor state.
#[derive(Debug, Clone)]
pub struct Dir {
    pub id: u16,
    pub parent_id: u16,
    pub head_sector: u32,
    pub tail_sector: u32,
    pub tail_off: u32,
    pub old_space: u32,
}

/// A decoded record plus its location, as produced by chain traversal.
pub struct FoundRecord {
    pub sector: u32,
    pub off: u32,
    pub head: DataHead,
    pub payload: Vec<u8>,
}

pub struct DirEntry {
    pub kind: EntryKind,
    pub child_id: u16,
    pub tail_sector: u32,
    pub name_sector: u32,
    pub name_off: u32,
}

fn read_prev<D: FlashDriver>(driver: &mut D, cache: &mut Cache, sector: u32) -> Result<u32> {
    let mut buf = [0u8; 4];
    cache.cache_read(driver, sector, PREV_PTR_OFF, &mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

/// Collect every sector in a chain, head-first, by following `prev_sector`
/// pointers back from `tail`.
pub fn chain_sectors<D: FlashDriver>(driver: &mut D, cache: &mut Cache, tail: u32) -> Result<Vec<u32>> {
    let mut v = vec![tail];
    let mut cur = tail;
    loop {
        let prev = read_prev(driver, cache, cur)?;
        if prev == NO_PREV {
            break;
        }
        v.push(prev);
        cur = prev;
    }
    v.reverse();
    Ok(v)
}

/// Read every committed, non-unwritten record out of one dir sector.
pub fn read_records<D: FlashDriver>(
    driver: &mut D,
    cache: &mut Cache,
    cfg: &Config,
    sector: u32,
) -> Result<Vec<FoundRecord>> {
    let mut out = Vec::new();
    let mut off = DIR_DATA_START;
    while off + 4 <= cfg.sector_size {
        let mut hbuf = [0u8; 4];
        cache.cache_read(driver, sector, off, &mut hbuf)?;
        let word = u32::from_be_bytes(hbuf);
        if word == UNWRITTEN {
            break;
        }
        let head = DataHead(word);
        if !head.is_written() {
            // Torn write: second commit pass never happened. Discard.
            break;
        }
        let total_len = head.len();
        if total_len < 4 || off + total_len > cfg.sector_size {
            return Err(Error::Corrupt);
        }
        let payload_len = total_len - 4;
        let mut payload = vec![0u8; payload_len as usize];
        if payload_len > 0 {
            cache.cache_read(driver, sector, off + 4, &mut payload)?;
        }
        out.push(FoundRecord { sector, off, head, payload });
        off += total_len;
    }
    Ok(out)
}

/// Append `record` to `dir`'s tail, growing the chain if it doesn't fit
/// and the dir isn't yet due for GC.
pub fn dir_prog<D: FlashDriver>(
    dir: &mut Dir,
    driver: &mut D,
    cache: &mut Cache,
    space: &mut SpaceManager,
    cfg: &Config,
    owner_id: u16,
    record: &Record,
) -> Result<(u32, u32)> {
    let (head, payload) = record.encode(owner_id);
    let total_len = head.len();
    if total_len > cfg.sector_size - DIR_DATA_START {
        return Err(Error::Invalid("record too large for a dir sector"));
    }
    if dir.tail_off + total_len > cfg.sector_size {
        if dir.old_space >= 3 * cfg.sector_size {
            dtraverse_gc(dir, driver, cache, space, cfg)?;
        }
        if dir.tail_off + total_len > cfg.sector_size {
            let new_sector = space.alloc(driver, cache, cfg, RegionKind::Dir, SectorType::Dir, 1)?;
            stamp_dir_links(driver, cache, new_sector, dir.tail_sector, dir.id)?;
            trace!("dir {} grew chain: {} -> {}", dir.id, dir.tail_sector, new_sector);
            dir.tail_sector = new_sector;
            dir.tail_off = DIR_DATA_START;
        }
    }
    let sector = dir.tail_sector;
    let off = dir.tail_off;
    if total_len >= cfg.cache_size {
        cache.direct_commit_record(driver, sector, off, head.0, &payload)?;
    } else {
        let mut bytes = head.0.to_be_bytes().to_vec();
        bytes.extend_from_slice(&payload);
        cache.cache_prog(driver, sector, off, &bytes, true)?;
    }
    dir.tail_off += total_len;
    Ok((sector, off))
}

/// Flip a record's header to the delete encoding, crediting its length to
/// the owning dir's dead-space counter when it's open.
pub fn data_delete<D: FlashDriver>(
    driver: &mut D,
    cache: &mut Cache,
    dir: Option<&mut Dir>,
    sector: u32,
    off: u32,
    len: u32,
) -> Result<()> {
    cache.head_validate(driver, sector, off, DataHead::delete_mask())?;
    if let Some(dir) = dir {
        dir.old_space += len;
    }
    Ok(())
}

/// Mark every sector in a now-superseded chain `old` and reclaim it in the
/// erase map.
pub fn dir_old<D: FlashDriver>(
    driver: &mut D,
    cache: &mut Cache,
    space: &mut SpaceManager,
    cfg: &Config,
    tail: u32,
) -> Result<()> {
    for sector in chain_sectors(driver, cache, tail)? {
        cache.head_validate(driver, sector, 0, SectorHead::state_transition_mask(SectorState::Old))?;
        space.emap_set(cfg, sector, 1);
    }
    Ok(())
}

/// Flip a single sector's header to `old` and reclaim it in the erase
/// map; used for releasing individual big-file-data sectors rather than
/// a whole dir chain.
pub fn dir_old_single<D: FlashDriver>(
    driver: &mut D,
    cache: &mut Cache,
    space: &mut SpaceManager,
    cfg: &Config,
    sector: u32,
) -> Result<()> {
    cache.head_validate(driver, sector, 0, SectorHead::state_transition_mask(SectorState::Old))?;
    space.emap_set(cfg, sector, 1);
    Ok(())
}

/// Search a dir's chain for a name matching `kind`/`name`.
pub fn dtraverse_name<D: FlashDriver>(
    driver: &mut D,
    cache: &mut Cache,
    cfg: &Config,
    tail: u32,
    kind: Option<EntryKind>,
    name: &[u8],
) -> Result<Option<DirEntry>> {
    for sector in chain_sectors(driver, cache, tail)? {
        for rec in read_records(driver, cache, cfg, sector)? {
            let ty = match rec.head.ty() {
                Some(t) => t,
                None => continue,
            };
            if ty != RecordType::FileName && ty != RecordType::DirName {
                continue;
            }
            let decoded = Record::decode(ty, &rec.payload)?;
            if let Record::Name {
                kind: k,
                child_id,
                tail_sector,
                name: n,
            } = decoded
            {
                if let Some(want) = kind {
                    if want != k {
                        continue;
                    }
                }
                if n == name {
                    return Ok(Some(DirEntry {
                        kind: k,
                        child_id,
                        tail_sector,
                        name_sector: rec.sector,
                        name_off: rec.off,
                    }));
                }
            }
        }
    }
    Ok(None)
}

/// Locate `file_id`'s data record (small or big) within a dir's chain.
pub fn dtraverse_data<D: FlashDriver>(
    driver: &mut D,
    cache: &mut Cache,
    cfg: &Config,
    tail: u32,
    file_id: u16,
) -> Result<Option<FoundRecord>> {
    for sector in chain_sectors(driver, cache, tail)? {
        for rec in read_records(driver, cache, cfg, sector)? {
            if rec.head.owner_id() != file_id {
                continue;
            }
            match rec.head.ty() {
                Some(RecordType::SmallFileData) | Some(RecordType::BigFileIndex) => return Ok(Some(rec)),
                _ => {}
            }
        }
    }
    Ok(None)
}

/// Set every big-file-data sector referenced by any big-file-index record
/// in `dir`'s chain to `old`, for whole-dir deletion.
pub fn dtraverse_bfile_delete<D: FlashDriver>(
    driver: &mut D,
    cache: &mut Cache,
    space: &mut SpaceManager,
    cfg: &Config,
    tail: u32,
) -> Result<()> {
    for sector in chain_sectors(driver, cache, tail)? {
        for rec in read_records(driver, cache, cfg, sector)? {
            if rec.head.ty() != Some(RecordType::BigFileIndex) {
                continue;
            }
            if let Record::BigFileIndex { extents } = Record::decode(RecordType::BigFileIndex, &rec.payload)? {
                for (start, _, len) in extents {
                    let sectors = len.div_ceil(cfg.sector_size).max(1);
                    for s in start..start + sectors {
                        cache.head_validate(driver, s, 0, SectorHead::state_transition_mask(SectorState::Old))?;
                        space.emap_set(cfg, s, 1);
                    }
                }
            }
        }
    }
    Ok(())
}

/// A name record whose physical location moved during GC, for callers that
/// maintain a location cache (the RAM tree cache).
pub struct MovedName {
    pub child_id: u16,
    pub old_sector: u32,
    pub old_off: u32,
    pub new_sector: u32,
    pub new_off: u32,
}

/// Compact a dir's chain into a single fresh sector, dropping deleted
/// records and collapsing dead space. Returns the set of name records that
/// moved so callers can keep derived indexes in sync.
pub fn dtraverse_gc<D: FlashDriver>(
    dir: &mut Dir,
    driver: &mut D,
    cache: &mut Cache,
    space: &mut SpaceManager,
    cfg: &Config,
) -> Result<Vec<MovedName>> {
    let chain = chain_sectors(driver, cache, dir.tail_sector)?;
    let new_sector = space.alloc(driver, cache, cfg, RegionKind::Dir, SectorType::Dir, 1)?;
    stamp_dir_links(driver, cache, new_sector, NO_PREV, dir.id)?;
    let mut off = DIR_DATA_START;
    let mut moved = Vec::new();
    for sector in &chain {
        for rec in read_records(driver, cache, cfg, *sector)? {
            if rec.head.ty() == Some(RecordType::Delete) {
                continue;
            }
            let ty = match rec.head.ty() {
                Some(t) => t,
                None => continue,
            };
            let total = 4 + rec.payload.len() as u32;
            if off + total > cfg.sector_size {
                return Err(Error::Corrupt);
            }
            let fresh = DataHead::new_uncommitted(rec.head.owner_id(), ty, rec.head.len());
            if total >= cfg.cache_size {
                cache.direct_commit_record(driver, new_sector, off, fresh.0, &rec.payload)?;
            } else {
                let mut bytes = fresh.0.to_be_bytes().to_vec();
                bytes.extend_from_slice(&rec.payload);
                cache.cache_prog(driver, new_sector, off, &bytes, true)?;
            }
            if ty == RecordType::FileName || ty == RecordType::DirName {
                if let Record::Name { child_id, .. } = Record::decode(ty, &rec.payload)? {
                    moved.push(MovedName {
                        child_id,
                        old_sector: rec.sector,
                        old_off: rec.off,
                        new_sector,
                        new_off: off,
                    });
                }
            }
            off += total;
        }
    }
    cache.cache_flush(driver)?;
    let old_tail = dir.tail_sector;
    dir.head_sector = new_sector;
    dir.tail_sector = new_sector;
    dir.tail_off = off;
    dir.old_space = 0;
    dir_old(driver, cache, space, cfg, old_tail)?;
    Ok(moved)
}

/// Rewrite a dir's name record in its parent after its tail sector moved,
/// deleting the stale entry and appending a fresh one.
pub fn dir_update<D: FlashDriver>(
    dir: &Dir,
    driver: &mut D,
    cache: &mut Cache,
    space: &mut SpaceManager,
    cfg: &Config,
    parent: &mut Dir,
    name: &[u8],
) -> Result<()> {
    if let Some(entry) = dtraverse_name(driver, cache, cfg, parent.tail_sector, Some(EntryKind::Dir), name)? {
        data_delete(driver, cache, Some(parent), entry.name_sector, entry.name_off, 4 + 6 + name.len() as u32)?;
    }
    let record = Record::Name {
        kind: EntryKind::Dir,
        child_id: dir.id,
        tail_sector: dir.tail_sector,
        name: name.to_vec(),
    };
    dir_prog(parent, driver, cache, space, cfg, dir.id, &record)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use norfs_flash_mem::MemoryFlash;

    fn cfg() -> Config {
        Config::new(16, 16, 256, 16, 64, 4)
    }

    fn new_dir_sector<D: FlashDriver>(driver: &mut D, cache: &mut Cache, space: &mut SpaceManager, cfg: &Config) -> u32 {
        let sector = space.alloc(driver, cache, cfg, RegionKind::Dir, SectorType::Dir, 1).unwrap();
        stamp_dir_links(driver, cache, sector, NO_PREV, 1).unwrap();
        sector
    }

    #[test]
    fn prog_then_traverse_finds_name() {
        let cfg = cfg();
        let mut flash = MemoryFlash::new(cfg.sector_size, cfg.sector_count);
        let mut cache = Cache::new(cfg.cache_size, cfg.sector_size);
        let mut space = SpaceManager::new(&cfg);
        space.format(&cfg);
        let sector = new_dir_sector(&mut flash, &mut cache, &mut space, &cfg);
        let mut dir = Dir {
            id: 1,
            parent_id: 1,
            head_sector: sector,
            tail_sector: sector,
            tail_off: DIR_DATA_START,
            old_space: 0,
        };
        let rec = Record::Name {
            kind: EntryKind::File,
            child_id: 5,
            tail_sector: NO_PREV,
            name: b"a.txt".to_vec(),
        };
        dir_prog(&mut dir, &mut flash, &mut cache, &mut space, &cfg, 5, &rec).unwrap();
        cache.cache_flush(&mut flash).unwrap();
        let found = dtraverse_name(&mut flash, &mut cache, &cfg, dir.tail_sector, Some(EntryKind::File), b"a.txt")
            .unwrap()
            .unwrap();
        assert_eq!(found.child_id, 5);
    }

    #[test]
    fn delete_then_traverse_skips_record() {
        let cfg = cfg();
        let mut flash = MemoryFlash::new(cfg.sector_size, cfg.sector_count);
        let mut cache = Cache::new(cfg.cache_size, cfg.sector_size);
        let mut space = SpaceManager::new(&cfg);
        space.format(&cfg);
        let sector = new_dir_sector(&mut flash, &mut cache, &mut space, &cfg);
        let mut dir = Dir {
            id: 1,
            parent_id: 1,
            head_sector: sector,
            tail_sector: sector,
            tail_off: DIR_DATA_START,
            old_space: 0,
        };
        let rec = Record::Name {
            kind: EntryKind::File,
            child_id: 5,
            tail_sector: NO_PREV,
            name: b"a.txt".to_vec(),
        };
        let (rsector, roff) = dir_prog(&mut dir, &mut flash, &mut cache, &mut space, &cfg, 5, &rec).unwrap();
        cache.cache_flush(&mut flash).unwrap();
        data_delete(&mut flash, &mut cache, Some(&mut dir), rsector, roff, 15).unwrap();
        let found = dtraverse_name(&mut flash, &mut cache, &cfg, dir.tail_sector, Some(EntryKind::File), b"a.txt").unwrap();
        assert!(found.is_none());
        assert_eq!(dir.old_space, 15);
    }
}
