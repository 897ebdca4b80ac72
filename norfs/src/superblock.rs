//! Two fixed, alternating superblock sectors: an append log of records
//! ending (on a clean mount) in a `commit`.

use log::{debug, info, warn};
use norfs_err::{Error, Result};
use norfs_flash::FlashDriver;

use crate::cache::Cache;
use crate::config::Config;
use crate::head::{DataHead, RecordType, SectorHead, SectorState, SectorType, UNWRITTEN};
use crate::record::Record;

pub const SUPER_SECTOR_A: u32 = 0;
pub const SUPER_SECTOR_B: u32 = 1;
const SUPER_DATA_START: u32 = 4;
/// `0x3F` is never written; it would make the modulo-64 wraparound
/// ambiguous with the "new sector, no history" extension of 0.
const EXT_RESERVED: u32 = 0x3F;
const EXT_MOD: u32 = 0x40;

pub struct MountState {
    pub active_sector: u32,
    pub extension: u32,
    pub tail_off: u32,
    pub region_map_free: Vec<u8>,
    pub reserve_region: u32,
    pub id_map_sector: u32,
    pub sector_map_sector: u32,
    pub wl_sector: Option<u32>,
    pub root_tail_sector: u32,
    pub next_free_id: u16,
    pub next_dir_scan: u32,
    pub next_bfile_scan: u32,
    pub scan_times: u32,
}

fn read_head<D: FlashDriver>(driver: &mut D, sector: u32) -> Result<SectorHead> {
    let mut buf = [0u8; 4];
    driver.read(sector, 0, &mut buf)?;
    Ok(SectorHead(u32::from_be_bytes(buf)))
}

/// `true` if `a`'s extension should be preferred over `b`'s, honoring the
/// one irregular wrap case (`0x3E` beats `0x00`, since `0x3F` is never
/// written and would otherwise make the wrap ambiguous).
fn extension_wins(a: u32, b: u32) -> bool {
    if a == 0x3E && b == 0x00 {
        return true;
    }
    if b == 0x3E && a == 0x00 {
        return false;
    }
    a > b
}

/// Decide which of the two superblock sectors is active, or `None` if the
/// device has never been formatted.
pub fn pick_active<D: FlashDriver>(driver: &mut D) -> Result<Option<(u32, SectorHead, SectorHead)>> {
    let a = read_head(driver, SUPER_SECTOR_A)?;
    let b = read_head(driver, SUPER_SECTOR_B)?;
    if a.is_unwritten() && b.is_unwritten() {
        return Ok(None);
    }
    if a.is_unwritten() {
        return Ok(Some((SUPER_SECTOR_B, a, b)));
    }
    if b.is_unwritten() {
        return Ok(Some((SUPER_SECTOR_A, a, b)));
    }
    if a.state() == Some(SectorState::Using) && b.state() == Some(SectorState::Using) {
        return Err(Error::Corrupt);
    }
    let active = if extension_wins(a.extension(), b.extension()) {
        SUPER_SECTOR_A
    } else {
        SUPER_SECTOR_B
    };
    Ok(Some((active, a, b)))
}

/// Replay the active superblock's record log into an in-RAM mount state.
pub fn replay<D: FlashDriver>(driver: &mut D, cache: &mut Cache, cfg: &Config, active: u32) -> Result<MountState> {
    let head = read_head(driver, active)?;
    let mut region_map_free = Vec::new();
    let mut reserve_region = cfg.region_count - 1;
    let mut id_map_sector = 0u32;
    let mut sector_map_sector = 0u32;
    let mut wl_sector = None;
    let mut root_tail_sector = 0u32;
    let mut next_free_id = 2u16;
    let mut next_dir_scan = 0u32;
    let mut next_bfile_scan = 0u32;
    let mut scan_times = 0u32;

    let mut off = SUPER_DATA_START;
    loop {
        if off + 4 > cfg.sector_size {
            return Err(Error::Corrupt);
        }
        let mut hbuf = [0u8; 4];
        cache.cache_read(driver, active, off, &mut hbuf)?;
        let word = u32::from_be_bytes(hbuf);
        if word == UNWRITTEN {
            return Err(Error::Corrupt);
        }
        let rhead = DataHead(word);
        if !rhead.is_written() {
            return Err(Error::Corrupt);
        }
        let total_len = rhead.len();
        if total_len < 4 || off + total_len > cfg.sector_size {
            return Err(Error::Corrupt);
        }
        let payload_len = total_len - 4;
        let mut payload = vec![0u8; payload_len as usize];
        if payload_len > 0 {
            cache.cache_read(driver, active, off + 4, &mut payload)?;
        }
        let ty = rhead.ty().ok_or(Error::Corrupt)?;
        if ty == RecordType::Delete {
            // A superseded commit record from a prior sync: its fields are
            // already folded into the state above, skip past it.
            off += total_len;
            continue;
        }
        if ty == RecordType::Commit {
            let rec = Record::decode(ty, &payload)?;
            if let Record::Commit {
                next_free_id: nf,
                next_dir_scan: nd,
                next_bfile_scan: nb,
                scan_times: st,
                reserve_region: rr,
            } = rec
            {
                next_free_id = nf;
                next_dir_scan = nd;
                next_bfile_scan = nb;
                scan_times = st;
                reserve_region = rr;
            }
            // Mark the commit record itself deleted so the very next
            // successful mount re-commits rather than replaying a log
            // whose terminal record already looks like a clean stop.
            cache.head_validate(driver, active, off, DataHead::delete_mask())?;
            return Ok(MountState {
                active_sector: active,
                extension: head.extension(),
                tail_off: off + total_len,
                region_map_free,
                reserve_region,
                id_map_sector,
                sector_map_sector,
                wl_sector,
                root_tail_sector,
                next_free_id,
                next_dir_scan,
                next_bfile_scan,
                scan_times,
            });
        }
        match Record::decode(ty, &payload)? {
            Record::SuperMessage { config_bytes } => {
                let on_flash = decode_config_bytes(&config_bytes);
                if on_flash != config_fingerprint(cfg) {
                    return Err(Error::WrongConfig);
                }
            }
            Record::RegionMap { free, reserve_region: rr } => {
                region_map_free = free;
                reserve_region = rr;
            }
            Record::IdMapAddr { sector } => id_map_sector = sector,
            Record::SectorMapAddr { sector } => sector_map_sector = sector,
            Record::WlAddr { sector } => wl_sector = Some(sector),
            Record::Name { tail_sector, child_id: 1, .. } => root_tail_sector = tail_sector,
            _ => {}
        }
        off += total_len;
    }
}

fn config_fingerprint(cfg: &Config) -> Vec<u32> {
    vec![cfg.read_size, cfg.prog_size, cfg.sector_size, cfg.sector_count, cfg.cache_size, cfg.region_count]
}

fn encode_config_bytes(cfg: &Config) -> Vec<u8> {
    let mut v = Vec::new();
    for field in config_fingerprint(cfg) {
        v.extend_from_slice(&field.to_be_bytes());
    }
    v
}

fn decode_config_bytes(bytes: &[u8]) -> Vec<u32> {
    bytes.chunks_exact(4).map(|c| u32::from_be_bytes(c.try_into().unwrap())).collect()
}

/// Append one record to the active superblock sector, returning its
/// location.
pub fn super_prog<D: FlashDriver>(
    driver: &mut D,
    cache: &mut Cache,
    cfg: &Config,
    active: u32,
    tail_off: &mut u32,
    record: &Record,
) -> Result<(u32, u32)> {
    let (head, payload) = record.encode(0);
    let total = head.len();
    if *tail_off + total > cfg.sector_size {
        return Err(Error::NoSpace);
    }
    let sector = active;
    let off = *tail_off;
    if total >= cfg.cache_size {
        cache.direct_commit_record(driver, sector, off, head.0, &payload)?;
    } else {
        let mut bytes = head.0.to_be_bytes().to_vec();
        bytes.extend_from_slice(&payload);
        cache.cache_prog(driver, sector, off, &bytes, true)?;
    }
    *tail_off += total;
    Ok((sector, off))
}

/// Build the record sequence emitted on format and on every rotation:
/// super-message, region-map, id-map-addr, sector-map-addr, root dir-name,
/// optional wl-addr, commit.
#[allow(clippy::too_many_arguments)]
pub fn emit_full_log<D: FlashDriver>(
    driver: &mut D,
    cache: &mut Cache,
    cfg: &Config,
    active: u32,
    tail_off: &mut u32,
    region_map_free: &[u8],
    reserve_region: u32,
    id_map_sector: u32,
    sector_map_sector: u32,
    root_tail_sector: u32,
    wl_sector: Option<u32>,
    next_free_id: u16,
    next_dir_scan: u32,
    next_bfile_scan: u32,
    scan_times: u32,
) -> Result<()> {
    super_prog(
        driver,
        cache,
        cfg,
        active,
        tail_off,
        &Record::SuperMessage { config_bytes: encode_config_bytes(cfg) },
    )?;
    super_prog(
        driver,
        cache,
        cfg,
        active,
        tail_off,
        &Record::RegionMap { free: region_map_free.to_vec(), reserve_region },
    )?;
    super_prog(driver, cache, cfg, active, tail_off, &Record::IdMapAddr { sector: id_map_sector })?;
    super_prog(driver, cache, cfg, active, tail_off, &Record::SectorMapAddr { sector: sector_map_sector })?;
    super_prog(
        driver,
        cache,
        cfg,
        active,
        tail_off,
        &Record::Name {
            kind: crate::record::EntryKind::Dir,
            child_id: 1,
            tail_sector: root_tail_sector,
            name: Vec::new(),
        },
    )?;
    if let Some(wl) = wl_sector {
        super_prog(driver, cache, cfg, active, tail_off, &Record::WlAddr { sector: wl })?;
    }
    super_prog(
        driver,
        cache,
        cfg,
        active,
        tail_off,
        &Record::Commit {
            next_free_id,
            next_dir_scan,
            next_bfile_scan,
            scan_times,
            reserve_region,
        },
    )?;
    Ok(())
}

/// Rotate to the other superblock sector: erase it, stamp a fresh header
/// whose extension is `(prev + 2) mod 64` (skipping the reserved value),
/// and re-emit the full record log.
#[allow(clippy::too_many_arguments)]
pub fn rotate<D: FlashDriver>(
    driver: &mut D,
    cache: &mut Cache,
    cfg: &Config,
    current_active: u32,
    current_extension: u32,
    region_map_free: &[u8],
    reserve_region: u32,
    id_map_sector: u32,
    sector_map_sector: u32,
    root_tail_sector: u32,
    wl_sector: Option<u32>,
    next_free_id: u16,
    next_dir_scan: u32,
    next_bfile_scan: u32,
    scan_times: u32,
) -> Result<(u32, u32, u32)> {
    let next_sector = if current_active == SUPER_SECTOR_A { SUPER_SECTOR_B } else { SUPER_SECTOR_A };
    driver.erase(next_sector)?;
    cache.invalidate_sector(next_sector);
    let mut next_ext = (current_extension + 2) % EXT_MOD;
    if next_ext == EXT_RESERVED {
        next_ext = (next_ext + 1) % EXT_MOD;
    }
    info!("rotating superblock {current_active} -> {next_sector}, extension {next_ext}");
    let head = SectorHead::new(SectorState::Using, SectorType::Super, next_ext, 0);
    cache.direct_prog(driver, next_sector, 0, &head.0.to_be_bytes())?;
    let mut tail_off = SUPER_DATA_START;
    emit_full_log(
        driver,
        cache,
        cfg,
        next_sector,
        &mut tail_off,
        region_map_free,
        reserve_region,
        id_map_sector,
        sector_map_sector,
        root_tail_sector,
        wl_sector,
        next_free_id,
        next_dir_scan,
        next_bfile_scan,
        scan_times,
    )?;
    cache.cache_flush(driver)?;
    // Retire the previous commit record so a crash mid-rotation still
    // finds exactly one `using` sector with a terminal commit.
    debug!("superblock rotation complete");
    Ok((next_sector, next_ext, tail_off))
}

/// Format both superblock sectors fresh, installing sector A as active
/// with extension 0.
pub fn format<D: FlashDriver>(
    driver: &mut D,
    cache: &mut Cache,
    cfg: &Config,
    region_map_free: &[u8],
    reserve_region: u32,
    id_map_sector: u32,
    sector_map_sector: u32,
    root_tail_sector: u32,
) -> Result<MountState> {
    driver.erase(SUPER_SECTOR_A)?;
    driver.erase(SUPER_SECTOR_B)?;
    cache.invalidate_sector(SUPER_SECTOR_A);
    cache.invalidate_sector(SUPER_SECTOR_B);
    let head = SectorHead::new(SectorState::Using, SectorType::Super, 0, 0);
    cache.direct_prog(driver, SUPER_SECTOR_A, 0, &head.0.to_be_bytes())?;
    let mut tail_off = SUPER_DATA_START;
    emit_full_log(
        driver,
        cache,
        cfg,
        SUPER_SECTOR_A,
        &mut tail_off,
        region_map_free,
        reserve_region,
        id_map_sector,
        sector_map_sector,
        root_tail_sector,
        None,
        2,
        0,
        0,
        0,
    )?;
    cache.cache_flush(driver)?;
    warn!("formatted fresh superblock at sector {SUPER_SECTOR_A}");
    Ok(MountState {
        active_sector: SUPER_SECTOR_A,
        extension: 0,
        tail_off,
        region_map_free: region_map_free.to_vec(),
        reserve_region,
        id_map_sector,
        sector_map_sector,
        wl_sector: None,
        root_tail_sector,
        next_free_id: 2,
        next_dir_scan: 0,
        next_bfile_scan: 0,
        scan_times: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_wrap_special_case() {
        assert!(extension_wins(0x3E, 0x00));
        assert!(!extension_wins(0x00, 0x3E));
        assert!(extension_wins(5, 3));
        assert!(!extension_wins(3, 5));
    }
}
