//! The top-level mounted filesystem: open-file/open-dir bookkeeping, path
//! resolution, and the public operations that tie every other module
//! together.

use norfs_err::{Error, Result};
use norfs_flash::FlashDriver;

use crate::cache::Cache;
use crate::config::{Config, DIR_LIST_MAX, FILE_LIST_MAX};
use crate::dir::{
    chain_sectors, data_delete, dir_old, dir_old_single, dir_prog, dir_update, dtraverse_bfile_delete,
    dtraverse_data, dtraverse_gc, dtraverse_name, read_records, stamp_dir_links, Dir, DIR_DATA_START, NO_PREV,
};
use crate::file::{self, sectors_of, FileData, FileHandle};
use crate::head::{RecordType, SectorType};
use crate::idmap::IdManager;
use crate::record::{EntryKind, Record};
use crate::space::{RegionKind, SpaceManager};
use crate::superblock::{self, MountState};
use crate::tree::{resolve_component, TreeCache};

/// Seek origin, mirroring the three POSIX whence values.
#[derive(Debug, Clone, Copy)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

struct OpenDir {
    id: u16,
    parent_id: u16,
    name: Vec<u8>,
    dir: Dir,
    /// Number of explicit `open_dir` handles outstanding on this exact dir.
    handles: u32,
    /// Number of open children (files or subdirs) that require this dir to
    /// stay resident so their eventual `sync`/`close` can find it.
    child_pins: u32,
}

struct OpenFile {
    parent_id: u16,
    handle: FileHandle,
}

/// A mounted filesystem instance.
///
/// Once a mount-fatal error has been returned from any call, `poisoned`
/// holds it and every subsequent public call short-circuits with the same
/// error without touching the driver, until the handle is dropped and a
/// fresh `mount` is performed.
pub struct Filesystem<D: FlashDriver> {
    driver: D,
    cfg: Config,
    cache: Cache,
    space: SpaceManager,
    ids: IdManager,
    tree: TreeCache,
    mount: MountState,
    open_dirs: Vec<OpenDir>,
    open_files: Vec<OpenFile>,
    poisoned: Option<Error>,
}

/// Handle to an open file; opaque beyond identity.
pub struct FileId(usize);

/// Handle to an open directory; opaque beyond identity.
pub struct DirId(usize);

fn split_name(path: &[u8]) -> Vec<&[u8]> {
    path.split(|&b| b == b'/').filter(|c| !c.is_empty()).collect()
}

fn two_mut<T>(items: &mut [T], i: usize, j: usize) -> (&mut T, &mut T) {
    assert_ne!(i, j);
    if i < j {
        let (left, right) = items.split_at_mut(j);
        (&mut left[i], &mut right[0])
    } else {
        let (left, right) = items.split_at_mut(i);
        (&mut right[0], &mut left[j])
    }
}

fn clone_error(e: &Error) -> Error {
    match e {
        Error::Io(io) => Error::Io(std::io::Error::new(io.kind(), io.to_string())),
        Error::NoSpace => Error::NoSpace,
        Error::NoMemory => Error::NoMemory,
        Error::NoData => Error::NoData,
        Error::NoId => Error::NoId,
        Error::NameTooLong => Error::NameTooLong,
        Error::TooManyOpen => Error::TooManyOpen,
        Error::NoFather => Error::NoFather,
        Error::NotFound => Error::NotFound,
        Error::Exists => Error::Exists,
        Error::NotDir => Error::NotDir,
        Error::IsDir => Error::IsDir,
        Error::NotEmpty => Error::NotEmpty,
        Error::BadFile => Error::BadFile,
        Error::FileTooBig => Error::FileTooBig,
        Error::Invalid(s) => Error::Invalid(s),
        Error::NoDirOpen => Error::NoDirOpen,
        Error::NoFileOpen => Error::NoFileOpen,
        Error::Corrupt => Error::Corrupt,
        Error::WrongCalculation => Error::WrongCalculation,
        Error::WrongConfig => Error::WrongConfig,
        Error::WrongHead => Error::WrongHead,
        Error::WrongProg => Error::WrongProg,
        Error::NotInList => Error::NotInList,
        Error::TreeEntryNotFound => Error::TreeEntryNotFound,
        Error::CantDelete => Error::CantDelete,
    }
}

impl<D: FlashDriver> Filesystem<D> {
    fn check_poisoned(&self) -> Result<()> {
        if let Some(e) = &self.poisoned {
            return Err(clone_error(e));
        }
        Ok(())
    }

    fn poison_if_fatal<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_mount_fatal() {
                self.poisoned = Some(clone_error(e));
            }
        }
        result
    }

    /// Erase the device and lay down a fresh, empty filesystem.
    pub fn format(mut driver: D, cfg: Config) -> Result<Self> {
        cfg.validate()?;
        let mut cache = Cache::new(cfg.cache_size, cfg.sector_size);
        let mut space = SpaceManager::new(&cfg);
        space.format(&cfg);
        let mut ids = IdManager::new(&cfg);
        ids.format();

        let root_sector = space.alloc(&mut driver, &mut cache, &cfg, RegionKind::Dir, SectorType::Dir, 1)?;
        stamp_dir_links(&mut driver, &mut cache, root_sector, NO_PREV, 1)?;

        let id_map_sector = space.alloc(&mut driver, &mut cache, &cfg, RegionKind::Meta, SectorType::Map, 1)?;
        let sector_map_sector = space.alloc(&mut driver, &mut cache, &cfg, RegionKind::Meta, SectorType::Map, 1)?;

        let mount = superblock::format(
            &mut driver,
            &mut cache,
            &cfg,
            &[],
            space.reserve_region(),
            id_map_sector,
            sector_map_sector,
            root_sector,
        )?;
        cache.cache_flush(&mut driver)?;

        let mut tree = TreeCache::new(&cfg);
        tree.install_root(root_sector);

        let root_dir = Dir {
            id: 1,
            parent_id: 1,
            head_sector: root_sector,
            tail_sector: root_sector,
            tail_off: DIR_DATA_START,
            old_space: 0,
        };
        let open_dirs = vec![OpenDir {
            id: 1,
            parent_id: 1,
            name: Vec::new(),
            dir: root_dir,
            handles: 1,
            child_pins: 0,
        }];

        Ok(Self {
            driver,
            cfg,
            cache,
            space,
            ids,
            tree,
            mount,
            open_dirs,
            open_files: Vec::new(),
            poisoned: None,
        })
    }

    /// Mount an already-formatted device, replaying the active superblock
    /// and rebuilding every RAM structure from durable state.
    pub fn mount(mut driver: D, cfg: Config) -> Result<Self> {
        cfg.validate()?;
        let mut cache = Cache::new(cfg.cache_size, cfg.sector_size);
        let (active, _a, _b) = superblock::pick_active(&mut driver)?.ok_or(Error::NoData)?;
        let mount = superblock::replay(&mut driver, &mut cache, &cfg, active)?;

        let space = SpaceManager::mount(&mut driver, &mut cache, &cfg, mount.reserve_region, mount.scan_times)?;

        let mut ids = IdManager::new(&cfg);
        ids.format();
        for _ in 0..mount.next_free_id.saturating_sub(2) {
            // Re-walk the high-water mark of ids ever handed out; this
            // approximates occupancy without reclaiming holes left by ids
            // freed and never reused before the last sync.
            ids.alloc()?;
        }

        let mut tree = TreeCache::new(&cfg);
        tree.install_root(mount.root_tail_sector);

        let tail_off = tail_used_offset(&mut driver, &mut cache, &cfg, mount.root_tail_sector)?;
        let root_dir = Dir {
            id: 1,
            parent_id: 1,
            head_sector: mount.root_tail_sector,
            tail_sector: mount.root_tail_sector,
            tail_off,
            old_space: 0,
        };
        let open_dirs = vec![OpenDir {
            id: 1,
            parent_id: 1,
            name: Vec::new(),
            dir: root_dir,
            handles: 1,
            child_pins: 0,
        }];

        Ok(Self {
            driver,
            cfg,
            cache,
            space,
            ids,
            tree,
            mount,
            open_dirs,
            open_files: Vec::new(),
            poisoned: None,
        })
    }

    /// Reclaim the underlying driver, discarding every RAM structure.
    /// Callers that want prior writes durable should `sync()` first; this
    /// is how a test or embedder simulates a clean unmount.
    pub fn into_driver(self) -> D {
        self.driver
    }

    /// Flush every dirty file, GC any directory whose dead space warrants
    /// it, and persist a fresh superblock record log.
    pub fn sync(&mut self) -> Result<()> {
        self.check_poisoned()?;
        let r = self.sync_inner();
        self.poison_if_fatal(r)
    }

    fn sync_inner(&mut self) -> Result<()> {
        for i in 0..self.open_files.len() {
            let parent_id = self.open_files[i].parent_id;
            let dir_idx = self
                .open_dirs
                .iter()
                .position(|d| d.id == parent_id)
                .ok_or(Error::NoFather)?;
            file::flush(
                &mut self.open_files[i].handle,
                &mut self.open_dirs[dir_idx].dir,
                &mut self.driver,
                &mut self.cache,
                &mut self.space,
                &self.cfg,
            )?;
            self.sync_dir_tail(dir_idx)?;
        }

        for idx in 0..self.open_dirs.len() {
            if self.open_dirs[idx].dir.old_space >= 3 * self.cfg.sector_size {
                let moved = dtraverse_gc(
                    &mut self.open_dirs[idx].dir,
                    &mut self.driver,
                    &mut self.cache,
                    &mut self.space,
                    &self.cfg,
                )?;
                for mv in &moved {
                    self.tree.apply_move(mv);
                }
                self.sync_dir_tail(idx)?;
            }
        }

        self.persist_superblock()?;
        self.driver.sync()?;
        Ok(())
    }

    /// After a dir's tail sector changed, propagate the new tail into its
    /// parent's name record (recursively, since updating the parent may in
    /// turn grow the parent's own chain and move *its* tail).
    fn sync_dir_tail(&mut self, idx: usize) -> Result<()> {
        let id = self.open_dirs[idx].id;
        let parent_id = self.open_dirs[idx].parent_id;
        let tail_sector = self.open_dirs[idx].dir.tail_sector;
        self.tree.update_tail(id, tail_sector);

        if id == 1 {
            self.mount.root_tail_sector = tail_sector;
            return Ok(());
        }

        let name = self.open_dirs[idx].name.clone();
        match self.open_dirs.iter().position(|d| d.id == parent_id) {
            Some(parent_idx) => {
                let (child, parent) = two_mut(&mut self.open_dirs, idx, parent_idx);
                dir_update(
                    &child.dir,
                    &mut self.driver,
                    &mut self.cache,
                    &mut self.space,
                    &self.cfg,
                    &mut parent.dir,
                    &name,
                )?;
                self.sync_dir_tail(parent_idx)
            }
            None => Err(Error::NoFather),
        }
    }

    /// Emit a fresh full superblock record log at the current tail,
    /// rotating to the other superblock sector if it doesn't fit. The
    /// replay protocol's last-value-wins, stop-at-commit semantics make
    /// re-emitting every field harmless, so this same sequence serves both
    /// an ordinary sync and an explicit rotation.
    fn persist_superblock(&mut self) -> Result<()> {
        let wl_sector = self.mount.wl_sector;
        let root_tail_sector = self.mount.root_tail_sector;
        let reserve_region = self.space.reserve_region();
        let scan_times = self.space.scan_times();
        let next_free_id = self.mount.next_free_id;

        let mut tail_off = self.mount.tail_off;
        let attempt = superblock::emit_full_log(
            &mut self.driver,
            &mut self.cache,
            &self.cfg,
            self.mount.active_sector,
            &mut tail_off,
            &[],
            reserve_region,
            self.mount.id_map_sector,
            self.mount.sector_map_sector,
            root_tail_sector,
            wl_sector,
            next_free_id,
            0,
            0,
            scan_times,
        );
        match attempt {
            Ok(()) => {
                self.cache.cache_flush(&mut self.driver)?;
                self.mount.tail_off = tail_off;
                self.mount.reserve_region = reserve_region;
                self.mount.scan_times = scan_times;
                Ok(())
            }
            Err(Error::NoSpace) => {
                let (active, extension, tail) = superblock::rotate(
                    &mut self.driver,
                    &mut self.cache,
                    &self.cfg,
                    self.mount.active_sector,
                    self.mount.extension,
                    &[],
                    reserve_region,
                    self.mount.id_map_sector,
                    self.mount.sector_map_sector,
                    root_tail_sector,
                    wl_sector,
                    next_free_id,
                    0,
                    0,
                    scan_times,
                )?;
                self.mount.active_sector = active;
                self.mount.extension = extension;
                self.mount.tail_off = tail;
                self.mount.reserve_region = reserve_region;
                self.mount.scan_times = scan_times;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Bring `id` into `open_dirs` if it isn't already resident. Doesn't
    /// touch either refcount; callers decide what kind of pin justifies the
    /// residency.
    fn ensure_dir_resident(&mut self, id: u16, parent_id: u16, name: &[u8], tail_sector: u32) -> Result<usize> {
        if let Some(idx) = self.open_dirs.iter().position(|d| d.id == id) {
            return Ok(idx);
        }
        if self.open_dirs.len() >= DIR_LIST_MAX {
            return Err(Error::TooManyOpen);
        }
        let tail_off = tail_used_offset(&mut self.driver, &mut self.cache, &self.cfg, tail_sector)?;
        self.open_dirs.push(OpenDir {
            id,
            parent_id,
            name: name.to_vec(),
            dir: Dir {
                id,
                parent_id,
                head_sector: tail_sector,
                tail_sector,
                tail_off,
                old_space: 0,
            },
            handles: 0,
            child_pins: 0,
        });
        Ok(self.open_dirs.len() - 1)
    }

    /// Resolve every component but the last of `path`, making every
    /// ancestor (root through the immediate parent) resident and pinning
    /// each with a transient `child_pins` count for the duration of the
    /// caller's operation. Returns the parent's index, the final path
    /// component, and the list of dir ids that were transiently pinned so
    /// the caller can release them with [`Self::release_pins`].
    fn resolve_parent<'a>(&mut self, path: &'a [u8]) -> Result<(usize, &'a [u8], Vec<u16>)> {
        let comps = split_name(path);
        let (last, ancestors) = comps.split_last().ok_or(Error::Invalid("empty path"))?;
        let mut cur_idx = self.open_dirs.iter().position(|d| d.id == 1).expect("root always open");
        let mut pinned = Vec::new();
        for comp in ancestors {
            let parent_id = self.open_dirs[cur_idx].id;
            let parent_tail = self.open_dirs[cur_idx].dir.tail_sector;
            let resolved = match resolve_component(
                &mut self.tree,
                &mut self.driver,
                &mut self.cache,
                &self.cfg,
                parent_id,
                parent_tail,
                comp,
            ) {
                Ok(Some(r)) => r,
                Ok(None) => {
                    self.release_pins(&pinned)?;
                    return Err(Error::NotFound);
                }
                Err(e) => {
                    self.release_pins(&pinned)?;
                    return Err(e);
                }
            };
            if resolved.kind != EntryKind::Dir {
                self.release_pins(&pinned)?;
                return Err(Error::NotDir);
            }
            let idx = match self.ensure_dir_resident(resolved.id, parent_id, comp, resolved.tail_sector) {
                Ok(i) => i,
                Err(e) => {
                    self.release_pins(&pinned)?;
                    return Err(e);
                }
            };
            self.open_dirs[idx].child_pins += 1;
            pinned.push(resolved.id);
            cur_idx = idx;
        }
        Ok((cur_idx, *last, pinned))
    }

    /// Release one transient or persistent `child_pins` count per id in
    /// `ids`, evicting any dir whose `handles` and `child_pins` both reach
    /// zero. The root (id 1) is never pinned or evicted.
    fn release_pins(&mut self, ids: &[u16]) -> Result<()> {
        for &id in ids {
            if id == 1 {
                continue;
            }
            if let Some(idx) = self.open_dirs.iter().position(|d| d.id == id) {
                self.open_dirs[idx].child_pins = self.open_dirs[idx].child_pins.saturating_sub(1);
                if self.open_dirs[idx].handles == 0 && self.open_dirs[idx].child_pins == 0 {
                    self.open_dirs.remove(idx);
                }
            }
        }
        Ok(())
    }

    pub fn mkdir(&mut self, path: &[u8]) -> Result<()> {
        self.check_poisoned()?;
        let r = self.mkdir_inner(path);
        self.poison_if_fatal(r)
    }

    fn mkdir_inner(&mut self, path: &[u8]) -> Result<()> {
        let (parent_idx, name, pinned) = self.resolve_parent(path)?;
        if name.len() as u32 > self.cfg.name_max {
            self.release_pins(&pinned)?;
            return Err(Error::NameTooLong);
        }
        let parent_id = self.open_dirs[parent_idx].id;
        let parent_tail = self.open_dirs[parent_idx].dir.tail_sector;
        if dtraverse_name(&mut self.driver, &mut self.cache, &self.cfg, parent_tail, None, name)?.is_some() {
            self.release_pins(&pinned)?;
            return Err(Error::Exists);
        }
        let child_id = self.ids.alloc()?;
        let sector =
            self.space
                .alloc(&mut self.driver, &mut self.cache, &self.cfg, RegionKind::Dir, SectorType::Dir, 1)?;
        stamp_dir_links(&mut self.driver, &mut self.cache, sector, NO_PREV, child_id)?;
        let record = Record::Name {
            kind: EntryKind::Dir,
            child_id,
            tail_sector: sector,
            name: name.to_vec(),
        };
        let (name_sector, name_off) = dir_prog(
            &mut self.open_dirs[parent_idx].dir,
            &mut self.driver,
            &mut self.cache,
            &mut self.space,
            &self.cfg,
            child_id,
            &record,
        )?;
        self.tree.insert(child_id, parent_id, EntryKind::Dir, name, name_sector, name_off, sector);
        self.sync_dir_tail(parent_idx)?;
        self.mount.next_free_id = self.mount.next_free_id.max(child_id + 1);
        self.release_pins(&pinned)?;
        Ok(())
    }

    pub fn open_dir(&mut self, path: &[u8]) -> Result<DirId> {
        self.check_poisoned()?;
        let r = self.open_dir_inner(path);
        self.poison_if_fatal(r)
    }

    fn open_dir_inner(&mut self, path: &[u8]) -> Result<DirId> {
        if path.is_empty() || path == b"/" {
            let idx = self.open_dirs.iter().position(|d| d.id == 1).unwrap();
            self.open_dirs[idx].handles += 1;
            return Ok(DirId(idx));
        }
        if self.open_dirs.len() >= DIR_LIST_MAX {
            return Err(Error::TooManyOpen);
        }
        let (parent_idx, name, pinned) = self.resolve_parent(path)?;
        let parent_id = self.open_dirs[parent_idx].id;
        let parent_tail = self.open_dirs[parent_idx].dir.tail_sector;
        let found = match dtraverse_name(&mut self.driver, &mut self.cache, &self.cfg, parent_tail, Some(EntryKind::Dir), name) {
            Ok(Some(f)) => f,
            Ok(None) => {
                self.release_pins(&pinned)?;
                return Err(Error::NotFound);
            }
            Err(e) => {
                self.release_pins(&pinned)?;
                return Err(e);
            }
        };
        let idx = self.ensure_dir_resident(found.child_id, parent_id, name, found.tail_sector)?;
        self.open_dirs[idx].handles += 1;
        self.open_dirs[parent_idx].child_pins += 1;
        self.release_pins(&pinned)?;
        Ok(DirId(idx))
    }

    /// List every live name in `dir`, in on-flash order.
    pub fn readdir(&mut self, dir: &DirId) -> Result<Vec<(Vec<u8>, EntryKind)>> {
        self.check_poisoned()?;
        let r = self.readdir_inner(dir);
        self.poison_if_fatal(r)
    }

    fn readdir_inner(&mut self, dir: &DirId) -> Result<Vec<(Vec<u8>, EntryKind)>> {
        let od = self.open_dirs.get(dir.0).ok_or(Error::NoDirOpen)?;
        let mut out = Vec::new();
        for sector in chain_sectors(&mut self.driver, &mut self.cache, od.dir.tail_sector)? {
            for rec in read_records(&mut self.driver, &mut self.cache, &self.cfg, sector)? {
                let ty = match rec.head.ty() {
                    Some(t) => t,
                    None => continue,
                };
                if ty != RecordType::FileName && ty != RecordType::DirName {
                    continue;
                }
                if let Record::Name { kind, name, .. } = Record::decode(ty, &rec.payload)? {
                    out.push((name, kind));
                }
            }
        }
        Ok(out)
    }

    pub fn close_dir(&mut self, dir: DirId) -> Result<()> {
        self.check_poisoned()?;
        let r = self.close_dir_inner(dir);
        self.poison_if_fatal(r)
    }

    fn close_dir_inner(&mut self, dir: DirId) -> Result<()> {
        let idx = dir.0;
        if idx >= self.open_dirs.len() {
            return Err(Error::NoDirOpen);
        }
        if self.open_dirs[idx].id == 1 {
            self.open_dirs[idx].handles = self.open_dirs[idx].handles.saturating_sub(1).max(1);
            return Ok(());
        }
        if self.open_dirs[idx].child_pins > 0 {
            return Err(Error::CantDelete);
        }
        self.open_dirs[idx].handles -= 1;
        let parent_id = self.open_dirs[idx].parent_id;
        if self.open_dirs[idx].handles == 0 {
            self.open_dirs.remove(idx);
        }
        self.release_pins(&[parent_id])?;
        Ok(())
    }

    pub fn open_file(&mut self, path: &[u8], create: bool) -> Result<FileId> {
        self.check_poisoned()?;
        let r = self.open_file_inner(path, create);
        self.poison_if_fatal(r)
    }

    fn open_file_inner(&mut self, path: &[u8], create: bool) -> Result<FileId> {
        if self.open_files.len() >= FILE_LIST_MAX {
            return Err(Error::TooManyOpen);
        }
        let (parent_idx, name, pinned) = self.resolve_parent(path)?;
        let parent_id = self.open_dirs[parent_idx].id;
        let parent_tail = self.open_dirs[parent_idx].dir.tail_sector;
        let found = match dtraverse_name(&mut self.driver, &mut self.cache, &self.cfg, parent_tail, Some(EntryKind::File), name) {
            Ok(f) => f,
            Err(e) => {
                self.release_pins(&pinned)?;
                return Err(e);
            }
        };

        let handle = match found {
            Some(entry) => {
                let data_rec = dtraverse_data(&mut self.driver, &mut self.cache, &self.cfg, parent_tail, entry.child_id)?;
                let mut handle = FileHandle::new_empty(entry.child_id);
                if let Some(found_rec) = data_rec {
                    let total_len = 4 + found_rec.payload.len() as u32;
                    handle.record_loc = Some((found_rec.sector, found_rec.off, total_len));
                    match found_rec.head.ty() {
                        Some(RecordType::SmallFileData) => {
                            if let Record::SmallFileData { bytes } = Record::decode(RecordType::SmallFileData, &found_rec.payload)? {
                                handle.size = bytes.len() as u32;
                                handle.data = FileData::Small(bytes);
                            }
                        }
                        Some(RecordType::BigFileIndex) => {
                            if let Record::BigFileIndex { extents } = Record::decode(RecordType::BigFileIndex, &found_rec.payload)? {
                                handle.size = extents.iter().map(|e| e.2).sum();
                                handle.data = FileData::Big(extents);
                            }
                        }
                        _ => {}
                    }
                }
                handle
            }
            None => {
                if !create {
                    self.release_pins(&pinned)?;
                    return Err(Error::NotFound);
                }
                if name.len() as u32 > self.cfg.name_max {
                    self.release_pins(&pinned)?;
                    return Err(Error::NameTooLong);
                }
                let id = match self.ids.alloc() {
                    Ok(id) => id,
                    Err(e) => {
                        self.release_pins(&pinned)?;
                        return Err(e);
                    }
                };
                let record = Record::Name {
                    kind: EntryKind::File,
                    child_id: id,
                    tail_sector: NO_PREV,
                    name: name.to_vec(),
                };
                let (name_sector, name_off) = dir_prog(
                    &mut self.open_dirs[parent_idx].dir,
                    &mut self.driver,
                    &mut self.cache,
                    &mut self.space,
                    &self.cfg,
                    id,
                    &record,
                )?;
                self.tree.insert(id, parent_id, EntryKind::File, name, name_sector, name_off, NO_PREV);
                self.sync_dir_tail(parent_idx)?;
                self.mount.next_free_id = self.mount.next_free_id.max(id + 1);
                FileHandle::new_empty(id)
            }
        };

        self.open_dirs[parent_idx].child_pins += 1;
        self.release_pins(&pinned)?;
        self.open_files.push(OpenFile { parent_id, handle });
        Ok(FileId(self.open_files.len() - 1))
    }

    pub fn read(&mut self, file: &FileId, buf: &mut [u8]) -> Result<u32> {
        self.check_poisoned()?;
        let of = self.open_files.get_mut(file.0).ok_or(Error::NoFileOpen)?;
        let r = file::read(&mut of.handle, &mut self.driver, &mut self.cache, &self.cfg, buf);
        self.poison_if_fatal(r)
    }

    pub fn write(&mut self, file: &FileId, buf: &[u8]) -> Result<u32> {
        self.check_poisoned()?;
        let idx = file.0;
        let of = self.open_files.get(idx).ok_or(Error::NoFileOpen)?;
        let parent_id = of.parent_id;
        let dir_idx = self.open_dirs.iter().position(|d| d.id == parent_id).ok_or(Error::NoFather)?;
        let r = file::write(
            &mut self.open_files[idx].handle,
            &mut self.open_dirs[dir_idx].dir,
            &mut self.driver,
            &mut self.cache,
            &mut self.space,
            &self.cfg,
            buf,
        );
        self.poison_if_fatal(r)
    }

    pub fn seek(&mut self, file: &FileId, whence: SeekFrom) -> Result<u32> {
        self.check_poisoned()?;
        let of = self.open_files.get_mut(file.0).ok_or(Error::NoFileOpen)?;
        let new_pos = match whence {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(delta) => of.handle.pos as i64 + delta,
            SeekFrom::End(delta) => of.handle.size as i64 + delta,
        };
        if new_pos < 0 || new_pos as u32 > self.cfg.file_max {
            return Err(Error::Invalid("seek out of range"));
        }
        of.handle.pos = new_pos as u32;
        Ok(of.handle.pos)
    }

    pub fn file_size(&self, file: &FileId) -> Result<u32> {
        self.check_poisoned()?;
        Ok(self.open_files.get(file.0).ok_or(Error::NoFileOpen)?.handle.size)
    }

    pub fn close_file(&mut self, file: FileId) -> Result<()> {
        self.check_poisoned()?;
        let r = self.close_file_inner(file);
        self.poison_if_fatal(r)
    }

    fn close_file_inner(&mut self, file: FileId) -> Result<()> {
        let idx = file.0;
        if idx >= self.open_files.len() {
            return Err(Error::NoFileOpen);
        }
        let parent_id = self.open_files[idx].parent_id;
        let dir_idx = self.open_dirs.iter().position(|d| d.id == parent_id).ok_or(Error::NoFather)?;
        file::flush(
            &mut self.open_files[idx].handle,
            &mut self.open_dirs[dir_idx].dir,
            &mut self.driver,
            &mut self.cache,
            &mut self.space,
            &self.cfg,
        )?;
        self.sync_dir_tail(dir_idx)?;
        self.open_files.remove(idx);
        self.release_pins(&[parent_id])?;
        Ok(())
    }

    /// Remove a file or an empty directory.
    pub fn delete(&mut self, path: &[u8]) -> Result<()> {
        self.check_poisoned()?;
        let r = self.delete_inner(path);
        self.poison_if_fatal(r)
    }

    fn delete_inner(&mut self, path: &[u8]) -> Result<()> {
        let (parent_idx, name, pinned) = self.resolve_parent(path)?;
        let parent_id = self.open_dirs[parent_idx].id;
        let parent_tail = self.open_dirs[parent_idx].dir.tail_sector;
        let entry = match dtraverse_name(&mut self.driver, &mut self.cache, &self.cfg, parent_tail, None, name)? {
            Some(e) => e,
            None => {
                self.release_pins(&pinned)?;
                return Err(Error::NotFound);
            }
        };

        if self.open_dirs.iter().any(|d| d.id == entry.child_id) {
            self.release_pins(&pinned)?;
            return Err(Error::CantDelete);
        }
        if self.open_files.iter().any(|f| f.handle.id == entry.child_id) {
            self.release_pins(&pinned)?;
            return Err(Error::BadFile);
        }

        let result = (|| -> Result<()> {
            match entry.kind {
                EntryKind::File => {
                    if let Some(data_rec) =
                        dtraverse_data(&mut self.driver, &mut self.cache, &self.cfg, parent_tail, entry.child_id)?
                    {
                        if data_rec.head.ty() == Some(RecordType::BigFileIndex) {
                            if let Record::BigFileIndex { extents } = Record::decode(RecordType::BigFileIndex, &data_rec.payload)? {
                                for sector in sectors_of(&extents, self.cfg.sector_size) {
                                    dir_old_single(&mut self.driver, &mut self.cache, &mut self.space, &self.cfg, sector)?;
                                }
                            }
                        }
                        let total_len = 4 + data_rec.payload.len() as u32;
                        data_delete(
                            &mut self.driver,
                            &mut self.cache,
                            Some(&mut self.open_dirs[parent_idx].dir),
                            data_rec.sector,
                            data_rec.off,
                            total_len,
                        )?;
                    }
                    let name_len = 4 + 6 + name.len() as u32;
                    data_delete(
                        &mut self.driver,
                        &mut self.cache,
                        Some(&mut self.open_dirs[parent_idx].dir),
                        entry.name_sector,
                        entry.name_off,
                        name_len,
                    )?;
                    self.tree.invalidate(parent_id, entry.child_id);
                    self.ids.free(entry.child_id);
                }
                EntryKind::Dir => {
                    let children = dtraverse_name_any(&mut self.driver, &mut self.cache, &self.cfg, entry.tail_sector)?;
                    if !children.is_empty() {
                        return Err(Error::NotEmpty);
                    }
                    dtraverse_bfile_delete(&mut self.driver, &mut self.cache, &mut self.space, &self.cfg, entry.tail_sector)?;
                    dir_old(&mut self.driver, &mut self.cache, &mut self.space, &self.cfg, entry.tail_sector)?;
                    let name_len = 4 + 6 + name.len() as u32;
                    data_delete(
                        &mut self.driver,
                        &mut self.cache,
                        Some(&mut self.open_dirs[parent_idx].dir),
                        entry.name_sector,
                        entry.name_off,
                        name_len,
                    )?;
                    self.tree.invalidate(parent_id, entry.child_id);
                    self.ids.free(entry.child_id);
                }
            }
            self.sync_dir_tail(parent_idx)
        })();

        self.release_pins(&pinned)?;
        result
    }
}

/// Whether a dir's chain holds any live name record, for the empty-dir
/// check `delete` performs before removing a directory.
fn dtraverse_name_any<Drv: FlashDriver>(driver: &mut Drv, cache: &mut Cache, cfg: &Config, tail: u32) -> Result<Vec<u16>> {
    let mut ids = Vec::new();
    for sector in chain_sectors(driver, cache, tail)? {
        for rec in read_records(driver, cache, cfg, sector)? {
            match rec.head.ty() {
                Some(RecordType::FileName) | Some(RecordType::DirName) => ids.push(rec.head.owner_id()),
                _ => {}
            }
        }
    }
    Ok(ids)
}

/// Find the first unwritten offset in a dir sector, for reattaching to a
/// chain whose tail was replayed from the superblock rather than grown in
/// this session.
fn tail_used_offset<Drv: FlashDriver>(driver: &mut Drv, cache: &mut Cache, cfg: &Config, sector: u32) -> Result<u32> {
    let mut off = DIR_DATA_START;
    for rec in read_records(driver, cache, cfg, sector)? {
        off = rec.off + 4 + rec.payload.len() as u32;
    }
    Ok(off)
}
