//! A small RAM cache of `(parent_id, name) -> location` mappings, so path
//! resolution usually avoids walking flash at all.

use norfs_flash::FlashDriver;

use crate::cache::Cache;
use crate::config::{Config, ENTRY_NAME_LEN};
use crate::dir::{dtraverse_name, MovedName};
use crate::record::EntryKind;
use norfs_err::Result;

fn djb2(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 5381;
    for &b in bytes {
        hash = hash.wrapping_mul(33).wrapping_add(b as u64);
    }
    hash
}

#[derive(Debug, Clone, Copy)]
enum NameKey {
    Inline { len: u8, bytes: [u8; ENTRY_NAME_LEN] },
    Hashed(u64),
}

impl NameKey {
    fn new(name: &[u8]) -> Self {
        if name.len() <= ENTRY_NAME_LEN {
            let mut bytes = [0u8; ENTRY_NAME_LEN];
            bytes[..name.len()].copy_from_slice(name);
            NameKey::Inline { len: name.len() as u8, bytes }
        } else {
            NameKey::Hashed(djb2(name))
        }
    }

    fn matches_inline(&self, name: &[u8]) -> Option<bool> {
        match self {
            NameKey::Inline { len, bytes } => Some(*len as usize == name.len() && &bytes[..*len as usize] == name),
            NameKey::Hashed(_) => None,
        }
    }

    fn matches_hash(&self, name: &[u8]) -> bool {
        match self {
            NameKey::Hashed(h) => *h == djb2(name),
            NameKey::Inline { .. } => false,
        }
    }
}

#[derive(Clone, Copy)]
struct Entry {
    id: u16,
    parent_id: u16,
    name_sector: u32,
    name_off: u32,
    tail_sector: u32,
    kind: EntryKind,
    key: NameKey,
}

/// Fixed-capacity tree cache. Inserts beyond capacity are silently dropped:
/// correctness never depends on a hit, only performance does.
pub struct TreeCache {
    entries: Vec<Entry>,
    capacity: usize,
}

impl TreeCache {
    pub fn new(cfg: &Config) -> Self {
        // Sized to fit comfortably in one cache line's worth of lookups.
        let capacity = (cfg.cache_size as usize / 24).max(8);
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn install_root(&mut self, root_tail_sector: u32) {
        self.entries.retain(|e| e.id != 1);
        self.entries.insert(
            0,
            Entry {
                id: 1,
                parent_id: 1,
                name_sector: 0,
                name_off: 0,
                tail_sector: root_tail_sector,
                kind: EntryKind::Dir,
                key: NameKey::new(b""),
            },
        );
    }

    pub fn insert(
        &mut self,
        id: u16,
        parent_id: u16,
        kind: EntryKind,
        name: &[u8],
        name_sector: u32,
        name_off: u32,
        tail_sector: u32,
    ) {
        self.entries.retain(|e| !(e.parent_id == parent_id && e.id == id));
        if self.entries.len() >= self.capacity {
            return;
        }
        self.entries.push(Entry {
            id,
            parent_id,
            name_sector,
            name_off,
            tail_sector,
            kind,
            key: NameKey::new(name),
        });
    }

    pub fn invalidate(&mut self, parent_id: u16, id: u16) {
        self.entries.retain(|e| !(e.parent_id == parent_id && e.id == id));
    }

    /// Reflect a GC move of a name record without re-scanning flash.
    pub fn apply_move(&mut self, mv: &MovedName) {
        for e in &mut self.entries {
            if e.name_sector == mv.old_sector && e.name_off == mv.old_off {
                e.name_sector = mv.new_sector;
                e.name_off = mv.new_off;
            }
        }
    }

    pub fn update_tail(&mut self, id: u16, tail_sector: u32) {
        for e in &mut self.entries {
            if e.id == id && e.kind == EntryKind::Dir {
                e.tail_sector = tail_sector;
            }
        }
    }

    /// Look up by exact parent+name; for hashed entries, the caller must
    /// verify against flash before trusting the result (the hash can
    /// collide).
    fn lookup_local(&self, parent_id: u16, name: &[u8]) -> Option<(Entry, bool)> {
        for e in &self.entries {
            if e.parent_id != parent_id {
                continue;
            }
            if let Some(eq) = e.key.matches_inline(name) {
                if eq {
                    return Some((*e, true));
                }
            } else if e.key.matches_hash(name) {
                return Some((*e, false));
            }
        }
        None
    }

    pub fn root_tail_sector(&self) -> Option<u32> {
        self.entries.iter().find(|e| e.id == 1).map(|e| e.tail_sector)
    }
}

pub struct Resolved {
    pub kind: EntryKind,
    pub id: u16,
    pub tail_sector: u32,
    pub name_sector: u32,
    pub name_off: u32,
}

/// Resolve one path component under `parent_id`, consulting the tree
/// cache first and falling back to a flash traversal of `parent_tail` on
/// a miss or a hash that needs verification.
pub fn resolve_component<D: FlashDriver>(
    tree: &mut TreeCache,
    driver: &mut D,
    cache: &mut Cache,
    cfg: &Config,
    parent_id: u16,
    parent_tail: u32,
    name: &[u8],
) -> Result<Option<Resolved>> {
    if let Some((entry, verified)) = tree.lookup_local(parent_id, name) {
        if verified {
            return Ok(Some(Resolved {
                kind: entry.kind,
                id: entry.id,
                tail_sector: entry.tail_sector,
                name_sector: entry.name_sector,
                name_off: entry.name_off,
            }));
        }
    }
    match dtraverse_name(driver, cache, cfg, parent_tail, None, name)? {
        Some(found) => {
            tree.insert(
                found.child_id,
                parent_id,
                found.kind,
                name,
                found.name_sector,
                found.name_off,
                found.tail_sector,
            );
            Ok(Some(Resolved {
                kind: found.kind,
                id: found.child_id,
                tail_sector: found.tail_sector,
                name_sector: found.name_sector,
                name_off: found.name_off,
            }))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_name_is_stored_inline() {
        let name = b"short";
        let key = NameKey::new(name);
        assert!(matches!(key, NameKey::Inline { .. }));
        assert_eq!(key.matches_inline(name), Some(true));
    }

    #[test]
    fn long_name_falls_back_to_hash() {
        let name = b"a-name-longer-than-twelve-bytes";
        let key = NameKey::new(name);
        assert!(matches!(key, NameKey::Hashed(_)));
        assert!(key.matches_hash(name));
        assert!(!key.matches_hash(b"different-long-name-value"));
    }

    #[test]
    fn insert_beyond_capacity_is_silently_dropped() {
        let cfg = Config::new(16, 16, 256, 16, 64, 4);
        let mut tree = TreeCache::new(&cfg);
        let capacity = tree.capacity;
        for i in 0..capacity + 5 {
            tree.insert(i as u16 + 2, 1, EntryKind::File, b"x", 0, 0, 0);
        }
        assert!(tree.entries.len() <= capacity);
    }
}
