//! The tagged record payloads that ride behind a [`DataHead`] inside a dir
//! sector or a superblock sector.

use norfs_err::{Error, Result};

use crate::head::{DataHead, RecordType};

/// Name-record file-vs-dir discriminant, carried in the first payload byte
/// of a name record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone)]
pub enum Record {
    /// A file or dir name entry: `kind`, the child's id, and its name.
    /// `tail_sector` locates the child's own chain; meaningful only for
    /// `Dir` entries (a file's data lives in this same chain), `0xFFFFFFFF`
    /// otherwise.
    Name {
        kind: EntryKind,
        child_id: u16,
        tail_sector: u32,
        name: Vec<u8>,
    },
    /// Payload for a file whose contents fit inline.
    SmallFileData { bytes: Vec<u8> },
    /// `(start_sector, offset, length)` extents for a big file, in order.
    BigFileIndex { extents: Vec<(u32, u32, u32)> },
    /// Hint recording accumulated dead space in a dir, so a reopen doesn't
    /// need a full traversal to know when GC is due.
    DirOldSpaceHint { old_space: u32 },
    RegionMap { free: Vec<u8>, reserve_region: u32 },
    IdMapAddr { sector: u32 },
    SectorMapAddr { sector: u32 },
    WlAddr { sector: u32 },
    SuperMessage { config_bytes: Vec<u8> },
    Commit {
        next_free_id: u16,
        next_dir_scan: u32,
        next_bfile_scan: u32,
        scan_times: u32,
        reserve_region: u32,
    },
}

impl Record {
    pub fn record_type(&self) -> RecordType {
        match self {
            Record::Name { kind: EntryKind::File, .. } => RecordType::FileName,
            Record::Name { kind: EntryKind::Dir, .. } => RecordType::DirName,
            Record::SmallFileData { .. } => RecordType::SmallFileData,
            Record::BigFileIndex { .. } => RecordType::BigFileIndex,
            Record::DirOldSpaceHint { .. } => RecordType::DirOldSpaceHint,
            Record::RegionMap { .. } => RecordType::RegionMap,
            Record::IdMapAddr { .. } => RecordType::IdMapAddr,
            Record::SectorMapAddr { .. } => RecordType::SectorMapAddr,
            Record::WlAddr { .. } => RecordType::WlAddr,
            Record::SuperMessage { .. } => RecordType::SuperMessage,
            Record::Commit { .. } => RecordType::Commit,
        }
    }

    /// Encode the payload bytes that follow the 4-byte header.
    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            Record::Name {
                child_id,
                tail_sector,
                name,
                ..
            } => {
                let mut v = Vec::with_capacity(6 + name.len());
                v.extend_from_slice(&child_id.to_be_bytes());
                v.extend_from_slice(&tail_sector.to_be_bytes());
                v.extend_from_slice(name);
                v
            }
            Record::SmallFileData { bytes } => bytes.clone(),
            Record::BigFileIndex { extents } => {
                let mut v = Vec::with_capacity(extents.len() * 12);
                for (s, o, l) in extents {
                    v.extend_from_slice(&s.to_be_bytes());
                    v.extend_from_slice(&o.to_be_bytes());
                    v.extend_from_slice(&l.to_be_bytes());
                }
                v
            }
            Record::DirOldSpaceHint { old_space } => old_space.to_be_bytes().to_vec(),
            Record::RegionMap { free, reserve_region } => {
                let mut v = free.clone();
                v.extend_from_slice(&reserve_region.to_be_bytes());
                v
            }
            Record::IdMapAddr { sector } | Record::SectorMapAddr { sector } | Record::WlAddr { sector } => {
                sector.to_be_bytes().to_vec()
            }
            Record::SuperMessage { config_bytes } => config_bytes.clone(),
            Record::Commit {
                next_free_id,
                next_dir_scan,
                next_bfile_scan,
                scan_times,
                reserve_region,
            } => {
                let mut v = Vec::with_capacity(18);
                v.extend_from_slice(&next_free_id.to_be_bytes());
                v.extend_from_slice(&next_dir_scan.to_be_bytes());
                v.extend_from_slice(&next_bfile_scan.to_be_bytes());
                v.extend_from_slice(&scan_times.to_be_bytes());
                v.extend_from_slice(&reserve_region.to_be_bytes());
                v
            }
        }
    }

    /// Build the uncommitted header + payload pair ready for the two-pass
    /// commit protocol. The header's length field counts the header
    /// itself, so it equals `4 + payload.len()`.
    pub fn encode(&self, owner_id: u16) -> (DataHead, Vec<u8>) {
        let payload = self.encode_payload();
        let head = DataHead::new_uncommitted(owner_id, self.record_type(), 4 + payload.len() as u32);
        (head, payload)
    }

    pub fn decode(ty: RecordType, payload: &[u8]) -> Result<Self> {
        Ok(match ty {
            RecordType::FileName | RecordType::DirName => {
                if payload.len() < 6 {
                    return Err(Error::Corrupt);
                }
                let child_id = u16::from_be_bytes([payload[0], payload[1]]);
                let tail_sector = u32::from_be_bytes(payload[2..6].try_into().unwrap());
                Record::Name {
                    kind: if ty == RecordType::FileName { EntryKind::File } else { EntryKind::Dir },
                    child_id,
                    tail_sector,
                    name: payload[6..].to_vec(),
                }
            }
            RecordType::SmallFileData => Record::SmallFileData { bytes: payload.to_vec() },
            RecordType::BigFileIndex => {
                if payload.len() % 12 != 0 {
                    return Err(Error::Corrupt);
                }
                let extents = payload
                    .chunks_exact(12)
                    .map(|c| {
                        let s = u32::from_be_bytes(c[0..4].try_into().unwrap());
                        let o = u32::from_be_bytes(c[4..8].try_into().unwrap());
                        let l = u32::from_be_bytes(c[8..12].try_into().unwrap());
                        (s, o, l)
                    })
                    .collect();
                Record::BigFileIndex { extents }
            }
            RecordType::DirOldSpaceHint => {
                if payload.len() != 4 {
                    return Err(Error::Corrupt);
                }
                Record::DirOldSpaceHint {
                    old_space: u32::from_be_bytes(payload.try_into().unwrap()),
                }
            }
            RecordType::RegionMap => {
                if payload.len() < 4 {
                    return Err(Error::Corrupt);
                }
                let (free, tail) = payload.split_at(payload.len() - 4);
                Record::RegionMap {
                    free: free.to_vec(),
                    reserve_region: u32::from_be_bytes(tail.try_into().unwrap()),
                }
            }
            RecordType::IdMapAddr | RecordType::SectorMapAddr | RecordType::WlAddr => {
                if payload.len() != 4 {
                    return Err(Error::Corrupt);
                }
                let sector = u32::from_be_bytes(payload.try_into().unwrap());
                match ty {
                    RecordType::IdMapAddr => Record::IdMapAddr { sector },
                    RecordType::SectorMapAddr => Record::SectorMapAddr { sector },
                    _ => Record::WlAddr { sector },
                }
            }
            RecordType::SuperMessage => Record::SuperMessage { config_bytes: payload.to_vec() },
            RecordType::Commit => {
                if payload.len() != 18 {
                    return Err(Error::Corrupt);
                }
                Record::Commit {
                    next_free_id: u16::from_be_bytes(payload[0..2].try_into().unwrap()),
                    next_dir_scan: u32::from_be_bytes(payload[2..6].try_into().unwrap()),
                    next_bfile_scan: u32::from_be_bytes(payload[6..10].try_into().unwrap()),
                    scan_times: u32::from_be_bytes(payload[10..14].try_into().unwrap()),
                    reserve_region: u32::from_be_bytes(payload[14..18].try_into().unwrap()),
                }
            }
            RecordType::Delete | RecordType::Magic | RecordType::Free => return Err(Error::Corrupt),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_record_round_trips() {
        let rec = Record::Name {
            kind: EntryKind::File,
            child_id: 7,
            tail_sector: 0xFFFF_FFFF,
            name: b"readme.txt".to_vec(),
        };
        let (head, payload) = rec.encode(1);
        let decoded = Record::decode(head.committed().ty().unwrap(), &payload).unwrap();
        match decoded {
            Record::Name { kind, child_id, name, .. } => {
                assert_eq!(kind, EntryKind::File);
                assert_eq!(child_id, 7);
                assert_eq!(name, b"readme.txt");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn big_file_index_round_trips() {
        let rec = Record::BigFileIndex {
            extents: vec![(4, 0, 256), (5, 0, 128)],
        };
        let (head, payload) = rec.encode(3);
        let decoded = Record::decode(head.committed().ty().unwrap(), &payload).unwrap();
        match decoded {
            Record::BigFileIndex { extents } => assert_eq!(extents, vec![(4, 0, 256), (5, 0, 128)]),
            _ => panic!("wrong variant"),
        }
    }
}
