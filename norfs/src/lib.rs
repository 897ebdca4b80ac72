//! A log-structured filesystem for raw NOR flash.
//!
//! Space is allocated sector-at-a-time from region-partitioned bitmaps
//! ([`space`]), wear-leveled by periodically swapping the coldest and
//! hottest regions through a reserve region. Directories are append-only
//! logs of name and data records ([`dir`], [`record`]), files under a
//! threshold are stored inline and larger ones as an extent index
//! ([`file`]). Two sector-sized superblocks rotate to survive power loss
//! mid-write ([`superblock`]), and a RAM-resident path cache
//! ([`tree`]) avoids re-walking flash for hot lookups.
//!
//! [`Filesystem`] ties all of this together as the single entry point.

pub mod cache;
pub mod config;
pub mod dir;
pub mod file;
pub mod fs;
pub mod head;
pub mod idmap;
pub mod record;
pub mod space;
pub mod superblock;
pub mod tree;

pub use config::Config;
pub use fs::{DirId, FileId, Filesystem, SeekFrom};
pub use norfs_err::{Error, Result};
pub use record::EntryKind;
