//! The flash driver contract.
//!
//! `norfs` never talks to hardware directly: every sector read, program,
//! erase and sync goes through a [`FlashDriver`] implementation supplied by
//! the embedder. The trait is intentionally thin — four synchronous calls,
//! no buffering, no retries — so a host can back it with anything from a
//! raw SPI-NOR part to a plain file.

use norfs_err::Result;

/// Synchronous, single-threaded access to a NOR flash device addressed as
/// `sector_count` fixed-size erase units.
///
/// Implementations must not perform any implicit read-modify-write: `prog`
/// only ever clears bits the caller asked to clear, and `erase` is the only
/// operation allowed to set bits back to one.
pub trait FlashDriver {
    /// Read `buf.len()` bytes starting at `(sector, offset)`.
    ///
    /// Callers guarantee `offset + buf.len() <= sector_size`.
    fn read(&mut self, sector: u32, offset: u32, buf: &mut [u8]) -> Result<()>;

    /// Program `buf` at `(sector, offset)`.
    ///
    /// No pre-read and no verify: only bits explicitly present as zero in
    /// `buf` are guaranteed to end up zero; all other bits at the target
    /// location are left untouched.
    fn prog(&mut self, sector: u32, offset: u32, buf: &[u8]) -> Result<()>;

    /// Reset every byte of `sector` to `0xFF`.
    fn erase(&mut self, sector: u32) -> Result<()>;

    /// Drain any internal buffering so prior `prog`/`erase` calls are
    /// durable.
    fn sync(&mut self) -> Result<()>;

    /// Total number of erasable sectors this driver exposes.
    fn sector_count(&self) -> u32;

    /// Size in bytes of one erasable sector.
    fn sector_size(&self) -> u32;
}
