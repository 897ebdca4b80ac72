//! Pack/unpack the 32-bit sector and data-record headers, and classify a
//! header's validity against an expected state/type/id.

use norfs_err::{Error, Result};

/// An unprogrammed flash word.
pub const UNWRITTEN: u32 = 0xFFFF_FFFF;

/// State a sector progresses through, free to old, via 1-bit flips only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorState {
    Free,
    WearLeveling,
    GcScratch,
    Allocating,
    Using,
    Old,
}

impl SectorState {
    fn bits(self) -> u32 {
        match self {
            SectorState::Free => 0xF,
            SectorState::WearLeveling => 0xB,
            SectorState::GcScratch => 0x7,
            SectorState::Allocating => 0x3,
            SectorState::Using => 0x1,
            SectorState::Old => 0x0,
        }
    }

    fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0xF => Some(SectorState::Free),
            0xB => Some(SectorState::WearLeveling),
            0x7 => Some(SectorState::GcScratch),
            0x3 => Some(SectorState::Allocating),
            0x1 => Some(SectorState::Using),
            0x0 => Some(SectorState::Old),
            _ => None,
        }
    }
}

/// What a sector is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorType {
    Super,
    Dir,
    BigFileData,
    Wl,
    Map,
    Reserve,
}

impl SectorType {
    fn bits(self) -> u32 {
        match self {
            SectorType::Super => 0x0,
            SectorType::Dir => 0x1,
            SectorType::BigFileData => 0x2,
            SectorType::Wl => 0x4,
            SectorType::Map => 0x5,
            SectorType::Reserve => 0x6,
        }
    }

    fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0x0 => Some(SectorType::Super),
            0x1 => Some(SectorType::Dir),
            0x2 => Some(SectorType::BigFileData),
            0x4 => Some(SectorType::Wl),
            0x5 => Some(SectorType::Map),
            0x6 => Some(SectorType::Reserve),
            _ => None,
        }
    }
}

/// `[valid:1][state:4][type:3][extension:6][erase_count:18]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorHead(pub u32);

impl SectorHead {
    const VALID_MASK: u32 = 0x8000_0000;
    const STATE_SHIFT: u32 = 27;
    const STATE_MASK: u32 = 0x7800_0000;
    const TYPE_SHIFT: u32 = 24;
    const TYPE_MASK: u32 = 0x0700_0000;
    const EXT_SHIFT: u32 = 18;
    const EXT_MASK: u32 = 0x00FC_0000;
    const ETIMES_MASK: u32 = 0x0003_FFFF;

    pub fn new(state: SectorState, ty: SectorType, extension: u32, erase_count: u32) -> Self {
        debug_assert!(extension <= 0x3F);
        debug_assert!(erase_count <= Self::ETIMES_MASK);
        let bits = (state.bits() << Self::STATE_SHIFT)
            | (ty.bits() << Self::TYPE_SHIFT)
            | (extension << Self::EXT_SHIFT)
            | erase_count;
        SectorHead(bits)
    }

    pub fn is_unwritten(self) -> bool {
        self.0 == UNWRITTEN
    }

    pub fn is_valid_bit_set(self) -> bool {
        self.0 & Self::VALID_MASK == 0
    }

    pub fn state(self) -> Option<SectorState> {
        SectorState::from_bits((self.0 & Self::STATE_MASK) >> Self::STATE_SHIFT)
    }

    pub fn ty(self) -> Option<SectorType> {
        SectorType::from_bits((self.0 & Self::TYPE_MASK) >> Self::TYPE_SHIFT)
    }

    pub fn extension(self) -> u32 {
        (self.0 & Self::EXT_MASK) >> Self::EXT_SHIFT
    }

    pub fn erase_count(self) -> u32 {
        self.0 & Self::ETIMES_MASK
    }

    /// Transition this header to a new state in place, preserving every
    /// other field. Only valid for 1-bit-at-a-time state transitions
    /// (free -> allocating -> using -> old), enforced by a debug
    /// assertion since flash only allows clearing bits.
    pub fn with_state(self, state: SectorState) -> Self {
        let new = (self.0 & !Self::STATE_MASK) | (state.bits() << Self::STATE_SHIFT);
        debug_assert_eq!(self.0 & !new, 0, "sector state transition must only clear bits");
        SectorHead(new)
    }

    /// A mask that, ANDed into the current on-flash word via
    /// `head_validate`, performs the same state transition as
    /// [`Self::with_state`] without needing the old value in hand.
    pub fn state_transition_mask(state: SectorState) -> u32 {
        !Self::STATE_MASK | (state.bits() << Self::STATE_SHIFT)
    }

    /// Classify this header against an optionally-expected state/type.
    /// `UNWRITTEN` is always `Ok` (sector hasn't been used yet).
    pub fn check(self, state: Option<SectorState>, ty: Option<SectorType>) -> Result<()> {
        if self.is_unwritten() {
            return Ok(());
        }
        if !self.is_valid_bit_set() || self.0 == 0 {
            return Err(Error::WrongHead);
        }
        if let Some(want) = state {
            if self.state() != Some(want) {
                return Err(Error::WrongHead);
            }
        }
        if let Some(want) = ty {
            if self.ty() != Some(want) {
                return Err(Error::WrongHead);
            }
        }
        Ok(())
    }
}

/// The five-bit record type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Delete,
    DirOldSpaceHint,
    SmallFileData,
    BigFileIndex,
    FileName,
    DirName,
    WlAddr,
    RegionMap,
    IdMapAddr,
    SectorMapAddr,
    Magic,
    Commit,
    SuperMessage,
    Free,
}

impl RecordType {
    fn bits(self) -> u32 {
        match self {
            RecordType::Delete => 0x00,
            RecordType::DirOldSpaceHint => 0x09,
            RecordType::SmallFileData => 0x0a,
            RecordType::BigFileIndex => 0x0b,
            RecordType::FileName => 0x0c,
            RecordType::DirName => 0x0e,
            RecordType::WlAddr => 0x16,
            RecordType::RegionMap => 0x17,
            RecordType::IdMapAddr => 0x18,
            RecordType::SectorMapAddr => 0x19,
            RecordType::Magic => 0x1c,
            RecordType::Commit => 0x1d,
            RecordType::SuperMessage => 0x1e,
            RecordType::Free => 0x1f,
        }
    }

    fn from_bits(bits: u32) -> Option<Self> {
        Some(match bits {
            0x00 => RecordType::Delete,
            0x09 => RecordType::DirOldSpaceHint,
            0x0a => RecordType::SmallFileData,
            0x0b => RecordType::BigFileIndex,
            0x0c => RecordType::FileName,
            0x0e => RecordType::DirName,
            0x16 => RecordType::WlAddr,
            0x17 => RecordType::RegionMap,
            0x18 => RecordType::IdMapAddr,
            0x19 => RecordType::SectorMapAddr,
            0x1c => RecordType::Magic,
            0x1d => RecordType::Commit,
            0x1e => RecordType::SuperMessage,
            0x1f => RecordType::Free,
            _ => return None,
        })
    }
}

/// `[valid:1][written:1][owner_id:13][type:5][length:12]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHead(pub u32);

impl DataHead {
    const VALID_MASK: u32 = 0x8000_0000;
    const WRITTEN_MASK: u32 = 0x4000_0000;
    const ID_SHIFT: u32 = 17;
    const ID_MASK: u32 = 0x3FFE_0000;
    const TYPE_SHIFT: u32 = 12;
    const TYPE_MASK: u32 = 0x0001_F000;
    const LEN_MASK: u32 = 0x0000_0FFF;

    /// Build a header with `written = 1` (not yet committed): this is the
    /// header as first programmed, before the second commit pass clears
    /// the written bit.
    pub fn new_uncommitted(owner_id: u16, ty: RecordType, len: u32) -> Self {
        debug_assert!((owner_id as u32) < (1 << 13));
        debug_assert!(len <= Self::LEN_MASK);
        let bits = Self::WRITTEN_MASK
            | (owner_id as u32) << Self::ID_SHIFT
            | ty.bits() << Self::TYPE_SHIFT
            | len;
        DataHead(bits)
    }

    pub fn is_unwritten(self) -> bool {
        self.0 == UNWRITTEN
    }

    pub fn is_valid_bit_set(self) -> bool {
        self.0 & Self::VALID_MASK == 0
    }

    pub fn is_written(self) -> bool {
        self.0 & Self::WRITTEN_MASK == 0
    }

    pub fn owner_id(self) -> u16 {
        ((self.0 & Self::ID_MASK) >> Self::ID_SHIFT) as u16
    }

    pub fn ty(self) -> Option<RecordType> {
        RecordType::from_bits((self.0 & Self::TYPE_MASK) >> Self::TYPE_SHIFT)
    }

    pub fn len(self) -> u32 {
        self.0 & Self::LEN_MASK
    }

    /// The second programming pass: clear the written bit, leaving every
    /// other field untouched.
    pub fn committed(self) -> Self {
        DataHead(self.0 & !Self::WRITTEN_MASK)
    }

    /// Flip the type field to the all-zero `delete` encoding, preserving
    /// length. Delete's type bits (all zero) are reachable from any other
    /// type's bits by 1-bit flips only, since flash programming can only
    /// clear bits.
    pub fn deleted(self) -> Self {
        DataHead(self.0 & !Self::TYPE_MASK)
    }

    /// A mask that, ANDed into the current on-flash word via
    /// `head_validate`, performs the same deletion as [`Self::deleted`].
    pub fn delete_mask() -> u32 {
        !Self::TYPE_MASK
    }

    /// Classify this header against an optionally-expected id/type.
    pub fn check(self, id: Option<u16>, ty: Option<RecordType>) -> Result<()> {
        if self.is_unwritten() {
            return Ok(());
        }
        if !self.is_valid_bit_set() || !self.is_written() {
            return Err(Error::WrongHead);
        }
        if let Some(want) = id {
            if self.owner_id() != want {
                return Err(Error::WrongHead);
            }
        }
        if let Some(want) = ty {
            if self.ty() != Some(want) {
                return Err(Error::WrongHead);
            }
        }
        if self.0 == 0 {
            return Err(Error::WrongHead);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_head_round_trips() {
        let h = SectorHead::new(SectorState::Using, SectorType::Dir, 5, 42);
        assert_eq!(h.state(), Some(SectorState::Using));
        assert_eq!(h.ty(), Some(SectorType::Dir));
        assert_eq!(h.extension(), 5);
        assert_eq!(h.erase_count(), 42);
    }

    #[test]
    fn sector_head_state_transition_only_clears_bits() {
        let h = SectorHead::new(SectorState::Free, SectorType::Dir, 0, 0);
        let h2 = h.with_state(SectorState::Allocating);
        assert_eq!(h2.state(), Some(SectorState::Allocating));
        let h3 = h2.with_state(SectorState::Using);
        assert_eq!(h3.state(), Some(SectorState::Using));
        let h4 = h3.with_state(SectorState::Old);
        assert_eq!(h4.state(), Some(SectorState::Old));
    }

    #[test]
    fn unwritten_header_checks_ok() {
        let h = SectorHead(UNWRITTEN);
        assert!(h.check(Some(SectorState::Using), None).is_ok());
    }

    #[test]
    fn all_zero_sector_head_is_corrupt() {
        let h = SectorHead(0);
        assert!(h.check(None, None).is_err());
    }

    #[test]
    fn data_head_commit_protocol() {
        let h = DataHead::new_uncommitted(7, RecordType::FileName, 20);
        assert!(!h.is_written());
        assert!(h.check(Some(7), Some(RecordType::FileName)).is_err());
        let committed = h.committed();
        assert!(committed.is_written());
        assert!(committed.check(Some(7), Some(RecordType::FileName)).is_ok());
        assert_eq!(committed.len(), 20);
    }

    #[test]
    fn data_head_delete_preserves_length() {
        let h = DataHead::new_uncommitted(3, RecordType::SmallFileData, 68).committed();
        let deleted = h.deleted();
        assert_eq!(deleted.ty(), Some(RecordType::Delete));
        assert_eq!(deleted.len(), 68);
        // Deletion must only clear bits relative to the committed header.
        assert_eq!(h.0 & !deleted.0, 0);
    }

    #[test]
    fn wrong_owner_is_wronghead() {
        let h = DataHead::new_uncommitted(1, RecordType::FileName, 16).committed();
        assert!(h.check(Some(2), None).is_err());
    }
}
