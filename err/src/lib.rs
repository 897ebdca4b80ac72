//! Error types shared by every `norfs` crate.

/// Every outcome a caller of the filesystem can observe.
///
/// One variant per visible error kind, plus [`Error::Io`] for driver-level
/// failures that propagate unchanged from the flash driver.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no space left on device")]
    NoSpace,
    #[error("no memory available")]
    NoMemory,
    #[error("no data on flash, device should be formatted")]
    NoData,
    #[error("no free id left")]
    NoId,
    #[error("name too long")]
    NameTooLong,
    #[error("too many files or directories open")]
    TooManyOpen,
    #[error("parent directory does not exist")]
    NoFather,
    #[error("no such file or directory")]
    NotFound,
    #[error("file or directory already exists")]
    Exists,
    #[error("not a directory")]
    NotDir,
    #[error("is a directory")]
    IsDir,
    #[error("directory not empty")]
    NotEmpty,
    #[error("bad file descriptor")]
    BadFile,
    #[error("file too large")]
    FileTooBig,
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error("directory not open")]
    NoDirOpen,
    #[error("file not open")]
    NoFileOpen,
    #[error("filesystem is corrupt")]
    Corrupt,
    #[error("internal calculation error")]
    WrongCalculation,
    #[error("on-flash config does not match requested config")]
    WrongConfig,
    #[error("unexpected header contents")]
    WrongHead,
    #[error("programmed data does not match what was requested")]
    WrongProg,
    #[error("entry not found in list")]
    NotInList,
    #[error("tree cache entry not found")]
    TreeEntryNotFound,
    #[error("cannot delete: structure still has children")]
    CantDelete,
}

impl Error {
    /// Whether this error leaves the mount unusable until the next `mount`.
    ///
    /// Mirrors the two error classes from the fault-handling design: these
    /// variants demand the filesystem refuse further operations rather than
    /// attempt to continue.
    pub fn is_mount_fatal(&self) -> bool {
        matches!(
            self,
            Error::Corrupt
                | Error::WrongHead
                | Error::WrongConfig
                | Error::WrongCalculation
                | Error::Io(_)
        )
    }
}

pub type Result<T> = core::result::Result<T, Error>;
