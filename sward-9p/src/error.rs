use std::borrow::Cow;
use std::io;

use thiserror::Error;

/// Errors surfaced to 9P clients.
///
/// The display text of an error is exactly the ename the client receives
/// in the corresponding Rerror message, so variants spell out the
/// conventional Plan 9 wording.
#[derive(Debug, Error)]
pub enum Error {
    #[error("permission denied")]
    Perm,
    #[error("file not found")]
    NotFound,
    #[error("operation not implemented")]
    NotImplemented,
    #[error("bad operation type")]
    BadOperation,
    #[error("fid {0} not found")]
    FidNotFound(u32),
    #[error("fid {0} already in use")]
    FidInUse(u32),
    #[error("fid {0} is not usable yet")]
    FidNotAttached(u32),
    #[error("fid must be opened first")]
    FidNotOpen,
    #[error("operation not allowed on open fid")]
    FidOpen,
    #[error("fid is already open")]
    FidAlreadyOpen,
    #[error("bad open mode")]
    BadOpenMode,
    #[error("root is not a directory")]
    RootNotDir,
    #[error("offset too big")]
    BadOffset,
    #[error("illegal read offset in directory (got {got} want {want})")]
    BadDirOffset { got: u64, want: u64 },
    #[error("directory read count too small for directory entry")]
    DirCountTooSmall,
    #[error("read-only file")]
    ReadOnly,
    #[error("write-only file")]
    WriteOnly,
    #[error("max file size exceeded")]
    FileSizeExceeded,
    #[error("{0}")]
    Message(Cow<'static, str>),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// An error whose text is sent to the client verbatim.
    pub fn msg(text: impl Into<Cow<'static, str>>) -> Error {
        Error::Message(text.into())
    }
}
