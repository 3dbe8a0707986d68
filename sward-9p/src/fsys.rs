//! The contract between the server runtime and a filesystem back-end.

use async_trait::async_trait;

use sward_protocol::{Dir, OpenMode, Qid};

use crate::Error;

/// A filesystem served over 9P.
///
/// `Fid` is the back-end's own representation of a file handle; the
/// runtime treats it as opaque.  The runtime coordinates access so that
/// methods taking `&mut Self::Fid` are never invoked concurrently on the
/// same fid, while methods taking `&Self::Fid` may be; implementations
/// need interior synchronisation only for state shared between fids.
///
/// Errors returned from these methods reach the client verbatim as the
/// text of an Rerror message.
#[async_trait]
pub trait Fsys: Send + Sync + 'static {
    type Fid: Send + Sync + 'static;

    /// Copies a fid.  This is called before every walk, not just for
    /// walks that introduce a new fid, so it should be cheap.  An open
    /// fid is never cloned.
    fn clone_fid(&self, f: &Self::Fid) -> Self::Fid;

    /// Releases a fid's resources.  Never called while another operation
    /// on `f` is in flight, and called exactly once per fid.
    fn clunk(&self, f: &mut Self::Fid);

    /// The qid of the file `f` currently refers to.
    fn qid(&self, f: &Self::Fid) -> Qid;

    /// Builds an open auth fid for the given user and attach name.  The
    /// returned fid's qid must have the QTAUTH bit set.
    async fn auth(&self, uname: &str, aname: &str) -> Result<Self::Fid, Error>;

    /// Builds a root fid for the given user and attach name.  The root
    /// must be a directory.  `auth` holds the auth fid if the client
    /// presented one.
    async fn attach(
        &self,
        auth: Option<&Self::Fid>,
        uname: &str,
        aname: &str,
    ) -> Result<Self::Fid, Error>;

    /// Returns metadata for the file, which may be open or not.  The
    /// runtime overwrites the qid of the result before marshalling it.
    async fn stat(&self, f: &Self::Fid) -> Result<Dir, Error>;

    /// Updates metadata for the file.
    async fn wstat(&self, f: &Self::Fid, dir: &Dir) -> Result<(), Error>;

    /// Moves `f` to the named child of the directory it refers to.  On
    /// error `f` must be left usable; the runtime walks a throwaway clone
    /// so that the client-visible fid survives a failed walk.
    async fn walk(&self, f: &mut Self::Fid, name: &str) -> Result<(), Error>;

    /// Prepares `f` for I/O and returns its iounit, or 0 to accept the
    /// server default.  After a fid is open the runtime only calls
    /// `readdir` (directories), `read_at`/`write_at` (files), `stat`,
    /// `qid` and `clunk` on it.
    async fn open(&self, f: &mut Self::Fid, mode: OpenMode) -> Result<u32, Error>;

    /// Fills `dir` with entries of the open directory `f`, starting
    /// `index` entries in.  Returns the number of entries produced; 0
    /// means end of directory.
    async fn readdir(&self, f: &Self::Fid, dir: &mut [Dir], index: usize) -> Result<usize, Error>;

    /// Reads from the open file `f` at byte offset `off`.  `Ok(0)` on a
    /// non-empty buffer means end of file.
    async fn read_at(&self, f: &Self::Fid, buf: &mut [u8], off: u64) -> Result<usize, Error>;

    /// Writes to the open file `f` at byte offset `off`.
    async fn write_at(&self, f: &Self::Fid, buf: &[u8], off: u64) -> Result<usize, Error>;

    /// Removes the file `f` refers to.  Unlike the protocol's remove,
    /// this does not imply a clunk; the runtime calls `clunk` separately
    /// afterwards.
    async fn remove(&self, f: &mut Self::Fid) -> Result<(), Error>;

    /// Called once when the connection serving this back-end is torn
    /// down, after every live fid has been clunked.
    fn close(&self);
}

/// A back-end that can sit beneath a wrapper filesystem such as
/// [`CloneFsys`](crate::clonefs::CloneFsys).
///
/// Wrappers need to materialise inner roots outside any client-driven
/// attach, carrying wrapper-chosen per-fid data; `attach_inner` is that
/// channel.
#[async_trait]
pub trait FsysInner: Fsys {
    /// The per-fid value a wrapper supplies when materialising an inner
    /// root.
    type AttachContext: Send + 'static;

    /// Builds a root fid associated with the attach context `c`.
    async fn attach_inner(&self, c: Self::AttachContext) -> Result<Self::Fid, Error>;
}
