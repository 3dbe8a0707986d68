//! A wrapper back-end that multiplexes numbered copies of an inner tree.
//!
//! The wrapper's root is a synthetic directory whose entries are decimal
//! ids, one per subtree reported by a [`Provider`].  Walking into an id
//! attaches the inner back-end with a provider-supplied context, so each
//! numbered subtree sees its own per-attach state.  Wrappers nest: the
//! inner back-end may itself be a [`CloneFsys`].

use std::sync::Arc;

use async_trait::async_trait;

use sward_protocol::{Dir, OpenMode, Qid, DMDIR, QTDIR};

use crate::fsys::{Fsys, FsysInner};
use crate::Error;

/// Supplies the set of numbered subtrees.
///
/// Ids are stable over time.  `get` returns the inner attach context for
/// an id, or `None` when that id has vanished; vanished ids are skipped
/// in directory listings and fail walks.
pub trait Provider<T>: Send + Sync {
    /// One past the largest id that may currently exist.
    fn len(&self) -> usize;
    fn get(&self, id: usize) -> Option<T>;
}

/// Bits of qid path space the wrapper takes for its kind tag; enough to
/// encode the three fid kinds.
const KIND_BITS: u32 = 2;

const KIND_ROOT: u64 = 0;
const KIND_DIR: u64 = 1;
const KIND_REST: u64 = 2;

fn shift_qid(q: Qid, kind: u64) -> Qid {
    Qid {
        qtype: q.qtype,
        version: q.version,
        path: (q.path << KIND_BITS) | kind,
    }
}

/// A fid served by [`CloneFsys`].
pub enum CloneFid<F, P> {
    /// The wrapper's synthetic root.
    Root { provider: Arc<P> },
    /// Positioned within an inner subtree.  `id` is set while the fid
    /// sits at a numbered directory itself and cleared once it walks
    /// deeper.
    Sub { id: Option<usize>, inner: F },
}

/// Wraps `FS` so that its tree appears once per provider id, as numbered
/// subdirectories of a synthetic root.
///
/// The provider is built per attach from the outer attach context `C`,
/// which is how a nested wrapper learns which copy of *it* is being
/// entered.  A client-driven attach uses `C::default()`.
///
/// Inner qid paths are shifted left by two bits to make room for the
/// wrapper's kind tag; with 64-bit paths this allows roughly thirty
/// levels of nesting before an inner back-end's paths are truncated.
pub struct CloneFsys<FS: FsysInner, C, P> {
    inner: Arc<FS>,
    make_provider: Box<dyn Fn(C) -> P + Send + Sync>,
}

impl<FS, C, P> CloneFsys<FS, C, P>
where
    FS: FsysInner,
    C: Default + Send + Sync + 'static,
    P: Provider<FS::AttachContext> + 'static,
{
    pub fn new(inner: Arc<FS>, make_provider: impl Fn(C) -> P + Send + Sync + 'static) -> Self {
        Self {
            inner,
            make_provider: Box::new(make_provider),
        }
    }

    fn root_fid(&self, c: C) -> CloneFid<FS::Fid, P> {
        CloneFid::Root {
            provider: Arc::new((self.make_provider)(c)),
        }
    }

    /// The directory entry for one numbered subtree, derived from the
    /// inner root so that listed qids agree with walked qids.
    async fn subtree_entry(&self, id: usize, c: FS::AttachContext) -> Result<Dir, Error> {
        let mut inner = self.inner.attach_inner(c).await?;
        let mut dir = self.inner.stat(&inner).await?;
        dir.qid = shift_qid(self.inner.qid(&inner), KIND_DIR);
        dir.name = id.to_string();
        self.inner.clunk(&mut inner);
        Ok(dir)
    }
}

/// Parses a canonical decimal id: digits only, no leading zeros.
fn parse_clone_id(name: &str) -> Option<usize> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if name.len() > 1 && name.starts_with('0') {
        return None;
    }
    name.parse().ok()
}

#[async_trait]
impl<FS, C, P> Fsys for CloneFsys<FS, C, P>
where
    FS: FsysInner,
    C: Default + Send + Sync + 'static,
    P: Provider<FS::AttachContext> + 'static,
{
    type Fid = CloneFid<FS::Fid, P>;

    fn clone_fid(&self, f: &Self::Fid) -> Self::Fid {
        match f {
            CloneFid::Root { provider } => CloneFid::Root {
                provider: provider.clone(),
            },
            CloneFid::Sub { id, inner } => CloneFid::Sub {
                id: *id,
                inner: self.inner.clone_fid(inner),
            },
        }
    }

    fn clunk(&self, f: &mut Self::Fid) {
        match f {
            CloneFid::Root { .. } => {}
            CloneFid::Sub { inner, .. } => self.inner.clunk(inner),
        }
    }

    fn qid(&self, f: &Self::Fid) -> Qid {
        match f {
            CloneFid::Root { .. } => Qid {
                qtype: QTDIR,
                version: 0,
                path: KIND_ROOT,
            },
            CloneFid::Sub { id: Some(_), inner } => {
                shift_qid(self.inner.qid(inner), KIND_DIR)
            }
            CloneFid::Sub { id: None, inner } => shift_qid(self.inner.qid(inner), KIND_REST),
        }
    }

    async fn auth(&self, _uname: &str, _aname: &str) -> Result<Self::Fid, Error> {
        Err(Error::NotImplemented)
    }

    async fn attach(
        &self,
        _auth: Option<&Self::Fid>,
        _uname: &str,
        _aname: &str,
    ) -> Result<Self::Fid, Error> {
        Ok(self.root_fid(C::default()))
    }

    async fn stat(&self, f: &Self::Fid) -> Result<Dir, Error> {
        match f {
            CloneFid::Root { .. } => Ok(Dir {
                qid: self.qid(f),
                mode: DMDIR | 0o555,
                name: ".".to_owned(),
                uid: "noone".to_owned(),
                gid: "noone".to_owned(),
                ..Dir::default()
            }),
            CloneFid::Sub {
                id: Some(id),
                inner,
            } => {
                let mut dir = self.inner.stat(inner).await?;
                dir.qid = shift_qid(dir.qid, KIND_DIR);
                dir.name = id.to_string();
                Ok(dir)
            }
            CloneFid::Sub { id: None, inner } => {
                let mut dir = self.inner.stat(inner).await?;
                dir.qid = shift_qid(dir.qid, KIND_REST);
                Ok(dir)
            }
        }
    }

    async fn wstat(&self, f: &Self::Fid, dir: &Dir) -> Result<(), Error> {
        match f {
            CloneFid::Root { .. } => Err(Error::Perm),
            CloneFid::Sub { inner, .. } => self.inner.wstat(inner, dir).await,
        }
    }

    async fn walk(&self, f: &mut Self::Fid, name: &str) -> Result<(), Error> {
        match f {
            CloneFid::Root { provider } => {
                // The wrapper keeps no parent chain, so `..` is a miss
                // here like everywhere else.
                let id = parse_clone_id(name).ok_or(Error::NotFound)?;
                if id >= provider.len() {
                    return Err(Error::NotFound);
                }
                let c = provider.get(id).ok_or(Error::NotFound)?;
                let inner = self.inner.attach_inner(c).await?;
                *f = CloneFid::Sub {
                    id: Some(id),
                    inner,
                };
                Ok(())
            }
            CloneFid::Sub { id, inner } => {
                self.inner.walk(inner, name).await?;
                *id = None;
                Ok(())
            }
        }
    }

    async fn open(&self, f: &mut Self::Fid, mode: OpenMode) -> Result<u32, Error> {
        match f {
            CloneFid::Root { .. } => Ok(0),
            CloneFid::Sub { inner, .. } => self.inner.open(inner, mode).await,
        }
    }

    async fn readdir(&self, f: &Self::Fid, dir: &mut [Dir], index: usize) -> Result<usize, Error> {
        match f {
            CloneFid::Root { provider } => {
                // `index` counts entries already listed, not ids: with
                // vanished ids skipped, the two drift apart, so count
                // live ids from the start.
                let mut n = 0;
                let mut live = 0;
                for id in 0..provider.len() {
                    if n >= dir.len() {
                        break;
                    }
                    if let Some(c) = provider.get(id) {
                        if live >= index {
                            dir[n] = self.subtree_entry(id, c).await?;
                            n += 1;
                        }
                        live += 1;
                    }
                }
                Ok(n)
            }
            CloneFid::Sub { inner, .. } => {
                let n = self.inner.readdir(inner, dir, index).await?;
                for entry in dir[..n].iter_mut() {
                    entry.qid = shift_qid(entry.qid, KIND_REST);
                }
                Ok(n)
            }
        }
    }

    async fn read_at(&self, f: &Self::Fid, buf: &mut [u8], off: u64) -> Result<usize, Error> {
        match f {
            CloneFid::Root { .. } => Err(Error::Perm),
            CloneFid::Sub { inner, .. } => self.inner.read_at(inner, buf, off).await,
        }
    }

    async fn write_at(&self, f: &Self::Fid, buf: &[u8], off: u64) -> Result<usize, Error> {
        match f {
            CloneFid::Root { .. } => Err(Error::Perm),
            CloneFid::Sub { inner, .. } => self.inner.write_at(inner, buf, off).await,
        }
    }

    async fn remove(&self, f: &mut Self::Fid) -> Result<(), Error> {
        match f {
            CloneFid::Root { .. } => Err(Error::Perm),
            CloneFid::Sub { inner, .. } => self.inner.remove(inner).await,
        }
    }

    fn close(&self) {
        self.inner.close();
    }
}

#[async_trait]
impl<FS, C, P> FsysInner for CloneFsys<FS, C, P>
where
    FS: FsysInner,
    C: Default + Send + Sync + 'static,
    P: Provider<FS::AttachContext> + 'static,
{
    type AttachContext = C;

    async fn attach_inner(&self, c: C) -> Result<Self::Fid, Error> {
        Ok(self.root_fid(c))
    }
}
