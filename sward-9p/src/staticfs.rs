//! A back-end serving a directory tree declared in memory.
//!
//! The tree shape is fixed at construction; what varies per client is
//! carried in two type parameters.  `C` is the content value stored in
//! each file entry, and `A` is a per-attach context computed when a
//! client attaches (or injected by a wrapper through
//! [`FsysInner::attach_inner`]).  Opening a file runs a caller-supplied
//! callback that sees both and produces the [`File`] handle that serves
//! the actual I/O.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use sward_protocol::{Dir, OpenMode, Qid, DMDIR, QTDIR, QTFILE};

use crate::fsys::{Fsys, FsysInner};
use crate::Error;

pub mod file;

pub use file::{open_bytes, open_string, Buffer, File};

/// One node of the declarative tree handed to [`StaticFsys::new`].
pub enum Entry<C> {
    File { content: C, executable: bool },
    Dir { entries: BTreeMap<String, Entry<C>> },
}

impl<C> Entry<C> {
    pub fn file(content: impl Into<C>) -> Self {
        Entry::File {
            content: content.into(),
            executable: false,
        }
    }

    pub fn exec_file(content: impl Into<C>) -> Self {
        Entry::File {
            content: content.into(),
            executable: true,
        }
    }

    pub fn dir<N, I>(entries: I) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = (N, Entry<C>)>,
    {
        Entry::Dir {
            entries: entries
                .into_iter()
                .map(|(name, entry)| (name.into(), entry))
                .collect(),
        }
    }
}

/// Opens a file entry for I/O.  Only invoked for files, never for
/// directories.
pub type Opener<A, C> =
    Box<dyn Fn(&StaticFid<A, C>) -> Result<Box<dyn File>, Error> + Send + Sync>;

/// Builds the attach context for a client-driven attach from the uname
/// and aname of the Tattach message.
pub type ContextForAttach<A> = Box<dyn Fn(&str, &str) -> Result<A, Error> + Send + Sync>;

/// Configuration for [`StaticFsys::new`].
pub struct Params<A, C> {
    /// The root directory's entries.
    pub root: BTreeMap<String, Entry<C>>,
    /// Called when a file entry is opened.
    pub opener: Opener<A, C>,
    /// Builds the per-attach context.  When absent, client-driven
    /// attaches fail and only wrapper-driven attaches (which carry their
    /// own context) succeed.
    pub context_for_attach: Option<ContextForAttach<A>>,
    /// User and group reported for every entry; "noone" when unset.
    pub uid: Option<String>,
    pub gid: Option<String>,
}

enum NodeKind<C> {
    File { content: C, executable: bool },
    Dir { children: Vec<Arc<Node<C>>> },
}

struct Node<C> {
    qid: Qid,
    name: String,
    kind: NodeKind<C>,
}

impl<C> Node<C> {
    fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Dir { .. })
    }

    fn is_executable(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::File {
                executable: true,
                ..
            }
        )
    }
}

/// Builds the served form of the tree, assigning each entry a distinct
/// qid path.  The parent is numbered before its children, children in
/// name order, so the root always gets path 1.
fn build_node<C>(
    name: &str,
    entry: Entry<C>,
    dir: &str,
    next_path: &mut u64,
) -> Result<Arc<Node<C>>, Error> {
    if name.contains('/') {
        return Err(Error::msg(format!(
            "file name {:?} in directory {:?} isn't valid",
            name, dir
        )));
    }
    let path = *next_path;
    *next_path += 1;
    let kind = match entry {
        Entry::File {
            content,
            executable,
        } => NodeKind::File {
            content,
            executable,
        },
        Entry::Dir { entries } => {
            let child_dir = if dir.is_empty() {
                name.to_owned()
            } else {
                format!("{}/{}", dir, name)
            };
            let mut children = Vec::with_capacity(entries.len());
            for (child_name, child) in entries {
                children.push(build_node(&child_name, child, &child_dir, next_path)?);
            }
            NodeKind::Dir { children }
        }
    };
    let qtype = if matches!(kind, NodeKind::Dir { .. }) {
        QTDIR
    } else {
        QTFILE
    };
    Ok(Arc::new(Node {
        qid: Qid {
            qtype,
            version: 0,
            path,
        },
        name: name.to_owned(),
        kind,
    }))
}

/// A fid served by [`StaticFsys`]: the entry it points at, the open
/// [`File`] handle if any, and the context of the attach it descends
/// from.
pub struct StaticFid<A, C> {
    node: Arc<Node<C>>,
    file: Option<Box<dyn File>>,
    context: A,
}

impl<A, C> StaticFid<A, C> {
    /// The content of the file entry this fid points at.
    ///
    /// Panics on a directory; openers are only invoked for files.
    pub fn content(&self) -> &C {
        match &self.node.kind {
            NodeKind::File { content, .. } => content,
            NodeKind::Dir { .. } => panic!("content of a directory"),
        }
    }

    /// The attach context this fid descends from.
    pub fn context(&self) -> &A {
        &self.context
    }

    pub fn qid(&self) -> Qid {
        self.node.qid
    }
}

/// Serves a statically defined directory tree.
///
/// The tree itself is immutable; writability, where wanted, lives in the
/// [`File`] handles the opener returns (see [`Buffer`]).
pub struct StaticFsys<A, C> {
    root: Arc<Node<C>>,
    opener: Opener<A, C>,
    context_for_attach: Option<ContextForAttach<A>>,
    uid: String,
    gid: String,
}

impl<A, C> StaticFsys<A, C>
where
    A: Clone + Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    pub fn new(p: Params<A, C>) -> Result<Self, Error> {
        let mut next_path = 1;
        let root = build_node(".", Entry::Dir { entries: p.root }, "", &mut next_path)
            .map_err(|e| Error::msg(format!("bad file tree: {}", e)))?;
        Ok(Self {
            root,
            opener: p.opener,
            context_for_attach: p.context_for_attach,
            uid: p.uid.unwrap_or_else(|| "noone".to_owned()),
            gid: p.gid.unwrap_or_else(|| "noone".to_owned()),
        })
    }

    fn make_dir(&self, node: &Node<C>) -> Dir {
        let mut mode = 0o444;
        if node.is_executable() || node.is_dir() {
            mode |= 0o111;
        }
        if node.is_dir() {
            mode |= DMDIR;
        }
        Dir {
            qid: node.qid,
            mode,
            name: node.name.clone(),
            uid: self.uid.clone(),
            gid: self.gid.clone(),
            ..Dir::default()
        }
    }

    fn new_fid(&self, context: A) -> StaticFid<A, C> {
        StaticFid {
            node: self.root.clone(),
            file: None,
            context,
        }
    }
}

#[async_trait]
impl<A, C> Fsys for StaticFsys<A, C>
where
    A: Clone + Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    type Fid = StaticFid<A, C>;

    fn clone_fid(&self, f: &Self::Fid) -> Self::Fid {
        StaticFid {
            node: f.node.clone(),
            file: None,
            context: f.context.clone(),
        }
    }

    fn clunk(&self, f: &mut Self::Fid) {
        if let Some(mut file) = f.file.take() {
            file.close();
        }
    }

    fn qid(&self, f: &Self::Fid) -> Qid {
        f.node.qid
    }

    async fn auth(&self, _uname: &str, _aname: &str) -> Result<Self::Fid, Error> {
        Err(Error::NotImplemented)
    }

    async fn attach(
        &self,
        _auth: Option<&Self::Fid>,
        uname: &str,
        aname: &str,
    ) -> Result<Self::Fid, Error> {
        let make = self
            .context_for_attach
            .as_ref()
            .ok_or_else(|| Error::msg("cannot attach: no attach context builder provided"))?;
        Ok(self.new_fid(make(uname, aname)?))
    }

    async fn stat(&self, f: &Self::Fid) -> Result<Dir, Error> {
        Ok(self.make_dir(&f.node))
    }

    async fn wstat(&self, _f: &Self::Fid, _dir: &Dir) -> Result<(), Error> {
        Err(Error::Perm)
    }

    async fn walk(&self, f: &mut Self::Fid, name: &str) -> Result<(), Error> {
        // No parent links are kept, so `..` is a miss like any other
        // unknown name.
        let child = match &f.node.kind {
            NodeKind::Dir { children } => {
                children.iter().find(|c| c.name == name).cloned()
            }
            NodeKind::File { .. } => None,
        };
        match child {
            Some(child) => {
                f.node = child;
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    async fn open(&self, f: &mut Self::Fid, _mode: OpenMode) -> Result<u32, Error> {
        if f.node.is_dir() {
            return Ok(0);
        }
        let file = (self.opener)(f)?;
        f.file = Some(file);
        Ok(0)
    }

    async fn readdir(&self, f: &Self::Fid, dir: &mut [Dir], index: usize) -> Result<usize, Error> {
        let children = match &f.node.kind {
            NodeKind::Dir { children } => children,
            NodeKind::File { .. } => return Err(Error::msg("not a directory")),
        };
        let mut n = 0;
        for child in children.iter().skip(index) {
            if n >= dir.len() {
                break;
            }
            dir[n] = self.make_dir(child);
            n += 1;
        }
        Ok(n)
    }

    async fn read_at(&self, f: &Self::Fid, buf: &mut [u8], off: u64) -> Result<usize, Error> {
        match &f.file {
            Some(file) => file.read_at(buf, off),
            None => Err(Error::FidNotOpen),
        }
    }

    async fn write_at(&self, f: &Self::Fid, buf: &[u8], off: u64) -> Result<usize, Error> {
        match &f.file {
            Some(file) => file.write_at(buf, off),
            None => Err(Error::FidNotOpen),
        }
    }

    async fn remove(&self, _f: &mut Self::Fid) -> Result<(), Error> {
        Err(Error::Perm)
    }

    fn close(&self) {}
}

#[async_trait]
impl<A, C> FsysInner for StaticFsys<A, C>
where
    A: Clone + Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    type AttachContext = A;

    async fn attach_inner(&self, c: A) -> Result<Self::Fid, Error> {
        Ok(self.new_fid(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_fsys() -> StaticFsys<(), String> {
        StaticFsys::new(Params {
            root: BTreeMap::from([
                ("foo".to_owned(), Entry::<String>::file("bar".to_owned())),
                (
                    "info".to_owned(),
                    Entry::dir([
                        ("other".to_owned(), Entry::file("other content".to_owned())),
                        ("version".to_owned(), Entry::file("something new".to_owned())),
                    ]),
                ),
            ]),
            opener: Box::new(|f| Ok(open_string(f.content().clone()))),
            context_for_attach: Some(Box::new(|_, _| Ok(()))),
            uid: None,
            gid: None,
        })
        .unwrap()
    }

    fn collect_paths<C>(node: &Arc<Node<C>>, paths: &mut Vec<u64>) {
        paths.push(node.qid.path);
        if let NodeKind::Dir { children } = &node.kind {
            for child in children {
                collect_paths(child, paths);
            }
        }
    }

    #[test]
    fn qid_paths_are_distinct_and_ordered() {
        let fs = demo_fsys();
        let mut paths = Vec::new();
        collect_paths(&fs.root, &mut paths);
        // Root first, then depth-first in name order.
        assert_eq!(paths, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn rejects_slash_in_name() {
        let result = StaticFsys::<(), String>::new(Params {
            root: BTreeMap::from([("a/b".to_owned(), Entry::file("x".to_owned()))]),
            opener: Box::new(|f| Ok(open_string(f.content().clone()))),
            context_for_attach: None,
            uid: None,
            gid: None,
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn walk_and_modes() {
        let fs = demo_fsys();
        let mut f = fs.attach(None, "rog", "").await.unwrap();
        assert!(fs.qid(&f).is_dir());
        fs.walk(&mut f, "info").await.unwrap();
        let dir = fs.stat(&f).await.unwrap();
        assert_eq!(dir.mode, DMDIR | 0o555);
        assert_eq!(dir.uid, "noone");
        fs.walk(&mut f, "version").await.unwrap();
        let dir = fs.stat(&f).await.unwrap();
        assert_eq!(dir.mode, 0o444);
        assert_eq!(dir.qid.path, 5);
        assert!(matches!(
            fs.walk(&mut f, "anything").await,
            Err(Error::NotFound)
        ));
    }

    #[tokio::test]
    async fn dotdot_is_not_found() {
        let fs = demo_fsys();
        let mut f = fs.attach(None, "rog", "").await.unwrap();
        fs.walk(&mut f, "info").await.unwrap();
        assert!(matches!(fs.walk(&mut f, "..").await, Err(Error::NotFound)));
    }
}
