//! The per-connection server runtime.
//!
//! [`Server`] reads framed 9P messages from one connected byte stream,
//! dispatches them against an [`Fsys`] back-end, and writes the replies.
//! Each message is handled in its own task so a slow back-end operation
//! never stalls the read loop; a writer mutex keeps individual replies
//! from interleaving on the wire.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock};

use sward_protocol::{
    read_fcall, write_fcall, Dir, Fcall, FcallType, OpenMode, ProtocolError, Qid, NOFID,
    VERSION_9P2000,
};

use crate::fsys::Fsys;
use crate::logger::Logger;
use crate::{error, trace, Error};

/// Iounit used when a back-end's open returns 0.
const DEFAULT_IOUNIT: u32 = 8 * 1024;

/// Fixed overhead of a Tread/Twrite frame, used to bound read buffers
/// against the negotiated msize.
const IOHDRSZ: u32 = 24;

/// The largest message size the server will negotiate or buffer.
const MAX_MSIZE: u32 = 1024 * 1024;

/// Number of directory entries fetched from the back-end per refill.
const DIR_BUF_ENTRIES: usize = 16;

/// Terminal errors from [`Server::run`].  Clean EOF is not an error.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("first message is {0:?}, not Tversion")]
    NoVersion(FcallType),
    #[error("unknown version {0:?}")]
    UnknownVersion(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Copy, Clone)]
struct OpenState {
    mode: OpenMode,
    iounit: u32,
}

struct FidState<F> {
    /// The back-end half of the fid.  None until the operation that
    /// introduced the fid has completed; other operations racing with
    /// that creation fail with "not usable yet".
    backend: Option<F>,
    /// Set by Topen and immutable afterwards.
    open: Option<OpenState>,
}

/// Directory-read continuation state, touched by one reader at a time.
#[derive(Default)]
struct DirReadState {
    /// Total bytes of directory entries returned so far; the only legal
    /// non-zero read offset.
    offset: u64,
    /// Index of the next entry to fetch from the back-end.
    index: usize,
    /// Entries fetched but not yet returned to the client.
    entries: VecDeque<Dir>,
}

struct FidRec<F> {
    id: u32,
    /// One reference for the fid-table slot plus one per in-flight
    /// operation.  The back-end half is clunked when this reaches zero.
    refs: AtomicU32,
    state: RwLock<FidState<F>>,
    dir: AsyncMutex<DirReadState>,
}

/// State shared between the read loop and the spawned handler tasks.
struct Conn<FS: Fsys, W> {
    logger: Arc<dyn Logger + Send + Sync>,
    fs: Arc<FS>,
    wr: AsyncMutex<W>,
    fids: Mutex<HashMap<u32, Arc<FidRec<FS::Fid>>>>,
    /// In-flight requests by tag.  Tflush takes the receiver out and
    /// waits on it for the targeted operation to finish.
    tags: flurry::HashMap<u16, Mutex<Option<mpsc::Receiver<()>>>>,
    msize: AtomicU32,
}

/// Serves 9P2000 on one connection.
///
/// `run` consumes messages until EOF or a terminal error; on return every
/// live fid has been released and the back-end's `close` has run.  Each
/// `Server` owns its connection; serve concurrent connections by creating
/// one per accepted stream (see [`crate::listen`]).
pub struct Server<FS: Fsys, R, W> {
    conn: Arc<Conn<FS, W>>,
    rd: R,
}

/// Splits `stream` and serves it to completion.
pub async fn serve<FS, C>(
    logger: Arc<dyn Logger + Send + Sync>,
    fs: Arc<FS>,
    stream: C,
) -> Result<(), ServeError>
where
    FS: Fsys,
    C: AsyncRead + AsyncWrite + Send + 'static,
{
    let (rd, wr) = tokio::io::split(stream);
    Server::new(logger, fs, rd, wr).run().await
}

impl<FS, R, W> Server<FS, R, W>
where
    FS: Fsys,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(logger: Arc<dyn Logger + Send + Sync>, fs: Arc<FS>, rd: R, wr: W) -> Self {
        Self {
            conn: Arc::new(Conn {
                logger,
                fs,
                wr: AsyncMutex::new(wr),
                fids: Mutex::new(HashMap::new()),
                tags: flurry::HashMap::new(),
                msize: AtomicU32::new(MAX_MSIZE),
            }),
            rd,
        }
    }

    /// Runs the version handshake and then the dispatch loop.  Returns
    /// `Ok(())` when the client closes the connection cleanly.
    pub async fn run(&mut self) -> Result<(), ServeError> {
        trace!(self.conn.logger, "9p: serving connection");
        let result = match self.handshake().await {
            Ok(()) => self.main_loop().await,
            Err(e) => Err(e),
        };
        self.teardown().await;
        trace!(self.conn.logger, "9p: connection done: {:?}", result);
        result
    }

    async fn handshake(&mut self) -> Result<(), ServeError> {
        let max = self.conn.msize.load(Ordering::Relaxed);
        let (tag, fc) = read_fcall(&mut self.rd, max).await?;
        let (msize, version) = match fc {
            Fcall::Tversion { msize, version } => (msize, version),
            other => return Err(ServeError::NoVersion(other.fcall_type())),
        };
        if version != VERSION_9P2000 {
            self.conn
                .send(
                    tag,
                    Fcall::Rversion {
                        msize,
                        version: "unknown".to_owned(),
                    },
                )
                .await;
            return Err(ServeError::UnknownVersion(version));
        }
        let msize = msize.min(MAX_MSIZE);
        self.conn.msize.store(msize, Ordering::Relaxed);
        self.conn.send(tag, Fcall::Rversion { msize, version }).await;
        Ok(())
    }

    async fn main_loop(&mut self) -> Result<(), ServeError> {
        loop {
            let max = self.conn.msize.load(Ordering::Relaxed);
            let (tag, fc) = match read_fcall(&mut self.rd, max).await {
                Ok(m) => m,
                Err(ProtocolError::Closed) => return Ok(()),
                Err(ProtocolError::UnknownType { typ, tag }) => {
                    trace!(self.conn.logger, "9p: unknown message type {}", typ);
                    self.conn.send_error(tag, &Error::BadOperation).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            trace!(self.conn.logger, "9p: <- tag {} {:?}", tag, fc.fcall_type());
            if let Err(e) = self.conn.clone().start(tag, fc) {
                self.conn.send_error(tag, &e).await;
            }
        }
    }

    /// Releases every live fid and closes the back-end.
    async fn teardown(&self) {
        let recs: Vec<_> = {
            let mut fids = self.conn.fids.lock().unwrap();
            fids.drain().map(|(_, rec)| rec).collect()
        };
        for rec in recs {
            let mut st = rec.state.write().await;
            if let Some(mut f) = st.backend.take() {
                self.conn.fs.clunk(&mut f);
            }
        }
        self.conn.fs.close();
    }
}

impl<FS, W> Conn<FS, W>
where
    FS: Fsys,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, tag: u16, fc: Fcall) {
        let mut wr = self.wr.lock().await;
        if let Err(e) = write_fcall(&mut *wr, tag, &fc).await {
            error!(self.logger, "9p: write error on tag {}: {}", tag, e);
        }
    }

    async fn send_error(&self, tag: u16, err: &Error) {
        trace!(self.logger, "9p: tag {} error: {}", tag, err);
        self.send(
            tag,
            Fcall::Rerror {
                ename: err.to_string(),
            },
        )
        .await;
    }

    /// Validates a message's preconditions and spawns its handler task.
    /// An error here is replied from the read loop; once a handler is
    /// spawned, it owns the reply for its tag.
    fn start(self: Arc<Self>, tag: u16, fc: Fcall) -> Result<(), Error> {
        match fc {
            Fcall::Tattach {
                fid,
                afid,
                uname,
                aname,
            } => {
                let auth = if afid != NOFID {
                    Some(self.get_fid(afid)?)
                } else {
                    None
                };
                let newrec = match self.new_fid(fid) {
                    Ok(rec) => rec,
                    Err(e) => {
                        if let Some(a) = &auth {
                            self.drop_ref(a);
                        }
                        return Err(e);
                    }
                };
                let conn = self.clone();
                self.spawn_handler(tag, async move {
                    conn.attach_task(tag, newrec, auth, uname, aname).await;
                });
            }
            Fcall::Tauth { afid, uname, aname } => {
                let newrec = self.new_fid(afid)?;
                let conn = self.clone();
                self.spawn_handler(tag, async move {
                    conn.auth_task(tag, newrec, uname, aname).await;
                });
            }
            Fcall::Tflush { oldtag } => {
                let conn = self.clone();
                self.spawn_handler(tag, async move {
                    conn.flush_task(tag, oldtag).await;
                });
            }
            Fcall::Twalk { fid, newfid, wname } => {
                let src = self.get_fid(fid)?;
                let newrec = if newfid != fid {
                    match self.new_fid(newfid) {
                        Ok(rec) => Some(rec),
                        Err(e) => {
                            self.drop_ref(&src);
                            return Err(e);
                        }
                    }
                } else {
                    None
                };
                let conn = self.clone();
                self.spawn_handler(tag, async move {
                    conn.walk_task(tag, src, newrec, wname).await;
                });
            }
            Fcall::Topen { fid, mode } => {
                let rec = self.get_fid(fid)?;
                let conn = self.clone();
                self.spawn_handler(tag, async move {
                    conn.open_task(tag, rec, mode).await;
                });
            }
            Fcall::Tread { fid, offset, count } => {
                let rec = self.get_fid(fid)?;
                let conn = self.clone();
                self.spawn_handler(tag, async move {
                    conn.read_task(tag, rec, offset, count).await;
                });
            }
            Fcall::Twrite { fid, offset, data } => {
                let rec = self.get_fid(fid)?;
                let conn = self.clone();
                self.spawn_handler(tag, async move {
                    conn.write_task(tag, rec, offset, data).await;
                });
            }
            Fcall::Tclunk { fid } => {
                let rec = self.get_fid(fid)?;
                let conn = self.clone();
                self.spawn_handler(tag, async move {
                    conn.clunk_task(tag, rec).await;
                });
            }
            Fcall::Tremove { fid } => {
                let rec = self.get_fid(fid)?;
                let conn = self.clone();
                self.spawn_handler(tag, async move {
                    conn.remove_task(tag, rec).await;
                });
            }
            Fcall::Tstat { fid } => {
                let rec = self.get_fid(fid)?;
                let conn = self.clone();
                self.spawn_handler(tag, async move {
                    conn.stat_task(tag, rec).await;
                });
            }
            Fcall::Twstat { fid, stat } => {
                let rec = self.get_fid(fid)?;
                let conn = self.clone();
                self.spawn_handler(tag, async move {
                    conn.wstat_task(tag, rec, stat).await;
                });
            }
            Fcall::Tversion { .. } => return Err(Error::msg("unexpected Tversion")),
            _ => return Err(Error::BadOperation),
        }
        Ok(())
    }

    /// Registers the tag and runs `fut` in its own task.  Dropping the
    /// completion sender when the task finishes wakes any Tflush waiting
    /// on this tag.
    fn spawn_handler(self: Arc<Self>, tag: u16, fut: impl Future<Output = ()> + Send + 'static) {
        let (tx, rx) = mpsc::channel::<()>(1);
        {
            let guard = self.tags.guard();
            self.tags.insert(tag, Mutex::new(Some(rx)), &guard);
        }
        tokio::spawn(async move {
            fut.await;
            let guard = self.tags.guard();
            self.tags.remove(&tag, &guard);
            drop(tx);
        });
    }

    // Fid bookkeeping.  Table membership only changes under the table
    // lock, and a fid can only be acquired while it is still a member, so
    // the reference count cannot hit zero while an acquisition is
    // possible.

    fn get_fid(&self, id: u32) -> Result<Arc<FidRec<FS::Fid>>, Error> {
        let fids = self.fids.lock().unwrap();
        let rec = fids.get(&id).ok_or(Error::FidNotFound(id))?;
        rec.refs.fetch_add(1, Ordering::AcqRel);
        Ok(rec.clone())
    }

    /// Creates an unattached fid record with references held by the table
    /// slot and by the creating operation.
    fn new_fid(&self, id: u32) -> Result<Arc<FidRec<FS::Fid>>, Error> {
        let mut fids = self.fids.lock().unwrap();
        if fids.contains_key(&id) {
            return Err(Error::FidInUse(id));
        }
        let rec = Arc::new(FidRec {
            id,
            refs: AtomicU32::new(2),
            state: RwLock::new(FidState {
                backend: None,
                open: None,
            }),
            dir: AsyncMutex::new(DirReadState::default()),
        });
        fids.insert(id, rec.clone());
        Ok(rec)
    }

    /// Removes the fid from the table, dropping the slot's reference.
    fn del_fid(&self, rec: &Arc<FidRec<FS::Fid>>) {
        let removed = {
            let mut fids = self.fids.lock().unwrap();
            match fids.get(&rec.id) {
                Some(cur) if Arc::ptr_eq(cur, rec) => {
                    fids.remove(&rec.id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.drop_ref(rec);
        }
    }

    /// Releases one reference.  The caller must not hold the fid's state
    /// lock: the final release clunks the back-end half.
    fn drop_ref(&self, rec: &Arc<FidRec<FS::Fid>>) {
        if rec.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        // No table slot and no operation references the fid, so the
        // state lock is uncontended.
        if let Ok(mut st) = rec.state.try_write() {
            if let Some(mut f) = st.backend.take() {
                self.fs.clunk(&mut f);
            }
        }
    }

    // Handler tasks.  Each owns the reply for its tag and releases its
    // fid references before returning.

    async fn attach_task(
        &self,
        tag: u16,
        newrec: Arc<FidRec<FS::Fid>>,
        auth: Option<Arc<FidRec<FS::Fid>>>,
        uname: String,
        aname: String,
    ) {
        let result = async {
            let auth_guard = match &auth {
                Some(a) => Some(a.state.read().await),
                None => None,
            };
            let auth_backend = match (&auth, auth_guard.as_ref()) {
                (Some(a), Some(g)) => {
                    Some(g.backend.as_ref().ok_or(Error::FidNotAttached(a.id))?)
                }
                _ => None,
            };
            let mut f = self.fs.attach(auth_backend, &uname, &aname).await?;
            let qid = self.fs.qid(&f);
            if !qid.is_dir() {
                self.fs.clunk(&mut f);
                return Err(Error::RootNotDir);
            }
            let mut st = newrec.state.write().await;
            st.backend = Some(f);
            Ok(qid)
        }
        .await;
        match result {
            Ok(qid) => self.send(tag, Fcall::Rattach { qid }).await,
            Err(e) => {
                self.del_fid(&newrec);
                self.send_error(tag, &e).await;
            }
        }
        self.drop_ref(&newrec);
        if let Some(a) = &auth {
            self.drop_ref(a);
        }
    }

    async fn auth_task(&self, tag: u16, newrec: Arc<FidRec<FS::Fid>>, uname: String, aname: String) {
        let result = async {
            let f = self.fs.auth(&uname, &aname).await?;
            let aqid = self.fs.qid(&f);
            let mut st = newrec.state.write().await;
            st.backend = Some(f);
            Ok(aqid)
        }
        .await;
        match result {
            Ok(aqid) => self.send(tag, Fcall::Rauth { aqid }).await,
            Err(e) => {
                self.del_fid(&newrec);
                self.send_error(tag, &e).await;
            }
        }
        self.drop_ref(&newrec);
    }

    async fn flush_task(&self, tag: u16, oldtag: u16) {
        let rx = if oldtag == tag {
            None
        } else {
            let guard = self.tags.guard();
            match self.tags.get(&oldtag, &guard) {
                Some(slot) => slot.lock().unwrap().take(),
                None => None,
            }
        };
        if let Some(mut rx) = rx {
            // Wait for the targeted operation to send its reply.
            // TODO cancel the operation instead of waiting it out, and
            // suppress its reply.
            let _ = rx.recv().await;
        }
        self.send(tag, Fcall::Rflush).await;
    }

    async fn walk_task(
        &self,
        tag: u16,
        src: Arc<FidRec<FS::Fid>>,
        newrec: Option<Arc<FidRec<FS::Fid>>>,
        wname: Vec<String>,
    ) {
        let result = match &newrec {
            Some(newrec) => self.walk_new(&src, newrec, &wname).await,
            None => self.walk_inplace(&src, &wname).await,
        };
        match result {
            Ok(wqid) => self.send(tag, Fcall::Rwalk { wqid }).await,
            Err(e) => self.send_error(tag, &e).await,
        }
        self.drop_ref(&src);
        if let Some(newrec) = &newrec {
            self.drop_ref(newrec);
        }
    }

    /// Walk introducing a new fid: the source is held shared, and the new
    /// fid only becomes usable if every name succeeds.
    async fn walk_new(
        &self,
        src: &Arc<FidRec<FS::Fid>>,
        newrec: &Arc<FidRec<FS::Fid>>,
        wname: &[String],
    ) -> Result<Vec<Qid>, Error> {
        let st = src.state.read().await;
        if st.open.is_some() {
            self.del_fid(newrec);
            return Err(Error::FidOpen);
        }
        let f = match st.backend.as_ref() {
            Some(f) => f,
            None => {
                self.del_fid(newrec);
                return Err(Error::FidNotAttached(src.id));
            }
        };
        let mut working = self.fs.clone_fid(f);
        let (qids, err) = self.walk_names(&mut working, wname).await;
        if qids.len() < wname.len() {
            self.fs.clunk(&mut working);
            self.del_fid(newrec);
            if qids.is_empty() {
                return Err(err.unwrap_or(Error::NotFound));
            }
            return Ok(qids);
        }
        let mut nst = newrec.state.write().await;
        nst.backend = Some(working);
        Ok(qids)
    }

    /// Walk reusing the source fid: held exclusively, and only moved once
    /// every name has succeeded, so a failed walk leaves it untouched.
    async fn walk_inplace(
        &self,
        src: &Arc<FidRec<FS::Fid>>,
        wname: &[String],
    ) -> Result<Vec<Qid>, Error> {
        let mut st = src.state.write().await;
        if st.open.is_some() {
            return Err(Error::FidOpen);
        }
        let f = st.backend.as_ref().ok_or(Error::FidNotAttached(src.id))?;
        let mut working = self.fs.clone_fid(f);
        let (qids, err) = self.walk_names(&mut working, wname).await;
        if qids.len() < wname.len() {
            self.fs.clunk(&mut working);
            if qids.is_empty() {
                return Err(err.unwrap_or(Error::NotFound));
            }
            return Ok(qids);
        }
        if let Some(mut old) = st.backend.replace(working) {
            self.fs.clunk(&mut old);
        }
        Ok(qids)
    }

    /// Walks one name at a time, returning the qids of the names that
    /// succeeded and the error that stopped the walk, if any.
    async fn walk_names(
        &self,
        working: &mut FS::Fid,
        names: &[String],
    ) -> (Vec<Qid>, Option<Error>) {
        let mut qids = Vec::with_capacity(names.len());
        for name in names {
            if let Err(e) = self.fs.walk(working, name).await {
                return (qids, Some(e));
            }
            qids.push(self.fs.qid(working));
        }
        (qids, None)
    }

    async fn open_task(&self, tag: u16, rec: Arc<FidRec<FS::Fid>>, mode: u8) {
        let result = async {
            let mut st = rec.state.write().await;
            if st.open.is_some() {
                return Err(Error::FidAlreadyOpen);
            }
            let f = st.backend.as_mut().ok_or(Error::FidNotAttached(rec.id))?;
            let mode = OpenMode::from_bits(mode).ok_or(Error::BadOpenMode)?;
            if self.fs.qid(f).is_dir() && mode.access() != OpenMode::OREAD {
                return Err(Error::Perm);
            }
            let mut iounit = self.fs.open(f, mode).await?;
            if iounit == 0 {
                iounit = DEFAULT_IOUNIT;
            }
            let qid = self.fs.qid(f);
            st.open = Some(OpenState { mode, iounit });
            Ok((qid, iounit))
        }
        .await;
        match result {
            Ok((qid, iounit)) => self.send(tag, Fcall::Ropen { qid, iounit }).await,
            Err(e) => self.send_error(tag, &e).await,
        }
        self.drop_ref(&rec);
    }

    async fn read_task(&self, tag: u16, rec: Arc<FidRec<FS::Fid>>, offset: u64, count: u32) {
        let result = async {
            let st = rec.state.read().await;
            let f = st.backend.as_ref().ok_or(Error::FidNotAttached(rec.id))?;
            let open = st.open.ok_or(Error::FidNotOpen)?;
            if !open.mode.readable() {
                return Err(Error::Perm);
            }
            if offset > i64::MAX as u64 || offset.checked_add(count as u64).is_none() {
                return Err(Error::BadOffset);
            }
            if self.fs.qid(f).is_dir() {
                let mut dir = rec.dir.lock().await;
                return self.read_dir(f, &mut dir, offset, count, open.iounit).await;
            }
            let msize = self.msize.load(Ordering::Relaxed);
            let limit = count.min(open.iounit).min(msize.saturating_sub(IOHDRSZ));
            let mut buf = vec![0u8; limit as usize];
            let n = self.fs.read_at(f, &mut buf, offset).await?;
            buf.truncate(n);
            Ok(buf.into())
        }
        .await;
        match result {
            Ok(data) => self.send(tag, Fcall::Rread { data }).await,
            Err(e) => self.send_error(tag, &e).await,
        }
        self.drop_ref(&rec);
    }

    /// Drives the directory-read continuation.  The client must read a
    /// directory sequentially: offset 0 restarts, the previous end offset
    /// continues, anything else is an error.
    async fn read_dir(
        &self,
        f: &FS::Fid,
        dir: &mut DirReadState,
        offset: u64,
        count: u32,
        iounit: u32,
    ) -> Result<bytes::Bytes, Error> {
        if offset == 0 {
            dir.offset = 0;
            dir.index = 0;
            dir.entries.clear();
        } else if offset != dir.offset {
            return Err(Error::BadDirOffset {
                got: offset,
                want: dir.offset,
            });
        }
        let limit = count.min(iounit) as usize;
        let mut buf = Vec::with_capacity(limit);
        loop {
            if dir.entries.is_empty() {
                let mut entries = vec![Dir::default(); DIR_BUF_ENTRIES];
                let n = self.fs.readdir(f, &mut entries, dir.index).await?;
                if n == 0 {
                    break;
                }
                entries.truncate(n);
                dir.entries.extend(entries);
            }
            let entry = dir.entries.front().unwrap();
            let old_len = buf.len();
            entry
                .append(&mut buf)
                .map_err(|e| Error::msg(format!("cannot marshal Dir: {}", e)))?;
            if buf.len() > limit {
                if old_len == 0 {
                    return Err(Error::DirCountTooSmall);
                }
                buf.truncate(old_len);
                break;
            }
            dir.entries.pop_front();
            dir.index += 1;
            if buf.len() == limit {
                break;
            }
        }
        dir.offset += buf.len() as u64;
        Ok(buf.into())
    }

    async fn write_task(&self, tag: u16, rec: Arc<FidRec<FS::Fid>>, offset: u64, data: bytes::Bytes) {
        let result = async {
            let st = rec.state.read().await;
            let f = st.backend.as_ref().ok_or(Error::FidNotAttached(rec.id))?;
            let open = st.open.ok_or(Error::FidNotOpen)?;
            if !open.mode.writable() {
                return Err(Error::Perm);
            }
            if self.fs.qid(f).is_dir() {
                return Err(Error::Perm);
            }
            if offset > i64::MAX as u64 || offset.checked_add(data.len() as u64).is_none() {
                return Err(Error::BadOffset);
            }
            let n = self.fs.write_at(f, &data, offset).await?;
            Ok(n as u32)
        }
        .await;
        match result {
            Ok(count) => self.send(tag, Fcall::Rwrite { count }).await,
            Err(e) => self.send_error(tag, &e).await,
        }
        self.drop_ref(&rec);
    }

    async fn clunk_task(&self, tag: u16, rec: Arc<FidRec<FS::Fid>>) {
        {
            // Exclusive access: in-flight operations on the fid finish
            // before it leaves the table.
            let _st = rec.state.write().await;
            self.del_fid(&rec);
        }
        self.drop_ref(&rec);
        self.send(tag, Fcall::Rclunk).await;
    }

    async fn remove_task(&self, tag: u16, rec: Arc<FidRec<FS::Fid>>) {
        // Remove clunks the fid whether or not the removal succeeds; a
        // failure is still reported as an error reply.
        let result = {
            let mut st = rec.state.write().await;
            let result = match st.backend.as_mut() {
                Some(f) => self.fs.remove(f).await,
                None => Err(Error::FidNotAttached(rec.id)),
            };
            self.del_fid(&rec);
            result
        };
        self.drop_ref(&rec);
        match result {
            Ok(()) => self.send(tag, Fcall::Rremove).await,
            Err(e) => self.send_error(tag, &e).await,
        }
    }

    async fn stat_task(&self, tag: u16, rec: Arc<FidRec<FS::Fid>>) {
        let result = async {
            let st = rec.state.read().await;
            let f = st.backend.as_ref().ok_or(Error::FidNotAttached(rec.id))?;
            let mut dir = self.fs.stat(f).await?;
            dir.qid = self.fs.qid(f);
            dir.to_bytes()
                .map_err(|e| Error::msg(format!("cannot marshal Dir: {}", e)))
        }
        .await;
        match result {
            Ok(stat) => self.send(tag, Fcall::Rstat { stat }).await,
            Err(e) => self.send_error(tag, &e).await,
        }
        self.drop_ref(&rec);
    }

    async fn wstat_task(&self, tag: u16, rec: Arc<FidRec<FS::Fid>>, stat: Vec<u8>) {
        let result = async {
            let dir = Dir::from_bytes(&stat)
                .map_err(|e| Error::msg(format!("cannot unmarshal Dir: {}", e)))?;
            let st = rec.state.read().await;
            let f = st.backend.as_ref().ok_or(Error::FidNotAttached(rec.id))?;
            self.fs.wstat(f, &dir).await
        }
        .await;
        match result {
            Ok(()) => self.send(tag, Fcall::Rwstat).await,
            Err(e) => self.send_error(tag, &e).await,
        }
        self.drop_ref(&rec);
    }
}
