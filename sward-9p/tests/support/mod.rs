//! A minimal 9P2000 client for exercising the server end to end over an
//! in-memory pipe.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadHalf, WriteHalf};

use sward_9p::fsys::Fsys;
use sward_9p::logger::{Logger, NullLogger};
use sward_9p::server::serve;
use sward_protocol::{
    read_fcall, write_fcall, Dir, Fcall, OpenMode, Qid, NOFID, NOTAG, VERSION_9P2000,
};

#[allow(dead_code)]
pub const MSIZE: u32 = 8 * 1024 + 24;

pub struct Client<S = DuplexStream> {
    rd: ReadHalf<S>,
    wr: WriteHalf<S>,
    next_tag: u16,
}

#[allow(dead_code)]
impl Client<DuplexStream> {
    /// Starts a server task over `fs` and returns a client on the other
    /// end of the pipe, without performing the version handshake.
    pub fn connect<FS: Fsys>(fs: Arc<FS>) -> Client {
        let logger = Arc::new(NullLogger) as Arc<dyn Logger + Send + Sync>;
        let (client_io, server_io) = tokio::io::duplex(1 << 20);
        tokio::spawn(async move {
            let _ = serve(logger, fs, server_io).await;
        });
        Client::from_stream(client_io)
    }

    /// Connects and negotiates 9P2000.
    pub async fn start<FS: Fsys>(fs: Arc<FS>) -> Client {
        let mut c = Self::connect(fs);
        c.handshake().await;
        c
    }
}

#[allow(dead_code)]
impl<S: AsyncRead + AsyncWrite> Client<S> {
    pub fn from_stream(stream: S) -> Client<S> {
        let (rd, wr) = tokio::io::split(stream);
        Client {
            rd,
            wr,
            next_tag: 1,
        }
    }

    pub async fn handshake(&mut self) {
        let reply = self
            .rpc_tag(
                NOTAG,
                Fcall::Tversion {
                    msize: MSIZE,
                    version: VERSION_9P2000.to_owned(),
                },
            )
            .await;
        match reply {
            Fcall::Rversion { version, .. } => assert_eq!(version, VERSION_9P2000),
            other => panic!("unexpected version reply: {:?}", other),
        }
    }

    pub async fn send(&mut self, tag: u16, fc: Fcall) {
        write_fcall(&mut self.wr, tag, &fc).await.unwrap();
    }

    pub async fn recv(&mut self) -> (u16, Fcall) {
        read_fcall(&mut self.rd, MSIZE).await.unwrap()
    }

    /// Tries to read another message, returning None once the server has
    /// closed the connection.
    pub async fn recv_eof(&mut self) -> Option<(u16, Fcall)> {
        read_fcall(&mut self.rd, MSIZE).await.ok()
    }

    pub async fn rpc_tag(&mut self, tag: u16, fc: Fcall) -> Fcall {
        self.send(tag, fc).await;
        let (rtag, reply) = self.recv().await;
        assert_eq!(rtag, tag);
        reply
    }

    /// One request/response exchange with a fresh tag.  An Rerror reply
    /// becomes `Err(ename)`.
    pub async fn rpc(&mut self, fc: Fcall) -> Result<Fcall, String> {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);
        match self.rpc_tag(tag, fc).await {
            Fcall::Rerror { ename } => Err(ename),
            reply => Ok(reply),
        }
    }

    pub async fn attach(&mut self, fid: u32, uname: &str, aname: &str) -> Result<Qid, String> {
        match self
            .rpc(Fcall::Tattach {
                fid,
                afid: NOFID,
                uname: uname.to_owned(),
                aname: aname.to_owned(),
            })
            .await?
        {
            Fcall::Rattach { qid } => Ok(qid),
            other => panic!("unexpected attach reply: {:?}", other),
        }
    }

    pub async fn walk(&mut self, fid: u32, newfid: u32, names: &[&str]) -> Result<Vec<Qid>, String> {
        match self
            .rpc(Fcall::Twalk {
                fid,
                newfid,
                wname: names.iter().map(|s| s.to_string()).collect(),
            })
            .await?
        {
            Fcall::Rwalk { wqid } => Ok(wqid),
            other => panic!("unexpected walk reply: {:?}", other),
        }
    }

    pub async fn open(&mut self, fid: u32, mode: OpenMode) -> Result<(Qid, u32), String> {
        match self
            .rpc(Fcall::Topen {
                fid,
                mode: mode.bits(),
            })
            .await?
        {
            Fcall::Ropen { qid, iounit } => Ok((qid, iounit)),
            other => panic!("unexpected open reply: {:?}", other),
        }
    }

    pub async fn read(&mut self, fid: u32, offset: u64, count: u32) -> Result<Bytes, String> {
        match self.rpc(Fcall::Tread { fid, offset, count }).await? {
            Fcall::Rread { data } => Ok(data),
            other => panic!("unexpected read reply: {:?}", other),
        }
    }

    pub async fn read_all(&mut self, fid: u32) -> Result<Vec<u8>, String> {
        let mut data = Vec::new();
        loop {
            let chunk = self.read(fid, data.len() as u64, 4096).await?;
            if chunk.is_empty() {
                return Ok(data);
            }
            data.extend_from_slice(&chunk);
        }
    }

    pub async fn write(&mut self, fid: u32, offset: u64, data: &[u8]) -> Result<u32, String> {
        match self
            .rpc(Fcall::Twrite {
                fid,
                offset,
                data: Bytes::copy_from_slice(data),
            })
            .await?
        {
            Fcall::Rwrite { count } => Ok(count),
            other => panic!("unexpected write reply: {:?}", other),
        }
    }

    pub async fn clunk(&mut self, fid: u32) -> Result<(), String> {
        match self.rpc(Fcall::Tclunk { fid }).await? {
            Fcall::Rclunk => Ok(()),
            other => panic!("unexpected clunk reply: {:?}", other),
        }
    }

    pub async fn remove(&mut self, fid: u32) -> Result<(), String> {
        match self.rpc(Fcall::Tremove { fid }).await? {
            Fcall::Rremove => Ok(()),
            other => panic!("unexpected remove reply: {:?}", other),
        }
    }

    pub async fn stat(&mut self, fid: u32) -> Result<Dir, String> {
        match self.rpc(Fcall::Tstat { fid }).await? {
            Fcall::Rstat { stat } => Ok(Dir::from_bytes(&stat).unwrap()),
            other => panic!("unexpected stat reply: {:?}", other),
        }
    }

    pub async fn flush(&mut self, oldtag: u16) -> Result<(), String> {
        match self.rpc(Fcall::Tflush { oldtag }).await? {
            Fcall::Rflush => Ok(()),
            other => panic!("unexpected flush reply: {:?}", other),
        }
    }

    /// Reads a whole directory through the offset continuation and
    /// unmarshals the entries.
    pub async fn dirread_all(&mut self, fid: u32) -> Result<Vec<Dir>, String> {
        let mut entries = Vec::new();
        let mut offset = 0u64;
        loop {
            let chunk = self.read(fid, offset, 4096).await?;
            if chunk.is_empty() {
                return Ok(entries);
            }
            offset += chunk.len() as u64;
            let mut rest: &[u8] = &chunk;
            while !rest.is_empty() {
                assert!(rest.len() >= 2, "truncated directory entry");
                let size = u16::from_le_bytes([rest[0], rest[1]]) as usize + 2;
                entries.push(Dir::from_bytes(&rest[..size]).unwrap());
                rest = &rest[size..];
            }
        }
    }

    /// Walks from `fid` to a path and opens the result as `newfid`,
    /// insisting that every element resolves.
    pub async fn open_path(
        &mut self,
        fid: u32,
        newfid: u32,
        names: &[&str],
        mode: OpenMode,
    ) -> Result<(), String> {
        let qids = self.walk(fid, newfid, names).await?;
        assert_eq!(qids.len(), names.len());
        self.open(newfid, mode).await?;
        Ok(())
    }
}
