//! 9P2000 message types and wire codec.
//!
//! This crate defines the messages exchanged on a 9P2000 connection
//! ([`Fcall`]), the file identity and metadata records ([`Qid`], [`Dir`]),
//! and an async framed codec ([`read_fcall`], [`write_fcall`]) for moving
//! them over a byte stream.  It knows nothing about serving files; the
//! server runtime lives in the `sward-9p` crate.

use bitflags::bitflags;

mod fcall;
mod wire;

pub use fcall::{read_fcall, write_fcall, Fcall, FcallType};
pub(crate) use wire::{Deserializer, Serializer};

use std::io;
use std::str::Utf8Error;
use thiserror::Error;

/// Value of a fid field meaning "no fid", e.g. the afid of an
/// unauthenticated Tattach.
pub const NOFID: u32 = 0xffff_ffff;

/// Tag used by version messages, which are not part of any ordinary
/// request/response exchange.
pub const NOTAG: u16 = 0xffff;

/// Maximum number of name elements in a single Twalk.
pub const MAXWELEM: usize = 16;

/// The protocol version string this crate implements.
pub const VERSION_9P2000: &str = "9P2000";

// Qid type bits.
pub const QTDIR: u8 = 0x80;
pub const QTAPPEND: u8 = 0x40;
pub const QTEXCL: u8 = 0x20;
pub const QTAUTH: u8 = 0x08;
pub const QTTMP: u8 = 0x04;
pub const QTFILE: u8 = 0x00;

// Dir.mode bits above the nine permission bits.
pub const DMDIR: u32 = 0x8000_0000;
pub const DMAPPEND: u32 = 0x4000_0000;
pub const DMEXCL: u32 = 0x2000_0000;
pub const DMAUTH: u32 = 0x0800_0000;
pub const DMTMP: u32 = 0x0400_0000;

bitflags! {
    /// Open mode bits carried by Topen.
    ///
    /// The low two bits select the access mode; the remaining bits are
    /// flags.  `OEXEC` occupies both access bits, so use [`OpenMode::access`]
    /// rather than `contains` to inspect the access mode.
    pub struct OpenMode: u8 {
        const OREAD = 0x00;
        const OWRITE = 0x01;
        const ORDWR = 0x02;
        const OEXEC = 0x03;
        const ACCMODE = 0x03;
        const OTRUNC = 0x10;
        const OCEXEC = 0x20;
        const ORCLOSE = 0x40;
    }
}

impl OpenMode {
    /// The access portion of the mode: one of `OREAD`, `OWRITE`, `ORDWR`
    /// or `OEXEC`.
    pub fn access(self) -> OpenMode {
        self & Self::ACCMODE
    }

    /// Whether a fid opened with this mode may be read.
    pub fn readable(self) -> bool {
        match self.access() {
            Self::OREAD | Self::ORDWR | Self::OEXEC => true,
            _ => false,
        }
    }

    /// Whether a fid opened with this mode may be written.
    pub fn writable(self) -> bool {
        match self.access() {
            Self::OWRITE | Self::ORDWR => true,
            _ => false,
        }
    }
}

/// The server's identity for one version of a file.
///
/// Two qids with equal `path` and `qtype` name the same file; a changed
/// `version` indicates changed contents.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Qid {
    pub qtype: u8,
    pub version: u32,
    pub path: u64,
}

impl Qid {
    pub fn is_dir(&self) -> bool {
        self.qtype & QTDIR != 0
    }

    pub fn is_auth(&self) -> bool {
        self.qtype & QTAUTH != 0
    }
}

/// A stat record, as marshalled into Rstat, Twstat and the payload of
/// directory reads.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct Dir {
    pub dtype: u16,
    pub dev: u32,
    pub qid: Qid,
    pub mode: u32,
    pub atime: u32,
    pub mtime: u32,
    pub length: u64,
    pub name: String,
    pub uid: String,
    pub gid: String,
    pub muid: String,
}

impl Dir {
    /// Byte size of the marshalled record, including its leading size
    /// field.
    pub fn size(&self) -> usize {
        2 + 2
            + 4
            + 13
            + 4
            + 4
            + 4
            + 8
            + 2
            + self.name.len()
            + 2
            + self.uid.len()
            + 2
            + self.gid.len()
            + 2
            + self.muid.len()
    }

    /// Appends the marshalled record to `buf`, as one element of a
    /// directory read or the stat payload of Rstat/Twstat.
    pub fn append(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let size: u16 = (self.size() - 2)
            .try_into()
            .map_err(|_| ProtocolError::StringTooLong)?;
        let mut s = Serializer::new();
        s.write_u16(size);
        s.write_u16(self.dtype);
        s.write_u32(self.dev);
        s.write_qid(self.qid);
        s.write_u32(self.mode);
        s.write_u32(self.atime);
        s.write_u32(self.mtime);
        s.write_u64(self.length);
        s.write_string(&self.name)?;
        s.write_string(&self.uid)?;
        s.write_string(&self.gid)?;
        s.write_string(&self.muid)?;
        buf.extend_from_slice(&s.into_inner());
        Ok(())
    }

    /// Marshals the record into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::with_capacity(self.size());
        self.append(&mut buf)?;
        Ok(buf)
    }

    /// Parses one marshalled record.  Trailing bytes after the record are
    /// an error.
    pub fn from_bytes(data: &[u8]) -> Result<Dir, ProtocolError> {
        let mut d = Deserializer::new(data);
        let dir = Self::read(&mut d)?;
        if d.remaining() != 0 {
            return Err(ProtocolError::TrailingData);
        }
        Ok(dir)
    }

    pub(crate) fn read(d: &mut Deserializer<'_>) -> Result<Dir, ProtocolError> {
        let _size = d.read_u16()?;
        Ok(Dir {
            dtype: d.read_u16()?,
            dev: d.read_u32()?,
            qid: d.read_qid()?,
            mode: d.read_u32()?,
            atime: d.read_u32()?,
            mtime: d.read_u32()?,
            length: d.read_u64()?,
            name: d.read_string()?,
            uid: d.read_string()?,
            gid: d.read_string()?,
            muid: d.read_string()?,
        })
    }
}

/// Errors arising while encoding or decoding 9P messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The peer closed the connection between messages.
    #[error("connection closed")]
    Closed,
    #[error("message truncated")]
    Truncated,
    #[error("message has trailing data")]
    TrailingData,
    #[error("invalid message size {0}")]
    BadSize(u32),
    /// The frame was well-formed but its type byte is not a 9P2000
    /// message.  The tag is preserved so a server can answer with Rerror
    /// instead of dropping the connection.
    #[error("unknown message type {typ}")]
    UnknownType { typ: u8, tag: u16 },
    #[error("string not valid UTF-8")]
    BadString(#[from] Utf8Error),
    #[error("string too long to marshal")]
    StringTooLong,
    #[error("too many walk elements")]
    TooManyWalkElements,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}
