use bytes::Bytes;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Deserializer, ProtocolError, Qid, Serializer, MAXWELEM};

/// Message type bytes of the 9P2000 protocol.
///
/// 106 would be Terror, which is illegal and never sent.
#[derive(FromPrimitive, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum FcallType {
    Tversion = 100,
    Rversion = 101,
    Tauth = 102,
    Rauth = 103,
    Tattach = 104,
    Rattach = 105,
    Rerror = 107,
    Tflush = 108,
    Rflush = 109,
    Twalk = 110,
    Rwalk = 111,
    Topen = 112,
    Ropen = 113,
    Tcreate = 114,
    Rcreate = 115,
    Tread = 116,
    Rread = 117,
    Twrite = 118,
    Rwrite = 119,
    Tclunk = 120,
    Rclunk = 121,
    Tremove = 122,
    Rremove = 123,
    Tstat = 124,
    Rstat = 125,
    Twstat = 126,
    Rwstat = 127,
}

/// One 9P2000 message body.  The tag travels separately in the frame
/// header; see [`read_fcall`] and [`write_fcall`].
///
/// Stat payloads (`Rstat.stat`, `Twstat.stat`) hold a marshalled [`Dir`]
/// record, produced with [`Dir::append`] and parsed with
/// [`Dir::from_bytes`].
///
/// [`Dir`]: crate::Dir
/// [`Dir::append`]: crate::Dir::append
/// [`Dir::from_bytes`]: crate::Dir::from_bytes
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Fcall {
    Tversion { msize: u32, version: String },
    Rversion { msize: u32, version: String },
    Tauth { afid: u32, uname: String, aname: String },
    Rauth { aqid: Qid },
    Tattach { fid: u32, afid: u32, uname: String, aname: String },
    Rattach { qid: Qid },
    Rerror { ename: String },
    Tflush { oldtag: u16 },
    Rflush,
    Twalk { fid: u32, newfid: u32, wname: Vec<String> },
    Rwalk { wqid: Vec<Qid> },
    Topen { fid: u32, mode: u8 },
    Ropen { qid: Qid, iounit: u32 },
    Tcreate { fid: u32, name: String, perm: u32, mode: u8 },
    Rcreate { qid: Qid, iounit: u32 },
    Tread { fid: u32, offset: u64, count: u32 },
    Rread { data: Bytes },
    Twrite { fid: u32, offset: u64, data: Bytes },
    Rwrite { count: u32 },
    Tclunk { fid: u32 },
    Rclunk,
    Tremove { fid: u32 },
    Rremove,
    Tstat { fid: u32 },
    Rstat { stat: Vec<u8> },
    Twstat { fid: u32, stat: Vec<u8> },
    Rwstat,
}

impl Fcall {
    pub fn fcall_type(&self) -> FcallType {
        match self {
            Fcall::Tversion { .. } => FcallType::Tversion,
            Fcall::Rversion { .. } => FcallType::Rversion,
            Fcall::Tauth { .. } => FcallType::Tauth,
            Fcall::Rauth { .. } => FcallType::Rauth,
            Fcall::Tattach { .. } => FcallType::Tattach,
            Fcall::Rattach { .. } => FcallType::Rattach,
            Fcall::Rerror { .. } => FcallType::Rerror,
            Fcall::Tflush { .. } => FcallType::Tflush,
            Fcall::Rflush => FcallType::Rflush,
            Fcall::Twalk { .. } => FcallType::Twalk,
            Fcall::Rwalk { .. } => FcallType::Rwalk,
            Fcall::Topen { .. } => FcallType::Topen,
            Fcall::Ropen { .. } => FcallType::Ropen,
            Fcall::Tcreate { .. } => FcallType::Tcreate,
            Fcall::Rcreate { .. } => FcallType::Rcreate,
            Fcall::Tread { .. } => FcallType::Tread,
            Fcall::Rread { .. } => FcallType::Rread,
            Fcall::Twrite { .. } => FcallType::Twrite,
            Fcall::Rwrite { .. } => FcallType::Rwrite,
            Fcall::Tclunk { .. } => FcallType::Tclunk,
            Fcall::Rclunk => FcallType::Rclunk,
            Fcall::Tremove { .. } => FcallType::Tremove,
            Fcall::Rremove => FcallType::Rremove,
            Fcall::Tstat { .. } => FcallType::Tstat,
            Fcall::Rstat { .. } => FcallType::Rstat,
            Fcall::Twstat { .. } => FcallType::Twstat,
            Fcall::Rwstat => FcallType::Rwstat,
        }
    }

    fn encode(&self, s: &mut Serializer) -> Result<(), ProtocolError> {
        match self {
            Fcall::Tversion { msize, version } | Fcall::Rversion { msize, version } => {
                s.write_u32(*msize);
                s.write_string(version)?;
            }
            Fcall::Tauth { afid, uname, aname } => {
                s.write_u32(*afid);
                s.write_string(uname)?;
                s.write_string(aname)?;
            }
            Fcall::Rauth { aqid } => s.write_qid(*aqid),
            Fcall::Tattach {
                fid,
                afid,
                uname,
                aname,
            } => {
                s.write_u32(*fid);
                s.write_u32(*afid);
                s.write_string(uname)?;
                s.write_string(aname)?;
            }
            Fcall::Rattach { qid } => s.write_qid(*qid),
            Fcall::Rerror { ename } => s.write_string(ename)?,
            Fcall::Tflush { oldtag } => s.write_u16(*oldtag),
            Fcall::Rflush | Fcall::Rclunk | Fcall::Rremove | Fcall::Rwstat => {}
            Fcall::Twalk { fid, newfid, wname } => {
                if wname.len() > MAXWELEM {
                    return Err(ProtocolError::TooManyWalkElements);
                }
                s.write_u32(*fid);
                s.write_u32(*newfid);
                s.write_u16(wname.len() as u16);
                for name in wname {
                    s.write_string(name)?;
                }
            }
            Fcall::Rwalk { wqid } => {
                if wqid.len() > MAXWELEM {
                    return Err(ProtocolError::TooManyWalkElements);
                }
                s.write_u16(wqid.len() as u16);
                for qid in wqid {
                    s.write_qid(*qid);
                }
            }
            Fcall::Topen { fid, mode } => {
                s.write_u32(*fid);
                s.write_u8(*mode);
            }
            Fcall::Ropen { qid, iounit } | Fcall::Rcreate { qid, iounit } => {
                s.write_qid(*qid);
                s.write_u32(*iounit);
            }
            Fcall::Tcreate {
                fid,
                name,
                perm,
                mode,
            } => {
                s.write_u32(*fid);
                s.write_string(name)?;
                s.write_u32(*perm);
                s.write_u8(*mode);
            }
            Fcall::Tread { fid, offset, count } => {
                s.write_u32(*fid);
                s.write_u64(*offset);
                s.write_u32(*count);
            }
            Fcall::Rread { data } => {
                s.write_u32(data.len() as u32);
                s.write_data(data);
            }
            Fcall::Twrite { fid, offset, data } => {
                s.write_u32(*fid);
                s.write_u64(*offset);
                s.write_u32(data.len() as u32);
                s.write_data(data);
            }
            Fcall::Rwrite { count } => s.write_u32(*count),
            Fcall::Tclunk { fid } | Fcall::Tremove { fid } | Fcall::Tstat { fid } => {
                s.write_u32(*fid)
            }
            Fcall::Rstat { stat } => s.write_blob(stat)?,
            Fcall::Twstat { fid, stat } => {
                s.write_u32(*fid);
                s.write_blob(stat)?;
            }
        }
        Ok(())
    }

    fn decode(typ: FcallType, d: &mut Deserializer<'_>) -> Result<Fcall, ProtocolError> {
        let fc = match typ {
            FcallType::Tversion => Fcall::Tversion {
                msize: d.read_u32()?,
                version: d.read_string()?,
            },
            FcallType::Rversion => Fcall::Rversion {
                msize: d.read_u32()?,
                version: d.read_string()?,
            },
            FcallType::Tauth => Fcall::Tauth {
                afid: d.read_u32()?,
                uname: d.read_string()?,
                aname: d.read_string()?,
            },
            FcallType::Rauth => Fcall::Rauth {
                aqid: d.read_qid()?,
            },
            FcallType::Tattach => Fcall::Tattach {
                fid: d.read_u32()?,
                afid: d.read_u32()?,
                uname: d.read_string()?,
                aname: d.read_string()?,
            },
            FcallType::Rattach => Fcall::Rattach {
                qid: d.read_qid()?,
            },
            FcallType::Rerror => Fcall::Rerror {
                ename: d.read_string()?,
            },
            FcallType::Tflush => Fcall::Tflush {
                oldtag: d.read_u16()?,
            },
            FcallType::Rflush => Fcall::Rflush,
            FcallType::Twalk => {
                let fid = d.read_u32()?;
                let newfid = d.read_u32()?;
                let n = d.read_u16()? as usize;
                if n > MAXWELEM {
                    return Err(ProtocolError::TooManyWalkElements);
                }
                let mut wname = Vec::with_capacity(n);
                for _ in 0..n {
                    wname.push(d.read_string()?);
                }
                Fcall::Twalk { fid, newfid, wname }
            }
            FcallType::Rwalk => {
                let n = d.read_u16()? as usize;
                if n > MAXWELEM {
                    return Err(ProtocolError::TooManyWalkElements);
                }
                let mut wqid = Vec::with_capacity(n);
                for _ in 0..n {
                    wqid.push(d.read_qid()?);
                }
                Fcall::Rwalk { wqid }
            }
            FcallType::Topen => Fcall::Topen {
                fid: d.read_u32()?,
                mode: d.read_u8()?,
            },
            FcallType::Ropen => Fcall::Ropen {
                qid: d.read_qid()?,
                iounit: d.read_u32()?,
            },
            FcallType::Tcreate => Fcall::Tcreate {
                fid: d.read_u32()?,
                name: d.read_string()?,
                perm: d.read_u32()?,
                mode: d.read_u8()?,
            },
            FcallType::Rcreate => Fcall::Rcreate {
                qid: d.read_qid()?,
                iounit: d.read_u32()?,
            },
            FcallType::Tread => Fcall::Tread {
                fid: d.read_u32()?,
                offset: d.read_u64()?,
                count: d.read_u32()?,
            },
            FcallType::Rread => {
                let n = d.read_u32()? as usize;
                Fcall::Rread {
                    data: Bytes::copy_from_slice(d.read_data(n)?),
                }
            }
            FcallType::Twrite => {
                let fid = d.read_u32()?;
                let offset = d.read_u64()?;
                let n = d.read_u32()? as usize;
                Fcall::Twrite {
                    fid,
                    offset,
                    data: Bytes::copy_from_slice(d.read_data(n)?),
                }
            }
            FcallType::Rwrite => Fcall::Rwrite {
                count: d.read_u32()?,
            },
            FcallType::Tclunk => Fcall::Tclunk {
                fid: d.read_u32()?,
            },
            FcallType::Rclunk => Fcall::Rclunk,
            FcallType::Tremove => Fcall::Tremove {
                fid: d.read_u32()?,
            },
            FcallType::Rremove => Fcall::Rremove,
            FcallType::Tstat => Fcall::Tstat {
                fid: d.read_u32()?,
            },
            FcallType::Rstat => Fcall::Rstat {
                stat: d.read_blob()?.to_vec(),
            },
            FcallType::Twstat => {
                let fid = d.read_u32()?;
                Fcall::Twstat {
                    fid,
                    stat: d.read_blob()?.to_vec(),
                }
            }
            FcallType::Rwstat => Fcall::Rwstat,
        };
        if d.remaining() != 0 {
            return Err(ProtocolError::TrailingData);
        }
        Ok(fc)
    }
}

const HEADER_SIZE: u32 = 4 + 1 + 2;

/// Reads one framed message, returning its tag and body.
///
/// Frames larger than `max_size` are rejected without reading the body.
/// A connection that closes cleanly between messages yields
/// [`ProtocolError::Closed`]; closing mid-frame is [`ProtocolError::Truncated`].
pub async fn read_fcall<R: AsyncRead + Unpin>(
    r: &mut R,
    max_size: u32,
) -> Result<(u16, Fcall), ProtocolError> {
    let mut sizebuf = [0u8; 4];
    let mut n = 0;
    while n < sizebuf.len() {
        match r.read(&mut sizebuf[n..]).await? {
            0 if n == 0 => return Err(ProtocolError::Closed),
            0 => return Err(ProtocolError::Truncated),
            k => n += k,
        }
    }
    let size = u32::from_le_bytes(sizebuf);
    if size < HEADER_SIZE || size > max_size {
        return Err(ProtocolError::BadSize(size));
    }
    let mut rest = vec![0u8; size as usize - 4];
    r.read_exact(&mut rest).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::Truncated
        } else {
            ProtocolError::Io(e)
        }
    })?;
    let tag = u16::from_le_bytes([rest[1], rest[2]]);
    let typ = FcallType::from_u8(rest[0]).ok_or(ProtocolError::UnknownType { typ: rest[0], tag })?;
    Fcall::decode(typ, &mut Deserializer::new(&rest[3..])).map(|fc| (tag, fc))
}

/// Writes one framed message.
pub async fn write_fcall<W: AsyncWrite + Unpin>(
    w: &mut W,
    tag: u16,
    fc: &Fcall,
) -> Result<(), ProtocolError> {
    let mut s = Serializer::new();
    s.write_u32(0);
    s.write_u8(fc.fcall_type() as u8);
    s.write_u16(tag);
    fc.encode(&mut s)?;
    let mut frame = s.into_inner();
    let size = frame.len() as u32;
    frame[..4].copy_from_slice(&size.to_le_bytes());
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}
