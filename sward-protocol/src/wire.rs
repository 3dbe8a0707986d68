use crate::{ProtocolError, Qid};

/// Little-endian writer for message bodies.
pub(crate) struct Serializer {
    data: Vec<u8>,
}

impl Serializer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    pub fn write_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_qid(&mut self, q: Qid) {
        self.write_u8(q.qtype);
        self.write_u32(q.version);
        self.write_u64(q.path);
    }

    pub fn write_string(&mut self, s: &str) -> Result<(), ProtocolError> {
        let len: u16 = s
            .len()
            .try_into()
            .map_err(|_| ProtocolError::StringTooLong)?;
        self.write_u16(len);
        self.data.extend_from_slice(s.as_bytes());
        Ok(())
    }

    /// Writes a two-byte count followed by the bytes, the wire form of a
    /// stat payload.
    pub fn write_blob(&mut self, b: &[u8]) -> Result<(), ProtocolError> {
        let len: u16 = b
            .len()
            .try_into()
            .map_err(|_| ProtocolError::StringTooLong)?;
        self.write_u16(len);
        self.data.extend_from_slice(b);
        Ok(())
    }

    pub fn write_data(&mut self, b: &[u8]) {
        self.data.extend_from_slice(b);
    }
}

/// Little-endian reader over a message body.
pub(crate) struct Deserializer<'a> {
    data: &'a [u8],
    off: usize,
}

impl<'a> Deserializer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, off: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.off
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::Truncated);
        }
        let b = &self.data[self.off..self.off + n];
        self.off += n;
        Ok(b)
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_qid(&mut self) -> Result<Qid, ProtocolError> {
        Ok(Qid {
            qtype: self.read_u8()?,
            version: self.read_u32()?,
            path: self.read_u64()?,
        })
    }

    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_u16()? as usize;
        let b = self.take(len)?;
        Ok(std::str::from_utf8(b)?.to_owned())
    }

    /// Reads a two-byte count followed by that many bytes.
    pub fn read_blob(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.read_u16()? as usize;
        self.take(len)
    }

    pub fn read_data(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        self.take(len)
    }
}
