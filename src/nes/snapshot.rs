// magic "L8SS" | version u8 | kind u8 | payload length u32 LE | payload | SHA-1(payload)
// Payload fields are untagged; any layout change bumps SNAPSHOT_VERSION.

use sha1::{Digest, Sha1};
use thiserror::Error;

pub const SNAPSHOT_MAGIC: [u8; 4] = *b"L8SS";
pub const SNAPSHOT_VERSION: u8 = 1;

const HEADER_LEN: usize = 4 + 1 + 1 + 4;
const DIGEST_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SectionKind {
    Ppu = 1,
    Console = 2,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("snapshot does not start with the L8SS magic")]
    BadMagic,
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u8),
    #[error("snapshot section kind {found} where {expected} was expected")]
    WrongSection { expected: u8, found: u8 },
    #[error("snapshot truncated at offset {offset}: {needed} more bytes required")]
    Truncated { offset: usize, needed: usize },
    #[error("snapshot payload checksum mismatch")]
    ChecksumMismatch,
    #[error("invalid value {value:#X} for snapshot field `{field}`")]
    InvalidField { field: &'static str, value: u64 },
    #[error("{0} trailing bytes after snapshot payload")]
    TrailingBytes(usize),
}

#[derive(Debug, Default)]
pub struct SnapshotWriter {
    buf: Vec<u8>,
}

impl SnapshotWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_blob(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn seal(self, kind: SectionKind) -> Vec<u8> {
        let payload = self.buf;
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + DIGEST_LEN);
        out.extend_from_slice(&SNAPSHOT_MAGIC);
        out.push(SNAPSHOT_VERSION);
        out.push(kind as u8);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&payload);
        out.extend_from_slice(&Sha1::digest(&payload));
        out
    }
}

#[derive(Debug)]
pub struct SnapshotReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SnapshotReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn open(bytes: &'a [u8], kind: SectionKind) -> Result<Self, SnapshotError> {
        let mut header = SnapshotReader::new(bytes);
        let magic = header.take(SNAPSHOT_MAGIC.len())?;
        if magic != SNAPSHOT_MAGIC {
            return Err(SnapshotError::BadMagic);
        }
        let version = header.get_u8()?;
        if version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }
        let found = header.get_u8()?;
        if found != kind as u8 {
            return Err(SnapshotError::WrongSection {
                expected: kind as u8,
                found,
            });
        }
        let len = header.get_u32()? as usize;
        let payload = header.take(len)?;
        let digest = header.take(DIGEST_LEN)?;
        if header.remaining() != 0 {
            return Err(SnapshotError::TrailingBytes(header.remaining()));
        }
        if Sha1::digest(payload).as_slice() != digest {
            return Err(SnapshotError::ChecksumMismatch);
        }
        Ok(SnapshotReader::new(payload))
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SnapshotError> {
        if self.remaining() < n {
            return Err(SnapshotError::Truncated {
                offset: self.pos,
                needed: n - self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8, SnapshotError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_bool(&mut self, field: &'static str) -> Result<bool, SnapshotError> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(SnapshotError::InvalidField {
                field,
                value: other as u64,
            }),
        }
    }

    pub fn get_u16(&mut self) -> Result<u16, SnapshotError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32, SnapshotError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    pub fn get_u64(&mut self) -> Result<u64, SnapshotError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn get_u8_max(&mut self, field: &'static str, max: u8) -> Result<u8, SnapshotError> {
        let value = self.get_u8()?;
        check_max(field, value as u64, max as u64)?;
        Ok(value)
    }

    pub fn get_u16_max(&mut self, field: &'static str, max: u16) -> Result<u16, SnapshotError> {
        let value = self.get_u16()?;
        check_max(field, value as u64, max as u64)?;
        Ok(value)
    }

    pub fn get_array<const N: usize>(&mut self) -> Result<[u8; N], SnapshotError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_blob(&mut self) -> Result<&'a [u8], SnapshotError> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }

    pub fn get_blob_exact(&mut self, field: &'static str, len: usize) -> Result<&'a [u8], SnapshotError> {
        let blob = self.get_blob()?;
        if blob.len() != len {
            return Err(SnapshotError::InvalidField {
                field,
                value: blob.len() as u64,
            });
        }
        Ok(blob)
    }

    pub fn finish(self) -> Result<(), SnapshotError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(SnapshotError::TrailingBytes(n)),
        }
    }
}

fn check_max(field: &'static str, value: u64, max: u64) -> Result<(), SnapshotError> {
    if value > max {
        Err(SnapshotError::InvalidField { field, value })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed_sample() -> Vec<u8> {
        let mut w = SnapshotWriter::new();
        w.put_u16(0x1234);
        w.put_bool(true);
        w.put_blob(&[9, 8, 7]);
        w.seal(SectionKind::Ppu)
    }

    #[test]
    fn open_reads_fields_in_write_order() {
        let bytes = sealed_sample();
        let mut r = SnapshotReader::open(&bytes, SectionKind::Ppu).unwrap();
        assert_eq!(r.get_u16().unwrap(), 0x1234);
        assert!(r.get_bool("flag").unwrap());
        assert_eq!(r.get_blob().unwrap(), &[9, 8, 7]);
        r.finish().unwrap();
    }

    #[test]
    fn open_rejects_wrong_magic_version_and_section() {
        let mut bytes = sealed_sample();
        bytes[0] = b'X';
        assert_eq!(
            SnapshotReader::open(&bytes, SectionKind::Ppu).unwrap_err(),
            SnapshotError::BadMagic
        );

        let mut bytes = sealed_sample();
        bytes[4] = 9;
        assert_eq!(
            SnapshotReader::open(&bytes, SectionKind::Ppu).unwrap_err(),
            SnapshotError::UnsupportedVersion(9)
        );

        let bytes = sealed_sample();
        assert!(matches!(
            SnapshotReader::open(&bytes, SectionKind::Console),
            Err(SnapshotError::WrongSection { expected: 2, found: 1 })
        ));
    }

    #[test]
    fn open_detects_truncation_and_corruption() {
        let bytes = sealed_sample();
        let cut = &bytes[..bytes.len() - 3];
        assert!(matches!(
            SnapshotReader::open(cut, SectionKind::Ppu),
            Err(SnapshotError::Truncated { .. })
        ));

        let mut flipped = sealed_sample();
        flipped[HEADER_LEN] ^= 0xFF;
        assert_eq!(
            SnapshotReader::open(&flipped, SectionKind::Ppu).unwrap_err(),
            SnapshotError::ChecksumMismatch
        );

        let mut extended = sealed_sample();
        extended.push(0);
        assert_eq!(
            SnapshotReader::open(&extended, SectionKind::Ppu).unwrap_err(),
            SnapshotError::TrailingBytes(1)
        );
    }

    #[test]
    fn bounded_getters_reject_out_of_range_values() {
        let mut r = SnapshotReader::new(&[2, 0x00, 0x80]);
        assert!(matches!(
            r.get_bool("toggle"),
            Err(SnapshotError::InvalidField { field: "toggle", value: 2 })
        ));
        assert!(matches!(
            r.get_u16_max("v", 0x7FFF),
            Err(SnapshotError::InvalidField { field: "v", value: 0x8000 })
        ));
    }
}
