//! Backup archive file format
//!
//! Little-endian throughout. A file is one header followed by any number of
//! body blocks:
//!
//! ```text
//! header:
//!   0       4   magic
//!   4       2   version
//!   6      40   api commit id    (ASCII, NUL-padded)
//!   46     40   server commit id (ASCII, NUL-padded)
//!   86      1   obj_name_len
//!   87      L   obj_name
//!   87+L    8   timestamp_ms
//!   95+L    1   vg_id
//!   96+L    4   file_seq
//! block:
//!   1 byte      block_type (1..=3)
//!   4 bytes     msg_len
//!   2 bytes     msg_type
//!   msg_len     payload
//!   4 bytes     CRC-32 of payload
//! ```
//!
//! Readers verify magic, version, block type and payload CRC and reject any
//! mismatch with `DataCorruption`.

use std::io::{self, Read, Write};

use crate::status::{Error, ErrorCode, Result};

/// First four bytes of every archive: `"TAOSZ"` truncated to the four-byte
/// on-disk field, kept as-is for compatibility with existing readers.
pub const ARCHIVE_MAGIC: [u8; 4] = *b"TAOS";

/// Header version, stored literally as octal 10 (decimal 8).
pub const ARCHIVE_VERSION: u16 = 0o10;

/// Width of each commit-id field.
pub const COMMIT_ID_LEN: usize = 40;

/// Longest object name the one-byte length prefix can carry.
pub const OBJ_NAME_MAX: usize = 255;

/// Smallest valid body block type.
pub const BLOCK_TYPE_MIN: u8 = 1;

/// Largest valid body block type.
pub const BLOCK_TYPE_MAX: u8 = 3;

/// Upper bound on a single payload; larger length fields are treated as
/// corruption rather than honored as allocations.
const MAX_MSG_LEN: u32 = 1 << 30;

/// Archive header fields.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ArchiveHeader {
    /// Backup-tool commit id, at most 40 ASCII bytes.
    pub api_commit_id: String,
    /// Server commit id, at most 40 ASCII bytes.
    pub server_commit_id: String,
    /// Name of the backed-up object, at most 255 bytes.
    pub obj_name: String,
    /// Creation time, milliseconds since the epoch.
    pub timestamp_ms: i64,
    /// Vgroup id of the source.
    pub vg_id: i8,
    /// Sequence number of this file within the backup.
    pub file_seq: u32,
}

impl ArchiveHeader {
    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        4 + 2 + COMMIT_ID_LEN * 2 + 1 + self.obj_name.len() + 8 + 1 + 4
    }

    /// Write the header.
    ///
    /// Fails with `InvalidParam` if a commit id exceeds 40 bytes or the
    /// object name exceeds 255 bytes.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        if self.api_commit_id.len() > COMMIT_ID_LEN || self.server_commit_id.len() > COMMIT_ID_LEN
        {
            return Err(Error::new(
                ErrorCode::InvalidParam,
                format!("commit id longer than {COMMIT_ID_LEN} bytes"),
            ));
        }
        if self.obj_name.len() > OBJ_NAME_MAX {
            return Err(Error::new(
                ErrorCode::InvalidParam,
                format!("object name longer than {OBJ_NAME_MAX} bytes"),
            ));
        }
        w.write_all(&ARCHIVE_MAGIC)?;
        w.write_all(&ARCHIVE_VERSION.to_le_bytes())?;
        w.write_all(&padded::<{ COMMIT_ID_LEN }>(self.api_commit_id.as_bytes()))?;
        w.write_all(&padded::<{ COMMIT_ID_LEN }>(self.server_commit_id.as_bytes()))?;
        w.write_all(&[self.obj_name.len() as u8])?;
        w.write_all(self.obj_name.as_bytes())?;
        w.write_all(&self.timestamp_ms.to_le_bytes())?;
        w.write_all(&(self.vg_id as u8).to_le_bytes())?;
        w.write_all(&self.file_seq.to_le_bytes())?;
        Ok(())
    }

    /// Read and validate a header.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        read_field(r, &mut magic)?;
        if magic != ARCHIVE_MAGIC {
            return Err(Error::new(ErrorCode::DataCorruption, "archive magic mismatch"));
        }
        let mut version = [0u8; 2];
        read_field(r, &mut version)?;
        let version = u16::from_le_bytes(version);
        if version != ARCHIVE_VERSION {
            return Err(Error::new(
                ErrorCode::DataCorruption,
                format!("unsupported archive version {version}"),
            ));
        }
        let mut api_commit = [0u8; COMMIT_ID_LEN];
        read_field(r, &mut api_commit)?;
        let mut server_commit = [0u8; COMMIT_ID_LEN];
        read_field(r, &mut server_commit)?;
        let mut name_len = [0u8; 1];
        read_field(r, &mut name_len)?;
        let mut name = vec![0u8; name_len[0] as usize];
        read_field(r, &mut name)?;
        let mut timestamp = [0u8; 8];
        read_field(r, &mut timestamp)?;
        let mut vg_id = [0u8; 1];
        read_field(r, &mut vg_id)?;
        let mut file_seq = [0u8; 4];
        read_field(r, &mut file_seq)?;

        Ok(Self {
            api_commit_id: unpad(&api_commit),
            server_commit_id: unpad(&server_commit),
            obj_name: String::from_utf8_lossy(&name).into_owned(),
            timestamp_ms: i64::from_le_bytes(timestamp),
            vg_id: vg_id[0] as i8,
            file_seq: u32::from_le_bytes(file_seq),
        })
    }
}

/// One body block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveBlock {
    /// Block type, 1 to 3.
    pub block_type: u8,
    /// Message type of the payload.
    pub msg_type: u16,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl ArchiveBlock {
    /// Create a block, validating the type.
    pub fn new(block_type: u8, msg_type: u16, payload: Vec<u8>) -> Result<Self> {
        if !(BLOCK_TYPE_MIN..=BLOCK_TYPE_MAX).contains(&block_type) {
            return Err(Error::new(
                ErrorCode::InvalidParam,
                format!("block type {block_type} outside 1..=3"),
            ));
        }
        Ok(Self {
            block_type,
            msg_type,
            payload,
        })
    }

    fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&[self.block_type])?;
        w.write_all(&(self.payload.len() as u32).to_le_bytes())?;
        w.write_all(&self.msg_type.to_le_bytes())?;
        w.write_all(&self.payload)?;
        w.write_all(&crc32fast::hash(&self.payload).to_le_bytes())?;
        Ok(())
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        1 + 4 + 2 + self.payload.len() + 4
    }

    fn read_from<R: Read>(r: &mut R) -> Result<Option<Self>> {
        let mut block_type = [0u8; 1];
        // A clean end of file before the next block is the normal
        // termination of the body.
        match r.read_exact(&mut block_type) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let block_type = block_type[0];
        if !(BLOCK_TYPE_MIN..=BLOCK_TYPE_MAX).contains(&block_type) {
            return Err(Error::new(
                ErrorCode::DataCorruption,
                format!("block type {block_type} outside 1..=3"),
            ));
        }
        let mut msg_len = [0u8; 4];
        read_field(r, &mut msg_len)?;
        let msg_len = u32::from_le_bytes(msg_len);
        if msg_len > MAX_MSG_LEN {
            return Err(Error::new(
                ErrorCode::DataCorruption,
                format!("implausible payload length {msg_len}"),
            ));
        }
        let mut msg_type = [0u8; 2];
        read_field(r, &mut msg_type)?;
        let mut payload = vec![0u8; msg_len as usize];
        read_field(r, &mut payload)?;
        let mut stored_crc = [0u8; 4];
        read_field(r, &mut stored_crc)?;
        let stored_crc = u32::from_le_bytes(stored_crc);
        if crc32fast::hash(&payload) != stored_crc {
            return Err(Error::new(
                ErrorCode::DataCorruption,
                "body block checksum mismatch",
            ));
        }
        Ok(Some(Self {
            block_type,
            msg_type: u16::from_le_bytes(msg_type),
            payload,
        }))
    }
}

/// Sequential archive writer.
pub struct ArchiveWriter<W: Write> {
    inner: W,
    bytes_written: u64,
    header_written: bool,
}

impl<W: Write> ArchiveWriter<W> {
    /// Wrap a sink.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            bytes_written: 0,
            header_written: false,
        }
    }

    /// Write the file header. Must be called exactly once, first.
    pub fn write_header(&mut self, header: &ArchiveHeader) -> Result<()> {
        if self.header_written {
            return Err(Error::new(ErrorCode::InvalidParam, "header already written"));
        }
        header.write_to(&mut self.inner)?;
        self.header_written = true;
        self.bytes_written += header.encoded_len() as u64;
        Ok(())
    }

    /// Append a body block.
    pub fn write_block(&mut self, block: &ArchiveBlock) -> Result<()> {
        if !self.header_written {
            return Err(Error::new(
                ErrorCode::InvalidParam,
                "body block before header",
            ));
        }
        block.write_to(&mut self.inner)?;
        self.bytes_written += block.encoded_len() as u64;
        Ok(())
    }

    /// Bytes emitted so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Flush and return the sink.
    pub fn into_inner(mut self) -> Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Sequential archive reader.
pub struct ArchiveReader<R: Read> {
    inner: R,
}

impl<R: Read> ArchiveReader<R> {
    /// Wrap a source.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read and validate the file header.
    pub fn read_header(&mut self) -> Result<ArchiveHeader> {
        ArchiveHeader::read_from(&mut self.inner)
    }

    /// Read the next body block; `None` at a clean end of file.
    pub fn next_block(&mut self) -> Result<Option<ArchiveBlock>> {
        ArchiveBlock::read_from(&mut self.inner)
    }
}

fn padded<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out[..bytes.len()].copy_from_slice(bytes);
    out
}

fn unpad(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// A field cut short mid-structure is corruption, not a clean end of file.
fn read_field<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::new(ErrorCode::DataCorruption, "truncated archive")
        } else {
            e.into()
        }
    })
}
