//! Hash-addressed file identity.
//!
//! A [`FileId`] is the immutable 20-byte SHA-1 plus the handful of fields
//! (type, dimensions, size, last usage, static-range membership) that the
//! rest of the crate keys everything off. Two forms exist side by side: a
//! textual form used in URLs and directory names, and a fixed 38-byte binary
//! form used for on-disk/wire transport.

use std::fmt;

use thiserror::Error;

/// Length in bytes of the raw SHA-1 hash.
pub const HASH_LEN: usize = 20;

/// Length in bytes of the on-disk binary encoding of a [`FileId`].
pub const ENCODED_LEN: usize = HASH_LEN + 1 + 1 + 4 + 2 + 2 + 8;

/// Maximum accepted file size (bytes); requests above this are rejected
/// as "too big" at the serving layer.
pub const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Image content type. `Unknown` is accepted in parsing but never served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    Jpg,
    Png,
    Gif,
    Unknown,
}

impl FileType {
    /// Returns the textual token used in the stable textual form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FileType::Jpg => "jpg",
            FileType::Png => "png",
            FileType::Gif => "gif",
            FileType::Unknown => "unknown",
        }
    }

    /// The byte used in the 38-byte on-disk encoding.
    #[must_use]
    pub fn as_byte(self) -> u8 {
        match self {
            FileType::Jpg => 0,
            FileType::Png => 1,
            FileType::Gif => 2,
            FileType::Unknown => 0xFF,
        }
    }

    fn from_byte(b: u8) -> Self {
        match b {
            0 => FileType::Jpg,
            1 => FileType::Png,
            2 => FileType::Gif,
            _ => FileType::Unknown,
        }
    }

    /// Whether this type is servable (has a known image extension).
    #[must_use]
    pub fn is_servable(self) -> bool {
        !matches!(self, FileType::Unknown)
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FileType {
    type Err = FileIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "jpg" => Ok(FileType::Jpg),
            "png" => Ok(FileType::Png),
            "gif" => Ok(FileType::Gif),
            other => Err(FileIdError::BadType(other.to_string())),
        }
    }
}

/// Errors raised while parsing or decoding a [`FileId`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FileIdError {
    #[error("textual id has wrong number of '-'-separated fields")]
    BadFieldCount,
    #[error("hash is not valid hex: {0}")]
    BadHash(String),
    #[error("invalid size field: {0}")]
    BadSize(String),
    #[error("invalid width field: {0}")]
    BadWidth(String),
    #[error("invalid height field: {0}")]
    BadHeight(String),
    #[error("unknown file type: {0}")]
    BadType(String),
    #[error("encoded buffer has wrong length: expected {ENCODED_LEN}, got {0}")]
    BadEncodedLength(usize),
    #[error("file size {0} exceeds the maximum of {MAX_FILE_SIZE} bytes")]
    TooBig(u64),
}

/// Hash-addressed file identity. Immutable except for `last_usage`, which is
/// only ever mutated by the usage-batcher inside [`crate::metadb`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileId {
    pub hash: [u8; HASH_LEN],
    pub file_type: FileType,
    pub size: u64,
    pub width: u16,
    pub height: u16,
    pub is_static: bool,
    pub last_usage: i64,
}

impl FileId {
    /// Builds a new `FileId`, rejecting sizes over [`MAX_FILE_SIZE`].
    pub fn new(
        hash: [u8; HASH_LEN],
        file_type: FileType,
        size: u64,
        width: u16,
        height: u16,
    ) -> Result<Self, FileIdError> {
        if size > MAX_FILE_SIZE {
            return Err(FileIdError::TooBig(size));
        }
        Ok(Self {
            hash,
            file_type,
            size,
            width,
            height,
            is_static: false,
            last_usage: 0,
        })
    }

    /// Hex-encoded hash, lowercase.
    #[must_use]
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// The 2-character shard prefix this file lives under on disk, and the
    /// 2-byte big-endian static-range key (same bits, different framing).
    #[must_use]
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.hash[0..1])
    }

    /// The 16-bit static-range key: the first two raw hash bytes, big-endian.
    #[must_use]
    pub fn static_range_key(&self) -> u16 {
        u16::from_be_bytes([self.hash[0], self.hash[1]])
    }

    /// Stable textual form: `hex(hash)-size-width-height-type`.
    #[must_use]
    pub fn textual(&self) -> String {
        format!(
            "{}-{}-{}-{}-{}",
            self.hash_hex(),
            self.size,
            self.width,
            self.height,
            self.file_type
        )
    }

    /// Parses the stable textual form produced by [`Self::textual`].
    pub fn parse(s: &str) -> Result<Self, FileIdError> {
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 5 {
            return Err(FileIdError::BadFieldCount);
        }
        let hash_bytes =
            hex::decode(parts[0]).map_err(|_| FileIdError::BadHash(parts[0].to_string()))?;
        let hash: [u8; HASH_LEN] = hash_bytes
            .try_into()
            .map_err(|_| FileIdError::BadHash(parts[0].to_string()))?;
        let size: u64 = parts[1]
            .parse()
            .map_err(|_| FileIdError::BadSize(parts[1].to_string()))?;
        let width: u16 = parts[2]
            .parse()
            .map_err(|_| FileIdError::BadWidth(parts[2].to_string()))?;
        let height: u16 = parts[3]
            .parse()
            .map_err(|_| FileIdError::BadHeight(parts[3].to_string()))?;
        let file_type: FileType = parts[4].parse()?;
        if size > MAX_FILE_SIZE {
            return Err(FileIdError::TooBig(size));
        }
        Ok(Self {
            hash,
            file_type,
            size,
            width,
            height,
            is_static: false,
            last_usage: 0,
        })
    }

    /// Encodes the 38-byte on-disk binary form:
    /// `hash(20) . type(1) . static(1) . size(4 LE) . height(2 LE) . width(2 LE) . last_usage(8 LE)`.
    #[must_use]
    pub fn encode(&self) -> [u8; ENCODED_LEN] {
        let mut buf = [0u8; ENCODED_LEN];
        buf[0..20].copy_from_slice(&self.hash);
        buf[20] = self.file_type.as_byte();
        buf[21] = if self.is_static { 0xFF } else { 0x00 };
        buf[22..26].copy_from_slice(&(self.size as u32).to_le_bytes());
        buf[26..28].copy_from_slice(&self.height.to_le_bytes());
        buf[28..30].copy_from_slice(&self.width.to_le_bytes());
        buf[30..38].copy_from_slice(&self.last_usage.to_le_bytes());
        buf
    }

    /// Decodes the 38-byte on-disk binary form produced by [`Self::encode`].
    pub fn decode(buf: &[u8]) -> Result<Self, FileIdError> {
        if buf.len() != ENCODED_LEN {
            return Err(FileIdError::BadEncodedLength(buf.len()));
        }
        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(&buf[0..20]);
        let file_type = FileType::from_byte(buf[20]);
        let is_static = buf[21] == 0xFF;
        let bad_length = || FileIdError::BadEncodedLength(buf.len());
        let size = u32::from_le_bytes(buf[22..26].try_into().map_err(|_| bad_length())?) as u64;
        let height = u16::from_le_bytes(buf[26..28].try_into().map_err(|_| bad_length())?);
        let width = u16::from_le_bytes(buf[28..30].try_into().map_err(|_| bad_length())?);
        let last_usage = i64::from_le_bytes(buf[30..38].try_into().map_err(|_| bad_length())?);
        Ok(Self {
            hash,
            file_type,
            size,
            width,
            height,
            is_static,
            last_usage,
        })
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.textual())
    }
}
