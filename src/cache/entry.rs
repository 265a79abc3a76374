// Purpose: Implement the versioned binary codec for per-miss cache entries.
// Inputs/Outputs: Encodes/decodes artifact ids, captured stdio, return code and dependency digests.
// Invariants: The writer emits format version 4; readers accept versions 2 through 4.
// Gotchas: All integers are little-endian int32; digests are raw fixed-size bytes.

use anyhow::{bail, Context};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::collections::BTreeMap;
use std::io::{Read, Write};

use crate::hasher::{Digest, DIGEST_SIZE};

/// The version of the entry serialization format emitted by this writer.
pub const ENTRY_FORMAT_VERSION: i32 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressionMode {
    None,
    All,
}

impl CompressionMode {
    fn to_wire(self) -> i32 {
        match self {
            CompressionMode::None => 0,
            CompressionMode::All => 1,
        }
    }

    fn from_wire(value: i32) -> anyhow::Result<Self> {
        match value {
            0 => Ok(CompressionMode::None),
            1 => Ok(CompressionMode::All),
            other => bail!("unknown compression mode: {}", other),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub file_ids: Vec<String>,
    pub dependencies: BTreeMap<String, Digest>,
    pub compression: CompressionMode,
    pub std_out: String,
    pub std_err: String,
    pub return_code: i32,
}

impl CacheEntry {
    pub fn serialize(&self) -> anyhow::Result<Vec<u8>> {
        let mut data = Vec::new();
        put_i32(&mut data, ENTRY_FORMAT_VERSION);
        put_i32(&mut data, self.compression.to_wire());
        put_i32(&mut data, count_of(self.file_ids.len())?);
        for id in &self.file_ids {
            put_bytes(&mut data, id.as_bytes())?;
        }
        match self.compression {
            CompressionMode::All => {
                put_bytes(&mut data, &compress(self.std_out.as_bytes())?)?;
                put_bytes(&mut data, &compress(self.std_err.as_bytes())?)?;
            }
            CompressionMode::None => {
                put_bytes(&mut data, self.std_out.as_bytes())?;
                put_bytes(&mut data, self.std_err.as_bytes())?;
            }
        }
        put_i32(&mut data, self.return_code);
        put_i32(&mut data, count_of(self.dependencies.len())?);
        for (path, digest) in &self.dependencies {
            put_bytes(&mut data, path.as_bytes())?;
            data.extend_from_slice(digest.as_bytes());
        }
        Ok(data)
    }

    pub fn deserialize(data: &[u8]) -> anyhow::Result<Self> {
        let mut reader = Reader { data, pos: 0 };

        let format_version = reader.take_i32()?;
        if format_version > ENTRY_FORMAT_VERSION {
            bail!("unsupported cache entry format version: {}", format_version);
        }
        if format_version < 2 {
            bail!("unsupported cache entry format version: {}", format_version);
        }

        let compression = CompressionMode::from_wire(reader.take_i32()?)?;
        let file_ids = if format_version >= 3 {
            reader.take_string_vector()?
        } else {
            // v2 stored a file-id -> path map; only the keys survive.
            let count = reader.take_i32()?;
            let mut ids = Vec::new();
            for _ in 0..count {
                ids.push(reader.take_string()?);
                reader.take_string()?;
            }
            ids
        };
        let std_out_raw = reader.take_byte_string()?;
        let std_err_raw = reader.take_byte_string()?;
        let return_code = reader.take_i32()?;
        let mut dependencies = BTreeMap::new();
        if format_version >= 4 {
            let count = reader.take_i32()?;
            for _ in 0..count {
                let path = reader.take_string()?;
                let digest = reader.take_digest()?;
                dependencies.insert(path, digest);
            }
        }
        if reader.pos != data.len() {
            bail!("trailing bytes after serialized cache entry");
        }

        let (std_out, std_err) = match compression {
            CompressionMode::All => (
                into_string(decompress(&std_out_raw)?)?,
                into_string(decompress(&std_err_raw)?)?,
            ),
            CompressionMode::None => (into_string(std_out_raw)?, into_string(std_err_raw)?),
        };

        Ok(Self {
            file_ids,
            dependencies,
            compression,
            std_out,
            std_err,
            return_code,
        })
    }
}

fn count_of(len: usize) -> anyhow::Result<i32> {
    i32::try_from(len).context("cache entry element count overflows int32")
}

fn put_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> anyhow::Result<()> {
    put_i32(out, count_of(bytes.len())?);
    out.extend_from_slice(bytes);
    Ok(())
}

fn compress(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("compress cache entry payload")?;
    encoder.finish().context("compress cache entry payload")
}

fn decompress(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .context("decompress cache entry payload")?;
    Ok(out)
}

fn into_string(bytes: Vec<u8>) -> anyhow::Result<String> {
    String::from_utf8(bytes).context("cache entry payload is not valid utf-8")
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take_i32(&mut self) -> anyhow::Result<i32> {
        if self.pos + 4 > self.data.len() {
            bail!("premature end of serialized cache entry");
        }
        let raw: [u8; 4] = self.data[self.pos..self.pos + 4]
            .try_into()
            .context("premature end of serialized cache entry")?;
        self.pos += 4;
        Ok(i32::from_le_bytes(raw))
    }

    fn take_byte_string(&mut self) -> anyhow::Result<Vec<u8>> {
        let len = self.take_i32()?;
        if len < 0 {
            bail!("negative length in serialized cache entry");
        }
        let len = len as usize;
        if self.pos + len > self.data.len() {
            bail!("premature end of serialized cache entry");
        }
        let bytes = self.data[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }

    fn take_string(&mut self) -> anyhow::Result<String> {
        into_string(self.take_byte_string()?)
    }

    fn take_string_vector(&mut self) -> anyhow::Result<Vec<String>> {
        let count = self.take_i32()?;
        if count < 0 {
            bail!("negative count in serialized cache entry");
        }
        let mut out = Vec::new();
        for _ in 0..count {
            out.push(self.take_string()?);
        }
        Ok(out)
    }

    fn take_digest(&mut self) -> anyhow::Result<Digest> {
        if self.pos + DIGEST_SIZE > self.data.len() {
            bail!("premature end of serialized cache entry");
        }
        let digest = Digest::from_bytes(&self.data[self.pos..self.pos + DIGEST_SIZE])?;
        self.pos += DIGEST_SIZE;
        Ok(digest)
    }
}
