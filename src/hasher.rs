// Purpose: Provide the content-digest primitives used for cache keys and dependency checks.
// Inputs/Outputs: Hashes byte buffers and files into fixed-size digests.
// Invariants: Digests must be deterministic for identical input bytes.
// Gotchas: DIGEST_SIZE parameterizes the cache-entry wire format; changing it breaks old entries.

use anyhow::Context;
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::fs;

pub const DIGEST_SIZE: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_SIZE]);

impl Digest {
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let raw: [u8; DIGEST_SIZE] = bytes
            .try_into()
            .context("digest has the wrong number of bytes")?;
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

#[derive(Default)]
pub struct Hasher {
    inner: Sha256,
}

impl Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    pub fn update_from_file(&mut self, path: &str) -> anyhow::Result<()> {
        let bytes = fs::read(path).with_context(|| format!("read {}", path))?;
        self.update(&bytes);
        Ok(())
    }

    pub fn finalize(self) -> Digest {
        Digest(self.inner.finalize().into())
    }
}

pub fn hash_bytes(bytes: &[u8]) -> Digest {
    let mut h = Hasher::new();
    h.update(bytes);
    h.finalize()
}

pub fn hash_file(path: &str) -> anyhow::Result<Digest> {
    let mut h = Hasher::new();
    h.update_from_file(path)?;
    Ok(h.finalize())
}
