// Purpose: Implement the local on-disk cache store for entry blobs and build artifacts.
// Inputs/Outputs: Persists and loads serialized cache entries plus their artifact files.
// Invariants: Lock files must prevent partial-write corruption between concurrent wrappers.
// Gotchas: Corrupt or unreadable entries demote to a miss, never to an error.

use anyhow::Context;
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::cache::entry::CacheEntry;
use crate::config::{cache_root, ensure_dir};
use crate::hasher::Digest;
use crate::trace::trace;

pub struct LocalCache {
    root: PathBuf,
}

struct EntryLock {
    _file: File,
}

impl EntryLock {
    // Precondition: Inputs satisfy semantic and structural invariants expected by this API.
    // Postcondition: Returns a value/state transition that preserves module invariants.
    // Side effects: May read/write filesystem, caches, diagnostics, globals, or process state.
    fn acquire(dir: &Path) -> anyhow::Result<Self> {
        ensure_dir(dir)?;
        let lock_path = dir.join("entry.lock");
        let f = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        f.lock_exclusive()?;
        Ok(Self { _file: f })
    }
}

impl LocalCache {
    pub fn open() -> anyhow::Result<Self> {
        let root = cache_root()?;
        ensure_dir(&root)?;
        Ok(Self { root })
    }

    pub fn with_root(root: &Path) -> anyhow::Result<Self> {
        ensure_dir(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn entry_dir(&self, key: &Digest) -> PathBuf {
        let hx = key.to_hex();
        self.root.join("entries").join(&hx[..2]).join(&hx[2..])
    }

    /// Looks up an entry and, if it survives `filter`, materializes its
    /// artifacts at the expected paths. Returns the entry on a hit.
    pub fn lookup(
        &self,
        key: &Digest,
        expected_files: &BTreeMap<String, String>,
        allow_hard_links: bool,
        filter: impl FnOnce(&CacheEntry) -> bool,
    ) -> anyhow::Result<Option<CacheEntry>> {
        let dir = self.entry_dir(key);
        let entry_path = dir.join("entry");
        if !entry_path.exists() {
            return Ok(None);
        }
        let _lock = EntryLock::acquire(&dir)?;
        let data = match fs::read(&entry_path) {
            Ok(data) => data,
            Err(err) => {
                trace(&format!(
                    "unreadable cache entry {}: {}",
                    entry_path.display(),
                    err
                ));
                return Ok(None);
            }
        };
        let entry = match CacheEntry::deserialize(&data) {
            Ok(entry) => entry,
            Err(err) => {
                trace(&format!(
                    "corrupt cache entry {}: {}",
                    entry_path.display(),
                    err
                ));
                return Ok(None);
            }
        };
        if !filter(&entry) {
            return Ok(None);
        }
        for id in &entry.file_ids {
            let Some(target) = expected_files.get(id) else {
                trace(&format!("cache entry names unexpected file id {}", id));
                return Ok(None);
            };
            materialize(&dir.join(id), Path::new(target), allow_hard_links)?;
        }
        Ok(Some(entry))
    }

    /// Stores an entry together with the produced artifact files.
    pub fn add(
        &self,
        key: &Digest,
        entry: &CacheEntry,
        produced_files: &BTreeMap<String, String>,
    ) -> anyhow::Result<()> {
        let dir = self.entry_dir(key);
        let _lock = EntryLock::acquire(&dir)?;
        for id in &entry.file_ids {
            let source = produced_files
                .get(id)
                .with_context(|| format!("no produced file for id {}", id))?;
            fs::copy(source, dir.join(id))
                .with_context(|| format!("store build artifact {}", source))?;
        }
        let data = entry.serialize()?;
        fs::write(dir.join("entry"), data)
            .with_context(|| format!("write cache entry in {}", dir.display()))?;
        Ok(())
    }
}

fn materialize(source: &Path, target: &Path, allow_hard_links: bool) -> anyhow::Result<()> {
    if let Some(parent) = target.parent()
        && !parent.as_os_str().is_empty()
    {
        ensure_dir(parent)?;
    }
    let _ = fs::remove_file(target);
    if allow_hard_links && fs::hard_link(source, target).is_ok() {
        return Ok(());
    }
    fs::copy(source, target)
        .with_context(|| format!("materialize cached file {}", target.display()))?;
    Ok(())
}
