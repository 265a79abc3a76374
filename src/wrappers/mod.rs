// Purpose: Define the program-wrapper capability interface and the per-invocation pipeline.
// Inputs/Outputs: Drives a wrapper through key derivation, cache lookup and miss handling.
// Invariants: Nothing is committed to the cache unless the wrapped program exits with code 0.
// Gotchas: A decline means the host must run the real program; it is not a failure.

pub mod ledger;
pub mod msvc;

use std::collections::BTreeMap;
use thiserror::Error;

use crate::cache::entry::{CacheEntry, CompressionMode};
use crate::cache::local::LocalCache;
use crate::config;
use crate::hasher::{Digest, Hasher};
use crate::sys::proc::RunResult;
use crate::trace::trace;

/// Map from file id (e.g. "object", "pch", "tlog_r") to its on-disk path.
pub type BuildFiles = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum WrapperError {
    /// Recognized but unsupported invocation; the host should run the real
    /// program without caching.
    #[error("{0}")]
    Decline(String),
    /// The wrapper got far enough that falling back is no longer safe.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

pub type WrapperResult<T> = Result<T, WrapperError>;

pub fn decline<T>(reason: impl Into<String>) -> WrapperResult<T> {
    Err(WrapperError::Decline(reason.into()))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    /// Cached files may be materialized as hard links instead of copies.
    HardLinks,
}

/// Per-input state carried from the lookup phase through the miss run.
#[derive(Debug)]
pub struct MissInfo {
    pub source: String,
    pub key: Digest,
    pub build_files: BuildFiles,
    pub dependencies: BTreeMap<String, Digest>,
}

/// The wrapper capability set shared by all driver wrappers.
///
/// `resolve_args` is called once, after `can_handle_command` and before any
/// method that relies on the parsed command line.
pub trait ProgramWrapper {
    fn can_handle_command(&self) -> bool;
    fn resolve_args(&mut self) -> WrapperResult<()>;
    fn get_capabilities(&self) -> Vec<Capability> {
        Vec::new()
    }
    /// Per input file, the content payload that keys the cache entry.
    fn preprocess_source(&mut self) -> WrapperResult<Vec<(String, Vec<u8>)>>;
    fn get_relevant_arguments(&self) -> WrapperResult<Vec<String>>;
    fn get_relevant_env_vars(&self) -> BTreeMap<String, String>;
    fn get_program_id(&self) -> String;
    fn get_build_files(&self, key: &str) -> WrapperResult<BuildFiles>;
    /// Last-chance inspection of a candidate entry while the cache lock is
    /// held. Returning false demotes the lookup to a miss.
    fn filter_cache_hit(&mut self, entry: &CacheEntry) -> bool;
    fn run_for_miss(&mut self, miss_infos: &mut [MissInfo]) -> WrapperResult<RunResult>;
}

/// Derives the fingerprint key naming one cache entry.
pub fn fingerprint_key(
    program_id: &str,
    args: &[String],
    env_vars: &BTreeMap<String, String>,
    preprocessed: &[u8],
) -> Digest {
    let mut hasher = Hasher::new();
    hasher.update(program_id.as_bytes());
    hasher.update(b"\0");
    for arg in args {
        hasher.update(arg.as_bytes());
        hasher.update(b"\0");
    }
    for (name, value) in env_vars {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\0");
    }
    hasher.update(preprocessed);
    hasher.finalize()
}

/// The per-invocation state machine: resolve, key, lookup, and on miss run
/// the real program and commit its outputs.
pub fn handle_command(wrapper: &mut dyn ProgramWrapper, cache: &LocalCache) -> WrapperResult<i32> {
    if !wrapper.can_handle_command() {
        return decline("unknown driver");
    }
    wrapper.resolve_args()?;

    let sources = wrapper.preprocess_source()?;
    let relevant_args = wrapper.get_relevant_arguments()?;
    let env_vars = wrapper.get_relevant_env_vars();
    let program_id = wrapper.get_program_id();
    let allow_hard_links = wrapper.get_capabilities().contains(&Capability::HardLinks);

    let mut hit_code = 0;
    let mut misses = Vec::new();
    for (source, payload) in &sources {
        let key = fingerprint_key(&program_id, &relevant_args, &env_vars, payload);
        let build_files = wrapper.get_build_files(source)?;
        let lookup = cache
            .lookup(&key, &build_files, allow_hard_links, |entry| {
                wrapper.filter_cache_hit(entry)
            })
            .map_err(WrapperError::Fatal)?;
        match lookup {
            Some(entry) => {
                trace(&format!("cache hit for {}", source));
                print!("{}", entry.std_out);
                eprint!("{}", entry.std_err);
                hit_code = entry.return_code;
            }
            None => {
                trace(&format!("cache miss for {}", source));
                misses.push(MissInfo {
                    source: source.clone(),
                    key,
                    build_files,
                    dependencies: BTreeMap::new(),
                });
            }
        }
    }

    if misses.is_empty() {
        return Ok(hit_code);
    }

    let result = wrapper.run_for_miss(&mut misses)?;
    if result.return_code != 0 {
        // A failed compile commits nothing; surface the code as-is.
        return Ok(result.return_code);
    }

    let compression = if config::compression_enabled() {
        CompressionMode::All
    } else {
        CompressionMode::None
    };
    for miss in &misses {
        let entry = CacheEntry {
            file_ids: miss.build_files.keys().cloned().collect(),
            dependencies: miss.dependencies.clone(),
            compression,
            std_out: result.std_out.clone(),
            std_err: result.std_err.clone(),
            return_code: result.return_code,
        };
        cache
            .add(&miss.key, &entry, &miss.build_files)
            .map_err(WrapperError::Fatal)?;
    }
    Ok(result.return_code)
}

#[cfg(test)]
mod tests {
    use super::{
        decline, fingerprint_key, handle_command, BuildFiles, Capability, MissInfo,
        ProgramWrapper, WrapperResult,
    };
    use crate::cache::entry::CacheEntry;
    use crate::cache::local::LocalCache;
    use crate::sys::proc::RunResult;
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::PathBuf;

    struct StubWrapper {
        object_path: PathBuf,
        accept_hits: bool,
        miss_runs: usize,
    }

    impl StubWrapper {
        fn new(object_path: PathBuf) -> Self {
            Self {
                object_path,
                accept_hits: true,
                miss_runs: 0,
            }
        }
    }

    impl ProgramWrapper for StubWrapper {
        fn can_handle_command(&self) -> bool {
            true
        }

        fn resolve_args(&mut self) -> WrapperResult<()> {
            Ok(())
        }

        fn get_capabilities(&self) -> Vec<Capability> {
            vec![Capability::HardLinks]
        }

        fn preprocess_source(&mut self) -> WrapperResult<Vec<(String, Vec<u8>)>> {
            Ok(vec![("main.c".to_string(), b"cint main;".to_vec())])
        }

        fn get_relevant_arguments(&self) -> WrapperResult<Vec<String>> {
            Ok(vec!["/c".to_string()])
        }

        fn get_relevant_env_vars(&self) -> BTreeMap<String, String> {
            BTreeMap::new()
        }

        fn get_program_id(&self) -> String {
            "stub-1.0".to_string()
        }

        fn get_build_files(&self, _key: &str) -> WrapperResult<BuildFiles> {
            let mut files = BuildFiles::new();
            files.insert(
                "object".to_string(),
                self.object_path.to_str().expect("utf-8").to_string(),
            );
            Ok(files)
        }

        fn filter_cache_hit(&mut self, _entry: &CacheEntry) -> bool {
            self.accept_hits
        }

        fn run_for_miss(&mut self, miss_infos: &mut [MissInfo]) -> WrapperResult<RunResult> {
            self.miss_runs += 1;
            for miss in miss_infos.iter() {
                let path = miss
                    .build_files
                    .get("object")
                    .expect("stub registers an object file");
                fs::write(path, b"stub object").map_err(anyhow::Error::from)?;
            }
            Ok(RunResult {
                std_out: String::new(),
                std_err: String::new(),
                return_code: 0,
            })
        }
    }

    struct DecliningWrapper;

    impl ProgramWrapper for DecliningWrapper {
        fn can_handle_command(&self) -> bool {
            true
        }

        fn resolve_args(&mut self) -> WrapperResult<()> {
            decline("unsupported flags")
        }

        fn preprocess_source(&mut self) -> WrapperResult<Vec<(String, Vec<u8>)>> {
            unreachable!("resolve_args declines first")
        }

        fn get_relevant_arguments(&self) -> WrapperResult<Vec<String>> {
            unreachable!()
        }

        fn get_relevant_env_vars(&self) -> BTreeMap<String, String> {
            unreachable!()
        }

        fn get_program_id(&self) -> String {
            unreachable!()
        }

        fn get_build_files(&self, _key: &str) -> WrapperResult<BuildFiles> {
            unreachable!()
        }

        fn filter_cache_hit(&mut self, _entry: &CacheEntry) -> bool {
            unreachable!()
        }

        fn run_for_miss(&mut self, _miss_infos: &mut [MissInfo]) -> WrapperResult<RunResult> {
            unreachable!()
        }
    }

    #[test]
    fn miss_then_hit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = LocalCache::with_root(&dir.path().join("cache")).expect("open cache");
        let object = dir.path().join("main.obj");

        let mut first = StubWrapper::new(object.clone());
        let code = handle_command(&mut first, &cache).expect("first run");
        assert_eq!(code, 0);
        assert_eq!(first.miss_runs, 1);
        assert_eq!(fs::read(&object).expect("object"), b"stub object");

        fs::remove_file(&object).expect("remove object");
        let mut second = StubWrapper::new(object.clone());
        let code = handle_command(&mut second, &cache).expect("second run");
        assert_eq!(code, 0);
        assert_eq!(second.miss_runs, 0, "hit must not run the program");
        assert_eq!(fs::read(&object).expect("object"), b"stub object");
    }

    #[test]
    fn rejected_filter_forces_a_rerun() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = LocalCache::with_root(&dir.path().join("cache")).expect("open cache");
        let object = dir.path().join("main.obj");

        let mut first = StubWrapper::new(object.clone());
        handle_command(&mut first, &cache).expect("first run");

        let mut second = StubWrapper::new(object);
        second.accept_hits = false;
        handle_command(&mut second, &cache).expect("second run");
        assert_eq!(second.miss_runs, 1);
    }

    #[test]
    fn decline_propagates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = LocalCache::with_root(dir.path()).expect("open cache");
        let mut wrapper = DecliningWrapper;
        let err = handle_command(&mut wrapper, &cache).expect_err("declines");
        assert!(err.to_string().contains("unsupported flags"));
    }

    #[test]
    fn fingerprint_key_is_sensitive_to_every_part() {
        let env: BTreeMap<String, String> =
            [("INCLUDE".to_string(), "C:\\sys".to_string())].into();
        let args = vec!["/c".to_string()];
        let base = fingerprint_key("id", &args, &env, b"payload");
        assert_eq!(base, fingerprint_key("id", &args, &env, b"payload"));
        assert_ne!(base, fingerprint_key("id2", &args, &env, b"payload"));
        assert_ne!(
            base,
            fingerprint_key("id", &["/c2".to_string()], &env, b"payload")
        );
        assert_ne!(base, fingerprint_key("id", &args, &BTreeMap::new(), b"payload"));
        assert_ne!(base, fingerprint_key("id", &args, &env, b"payload2"));
    }
}
