// Purpose: Produce MSBuild-compatible tlog files and gate the host's FileTracker DLL.
// Inputs/Outputs: Reads TRACKER_* environment variables; writes .read.1.tlog/.write.1.tlog files.
// Invariants: Exactly one suspend and one resume of tracking per process lifetime, no nesting.
// Gotchas: Read tlog content is upper-cased wholesale; the write tlog is not.

use anyhow::Context;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::is_truthy;
use crate::path_utils::{append_path, file_part};

pub const ENV_TRACKER_ENABLED: &str = "TRACKER_ENABLED";
const ENV_TRACKER_INTERMEDIATE: &str = "TRACKER_INTERMEDIATE";
const ENV_TRACKER_TOOLCHAIN: &str = "TRACKER_TOOLCHAIN";

fn tracker_enabled() -> bool {
    std::env::var(ENV_TRACKER_ENABLED)
        .map(|v| is_truthy(&v))
        .unwrap_or(false)
}

/// Per-invocation accumulator for MSBuild tracking logs.
///
/// MSBuild merges per-input tlog records automatically, which is what allows
/// them to be cached and restored per input file.
pub struct TrackingLog {
    enabled: bool,
    intermediate_dir: String,
    toolchain: String,
    sources: Vec<String>,
    root: String,
}

impl TrackingLog {
    pub fn from_env() -> Self {
        if !tracker_enabled() {
            return Self::disabled();
        }
        Self::new(
            std::env::var(ENV_TRACKER_INTERMEDIATE).unwrap_or_default(),
            std::env::var(ENV_TRACKER_TOOLCHAIN).unwrap_or_default(),
        )
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            intermediate_dir: String::new(),
            toolchain: String::new(),
            sources: Vec::new(),
            root: String::new(),
        }
    }

    pub fn new(intermediate_dir: String, toolchain: String) -> Self {
        Self {
            enabled: true,
            intermediate_dir,
            toolchain,
            sources: Vec::new(),
            root: String::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the tlog build files associated with one input file.
    pub fn get_build_files(&self, filename: &str) -> BTreeMap<String, String> {
        let mut files = BTreeMap::new();
        if !self.enabled {
            return files;
        }
        let basename = file_part(filename, true).replace('.', "_");
        let read_name = format!("{}.{}.read.1.tlog", self.toolchain, basename);
        let write_name = format!("{}.{}.write.1.tlog", self.toolchain, basename);
        files.insert(
            "tlog_r".to_string(),
            append_path(&self.intermediate_dir, &read_name),
        );
        files.insert(
            "tlog_w".to_string(),
            append_path(&self.intermediate_dir, &write_name),
        );
        files
    }

    pub fn add_source(&mut self, path: &str) {
        if !self.enabled {
            return;
        }
        self.sources.push(fullpath(path));
    }

    pub fn finalize_sources(&mut self) {
        if !self.enabled {
            return;
        }
        self.sources.sort();
        self.root = format!("^{}", self.sources.join("|"));
    }

    pub fn write_logs(
        &self,
        source: &str,
        build_files: &BTreeMap<String, String>,
        dependencies: &[String],
    ) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let object_path = fullpath(
            build_files
                .get("object")
                .context("tracking log requires an object build file")?,
        );

        let mut lines = vec![self.root.clone(), fullpath(source)];
        // Dependencies are already absolute, but possibly not upper case.
        lines.extend(dependencies.iter().cloned());
        lines.push(object_path.clone());
        let read_path = build_files
            .get("tlog_r")
            .context("missing read tlog build file")?;
        fs::write(read_path, lines.join("\r\n").to_uppercase())
            .with_context(|| format!("write {}", read_path))?;

        let mut lines = vec![self.root.clone()];
        if let Some(pch) = build_files.get("pch") {
            lines.push(pch.clone());
        }
        lines.push(object_path);
        let write_path = build_files
            .get("tlog_w")
            .context("missing write tlog build file")?;
        fs::write(write_path, lines.join("\r\n"))
            .with_context(|| format!("write {}", write_path))?;
        Ok(())
    }
}

fn fullpath(path: &str) -> String {
    let p = Path::new(path);
    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|d| d.join(p))
            .unwrap_or_else(|_| p.to_path_buf())
    };
    abs.to_string_lossy().to_uppercase()
}

static SUSPENDED: AtomicBool = AtomicBool::new(false);

/// Suspends the host's FileTracker instrumentation for the wrapper's own
/// file accesses. No-op when the DLL is absent or tracking is disabled.
pub fn suspend_tracking() {
    if SUSPENDED.swap(true, Ordering::SeqCst) {
        return;
    }
    imp::suspend();
}

/// Resumes instrumentation. Safe to call when nothing is suspended.
pub fn resume_tracking() {
    if !SUSPENDED.swap(false, Ordering::SeqCst) {
        return;
    }
    imp::resume();
}

/// Re-enables tracking early, before handing control to an uncached child
/// process whose file I/O must stay visible to MSBuild.
pub fn release_suppression() {
    resume_tracking();
}

#[cfg(windows)]
mod imp {
    use super::tracker_enabled;
    use core::ffi::c_void;
    use std::sync::OnceLock;

    // The FileTracker suspend/resume API is not recursive; whichever call
    // happens last is the effective state.
    type TrackingFn = unsafe extern "system" fn() -> i32;

    struct Api {
        suspend: TrackingFn,
        resume: TrackingFn,
    }

    unsafe extern "system" {
        fn GetModuleHandleW(lpModuleName: *const u16) -> *mut c_void;
        fn GetProcAddress(hModule: *mut c_void, lpProcName: *const u8) -> *mut c_void;
    }

    fn api() -> Option<&'static Api> {
        static API: OnceLock<Option<Api>> = OnceLock::new();
        API.get_or_init(|| {
            if !tracker_enabled() {
                return None;
            }
            let mut handle: *mut c_void = core::ptr::null_mut();
            for name in ["FileTracker64", "FileTracker32", "FileTracker"] {
                let wide: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();
                handle = unsafe { GetModuleHandleW(wide.as_ptr()) };
                if !handle.is_null() {
                    break;
                }
            }
            if handle.is_null() {
                return None;
            }
            let suspend = unsafe { GetProcAddress(handle, c"SuspendTracking".as_ptr().cast()) };
            let resume = unsafe { GetProcAddress(handle, c"ResumeTracking".as_ptr().cast()) };
            if suspend.is_null() || resume.is_null() {
                return None;
            }
            Some(Api {
                suspend: unsafe { core::mem::transmute::<*mut c_void, TrackingFn>(suspend) },
                resume: unsafe { core::mem::transmute::<*mut c_void, TrackingFn>(resume) },
            })
        })
        .as_ref()
    }

    pub fn suspend() {
        if let Some(api) = api() {
            unsafe {
                (api.suspend)();
            }
        }
    }

    pub fn resume() {
        if let Some(api) = api() {
            unsafe {
                (api.resume)();
            }
        }
    }
}

#[cfg(not(windows))]
mod imp {
    pub fn suspend() {}

    pub fn resume() {}
}

#[cfg(test)]
mod tests {
    use super::TrackingLog;
    use std::collections::BTreeMap;
    use std::fs;

    #[test]
    fn disabled_log_produces_no_build_files() {
        let tlog = TrackingLog::disabled();
        assert!(!tlog.enabled());
        assert!(tlog.get_build_files("foo.cpp").is_empty());
        assert!(tlog.write_logs("foo.cpp", &BTreeMap::new(), &[]).is_ok());
    }

    #[test]
    fn tlog_names_replace_dots_with_underscores() {
        let tlog = TrackingLog::new("inter".to_string(), "CL".to_string());
        let files = tlog.get_build_files("C:\\src\\foo.cpp");
        let read = files.get("tlog_r").expect("read tlog");
        let write = files.get("tlog_w").expect("write tlog");
        assert!(read.ends_with("CL.foo_cpp.read.1.tlog"));
        assert!(write.ends_with("CL.foo_cpp.write.1.tlog"));
        assert!(read.starts_with("inter"));
    }

    #[test]
    fn write_logs_emits_rooted_crlf_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path().to_str().expect("utf-8").to_string();
        let mut tlog = TrackingLog::new(base.clone(), "CL".to_string());

        let source = dir.path().join("main.cpp");
        fs::write(&source, "int main() {}\n").expect("write source");
        let source = source.to_str().expect("utf-8").to_string();

        tlog.add_source(&source);
        tlog.finalize_sources();

        let mut build_files = tlog.get_build_files(&source);
        let object = dir.path().join("main.obj");
        build_files.insert(
            "object".to_string(),
            object.to_str().expect("utf-8").to_string(),
        );

        let dep = format!("{}/stdio.h", base).to_uppercase();
        tlog.write_logs(&source, &build_files, std::slice::from_ref(&dep))
            .expect("write logs");

        let read = fs::read_to_string(build_files.get("tlog_r").expect("path")).expect("read");
        let lines: Vec<&str> = read.split("\r\n").collect();
        assert!(lines[0].starts_with('^'));
        assert_eq!(lines[0], lines[0].to_uppercase());
        assert_eq!(lines[1], source.to_uppercase());
        assert_eq!(lines[2], dep);
        assert_eq!(
            lines[3],
            object.to_str().expect("utf-8").to_uppercase()
        );

        let write = fs::read_to_string(build_files.get("tlog_w").expect("path")).expect("read");
        let lines: Vec<&str> = write.split("\r\n").collect();
        assert!(lines[0].starts_with('^'));
        assert_eq!(
            lines[1],
            object.to_str().expect("utf-8").to_uppercase()
        );
    }

    #[test]
    fn sources_are_sorted_into_the_root() {
        let mut tlog = TrackingLog::new("inter".to_string(), "CL".to_string());
        tlog.add_source("/b/second.cpp");
        tlog.add_source("/a/first.cpp");
        tlog.finalize_sources();

        let mut build_files = tlog.get_build_files("/a/first.cpp");
        build_files.insert("object".to_string(), "/a/first.obj".to_string());
        let dir = tempfile::tempdir().expect("tempdir");
        build_files.insert(
            "tlog_r".to_string(),
            dir.path().join("r.tlog").to_str().expect("utf-8").to_string(),
        );
        build_files.insert(
            "tlog_w".to_string(),
            dir.path().join("w.tlog").to_str().expect("utf-8").to_string(),
        );
        tlog.write_logs("/a/first.cpp", &build_files, &[])
            .expect("write logs");

        let read =
            fs::read_to_string(dir.path().join("r.tlog")).expect("read tlog");
        let root = read.split("\r\n").next().expect("root line");
        assert_eq!(root, "^/A/FIRST.CPP|/B/SECOND.CPP");
    }
}
