// Purpose: Implement the cl.exe driver wrapper: tool probe, keying, hit filtering, miss runs.
// Inputs/Outputs: Consumes the wrapped argv and VSCMD/VCTools environment; produces build files.
// Invariants: Direct-mode keys must converge to the decision the compiler itself would make.
// Gotchas: The dependency report stores lowercase paths; INCLUDE roots are lowered to match.

pub mod cmdline;
pub mod deps;
pub mod version;

use anyhow::{bail, Context};
use std::collections::BTreeMap;
use std::io::Write;

use crate::cache::entry::CacheEntry;
use crate::hasher::hash_file;
use crate::path_utils::{file_part, get_extension};
use crate::sys::filetracker::TrackingLog;
use crate::sys::proc::{self, RunResult};
use crate::trace::trace;
use crate::wrappers::ledger::DigestLedger;
use crate::wrappers::{
    decline, BuildFiles, Capability, MissInfo, ProgramWrapper, WrapperError, WrapperResult,
};
use self::cmdline::{CmdlineParser, DebugFormat, InputType, MergeMode};
use self::version::{ToolVersion, Version};

/// Tick this to a new value if the key derivation changes in a
/// non-backwards-compatible way.
const HASH_VERSION: &str = "1";

/// cl.exe searches the paths in this variable for system #includes.
pub const ENV_CL_INCLUDE: &str = "INCLUDE";

/// Command lines longer than this go through an @response file.
const MAX_INLINE_CMDLINE: usize = 8000;

/// /sourceDependencies support appeared in VC Tools 14.27.
const MIN_VC_VERSION: Version = Version::new(14, 27, 0, 0);

pub struct MsvcWrapper {
    args: Vec<String>,
    parser: CmdlineParser,
    tool_version: ToolVersion,
    tlog: TrackingLog,
    env_include_paths: Vec<String>,
    ledger: DigestLedger,
}

impl MsvcWrapper {
    /// Whether argv names the cl driver at all. Checked before construction
    /// so unrelated drivers never pay for the tool probe.
    pub fn can_handle(args: &[String]) -> bool {
        let Some(first) = args.first() else {
            return false;
        };
        file_part(first, false).to_ascii_lowercase() == "cl"
    }

    pub fn new(args: Vec<String>) -> WrapperResult<Self> {
        if args.is_empty() {
            return decline("empty command line");
        }
        let include = std::env::var(ENV_CL_INCLUDE).unwrap_or_default();
        let tool_version =
            probe_tool_version(&args[0]).map_err(|err| WrapperError::Decline(err.to_string()))?;
        Ok(Self {
            args,
            parser: CmdlineParser::default(),
            tool_version,
            tlog: TrackingLog::from_env(),
            env_include_paths: split_include_roots(&include),
            ledger: DigestLedger::new(),
        })
    }

    fn is_system_include(&self, path: &str) -> bool {
        is_system_include_path(&self.env_include_paths, path)
    }

    /// Runs the compiler, switching to an @response file when the command
    /// line outgrows what CreateProcess will reliably carry.
    fn run_with_response_file(&self, args: &[String], quiet: bool) -> anyhow::Result<RunResult> {
        let cmdline = args.join(" ");
        if cmdline.len() > MAX_INLINE_CMDLINE {
            trace(&format!(
                "routing {} byte command line through a response file",
                cmdline.len()
            ));
            let mut rsp = tempfile::Builder::new()
                .prefix("objcache-")
                .suffix(".rsp")
                .tempfile()
                .context("create response file")?;
            rsp.write_all(cmdline.as_bytes())
                .context("write response file")?;
            let rsp_args = vec![format!("@{}", rsp.path().display())];
            return proc::run(&self.args[0], &rsp_args, quiet);
        }
        proc::run(&self.args[0], args, quiet)
    }
}

impl ProgramWrapper for MsvcWrapper {
    fn can_handle_command(&self) -> bool {
        Self::can_handle(&self.args)
    }

    fn resolve_args(&mut self) -> WrapperResult<()> {
        let mut parser = CmdlineParser::default();
        parser
            .parse(&self.args)
            .map_err(|err| WrapperError::Decline(format!("{:#}", err)))?;

        // Other options also inhibit linking (e.g. /P), but those represent
        // invocations this cache has nothing to offer for.
        if !parser.compile_only {
            return decline("cannot handle invocation with chained link");
        }
        // With no inputs there is nothing to cache; let the driver report it.
        if parser.input_files.is_empty() {
            return decline("no input files");
        }
        // cl.exe itself errors on this; it is a plain command line mistake.
        if parser.input_files.len() > 1 && !parser.obj_path_is_dir() {
            return decline("single object for multiple inputs");
        }
        // Pdb outputs of /Zi and /ZI merge contents from multiple objects,
        // including objects produced outside this invocation. /Z7 carries the
        // same information per object and caches cleanly.
        if matches!(
            parser.debug_format,
            DebugFormat::SeparateFile | DebugFormat::SeparateFileEditAndContinue
        ) {
            return decline("shared pdb output requested; use /Z7 instead");
        }
        if self.tool_version.vc_version < MIN_VC_VERSION {
            return decline("VC Tools >= 14.27 required for /sourceDependencies support");
        }
        self.parser = parser;
        Ok(())
    }

    fn get_capabilities(&self) -> Vec<Capability> {
        // MSVC never overwrites existing output files, so hard links are safe.
        vec![Capability::HardLinks]
    }

    fn preprocess_source(&mut self) -> WrapperResult<Vec<(String, Vec<u8>)>> {
        // Direct mode: the payload is the raw input content, tagged with the
        // effective language so a rename that flips the language mode cannot
        // alias into the old entry.
        let mut sources = Vec::new();
        for file in &self.parser.input_files {
            let tag = match self.parser.effective_file_type(file) {
                InputType::C => "c",
                InputType::Cpp => "cpp",
                InputType::Object => "object",
                InputType::Unknown => "unknown",
            };
            let contents = std::fs::read(&file.name)
                .map_err(|err| WrapperError::Decline(format!("read input {}: {}", file.name, err)))?;
            let mut payload = Vec::with_capacity(tag.len() + contents.len());
            payload.extend_from_slice(tag.as_bytes());
            payload.extend_from_slice(&contents);
            sources.push((file.name.clone(), payload));
        }
        Ok(sources)
    }

    fn get_relevant_arguments(&self) -> WrapperResult<Vec<String>> {
        let filtered = self.parser.merge(MergeMode::DirectModeCommonArgs);
        trace(&format!("filtered arguments: {}", filtered.join(" ")));
        Ok(filtered)
    }

    fn get_relevant_env_vars(&self) -> BTreeMap<String, String> {
        // Keep the full, original INCLUDE in the key in case our own parse
        // of it was incomplete.
        let mut vars = BTreeMap::new();
        vars.insert(
            ENV_CL_INCLUDE.to_string(),
            std::env::var(ENV_CL_INCLUDE).unwrap_or_default(),
        );
        vars
    }

    fn get_program_id(&self) -> String {
        format!(
            "{}{}{}{}",
            HASH_VERSION,
            self.tool_version.host_arch,
            self.tool_version.target_arch,
            self.tool_version.vc_version.as_string(4)
        )
    }

    fn get_build_files(&self, key: &str) -> WrapperResult<BuildFiles> {
        let mut files = BuildFiles::new();
        let object_path = if !self.parser.obj_path_is_dir() {
            // A non-directory object path implies a single input whose object
            // name comes from the path rather than the input file.
            let mut path = self.parser.object_path.clone();
            if get_extension(&path).is_empty() {
                path.push_str(".obj");
            }
            path
        } else {
            format!(
                "{}{}.obj",
                self.parser.object_path,
                file_part(key, false)
            )
        };
        files.insert("object".to_string(), object_path);

        if self.parser.pch.is_create() {
            let default_name = format!("vc{}0.pch", self.tool_version.vc_version.as_string(1));
            files.insert(
                "pch".to_string(),
                self.parser.pch.output_path(key, &default_name),
            );
        }

        files.extend(self.tlog.get_build_files(key));
        Ok(files)
    }

    fn filter_cache_hit(&mut self, entry: &CacheEntry) -> bool {
        for (include, cached_digest) in &entry.dependencies {
            let digest = match self.ledger.get(include) {
                Some(digest) => digest,
                None => match hash_file(include) {
                    Ok(digest) => {
                        // Record it in case another input depends on the
                        // same file.
                        self.ledger.set(include, digest);
                        digest
                    }
                    // The file may no longer exist; the cached result must
                    // not be used, but this is not fatal.
                    Err(_) => return false,
                },
            };
            if digest != *cached_digest {
                return false;
            }
        }
        true
    }

    fn run_for_miss(&mut self, miss_infos: &mut [MissInfo]) -> WrapperResult<RunResult> {
        // Re-run the original command, but only for the inputs that missed.
        let mut args = self.parser.merge(MergeMode::SkipInputs);
        for miss in miss_infos.iter() {
            let input = self
                .parser
                .input_file_by_name(&miss.source)
                .map_err(WrapperError::Fatal)?;
            args.push(self.parser.input_arg(input));
            self.tlog.add_source(&input.name);
        }
        self.tlog.finalize_sources();

        // cl.exe checks whether a directory exists at the /sourceDependencies
        // location; otherwise the argument is treated as a file name.
        let deps_dir = tempfile::Builder::new()
            .prefix("objcache-deps-")
            .tempdir()
            .context("create dependency report directory")
            .map_err(WrapperError::Fatal)?;
        args.push("/sourceDependencies".to_string());
        args.push(deps_dir.path().to_string_lossy().into_owned());

        let run = self
            .run_with_response_file(&args, false)
            .map_err(WrapperError::Fatal)?;
        // The driver echoes each source file name on stdout. Keep that out
        // of the cache entry so hits don't replay stale names.
        let result = RunResult {
            std_out: String::new(),
            std_err: String::new(),
            return_code: run.return_code,
        };
        if result.return_code != 0 {
            return Ok(result);
        }

        for miss in miss_infos.iter_mut() {
            let json_name = format!("{}.json", file_part(&miss.source, true));
            let report_path = deps_dir.path().join(json_name);
            let src_deps =
                deps::read_source_dependencies(&report_path).map_err(WrapperError::Fatal)?;

            let mut dependencies = BTreeMap::new();
            for include in &src_deps {
                if let Some(digest) = self.ledger.get(include) {
                    dependencies.insert(include.clone(), digest);
                    continue;
                }
                if self.is_system_include(include) {
                    continue;
                }
                let digest = hash_file(include)
                    .with_context(|| format!("hash dependency {}", include))
                    .map_err(WrapperError::Fatal)?;
                dependencies.insert(include.clone(), digest);
                self.ledger.set(include, digest);
            }
            miss.dependencies = dependencies;

            self.tlog
                .write_logs(&miss.source, &miss.build_files, &src_deps)
                .map_err(WrapperError::Fatal)?;
        }
        Ok(result)
    }
}

fn probe_tool_version(compiler_path: &str) -> anyhow::Result<ToolVersion> {
    probe_tool_version_from(
        compiler_path,
        std::env::var("VSCMD_ARG_HOST_ARCH").ok(),
        std::env::var("VSCMD_ARG_TGT_ARCH").ok(),
        std::env::var("VCToolsVersion").ok(),
    )
}

/// Architecture and toolset discovery: prefer the vcvars environment, fall
/// back to the layout of the compiler path
/// (`...\<version>\bin\Host<arch>\<arch>\cl.exe`).
fn probe_tool_version_from(
    compiler_path: &str,
    host: Option<String>,
    target: Option<String>,
    vc: Option<String>,
) -> anyhow::Result<ToolVersion> {
    let parts: Vec<&str> = compiler_path.split(['\\', '/']).collect();
    let n = parts.len();
    let mut path_valid = false;

    let host_arch = if let Some(h) = host {
        h
    } else if n >= 3 && parts[n - 3].starts_with("Host") {
        path_valid = true;
        parts[n - 3][4..].to_string()
    } else {
        String::new()
    };
    let target_arch = if let Some(t) = target {
        t
    } else if path_valid {
        parts[n - 2].to_string()
    } else {
        String::new()
    };
    if host_arch.is_empty() || target_arch.is_empty() {
        bail!("failed to determine compiler host/target architecture");
    }

    let vc_text = if let Some(v) = vc {
        v
    } else if path_valid && n >= 5 {
        parts[n - 5].to_string()
    } else {
        bail!("failed to determine VC tools version");
    };

    Ok(ToolVersion {
        host_arch,
        target_arch,
        vc_version: Version::parse(&vc_text),
    })
}

/// The dependency report stores paths lowercase; lower the INCLUDE roots
/// once so membership is a plain prefix test.
fn split_include_roots(value: &str) -> Vec<String> {
    value
        .split(';')
        .filter(|path| !path.is_empty())
        .map(|path| path.to_lowercase())
        .collect()
}

fn is_system_include_path(roots: &[String], path: &str) -> bool {
    let lowered = path.to_lowercase();
    roots.iter().any(|root| lowered.starts_with(root.as_str()))
}

#[cfg(test)]
mod tests {
    use super::{
        is_system_include_path, probe_tool_version_from, split_include_roots, MsvcWrapper,
    };
    use crate::sys::filetracker::TrackingLog;
    use crate::wrappers::ledger::DigestLedger;
    use crate::wrappers::msvc::cmdline::CmdlineParser;
    use crate::wrappers::msvc::version::{ToolVersion, Version};
    use crate::wrappers::{ProgramWrapper, WrapperError};
    use std::fs;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn test_wrapper(argv: &[&str], vc_version: Version) -> MsvcWrapper {
        MsvcWrapper {
            args: args(argv),
            parser: CmdlineParser::default(),
            tool_version: ToolVersion {
                host_arch: "x64".to_string(),
                target_arch: "x64".to_string(),
                vc_version,
            },
            tlog: TrackingLog::disabled(),
            env_include_paths: Vec::new(),
            ledger: DigestLedger::new(),
        }
    }

    fn decline_reason(err: WrapperError) -> String {
        match err {
            WrapperError::Decline(reason) => reason,
            WrapperError::Fatal(err) => panic!("expected a decline, got {err:#}"),
        }
    }

    #[test]
    fn recognizes_the_cl_driver_only() {
        assert!(MsvcWrapper::can_handle(&args(&["cl"])));
        assert!(MsvcWrapper::can_handle(&args(&["CL.EXE"])));
        assert!(MsvcWrapper::can_handle(&args(&[
            "C:\\VC\\Tools\\MSVC\\14.29.30133\\bin\\Hostx64\\x64\\cl.exe"
        ])));
        assert!(!MsvcWrapper::can_handle(&args(&["clang"])));
        assert!(!MsvcWrapper::can_handle(&args(&["gcc"])));
        assert!(!MsvcWrapper::can_handle(&[]));
    }

    #[test]
    fn tool_probe_prefers_the_environment() {
        let tv = probe_tool_version_from(
            "cl.exe",
            Some("x64".to_string()),
            Some("x86".to_string()),
            Some("14.29.30133".to_string()),
        )
        .expect("probe");
        assert_eq!(tv.host_arch, "x64");
        assert_eq!(tv.target_arch, "x86");
        assert_eq!(tv.vc_version, Version::parse("14.29.30133"));
    }

    #[test]
    fn tool_probe_falls_back_to_the_compiler_path() {
        let tv = probe_tool_version_from(
            "C:\\VC\\Tools\\MSVC\\14.29.30133\\bin\\Hostx64\\x86\\cl.exe",
            None,
            None,
            None,
        )
        .expect("probe");
        assert_eq!(tv.host_arch, "x64");
        assert_eq!(tv.target_arch, "x86");
        assert_eq!(tv.vc_version, Version::parse("14.29.30133"));
    }

    #[test]
    fn tool_probe_fails_outside_a_vcvars_layout() {
        assert!(probe_tool_version_from("C:\\bin\\cl.exe", None, None, None).is_err());
        assert!(probe_tool_version_from(
            "cl.exe",
            Some("x64".to_string()),
            Some("x64".to_string()),
            None
        )
        .is_err());
    }

    #[test]
    fn program_id_composition() {
        let wrapper = test_wrapper(&["cl"], Version::parse("14.29.30133"));
        assert_eq!(wrapper.get_program_id(), "1x64x6414.29.30133.0");
    }

    #[test]
    fn declines_chained_link() {
        let mut wrapper = test_wrapper(&["cl", "foo.cpp"], Version::parse("14.29"));
        let reason = decline_reason(wrapper.resolve_args().expect_err("declines"));
        assert!(reason.contains("link"));
    }

    #[test]
    fn declines_shared_pdb() {
        let mut wrapper = test_wrapper(&["cl", "/c", "foo.cpp", "/ZI"], Version::parse("14.29"));
        let reason = decline_reason(wrapper.resolve_args().expect_err("declines"));
        assert!(reason.contains("pdb"));

        let mut wrapper = test_wrapper(&["cl", "/c", "foo.cpp", "/Zi"], Version::parse("14.29"));
        decline_reason(wrapper.resolve_args().expect_err("declines"));
    }

    #[test]
    fn declines_single_object_for_multiple_inputs() {
        let mut wrapper = test_wrapper(
            &["cl", "/c", "a.cpp", "b.cpp", "/Foout.obj"],
            Version::parse("14.29"),
        );
        let reason = decline_reason(wrapper.resolve_args().expect_err("declines"));
        assert!(reason.contains("single object"));
    }

    #[test]
    fn declines_old_toolsets() {
        let mut wrapper = test_wrapper(&["cl", "/c", "foo.cpp"], Version::parse("14.26"));
        let reason = decline_reason(wrapper.resolve_args().expect_err("declines"));
        assert!(reason.contains("14.27"));

        let mut wrapper = test_wrapper(&["cl", "/c", "foo.cpp"], Version::parse("14.27"));
        wrapper.resolve_args().expect("14.27 is supported");
    }

    #[test]
    fn object_path_mapping() {
        let mut wrapper = test_wrapper(&["cl", "/c", "foo.cpp", "/Foout.obj"], Version::parse("14.29"));
        wrapper.resolve_args().expect("resolve");
        let files = wrapper.get_build_files("foo.cpp").expect("files");
        assert_eq!(files.get("object").map(String::as_str), Some("out.obj"));

        // Extension-less object paths get .obj appended.
        let mut wrapper = test_wrapper(&["cl", "/c", "foo.cpp", "/Foout"], Version::parse("14.29"));
        wrapper.resolve_args().expect("resolve");
        let files = wrapper.get_build_files("foo.cpp").expect("files");
        assert_eq!(files.get("object").map(String::as_str), Some("out.obj"));

        // Directory object paths derive the name from the input.
        let mut wrapper = test_wrapper(
            &["cl", "/c", "src\\foo.cpp", "/Foobjs\\"],
            Version::parse("14.29"),
        );
        wrapper.resolve_args().expect("resolve");
        let files = wrapper.get_build_files("src\\foo.cpp").expect("files");
        assert_eq!(
            files.get("object").map(String::as_str),
            Some("objs\\foo.obj")
        );
    }

    #[test]
    fn pch_build_file_uses_the_toolset_default_name() {
        let mut wrapper = test_wrapper(
            &["cl", "/c", "pre.cpp", "/Ycpre.h", "/Fpout\\"],
            Version::parse("14.29.30133"),
        );
        wrapper.resolve_args().expect("resolve");
        let files = wrapper.get_build_files("pre.cpp").expect("files");
        assert_eq!(
            files.get("pch").map(String::as_str),
            Some("out\\vc140.pch")
        );
    }

    #[test]
    fn system_include_filter_is_case_insensitive() {
        let roots = split_include_roots("C:\\Sys\\Include;D:\\Kits\\10;;");
        assert_eq!(roots, vec!["c:\\sys\\include", "d:\\kits\\10"]);
        assert!(is_system_include_path(&roots, "c:\\sys\\include\\stdio.h"));
        assert!(is_system_include_path(&roots, "C:\\SYS\\INCLUDE\\STDIO.H"));
        assert!(is_system_include_path(&roots, "d:\\kits\\10\\um\\windows.h"));
        assert!(!is_system_include_path(&roots, "d:\\src\\project\\app.h"));
        assert!(!is_system_include_path(&[], "c:\\anything.h"));
    }

    #[test]
    fn hit_filter_verifies_recorded_digests() {
        use crate::cache::entry::{CacheEntry, CompressionMode};
        use crate::hasher::hash_bytes;
        use std::collections::BTreeMap;

        let dir = tempfile::tempdir().expect("tempdir");
        let header = dir.path().join("x.h");
        fs::write(&header, b"#define X 1\n").expect("write header");
        let header_path = header.to_str().expect("utf-8").to_string();

        let entry = |digest| CacheEntry {
            file_ids: vec![],
            dependencies: BTreeMap::from([(header_path.clone(), digest)]),
            compression: CompressionMode::None,
            std_out: String::new(),
            std_err: String::new(),
            return_code: 0,
        };

        let mut wrapper = test_wrapper(&["cl"], Version::parse("14.29"));
        assert!(wrapper.filter_cache_hit(&entry(hash_bytes(b"#define X 1\n"))));

        let mut wrapper = test_wrapper(&["cl"], Version::parse("14.29"));
        assert!(!wrapper.filter_cache_hit(&entry(hash_bytes(b"#define X 2\n"))));

        fs::remove_file(&header).expect("remove header");
        let mut wrapper = test_wrapper(&["cl"], Version::parse("14.29"));
        assert!(
            !wrapper.filter_cache_hit(&entry(hash_bytes(b"#define X 1\n"))),
            "a missing dependency is a miss, not an error"
        );
    }

    #[test]
    fn hit_filter_consults_the_ledger_before_disk() {
        use crate::cache::entry::{CacheEntry, CompressionMode};
        use crate::hasher::hash_bytes;
        use std::collections::BTreeMap;

        let digest = hash_bytes(b"ledger wins");
        let mut wrapper = test_wrapper(&["cl"], Version::parse("14.29"));
        wrapper.ledger.set("Z:\\never\\on\\disk.h", digest);
        let entry = CacheEntry {
            file_ids: vec![],
            dependencies: BTreeMap::from([("Z:\\never\\on\\disk.h".to_string(), digest)]),
            compression: CompressionMode::None,
            std_out: String::new(),
            std_err: String::new(),
            return_code: 0,
        };
        assert!(wrapper.filter_cache_hit(&entry));
    }
}
