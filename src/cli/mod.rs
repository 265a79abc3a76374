// Purpose: Bootstrap the wrapper: dispatch to the cache pipeline or fall through.
// Inputs/Outputs: Consumes the wrapped command line; returns the process exit code.
// Invariants: A decline must be invisible to the caller: the real compiler runs with
// identical arguments and its exit code is surfaced unchanged.
// Gotchas: Tracking suspension is process-wide; resume exactly once on every path.

use crate::cache::local::LocalCache;
use crate::sys::{filetracker, proc};
use crate::trace::trace;
use crate::wrappers::msvc::MsvcWrapper;
use crate::wrappers::{self, WrapperError};

pub fn run_cli<I>(args: I) -> i32
where
    I: IntoIterator<Item = String>,
{
    let args: Vec<String> = args.into_iter().collect();
    if args.is_empty() {
        print_usage();
        return 1;
    }
    // Our own file accesses must stay invisible to any FileTracker
    // instrumentation attached by the surrounding build.
    filetracker::suspend_tracking();
    let code = dispatch(&args);
    filetracker::resume_tracking();
    code
}

fn dispatch(args: &[String]) -> i32 {
    match try_wrap(args) {
        Ok(code) => code,
        Err(WrapperError::Decline(reason)) => {
            trace(&format!("not cached ({}); running {} directly", reason, args[0]));
            fall_through(args)
        }
        Err(WrapperError::Fatal(err)) => {
            eprintln!("objcache: error: {:#}", err);
            1
        }
    }
}

fn try_wrap(args: &[String]) -> Result<i32, WrapperError> {
    if !MsvcWrapper::can_handle(args) {
        return Err(WrapperError::Decline("unknown driver".to_string()));
    }
    let mut wrapper = MsvcWrapper::new(args.to_vec())?;
    let cache = LocalCache::open().map_err(WrapperError::Fatal)?;
    wrappers::handle_command(&mut wrapper, &cache)
}

fn fall_through(args: &[String]) -> i32 {
    // The real compiler's file I/O must be visible to MSBuild's tracker.
    filetracker::release_suppression();
    match proc::run_passthrough(&args[0], &args[1..]) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("objcache: failed to run {}: {:#}", args[0], err);
            1
        }
    }
}

fn print_usage() {
    eprintln!("usage: objcache <compiler> [compiler args...]");
    eprintln!("example: objcache cl.exe /c /Z7 main.cpp");
}
