// Purpose: Run child processes for the wrapper, with captured or inherited stdio.
// Inputs/Outputs: Spawns the wrapped compiler and returns its output and exit code.
// Invariants: Captured runs must scrub injected command-line environment variables.
// Gotchas: cl.exe folds CL/_CL_ into its command line and redirects output via VS_UNICODE_OUTPUT.

use anyhow::Context;
use std::io::Write;
use std::process::Command;

/// Variables removed from a captured child's environment. The caller is
/// expected to have folded CL/_CL_ into the argument list already, and
/// VS_UNICODE_OUTPUT would bypass our stdio capture entirely.
pub const SCRUBBED_ENV_VARS: &[&str] = &["CL", "_CL_", "VS_UNICODE_OUTPUT"];

#[derive(Debug, Clone)]
pub struct RunResult {
    pub std_out: String,
    pub std_err: String,
    pub return_code: i32,
}

/// Runs a program with captured stdio. When not quiet, the captured output
/// is replayed on the wrapper's own streams.
pub fn run(program: &str, args: &[String], quiet: bool) -> anyhow::Result<RunResult> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    for var in SCRUBBED_ENV_VARS {
        cmd.env_remove(var);
    }
    let out = cmd
        .output()
        .with_context(|| format!("failed to execute {}", program))?;
    let result = RunResult {
        std_out: String::from_utf8_lossy(&out.stdout).into_owned(),
        std_err: String::from_utf8_lossy(&out.stderr).into_owned(),
        return_code: out.status.code().unwrap_or(-1),
    };
    if !quiet {
        print!("{}", result.std_out);
        eprint!("{}", result.std_err);
        let _ = std::io::stdout().flush();
    }
    Ok(result)
}

/// Runs a program with inherited stdio, for the uncached fall-through path.
/// The environment is left untouched so the real program sees CL/_CL_.
pub fn run_passthrough(program: &str, args: &[String]) -> anyhow::Result<i32> {
    let status = Command::new(program)
        .args(args)
        .status()
        .with_context(|| format!("failed to execute {}", program))?;
    Ok(status.code().unwrap_or(-1))
}
