// Purpose: Provide the binary entry for the compiler-cache wrapper.
// Inputs/Outputs: Reads process args and returns the process exit code from the CLI dispatcher.
// Invariants: Main must not bypass centralized CLI argument handling.
// Gotchas: The exit code must mirror the wrapped compiler's code exactly.

fn main() {
    let code = objcache::cli::run_cli(std::env::args().skip(1));
    std::process::exit(code);
}
