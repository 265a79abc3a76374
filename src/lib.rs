// Purpose: Define crate-level module surface for the compiler-cache wrapper.
// Inputs/Outputs: Re-exports internal modules for the binary and integration tests.
// Invariants: Public module boundaries should remain stable for internal callers.
// Gotchas: Keep module wiring consistent with the src/main.rs entry path.

pub mod cache;
pub mod cli;
pub mod config;
pub mod hasher;
pub mod path_utils;
pub mod sys;
pub mod trace;
pub mod wrappers;
