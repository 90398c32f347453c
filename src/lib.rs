//! Purpose: Library crate behind the `epkit` CLI and its tests.
//! Exports: `core` (artifact generation, loading, packaging, errors) and `notice`.
//! Role: Loads execution-provider plugins by explicit path and packages them with their host library.
//! Invariants: All OS dynamic-loading calls go through `core::resolver::LibraryResolver`.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod core;
pub mod notice;
