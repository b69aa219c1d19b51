//! Thin, typed wrappers around the external sparse/filesystem codec tools.
//! No binary format is parsed in-process — see the Non-goals in `SPEC_FULL.md`.

pub mod filesystem;
pub mod sparse;
