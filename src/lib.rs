//! Formulary: declarative package build and install descriptors.
//!
//! A catalog describes how to fetch, build, and install each package
//! revision. The interpreter runs one descriptor through
//! fetch → build → install, hashes what it wrote with BLAKE3, and keeps a
//! receipt plus a provenance log so later runs can detect drift.

pub mod cli;
pub mod core;
pub mod exec;
pub mod fetch;
pub mod tripwire;
