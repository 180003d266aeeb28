//! Tripwire: provenance logging, content hashing, drift detection.

pub mod drift;
pub mod eventlog;
pub mod hasher;
