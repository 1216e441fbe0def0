//! DEEPGLASS — host forensic scanner for persistence, sideloading, and
//! in-memory tampering.
//!
//! Four engines cross-reference three authoritative views of code on a
//! host — the configuration store, the filesystem, and live processes —
//! against code-signing state and on-disk ground truth:
//! 1. **Registry reference extractor** — recursive hive walk joining
//!    extracted file references with signing results
//! 2. **Filesystem sweeper** — search-path and side-by-side store sweeps
//! 3. **Handle-name resolver** — watchdog-protected system handle naming
//! 4. **Image consistency checker** — byte-level comparison of mapped
//!    images against their backing files

pub mod core;
pub mod handles;
pub mod memory;
pub mod pe;
pub mod platform;
pub mod pool;
pub mod registry;
pub mod report;
pub mod scan;
pub mod sweep;

#[cfg(test)]
pub(crate) mod testutil;
