//! Configuration system: TOML file + smart defaults.

#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{GlassError, Result};

/// Full scan configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScanConfig {
    /// Directory the reports, scan log, and collected files are written to.
    pub output_dir: PathBuf,
    /// Worker-thread count for the shared pool. Zero means "number of CPUs".
    pub worker_threads: usize,
    /// Hard deadline for a single handle-name query.
    pub resolver_timeout_ms: u64,
    /// Engine toggles.
    pub engines: EngineToggles,
    /// Override for the side-by-side component store root. When unset the
    /// sweep expands `%SystemRoot%\WinSxS`.
    pub sxs_root: Option<PathBuf>,
    /// Copy unsigned suspects into `<output_dir>/Files` after the run.
    pub collect_files: bool,
}

/// Per-engine enable switches. All engines run by default; disabling one
/// simply removes its contribution to the suspect set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineToggles {
    pub registry: bool,
    pub filesystem: bool,
    pub handles: bool,
    pub memory: bool,
}

impl Default for EngineToggles {
    fn default() -> Self {
        Self {
            registry: true,
            filesystem: true,
            handles: true,
            memory: true,
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("DEEPGLASS-Results"),
            worker_threads: 0,
            resolver_timeout_ms: 250,
            engines: EngineToggles::default(),
            sxs_root: None,
            collect_files: true,
        }
    }
}

impl ScanConfig {
    /// Load from a TOML file, failing on unknown syntax but filling every
    /// missing field with its default.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|source| GlassError::io(path, source))?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations no scan can honor.
    pub fn validate(&self) -> Result<()> {
        if self.resolver_timeout_ms == 0 {
            return Err(GlassError::InvalidConfig {
                details: "resolver_timeout_ms must be nonzero".to_string(),
            });
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(GlassError::InvalidConfig {
                details: "output_dir must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Effective pool size after resolving the zero = "CPU count" convention.
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        if self.worker_threads == 0 {
            std::thread::available_parallelism().map_or(4, std::num::NonZero::get)
        } else {
            self.worker_threads
        }
    }
}
