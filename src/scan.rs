//! Shared scan state and the sequential engine driver.
//!
//! The four engines run one after another over a shared worker pool; each
//! contributes case-folded paths to the single [`SuspectSet`] that later
//! engines cross-reference.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::config::ScanConfig;
use crate::core::errors::Result;
use crate::core::paths::expand_env;
use crate::platform::Sources;
use crate::pool::WorkerPool;
use crate::registry::{MACHINE_ROOT, RegistryValue, USERS_ROOT};
use crate::report::{EventType, ReportSet, Severity};

/// A citation tying a suspect path to where it was observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evidence {
    /// A registry value whose data references the path.
    Value(RegistryValue),
    /// A process observed using the path.
    Process(u32),
}

/// The run-wide deduplicated set of files that failed signing. Insert-only;
/// every path is case-folded before insertion.
#[derive(Default)]
pub struct SuspectSet {
    inner: Mutex<HashSet<String>>,
}

impl SuspectSet {
    /// Insert a case-folded path. Returns whether the path was new.
    pub fn insert(&self, folded_path: String) -> bool {
        debug_assert_eq!(
            folded_path,
            crate::core::paths::fold_path(&folded_path),
            "suspect paths must be case-folded before insertion"
        );
        self.inner.lock().insert(folded_path)
    }

    #[must_use]
    pub fn contains(&self, folded_path: &str) -> bool {
        self.inner.lock().contains(folded_path)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Copy the current contents out, insertion-order-insensitive.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.inner.lock().iter().cloned().collect();
        paths.sort();
        paths
    }
}

/// Per-engine mapping from a found path to the evidence citing it. Grows
/// monotonically inside one engine and is discarded afterwards.
#[derive(Default)]
pub struct FoundMap {
    inner: Mutex<HashMap<String, Vec<Evidence>>>,
}

impl FoundMap {
    /// Append evidence for a path, ignoring exact `(path, evidence)`
    /// duplicates.
    pub fn add(&self, folded_path: &str, evidence: Evidence) {
        let mut inner = self.inner.lock();
        let entries = inner.entry(folded_path.to_string()).or_default();
        if !entries.contains(&evidence) {
            entries.push(evidence);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Copy the map out for the join phase.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, Vec<Evidence>> {
        self.inner.lock().clone()
    }
}

/// Shared context handed to every engine.
#[derive(Clone)]
pub struct ScanContext {
    /// The run's worker pool; engines barrier on it between phases.
    pub pool: WorkerPool,
    /// Accumulated unsigned-file paths.
    pub suspects: Arc<SuspectSet>,
    /// Report streams and the scan log.
    pub reports: Arc<ReportSet>,
    /// Platform access: hive, signing, processes, handles.
    pub sources: Sources,
}

impl ScanContext {
    #[must_use]
    pub fn new(pool: WorkerPool, reports: Arc<ReportSet>, sources: Sources) -> Self {
        Self {
            pool,
            suspects: Arc::new(SuspectSet::default()),
            reports,
            sources,
        }
    }
}

/// Counters surfaced to the CLI after a run.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScanSummary {
    pub registry_suspects: usize,
    pub filesystem_suspects: usize,
    pub process_suspects: usize,
    pub inconsistent_images: usize,
    pub total_suspects: usize,
}

/// Run every enabled engine in sequence and collect the suspects.
///
/// Engine failures are logged and skipped; later engines run on whatever
/// suspect set exists. Only results-directory initialization (done by the
/// caller) is fatal.
pub fn run_scan(config: &ScanConfig, reports: Arc<ReportSet>, sources: Sources) -> Result<ScanSummary> {
    let pool = WorkerPool::new(config.effective_workers());
    let ctx = ScanContext::new(pool, reports, sources);
    let log = Arc::clone(&ctx.reports);
    let mut summary = ScanSummary::default();

    log.log()
        .event(EventType::ScanStart, Severity::Info, None, None, None);

    if config.engines.registry {
        run_engine(&ctx, "registry", &mut summary.registry_suspects, |ctx| {
            crate::registry::walker::run_registry_scan(
                ctx,
                &[MACHINE_ROOT.to_string(), USERS_ROOT.to_string()],
            )
        });
    }

    if config.engines.filesystem {
        let sxs_root = config.sxs_root.clone().unwrap_or_else(|| {
            std::path::PathBuf::from(expand_env("%SystemRoot%\\WinSxS"))
        });
        run_engine(&ctx, "filesystem", &mut summary.filesystem_suspects, |ctx| {
            crate::sweep::run_file_scan(ctx, &sxs_root)
        });
    }

    if config.engines.handles {
        let timeout = std::time::Duration::from_millis(config.resolver_timeout_ms);
        run_engine(&ctx, "process", &mut summary.process_suspects, |ctx| {
            crate::handles::run_process_scan(ctx, timeout)
        });
    }

    if config.engines.memory {
        let before = ctx.suspects.len();
        match crate::memory::run_consistency_checks(&ctx) {
            Ok(inconsistent) => {
                summary.inconsistent_images = inconsistent;
                ctx.reports.log().event(
                    EventType::EngineComplete,
                    Severity::Info,
                    Some("consistency"),
                    Some(ctx.suspects.len() - before),
                    None,
                );
            }
            Err(err) => engine_failed(&ctx, "consistency", &err),
        }
    }

    if config.collect_files {
        let suspects = ctx.suspects.snapshot();
        crate::report::collect::collect_suspects(
            &ctx.reports,
            suspects.iter().map(String::as_str),
        );
    }

    summary.total_suspects = ctx.suspects.len();
    ctx.reports.log().event(
        EventType::ScanComplete,
        Severity::Info,
        None,
        Some(summary.total_suspects),
        None,
    );
    ctx.reports.flush_all();
    Ok(summary)
}

fn run_engine(
    ctx: &ScanContext,
    name: &'static str,
    contribution: &mut usize,
    body: impl FnOnce(&ScanContext) -> Result<()>,
) {
    let before = ctx.suspects.len();
    ctx.reports
        .log()
        .event(EventType::EngineStart, Severity::Info, Some(name), None, None);
    match body(ctx) {
        Ok(()) => {
            *contribution = ctx.suspects.len() - before;
            ctx.reports.log().event(
                EventType::EngineComplete,
                Severity::Info,
                Some(name),
                Some(*contribution),
                None,
            );
        }
        Err(err) => engine_failed(ctx, name, &err),
    }
}

fn engine_failed(ctx: &ScanContext, name: &str, err: &crate::core::errors::GlassError) {
    eprintln!("[DG-SCAN] {name} engine failed: {err}");
    ctx.reports.log().event(
        EventType::Diagnostic,
        Severity::Error,
        Some(name),
        None,
        Some(&err.to_string()),
    );
}
