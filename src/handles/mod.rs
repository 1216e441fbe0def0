//! Process-facing scans (engine 3): loaded modules and the system handle
//! table.
//!
//! The module sweep joins every loaded module path with the PE + signing
//! filter. The handle sweep names every handle in the system table through
//! the watchdog resolver, rewrites kernel device prefixes to drive
//! letters, cross-references the accumulated suspect set, and then runs
//! the same signing join.

pub mod resolver;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::core::errors::Result;
use crate::core::paths::fold_path;
use crate::pe::is_filetype_pe;
use crate::report::ReportKind;
use crate::scan::{Evidence, FoundMap, ScanContext};

use self::resolver::NameResolver;

/// Run the module sweep, then the handle-table sweep.
pub fn run_process_scan(ctx: &ScanContext, resolver_timeout: Duration) -> Result<()> {
    scan_loaded_modules(ctx);
    scan_handle_tables(ctx, resolver_timeout);
    Ok(())
}

/// Enumerate every process's loaded modules in parallel and join them with
/// the signing filter.
fn scan_loaded_modules(ctx: &ScanContext) {
    eprintln!("[DG-PROC] scanning modules loaded into processes");

    let found = Arc::new(FoundMap::default());
    let mut promises = Vec::new();
    for pid in ctx.sources.processes.processes() {
        let processes = Arc::clone(&ctx.sources.processes);
        let found = Arc::clone(&found);
        promises.push(ctx.pool.submit_promise(move || {
            for module in processes.modules(pid) {
                found.add(&fold_path(&module), Evidence::Process(pid));
            }
        }));
    }
    for promise in promises {
        if let Err(err) = promise.wait() {
            eprintln!("[DG-PROC] module enumeration task failed: {err}");
        }
    }

    scan_files_with_pids(ctx, &found, ReportKind::UnsignedModules);
}

/// Name every handle in the system table, cross-reference known suspects,
/// then feed the named files through the signing join.
fn scan_handle_tables(ctx: &ScanContext, resolver_timeout: Duration) {
    eprintln!("[DG-PROC] scanning handles");

    let found = enumerate_handles(ctx, resolver_timeout);

    let open_report = ctx.reports.stream(ReportKind::OpenHandles);
    for suspect in ctx.suspects.snapshot() {
        if let Some(pids) = owning_pids(&found, &suspect) {
            open_report.group(
                &format!(
                    "Previously identified file {suspect} found as an open handle in these processes:"
                ),
                pids.iter().map(|pid| process_citation(ctx, *pid)),
            );
        }
    }

    scan_files_with_pids(ctx, &found, ReportKind::UnsignedHandles);
}

/// Snapshot the handle table and resolve each entry to a drive-letter
/// path. Handles whose names cannot be resolved within the deadline are
/// silently absent from the result.
fn enumerate_handles(ctx: &ScanContext, resolver_timeout: Duration) -> FoundMap {
    let found = FoundMap::default();

    let entries = match ctx.sources.handles.snapshot() {
        Ok(entries) => entries,
        Err(err) => {
            eprintln!("[DG-PROC] failed to retrieve the system handle table: {err}");
            return found;
        }
    };

    let translation = ctx.sources.handles.drive_prefixes();
    if translation.is_empty() {
        eprintln!("[DG-PROC] no device-to-drive translations available");
    }

    // One resolver, one in-flight query; the enumeration loop is the only
    // caller, so serialization holds by construction.
    let mut resolver = NameResolver::new(ctx.sources.handles.name_query(), resolver_timeout);

    for entry in entries {
        let Some(duplicate) = ctx.sources.handles.duplicate(entry.pid, entry.handle) else {
            continue;
        };
        let name = resolver.resolve(duplicate.raw());
        drop(duplicate);
        let Some(name) = name else {
            continue;
        };
        for (prefix, drive) in &translation {
            if let Some(rest) = name.strip_prefix(prefix.as_str()) {
                let dos_path = fold_path(&format!("{drive}{rest}"));
                found.add(&dos_path, Evidence::Process(entry.pid));
            }
        }
    }

    found
}

/// Parallel PE + signing join over a path → owning-PIDs map. Unsigned PEs
/// enter the suspect set and are reported with their owning processes.
fn scan_files_with_pids(ctx: &ScanContext, found: &FoundMap, kind: ReportKind) {
    let report = ctx.reports.stream(kind);
    let mut promises = Vec::new();
    for (path, evidence) in found.snapshot() {
        let ctx_task = ctx.clone();
        let report = Arc::clone(&report);
        promises.push(ctx.pool.submit_promise(move || {
            if is_filetype_pe(&path)
                && !ctx_task.sources.verifier.is_signed(Path::new(&path))
            {
                let pids: BTreeSet<u32> = evidence
                    .iter()
                    .filter_map(|item| match item {
                        Evidence::Process(pid) => Some(*pid),
                        Evidence::Value(_) => None,
                    })
                    .collect();
                report.group(
                    &format!("File {path} is unsigned. Open in these processes:"),
                    pids.iter().map(|pid| process_citation(&ctx_task, *pid)),
                );
                ctx_task.suspects.insert(path);
            }
        }));
    }
    for promise in promises {
        if let Err(err) = promise.wait() {
            eprintln!("[DG-PROC] signing join task failed: {err}");
        }
    }
}

fn owning_pids(found: &FoundMap, path: &str) -> Option<BTreeSet<u32>> {
    let snapshot = found.snapshot();
    let evidence = snapshot.get(path)?;
    Some(
        evidence
            .iter()
            .filter_map(|item| match item {
                Evidence::Process(pid) => Some(*pid),
                Evidence::Value(_) => None,
            })
            .collect(),
    )
}

fn process_citation(ctx: &ScanContext, pid: u32) -> String {
    match ctx.sources.processes.image_name(pid) {
        Some(image) => format!("Process with PID {pid} (Name: {image})"),
        None => format!("Process with PID {pid}"),
    }
}
