//! Recursive registry reference walker and its signing join (engine 1).
//!
//! The walk is depth-first with a pool task per subkey. Two shared
//! structures are guarded by independent locks: the found-map of extracted
//! references and the visited-key set. No lock is held while a value is
//! being parsed.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::errors::Result;
use crate::core::paths::resolve_reference;
use crate::registry::extract::find_referenced_files;
use crate::scan::{Evidence, FoundMap, ScanContext};
use crate::report::ReportKind;

/// Walk the given root containers, join the references with signing state,
/// write the missing/unsigned reports, and feed unsigned paths into the
/// suspect set.
pub fn run_registry_scan(ctx: &ScanContext, roots: &[String]) -> Result<()> {
    eprintln!("[DG-REG] beginning the registry scan");

    let found = Arc::new(FoundMap::default());
    let visited = Arc::new(Mutex::new(HashSet::new()));
    for root in roots {
        enqueue_walk(ctx, &found, &visited, root.clone());
    }
    ctx.pool.wait_idle();

    eprintln!(
        "[DG-REG] gathered {} path-like references; checking signatures",
        found.len()
    );
    join_with_signing(ctx, &found);
    Ok(())
}

fn enqueue_walk(
    ctx: &ScanContext,
    found: &Arc<FoundMap>,
    visited: &Arc<Mutex<HashSet<String>>>,
    key: String,
) {
    let ctx_task = ctx.clone();
    let found = Arc::clone(found);
    let visited = Arc::clone(visited);
    ctx.pool.submit(move || {
        walk_key(&ctx_task, &found, &visited, &key);
    });
}

fn walk_key(
    ctx: &ScanContext,
    found: &Arc<FoundMap>,
    visited: &Arc<Mutex<HashSet<String>>>,
    key: &str,
) {
    // Check-and-insert is one atomic step; a key is walked at most once
    // even when two parents race to enqueue it.
    if !visited.lock().insert(key.to_string()) {
        return;
    }

    let values = match ctx.sources.hive.enumerate_values(key) {
        Ok(values) => values,
        Err(err) => {
            eprintln!("[DG-REG] cannot enumerate values of {key}: {err}");
            Vec::new()
        }
    };
    for value in values {
        for reference in find_referenced_files(&value) {
            found.add(&reference, Evidence::Value(value.clone()));
        }
    }

    match ctx.sources.hive.enumerate_subkeys(key) {
        Ok(subkeys) => {
            for subkey in subkeys {
                enqueue_walk(ctx, found, visited, subkey);
            }
        }
        Err(err) => eprintln!("[DG-REG] cannot enumerate subkeys of {key}: {err}"),
    }
}

/// Resolve every found reference in parallel; unresolvable ones go to the
/// missing report, unsigned ones to the unsigned report and the suspect
/// set.
fn join_with_signing(ctx: &ScanContext, found: &FoundMap) {
    let not_signed = Arc::new(Mutex::new(Vec::new()));
    let not_found = Arc::new(Mutex::new(Vec::new()));

    let mut promises = Vec::new();
    for (path, evidence) in found.snapshot() {
        let verifier = Arc::clone(&ctx.sources.verifier);
        let not_signed = Arc::clone(&not_signed);
        let not_found = Arc::clone(&not_found);
        promises.push(ctx.pool.submit_promise(move || {
            match resolve_reference(&path) {
                Some(file) => {
                    if !verifier.is_signed(&file) {
                        not_signed.lock().push((path, evidence));
                    }
                }
                None => not_found.lock().push((path, evidence)),
            }
        }));
    }
    for promise in promises {
        if let Err(err) = promise.wait() {
            eprintln!("[DG-REG] signing-join task failed: {err}");
        }
    }

    let missing_report = ctx.reports.stream(ReportKind::RegistryMissing);
    for (path, evidence) in not_found.lock().iter() {
        missing_report.group(
            &format!("File {path} not found; referenced by:"),
            citations(evidence),
        );
    }

    let unsigned_report = ctx.reports.stream(ReportKind::RegistryUnsigned);
    for (path, evidence) in not_signed.lock().iter() {
        unsigned_report.group(
            &format!("File {path} is unsigned; referenced by:"),
            citations(evidence),
        );
        ctx.suspects.insert(path.clone());
    }
}

fn citations(evidence: &[Evidence]) -> Vec<String> {
    evidence
        .iter()
        .map(|item| match item {
            Evidence::Value(value) => format!("{}: {}", value.key, value.printable_name()),
            Evidence::Process(pid) => format!("Process with PID {pid}"),
        })
        .collect()
}
