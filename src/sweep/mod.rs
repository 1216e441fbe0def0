//! Filesystem sweeper (engine 2): a shallow sweep of the search-path
//! directories and a deep parallel sweep of the side-by-side component
//! store.
//!
//! Search-path directories are where sideloading pays off, so every file
//! there is interesting; the component store is too large for that, so the
//! deep sweep filters to unsigned PEs as it walks.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::errors::Result;
use crate::core::paths::{expand_env, fold_path, split_search_path};
use crate::pe::{is_filetype_pe, is_pe_file};
use crate::report::ReportKind;
use crate::scan::ScanContext;

/// Directories always swept regardless of `PATH` contents.
const FALLBACK_LOCATIONS: [&str; 9] = [
    "C:\\",
    "%SystemRoot%",
    "%SystemRoot%\\System",
    "%SystemRoot%\\System32",
    "%SystemRoot%\\System32\\Wbem",
    "%SystemRoot%\\System32\\WindowsPowerShell\\v1.0",
    "%SystemRoot%\\SysWOW64",
    "%SystemRoot%\\SysWOW64\\Wbem",
    "%SystemRoot%\\SysWOW64\\WindowsPowerShell\\v1.0",
];

/// Run both sub-sweeps: shallow over the search-path directories, deep over
/// the component store rooted at `sxs_root`.
pub fn run_file_scan(ctx: &ScanContext, sxs_root: &Path) -> Result<()> {
    run_path_sweep(ctx);
    run_sxs_sweep(ctx, sxs_root);
    Ok(())
}

/// Shallow sweep of the `PATH` directories plus the fixed fallback set.
pub fn run_path_sweep(ctx: &ScanContext) {
    eprintln!("[DG-FS] scanning search-path directories for unsigned files");
    let locations = path_sweep_locations(std::env::var("PATH").ok().as_deref());
    let files = collect_shallow(&locations);
    scan_files(ctx, files, ReportKind::PathUnsigned, true);
}

/// Deep parallel sweep of the component store rooted at `sxs_root`.
pub fn run_sxs_sweep(ctx: &ScanContext, sxs_root: &Path) {
    eprintln!("[DG-FS] scanning {} for sideloading files", sxs_root.display());
    let sxs_files = collect_sxs(ctx, sxs_root);
    scan_files(ctx, sxs_files, ReportKind::SxsUnsigned, false);
}

/// The sweep's directory list: the `PATH` entries split on `;`, the fixed
/// fallback set, and a `syswow64` mirror of every entry mentioning
/// `system32`.
#[must_use]
pub fn path_sweep_locations(path_var: Option<&str>) -> HashSet<String> {
    let mut locations: HashSet<String> = FALLBACK_LOCATIONS
        .iter()
        .map(|loc| (*loc).to_string())
        .collect();
    if let Some(path_var) = path_var {
        for entry in split_search_path(path_var) {
            let lower = fold_path(&entry);
            if lower.contains("system32") {
                locations.insert(lower.replace("system32", "syswow64"));
            }
            locations.insert(entry);
        }
    }
    locations
}

/// Enumerate the immediate file children of each location, case-folded, no
/// PE pre-filter. Missing or unreadable directories contribute nothing.
fn collect_shallow(locations: &HashSet<String>) -> HashSet<String> {
    let mut files = HashSet::new();
    for location in locations {
        let directory = PathBuf::from(expand_env(location));
        let Ok(entries) = fs::read_dir(&directory) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                continue;
            }
            files.insert(fold_path(&entry.path().to_string_lossy()));
        }
    }
    files
}

/// Deep parallel walk of the component store: a pool task per subdirectory,
/// and a synchronous PE + signing check per file. Only unsigned PEs come
/// back.
fn collect_sxs(ctx: &ScanContext, root: &Path) -> HashSet<String> {
    let results = Arc::new(Mutex::new(HashSet::new()));
    sweep_folder(ctx, root.to_path_buf(), &results);
    ctx.pool.wait_idle();
    Arc::try_unwrap(results)
        .map_or_else(|shared| shared.lock().clone(), Mutex::into_inner)
}

fn sweep_folder(ctx: &ScanContext, folder: PathBuf, results: &Arc<Mutex<HashSet<String>>>) {
    let Ok(entries) = fs::read_dir(&folder) else {
        return;
    };
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let path = entry.path();
        if file_type.is_dir() {
            let ctx_task = ctx.clone();
            let results = Arc::clone(results);
            ctx.pool.submit(move || {
                sweep_folder(&ctx_task, path, &results);
            });
        } else if is_pe_file(&path) && !ctx.sources.verifier.is_signed(&path) {
            results.lock().insert(fold_path(&path.to_string_lossy()));
        }
    }
}

/// Feed a file set into the suspect set and the given report. With `check`
/// set, each file first goes through the PE + signing filter in parallel;
/// without it the set is taken as pre-filtered.
fn scan_files(ctx: &ScanContext, files: HashSet<String>, kind: ReportKind, check: bool) {
    let report = ctx.reports.stream(kind);
    if check {
        let mut promises = Vec::new();
        for file in files {
            let verifier = Arc::clone(&ctx.sources.verifier);
            let suspects = Arc::clone(&ctx.suspects);
            let report = Arc::clone(&report);
            promises.push(ctx.pool.submit_promise(move || {
                if is_filetype_pe(&file) && !verifier.is_signed(Path::new(&file)) {
                    report.line(&format!("File {file} is unsigned"));
                    suspects.insert(file);
                }
            }));
        }
        for promise in promises {
            if let Err(err) = promise.wait() {
                eprintln!("[DG-FS] file check task failed: {err}");
            }
        }
    } else {
        for file in files {
            report.line(&format!("File {file} is unsigned"));
            ctx.suspects.insert(file);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use crate::platform::Sources;
    use crate::pool::WorkerPool;
    use crate::report::ReportSet;
    use crate::scan::ScanContext;
    use crate::testutil::{EmptyHive, LowercaseTmp, NoHandles, NoProcesses, NothingSigned, UnsignedList};

    fn test_context(verifier: Arc<dyn crate::platform::SignatureVerifier>) -> ScanContext {
        ScanContext::new(
            WorkerPool::new(4),
            Arc::new(ReportSet::sink()),
            Sources {
                hive: Arc::new(EmptyHive),
                verifier,
                processes: Arc::new(NoProcesses),
                handles: Arc::new(NoHandles),
            },
        )
    }

    #[test]
    fn locations_include_fallbacks_and_path_entries() {
        let locations = path_sweep_locations(Some("C:\\bin;D:\\tools"));
        assert!(locations.contains("C:\\bin"));
        assert!(locations.contains("D:\\tools"));
        assert!(locations.contains("%SystemRoot%\\System32"));
        assert!(locations.contains("C:\\"));
    }

    #[test]
    fn system32_entries_are_mirrored_to_syswow64() {
        let locations = path_sweep_locations(Some("C:\\Windows\\System32\\OpenSSH"));
        assert!(locations.contains("C:\\Windows\\System32\\OpenSSH"));
        assert!(locations.contains("c:\\windows\\syswow64\\openssh"));
    }

    #[test]
    fn no_path_variable_still_yields_fallbacks() {
        let locations = path_sweep_locations(None);
        assert_eq!(locations.len(), FALLBACK_LOCATIONS.len());
    }

    #[test]
    fn shallow_collection_skips_directories() {
        let tmp = LowercaseTmp::new("sweep-shallow");
        fs::write(tmp.path().join("a.exe"), b"x").unwrap();
        fs::write(tmp.path().join("b.txt"), b"y").unwrap();
        fs::create_dir(tmp.path().join("subdir")).unwrap();

        let mut locations = HashSet::new();
        locations.insert(tmp.path().to_string_lossy().to_string());
        let files = collect_shallow(&locations);

        assert_eq!(files.len(), 2, "{files:?}");
        assert!(files.contains(&tmp.path().join("a.exe").to_string_lossy().to_string()));
        assert!(!files
            .iter()
            .any(|file| file.contains("subdir")));
    }

    #[test]
    fn deep_sweep_finds_unsigned_pes_recursively() {
        let tmp = LowercaseTmp::new("sweep-deep");
        let nested = tmp.path().join("x86_microsoft-windows").join("v1");
        fs::create_dir_all(&nested).unwrap();
        let payload = nested.join("sideload.dll");
        fs::write(&payload, crate::pe::testing::probe_bytes()).unwrap();
        fs::write(nested.join("manifest.xml"), b"<assembly/>").unwrap();

        let ctx = test_context(Arc::new(NothingSigned));
        run_sxs_sweep(&ctx, tmp.path());

        assert!(ctx
            .suspects
            .contains(&payload.to_string_lossy().to_lowercase()));
        // The XML manifest is not a PE and must not become a suspect.
        assert!(!ctx
            .suspects
            .contains(&nested.join("manifest.xml").to_string_lossy().to_lowercase()));
    }

    #[test]
    fn deep_sweep_skips_signed_pes() {
        let tmp = LowercaseTmp::new("sweep-signed");
        let signed = tmp.path().join("trusted.dll");
        let unsigned = tmp.path().join("rogue.dll");
        fs::write(&signed, crate::pe::testing::probe_bytes()).unwrap();
        fs::write(&unsigned, crate::pe::testing::probe_bytes()).unwrap();

        let unsigned_folded = unsigned.to_string_lossy().to_lowercase();
        let ctx = test_context(Arc::new(UnsignedList(vec![unsigned_folded.clone()])));
        run_sxs_sweep(&ctx, tmp.path());

        assert!(ctx.suspects.contains(&unsigned_folded));
        assert!(!ctx
            .suspects
            .contains(&signed.to_string_lossy().to_lowercase()));
    }

    #[test]
    fn missing_sxs_root_is_harmless() {
        let ctx = test_context(Arc::new(NothingSigned));
        run_sxs_sweep(&ctx, Path::new("/definitely/not/here/winsxs"));
        assert!(ctx.suspects.is_empty());
    }
}
