//! Suspect-file collection: copy every surviving suspect into the results
//! directory and record a digest manifest.

use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::report::{ReportKind, ReportSet};

/// Copy each suspect that still exists on disk into `<results>/Files` and
/// append a SHA-256 manifest line per copy. Copy failures are diagnostics;
/// collection never fails the run.
pub fn collect_suspects<'a>(reports: &ReportSet, suspects: impl IntoIterator<Item = &'a str>) {
    let files_dir = reports.files_dir();
    let manifest = reports.stream(ReportKind::CollectedFiles);

    for suspect in suspects {
        let source = Path::new(suspect);
        if !source.is_file() {
            continue;
        }
        let name = source
            .file_name()
            .map_or_else(|| suspect.to_string(), |n| n.to_string_lossy().into_owned());
        let destination = files_dir.join(&name);
        if let Err(err) = fs::copy(source, &destination) {
            eprintln!(
                "[DG-COLLECT] failed to copy {suspect} to {}: {err}",
                destination.display()
            );
            continue;
        }
        match digest_file(source) {
            Some(digest) => manifest.line(&format!("{digest}  {suspect}")),
            None => manifest.line(&format!("{}  {suspect}", "-".repeat(64))),
        }
    }
}

fn digest_file(path: &Path) -> Option<String> {
    let bytes = fs::read(path).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Some(format!("{:x}", hasher.finalize()))
}
