//! File-reference extraction from registry value data.
//!
//! Values accumulate paths in every format installers have ever used:
//! plain paths, `;`-joined lists, command lines with arguments, service
//! DLL references with trailing `,1` ordinals. The rules here recover the
//! path-like parts and leave the rest.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::paths::{fold_path, resolve_reference};
use crate::pe::is_filetype_pe;
use crate::registry::{RegistryValue, ValueData};

/// Drive-letter-rooted path, permissive about the characters installers put
/// in file names. An optional trailing comma is captured so ordinal suffixes
/// can be rejected after the fact.
static DRIVE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[a-zA-Z]:([/\\]?[a-zA-Z0-9().% #'@_\-\^]+)+,?").expect("drive-path regex")
});

/// Extract candidate file references from one value, applying `filter` to
/// every candidate before it is resolved and case-folded.
#[must_use]
pub fn find_referenced_files_with(
    value: &RegistryValue,
    filter: &dyn Fn(&str) -> bool,
) -> Vec<String> {
    match &value.data {
        ValueData::Binary(_) | ValueData::Dword(_) | ValueData::Qword(_) => Vec::new(),
        ValueData::MultiSz(entries) => {
            let mut all = Vec::new();
            for entry in entries {
                let single = RegistryValue {
                    key: value.key.clone(),
                    name: value.name.clone(),
                    data: ValueData::Sz(entry.clone()),
                };
                all.extend(find_referenced_files_with(&single, filter));
            }
            all
        }
        ValueData::Sz(data) | ValueData::ExpandSz(data) => {
            let mut files = Vec::new();
            for segment in data.split(';') {
                if segment.is_empty() {
                    continue;
                }
                let matches: Vec<&str> = DRIVE_PATH
                    .find_iter(segment)
                    .map(|found| found.as_str())
                    .collect();
                if matches.is_empty() {
                    if segment_looks_like_file(segment) && filter(segment) {
                        files.push(resolve_and_fold(segment));
                    }
                } else {
                    for candidate in matches {
                        if !candidate.ends_with(',') && filter(candidate) {
                            files.push(resolve_and_fold(candidate));
                        }
                    }
                }
            }
            files
        }
    }
}

/// Extract candidate file references with the default "looks like a PE"
/// filter.
#[must_use]
pub fn find_referenced_files(value: &RegistryValue) -> Vec<String> {
    find_referenced_files_with(value, &|candidate| is_filetype_pe(candidate))
}

/// A segment with no drive-letter match still counts when it carries no
/// space (a bare name) or ends in an extension-like `.xyz` suffix.
fn segment_looks_like_file(segment: &str) -> bool {
    if !segment.contains(' ') {
        return true;
    }
    let mut tail = segment.chars().rev();
    tail.nth(3) == Some('.')
}

fn resolve_and_fold(candidate: &str) -> String {
    resolve_reference(candidate).map_or_else(
        || fold_path(candidate),
        |path| fold_path(&path.to_string_lossy()),
    )
}
