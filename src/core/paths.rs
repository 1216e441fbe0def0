//! Shared path utilities: case folding, environment expansion, and the
//! reference resolver that turns registry-extracted strings into on-disk
//! paths.
//!
//! Reference strings come out of the configuration store in every shape an
//! installer ever wrote them: bare filenames, absolute paths, paths rooted at
//! the kernel `\SystemRoot` alias, and paths with a stray `C:\?` artifact.
//! [`resolve_reference`] applies the rewrites in a fixed order and falls back
//! to a search-path lookup.

use std::env;
use std::path::{Path, PathBuf};

/// Case-fold a path string for identity comparison.
///
/// Every path stored in the suspect set or a found-map key goes through this
/// exactly once, at insertion.
#[must_use]
pub fn fold_path(path: &str) -> String {
    path.to_lowercase()
}

/// Expand `%VAR%` markers using the provided lookup. Unknown variables are
/// left in place, matching the platform expansion call the original strings
/// were written for.
pub fn expand_env_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        if let Some(end) = after.find('%') {
            let name = &after[..end];
            match lookup(name) {
                Some(value) => out.push_str(&value),
                None => {
                    out.push('%');
                    out.push_str(name);
                    out.push('%');
                }
            }
            rest = &after[end + 1..];
        } else {
            out.push('%');
            rest = after;
        }
    }
    out.push_str(rest);
    out
}

/// Expand `%VAR%` markers from the process environment (case-insensitive
/// variable names, as the configuration store assumes).
#[must_use]
pub fn expand_env(input: &str) -> String {
    expand_env_with(input, |name| {
        env::vars()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    })
}

/// Split a search-path string on `;`, dropping empty segments.
#[must_use]
pub fn split_search_path(path_var: &str) -> Vec<String> {
    path_var
        .split(';')
        .filter(|segment| !segment.trim().is_empty())
        .map(str::to_string)
        .collect()
}

/// Look up a bare name against an explicit list of directories.
///
/// Tries the name as given and, when it carries no extension, with `.exe`
/// appended, returning the first existing regular file.
#[must_use]
pub fn search_path_lookup(name: &str, directories: &[PathBuf]) -> Option<PathBuf> {
    let bare = Path::new(name);
    let with_exe = if bare.extension().is_none() {
        Some(format!("{name}.exe"))
    } else {
        None
    };
    for dir in directories {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        if let Some(exe_name) = &with_exe {
            let candidate = dir.join(exe_name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Search-path resolution against the current directory plus `PATH`.
#[must_use]
pub fn search_path_executable(name: &str) -> Option<PathBuf> {
    let mut directories = Vec::new();
    if let Ok(cwd) = env::current_dir() {
        directories.push(cwd);
    }
    if let Ok(path_var) = env::var("PATH") {
        directories.extend(split_search_path(&path_var).into_iter().map(PathBuf::from));
    }
    search_path_lookup(name, &directories)
}

/// Normalize a raw reference string without touching the filesystem.
///
/// Rewrites applied in order: `\SystemRoot` alias, `C:\?` artifact collapse,
/// environment expansion, single leading `\` drop.
#[must_use]
pub fn normalize_reference_with(raw: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut expanded = raw.to_string();
    if let Some(rest) = strip_prefix_ignore_case(&expanded, "\\SystemRoot") {
        expanded = format!("%SYSTEMROOT%{rest}");
    }
    if expanded.len() >= 4 && expanded.starts_with("C:\\?") {
        expanded = format!("C:\\{}", &expanded[4..]);
    }
    expanded = expand_env_with(&expanded, lookup);
    if let Some(rest) = expanded.strip_prefix('\\') {
        expanded = rest.to_string();
    }
    expanded
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    if value.len() >= prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&value[prefix.len()..])
    } else {
        None
    }
}

/// Resolve a raw reference string to an existing file, or `None`.
///
/// Normalizes first; if the result exists it wins, otherwise the search path
/// is consulted. A reference that resolves nowhere yields `None` and ends up
/// in the missing-files report rather than the suspect set.
#[must_use]
pub fn resolve_reference(raw: &str) -> Option<PathBuf> {
    if raw.is_empty() {
        return None;
    }
    let normalized = normalize_reference_with(raw, |name| {
        env::vars()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    });
    if normalized.is_empty() {
        return None;
    }
    let candidate = PathBuf::from(&normalized);
    if candidate.is_file() {
        return Some(candidate);
    }
    search_path_executable(&normalized)
}
