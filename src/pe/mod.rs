//! Portable-executable parsing and classification.
//!
//! The predicates here are the gate every engine funnels candidates
//! through: a suspect has to look like a PE before its signature is worth
//! checking.

pub mod headers;
pub mod view;

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::core::paths::search_path_executable;
use crate::pe::view::PeView;

/// How many leading bytes the on-disk probe reads and trusts.
const PROBE_LEN: usize = 0x400;

/// Whether a byte buffer starts with a plausible PE image: `MZ` magic, an
/// NT-header offset within the first 0x400 bytes, and the `PE\0\0`
/// signature at that offset.
#[must_use]
pub fn is_pe_data(bytes: &[u8]) -> bool {
    let view = PeView::new(bytes);
    let Ok(magic) = view.u16_at(0) else {
        return false;
    };
    if magic != headers::DOS_MAGIC {
        return false;
    }
    let Ok(offset) = view.u32_at(headers::E_LFANEW_OFFSET) else {
        return false;
    };
    let offset = offset as usize;
    if offset + 4 >= PROBE_LEN {
        return false;
    }
    view.u32_at(offset)
        .is_ok_and(|signature| signature == headers::PE_SIGNATURE)
}

/// Whether the file at `path` is a PE, judged by its first 0x400 bytes.
/// Unreadable or absent files are not PEs.
#[must_use]
pub fn is_pe_file(path: &Path) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut probe = [0u8; PROBE_LEN];
    let mut filled = 0;
    loop {
        match file.read(&mut probe[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(_) => return false,
        }
        if filled == PROBE_LEN {
            break;
        }
    }
    is_pe_data(&probe[..filled])
}

/// Whether a raw name refers to PE content.
///
/// An existing file is probed directly. A missing path with a recognized
/// executable extension is assumed to be a PE reference; other extensions
/// are not. A bare extensionless name goes through one round of search-path
/// resolution; a rooted extensionless miss is rejected outright.
#[must_use]
pub fn is_filetype_pe(name: &str) -> bool {
    let path = Path::new(name);
    if path.is_file() {
        return is_pe_file(path);
    }

    if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
        return matches!(
            extension.to_ascii_lowercase().as_str(),
            "exe" | "dll" | "ocx" | "sys"
        );
    }

    if name.len() >= 2 && name.as_bytes()[1] == b':' {
        return false;
    }
    match search_path_executable(name) {
        Some(resolved) if resolved.as_os_str() != name => {
            resolved.to_str().is_some_and(is_filetype_pe)
        }
        _ => false,
    }
}
