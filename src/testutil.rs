//! Shared unit-test fixtures: a lowercase scratch directory (case folding
//! must round-trip through the real filesystem) and inert platform fakes.

#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::core::errors::{GlassError, Result};
use crate::platform::{
    HandleEntry, HandleSource, OwnedHandle, ProcessMemory, ProcessSource, SignatureVerifier,
};
use crate::registry::{HiveReader, RegistryValue};

static NEXT_DIR: AtomicU32 = AtomicU32::new(0);

/// Scratch directory whose full path is guaranteed lowercase, so folded
/// paths still resolve on case-sensitive filesystems. Removed on drop.
pub struct LowercaseTmp {
    path: PathBuf,
}

impl LowercaseTmp {
    pub fn new(tag: &str) -> Self {
        let base = lowercase_temp_base();
        let path = base.join(format!(
            "dg-{tag}-{}-{}",
            std::process::id(),
            NEXT_DIR.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&path).expect("scratch dir");
        assert_eq!(
            path.to_string_lossy().to_lowercase(),
            path.to_string_lossy(),
            "scratch dir path must be lowercase"
        );
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// The system temp dir when its path is already lowercase, `/tmp`
/// otherwise (macOS puts uppercase segments in `TMPDIR`).
fn lowercase_temp_base() -> PathBuf {
    let system = std::env::temp_dir();
    let display = system.to_string_lossy();
    if display.to_lowercase() == display {
        system
    } else {
        PathBuf::from("/tmp")
    }
}

impl Drop for LowercaseTmp {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// Verifier that trusts nothing.
pub struct NothingSigned;

impl SignatureVerifier for NothingSigned {
    fn is_signed(&self, _path: &Path) -> bool {
        false
    }
}

/// Verifier with an explicit unsigned list (folded paths).
pub struct UnsignedList(pub Vec<String>);

impl SignatureVerifier for UnsignedList {
    fn is_signed(&self, path: &Path) -> bool {
        let folded = path.to_string_lossy().to_lowercase();
        !self.0.iter().any(|entry| *entry == folded)
    }
}

/// Hive with no keys.
pub struct EmptyHive;

impl HiveReader for EmptyHive {
    fn enumerate_values(&self, _key: &str) -> Result<Vec<RegistryValue>> {
        Ok(Vec::new())
    }

    fn enumerate_subkeys(&self, _key: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Process source with no processes.
pub struct NoProcesses;

impl ProcessSource for NoProcesses {
    fn processes(&self) -> Vec<u32> {
        Vec::new()
    }

    fn open(&self, pid: u32) -> Result<Arc<dyn ProcessMemory>> {
        Err(GlassError::Runtime {
            details: format!("no process {pid} in tests"),
        })
    }

    fn modules(&self, _pid: u32) -> Vec<String> {
        Vec::new()
    }

    fn image_name(&self, _pid: u32) -> Option<String> {
        None
    }
}

/// Handle source with an empty table.
pub struct NoHandles;

impl HandleSource for NoHandles {
    fn snapshot(&self) -> Result<Vec<HandleEntry>> {
        Ok(Vec::new())
    }

    fn duplicate(&self, _pid: u32, _handle: u64) -> Option<Box<dyn OwnedHandle>> {
        None
    }

    fn drive_prefixes(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    fn name_query(&self) -> Arc<crate::handles::resolver::QueryFn> {
        Arc::new(|_, _| crate::handles::resolver::QueryStatus::Complete(None))
    }
}

/// Region-table-only process fake for address-space walk tests. Reads
/// fail (no content is backed), queries synthesize free regions for gaps
/// and end past the last known region.
pub struct FakeProcess {
    pid: u32,
    regions: Vec<crate::platform::RegionInfo>,
}

pub struct FakeProcessBuilder {
    pid: u32,
    regions: Vec<crate::platform::RegionInfo>,
}

impl FakeProcess {
    pub fn builder(pid: u32) -> FakeProcessBuilder {
        FakeProcessBuilder {
            pid,
            regions: Vec::new(),
        }
    }
}

impl FakeProcessBuilder {
    pub fn region(mut self, region: crate::platform::RegionInfo) -> Self {
        self.regions.push(region);
        self
    }

    pub fn build(self) -> FakeProcess {
        FakeProcess {
            pid: self.pid,
            regions: self.regions,
        }
    }
}

impl ProcessMemory for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn read(&self, _address: u64, _buf: &mut [u8]) -> Result<()> {
        Err(GlassError::MemoryUnavailable {
            pid: self.pid,
            address: 0,
        })
    }

    fn query_region(&self, address: u64) -> Option<crate::platform::RegionInfo> {
        // Exact containment first.
        if let Some(region) = self
            .regions
            .iter()
            .find(|region| address >= region.base && address < region.base + region.size)
        {
            return Some(*region);
        }
        // Synthesize a free region spanning the gap to the next known one.
        let next = self
            .regions
            .iter()
            .filter(|region| region.base > address)
            .min_by_key(|region| region.base)?;
        Some(crate::platform::RegionInfo {
            base: address,
            allocation_base: 0,
            size: next.base - address,
            protect: 0x01,
            is_image: false,
        })
    }

    fn mapped_file(&self, _address: u64) -> Option<String> {
        None
    }
}

