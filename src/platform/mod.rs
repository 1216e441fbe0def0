//! OS abstraction used by the scan engines.
//!
//! The engines are written against these traits so the analysis logic runs
//! anywhere; the Windows implementations live in [`windows`]. Tests inject
//! in-memory fakes.

#[cfg(windows)]
pub mod windows;

use std::path::Path;
use std::sync::Arc;

use crate::core::errors::Result;

/// Bit mask over region protection flags covering every execute right.
pub const EXECUTE_PROTECT_MASK: u32 = 0xF0;

/// The external code-signing predicate.
pub trait SignatureVerifier: Send + Sync {
    /// Whether the file at `path` carries a valid signature.
    fn is_signed(&self, path: &Path) -> bool;
}

/// One region returned by a virtual-memory query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    /// Base address of the queried region.
    pub base: u64,
    /// Base of the allocation the region belongs to.
    pub allocation_base: u64,
    /// Region size in bytes.
    pub size: u64,
    /// Raw protection flags.
    pub protect: u32,
    /// Whether the region is backed by an image mapping.
    pub is_image: bool,
}

impl RegionInfo {
    /// Whether the protection flags grant any execute right.
    #[must_use]
    pub const fn is_executable(&self) -> bool {
        self.protect & EXECUTE_PROTECT_MASK != 0
    }
}

/// Read access to one live process's address space. Implementations hold
/// the process handle; dropping the trait object releases it.
pub trait ProcessMemory: Send + Sync {
    /// The owning process id.
    fn pid(&self) -> u32;
    /// Read exactly `buf.len()` bytes at `address`.
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()>;
    /// Query the region containing `address`; `None` once the address space
    /// is exhausted or the process is gone.
    fn query_region(&self, address: u64) -> Option<RegionInfo>;
    /// Resolve the file backing the mapping at `address`, as a
    /// drive-letter path.
    fn mapped_file(&self, address: u64) -> Option<String>;
}

/// Process enumeration and per-process lookups.
pub trait ProcessSource: Send + Sync {
    /// Snapshot of every process id on the system.
    fn processes(&self) -> Vec<u32>;
    /// Open a process for memory inspection.
    fn open(&self, pid: u32) -> Result<Arc<dyn ProcessMemory>>;
    /// Full paths of the modules loaded in `pid`.
    fn modules(&self, pid: u32) -> Vec<String>;
    /// Image name of `pid`, for report citations.
    fn image_name(&self, pid: u32) -> Option<String>;
}

/// One entry of the system-wide handle table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleEntry {
    /// Owning process.
    pub pid: u32,
    /// Handle value inside the owning process.
    pub handle: u64,
}

/// A foreign handle duplicated into the scanner process. Dropping the
/// object closes the duplicate on every exit path.
pub trait OwnedHandle: Send {
    /// The raw duplicated handle value.
    fn raw(&self) -> u64;
}

/// System handle table access.
pub trait HandleSource: Send + Sync {
    /// Snapshot the system-wide handle table.
    fn snapshot(&self) -> Result<Vec<HandleEntry>>;
    /// Duplicate `handle` from `pid` into the scanner process.
    fn duplicate(&self, pid: u32, handle: u64) -> Option<Box<dyn OwnedHandle>>;
    /// Map of kernel device prefixes to drive roots, e.g.
    /// `\Device\HarddiskVolume3` → `C:`.
    fn drive_prefixes(&self) -> Vec<(String, String)>;
    /// The blocking name-query primitive handed to the resolver worker.
    fn name_query(&self) -> Arc<crate::handles::resolver::QueryFn>;
}

/// Clear any transaction inherited by the calling thread so mapped-file
/// lookups observe committed file state. Transacted lookups are the lie
/// doppelgänging depends on.
pub fn clear_current_transaction() {
    #[cfg(windows)]
    windows::clear_current_transaction();
}

/// Bundle of platform sources handed to the driver.
#[derive(Clone)]
pub struct Sources {
    pub hive: Arc<dyn crate::registry::HiveReader>,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub processes: Arc<dyn ProcessSource>,
    pub handles: Arc<dyn HandleSource>,
}

impl Sources {
    /// The live system's sources.
    #[cfg(windows)]
    #[must_use]
    pub fn system() -> Self {
        Self {
            hive: Arc::new(windows::SystemHive),
            verifier: Arc::new(windows::AuthenticodeVerifier),
            processes: Arc::new(windows::SystemProcesses),
            handles: Arc::new(windows::SystemHandles),
        }
    }

    /// Inert sources for hosts without the scanned subsystems: empty hive,
    /// no processes, no handles, and a verifier that treats everything as
    /// signed so nothing is reported. The filesystem sweep still runs over
    /// whatever directories exist.
    #[cfg(not(windows))]
    #[must_use]
    pub fn system() -> Self {
        Self {
            hive: Arc::new(stubs::EmptyHive),
            verifier: Arc::new(stubs::PresumeSigned),
            processes: Arc::new(stubs::NoProcesses),
            handles: Arc::new(stubs::NoHandles),
        }
    }
}

#[cfg(not(windows))]
mod stubs {
    //! Inert implementations for non-Windows hosts.

    use std::path::Path;
    use std::sync::Arc;

    use super::{HandleEntry, HandleSource, OwnedHandle, ProcessMemory, ProcessSource, SignatureVerifier};
    use crate::core::errors::{GlassError, Result};
    use crate::registry::{HiveReader, RegistryValue};

    pub struct EmptyHive;

    impl HiveReader for EmptyHive {
        fn enumerate_values(&self, _key: &str) -> Result<Vec<RegistryValue>> {
            Ok(Vec::new())
        }

        fn enumerate_subkeys(&self, _key: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    pub struct PresumeSigned;

    impl SignatureVerifier for PresumeSigned {
        fn is_signed(&self, _path: &Path) -> bool {
            true
        }
    }

    pub struct NoProcesses;

    impl ProcessSource for NoProcesses {
        fn processes(&self) -> Vec<u32> {
            Vec::new()
        }

        fn open(&self, pid: u32) -> Result<Arc<dyn ProcessMemory>> {
            Err(GlassError::Runtime {
                details: format!("process {pid} inspection is not supported on this host"),
            })
        }

        fn modules(&self, _pid: u32) -> Vec<String> {
            Vec::new()
        }

        fn image_name(&self, _pid: u32) -> Option<String> {
            None
        }
    }

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
}
