//! Configuration-store model: typed values, the hive-reader seam, and the
//! recursive reference walker.

pub mod extract;
pub mod walker;

use crate::core::errors::Result;

/// Well-known machine-wide root container.
pub const MACHINE_ROOT: &str = "HKEY_LOCAL_MACHINE";
/// Well-known all-users root container.
pub const USERS_ROOT: &str = "HKEY_USERS";

/// Typed data carried by one registry value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueData {
    /// Raw byte blob (`REG_BINARY` and friends).
    Binary(Vec<u8>),
    /// 32-bit integer.
    Dword(u32),
    /// 64-bit integer.
    Qword(u64),
    /// Single string.
    Sz(String),
    /// Environment-expandable string.
    ExpandSz(String),
    /// String list.
    MultiSz(Vec<String>),
}

/// One enumerated value: container path, value name, typed data. Immutable
/// once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistryValue {
    /// Full path of the containing key.
    pub key: String,
    /// Value name; empty for the default value.
    pub name: String,
    /// Typed payload.
    pub data: ValueData,
}

impl RegistryValue {
    /// Name as cited in reports; the default value prints as `(Default)`.
    #[must_use]
    pub fn printable_name(&self) -> &str {
        if self.name.is_empty() {
            "(Default)"
        } else {
            &self.name
        }
    }
}

/// Read-only access to a configuration hive. The scan engines only ever
/// enumerate; they never write.
pub trait HiveReader: Send + Sync {
    /// Enumerate the values stored directly in `key`.
    fn enumerate_values(&self, key: &str) -> Result<Vec<RegistryValue>>;
    /// Enumerate the full paths of `key`'s immediate subkeys.
    fn enumerate_subkeys(&self, key: &str) -> Result<Vec<String>>;
}
