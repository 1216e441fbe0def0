//! Windows implementations of the platform traits: registry enumeration,
//! Authenticode verification, process memory access, and the system handle
//! table.
//!
//! This module is the crate's only unsafe surface; everything above it
//! works on checked buffers and owned handles.

#![allow(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]

use std::ffi::OsString;
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::Path;
use std::ptr;
use std::sync::Arc;

use ntapi::ntexapi::NtQuerySystemInformation;
use ntapi::ntobapi::NtQueryObject;
use ntapi::ntrtl::RtlSetCurrentTransaction;
use winapi::ctypes::c_void;
use winapi::shared::minwindef::{DWORD, FALSE, HKEY__, MAX_PATH};
use winapi::shared::ntdef::NTSTATUS;
use winapi::shared::ntstatus::STATUS_INFO_LENGTH_MISMATCH;
use winapi::shared::winerror::{ERROR_MORE_DATA, ERROR_NO_MORE_ITEMS, ERROR_SUCCESS};
use winapi::um::fileapi::{GetLogicalDriveStringsW, QueryDosDeviceW};
use winapi::um::handleapi::{CloseHandle, DuplicateHandle, INVALID_HANDLE_VALUE};
use winapi::um::memoryapi::{ReadProcessMemory, VirtualQueryEx};
use winapi::um::processthreadsapi::{GetCurrentProcess, OpenProcess};
use winapi::um::psapi::{
    EnumProcessModules, EnumProcesses, GetMappedFileNameW, GetModuleFileNameExW,
};
use winapi::um::winbase::QueryFullProcessImageNameW;
use winapi::um::winnt::{
    DUPLICATE_SAME_ACCESS, HANDLE, KEY_READ, MEM_IMAGE, MEMORY_BASIC_INFORMATION,
    PROCESS_DUP_HANDLE, PROCESS_QUERY_INFORMATION, PROCESS_QUERY_LIMITED_INFORMATION,
    PROCESS_VM_OPERATION, PROCESS_VM_READ, REG_BINARY, REG_DWORD, REG_EXPAND_SZ, REG_MULTI_SZ,
    REG_QWORD, REG_SZ,
};
use winapi::um::winreg::{
    HKEY_LOCAL_MACHINE, HKEY_USERS, RegCloseKey, RegEnumKeyExW, RegEnumValueW, RegOpenKeyExW,
    RegQueryInfoKeyW,
};

use crate::core::errors::{GlassError, Result};
use crate::handles::resolver::{QueryFn, QueryStatus};
use crate::platform::{
    HandleEntry, HandleSource, OwnedHandle, ProcessMemory, ProcessSource, RegionInfo,
    SignatureVerifier,
};
use crate::registry::{HiveReader, RegistryValue, ValueData};

const SYSTEM_HANDLE_INFORMATION_CLASS: u32 = 0x10;
const OBJECT_NAME_INFORMATION_CLASS: u32 = 1;

fn nt_success(status: NTSTATUS) -> bool {
    status >= 0
}

/// Owned Windows handle closed on drop, on every exit path.
struct HandleGuard(HANDLE);

// HANDLE is a raw pointer; ownership of a kernel handle is transferable
// across threads.
unsafe impl Send for HandleGuard {}
unsafe impl Sync for HandleGuard {}

impl HandleGuard {
    fn new(handle: HANDLE) -> Option<Self> {
        if handle.is_null() || handle == INVALID_HANDLE_VALUE {
            None
        } else {
            Some(Self(handle))
        }
    }

    fn raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

fn to_wide(value: &str) -> Vec<u16> {
    std::ffi::OsStr::new(value)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect()
}

fn from_wide(value: &[u16]) -> String {
    let end = value.iter().position(|unit| *unit == 0).unwrap_or(value.len());
    OsString::from_wide(&value[..end]).to_string_lossy().into_owned()
}

/// Build the `\Device\…` prefix → drive-root translation map by walking
/// the logical drives.
fn drive_translation() -> Vec<(String, String)> {
    let mut drives = vec![0u16; 512];
    let length = unsafe { GetLogicalDriveStringsW(512, drives.as_mut_ptr()) };
    if length == 0 {
        eprintln!("[DG-WIN] failed to translate kernel paths to DOS paths");
        return Vec::new();
    }

    let mut translation = Vec::new();
    for root in drives[..length as usize].split(|unit| *unit == 0) {
        if root.is_empty() {
            continue;
        }
        // "C:\" → query "C:".
        let drive: Vec<u16> = root.iter().copied().take(2).chain(std::iter::once(0)).collect();
        let mut prefix = vec![0u16; MAX_PATH];
        let written =
            unsafe { QueryDosDeviceW(drive.as_ptr(), prefix.as_mut_ptr(), MAX_PATH as DWORD) };
        if written != 0 {
            translation.push((from_wide(&prefix), from_wide(&drive)));
        }
    }
    translation
}

fn device_path_to_dos(translation: &[(String, String)], device_path: &str) -> Option<String> {
    for (prefix, drive) in translation {
        if let Some(rest) = device_path.strip_prefix(prefix.as_str()) {
            return Some(format!("{drive}{rest}"));
        }
    }
    None
}

/// Clear any inherited transaction so mapped-file lookups see committed
/// state.
pub fn clear_current_transaction() {
    unsafe {
        RtlSetCurrentTransaction(ptr::null_mut());
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Live configuration hive rooted at the machine-wide and all-users keys.
pub struct SystemHive;

fn split_key(key: &str) -> Result<(*mut HKEY__, Option<&str>)> {
    let (root, rest) = key
        .split_once('\\')
        .map_or((key, None), |(root, rest)| (root, Some(rest)));
    let handle = match root {
        "HKEY_LOCAL_MACHINE" => HKEY_LOCAL_MACHINE,
        "HKEY_USERS" => HKEY_USERS,
        other => {
            return Err(GlassError::Runtime {
                details: format!("unsupported registry root {other}"),
            });
        }
    };
    Ok((handle, rest))
}

struct KeyGuard(*mut HKEY__);

impl Drop for KeyGuard {
    fn drop(&mut self) {
        unsafe {
            let _ = RegCloseKey(self.0);
        }
    }
}

fn open_key(key: &str) -> Result<KeyGuard> {
    let (root, rest) = split_key(key)?;
    let sub_key = to_wide(rest.unwrap_or(""));
    let mut opened = ptr::null_mut();
    let status = unsafe { RegOpenKeyExW(root, sub_key.as_ptr(), 0, KEY_READ, &mut opened) };
    if status as DWORD != ERROR_SUCCESS {
        return Err(GlassError::AccessDenied { path: key.into() });
    }
    Ok(KeyGuard(opened))
}

fn decode_value(key: &str, name: &str, value_type: DWORD, data: &[u8]) -> Option<RegistryValue> {
    let data = match value_type {
        REG_SZ => ValueData::Sz(decode_wide_bytes(data)),
        REG_EXPAND_SZ => ValueData::ExpandSz(decode_wide_bytes(data)),
        REG_MULTI_SZ => ValueData::MultiSz(decode_multi(data)),
        REG_DWORD => {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(data.get(..4)?);
            ValueData::Dword(u32::from_le_bytes(raw))
        }
        REG_QWORD => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(data.get(..8)?);
            ValueData::Qword(u64::from_le_bytes(raw))
        }
        REG_BINARY => ValueData::Binary(data.to_vec()),
        _ => ValueData::Binary(data.to_vec()),
    };
    Some(RegistryValue {
        key: key.to_string(),
        name: name.to_string(),
        data,
    })
}

fn decode_wide_bytes(data: &[u8]) -> String {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    from_wide(&units)
}

fn decode_multi(data: &[u8]) -> Vec<String> {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    units
        .split(|unit| *unit == 0)
        .filter(|chunk| !chunk.is_empty())
        .map(from_wide)
        .collect()
}

impl HiveReader for SystemHive {
    fn enumerate_values(&self, key: &str) -> Result<Vec<RegistryValue>> {
        let opened = open_key(key)?;

        let mut max_name_len = 0u32;
        let mut max_data_len = 0u32;
        let status = unsafe {
            RegQueryInfoKeyW(
                opened.0,
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                &mut max_name_len,
                &mut max_data_len,
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        if status as DWORD != ERROR_SUCCESS {
            return Err(GlassError::AccessDenied { path: key.into() });
        }

        let mut values = Vec::new();
        let mut index = 0u32;
        loop {
            let mut name = vec![0u16; max_name_len as usize + 1];
            let mut name_len = name.len() as DWORD;
            let mut value_type = 0u32;
            let mut data = vec![0u8; max_data_len as usize + 1];
            let mut data_len = data.len() as DWORD;
            let status = unsafe {
                RegEnumValueW(
                    opened.0,
                    index,
                    name.as_mut_ptr(),
                    &mut name_len,
                    ptr::null_mut(),
                    &mut value_type,
                    data.as_mut_ptr(),
                    &mut data_len,
                )
            };
            match status as DWORD {
                ERROR_SUCCESS => {
                    data.truncate(data_len as usize);
                    let name = from_wide(&name[..name_len as usize]);
                    if let Some(value) = decode_value(key, &name, value_type, &data) {
                        values.push(value);
                    }
                    index += 1;
                }
                ERROR_NO_MORE_ITEMS => break,
                ERROR_MORE_DATA => {
                    // Value grew between the size query and the read.
                    max_data_len = max_data_len.saturating_mul(2).max(data_len);
                }
                _ => break,
            }
        }
        Ok(values)
    }

    fn enumerate_subkeys(&self, key: &str) -> Result<Vec<String>> {
        let opened = open_key(key)?;
        let mut subkeys = Vec::new();
        let mut index = 0u32;
        loop {
            let mut name = vec![0u16; 256];
            let mut name_len = name.len() as DWORD;
            let status = unsafe {
                RegEnumKeyExW(
                    opened.0,
                    index,
                    name.as_mut_ptr(),
                    &mut name_len,
                    ptr::null_mut(),
                    ptr::null_mut(),
                    ptr::null_mut(),
                    ptr::null_mut(),
                )
            };
            match status as DWORD {
                ERROR_SUCCESS => {
                    subkeys.push(format!("{key}\\{}", from_wide(&name[..name_len as usize])));
                    index += 1;
                }
                _ => break,
            }
        }
        Ok(subkeys)
    }
}

// ---------------------------------------------------------------------------
// Code signing
// ---------------------------------------------------------------------------

/// Authenticode-backed implementation of the signing predicate.
pub struct AuthenticodeVerifier;

impl SignatureVerifier for AuthenticodeVerifier {
    fn is_signed(&self, path: &Path) -> bool {
        use winapi::um::softpub::WINTRUST_ACTION_GENERIC_VERIFY_V2;
        use winapi::um::wintrust::{
            WINTRUST_DATA, WINTRUST_FILE_INFO, WTD_CHOICE_FILE, WTD_REVOKE_NONE, WTD_STATEACTION_CLOSE,
            WTD_STATEACTION_VERIFY, WTD_UI_NONE, WinVerifyTrust,
        };

        let wide_path = to_wide(&path.to_string_lossy());
        let mut file_info: WINTRUST_FILE_INFO = unsafe { std::mem::zeroed() };
        file_info.cbStruct = size_of::<WINTRUST_FILE_INFO>() as DWORD;
        file_info.pcwszFilePath = wide_path.as_ptr();

        let mut data: WINTRUST_DATA = unsafe { std::mem::zeroed() };
        data.cbStruct = size_of::<WINTRUST_DATA>() as DWORD;
        data.dwUIChoice = WTD_UI_NONE;
        data.fdwRevocationChecks = WTD_REVOKE_NONE;
        data.dwUnionChoice = WTD_CHOICE_FILE;
        data.dwStateAction = WTD_STATEACTION_VERIFY;
        unsafe {
            *data.u.pFile_mut() = &mut file_info;
        }

        let mut action = WINTRUST_ACTION_GENERIC_VERIFY_V2;
        let verdict = unsafe {
            WinVerifyTrust(
                ptr::null_mut(),
                &mut action,
                (&raw mut data).cast::<c_void>(),
            )
        };

        data.dwStateAction = WTD_STATEACTION_CLOSE;
        unsafe {
            WinVerifyTrust(
                ptr::null_mut(),
                &mut action,
                (&raw mut data).cast::<c_void>(),
            );
        }

        verdict == 0
    }
}

// ---------------------------------------------------------------------------
// Processes
// ---------------------------------------------------------------------------

/// Live process enumeration.
pub struct SystemProcesses;

struct WindowsProcess {
    pid: u32,
    handle: HandleGuard,
    translation: Vec<(String, String)>,
}

impl ProcessMemory for WindowsProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        let mut read = 0usize;
        let ok = unsafe {
            ReadProcessMemory(
                self.handle.raw(),
                address as *const c_void,
                buf.as_mut_ptr().cast::<c_void>(),
                buf.len(),
                &mut read,
            )
        };
        if ok == 0 || read != buf.len() {
            return Err(GlassError::MemoryUnavailable {
                pid: self.pid,
                address,
            });
        }
        Ok(())
    }

    fn query_region(&self, address: u64) -> Option<RegionInfo> {
        let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
        let written = unsafe {
            VirtualQueryEx(
                self.handle.raw(),
                address as *const c_void,
                &mut info,
                size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if written == 0 {
            return None;
        }
        Some(RegionInfo {
            base: info.BaseAddress as u64,
            allocation_base: info.AllocationBase as u64,
            size: info.RegionSize as u64,
            protect: info.Protect,
            is_image: info.Type == MEM_IMAGE,
        })
    }

    fn mapped_file(&self, address: u64) -> Option<String> {
        let mut name = vec![0u16; 0x1000];
        let written = unsafe {
            GetMappedFileNameW(
                self.handle.raw(),
                address as *mut c_void,
                name.as_mut_ptr(),
                name.len() as DWORD,
            )
        };
        if written == 0 {
            return None;
        }
        let device_path = from_wide(&name[..written as usize]);
        device_path_to_dos(&self.translation, &device_path)
    }
}

impl ProcessSource for SystemProcesses {
    fn processes(&self) -> Vec<u32> {
        let mut pids = vec![0u32; 1024];
        let mut needed = 0u32;
        loop {
            let capacity_bytes = (pids.len() * size_of::<u32>()) as DWORD;
            let ok = unsafe { EnumProcesses(pids.as_mut_ptr(), capacity_bytes, &mut needed) };
            if ok == 0 {
                return Vec::new();
            }
            if needed < capacity_bytes {
                break;
            }
            pids.resize(pids.len() * 2, 0);
        }
        pids.truncate(needed as usize / size_of::<u32>());
        pids
    }

    fn open(&self, pid: u32) -> Result<Arc<dyn ProcessMemory>> {
        let desired = PROCESS_VM_READ | PROCESS_QUERY_INFORMATION | PROCESS_VM_OPERATION;
        let handle = unsafe { OpenProcess(desired, FALSE, pid) };
        let handle = HandleGuard::new(handle).ok_or(GlassError::AccessDenied {
            path: format!("PID {pid}").into(),
        })?;
        Ok(Arc::new(WindowsProcess {
            pid,
            handle,
            translation: drive_translation(),
        }))
    }

    fn modules(&self, pid: u32) -> Vec<String> {
        let desired = PROCESS_QUERY_INFORMATION | PROCESS_VM_READ;
        let Some(process) = HandleGuard::new(unsafe { OpenProcess(desired, FALSE, pid) }) else {
            return Vec::new();
        };

        let mut modules = vec![ptr::null_mut::<winapi::shared::minwindef::HINSTANCE__>(); 256];
        let mut needed = 0u32;
        loop {
            let capacity_bytes = (modules.len() * size_of::<usize>()) as DWORD;
            let ok = unsafe {
                EnumProcessModules(
                    process.raw(),
                    modules.as_mut_ptr(),
                    capacity_bytes,
                    &mut needed,
                )
            };
            if ok == 0 {
                return Vec::new();
            }
            if needed <= capacity_bytes {
                break;
            }
            modules.resize(needed as usize / size_of::<usize>(), ptr::null_mut());
        }
        modules.truncate(needed as usize / size_of::<usize>());

        let mut paths = Vec::with_capacity(modules.len());
        for module in modules {
            let mut name = vec![0u16; MAX_PATH * 2];
            let written = unsafe {
                GetModuleFileNameExW(
                    process.raw(),
                    module,
                    name.as_mut_ptr(),
                    name.len() as DWORD,
                )
            };
            if written != 0 {
                paths.push(from_wide(&name[..written as usize]));
            }
        }
        paths
    }

    fn image_name(&self, pid: u32) -> Option<String> {
        let handle = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, FALSE, pid) };
        let handle = HandleGuard::new(handle)?;
        let mut capacity: DWORD = MAX_PATH as DWORD;
        loop {
            let mut buffer = vec![0u16; capacity as usize];
            let mut length = capacity;
            let ok = unsafe {
                QueryFullProcessImageNameW(handle.raw(), 0, buffer.as_mut_ptr(), &mut length)
            };
            if ok != 0 {
                return Some(from_wide(&buffer[..length as usize]));
            }
            if capacity > 0x8000 {
                return None;
            }
            capacity = capacity.saturating_mul(2);
        }
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// System handle table access.
pub struct SystemHandles;

struct WinOwnedHandle(HandleGuard);

impl OwnedHandle for WinOwnedHandle {
    fn raw(&self) -> u64 {
        self.0.raw() as u64
    }
}

impl HandleSource for SystemHandles {
    fn snapshot(&self) -> Result<Vec<HandleEntry>> {
        let mut buf: Vec<u8> = Vec::new();
        let mut length = 0u32;
        loop {
            let status = unsafe {
                NtQuerySystemInformation(
                    SYSTEM_HANDLE_INFORMATION_CLASS,
                    buf.as_mut_ptr().cast::<c_void>(),
                    buf.len() as u32,
                    &mut length,
                )
            };
            if status == STATUS_INFO_LENGTH_MISMATCH {
                buf.resize(length as usize + 0x1000, 0);
                continue;
            }
            if !nt_success(status) {
                return Err(GlassError::Runtime {
                    details: format!(
                        "NtQuerySystemInformation failed with status {:#010x}",
                        status as u32
                    ),
                });
            }
            break;
        }

        let info = unsafe { &*buf.as_ptr().cast::<ntapi::ntexapi::SYSTEM_HANDLE_INFORMATION>() };
        let count = info.NumberOfHandles as usize;
        let entries = unsafe { std::slice::from_raw_parts(info.Handles.as_ptr(), count) };
        Ok(entries
            .iter()
            .map(|entry| HandleEntry {
                pid: u32::from(entry.UniqueProcessId),
                handle: u64::from(entry.HandleValue),
            })
            .collect())
    }

    fn duplicate(&self, pid: u32, handle: u64) -> Option<Box<dyn OwnedHandle>> {
        let process = HandleGuard::new(unsafe { OpenProcess(PROCESS_DUP_HANDLE, FALSE, pid) })?;
        let mut duplicated: HANDLE = ptr::null_mut();
        let ok = unsafe {
            DuplicateHandle(
                process.raw(),
                handle as HANDLE,
                GetCurrentProcess(),
                &mut duplicated,
                0,
                FALSE,
                DUPLICATE_SAME_ACCESS,
            )
        };
        if ok == 0 {
            return None;
        }
        HandleGuard::new(duplicated).map(|guard| Box::new(WinOwnedHandle(guard)) as Box<dyn OwnedHandle>)
    }

    fn drive_prefixes(&self) -> Vec<(String, String)> {
        drive_translation()
    }

    fn name_query(&self) -> Arc<QueryFn> {
        Arc::new(|handle, buf| {
            let mut length = 0u32;
            let status = unsafe {
                NtQueryObject(
                    handle as HANDLE,
                    OBJECT_NAME_INFORMATION_CLASS,
                    buf.as_mut_ptr().cast::<c_void>(),
                    buf.len() as u32,
                    &mut length,
                )
            };
            if status == STATUS_INFO_LENGTH_MISMATCH {
                return QueryStatus::Grow(length as usize);
            }
            if !nt_success(status) {
                return QueryStatus::Complete(None);
            }
            QueryStatus::Complete(decode_object_name(buf))
        })
    }
}

/// Decode the `UNICODE_STRING` at the front of an object-name-information
/// buffer. The `Buffer` pointer aims back into `buf` itself.
fn decode_object_name(buf: &[u8]) -> Option<String> {
    if buf.len() < size_of::<usize>() * 2 {
        return None;
    }
    let length = u16::from_le_bytes([buf[0], buf[1]]) as usize;
    let pointer = usize::from_le_bytes(buf[size_of::<usize>()..size_of::<usize>() * 2].try_into().ok()?);
    if pointer == 0 || length == 0 {
        return None;
    }
    let units: Vec<u16> = (0..length / 2)
        .map(|index| {
            let unit = unsafe { *(pointer as *const u16).add(index) };
            unit
        })
        .collect();
    Some(from_wide(&units))
}
