//! Shared integration-test fixtures: a synthetic PE builder, a mapped
//! process fake, and in-memory platform sources.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use deepglass::core::errors::{GlassError, Result};
use deepglass::platform::{
    HandleEntry, HandleSource, OwnedHandle, ProcessMemory, ProcessSource, RegionInfo,
    SignatureVerifier, Sources,
};
use deepglass::registry::{HiveReader, RegistryValue, ValueData};

pub const PAGE: usize = 0x1000;
const E_LFANEW: usize = 0x80;
const OPT_OFFSET: usize = E_LFANEW + 24;

/// Section execute characteristic.
pub const SCN_EXECUTE: u32 = 0x2000_0020;
/// Section read-only data characteristic.
pub const SCN_RDATA: u32 = 0x4000_0040;

static NEXT_DIR: AtomicU32 = AtomicU32::new(0);

/// Scratch directory with an all-lowercase path, removed on drop. Folded
/// paths must resolve through the real filesystem, so mixed-case tempdir
/// names are unusable here.
pub struct Scratch {
    path: PathBuf,
}

impl Scratch {
    pub fn new(tag: &str) -> Self {
        let path = lowercase_temp_base().join(format!(
            "dg-it-{tag}-{}-{}",
            std::process::id(),
            NEXT_DIR.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&path).expect("scratch dir");
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

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// One section of a synthetic image.
#[derive(Clone)]
pub struct SectionSpec {
    pub name: [u8; 8],
    pub virtual_address: u32,
    pub raw_size: u32,
    pub raw_ptr: u32,
    pub characteristics: u32,
    pub data: Vec<u8>,
}

/// One relocation entry of a synthetic image.
#[derive(Clone, Copy)]
pub struct RelocSpec {
    /// RVA the fix-up applies to.
    pub rva: u32,
    /// Relocation type nibble (10 = DIR64, 3 = HIGHLOW, 1 = HIGH, 2 = LOW).
    pub kind: u16,
}

/// Declarative builder for a small, well-formed PE image.
pub struct TestImage {
    pub pe64: bool,
    pub image_base: u64,
    pub size_of_image: u32,
    pub sections: Vec<SectionSpec>,
    pub relocations: Vec<RelocSpec>,
    /// Mark the image as .NET by giving the COM-descriptor directory a size.
    pub net_flavored: bool,
}

impl TestImage {
    /// Canonical 64-bit image: an executable `.text` at RVA 0x1000 and a
    /// `.reloc` at RVA 0x2000, headers in the first 0x400 bytes.
    pub fn standard() -> Self {
        let text_data: Vec<u8> = (0..PAGE).map(|i| (i % 251) as u8).collect();
        Self {
            pe64: true,
            image_base: 0x1_8000_0000,
            size_of_image: 0x3000,
            sections: vec![
                SectionSpec {
                    name: *b".text\0\0\0",
                    virtual_address: 0x1000,
                    raw_size: PAGE as u32,
                    raw_ptr: 0x400,
                    characteristics: SCN_EXECUTE,
                    data: text_data,
                },
                SectionSpec {
                    name: *b".reloc\0\0",
                    virtual_address: 0x2000,
                    raw_size: PAGE as u32,
                    raw_ptr: 0x400 + PAGE as u32,
                    characteristics: SCN_RDATA,
                    data: vec![0u8; PAGE],
                },
            ],
            relocations: Vec::new(),
            net_flavored: false,
        }
    }

    /// Same image with 64-bit fix-up slots at the given `.text` offsets.
    pub fn with_dir64_relocations(offsets: &[u32]) -> Self {
        let mut image = Self::standard();
        for offset in offsets {
            let slot = image.image_base + 0x1000 + u64::from(*offset);
            image.sections[0].data[*offset as usize..*offset as usize + 8]
                .copy_from_slice(&slot.to_le_bytes());
            image.relocations.push(RelocSpec {
                rva: 0x1000 + offset,
                kind: 10,
            });
        }
        image
    }

    fn optional_header_len(&self) -> usize {
        if self.pe64 { 240 } else { 224 }
    }

    fn data_directory_offset(&self) -> usize {
        OPT_OFFSET + if self.pe64 { 112 } else { 96 }
    }

    fn reloc_block(&self) -> Vec<u8> {
        if self.relocations.is_empty() {
            return Vec::new();
        }
        // Single block covering the .text page; pad to an even entry count
        // with an ABSOLUTE entry like real linkers do.
        let mut entries: Vec<u16> = self
            .relocations
            .iter()
            .map(|reloc| (reloc.kind << 12) | ((reloc.rva & 0xFFF) as u16))
            .collect();
        if entries.len() % 2 == 1 {
            entries.push(0);
        }
        let mut block = Vec::new();
        block.extend_from_slice(&0x1000u32.to_le_bytes());
        block.extend_from_slice(&((8 + entries.len() * 2) as u32).to_le_bytes());
        for entry in entries {
            block.extend_from_slice(&entry.to_le_bytes());
        }
        block
    }

    /// Serialize the on-disk file representation.
    pub fn build_file(&self) -> Vec<u8> {
        let mut sections = self.sections.clone();
        let reloc_block = self.reloc_block();
        if !reloc_block.is_empty() {
            let reloc = sections
                .iter_mut()
                .find(|section| &section.name[..6] == b".reloc")
                .expect("standard image has a .reloc section");
            reloc.data[..reloc_block.len()].copy_from_slice(&reloc_block);
        }

        let file_len = sections
            .iter()
            .map(|section| (section.raw_ptr + section.raw_size) as usize)
            .max()
            .unwrap_or(0x400);
        let mut file = vec![0u8; file_len];

        // DOS header.
        file[0] = b'M';
        file[1] = b'Z';
        file[0x3C..0x40].copy_from_slice(&(E_LFANEW as u32).to_le_bytes());

        // NT signature + COFF file header.
        file[E_LFANEW..E_LFANEW + 4].copy_from_slice(&0x0000_4550u32.to_le_bytes());
        let machine: u16 = if self.pe64 { 0x8664 } else { 0x014C };
        file[E_LFANEW + 4..E_LFANEW + 6].copy_from_slice(&machine.to_le_bytes());
        file[E_LFANEW + 6..E_LFANEW + 8]
            .copy_from_slice(&(sections.len() as u16).to_le_bytes());
        file[E_LFANEW + 20..E_LFANEW + 22]
            .copy_from_slice(&(self.optional_header_len() as u16).to_le_bytes());

        // Optional header.
        let magic: u16 = if self.pe64 { 0x020B } else { 0x010B };
        file[OPT_OFFSET..OPT_OFFSET + 2].copy_from_slice(&magic.to_le_bytes());
        if self.pe64 {
            file[OPT_OFFSET + 24..OPT_OFFSET + 32]
                .copy_from_slice(&self.image_base.to_le_bytes());
        } else {
            file[OPT_OFFSET + 28..OPT_OFFSET + 32]
                .copy_from_slice(&(self.image_base as u32).to_le_bytes());
        }
        // Section alignment / file alignment.
        file[OPT_OFFSET + 32..OPT_OFFSET + 36].copy_from_slice(&0x1000u32.to_le_bytes());
        file[OPT_OFFSET + 36..OPT_OFFSET + 40].copy_from_slice(&0x200u32.to_le_bytes());
        file[OPT_OFFSET + 56..OPT_OFFSET + 60]
            .copy_from_slice(&self.size_of_image.to_le_bytes());
        file[OPT_OFFSET + 60..OPT_OFFSET + 64].copy_from_slice(&0x400u32.to_le_bytes());

        // Data directories: base relocations (index 5) and the COM
        // descriptor (index 14).
        let dirs = self.data_directory_offset();
        if !reloc_block.is_empty() {
            file[dirs + 5 * 8..dirs + 5 * 8 + 4].copy_from_slice(&0x2000u32.to_le_bytes());
            file[dirs + 5 * 8 + 4..dirs + 5 * 8 + 8]
                .copy_from_slice(&(reloc_block.len() as u32).to_le_bytes());
        }
        if self.net_flavored {
            file[dirs + 14 * 8..dirs + 14 * 8 + 4].copy_from_slice(&0x2800u32.to_le_bytes());
            file[dirs + 14 * 8 + 4..dirs + 14 * 8 + 8].copy_from_slice(&0x48u32.to_le_bytes());
        }

        // Section table.
        let table = dirs + 16 * 8;
        for (index, section) in sections.iter().enumerate() {
            let entry = table + index * 40;
            file[entry..entry + 8].copy_from_slice(&section.name);
            file[entry + 8..entry + 12].copy_from_slice(&section.raw_size.to_le_bytes());
            file[entry + 12..entry + 16].copy_from_slice(&section.virtual_address.to_le_bytes());
            file[entry + 16..entry + 20].copy_from_slice(&section.raw_size.to_le_bytes());
            file[entry + 20..entry + 24].copy_from_slice(&section.raw_ptr.to_le_bytes());
            file[entry + 36..entry + 40].copy_from_slice(&section.characteristics.to_le_bytes());
        }

        // Section raw data.
        for section in &sections {
            let start = section.raw_ptr as usize;
            file[start..start + section.data.len()].copy_from_slice(&section.data);
        }

        file
    }

    /// Expand the file the way the loader would at `load_base`: headers at
    /// the base, sections at their RVAs, fix-ups applied, zero fill
    /// elsewhere.
    pub fn map_at(&self, file: &[u8], load_base: u64) -> Vec<u8> {
        let mut memory = vec![0u8; self.size_of_image as usize];
        memory[..0x400].copy_from_slice(&file[..0x400]);
        for section in &self.sections {
            let va = section.virtual_address as usize;
            let raw = section.raw_ptr as usize;
            let len = section.raw_size as usize;
            memory[va..va + len].copy_from_slice(&file[raw..raw + len]);
        }

        // Apply the declared fix-ups directly, independent of the code
        // under test.
        let delta = load_base.wrapping_sub(self.image_base);
        for reloc in &self.relocations {
            let at = reloc.rva as usize;
            match reloc.kind {
                10 => {
                    let current =
                        u64::from_le_bytes(memory[at..at + 8].try_into().unwrap());
                    memory[at..at + 8]
                        .copy_from_slice(&current.wrapping_add(delta).to_le_bytes());
                }
                3 => {
                    let current =
                        u32::from_le_bytes(memory[at..at + 4].try_into().unwrap());
                    memory[at..at + 4]
                        .copy_from_slice(&current.wrapping_add(delta as u32).to_le_bytes());
                }
                _ => {}
            }
        }
        memory
    }

    /// Region table for an image mapped at `load_base`: one page-aligned
    /// region per content stretch, execute protection following the section
    /// characteristics.
    pub fn regions_at(&self, load_base: u64) -> Vec<RegionInfo> {
        let mut regions = vec![RegionInfo {
            base: load_base,
            allocation_base: load_base,
            size: 0x1000,
            protect: 0x02,
            is_image: true,
        }];
        for section in &self.sections {
            let executable = section.characteristics & 0x2000_0000 != 0;
            regions.push(RegionInfo {
                base: load_base + u64::from(section.virtual_address),
                allocation_base: load_base,
                // The loader maps whole pages.
                size: u64::from(section.raw_size.next_multiple_of(0x1000)),
                protect: if executable { 0x20 } else { 0x02 },
                is_image: true,
            });
        }
        regions
    }
}

/// Buffer-backed process fake serving one mapped image.
pub struct MappedProcess {
    pub pid: u32,
    pub base: u64,
    pub memory: Vec<u8>,
    pub regions: Vec<RegionInfo>,
    pub backing_file: Option<String>,
    pub readable: bool,
}

impl ProcessMemory for MappedProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        if !self.readable {
            return Err(GlassError::MemoryUnavailable {
                pid: self.pid,
                address,
            });
        }
        let offset = address.checked_sub(self.base).ok_or(GlassError::MemoryUnavailable {
            pid: self.pid,
            address,
        })? as usize;
        let end = offset + buf.len();
        if end > self.memory.len() {
            return Err(GlassError::MemoryUnavailable {
                pid: self.pid,
                address,
            });
        }
        buf.copy_from_slice(&self.memory[offset..end]);
        Ok(())
    }

    fn query_region(&self, address: u64) -> Option<RegionInfo> {
        self.regions
            .iter()
            .find(|region| address >= region.base && address < region.base + region.size)
            .copied()
    }

    fn mapped_file(&self, address: u64) -> Option<String> {
        let end = self.base + self.memory.len() as u64;
        (address >= self.base && address < end)
            .then(|| self.backing_file.clone())
            .flatten()
    }
}

/// In-memory hive over a flat key → values map.
#[derive(Default)]
pub struct MapHive {
    values: HashMap<String, Vec<(String, ValueData)>>,
    children: HashMap<String, Vec<String>>,
}

impl MapHive {
    pub fn insert_value(&mut self, key: &str, name: &str, data: ValueData) {
        let mut current = String::new();
        for part in key.split('\\') {
            let child = if current.is_empty() {
                part.to_string()
            } else {
                format!("{current}\\{part}")
            };
            if !current.is_empty() {
                let children = self.children.entry(current.clone()).or_default();
                if !children.contains(&child) {
                    children.push(child.clone());
                }
            }
            current = child;
        }
        self.values
            .entry(key.to_string())
            .or_default()
            .push((name.to_string(), data));
    }
}

impl HiveReader for MapHive {
    fn enumerate_values(&self, key: &str) -> Result<Vec<RegistryValue>> {
        Ok(self
            .values
            .get(key)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(name, data)| RegistryValue {
                        key: key.to_string(),
                        name: name.clone(),
                        data: data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn enumerate_subkeys(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.children.get(key).cloned().unwrap_or_default())
    }
}

/// Verifier that trusts nothing.
pub struct NothingSigned;

impl SignatureVerifier for NothingSigned {
    fn is_signed(&self, _path: &Path) -> bool {
        false
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

    fn name_query(&self) -> Arc<deepglass::handles::resolver::QueryFn> {
        Arc::new(|_, _| deepglass::handles::resolver::QueryStatus::Complete(None))
    }
}

/// Sources over an in-memory hive with nothing signed and no live system
/// state.
pub fn fake_sources(hive: MapHive) -> Sources {
    Sources {
        hive: Arc::new(hive),
        verifier: Arc::new(NothingSigned),
        processes: Arc::new(NoProcesses),
        handles: Arc::new(NoHandles),
    }
}
