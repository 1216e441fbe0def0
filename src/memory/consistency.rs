//! Per-image consistency analysis: section coherency, analytic relocation
//! replay, and byte-level comparison of executable sections against the
//! backing file.
//!
//! The file side of every comparison is a full in-memory copy of the
//! backing file with relocations applied analytically for the observed
//! load base; the memory side is read page-by-page out of the target
//! process.

use std::path::Path;

use crate::core::errors::Result;
use crate::pe::headers::{
    DATA_DIRECTORY_COUNT, DATA_DIRECTORY_LEN, DIR_ENTRY_BASERELOC, DIR_ENTRY_COM_DESCRIPTOR,
    DOS_HEADER_LEN, NtHeaders, RvaConverter, SECTION_HEADER_LEN, SectionMap,
};
use crate::pe::view::{PeView, add_u16_at, add_u32_at, add_u64_at};
use crate::pe::{is_pe_data, is_pe_file};
use crate::platform::{ProcessMemory, RegionInfo, clear_current_transaction};

const PAGE: u64 = 0x1000;
/// Executable sections may legitimately differ from disk by up to this many
/// bytes (import thunks and hot-patch stubs); anything past it is tampering.
const DIFF_THRESHOLD: usize = 0x500;
/// How much of the in-memory image is snapshotted for header comparison.
const HEADER_SNAPSHOT: u64 = 0x2000;

/// Verdict of one mapped-image check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapConsistency {
    /// The in-memory image matches its backing file.
    Consistent,
    /// The in-memory image diverges from its backing file.
    Inconsistent,
    /// The mapping is not properly backed by a file.
    BadMap,
    /// The backing file does not conform to the PE standard.
    NotPe,
    /// The check itself failed.
    Error,
}

impl MapConsistency {
    /// Report label used in the grouped output.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Consistent => "Consistent",
            Self::Inconsistent => "Inconsistent With File",
            Self::BadMap => "Bad Map",
            Self::NotPe => "Mapped File Not a PE",
            Self::Error => "Error",
        }
    }
}

/// Result of checking one mapped image, carrying the originating mapping.
#[derive(Debug, Clone)]
pub struct ConsistencyReport {
    pub consistency: MapConsistency,
    pub comment: Option<String>,
    /// Process owning the mapping.
    pub pid: u32,
    /// Base address of the mapping.
    pub base: u64,
    /// Size of the mapping.
    pub size: u64,
    /// Backing file, when one was resolvable.
    pub image: Option<String>,
}

impl ConsistencyReport {
    fn new(
        consistency: MapConsistency,
        comment: Option<String>,
        process: &dyn ProcessMemory,
        base: u64,
        size: u64,
        image: Option<String>,
    ) -> Self {
        Self {
            consistency,
            comment,
            pid: process.pid(),
            base,
            size,
            image,
        }
    }
}

/// Check one mapped image region against its backing file.
pub fn check_mapped_consistency(
    process: &dyn ProcessMemory,
    base: u64,
    size: u64,
) -> ConsistencyReport {
    let report = |consistency, comment: Option<String>, image: Option<String>| {
        ConsistencyReport::new(consistency, comment, process, base, size, image)
    };

    // Probe one byte before doing anything expensive.
    let mut probe = [0u8; 1];
    if process.read(base, &mut probe).is_err() {
        return report(
            MapConsistency::Error,
            Some("Unable to read memory".to_string()),
            None,
        );
    }

    // A transaction inherited from the environment would make the lookup
    // below observe transacted file state, which is exactly the lie
    // doppelgänging tells. Clear it first.
    clear_current_transaction();
    let Some(image_path) = process.mapped_file(base) else {
        return report(
            MapConsistency::BadMap,
            Some("Potential Doppelganging".to_string()),
            None,
        );
    };
    let image = Some(image_path.clone());
    let file_path = Path::new(&image_path);

    if file_path.exists() && std::fs::File::open(file_path).is_err() {
        return report(
            MapConsistency::Error,
            Some("Unable to read file".to_string()),
            image,
        );
    }

    if !is_pe_file(file_path) {
        // On-disk bytes are not a PE. If the mapped bytes are, the file was
        // rewritten after the image was loaded.
        let mut head = vec![0u8; probe_len(size)];
        let memory_is_pe =
            process.read(base, &mut head).is_ok() && is_pe_data(&head);
        return if memory_is_pe {
            report(
                MapConsistency::BadMap,
                Some("Potential Herpaderping".to_string()),
                image,
            )
        } else {
            report(MapConsistency::NotPe, None, image)
        };
    }

    // Record the protection layout of every sub-region in the mapping.
    let mut regions = Vec::new();
    let mut cursor = base;
    while cursor < base + size {
        let Some(region) = process.query_region(cursor) else {
            return report(
                MapConsistency::Error,
                Some("Unable to scan memory protections".to_string()),
                image,
            );
        };
        if region.size == 0 {
            return report(
                MapConsistency::Error,
                Some("Unable to scan memory protections".to_string()),
                image,
            );
        }
        cursor += region.size;
        regions.push(region);
    }

    let Ok(mut file_bytes) = std::fs::read(file_path) else {
        return report(
            MapConsistency::Error,
            Some("Unable to read backing file".to_string()),
            image,
        );
    };

    let mut mem_header = vec![0u8; probe_len_large(size)];
    if process.read(base, &mut mem_header).is_err() {
        return report(
            MapConsistency::Error,
            Some("Unable to read memory".to_string()),
            image,
        );
    }

    match check_section_coherency(&file_bytes, &mem_header, size) {
        Ok(None) => {}
        Ok(Some(comment)) => {
            return report(MapConsistency::Inconsistent, Some(comment), image);
        }
        Err(err) => {
            return report(
                MapConsistency::Error,
                Some(format!("Malformed image headers: {err}")),
                image,
            );
        }
    }

    if simulate_relocations(&mut file_bytes, base).is_none() {
        eprintln!(
            "[DG-MEM] unable to apply relocations for image at {base:#x} ({image_path}) in PID {}; this may inflate the difference count",
            process.pid()
        );
    }

    match check_executable_consistency(&file_bytes, process, base, &regions) {
        Ok(ExecutableVerdict::OutsideSection) => report(
            MapConsistency::Inconsistent,
            Some("Executable Memory not in a Section".to_string()),
            image,
        ),
        Ok(ExecutableVerdict::ByteDifference(diff)) => {
            let comment = Some(format!("{diff} bytes differ."));
            if diff > DIFF_THRESHOLD {
                report(MapConsistency::Inconsistent, comment, image)
            } else {
                report(MapConsistency::Consistent, comment, image)
            }
        }
        Err(ExecutableError::MemoryUnreadable) => report(
            MapConsistency::Error,
            Some("Unable to read memory".to_string()),
            image,
        ),
        Err(ExecutableError::Malformed(details)) => report(
            MapConsistency::Error,
            Some(format!("Malformed image headers: {details}")),
            image,
        ),
    }
}

fn probe_len(size: u64) -> usize {
    usize::try_from(size.min(0x400)).unwrap_or(0x400)
}

fn probe_len_large(size: u64) -> usize {
    usize::try_from(size.min(HEADER_SNAPSHOT)).unwrap_or(HEADER_SNAPSHOT as usize)
}

/// Compare the header structures of the file and memory images.
///
/// Returns `Ok(None)` when coherent, `Ok(Some(comment))` naming the first
/// incoherence, or `Err` when either side's headers cannot be parsed at
/// all.
///
/// The image-size offset is chosen by the *file* optional-header magic.
/// The data-directory offsets are chosen per side, but only once the .NET
/// directory shows a size: .NET images may rewrite their in-memory
/// optional-header magic, and a blanket per-side choice would let a fake
/// relocation table slide a crafted section table past the comparison.
pub fn check_section_coherency(
    file: &[u8],
    memory: &[u8],
    region_size: u64,
) -> Result<Option<String>> {
    let file_view = PeView::new(file);
    let mem_view = PeView::new(memory);

    if file_view.bytes(0, DOS_HEADER_LEN)? != mem_view.bytes(0, DOS_HEADER_LEN)? {
        return Ok(Some("DOS header mismatch".to_string()));
    }

    let file_nt = NtHeaders::locate(&file_view)?;
    let mem_nt = NtHeaders::locate_unchecked(&mem_view)?;

    if file_nt.number_of_sections(&file_view)? != mem_nt.number_of_sections(&mem_view)? {
        return Ok(Some("Section count mismatch".to_string()));
    }
    if file_nt.machine(&file_view)? != mem_nt.machine(&mem_view)? {
        return Ok(Some("Architecture mismatch".to_string()));
    }

    let file_magic = file_nt.optional_magic(&file_view)?;
    let image_size =
        file_view.u32_at(file_nt.offset + NtHeaders::size_of_image_offset(file_magic))?;
    if u64::from(image_size) != region_size {
        return Ok(Some("Image Size Mismatch".to_string()));
    }

    let file_dirs = file_nt.offset + NtHeaders::data_directory_offset(file_magic);
    // By default the memory-side directories sit at the file-side offset;
    // a .NET image (nonzero COM-descriptor size) re-derives the offset
    // from the memory-side magic.
    let mut mem_dirs = mem_nt.offset + NtHeaders::data_directory_offset(file_magic);
    let (_, net_size) =
        file_nt.data_directory(&file_view, file_magic, DIR_ENTRY_COM_DESCRIPTOR)?;
    if net_size != 0 {
        let mem_magic = mem_nt.optional_magic(&mem_view)?;
        mem_dirs = mem_nt.offset + NtHeaders::data_directory_offset(mem_magic);
    }

    let dirs_len = DATA_DIRECTORY_LEN * DATA_DIRECTORY_COUNT;
    if file_view.bytes(file_dirs, dirs_len)? != mem_view.bytes(mem_dirs, dirs_len)? {
        return Ok(Some("Data directory mismatch".to_string()));
    }

    // Section tables follow the data directories on each side.
    let count = file_nt.number_of_sections(&file_view)? as usize;
    let file_table = file_dirs + dirs_len;
    let mem_table = mem_dirs + dirs_len;
    for index in 0..count {
        let file_section =
            crate::pe::headers::SectionHeader::parse(&file_view, file_table + index * SECTION_HEADER_LEN)?;
        let mem_section =
            crate::pe::headers::SectionHeader::parse(&mem_view, mem_table + index * SECTION_HEADER_LEN)?;

        let acceptable = mem_section.characteristics == file_section.characteristics
            && mem_section.virtual_address == file_section.virtual_address
            && mem_section.size_of_raw_data == file_section.size_of_raw_data
            && mem_section.virtual_size == file_section.virtual_size
            && (mem_section.pointer_to_raw_data == file_section.pointer_to_raw_data
                || file_section.size_of_raw_data == 0);
        if !acceptable {
            return Ok(Some("Section header mismatch".to_string()));
        }
    }

    Ok(None)
}

/// Apply the base relocations to `file` as the loader would for an image
/// loaded at `load_base`.
///
/// Returns the number of relocation entries walked, or `None` when the
/// relocation table cannot be located. A `None` is survivable: the caller
/// warns and proceeds with an unrelocated file image.
pub fn simulate_relocations(file: &mut Vec<u8>, load_base: u64) -> Option<usize> {
    let view = PeView::new(file);
    let nt = NtHeaders::locate(&view).ok()?;
    let magic = nt.optional_magic(&view).ok()?;

    let (dir_rva, dir_size) = nt.data_directory(&view, magic, DIR_ENTRY_BASERELOC).ok()?;
    let image_base = nt.image_base(&view, magic).ok()?;
    let delta = load_base.wrapping_sub(image_base);

    if dir_size == 0 {
        return Some(0);
    }

    let sections = nt.sections(&view, magic).ok()?;
    let converter = RvaConverter::from_sections(&sections);
    let table_start = converter.raw_offset(dir_rva)? as usize;
    let table_end = table_start + dir_size as usize;

    let mut applied = 0usize;
    let mut block_offset = table_start;
    loop {
        let view = PeView::new(file);
        let block_rva = view.u32_at(block_offset).ok()?;
        let block_size = view.u32_at(block_offset + 4).ok()? as usize;
        if block_size == 0 || block_offset >= table_end {
            break;
        }

        if converter.contains_page(block_rva) {
            // Every entry in a block shares the block's page, so one
            // translation covers the whole block.
            let block_raw = converter.raw_offset(block_rva)? as usize;
            let entries = (block_size - 8) / 2;
            for index in 0..entries {
                let entry = PeView::new(file).u16_at(block_offset + 8 + index * 2).ok()?;
                let kind = entry >> 12;
                let offset = block_raw + usize::from(entry & 0x0FFF);
                match kind {
                    // DIR64
                    10 => add_u64_at(file, offset, delta).ok()?,
                    // HIGHLOW
                    3 => add_u32_at(file, offset, delta as u32).ok()?,
                    // HIGH
                    1 => add_u16_at(file, offset, ((delta >> 16) & 0xFFFF) as u16).ok()?,
                    // LOW
                    2 => add_u16_at(file, offset, (delta & 0xFFFF) as u16).ok()?,
                    _ => {}
                }
                applied += 1;
            }
        }

        block_offset += block_size;
    }

    Some(applied)
}

/// Outcome of the executable-section comparison.
pub enum ExecutableVerdict {
    /// An executable page fell outside every section's raw range.
    OutsideSection,
    /// Total differing bytes across all executable pages.
    ByteDifference(usize),
}

/// Failure of the executable-section comparison.
pub enum ExecutableError {
    MemoryUnreadable,
    Malformed(String),
}

/// Byte-compare every executable page against its post-relocation file
/// counterpart, plus the loader's zero fill beyond end-of-raw-data.
pub fn check_executable_consistency(
    file: &[u8],
    process: &dyn ProcessMemory,
    base: u64,
    regions: &[RegionInfo],
) -> std::result::Result<ExecutableVerdict, ExecutableError> {
    let view = PeView::new(file);
    let nt = NtHeaders::locate(&view).map_err(|err| ExecutableError::Malformed(err.to_string()))?;
    let magic = nt
        .optional_magic(&view)
        .map_err(|err| ExecutableError::Malformed(err.to_string()))?;
    let sections = nt
        .sections(&view, magic)
        .map_err(|err| ExecutableError::Malformed(err.to_string()))?;
    let section_map = SectionMap::from_sections(&sections);

    let mut diff = 0usize;
    let mut page = vec![0u8; PAGE as usize];

    for region in regions {
        if !region.is_executable() {
            continue;
        }
        let mut region_offset = 0u64;
        while region_offset < region.size {
            let alloc_offset = region.base - region.allocation_base + region_offset;
            let rva = u32::try_from(alloc_offset)
                .map_err(|_| ExecutableError::Malformed("mapping exceeds 4 GiB".to_string()))?;

            let Some(section) = section_map.section_for(rva) else {
                return Ok(ExecutableVerdict::OutsideSection);
            };

            let section_offset = rva - section.virtual_address;
            let in_section = (PAGE as u32).min(section.size_of_raw_data - section_offset) as usize;
            let leftover = PAGE as usize - in_section;

            let memory_page = &mut page[..in_section];
            process
                .read(base + alloc_offset, memory_page)
                .map_err(|_| ExecutableError::MemoryUnreadable)?;
            let file_offset = (section.pointer_to_raw_data + section_offset) as usize;
            let file_page = view
                .bytes(file_offset, in_section)
                .map_err(|err| ExecutableError::Malformed(err.to_string()))?;
            diff += compute_difference(memory_page, file_page);

            if leftover > 0 {
                let mut tail = vec![0u8; leftover];
                process
                    .read(base + alloc_offset + in_section as u64, &mut tail)
                    .map_err(|_| ExecutableError::MemoryUnreadable)?;
                diff += count_nonzero(&tail);
            }

            region_offset += PAGE;
        }
    }

    Ok(ExecutableVerdict::ByteDifference(diff))
}

/// Count differing bytes between two equal-length buffers. Pages are
/// expected to be identical almost always, so the fast path is a
/// page-granularity equality check with the byte-counting loop reserved
/// for pages that differ.
#[must_use]
pub fn compute_difference(a: &[u8], b: &[u8]) -> usize {
    debug_assert_eq!(a.len(), b.len());
    let len = a.len().min(b.len());
    let full = len & !0xFFF;
    let mut diff = 0usize;
    let mut offset = 0;
    while offset < full {
        let (lhs, rhs) = (&a[offset..offset + 0x1000], &b[offset..offset + 0x1000]);
        if lhs != rhs {
            diff += count_differing(lhs, rhs);
        }
        offset += 0x1000;
    }
    diff + count_differing(&a[full..len], &b[full..len])
}

fn count_differing(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).filter(|(x, y)| x != y).count()
}

/// Count nonzero bytes; the loader zero-fills past end-of-raw-data, so
/// anything nonzero there was written after mapping.
#[must_use]
pub fn count_nonzero(buf: &[u8]) -> usize {
    buf.iter().filter(|byte| **byte != 0).count()
}
