//! Typed accessors for the fixed-layout PE headers, plus the RVA/raw-offset
//! converters the consistency checker is built on.
//!
//! Offsets are expressed relative to the NT-header base so the same walk
//! works on a raw file buffer and on a header snapshot read out of another
//! process. The optional-header magic (`0x20B` = 64-bit) decides every
//! architecture-dependent offset; the file-header machine field is not
//! trusted for layout because .NET binaries let the two disagree.

use std::collections::BTreeMap;

use crate::core::errors::{GlassError, Result};
use crate::pe::view::PeView;

pub const DOS_MAGIC: u16 = 0x5A4D;
pub const PE_SIGNATURE: u32 = 0x0000_4550;
/// Size of the DOS header compared byte-for-byte during coherency checks.
pub const DOS_HEADER_LEN: usize = 0x40;
pub const E_LFANEW_OFFSET: usize = 0x3C;

pub const PE32_MAGIC: u16 = 0x010B;
pub const PE32PLUS_MAGIC: u16 = 0x020B;

pub const SECTION_HEADER_LEN: usize = 40;
pub const DATA_DIRECTORY_LEN: usize = 8;
pub const DATA_DIRECTORY_COUNT: usize = 16;
/// Index of the base-relocation data directory.
pub const DIR_ENTRY_BASERELOC: usize = 5;
/// Index of the .NET (COM descriptor) data directory.
pub const DIR_ENTRY_COM_DESCRIPTOR: usize = 14;

/// Offset of the optional header from the NT-header base (signature plus
/// COFF file header; identical for both architectures).
pub const OPTIONAL_HEADER_OFFSET: usize = 24;

const PAGE: u32 = 0x1000;
const PAGE_MASK: u32 = 0xFFF;

/// Resolved location of the NT headers within an image buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtHeaders {
    /// Offset of the `PE\0\0` signature from the image base.
    pub offset: usize,
}

impl NtHeaders {
    /// Follow the DOS header's `e_lfanew` and verify the PE signature.
    pub fn locate(view: &PeView<'_>) -> Result<Self> {
        if view.u16_at(0)? != DOS_MAGIC {
            return Err(GlassError::malformed("missing MZ magic"));
        }
        let offset = view.u32_at(E_LFANEW_OFFSET)? as usize;
        if view.u32_at(offset)? != PE_SIGNATURE {
            return Err(GlassError::malformed("missing PE signature"));
        }
        Ok(Self { offset })
    }

    /// Follow `e_lfanew` without requiring the PE signature. Used on the
    /// memory side of coherency checks, where the signature bytes are part
    /// of what is being compared, not a precondition.
    pub fn locate_unchecked(view: &PeView<'_>) -> Result<Self> {
        let offset = view.u32_at(E_LFANEW_OFFSET)? as usize;
        // Field reads must still land inside the buffer.
        view.u16_at(offset + 4)?;
        Ok(Self { offset })
    }

    pub fn machine(&self, view: &PeView<'_>) -> Result<u16> {
        view.u16_at(self.offset + 4)
    }

    pub fn number_of_sections(&self, view: &PeView<'_>) -> Result<u16> {
        view.u16_at(self.offset + 6)
    }

    /// The optional-header magic word; `0x20B` marks a 64-bit image.
    pub fn optional_magic(&self, view: &PeView<'_>) -> Result<u16> {
        view.u16_at(self.offset + OPTIONAL_HEADER_OFFSET)
    }

    /// Offset (from the NT base) of the `SizeOfImage` field for the given
    /// magic word.
    #[must_use]
    pub fn size_of_image_offset(magic: u16) -> usize {
        // The field happens to share its offset across architectures, but
        // the choice is still keyed on the magic the caller passes in.
        let _ = magic;
        OPTIONAL_HEADER_OFFSET + 56
    }

    /// Offset (from the NT base) of the data-directory array for the given
    /// magic word.
    #[must_use]
    pub fn data_directory_offset(magic: u16) -> usize {
        OPTIONAL_HEADER_OFFSET + if magic == PE32PLUS_MAGIC { 112 } else { 96 }
    }

    /// Offset (from the NT base) of the section table for the given magic
    /// word, equal to the end of the data-directory array.
    #[must_use]
    pub fn section_table_offset(magic: u16) -> usize {
        Self::data_directory_offset(magic) + DATA_DIRECTORY_LEN * DATA_DIRECTORY_COUNT
    }

    /// The preferred load address declared in the optional header.
    pub fn image_base(&self, view: &PeView<'_>, magic: u16) -> Result<u64> {
        if magic == PE32PLUS_MAGIC {
            view.u64_at(self.offset + OPTIONAL_HEADER_OFFSET + 24)
        } else {
            Ok(u64::from(view.u32_at(self.offset + OPTIONAL_HEADER_OFFSET + 28)?))
        }
    }

    /// Read one data-directory entry as `(virtual_address, size)`.
    pub fn data_directory(
        &self,
        view: &PeView<'_>,
        magic: u16,
        index: usize,
    ) -> Result<(u32, u32)> {
        let entry = self.offset + Self::data_directory_offset(magic) + index * DATA_DIRECTORY_LEN;
        Ok((view.u32_at(entry)?, view.u32_at(entry + 4)?))
    }

    /// Parse the full section table.
    pub fn sections(&self, view: &PeView<'_>, magic: u16) -> Result<Vec<SectionHeader>> {
        let count = self.number_of_sections(view)? as usize;
        let table = self.offset + Self::section_table_offset(magic);
        (0..count)
            .map(|index| SectionHeader::parse(view, table + index * SECTION_HEADER_LEN))
            .collect()
    }
}

/// One entry of the section table, in file-layout field order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub characteristics: u32,
}

impl SectionHeader {
    pub fn parse(view: &PeView<'_>, offset: usize) -> Result<Self> {
        Ok(Self {
            virtual_size: view.u32_at(offset + 8)?,
            virtual_address: view.u32_at(offset + 12)?,
            size_of_raw_data: view.u32_at(offset + 16)?,
            pointer_to_raw_data: view.u32_at(offset + 20)?,
            characteristics: view.u32_at(offset + 36)?,
        })
    }
}

/// Page-by-page map from relative virtual addresses to raw file offsets.
///
/// Covers exactly the union of the sections' raw ranges; an RVA whose page
/// is outside every section has no raw counterpart.
#[derive(Debug, Default)]
pub struct RvaConverter {
    pages: BTreeMap<u32, u32>,
}

impl RvaConverter {
    #[must_use]
    pub fn from_sections(sections: &[SectionHeader]) -> Self {
        let mut pages = BTreeMap::new();
        for section in sections {
            let mut rva = section.virtual_address;
            let end = section.virtual_address.saturating_add(section.size_of_raw_data);
            while rva < end {
                pages.entry(rva).or_insert(
                    rva - section.virtual_address + section.pointer_to_raw_data,
                );
                rva = match rva.checked_add(PAGE) {
                    Some(next) => next,
                    None => break,
                };
            }
        }
        Self { pages }
    }

    /// Whether the page containing `rva` maps to file content.
    #[must_use]
    pub fn contains_page(&self, rva: u32) -> bool {
        self.pages.contains_key(&(rva & !PAGE_MASK))
    }

    /// Translate an RVA to its raw file offset, page-aligned lookup plus
    /// in-page offset.
    #[must_use]
    pub fn raw_offset(&self, rva: u32) -> Option<u32> {
        self.pages
            .get(&(rva & !PAGE_MASK))
            .map(|base| base + (rva & PAGE_MASK))
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

/// Page-by-page map from relative virtual addresses to the section that
/// owns them, used when walking executable regions.
#[derive(Debug, Default)]
pub struct SectionMap {
    pages: BTreeMap<u32, SectionHeader>,
}

impl SectionMap {
    #[must_use]
    pub fn from_sections(sections: &[SectionHeader]) -> Self {
        let mut pages = BTreeMap::new();
        for section in sections {
            let mut rva = section.virtual_address;
            let end = section.virtual_address.saturating_add(section.size_of_raw_data);
            while rva < end {
                pages.entry(rva).or_insert(*section);
                rva = match rva.checked_add(PAGE) {
                    Some(next) => next,
                    None => break,
                };
            }
        }
        Self { pages }
    }

    /// The section owning the page that contains `rva`, if any.
    #[must_use]
    pub fn section_for(&self, rva: u32) -> Option<&SectionHeader> {
        self.pages.get(&(rva & !PAGE_MASK))
    }
}
