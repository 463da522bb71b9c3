//! Read-only metadata of a loaded executable image.
//!
//! The patcher only needs names and addresses, so [`ImageInfo`] is plain owned data. [`ImageInfo::parse_elf`] fills
//! it from an ELF file; tests build it by hand.

use std::ops::Range;

use log::{debug, info};
use xmas_elf::program::Type as ProgramType;
use xmas_elf::sections::{SectionData, SectionHeader};
use xmas_elf::symbol_table::Entry;
use xmas_elf::ElfFile;

use crate::arch::ArchId;
use crate::error::{Error, Result};

const PAGE_BITS: u64 = (1 << 12) - 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Relocation {
    /// Address of the cell the relocation fills in.
    pub addr: u64,
    pub symbol: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub value: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub addr: u64,
    pub mem_size: u64,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageInfo {
    pub arch: ArchId,
    pub entry_point: u64,
    pub relocations: Vec<Relocation>,
    pub symbols: Vec<Symbol>,
    pub segments: Vec<Segment>,
}

fn elf_err(e: impl std::fmt::Display) -> Error {
    Error::Image(e.to_string())
}

impl ImageInfo {
    pub fn parse_elf(bytes: &[u8]) -> Result<ImageInfo> {
        let elf = ElfFile::new(bytes).map_err(elf_err)?;
        let arch = ArchId::from_elf_machine(elf.header.pt2.machine().as_machine())?;
        let entry_point = elf.header.pt2.entry_point();
        info!("Parsed {arch} ELF image, entry point 0x{entry_point:X}");

        let mut segments = Vec::new();
        for header in elf.program_iter() {
            if header.get_type() != Ok(ProgramType::Load) {
                continue
            }

            let offset = header.offset() as usize;
            let file_size = header.file_size() as usize;
            let data = bytes
                .get(offset..offset + file_size)
                .ok_or_else(|| Error::Image(format!("segment at 0x{:X} extends past end of file", header.virtual_addr())))?;
            debug!(
                "Segment 0x{:X}..0x{:X} (file size 0x{:X})",
                header.virtual_addr(),
                header.virtual_addr() + header.mem_size(),
                file_size
            );
            segments.push(Segment {
                addr: header.virtual_addr(),
                mem_size: header.mem_size(),
                data: data.to_vec(),
            });
        }

        let mut relocations = Vec::new();
        let mut symbols = Vec::new();
        for section in elf.section_iter() {
            match section.get_data(&elf) {
                Ok(SectionData::Rela64(entries)) => {
                    let names = linked_symbol_names(&elf, &section)?;
                    for rela in entries {
                        push_relocation(&mut relocations, &names, rela.get_offset(), rela.get_symbol_table_index());
                    }
                },
                Ok(SectionData::Rel64(entries)) => {
                    let names = linked_symbol_names(&elf, &section)?;
                    for rel in entries {
                        push_relocation(&mut relocations, &names, rel.get_offset(), rel.get_symbol_table_index());
                    }
                },
                Ok(SectionData::Rela32(entries)) => {
                    let names = linked_symbol_names(&elf, &section)?;
                    for rela in entries {
                        push_relocation(&mut relocations, &names, rela.get_offset() as u64, rela.get_symbol_table_index());
                    }
                },
                Ok(SectionData::Rel32(entries)) => {
                    let names = linked_symbol_names(&elf, &section)?;
                    for rel in entries {
                        push_relocation(&mut relocations, &names, rel.get_offset() as u64, rel.get_symbol_table_index());
                    }
                },
                Ok(SectionData::SymbolTable64(_))
                | Ok(SectionData::DynSymbolTable64(_))
                | Ok(SectionData::SymbolTable32(_))
                | Ok(SectionData::DynSymbolTable32(_)) => {
                    symbols.extend(
                        symbol_table(&elf, &section)?
                            .into_iter()
                            .filter(|(name, _)| !name.is_empty())
                            .map(|(name, value)| Symbol {
                                name,
                                value,
                            }),
                    );
                },
                _ => (),
            }
        }

        info!(
            "Found {} relocation(s) and {} symbol(s) in {} loadable segment(s)",
            relocations.len(),
            symbols.len(),
            segments.len()
        );

        Ok(ImageInfo {
            arch,
            entry_point,
            relocations,
            symbols,
            segments,
        })
    }

    /// Page-aligned ranges covering all loadable segments, with overlapping or touching pages merged.
    pub fn mapped_ranges(&self) -> Vec<Range<u64>> {
        let mut ranges = self
            .segments
            .iter()
            .filter(|s| s.mem_size > 0)
            .map(|s| {
                let start = s.addr & !PAGE_BITS;
                let end = (s.addr + s.mem_size + PAGE_BITS) & !PAGE_BITS;
                start..end
            })
            .collect::<Vec<_>>();
        ranges.sort_by_key(|r| r.start);

        let mut merged: Vec<Range<u64>> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
                _ => merged.push(range),
            }
        }

        merged
    }
}

fn push_relocation(out: &mut Vec<Relocation>, names: &[(String, u64)], addr: u64, symbol_index: u32) {
    if symbol_index == 0 {
        return
    }

    if let Some((name, _)) = names.get(symbol_index as usize).filter(|(name, _)| !name.is_empty()) {
        out.push(Relocation {
            addr,
            symbol: name.clone(),
        });
    }
}

/// The symbol table a relocation section refers to through its `sh_link`.
fn linked_symbol_names<'a>(elf: &ElfFile<'a>, section: &SectionHeader<'a>) -> Result<Vec<(String, u64)>> {
    let link = elf.section_header(section.link() as u16).map_err(elf_err)?;
    symbol_table(elf, &link)
}

fn symbol_table<'a>(elf: &ElfFile<'a>, section: &SectionHeader<'a>) -> Result<Vec<(String, u64)>> {
    fn collect<'a, E: Entry>(elf: &ElfFile<'a>, entries: &'a [E]) -> Result<Vec<(String, u64)>> {
        entries
            .iter()
            .map(|entry| Ok((entry.get_name(elf).map_err(elf_err)?.to_string(), entry.value())))
            .collect()
    }

    match section.get_data(elf).map_err(elf_err)? {
        SectionData::SymbolTable64(entries) => collect(elf, entries),
        SectionData::DynSymbolTable64(entries) => collect(elf, entries),
        SectionData::SymbolTable32(entries) => collect(elf, entries),
        SectionData::DynSymbolTable32(entries) => collect(elf, entries),
        _ => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(addr: u64, mem_size: u64) -> Segment {
        Segment {
            addr,
            mem_size,
            data: Vec::new(),
        }
    }

    #[test]
    fn mapped_ranges_merge_shared_pages() {
        let image = ImageInfo {
            arch: ArchId::X86_64,
            entry_point: 0x401000,
            relocations: Vec::new(),
            symbols: Vec::new(),
            segments: vec![segment(0x403E10, 0x230), segment(0x400000, 0x5A8), segment(0x401000, 0x1F5), segment(0x0, 0)],
        };

        assert_eq!(image.mapped_ranges(), vec![0x400000..0x402000, 0x403000..0x405000]);
    }

    #[test]
    fn garbage_is_not_an_image() {
        assert!(matches!(ImageInfo::parse_elf(b"definitely not an ELF file"), Err(Error::Image(_))));
    }
}
