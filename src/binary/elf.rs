// This module writes a Binary as a 64-bit ELF executable. Encoding happens in two phases.
// layout() validates the binary, resolves the entry symbol, and computes every offset,
// address and size in the file, including the addresses of the optional symbol table and
// symbol-name sections, which are placed on the pages after the last program section.
// emit() then produces the bytes from the binary and its layout; symbol records need
// the final section indices and addresses, which is why they are only built there. The
// file is: ELF header, program headers (one PT_LOAD per section), section headers, the
// section-name string table, then page-aligned section data. Zeroed sections occupy no
// file bytes, and the final section is not padded.

//! ELF64 executable encoder.

use super::{Binary, Permissions, SymbolKind};
use crate::core::error::{ElfError, ElfResult};
use object::elf;
use object::endian::{U16, U32, U64};
use object::pod::bytes_of;
use object::Endianness;

/// Page size used to align section data.
pub const PAGE_SIZE: u64 = 0x1000;

/// OS/ABI identifier written into the ELF header.
pub const OS_ABI: u8 = 0x1e;

const FILE_HEADER_SIZE: u64 = 0x40;
const PROGRAM_HEADER_SIZE: u64 = 0x38;
const SECTION_HEADER_SIZE: u64 = 0x40;
const SYMBOL_SIZE: u64 = 24;

/// Name of the section-name string table.
pub const SECTION_NAMES: &str = "section names";
/// Name of the symbol table section.
pub const SYMBOL_TABLE: &str = "symbol table";
/// Name of the symbol-name string table.
pub const SYMBOL_NAMES: &str = "symbol names";

/// Rounds `n` up to a multiple of `align`, or `None` if the result does
/// not fit in a `u64`.
pub fn align_up(n: u64, align: u64) -> Option<u64> {
    n.div_ceil(align).checked_mul(align)
}

/// What a placed section holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacedKind {
    /// `Binary::sections[i]`.
    Program(usize),
    SymbolTable,
    SymbolNames,
}

/// Position of one loadable section in memory and in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placed {
    pub kind: PlacedKind,
    pub name_offset: u32,
    pub address: u64,
    pub mem_size: u64,
    pub file_offset: u64,
    pub file_size: u64,
    pub permissions: Permissions,
    pub is_zeroed: bool,
}

impl Placed {
    fn file_end(&self) -> u64 {
        self.file_offset + self.file_size
    }
}

/// Every offset and address in the output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub entry: u64,
    pub program_headers_offset: u64,
    pub section_headers_offset: u64,
    pub section_names_offset: u64,
    pub section_names: Vec<u8>,
    pub sections: Vec<Placed>,
    pub file_size: u64,
}

impl Layout {
    pub fn section_header_count(&self) -> usize {
        self.sections.len() + 2
    }

    /// Address of the section with the given kind.
    pub fn address_of(&self, kind: PlacedKind) -> Option<u64> {
        self.sections.iter().find(|p| p.kind == kind).map(|p| p.address)
    }
}

/// Computes the file layout for `bin`.
pub fn layout(bin: &Binary) -> ElfResult<Layout> {
    if bin.arch.pointer_size != 8 {
        return Err(ElfError::UnsupportedClass {
            bits: 8 * bin.arch.pointer_size as u32,
        });
    }

    let entry = bin.symbol(&bin.entry).ok_or_else(|| ElfError::MissingEntry {
        name: bin.entry.clone(),
    })?;
    if entry.kind != SymbolKind::Function {
        return Err(ElfError::EntryNotFunction {
            name: bin.entry.clone(),
            kind: entry.kind.name(),
        });
    }
    for sym in &bin.symbols {
        if sym.section >= bin.sections.len() {
            return Err(ElfError::BadSymbolSection {
                name: sym.name.clone(),
                section: sym.section,
                count: bin.sections.len(),
            });
        }
    }

    let placed_count = bin.sections.len() + if bin.symbol_table { 2 } else { 0 };
    if placed_count + 2 >= elf::SHN_LORESERVE as usize {
        return Err(ElfError::TooMany {
            what: "sections",
            count: placed_count,
        });
    }

    let mut names = vec![0u8];
    let mut add_name = |name: &str| {
        let offset = names.len() as u32;
        names.extend_from_slice(name.as_bytes());
        names.push(0);
        offset
    };
    add_name(SECTION_NAMES);

    let mut sections: Vec<Placed> = bin
        .sections
        .iter()
        .enumerate()
        .map(|(i, sect)| Placed {
            kind: PlacedKind::Program(i),
            name_offset: add_name(&sect.name),
            address: sect.address,
            mem_size: sect.size(),
            file_offset: 0,
            file_size: if sect.is_zeroed { 0 } else { sect.size() },
            permissions: sect.permissions,
            is_zeroed: sect.is_zeroed,
        })
        .collect();

    let mut last_end = 0;
    for sect in &bin.sections {
        let end = sect.end().ok_or_else(|| ElfError::AddressOverflow {
            section: sect.name.clone(),
        })?;
        last_end = last_end.max(end);
    }

    if bin.symbol_table {
        let overflow = |section: &str| ElfError::AddressOverflow {
            section: section.to_string(),
        };
        let table_size = SYMBOL_SIZE * (bin.symbols.len() as u64 + 1);
        let names_size = 1 + bin.symbols.iter().map(|s| s.name.len() as u64 + 1).sum::<u64>();
        let table_address = align_up(last_end, PAGE_SIZE).ok_or_else(|| overflow(SYMBOL_TABLE))?;
        let names_address = table_address
            .checked_add(table_size)
            .and_then(|end| align_up(end, PAGE_SIZE))
            .filter(|address| address.checked_add(names_size).is_some())
            .ok_or_else(|| overflow(SYMBOL_NAMES))?;
        for (kind, name, address, size) in [
            (PlacedKind::SymbolTable, SYMBOL_TABLE, table_address, table_size),
            (PlacedKind::SymbolNames, SYMBOL_NAMES, names_address, names_size),
        ] {
            sections.push(Placed {
                kind,
                name_offset: add_name(name),
                address,
                mem_size: size,
                file_offset: 0,
                file_size: size,
                permissions: Permissions::READ,
                is_zeroed: false,
            });
        }
    }

    let program_headers_offset = FILE_HEADER_SIZE;
    let section_headers_offset = program_headers_offset + PROGRAM_HEADER_SIZE * sections.len() as u64;
    let section_names_offset = section_headers_offset + SECTION_HEADER_SIZE * (sections.len() as u64 + 2);

    // File offsets are bounded by the image size, which has to fit in memory.
    let page = |n: u64| n.next_multiple_of(PAGE_SIZE);
    let mut offset = page(section_names_offset + names.len() as u64);
    let last = sections.len().saturating_sub(1);
    for (i, placed) in sections.iter_mut().enumerate() {
        placed.file_offset = offset;
        if placed.is_zeroed {
            continue;
        }
        offset = if i == last {
            placed.file_end()
        } else {
            page(placed.file_end())
        };
    }
    let file_size = sections
        .iter()
        .map(Placed::file_end)
        .max()
        .unwrap_or(section_names_offset + names.len() as u64)
        .max(section_names_offset + names.len() as u64);

    log::debug!(
        "ELF layout: {} sections, entry {} at {:#x}, {} bytes",
        sections.len(),
        bin.entry,
        entry.address,
        file_size
    );

    Ok(Layout {
        entry: entry.address,
        program_headers_offset,
        section_headers_offset,
        section_names_offset,
        section_names: names,
        sections,
        file_size,
    })
}

fn segment_flags(perm: Permissions) -> u32 {
    let mut flags = 0;
    if perm.read() {
        flags |= elf::PF_R;
    }
    if perm.write() {
        flags |= elf::PF_W;
    }
    if perm.execute() {
        flags |= elf::PF_X;
    }
    flags
}

fn section_flags(perm: Permissions) -> u64 {
    let mut flags = elf::SHF_ALLOC as u64;
    if perm.write() {
        flags |= elf::SHF_WRITE as u64;
    }
    if perm.execute() {
        flags |= elf::SHF_EXECINSTR as u64;
    }
    flags
}

/// Builds the symbol table and symbol-name string table.
fn symbol_tables(bin: &Binary, e: Endianness) -> (Vec<u8>, Vec<u8>) {
    let mut table = Vec::with_capacity(SYMBOL_SIZE as usize * (bin.symbols.len() + 1));
    let mut names = vec![0u8];
    let null = elf::Sym64 {
        st_name: U32::new(e, 0),
        st_info: 0,
        st_other: 0,
        st_shndx: U16::new(e, 0),
        st_value: U64::new(e, 0),
        st_size: U64::new(e, 0),
    };
    table.extend_from_slice(bytes_of(&null));

    for sym in &bin.symbols {
        let name = names.len() as u32;
        names.extend_from_slice(sym.name.as_bytes());
        names.push(0);

        let st_type = match sym.kind {
            SymbolKind::Function => elf::STT_FUNC,
            SymbolKind::String => elf::STT_OBJECT,
        };
        let record = elf::Sym64 {
            st_name: U32::new(e, name),
            st_info: (elf::STB_GLOBAL << 4) | st_type,
            st_other: elf::STV_DEFAULT,
            // Skip the null and section-name headers.
            st_shndx: U16::new(e, sym.section as u16 + 2),
            st_value: U64::new(e, sym.address),
            st_size: U64::new(e, sym.size),
        };
        table.extend_from_slice(bytes_of(&record));
    }
    (table, names)
}

/// Produces the file bytes for `bin` placed according to `layout`.
pub fn emit(bin: &Binary, layout: &Layout) -> Vec<u8> {
    let e = bin.arch.byte_order;
    let mut out = Vec::with_capacity(layout.file_size as usize);
    let header_count = layout.section_header_count();
    let symbol_names_index = header_count - 1;

    let header = elf::FileHeader64 {
        e_ident: elf::Ident {
            magic: elf::ELFMAG,
            class: elf::ELFCLASS64,
            data: if bin.arch.is_little_endian() {
                elf::ELFDATA2LSB
            } else {
                elf::ELFDATA2MSB
            },
            version: elf::EV_CURRENT,
            os_abi: OS_ABI,
            abi_version: 0,
            padding: [0; 7],
        },
        e_type: U16::new(e, elf::ET_EXEC),
        e_machine: U16::new(e, bin.arch.elf_machine),
        e_version: U32::new(e, elf::EV_CURRENT as u32),
        e_entry: U64::new(e, layout.entry),
        e_phoff: U64::new(e, layout.program_headers_offset),
        e_shoff: U64::new(e, layout.section_headers_offset),
        e_flags: U32::new(e, 0),
        e_ehsize: U16::new(e, FILE_HEADER_SIZE as u16),
        e_phentsize: U16::new(e, PROGRAM_HEADER_SIZE as u16),
        e_phnum: U16::new(e, layout.sections.len() as u16),
        e_shentsize: U16::new(e, SECTION_HEADER_SIZE as u16),
        e_shnum: U16::new(e, header_count as u16),
        e_shstrndx: U16::new(e, 1),
    };
    out.extend_from_slice(bytes_of(&header));

    for placed in &layout.sections {
        let program = elf::ProgramHeader64 {
            p_type: U32::new(e, elf::PT_LOAD),
            p_flags: U32::new(e, segment_flags(placed.permissions)),
            p_offset: U64::new(e, placed.file_offset),
            p_vaddr: U64::new(e, placed.address),
            p_paddr: U64::new(e, placed.address),
            p_filesz: U64::new(e, placed.file_size),
            p_memsz: U64::new(e, placed.mem_size),
            p_align: U64::new(e, PAGE_SIZE),
        };
        out.extend_from_slice(bytes_of(&program));
    }

    let section_header = |name: u32, sh_type: u32, flags: u64, addr: u64, offset: u64, size: u64, link: u32, info: u32, align: u64, entsize: u64| elf::SectionHeader64 {
        sh_name: U32::new(e, name),
        sh_type: U32::new(e, sh_type),
        sh_flags: U64::new(e, flags),
        sh_addr: U64::new(e, addr),
        sh_offset: U64::new(e, offset),
        sh_size: U64::new(e, size),
        sh_link: U32::new(e, link),
        sh_info: U32::new(e, info),
        sh_addralign: U64::new(e, align),
        sh_entsize: U64::new(e, entsize),
    };
    out.extend_from_slice(bytes_of(&section_header(0, elf::SHT_NULL, 0, 0, 0, 0, 0, 0, 0, 0)));
    out.extend_from_slice(bytes_of(&section_header(
        1,
        elf::SHT_STRTAB,
        elf::SHF_STRINGS as u64,
        0,
        layout.section_names_offset,
        layout.section_names.len() as u64,
        0,
        0,
        1,
        0,
    )));
    for placed in &layout.sections {
        let header = match placed.kind {
            PlacedKind::Program(_) if placed.is_zeroed => section_header(
                placed.name_offset,
                elf::SHT_NOBITS,
                section_flags(placed.permissions),
                placed.address,
                placed.file_offset,
                placed.mem_size,
                0,
                0,
                PAGE_SIZE,
                0,
            ),
            PlacedKind::Program(_) => section_header(
                placed.name_offset,
                elf::SHT_PROGBITS,
                section_flags(placed.permissions),
                placed.address,
                placed.file_offset,
                placed.file_size,
                0,
                0,
                PAGE_SIZE,
                0,
            ),
            PlacedKind::SymbolTable => section_header(
                placed.name_offset,
                elf::SHT_SYMTAB,
                elf::SHF_ALLOC as u64,
                placed.address,
                placed.file_offset,
                placed.file_size,
                symbol_names_index as u32,
                1,
                PAGE_SIZE,
                SYMBOL_SIZE,
            ),
            PlacedKind::SymbolNames => section_header(
                placed.name_offset,
                elf::SHT_STRTAB,
                elf::SHF_ALLOC as u64,
                placed.address,
                placed.file_offset,
                placed.file_size,
                0,
                0,
                PAGE_SIZE,
                0,
            ),
        };
        out.extend_from_slice(bytes_of(&header));
    }

    out.extend_from_slice(&layout.section_names);

    let (table, names) = if bin.symbol_table {
        symbol_tables(bin, e)
    } else {
        (Vec::new(), Vec::new())
    };
    for placed in &layout.sections {
        if placed.is_zeroed {
            continue;
        }
        out.resize(placed.file_offset as usize, 0);
        match placed.kind {
            PlacedKind::Program(i) => out.extend_from_slice(&bin.sections[i].data),
            PlacedKind::SymbolTable => out.extend_from_slice(&table),
            PlacedKind::SymbolNames => out.extend_from_slice(&names),
        }
    }
    out.resize(layout.file_size as usize, 0);
    out
}

/// Encodes `bin` as an ELF64 executable.
pub fn encode(bin: &Binary) -> ElfResult<Vec<u8>> {
    let layout = layout(bin)?;
    let image = emit(bin, &layout);
    log::info!("encoded {}-byte ELF image with entry {:#x}", image.len(), layout.entry);
    Ok(image)
}
