// This module holds the format-independent description of a fully linked program: a
// Binary is the target architecture, the entry symbol, a list of addressed Sections and
// the Symbols placed in them. Section permissions are a small bit set with an rwx-style
// Display. The linker builds a Binary once every address is final, and the elf submodule
// turns it into an ELF64 image in two phases (layout, then emit).

//! Addressed program images.

pub mod elf;

use crate::sys::Arch;
use std::fmt;
use std::ops::BitOr;

/// Memory access permissions of a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions(u8);

impl Permissions {
    pub const NONE: Permissions = Permissions(0);
    pub const READ: Permissions = Permissions(1 << 0);
    pub const WRITE: Permissions = Permissions(1 << 1);
    pub const EXECUTE: Permissions = Permissions(1 << 2);

    pub fn read(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    pub fn write(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    pub fn execute(self) -> bool {
        self.0 & Self::EXECUTE.0 != 0
    }
}

impl BitOr for Permissions {
    type Output = Permissions;

    fn bitor(self, rhs: Permissions) -> Permissions {
        Permissions(self.0 | rhs.0)
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |set: bool, c: char| if set { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(self.read(), 'R'),
            flag(self.write(), 'W'),
            flag(self.execute(), 'X')
        )
    }
}

/// A contiguous region of the program image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    /// Virtual address of the first byte.
    pub address: u64,
    /// The section is zero-initialised: it occupies `data.len()` bytes of
    /// memory but none in the file.
    pub is_zeroed: bool,
    pub permissions: Permissions,
    pub data: Vec<u8>,
}

impl Section {
    pub fn new(name: impl Into<String>, address: u64, permissions: Permissions, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            address,
            is_zeroed: false,
            permissions,
            data,
        }
    }

    /// A zero-initialised section of `size` bytes.
    pub fn zeroed(name: impl Into<String>, address: u64, permissions: Permissions, size: usize) -> Self {
        Self {
            name: name.into(),
            address,
            is_zeroed: true,
            permissions,
            data: vec![0; size],
        }
    }

    /// Size in memory.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// One past the last address, or `None` if the section runs past the
    /// end of the address space.
    pub fn end(&self) -> Option<u64> {
        self.address.checked_add(self.size())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    String,
}

impl SymbolKind {
    pub fn name(self) -> &'static str {
        match self {
            SymbolKind::Function => "function",
            SymbolKind::String => "string",
        }
    }
}

/// A named, addressed entity in the program image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// Fully-qualified name.
    pub name: String,
    pub kind: SymbolKind,
    /// Index into [`Binary::sections`].
    pub section: usize,
    /// Offset within the section.
    pub offset: u64,
    pub address: u64,
    /// Size in bytes.
    pub size: u64,
}

impl Symbol {
    pub fn new(name: impl Into<String>, kind: SymbolKind, section: usize, address: u64) -> Self {
        Self {
            name: name.into(),
            kind,
            section,
            offset: 0,
            address,
            size: 0,
        }
    }
}

/// A fully laid out program.
#[derive(Debug, Clone)]
pub struct Binary {
    pub arch: Arch,
    /// Name of the entry function symbol.
    pub entry: String,
    pub sections: Vec<Section>,
    pub symbols: Vec<Symbol>,
    /// Include the symbols in the output as a symbol table.
    pub symbol_table: bool,
}

impl Binary {
    pub fn new(arch: Arch, entry: impl Into<String>) -> Self {
        Self {
            arch,
            entry: entry.into(),
            sections: Vec::new(),
            symbols: Vec::new(),
            symbol_table: false,
        }
    }

    pub fn symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|sym| sym.name == name)
    }
}
