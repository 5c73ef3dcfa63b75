// This module defines the rpkg package format, the only artifact exchanged between
// compiling a package and linking a program. A Package is the in-memory form: its import
// path, target architecture, the packages it imports, and its symbols (constants and
// compiled functions together with their pending relocations). The encode and decode
// submodules convert between a Package and a self-describing big-endian byte stream made
// of a fixed 64-byte header followed by contiguous regions for imports, exports, types,
// symbols, strings, linkages and code, and a trailing SHA-256 checksum over everything
// before it. Decoding rejects a file as a whole on any inconsistency, and encoding is
// deterministic, so decode(encode(p)) re-encodes to the same bytes. The stdlib submodule
// bundles several encoded packages into one rstd file.

//! The rpkg package format.
//!
//! ```text
//! header    64 bytes, offsets of every region below
//! imports   u32 string refs
//! exports   u64 symbol refs, sorted by symbol name
//! types     tagged type splats: u8 kind, u24 length, payload
//! symbols   36-byte records: u32 kind, u64 package, u64 name, u64 type, u64 value
//! strings   u32 length, bytes, zero padding to 4
//! linkages  36-byte records: u64 source, u64 package, u64 name, u8 type,
//!           u24 size, u32 offset, u32 address
//! code      u32 length, bytes, zero padding to 4
//! checksum  SHA-256 of all preceding bytes
//! ```

pub mod decode;
pub mod dump;
pub mod encode;
pub mod stdlib;

pub use decode::{decode, Decoder, Header};
pub use dump::{dump, DumpOptions};
pub use encode::encode;
pub use stdlib::{encode_stdlib, StdlibDecoder};

use crate::core::error::CodecResult;
use crate::ir::{self, Link, Signature, Type};
use crate::sys::Arch;
use std::fmt;

/// "rpkg" in ASCII.
pub const MAGIC: u32 = 0x72706b67;
pub const VERSION: u8 = 1;
pub const HEADER_SIZE: u64 = 64;
pub const SYMBOL_SIZE: u64 = 36;
pub const LINKAGE_SIZE: u64 = 36;
pub const CHECKSUM_SIZE: usize = 32;

/// Type splat kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeKind {
    None = 1,
    Basic = 2,
    Function = 3,
}

impl TypeKind {
    pub fn from_u8(raw: u8) -> Option<TypeKind> {
        match raw {
            1 => Some(TypeKind::None),
            2 => Some(TypeKind::Basic),
            3 => Some(TypeKind::Function),
            _ => None,
        }
    }
}

/// Symbol record kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SymKind {
    BooleanConstant = 1,
    IntegerConstant = 2,
    BigIntegerConstant = 3,
    BigNegativeIntegerConstant = 4,
    StringConstant = 5,
    Function = 6,
}

impl SymKind {
    pub fn from_u32(raw: u32) -> Option<SymKind> {
        use SymKind::*;
        match raw {
            1 => Some(BooleanConstant),
            2 => Some(IntegerConstant),
            3 => Some(BigIntegerConstant),
            4 => Some(BigNegativeIntegerConstant),
            5 => Some(StringConstant),
            6 => Some(Function),
            _ => None,
        }
    }
}

impl fmt::Display for SymKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SymKind::BooleanConstant => "boolean constant",
            SymKind::IntegerConstant => "integer constant",
            SymKind::BigIntegerConstant => "big integer constant",
            SymKind::BigNegativeIntegerConstant => "big negative integer constant",
            SymKind::StringConstant => "string constant",
            SymKind::Function => "function",
        };
        f.write_str(name)
    }
}

/// Lower-case hex encoding of `bytes`.
pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Wire tag of a basic type kind.
pub fn basic_kind_tag(kind: ir::BasicKind) -> u32 {
    ir::BasicKind::ALL
        .iter()
        .position(|&k| k == kind)
        .map_or(0, |i| i as u32 + 1)
}

/// Basic type kind for a wire tag.
pub fn basic_kind_from_tag(tag: u32) -> Option<ir::BasicKind> {
    let index = (tag as usize).checked_sub(1)?;
    ir::BasicKind::ALL.get(index).copied()
}

/// Compiled machine code of a function plus its pending relocations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCode {
    pub code: Vec<u8>,
    pub links: Vec<Link>,
}

/// The value of a symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolValue {
    Bool(bool),
    Int(u64),
    /// An integer too large for 64 bits, as its big-endian magnitude.
    BigInt { negative: bool, magnitude: Vec<u8> },
    Str(String),
    Function(FunctionCode),
}

/// One entry in a package's symbol table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// Owning package path. Empty for package-local literals.
    pub package: String,
    pub name: String,
    pub ty: Type,
    pub exported: bool,
    pub value: SymbolValue,
}

impl Symbol {
    pub fn kind(&self) -> SymKind {
        match &self.value {
            SymbolValue::Bool(_) => SymKind::BooleanConstant,
            SymbolValue::Int(_) => SymKind::IntegerConstant,
            SymbolValue::BigInt { negative: false, .. } => SymKind::BigIntegerConstant,
            SymbolValue::BigInt { negative: true, .. } => SymKind::BigNegativeIntegerConstant,
            SymbolValue::Str(_) => SymKind::StringConstant,
            SymbolValue::Function(_) => SymKind::Function,
        }
    }

    /// The package-qualified name.
    pub fn absolute_name(&self) -> String {
        if self.package.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.package, self.name)
        }
    }

    pub fn function(&self) -> Option<&FunctionCode> {
        match &self.value {
            SymbolValue::Function(code) => Some(code),
            _ => None,
        }
    }

    pub fn signature(&self) -> Option<&Signature> {
        match &self.ty {
            Type::Signature(sig) => Some(sig),
            _ => None,
        }
    }
}

/// A compiled package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub path: String,
    pub arch: Arch,
    pub imports: Vec<String>,
    pub symbols: Vec<Symbol>,
}

impl Package {
    pub fn new(path: impl Into<String>, arch: Arch) -> Self {
        Self {
            path: path.into(),
            arch,
            imports: Vec::new(),
            symbols: Vec::new(),
        }
    }

    pub fn add_import(&mut self, path: impl Into<String>) {
        self.imports.push(path.into());
    }

    /// Adds a compiled function, taking its name, signature and links from `f`.
    pub fn add_function(&mut self, f: &ir::Function, code: Vec<u8>, exported: bool) {
        self.symbols.push(Symbol {
            package: self.path.clone(),
            name: f.name.clone(),
            ty: Type::Signature(f.signature.clone()),
            exported,
            value: SymbolValue::Function(FunctionCode {
                code,
                links: f.links.clone(),
            }),
        });
    }

    /// Adds a constant owned by this package.
    pub fn add_constant(&mut self, name: impl Into<String>, ty: Type, value: SymbolValue, exported: bool) {
        self.symbols.push(Symbol {
            package: self.path.clone(),
            name: name.into(),
            ty,
            exported,
            value,
        });
    }

    /// Adds a package-local literal string.
    pub fn add_literal(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.symbols.push(Symbol {
            package: String::new(),
            name: name.into(),
            ty: Type::Basic(ir::BasicKind::UntypedString),
            exported: false,
            value: SymbolValue::Str(value.into()),
        });
    }

    pub fn symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|sym| sym.name == name && sym.package == self.path)
    }

    /// The SHA-256 checksum this package's encoding ends with. Encoding is
    /// deterministic, so for a decoded package this equals the checksum
    /// stored in its file.
    pub fn checksum(&self) -> CodecResult<[u8; CHECKSUM_SIZE]> {
        let data = encode(self)?;
        let mut sum = [0u8; CHECKSUM_SIZE];
        sum.copy_from_slice(&data[data.len() - CHECKSUM_SIZE..]);
        Ok(sum)
    }

    pub fn functions(&self) -> impl Iterator<Item = (&Symbol, &FunctionCode)> {
        self.symbols.iter().filter_map(|sym| sym.function().map(|code| (sym, code)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_kind_tags() {
        assert_eq!(basic_kind_tag(ir::BasicKind::Bool), 1);
        assert_eq!(basic_kind_tag(ir::BasicKind::Byte), 9);
        assert_eq!(basic_kind_tag(ir::BasicKind::Uintptr), 0x0d);
        assert_eq!(basic_kind_tag(ir::BasicKind::UntypedString), 0x11);
        for kind in ir::BasicKind::ALL {
            assert_eq!(basic_kind_from_tag(basic_kind_tag(kind)), Some(kind));
        }
        assert_eq!(basic_kind_from_tag(0), None);
        assert_eq!(basic_kind_from_tag(0x12), None);
    }

    #[test]
    fn test_absolute_name() {
        let mut pkg = Package::new("example.com/foo", crate::sys::X86_64);
        pkg.add_literal(".lit0", "hi");
        pkg.add_constant("Answer", Type::INT64, SymbolValue::Int(42), true);
        assert_eq!(pkg.symbols[0].absolute_name(), ".lit0");
        assert_eq!(pkg.symbols[1].absolute_name(), "example.com/foo.Answer");
        assert_eq!(pkg.symbols[1].kind(), SymKind::IntegerConstant);
        assert!(pkg.symbol("Answer").is_some());
    }
}
