// This module describes the target architectures kiln can produce code for. An Arch
// carries the handful of facts the backend needs without knowing anything about the
// instruction set itself: the pointer size (which selects the ELF class), the byte order
// used when patching relocations and writing ELF structures, the ELF machine number, and
// the tag stored in rpkg headers. Only x86-64 is registered; the descriptor is a plain
// value so tests can construct a big-endian variant to exercise byte-order handling.

//! Target architecture descriptors.

use object::Endianness;
use std::fmt;

/// A target architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arch {
    /// Human-readable name.
    pub name: &'static str,

    /// Size of a pointer in bytes.
    pub pointer_size: u8,

    /// Byte order for multi-byte integers.
    pub byte_order: Endianness,

    /// ELF `e_machine` value.
    pub elf_machine: u16,

    /// Architecture tag stored in rpkg headers.
    pub rpkg_tag: u8,
}

/// The x86-64 architecture.
pub const X86_64: Arch = Arch {
    name: "x86-64",
    pointer_size: 8,
    byte_order: Endianness::Little,
    elf_machine: object::elf::EM_X86_64,
    rpkg_tag: 0x01,
};

/// All architectures with an rpkg tag.
pub const ARCHES: &[Arch] = &[X86_64];

impl Arch {
    /// Look up an architecture by its rpkg tag.
    pub fn from_rpkg_tag(tag: u8) -> Option<Arch> {
        ARCHES.iter().copied().find(|arch| arch.rpkg_tag == tag)
    }

    /// Returns true when the architecture is little-endian.
    pub fn is_little_endian(&self) -> bool {
        self.byte_order == Endianness::Little
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}
