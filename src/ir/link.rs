//! Pending relocations.
//!
//! A [`Link`] records that a function's machine code refers to a symbol
//! whose address is not known until the linker has laid out the program.
//! Links are plain data until [`Link::perform`] writes the final address
//! into the function's code bytes.

use super::Span;
use crate::binary::Symbol;
use crate::core::error::{RelocError, RelocResult};
use crate::sys::Arch;
use object::Endian;
use std::fmt;

/// How a link's address is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LinkType {
    /// Copy the address in full.
    Full = 0,
    /// Copy the address relative to an origin within the function.
    Relative = 1,
}

impl LinkType {
    pub fn from_u8(raw: u8) -> Option<LinkType> {
        match raw {
            0 => Some(LinkType::Full),
            1 => Some(LinkType::Relative),
            _ => None,
        }
    }

    /// Field sizes in bits this link type may be written with.
    pub fn sizes(self) -> &'static [u8] {
        match self {
            LinkType::Full => &[32, 64],
            LinkType::Relative => &[16, 32, 64],
        }
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkType::Full => f.write_str("full address"),
            LinkType::Relative => f.write_str("relative address"),
        }
    }
}

/// A symbol address to be written into a function's code at link time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// Source position of the reference.
    pub span: Span,
    /// Fully-qualified target symbol name.
    pub name: String,
    pub link_type: LinkType,
    /// Field size in bits.
    pub size: u8,
    /// Offset into the function's code where the field starts.
    pub offset: u32,
    /// Offset into the function's code used as the origin of a relative
    /// address. Unused for full addresses.
    pub address: u32,
}

impl Link {
    pub fn full(name: impl Into<String>, size: u8, offset: u32) -> Self {
        Self {
            span: Span::default(),
            name: name.into(),
            link_type: LinkType::Full,
            size,
            offset,
            address: 0,
        }
    }

    pub fn relative(name: impl Into<String>, size: u8, offset: u32, address: u32) -> Self {
        Self {
            span: Span::default(),
            name: name.into(),
            link_type: LinkType::Relative,
            size,
            offset,
            address,
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Splits the target name at its last `.` into package and symbol.
    ///
    /// Names without a package (or starting with `.`) have an empty package.
    pub fn split_name(&self) -> (&str, &str) {
        match self.name.rfind('.') {
            Some(i) if i > 0 => (&self.name[..i], &self.name[i + 1..]),
            _ => ("", &self.name),
        }
    }

    /// Writes `target` into `code`, which holds the machine code of the
    /// function `source`.
    ///
    /// Relative links write `target - (source.address + self.address)`.
    /// Only `code` is modified, and only when the whole write succeeds.
    pub fn perform(&self, arch: &Arch, code: &mut [u8], source: &Symbol, target: u64) -> RelocResult<()> {
        if !self.link_type.sizes().contains(&self.size) {
            return Err(RelocError::UnsupportedSize {
                symbol: self.name.clone(),
                offset: self.offset,
                size: self.size,
            });
        }

        let start = self.offset as usize;
        let width = self.size as usize / 8;
        if start.checked_add(width).map_or(true, |end| end > code.len()) {
            return Err(RelocError::OutOfBounds {
                symbol: self.name.clone(),
                offset: self.offset,
                size: self.size,
                len: code.len(),
            });
        }

        let value: i128 = match self.link_type {
            LinkType::Full => target as i128,
            LinkType::Relative => target as i128 - (source.address as i128 + self.address as i128),
        };

        let fits = match (self.link_type, self.size) {
            (_, 64) => true,
            (LinkType::Full, bits) => value <= (1i128 << bits) - 1,
            (LinkType::Relative, bits) => {
                let half = 1i128 << (bits - 1);
                -half <= value && value < half
            }
        };
        if !fits {
            return Err(RelocError::Overflow {
                symbol: self.name.clone(),
                offset: self.offset,
                size: self.size,
                value,
            });
        }

        let order = arch.byte_order;
        let field = &mut code[start..start + width];
        match self.size {
            16 => field.copy_from_slice(&order.write_u16_bytes(value as u16)),
            32 => field.copy_from_slice(&order.write_u32_bytes(value as u32)),
            _ => field.copy_from_slice(&order.write_u64_bytes(value as u64)),
        }

        log::trace!(
            "{}: wrote {} {:#x} for {} at offset {}",
            source.name,
            self.link_type,
            value,
            self.name,
            self.offset
        );
        Ok(())
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Link {} ({} bits) for {} at {}", self.link_type, self.size, self.name, self.offset)?;
        if self.link_type == LinkType::Relative {
            write!(f, " (origin {})", self.address)?;
        }
        Ok(())
    }
}
