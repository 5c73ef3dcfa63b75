// This module provides arena-based link session management using the bumpalo crate. A
// LinkSession owns a reference to the arena and holds everything that lives for the
// duration of one link: interned symbol names, the global symbol table that maps each
// fully-qualified name to its final address, and the link statistics. Names are interned
// once in the arena and shared by the symbol table and the relocation pass, so lookups
// during patching never allocate. Interior mutability lets the layout and patching passes
// share one session by reference. SessionStats records how many packages, functions,
// strings and relocations went into the image and can be printed as a summary.

//! Arena-based link session management.
//!
//! All per-link data is tied to the session lifetime, so the layout and
//! patching passes can hand out `&'arena str` names freely.

use crate::binary::SymbolKind;
use bumpalo::Bump;
use hashbrown::HashMap;
use std::cell::RefCell;
use std::fmt;

/// Final placement of a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolAddress {
    pub kind: SymbolKind,
    pub address: u64,
    pub size: u64,
}

/// Arena-based link session.
pub struct LinkSession<'arena> {
    /// Arena allocator for session objects.
    arena: &'arena Bump,

    /// Session statistics.
    stats: RefCell<SessionStats>,

    /// Interned strings.
    interned_strings: RefCell<HashMap<&'arena str, ()>>,

    /// Global symbol table, keyed by fully-qualified name.
    symbols: RefCell<HashMap<&'arena str, SymbolAddress>>,
}

impl<'arena> LinkSession<'arena> {
    /// Create a new link session with the given arena.
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
            interned_strings: RefCell::new(HashMap::new()),
            symbols: RefCell::new(HashMap::new()),
        }
    }

    /// Intern a string in the arena.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        let mut strings = self.interned_strings.borrow_mut();
        if let Some((&interned, _)) = strings.get_key_value(s) {
            return interned;
        }

        let interned: &'arena str = self.arena.alloc_str(s);
        strings.insert(interned, ());
        interned
    }

    /// Define a symbol. Returns the existing definition if `name` is
    /// already taken, leaving the table unchanged.
    pub fn define_symbol(&self, name: &str, symbol: SymbolAddress) -> Result<&'arena str, SymbolAddress> {
        let name = self.intern_str(name);
        let mut symbols = self.symbols.borrow_mut();
        if let Some(existing) = symbols.get(name) {
            return Err(*existing);
        }
        symbols.insert(name, symbol);
        Ok(name)
    }

    /// Look up a symbol by fully-qualified name.
    pub fn lookup(&self, name: &str) -> Option<SymbolAddress> {
        self.symbols.borrow().get(name).copied()
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.borrow().len()
    }

    /// Record a package entering the link.
    pub fn record_package_loaded(&self) {
        self.stats.borrow_mut().packages_loaded += 1;
    }

    /// Record a function placed in the code section.
    pub fn record_function_laid_out(&self, name: &str, code_size: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.functions_laid_out += 1;
        stats.total_code_size += code_size;

        if stats.largest_function_size < code_size {
            stats.largest_function_size = code_size;
            stats.largest_function_name = name.to_string();
        }
    }

    /// Record a string placed in the strings section.
    pub fn record_string_laid_out(&self) {
        self.stats.borrow_mut().strings_laid_out += 1;
    }

    /// Record a relocation written.
    pub fn record_relocation_applied(&self) {
        self.stats.borrow_mut().relocations_applied += 1;
    }

    /// Record the final image.
    pub fn record_image(&self, sections: usize, size: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.sections_emitted = sections;
        stats.image_size = size;
    }

    /// Get link statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Link session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Number of packages in the link.
    pub packages_loaded: usize,

    /// Number of functions placed.
    pub functions_laid_out: usize,

    /// Total code size (bytes).
    pub total_code_size: usize,

    /// Largest function placed.
    pub largest_function_size: usize,

    /// Name of largest function.
    pub largest_function_name: String,

    /// Number of strings placed.
    pub strings_laid_out: usize,

    /// Relocations written.
    pub relocations_applied: usize,

    /// Program sections in the image.
    pub sections_emitted: usize,

    /// Size of the encoded image (bytes).
    pub image_size: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Link Session Statistics:")?;
        writeln!(f, "  Packages loaded: {}", self.packages_loaded)?;
        writeln!(f, "  Functions laid out: {}", self.functions_laid_out)?;
        writeln!(f, "  Total code size: {} bytes", self.total_code_size)?;
        writeln!(f, "  Strings laid out: {}", self.strings_laid_out)?;
        writeln!(f, "  Relocations applied: {}", self.relocations_applied)?;
        writeln!(f, "  Sections emitted: {}", self.sections_emitted)?;
        writeln!(f, "  Image size: {} bytes", self.image_size)?;

        if !self.largest_function_name.is_empty() {
            writeln!(
                f,
                "  Largest function: {} ({} bytes)",
                self.largest_function_name, self.largest_function_size
            )?;
        }

        Ok(())
    }
}
