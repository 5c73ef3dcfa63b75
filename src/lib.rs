//! kiln - SSA IR, package format and static linker.
//!
//! kiln is the back half of a small compiler toolchain. Compiled functions
//! are held in an SSA intermediate representation whose side effects are
//! ordered by an explicit memory-state chain, packaged with their pending
//! relocations into checksummed rpkg files, and finally linked into a
//! statically addressed ELF64 executable.
//!
//! # Primary Usage
//!
//! ```no_run
//! use kiln::link::{self, LinkConfig};
//! use kiln::rpkg;
//!
//! let main = rpkg::decode(&std::fs::read("main.rpkg")?)?;
//! let dep = rpkg::decode(&std::fs::read("dep.rpkg")?)?;
//!
//! let image = link::link(&main, &[dep], &LinkConfig::default())?;
//! std::fs::write("a.out", image)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Architecture
//!
//! - [`ir`] - SSA functions, opcodes, types, verification and relocations
//! - [`rpkg`] - Package model and its binary encoding
//! - [`link`] - Two-pass linker
//! - [`binary`] - Addressed program images and the ELF64 encoder
//! - [`core`] - Shared infrastructure (errors, link session)
//! - [`sys`] - Target architecture descriptors

pub mod binary;
pub mod core;
pub mod ir;
pub mod link;
pub mod rpkg;
pub mod sys;

// Re-export common types
pub use core::{
    // Errors
    CodecError, ElfError, LinkError, RelocError, VerifyError,
    // Session management
    LinkSession, SessionStats,
};
pub use ir::{Function, Link, LinkType};
pub use link::LinkConfig;
pub use rpkg::Package;
pub use sys::{Arch, X86_64};
