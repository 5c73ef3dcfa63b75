// This module is the hub for the infrastructure shared by every stage of kiln: the error
// taxonomy (one thiserror enum per stage plus a Result alias for each) and the arena-based
// link session that interns symbol names, holds the global symbol table and collects link
// statistics. The IR, package codec, ELF encoder and linker all report failures through
// these error types, and the linker threads a single session through both of its passes.

//! Core kiln infrastructure.
//!
//! # Key Components
//!
//! ## Error Handling (`error`)
//! - One error enum per stage: verification, relocation, package codec,
//!   ELF encoding and linking
//! - `LinkError` wraps the others with the package or function at fault
//!
//! ## Session Management (`session`)
//! - Arena-based name interning using `bumpalo`
//! - Global symbol table with duplicate detection
//! - Link statistics

pub mod error;
pub mod session;

pub use error::{
    CodecError,
    CodecResult,
    ElfError,
    ElfResult,
    LinkError,
    LinkResult,
    RelocError,
    RelocResult,
    VerifyError,
    VerifyResult,
};

pub use session::{LinkSession, SessionStats, SymbolAddress};
