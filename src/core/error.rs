// This module defines the error types for kiln using the thiserror crate. The taxonomy
// follows the three places things can go wrong after the front end has finished:
// VerifyError reports IR that breaks the block contract or the memory-state ordering
// discipline; RelocError reports a relocation that cannot be written without truncation;
// CodecError reports an rpkg file that cannot be encoded or that must be rejected when
// decoding; ElfError reports a binary that cannot be turned into an ELF image; and
// LinkError wraps all of these with the package path or function name that caused them.
// Each enum has a matching Result alias. Invariant violations inside the IR builder are
// programming errors and panic instead of returning one of these.

//! Error types for kiln.
//!
//! Using thiserror for more idiomatic error handling.

use crate::ir::{BlockId, Span, ValueId};
use std::path::PathBuf;
use thiserror::Error;

/// Problems found by the IR verifier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("{function}: function has no entry block")]
    NoEntry { function: String },

    #[error("{function}: {block} ({kind}) has {got} successors, expected {want}")]
    SuccessorCount {
        function: String,
        block: BlockId,
        kind: &'static str,
        got: usize,
        want: usize,
    },

    #[error("{function}: {block} ({kind}) has a bad control value: {reason}")]
    BadControl {
        function: String,
        block: BlockId,
        kind: &'static str,
        reason: String,
    },

    #[error("{function}: edge {from} -> {to} is not paired with a predecessor edge")]
    UnpairedEdge {
        function: String,
        from: BlockId,
        to: BlockId,
    },

    #[error("{function}: {value} is part of an argument cycle")]
    ArgumentCycle { function: String, value: ValueId },

    #[error("{function}: expected exactly one memory state in the entry block, found {count}")]
    EntryMemoryState { function: String, count: usize },

    #[error("{function}: {value} ({op}) consumes {got} but the current memory state is {want}")]
    StaleMemoryState {
        function: String,
        value: ValueId,
        op: &'static str,
        got: String,
        want: String,
    },

    #[error("{function}: {block} returns without consuming the final memory state {want}")]
    UnconsumedMemoryState {
        function: String,
        block: BlockId,
        want: String,
    },
}

/// Result type alias for IR verification.
pub type VerifyResult<T> = Result<T, VerifyError>;

/// Errors from applying a relocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelocError {
    #[error("cannot link {symbol} at offset {offset}: bad link size: {size}")]
    UnsupportedSize {
        symbol: String,
        offset: u32,
        size: u8,
    },

    #[error("cannot link {symbol} at offset {offset}: {size}-bit field overruns {len} bytes of code")]
    OutOfBounds {
        symbol: String,
        offset: u32,
        size: u8,
        len: usize,
    },

    #[error("cannot link {symbol} at offset {offset}: value {value:#x} does not fit in {size} bits")]
    Overflow {
        symbol: String,
        offset: u32,
        size: u8,
        value: i128,
    },
}

/// Result type alias for relocation.
pub type RelocResult<T> = Result<T, RelocError>;

/// Errors from encoding or decoding an rpkg file.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("file is {len} bytes, too short for an rpkg header")]
    Truncated { len: usize },

    #[error("bad magic {got:#010x}")]
    BadMagic { got: u32 },

    #[error("unsupported rpkg version {got}")]
    UnsupportedVersion { got: u8 },

    #[error("unrecognised architecture tag {tag:#04x}")]
    UnknownArch { tag: u8 },

    #[error("checksum mismatch: header says {expected}, contents hash to {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("malformed {region}: {reason}")]
    Malformed { region: &'static str, reason: String },

    #[error("cannot encode {what}: {reason}")]
    Encode { what: String, reason: String },

    #[error("bundled package {package}: {source}")]
    Bundled {
        package: String,
        #[source]
        source: Box<CodecError>,
    },
}

impl CodecError {
    pub(crate) fn malformed(region: &'static str, reason: impl Into<String>) -> Self {
        CodecError::Malformed {
            region,
            reason: reason.into(),
        }
    }
}

/// Result type alias for the package codec.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors from encoding an ELF image.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ElfError {
    #[error("entry symbol {name} not found")]
    MissingEntry { name: String },

    #[error("entry symbol {name} is a {kind}, not a function")]
    EntryNotFunction { name: String, kind: &'static str },

    #[error("{bits}-bit binaries are not supported")]
    UnsupportedClass { bits: u32 },

    #[error("too many {what}: {count}")]
    TooMany { what: &'static str, count: usize },

    #[error("section {section} does not fit below the end of the address space")]
    AddressOverflow { section: String },

    #[error("symbol {name} refers to section {section}, but there are {count} sections")]
    BadSymbolSection {
        name: String,
        section: usize,
        count: usize,
    },
}

/// Result type alias for ELF encoding.
pub type ElfResult<T> = Result<T, ElfError>;

/// Errors from linking a program.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("rejected {path}: {source}")]
    Rejected {
        path: String,
        #[source]
        source: CodecError,
    },

    #[error("package {package} is for {got}, but {main} is for {want}")]
    ArchMismatch {
        package: String,
        got: String,
        main: String,
        want: String,
    },

    #[error("package {package} imports {import}, but no rpkg provided for package {import}")]
    MissingPackage { package: String, import: String },

    #[error("package {package} was provided more than once")]
    DuplicatePackage { package: String },

    #[error("symbol {name} is defined more than once")]
    DuplicateSymbol { name: String },

    #[error("section {section} does not fit below the end of the address space")]
    AddressOverflow { section: String },

    #[error("package path {package} is {len} bytes, longer than a provenance record allows")]
    ProvenancePath { package: String, len: usize },

    #[error("entry function {name} not found")]
    MissingEntry { name: String },

    #[error("entry symbol {name} is not a function")]
    EntryNotFunction { name: String },

    #[error("entry function {name} must take no parameters and return nothing, has type {signature}")]
    EntrySignature { name: String, signature: String },

    #[error("{function}: unresolved symbol {target} at offset {offset} ({span})")]
    Unresolved {
        function: String,
        target: String,
        offset: u32,
        span: Span,
    },

    #[error("{function}: {source}")]
    Relocation {
        function: String,
        #[source]
        source: RelocError,
    },

    #[error("failed to encode binary: {0}")]
    Elf(#[from] ElfError),
}

/// Result type alias for link operations.
pub type LinkResult<T> = Result<T, LinkError>;
