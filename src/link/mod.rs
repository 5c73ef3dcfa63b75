// This module implements the linker, which turns a main package and its dependencies into
// a statically linked executable. Linking happens in two passes over the package closure
// reachable from the main package's imports. The first pass lays out every function into
// the code section (main package first) and every string constant and literal into the
// strings section, optionally adds a provenance section recording each package path and
// checksum, assigns page-aligned section addresses starting at the base address, and
// enters every symbol into the session's global symbol table. The second pass walks each
// function's pending links and patches its code bytes with the final target addresses.
// Only once every link succeeds is the Binary handed to the ELF encoder, so a failed link
// never produces a partial image.

//! Two-pass static linker.
//!
//! ```no_run
//! use kiln::link::{self, LinkConfig};
//! use std::path::{Path, PathBuf};
//!
//! let config = LinkConfig::default().with_symbol_table(true);
//! let image = link::link_files(Path::new("main.rpkg"), &[PathBuf::from("dep.rpkg")], &config)?;
//! std::fs::write("a.out", image)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::binary::elf::{self, PAGE_SIZE};
use crate::binary::{Binary, Permissions, Section, Symbol, SymbolKind};
use crate::core::error::{LinkError, LinkResult};
use crate::core::session::{LinkSession, SymbolAddress};
use crate::rpkg::{self, FunctionCode, Package, StdlibDecoder, SymbolValue};
use bumpalo::Bump;
use hashbrown::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Address of the first section unless configured otherwise.
pub const DEFAULT_BASE_ADDRESS: u64 = 0x20_0000;

pub const CODE_SECTION: &str = "code";
pub const STRINGS_SECTION: &str = "strings";
pub const RPKGS_SECTION: &str = "rpkgs";

/// Link options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Address of the first section.
    pub base_address: u64,

    /// Fully-qualified entry function. Defaults to `main` in the main
    /// package.
    pub entry: Option<String>,

    /// Emit a symbol table.
    pub symbol_table: bool,

    /// Emit an `rpkgs` section listing every linked package and its
    /// checksum.
    pub provenance: bool,

    /// rstd bundle whose packages are all added to the link. Only read by
    /// [`link_files`].
    pub stdlib: Option<PathBuf>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            base_address: DEFAULT_BASE_ADDRESS,
            entry: None,
            symbol_table: false,
            provenance: false,
            stdlib: None,
        }
    }
}

impl LinkConfig {
    pub fn with_base_address(mut self, base_address: u64) -> Self {
        self.base_address = base_address;
        self
    }

    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = Some(entry.into());
        self
    }

    pub fn with_symbol_table(mut self, symbol_table: bool) -> Self {
        self.symbol_table = symbol_table;
        self
    }

    pub fn with_provenance(mut self, provenance: bool) -> Self {
        self.provenance = provenance;
        self
    }

    pub fn with_stdlib(mut self, stdlib: impl Into<PathBuf>) -> Self {
        self.stdlib = Some(stdlib.into());
        self
    }

    /// The entry function name for a link whose main package is `main`.
    pub fn entry_for(&self, main: &Package) -> String {
        match &self.entry {
            Some(entry) => entry.clone(),
            None => format!("{}.main", main.path),
        }
    }
}

/// Reads and decodes an rpkg file.
pub fn read_package(path: &Path) -> LinkResult<Package> {
    let data = std::fs::read(path).map_err(|source| LinkError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let pkg = rpkg::decode(&data).map_err(|source| LinkError::Rejected {
        path: path.display().to_string(),
        source,
    })?;
    log::info!("read {} from {}", pkg.path, path.display());
    Ok(pkg)
}

/// Reads every package from the rstd bundle at `path`.
pub fn read_stdlib(path: &Path) -> LinkResult<Vec<Package>> {
    let data = std::fs::read(path).map_err(|source| LinkError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let rejected = |source| LinkError::Rejected {
        path: path.display().to_string(),
        source,
    };
    let packages = StdlibDecoder::new(&data).and_then(|d| d.decode_all()).map_err(rejected)?;
    log::info!("read {} standard library packages from {}", packages.len(), path.display());
    Ok(packages)
}

/// Links the packages stored at `main` and `deps`, plus the standard
/// library bundle named by `config.stdlib`.
pub fn link_files(main: &Path, deps: &[PathBuf], config: &LinkConfig) -> LinkResult<Vec<u8>> {
    let main = read_package(main)?;
    let deps = deps
        .iter()
        .map(|path| read_package(path))
        .collect::<LinkResult<Vec<_>>>()?;
    let stdlib = match &config.stdlib {
        Some(path) => read_stdlib(path)?,
        None => Vec::new(),
    };
    link_with_stdlib(&main, &deps, &stdlib, config)
}

/// Links `main` and the packages it imports from `deps` into an ELF
/// executable.
pub fn link(main: &Package, deps: &[Package], config: &LinkConfig) -> LinkResult<Vec<u8>> {
    link_with_stdlib(main, deps, &[], config)
}

/// Like [`link`], but every package in `stdlib` is linked whether or not
/// anything imports it.
pub fn link_with_stdlib(main: &Package, deps: &[Package], stdlib: &[Package], config: &LinkConfig) -> LinkResult<Vec<u8>> {
    let arena = Bump::new();
    let session = LinkSession::new(&arena);
    let image = link_with_session(&session, main, deps, stdlib, config)?;
    log::info!("{}", session.stats());
    Ok(image)
}

/// Appends the imports of `order[next..]` to `order`, transitively.
fn add_imports<'p>(
    order: &mut Vec<&'p Package>,
    mut next: usize,
    seen: &mut HashSet<&'p str>,
    by_path: &HashMap<&str, &'p Package>,
) -> LinkResult<()> {
    while next < order.len() {
        let pkg = order[next];
        next += 1;
        for import in &pkg.imports {
            if !seen.insert(import.as_str()) {
                continue;
            }
            let dep = by_path.get(import.as_str()).copied().ok_or_else(|| LinkError::MissingPackage {
                package: pkg.path.clone(),
                import: import.clone(),
            })?;
            order.push(dep);
        }
    }
    Ok(())
}

/// Computes the link order: `main` followed by its transitive imports in
/// breadth-first order, then the `stdlib` packages nothing imported (and
/// their own imports).
pub fn resolve_packages<'p>(
    main: &'p Package,
    deps: &'p [Package],
    stdlib: &'p [Package],
) -> LinkResult<Vec<&'p Package>> {
    let mut by_path: HashMap<&str, &Package> = HashMap::new();
    for pkg in std::iter::once(main).chain(deps).chain(stdlib) {
        if pkg.arch != main.arch {
            return Err(LinkError::ArchMismatch {
                package: pkg.path.clone(),
                got: pkg.arch.to_string(),
                main: main.path.clone(),
                want: main.arch.to_string(),
            });
        }
        if by_path.insert(pkg.path.as_str(), pkg).is_some() {
            return Err(LinkError::DuplicatePackage {
                package: pkg.path.clone(),
            });
        }
    }

    let mut order = vec![main];
    let mut seen: HashSet<&str> = HashSet::new();
    seen.insert(main.path.as_str());
    add_imports(&mut order, 0, &mut seen, &by_path)?;

    let next = order.len();
    for pkg in stdlib {
        if seen.insert(pkg.path.as_str()) {
            order.push(pkg);
        }
    }
    add_imports(&mut order, next, &mut seen, &by_path)?;

    for pkg in deps {
        if !seen.contains(pkg.path.as_str()) {
            log::warn!("ignoring package {}: not imported by {}", pkg.path, main.path);
        }
    }
    Ok(order)
}

/// A function placed in the code section.
struct PlacedFunction<'p, 'arena> {
    name: &'arena str,
    code: &'p FunctionCode,
    offset: usize,
    /// Index into the binary's symbols.
    symbol: usize,
}

/// Where a non-empty section will go.
#[derive(Clone, Copy)]
struct Placement {
    index: usize,
    address: u64,
}

/// Assigns section indices and page-aligned addresses in order, skipping
/// empty sections.
struct SectionPlanner {
    next_index: usize,
    /// `None` once the previous section ended on the last page of the
    /// address space.
    next_address: Option<u64>,
}

impl SectionPlanner {
    fn new(base_address: u64) -> Self {
        Self {
            next_index: 0,
            next_address: Some(base_address),
        }
    }

    fn place(&mut self, name: &str, len: usize) -> LinkResult<Option<Placement>> {
        if len == 0 {
            return Ok(None);
        }
        let overflow = || LinkError::AddressOverflow {
            section: name.to_string(),
        };
        let address = self.next_address.ok_or_else(overflow)?;
        let end = address.checked_add(len as u64).ok_or_else(overflow)?;
        let placement = Placement {
            index: self.next_index,
            address,
        };
        log::debug!("section {} at {:#x} ({} bytes)", name, placement.address, len);
        self.next_index += 1;
        self.next_address = elf::align_up(end, PAGE_SIZE);
        Ok(Some(placement))
    }
}

/// Links using `session` for names, addresses and statistics.
pub fn link_with_session<'arena>(
    session: &LinkSession<'arena>,
    main: &Package,
    deps: &[Package],
    stdlib: &[Package],
    config: &LinkConfig,
) -> LinkResult<Vec<u8>> {
    let packages = resolve_packages(main, deps, stdlib)?;
    let arch = main.arch;

    // Pass 1: lay out the contents of each section.
    let mut code = Vec::new();
    let mut functions = Vec::new();
    let mut strings = Vec::new();
    let mut string_symbols = Vec::new();
    let mut literals: HashMap<&str, &str> = HashMap::new();
    let mut rpkgs = Vec::new();
    for pkg in &packages {
        session.record_package_loaded();

        for sym in &pkg.symbols {
            match &sym.value {
                SymbolValue::Function(fun) => {
                    let name = session.intern_str(&sym.absolute_name());
                    functions.push((name, fun, code.len()));
                    code.extend_from_slice(&fun.code);
                    session.record_function_laid_out(name, fun.code.len());
                }
                SymbolValue::Str(s) => {
                    // The same literal may appear in several packages.
                    if sym.package.is_empty() {
                        match literals.get(sym.name.as_str()) {
                            Some(&existing) if existing == s => continue,
                            Some(_) => return Err(LinkError::DuplicateSymbol { name: sym.name.clone() }),
                            None => {
                                literals.insert(&sym.name, s);
                            }
                        }
                    }
                    let name = session.intern_str(&sym.absolute_name());
                    string_symbols.push((name, strings.len(), s.len()));
                    strings.extend_from_slice(s.as_bytes());
                    session.record_string_laid_out();
                }
                _ => {}
            }
        }

        if config.provenance {
            let checksum = pkg.checksum().map_err(|source| LinkError::Rejected {
                path: pkg.path.clone(),
                source,
            })?;
            let len = u16::try_from(pkg.path.len()).map_err(|_| LinkError::ProvenancePath {
                package: pkg.path.clone(),
                len: pkg.path.len(),
            })?;
            rpkgs.extend_from_slice(&len.to_be_bytes());
            rpkgs.extend_from_slice(pkg.path.as_bytes());
            rpkgs.extend_from_slice(&checksum);
        }
    }

    let mut planner = SectionPlanner::new(config.base_address);
    let code_section = planner.place(CODE_SECTION, code.len())?;
    let strings_section = planner.place(STRINGS_SECTION, strings.len())?;
    let rpkgs_section = if config.provenance {
        planner.place(RPKGS_SECTION, rpkgs.len())?
    } else {
        None
    };

    // Assign addresses.
    let mut symbols = Vec::new();
    let mut define = |name: &'arena str,
                      kind: SymbolKind,
                      placement: Option<Placement>,
                      offset: usize,
                      size: usize|
     -> LinkResult<Option<usize>> {
        let Some(placement) = placement else {
            return Ok(None);
        };
        // Offsets lie inside a placed section, which ends below u64::MAX.
        let address = placement.address + offset as u64;
        let size = size as u64;
        session
            .define_symbol(name, SymbolAddress { kind, address, size })
            .map_err(|_| LinkError::DuplicateSymbol { name: name.to_string() })?;
        log::debug!("{} {} at {:#x}", kind.name(), name, address);
        symbols.push(Symbol {
            name: name.to_string(),
            kind,
            section: placement.index,
            offset: offset as u64,
            address,
            size,
        });
        Ok(Some(symbols.len() - 1))
    };

    let mut placed = Vec::with_capacity(functions.len());
    for (name, fun, offset) in functions {
        if let Some(symbol) = define(name, SymbolKind::Function, code_section, offset, fun.code.len())? {
            placed.push(PlacedFunction {
                name,
                code: fun,
                offset,
                symbol,
            });
        }
    }
    for (name, offset, size) in string_symbols {
        define(name, SymbolKind::String, strings_section, offset, size)?;
    }

    let entry = config.entry_for(main);
    check_entry(session, &packages, &entry)?;

    // Pass 2: patch every function's code.
    for fun in &placed {
        let source = &symbols[fun.symbol];
        let slice = &mut code[fun.offset..fun.offset + fun.code.code.len()];
        for link in &fun.code.links {
            let target = session.lookup(&link.name).ok_or_else(|| LinkError::Unresolved {
                function: fun.name.to_string(),
                target: link.name.clone(),
                offset: link.offset,
                span: link.span,
            })?;
            link.perform(&arch, slice, source, target.address)
                .map_err(|source| LinkError::Relocation {
                    function: fun.name.to_string(),
                    source,
                })?;
            session.record_relocation_applied();
        }
    }

    let mut bin = Binary::new(arch, entry);
    bin.symbol_table = config.symbol_table;
    let sections = [
        (CODE_SECTION, code_section, Permissions::READ | Permissions::EXECUTE, code),
        (STRINGS_SECTION, strings_section, Permissions::READ, strings),
        (RPKGS_SECTION, rpkgs_section, Permissions::READ, rpkgs),
    ];
    for (name, placement, permissions, data) in sections {
        if let Some(placement) = placement {
            bin.sections.push(Section::new(name, placement.address, permissions, data));
        }
    }
    bin.symbols = symbols;

    let image = elf::encode(&bin)?;
    session.record_image(bin.sections.len(), image.len());
    log::info!(
        "linked {} packages into {} bytes, entry {}",
        packages.len(),
        image.len(),
        bin.entry
    );
    Ok(image)
}

/// Checks that `entry` names a function that takes no parameters and
/// returns nothing.
fn check_entry(session: &LinkSession<'_>, packages: &[&Package], entry: &str) -> LinkResult<()> {
    let sym = packages
        .iter()
        .flat_map(|pkg| pkg.symbols.iter())
        .find(|sym| sym.absolute_name() == entry);
    let Some(sym) = sym else {
        return Err(LinkError::MissingEntry { name: entry.to_string() });
    };
    let Some(signature) = sym.signature().filter(|_| sym.function().is_some()) else {
        return Err(LinkError::EntryNotFunction { name: entry.to_string() });
    };
    if !signature.is_empty() {
        return Err(LinkError::EntrySignature {
            name: entry.to_string(),
            signature: signature.to_string(),
        });
    }
    if session.lookup(entry).is_none() {
        return Err(LinkError::MissingEntry { name: entry.to_string() });
    }
    Ok(())
}
