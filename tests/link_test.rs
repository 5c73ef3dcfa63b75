// These tests link small hand-assembled x86-64 packages and inspect the resulting ELF
// image with the object crate. The main package calls a function in the same package,
// which in turn calls a third function, and loads the address of a string literal. After
// linking, the call sites are disassembled with iced-x86 to check that every relative
// call lands on its target's symbol address and that full addresses point into the strings
// section. The remaining tests cover the entry point rules, unresolved and unwritable
// links, architecture mismatches, reading packages from disk, standard library bundles,
// sections near the top of the address space and the provenance section.

//! Linker tests.

use iced_x86::{Decoder, DecoderOptions, Mnemonic};
use kiln::core::session::LinkSession;
use kiln::ir::{Link, Param, Signature, Type};
use kiln::link::{self, LinkConfig};
use kiln::rpkg::{self, FunctionCode, Package, SymbolValue};
use kiln::{Arch, CodecError, ElfError, LinkError, RelocError, X86_64};
use object::{Object, ObjectSection, ObjectSymbol};
use std::path::PathBuf;

const MAIN: &str = "example.com/loop";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn function(pkg: &mut Package, name: &str, signature: Signature, code: Vec<u8>, links: Vec<Link>) {
    pkg.symbols.push(rpkg::Symbol {
        package: pkg.path.clone(),
        name: name.to_string(),
        ty: Type::Signature(signature),
        exported: false,
        value: SymbolValue::Function(FunctionCode { code, links }),
    });
}

/// main calls looper and loads the greeting's address; looper calls
/// triple-nop.
fn loop_package() -> Package {
    let mut pkg = Package::new(MAIN, X86_64);
    function(
        &mut pkg,
        "main",
        Signature::empty(),
        vec![
            0xe8, 0, 0, 0, 0, // call looper
            0x48, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, // mov rax, .greeting
            0xc3,
        ],
        vec![
            Link::relative("example.com/loop.looper", 32, 1, 5),
            Link::full(".greeting", 64, 7),
        ],
    );

    let mut looper = vec![0x90; 9];
    looper.extend_from_slice(&[0xe8, 0, 0, 0, 0]);
    looper.extend_from_slice(&[0x90; 5]);
    looper.push(0xc3);
    function(
        &mut pkg,
        "looper",
        Signature::empty(),
        looper,
        vec![Link::relative("example.com/loop.triple-nop", 32, 10, 14)],
    );
    function(&mut pkg, "triple-nop", Signature::empty(), vec![0x90, 0x90, 0x90, 0xc3], Vec::new());
    pkg.add_literal(".greeting", "Hello, world!\n");
    pkg
}

fn symbol_address(file: &object::File<'_>, name: &str) -> u64 {
    file.symbols()
        .find(|sym| sym.name().ok() == Some(name))
        .unwrap_or_else(|| panic!("no symbol {name}"))
        .address()
}

/// Writes `pkg` to a fresh file in the temporary directory.
fn write_package(pkg: &Package, tag: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("kiln-{}-{}.rpkg", std::process::id(), tag));
    std::fs::write(&path, rpkg::encode(pkg).unwrap()).unwrap();
    path
}

#[test]
fn test_link_patches_calls() {
    init_logging();
    let config = LinkConfig::default().with_symbol_table(true);
    let image = link::link(&loop_package(), &[], &config).expect("link");
    let file = object::File::parse(&*image).expect("parse linked ELF");

    let main = symbol_address(&file, "example.com/loop.main");
    let looper = symbol_address(&file, "example.com/loop.looper");
    let triple_nop = symbol_address(&file, "example.com/loop.triple-nop");
    let greeting = symbol_address(&file, ".greeting");
    assert_eq!(file.entry(), main);
    assert_eq!(main, 0x20_0000);
    assert_eq!(looper, main + 16);
    assert_eq!(triple_nop, looper + 20);

    let code_section = file.section_by_name("code").unwrap();
    assert_eq!(code_section.address(), 0x20_0000);
    let code = code_section.data().unwrap();
    assert_eq!(code.len(), 40);

    let at = (looper - main) as usize + 10;
    let rel = i32::from_le_bytes(code[at..at + 4].try_into().unwrap());
    assert_eq!(rel as i64, triple_nop as i64 - (looper as i64 + 14));

    let calls = |start: u64, len: usize| -> Vec<u64> {
        let offset = (start - main) as usize;
        let mut decoder = Decoder::with_ip(64, &code[offset..offset + len], start, DecoderOptions::NONE);
        let mut targets = Vec::new();
        for instr in &mut decoder {
            if instr.mnemonic() == Mnemonic::Call {
                targets.push(instr.near_branch_target());
            }
        }
        targets
    };
    assert_eq!(calls(main, 16), [looper]);
    assert_eq!(calls(looper, 20), [triple_nop]);

    // The strings section starts on the page after the code.
    let strings = file.section_by_name("strings").unwrap();
    assert_eq!(strings.address(), 0x20_1000);
    assert_eq!(strings.data().unwrap(), b"Hello, world!\n");
    assert_eq!(greeting, 0x20_1000);
    assert_eq!(u64::from_le_bytes(code[7..15].try_into().unwrap()), greeting);

    assert!(file.section_by_name("rpkgs").is_none());
}

#[test]
fn test_base_address() {
    let config = LinkConfig::default().with_base_address(0x40_0000);
    let image = link::link(&loop_package(), &[], &config).unwrap();
    let file = object::File::parse(&*image).unwrap();
    assert_eq!(file.entry(), 0x40_0000);
    assert_eq!(file.section_by_name("strings").unwrap().address(), 0x40_1000);
}

#[test]
fn test_cross_package_call() {
    let mut main = Package::new("example.com/hello", X86_64);
    main.add_import("example.com/dep");
    function(
        &mut main,
        "main",
        Signature::empty(),
        vec![0xe8, 0, 0, 0, 0, 0xc3],
        vec![Link::relative("example.com/dep.helper", 32, 1, 5)],
    );
    let mut dep = Package::new("example.com/dep", X86_64);
    function(&mut dep, "helper", Signature::empty(), vec![0x90, 0xc3], Vec::new());

    let image = link::link(&main, &[dep], &LinkConfig::default().with_symbol_table(true)).unwrap();
    let file = object::File::parse(&*image).unwrap();
    let helper = symbol_address(&file, "example.com/dep.helper");
    assert_eq!(helper, 0x20_0006, "dependency code follows the main package");

    let code = file.section_by_name("code").unwrap().data().unwrap();
    let mut decoder = Decoder::with_ip(64, &code[..6], 0x20_0000, DecoderOptions::NONE);
    let call = decoder.decode();
    assert_eq!(call.mnemonic(), Mnemonic::Call);
    assert_eq!(call.near_branch_target(), helper);
}

#[test]
fn test_entry_rules() {
    let mut pkg = loop_package();
    pkg.symbols.retain(|sym| sym.name != "main");
    assert!(matches!(
        link::link(&pkg, &[], &LinkConfig::default()),
        Err(LinkError::MissingEntry { name }) if name == "example.com/loop.main"
    ));

    let mut pkg = Package::new(MAIN, X86_64);
    function(
        &mut pkg,
        "main",
        Signature::new(vec![Param::new("argc", Type::INT64)], None),
        vec![0xc3],
        Vec::new(),
    );
    match link::link(&pkg, &[], &LinkConfig::default()) {
        Err(LinkError::EntrySignature { name, signature }) => {
            assert_eq!(name, "example.com/loop.main");
            assert_eq!(signature, "(func ((argc int64)))");
        }
        other => panic!("expected an entry signature error, got {other:?}"),
    }

    let mut pkg = loop_package();
    pkg.add_constant("Greeting", Type::STRING, SymbolValue::Str("hi".into()), true);
    let config = LinkConfig::default().with_entry("example.com/loop.Greeting");
    assert!(matches!(
        link::link(&pkg, &[], &config),
        Err(LinkError::EntryNotFunction { name }) if name == "example.com/loop.Greeting"
    ));

    let config = LinkConfig::default().with_entry("example.com/loop.triple-nop");
    let image = link::link(&loop_package(), &[], &config).unwrap();
    assert_eq!(object::File::parse(&*image).unwrap().entry(), 0x20_0000 + 36);
}

#[test]
fn test_unresolved_link() {
    let mut pkg = Package::new(MAIN, X86_64);
    function(
        &mut pkg,
        "main",
        Signature::empty(),
        vec![0xe8, 0, 0, 0, 0, 0xc3],
        vec![Link::relative("example.com/loop.nowhere", 32, 1, 5)],
    );
    match link::link(&pkg, &[], &LinkConfig::default()) {
        Err(LinkError::Unresolved {
            function,
            target,
            offset,
            ..
        }) => {
            assert_eq!(function, "example.com/loop.main");
            assert_eq!(target, "example.com/loop.nowhere");
            assert_eq!(offset, 1);
        }
        other => panic!("expected an unresolved link, got {other:?}"),
    }
}

#[test]
fn test_unwritable_links() {
    let mut pkg = Package::new(MAIN, X86_64);
    function(
        &mut pkg,
        "main",
        Signature::empty(),
        vec![0xe8, 0, 0, 0, 0, 0xc3],
        vec![Link::relative("example.com/loop.main", 24, 1, 5)],
    );
    // Odd sizes survive encoding and are only rejected when applied.
    let pkg = rpkg::decode(&rpkg::encode(&pkg).unwrap()).unwrap();
    match link::link(&pkg, &[], &LinkConfig::default()) {
        Err(LinkError::Relocation {
            function,
            source: RelocError::UnsupportedSize { size, .. },
        }) => {
            assert_eq!(function, "example.com/loop.main");
            assert_eq!(size, 24);
        }
        other => panic!("expected an unsupported size, got {other:?}"),
    }

    // A 32-bit full address cannot hold an address above 4 GiB.
    let mut pkg = Package::new(MAIN, X86_64);
    function(
        &mut pkg,
        "main",
        Signature::empty(),
        vec![0xb8, 0, 0, 0, 0, 0xc3],
        vec![Link::full("example.com/loop.main", 32, 1)],
    );
    let config = LinkConfig::default().with_base_address(0x1_0000_0000);
    assert!(matches!(
        link::link(&pkg, &[], &config),
        Err(LinkError::Relocation {
            source: RelocError::Overflow { .. },
            ..
        })
    ));
}

#[test]
fn test_arch_mismatch() {
    let big_endian = Arch {
        name: "test-be",
        byte_order: object::Endianness::Big,
        rpkg_tag: 0x02,
        ..X86_64
    };
    let mut main = loop_package();
    main.add_import("example.com/be");
    let dep = Package::new("example.com/be", big_endian);

    match link::link(&main, &[dep], &LinkConfig::default()) {
        Err(LinkError::ArchMismatch { package, got, want, .. }) => {
            assert_eq!(package, "example.com/be");
            assert_eq!(got, "test-be");
            assert_eq!(want, "x86-64");
        }
        other => panic!("expected an architecture mismatch, got {other:?}"),
    }
}

#[test]
fn test_link_files() {
    init_logging();
    let mut main = loop_package();
    main.add_import("example.com/dep");
    let dep = Package::new("example.com/dep", X86_64);
    let main_path = write_package(&main, "files-main");
    let dep_path = write_package(&dep, "files-dep");

    let config = LinkConfig::default().with_provenance(true);
    let image = link::link_files(&main_path, &[dep_path.clone()], &config).expect("link files");
    let file = object::File::parse(&*image).unwrap();

    // One record per package: u16 path length, path, checksum.
    let rpkgs = file.section_by_name("rpkgs").expect("provenance section");
    assert_eq!(rpkgs.address(), 0x20_2000);
    let mut data = rpkgs.data().unwrap();
    for (path, pkg) in [(&main_path, &main), (&dep_path, &dep)] {
        let len = u16::from_be_bytes([data[0], data[1]]) as usize;
        assert_eq!(&data[2..2 + len], pkg.path.as_bytes());
        let stored = std::fs::read(path).unwrap();
        assert_eq!(&data[2 + len..2 + len + 32], &stored[stored.len() - 32..]);
        data = &data[2 + len + 32..];
    }
    assert!(data.is_empty());

    // A corrupt file is rejected by path.
    let mut corrupt = std::fs::read(&dep_path).unwrap();
    corrupt[70] ^= 0xff;
    std::fs::write(&dep_path, corrupt).unwrap();
    match link::link_files(&main_path, &[dep_path.clone()], &config) {
        Err(LinkError::Rejected { path, .. }) => assert_eq!(path, dep_path.display().to_string()),
        other => panic!("expected a rejected package, got {other:?}"),
    }

    let missing = std::env::temp_dir().join(format!("kiln-{}-missing.rpkg", std::process::id()));
    assert!(matches!(
        link::link_files(&missing, &[], &config),
        Err(LinkError::Io { .. })
    ));

    let _ = std::fs::remove_file(main_path);
    let _ = std::fs::remove_file(dep_path);
}

#[test]
fn test_session_stats() {
    let arena = bumpalo::Bump::new();
    let session = LinkSession::new(&arena);
    let image = link::link_with_session(&session, &loop_package(), &[], &[], &LinkConfig::default()).unwrap();

    let stats = session.stats();
    assert_eq!(stats.packages_loaded, 1);
    assert_eq!(stats.functions_laid_out, 3);
    assert_eq!(stats.total_code_size, 40);
    assert_eq!(stats.largest_function_size, 20);
    assert_eq!(stats.strings_laid_out, 1);
    assert_eq!(stats.relocations_applied, 3);
    assert_eq!(stats.sections_emitted, 2);
    assert_eq!(stats.image_size, image.len());
    assert!(session.lookup("example.com/loop.looper").is_some());
}

#[test]
fn test_top_of_address_space() {
    const TOP_PAGE: u64 = 0xffff_ffff_ffff_f000;
    let mut main = Package::new(MAIN, X86_64);
    function(&mut main, "main", Signature::empty(), vec![0xc3], Vec::new());

    let config = LinkConfig::default().with_base_address(TOP_PAGE);
    let image = link::link(&main, &[], &config).expect("code fits on the last page");
    assert_eq!(object::File::parse(&*image).unwrap().entry(), TOP_PAGE);

    match link::link(&main, &[], &config.clone().with_symbol_table(true)) {
        Err(LinkError::Elf(ElfError::AddressOverflow { section })) => assert_eq!(section, "symbol table"),
        other => panic!("expected the symbol table to overflow, got {other:?}"),
    }
    match link::link(&loop_package(), &[], &config) {
        Err(LinkError::AddressOverflow { section }) => assert_eq!(section, "strings"),
        other => panic!("expected the strings section to overflow, got {other:?}"),
    }
}

#[test]
fn test_link_stdlib() {
    init_logging();
    let mut main = Package::new("example.com/hello", X86_64);
    main.add_import("example.com/fmt");
    function(
        &mut main,
        "main",
        Signature::empty(),
        vec![0xe8, 0, 0, 0, 0, 0xc3],
        vec![Link::relative("example.com/fmt.Print", 32, 1, 5)],
    );
    let mut fmt = Package::new("example.com/fmt", X86_64);
    function(&mut fmt, "Print", Signature::empty(), vec![0xc3], Vec::new());
    let mut unused = Package::new("example.com/unused", X86_64);
    function(&mut unused, "Nop", Signature::empty(), vec![0x90, 0xc3], Vec::new());

    let bundle = rpkg::encode_stdlib(&X86_64, &[rpkg::encode(&unused).unwrap(), rpkg::encode(&fmt).unwrap()]).unwrap();
    let names: Vec<_> = rpkg::StdlibDecoder::new(&bundle)
        .unwrap()
        .packages()
        .iter()
        .map(|entry| entry.package.clone())
        .collect();
    assert_eq!(names, ["example.com/fmt", "example.com/unused"]);

    let main_path = write_package(&main, "stdlib-main");
    let stdlib_path = std::env::temp_dir().join(format!("kiln-{}-stdlib.rstd", std::process::id()));
    std::fs::write(&stdlib_path, &bundle).unwrap();

    let config = LinkConfig::default()
        .with_symbol_table(true)
        .with_provenance(true)
        .with_stdlib(&stdlib_path);
    let image = link::link_files(&main_path, &[], &config).expect("link with stdlib");
    let file = object::File::parse(&*image).unwrap();

    let print = symbol_address(&file, "example.com/fmt.Print");
    assert_eq!(print, 0x20_0006);
    assert_eq!(symbol_address(&file, "example.com/unused.Nop"), 0x20_0007, "every bundled package is linked");

    let code = file.section_by_name("code").unwrap().data().unwrap();
    let call = Decoder::with_ip(64, &code[..6], 0x20_0000, DecoderOptions::NONE).decode();
    assert_eq!(call.near_branch_target(), print);

    let mut data = file.section_by_name("rpkgs").unwrap().data().unwrap();
    let mut recorded = Vec::new();
    while !data.is_empty() {
        let len = u16::from_be_bytes([data[0], data[1]]) as usize;
        recorded.push(String::from_utf8(data[2..2 + len].to_vec()).unwrap());
        data = &data[2 + len + 32..];
    }
    assert_eq!(recorded, ["example.com/hello", "example.com/fmt", "example.com/unused"]);

    // A truncated bundle is rejected by path.
    std::fs::write(&stdlib_path, &bundle[..bundle.len() - 1]).unwrap();
    match link::link_files(&main_path, &[], &config) {
        Err(LinkError::Rejected { path, source }) => {
            assert_eq!(path, stdlib_path.display().to_string());
            assert!(matches!(source, CodecError::Malformed { .. }));
        }
        other => panic!("expected a rejected bundle, got {other:?}"),
    }

    let _ = std::fs::remove_file(main_path);
    let _ = std::fs::remove_file(stdlib_path);
}
