// These tests exercise the rpkg package codec end to end through the public API. The
// minimal package named example.com/foo is checked byte for byte against its documented
// layout, including the SHA-256 trailer. A package with functions, relocations, constants
// of every kind, literals, imports and exports is encoded, decoded and re-encoded to check
// that decoding restores an equivalent package and that encoding is byte-stable. Every
// single-byte corruption of an encoded file must be rejected with a checksum mismatch.

//! rpkg encode/decode tests.

use kiln::ir::{BasicKind, Link, Param, Signature, Type};
use kiln::rpkg::{self, Decoder, FunctionCode, Package, SymbolValue};
use kiln::{CodecError, X86_64};

const MINIMAL: [u8; 124] = [
    0x72, 0x70, 0x6b, 0x67, 0x01, 0x01, 0x00, 0x04, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00, 0x40,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x44,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x44, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x5c,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x5c, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x5c,
    0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x0f, 0x65, 0x78, 0x61, 0x6d,
    0x70, 0x6c, 0x65, 0x2e, 0x63, 0x6f, 0x6d, 0x2f, 0x66, 0x6f, 0x6f, 0x00, 0x70, 0x52, 0x8a, 0xae,
    0x4d, 0x75, 0xe5, 0xd3, 0x35, 0x9c, 0x66, 0x39, 0x3c, 0xc1, 0x62, 0xa5, 0x93, 0x31, 0x6a, 0x8e,
    0xa6, 0x00, 0x63, 0x93, 0x41, 0x78, 0x0a, 0x2e, 0x48, 0xee, 0xa4, 0xc1,
];

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn function(pkg: &mut Package, name: &str, signature: Signature, code: Vec<u8>, links: Vec<Link>, exported: bool) {
    pkg.symbols.push(rpkg::Symbol {
        package: pkg.path.clone(),
        name: name.to_string(),
        ty: Type::Signature(signature),
        exported,
        value: SymbolValue::Function(FunctionCode { code, links }),
    });
}

/// A package using every symbol kind and both link types.
fn rich_package() -> Package {
    let mut pkg = Package::new("example.com/rich", X86_64);
    pkg.add_import("example.com/dep");
    pkg.add_import("example.com/other");

    function(
        &mut pkg,
        "main",
        Signature::empty(),
        vec![0xe8, 0, 0, 0, 0, 0x48, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0xc3],
        vec![
            Link::relative("example.com/dep.helper", 32, 1, 5),
            Link::full(".greeting", 64, 7),
        ],
        false,
    );
    function(
        &mut pkg,
        "Add",
        Signature::new(
            vec![Param::new("a", Type::INT64), Param::new("b", Type::INT64)],
            Some(Type::INT64),
        ),
        vec![0x48, 0x8d, 0x04, 0x37, 0xc3],
        Vec::new(),
        true,
    );
    pkg.add_constant("Enabled", Type::BOOL, SymbolValue::Bool(true), true);
    pkg.add_constant("Answer", Type::INT64, SymbolValue::Int(42), true);
    pkg.add_constant(
        "Huge",
        Type::Basic(BasicKind::UntypedInt),
        SymbolValue::BigInt {
            negative: false,
            magnitude: vec![0x01, 0, 0, 0, 0, 0, 0, 0, 0],
        },
        false,
    );
    pkg.add_constant(
        "Tiny",
        Type::Basic(BasicKind::UntypedInt),
        SymbolValue::BigInt {
            negative: true,
            magnitude: vec![0x01, 0, 0, 0, 0, 0, 0, 0, 0],
        },
        false,
    );
    pkg.add_constant("Name", Type::STRING, SymbolValue::Str("kiln".into()), true);
    pkg.add_literal(".greeting", "Hello, world!\n");
    pkg
}

#[test]
fn test_minimal_package_layout() {
    init_logging();
    let pkg = Package::new("example.com/foo", X86_64);
    let data = rpkg::encode(&pkg).expect("encode minimal package");
    assert_eq!(data.len(), 124);
    assert_eq!(data, MINIMAL, "minimal package bytes differ");

    let d = Decoder::new(&data).expect("decode minimal package");
    let h = d.header();
    assert_eq!(h.imports_offset, 64);
    assert_eq!(h.exports_offset, 64);
    assert_eq!(h.types_offset, 64);
    assert_eq!(h.symbols_offset, 68);
    assert_eq!(h.strings_offset, 68);
    assert_eq!(h.linkages_offset, 92);
    assert_eq!(h.code_offset, 92);
    assert_eq!(h.checksum_offset, 92);
    assert_eq!(d.types(), &[(0, None)]);

    assert_eq!(d.into_package(), pkg);
    assert_eq!(pkg.checksum().unwrap()[..], MINIMAL[92..]);
}

#[test]
fn test_round_trip_is_equivalent() {
    init_logging();
    let pkg = rich_package();
    let data = rpkg::encode(&pkg).expect("encode");
    let decoded = rpkg::decode(&data).expect("decode");
    assert_eq!(decoded, pkg);

    let main = decoded.symbol("main").and_then(|sym| sym.function()).unwrap();
    assert_eq!(main.links.len(), 2);
    assert_eq!(main.links[0].name, "example.com/dep.helper");
    assert_eq!(main.links[1].name, ".greeting");
}

#[test]
fn test_encoding_is_byte_stable() {
    let data = rpkg::encode(&rich_package()).unwrap();
    let again = rpkg::encode(&rpkg::decode(&data).unwrap()).unwrap();
    assert_eq!(data, again, "re-encoding a decoded package changed its bytes");
}

#[test]
fn test_exports_sorted_by_name() {
    let data = rpkg::encode(&rich_package()).unwrap();
    let d = Decoder::new(&data).unwrap();
    let names: Vec<_> = d
        .exports()
        .iter()
        .map(|&offset| d.symbols()[(offset / rpkg::SYMBOL_SIZE) as usize].name.as_str())
        .collect();
    assert_eq!(names, ["Add", "Answer", "Enabled", "Name"]);
}

#[test]
fn test_strings_and_types_are_deduplicated() {
    let data = rpkg::encode(&rich_package()).unwrap();
    let d = Decoder::new(&data).unwrap();

    let mut strings: Vec<_> = d.strings().iter().map(|(_, s)| *s).collect();
    let total = strings.len();
    strings.sort();
    strings.dedup();
    assert_eq!(strings.len(), total, "duplicate string entries");
    assert_eq!(d.strings()[1].1, b"example.com/rich");
    assert_eq!(d.strings()[2].1, b"example.com/dep");

    let int64 = d.types().iter().filter(|(_, ty)| ty.as_ref() == Some(&Type::INT64)).count();
    assert_eq!(int64, 1, "int64 should be stored once");
}

#[test]
fn test_single_byte_corruption_is_rejected() {
    let data = rpkg::encode(&rich_package()).unwrap();
    for i in 0..data.len() {
        let mut corrupt = data.clone();
        corrupt[i] ^= 0x01;
        match rpkg::decode(&corrupt) {
            Err(CodecError::ChecksumMismatch { .. }) => {}
            other => panic!("flipping byte {i} gave {other:?}, expected a checksum mismatch"),
        }
    }
}

#[test]
fn test_truncated_file_is_rejected() {
    let data = rpkg::encode(&rich_package()).unwrap();
    assert_eq!(rpkg::decode(&data[..40]), Err(CodecError::Truncated { len: 40 }));
    assert!(matches!(
        rpkg::decode(&data[..data.len() - 1]),
        Err(CodecError::ChecksumMismatch { .. })
    ));
}

#[test]
fn test_code_entries_padded_to_four_bytes() {
    let mut pkg = Package::new("example.com/pad", X86_64);
    for len in 1..=4u8 {
        let code = (0..len).map(|i| 0x90 + i).collect();
        function(&mut pkg, &format!("f{len}"), Signature::empty(), code, Vec::new(), false);
    }
    let data = rpkg::encode(&pkg).unwrap();
    let header = *Decoder::new(&data).unwrap().header();

    let mut at = header.code_offset as usize;
    let end = header.checksum_offset as usize;
    let mut lengths = Vec::new();
    while at < end {
        let len = u32::from_be_bytes(data[at..at + 4].try_into().unwrap()) as usize;
        let entry = 4 + len + (4 - len % 4) % 4;
        assert_eq!(entry % 4, 0, "code entry at {at} is not a multiple of 4 bytes");
        assert!(data[at + 4 + len..at + entry].iter().all(|&b| b == 0), "padding after code entry at {at} is not zero");
        lengths.push(len);
        at += entry;
    }
    assert_eq!(at, end, "code entries exactly fill the code region");
    assert_eq!(lengths, [1, 2, 3, 4]);
    assert_eq!(end - header.code_offset as usize, 8 + 8 + 8 + 8);
}
