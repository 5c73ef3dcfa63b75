//! Human-readable rendering of an rpkg file.

use super::*;
use std::fmt::Write;

/// Which parts of a package to print.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpOptions {
    pub header: bool,
    pub imports: bool,
    pub exports: bool,
    pub types: bool,
    pub symbols: bool,
    pub strings: bool,
    pub linkages: bool,
    pub functions: bool,
}

impl DumpOptions {
    pub fn all() -> Self {
        Self {
            header: true,
            imports: true,
            exports: true,
            types: true,
            symbols: true,
            strings: true,
            linkages: true,
            functions: true,
        }
    }
}

/// Renders the parts of `d` selected by `opts`.
pub fn dump(d: &Decoder<'_>, opts: &DumpOptions) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail.
    let _ = write_dump(&mut out, d, opts);
    out
}

fn section(out: &mut String, name: &str) -> std::fmt::Result {
    if !out.is_empty() {
        out.push('\n');
    }
    writeln!(out, "{name}:")
}

fn symbol_name(d: &Decoder<'_>, offset: u64) -> String {
    d.symbols()
        .get((offset / SYMBOL_SIZE) as usize)
        .map_or_else(|| format!("<symbol {offset}>"), Symbol::absolute_name)
}

fn write_dump(out: &mut String, d: &Decoder<'_>, opts: &DumpOptions) -> std::fmt::Result {
    if opts.header {
        let h = d.header();
        writeln!(out, "architecture: {}", d.arch())?;
        writeln!(out, "rpkg version: {}", h.version)?;
        writeln!(out, "checksum:     {}", to_hex(d.checksum()))?;
        writeln!(out, "package name: {}", d.package_path())?;
        writeln!(out, "regions:")?;
        writeln!(out, "\timports offset:  {}", h.imports_offset)?;
        writeln!(out, "\texports offset:  {}", h.exports_offset)?;
        writeln!(out, "\ttypes offset:    {}", h.types_offset)?;
        writeln!(out, "\tsymbols offset:  {}", h.symbols_offset)?;
        writeln!(out, "\tstrings offset:  {}", h.strings_offset)?;
        writeln!(out, "\tlinkages offset: {}", h.linkages_offset)?;
        writeln!(out, "\tcode offset:     {}", h.code_offset)?;
        writeln!(out, "\tchecksum offset: {}", h.checksum_offset)?;
    }

    if opts.imports {
        section(out, "imports")?;
        for import in d.imports() {
            writeln!(out, "\t{import}")?;
        }
    }

    if opts.exports {
        section(out, "exports")?;
        for &offset in d.exports() {
            writeln!(out, "\t{}", symbol_name(d, offset))?;
        }
    }

    if opts.types {
        section(out, "types")?;
        for (_, ty) in d.types() {
            if let Some(ty) = ty {
                writeln!(out, "\t{ty}")?;
            }
        }
    }

    if opts.symbols {
        section(out, "symbols")?;
        for sym in d.symbols() {
            let kind = sym.kind();
            let name = sym.absolute_name();
            match &sym.value {
                SymbolValue::Function(_) => writeln!(out, "\t{kind} {name} {}", sym.ty)?,
                SymbolValue::Str(s) => writeln!(out, "\t{kind} {name} ({}): {s:?}", sym.ty)?,
                SymbolValue::Bool(b) => writeln!(out, "\t{kind} {name} ({}): {b}", sym.ty)?,
                SymbolValue::Int(i) => writeln!(out, "\t{kind} {name} ({}): {i}", sym.ty)?,
                SymbolValue::BigInt { negative, magnitude } => {
                    let sign = if *negative { "-" } else { "" };
                    writeln!(out, "\t{kind} {name} ({}): {sign}0x{}", sym.ty, to_hex(magnitude))?
                }
            }
        }
    }

    if opts.strings {
        section(out, "strings")?;
        for (offset, s) in d.strings() {
            if *offset == 0 && s.is_empty() {
                continue;
            }
            writeln!(out, "\t{:?}", String::from_utf8_lossy(s))?;
        }
    }

    if opts.linkages {
        section(out, "linkages")?;
        for (source, link) in d.linkages() {
            writeln!(
                out,
                "\t{}: {} ({}) at offset {} (address {:#x})",
                symbol_name(d, *source),
                link.name,
                link.link_type,
                link.offset,
                link.address
            )?;
        }
    }

    if opts.functions {
        section(out, "functions")?;
        let mut first = true;
        for sym in d.symbols() {
            let Some(fun) = sym.function() else {
                continue;
            };
            if !first {
                out.push('\n');
            }
            first = false;
            writeln!(out, "\t{} {}", sym.name, sym.ty)?;
            for link in &fun.links {
                writeln!(out, "\t{link}")?;
            }
            hex_dump(out, &fun.code)?;
        }
    }

    Ok(())
}

/// Writes `data` as offset, hex and ASCII columns, 16 bytes per line.
fn hex_dump(out: &mut String, data: &[u8]) -> std::fmt::Result {
    for (line, chunk) in data.chunks(16).enumerate() {
        write!(out, "\t{:08x} ", line * 16)?;
        for i in 0..16 {
            if i == 8 {
                out.push(' ');
            }
            match chunk.get(i) {
                Some(b) => write!(out, " {b:02x}")?,
                None => out.push_str("   "),
            }
        }
        out.push_str("  |");
        for &b in chunk {
            out.push(if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' });
        }
        out.push_str("|\n");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Link, Param};
    use crate::sys::X86_64;

    #[test]
    fn test_hex_dump() {
        let mut out = String::new();
        hex_dump(&mut out, b"\x90\x90hello, world!\xc3\x00").unwrap();
        assert_eq!(
            out,
            "\t00000000  90 90 68 65 6c 6c 6f 2c  20 77 6f 72 6c 64 21 c3  |..hello, world!.|\n\
             \t00000010  00                                                |.|\n"
        );
    }

    #[test]
    fn test_dump_symbols_and_linkages() {
        let mut pkg = Package::new("example.com/foo", X86_64);
        pkg.add_literal(".hi", "hi\n");
        pkg.add_constant("Max", Type::INT64, SymbolValue::Int(7), true);
        pkg.symbols.push(Symbol {
            package: pkg.path.clone(),
            name: "greet".into(),
            ty: Type::Signature(Signature::new(vec![Param::new("n", Type::INT64)], None)),
            exported: false,
            value: SymbolValue::Function(FunctionCode {
                code: vec![0xe8, 0, 0, 0, 0, 0xc3],
                links: vec![Link::relative("example.com/bar.print", 32, 1, 5)],
            }),
        });
        let data = encode(&pkg).unwrap();
        let d = Decoder::new(&data).unwrap();

        let opts = DumpOptions {
            exports: true,
            symbols: true,
            linkages: true,
            ..DumpOptions::default()
        };
        let out = dump(&d, &opts);
        assert!(out.contains("exports:\n\texample.com/foo.Max\n"), "{out}");
        assert!(out.contains("\tstring constant .hi (untyped string): \"hi\\n\"\n"), "{out}");
        assert!(out.contains("\tinteger constant example.com/foo.Max (int64): 7\n"), "{out}");
        assert!(out.contains("\tfunction example.com/foo.greet (func ((n int64)))\n"), "{out}");
        assert!(
            out.contains("\texample.com/foo.greet: example.com/bar.print (relative address) at offset 1 (address 0x5)\n"),
            "{out}"
        );
        assert!(!out.contains("architecture"));
    }
}
