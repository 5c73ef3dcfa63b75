//! rpkg encoder.
//!
//! Strings and types are interned as they are first referenced, so the
//! output depends only on the package contents and their order.

use super::*;
use crate::core::error::{CodecError, CodecResult};
use hashbrown::HashMap;
use sha2::{Digest, Sha256};

/// Big-endian byte builder.
#[derive(Default)]
pub(super) struct Builder {
    pub(super) buf: Vec<u8>,
}

impl Builder {
    pub(super) fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub(super) fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub(super) fn u24(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes()[1..]);
    }

    pub(super) fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub(super) fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub(super) fn bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Appends zeros up to the next multiple of 4.
    pub(super) fn pad4(&mut self) {
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
    }

    pub(super) fn len(&self) -> u64 {
        self.buf.len() as u64
    }
}

fn too_large(what: impl Into<String>, reason: impl Into<String>) -> CodecError {
    CodecError::Encode {
        what: what.into(),
        reason: reason.into(),
    }
}

struct Encoder {
    imports: Vec<u32>,
    exports: Vec<(String, u64)>,
    types: Builder,
    type_offsets: HashMap<Vec<u8>, u64>,
    symbols: Builder,
    strings: Builder,
    string_offsets: HashMap<Vec<u8>, u64>,
    linkages: Builder,
    code: Builder,
}

impl Encoder {
    fn new() -> Self {
        Self {
            imports: Vec::new(),
            exports: Vec::new(),
            types: Builder::default(),
            type_offsets: HashMap::new(),
            symbols: Builder::default(),
            strings: Builder::default(),
            string_offsets: HashMap::new(),
            linkages: Builder::default(),
            code: Builder::default(),
        }
    }

    /// Interns `s`, returning its offset in the strings region.
    fn add_string(&mut self, s: &[u8]) -> CodecResult<u64> {
        if let Some(&offset) = self.string_offsets.get(s) {
            return Ok(offset);
        }
        let len = u32::try_from(s.len()).map_err(|_| too_large("string", "length overflows u32"))?;

        let offset = self.strings.len();
        self.strings.u32(len);
        self.strings.bytes(s);
        self.strings.pad4();
        self.string_offsets.insert(s.to_vec(), offset);
        Ok(offset)
    }

    /// Interns `ty`, returning its offset in the types region. `None` is
    /// the none type.
    fn add_type(&mut self, ty: Option<&Type>) -> CodecResult<u64> {
        let mut splat = Builder::default();
        match ty {
            None => {
                splat.u8(TypeKind::None as u8);
                splat.u24(0);
            }
            Some(Type::Basic(kind)) => {
                splat.u8(TypeKind::Basic as u8);
                splat.u24(4);
                splat.u32(basic_kind_tag(*kind));
            }
            Some(Type::Signature(sig)) => {
                let mut params = Builder::default();
                for param in &sig.params {
                    params.u64(self.add_string(param.name.as_bytes())?);
                    params.u64(self.add_type(Some(&param.ty))?);
                }
                let result = self.add_type(sig.result.as_deref())?;
                let display = self.add_string(sig.to_string().as_bytes())?;

                let params_len = u32::try_from(params.len()).map_err(|_| too_large("signature", "too many parameters"))?;
                let payload_len = 4 + params.len() + 16;
                if payload_len > 0xff_ffff {
                    return Err(too_large("signature", "type payload overflows u24"));
                }
                splat.u8(TypeKind::Function as u8);
                splat.u24(payload_len as u32);
                splat.u32(params_len);
                splat.bytes(&params.buf);
                splat.u64(result);
                splat.u64(display);
            }
            Some(other) => return Err(too_large(other.to_string(), "synthetic IR types have no rpkg encoding")),
        }

        if let Some(&offset) = self.type_offsets.get(&splat.buf) {
            return Ok(offset);
        }
        let offset = self.types.len();
        self.types.bytes(&splat.buf);
        self.types.pad4();
        self.type_offsets.insert(splat.buf, offset);
        Ok(offset)
    }

    fn add_code(&mut self, code: &[u8]) -> CodecResult<u64> {
        let len = u32::try_from(code.len()).map_err(|_| too_large("code", "length overflows u32"))?;
        let offset = self.code.len();
        self.code.u32(len);
        self.code.bytes(code);
        self.code.pad4();
        Ok(offset)
    }

    fn add_symbol(&mut self, sym: &Symbol) -> CodecResult<()> {
        let source = self.symbols.len();
        let package = self.add_string(sym.package.as_bytes())?;
        let name = self.add_string(sym.name.as_bytes())?;
        if sym.function().is_some() && sym.signature().is_none() {
            return Err(too_large(sym.absolute_name(), format!("function has non-function type {}", sym.ty)));
        }
        let ty = self.add_type(Some(&sym.ty))?;
        let value = match &sym.value {
            SymbolValue::Bool(b) => *b as u64,
            SymbolValue::Int(i) => *i,
            SymbolValue::BigInt { magnitude, .. } => self.add_string(magnitude)?,
            SymbolValue::Str(s) => self.add_string(s.as_bytes())?,
            SymbolValue::Function(fun) => self.add_code(&fun.code)?,
        };

        self.symbols.u32(sym.kind() as u32);
        self.symbols.u64(package);
        self.symbols.u64(name);
        self.symbols.u64(ty);
        self.symbols.u64(value);

        if let SymbolValue::Function(fun) = &sym.value {
            for link in &fun.links {
                let (target_package, target_name) = link.split_name();
                let target_package = self.add_string(target_package.as_bytes())?;
                let target_name = self.add_string(target_name.as_bytes())?;
                self.linkages.u64(source);
                self.linkages.u64(target_package);
                self.linkages.u64(target_name);
                self.linkages.u8(link.link_type as u8);
                self.linkages.u24(link.size as u32);
                self.linkages.u32(link.offset);
                self.linkages.u32(link.address);
            }
        }

        if sym.exported {
            self.exports.push((sym.name.clone(), source));
        }
        Ok(())
    }
}

/// Encodes `pkg` as an rpkg file.
pub fn encode(pkg: &Package) -> CodecResult<Vec<u8>> {
    let mut e = Encoder::new();

    // Fixed offsets: the none type and the empty string at 0, the
    // package path at 4.
    e.add_type(None)?;
    e.add_string(b"")?;
    let package_name = e.add_string(pkg.path.as_bytes())?;
    let package_name =
        u16::try_from(package_name).map_err(|_| too_large(&pkg.path, "package name offset overflows u16"))?;

    // Imports come next so their offsets fit in a u32.
    for import in &pkg.imports {
        let offset = e.add_string(import.as_bytes())?;
        let offset = u32::try_from(offset).map_err(|_| too_large(import, "import offset overflows u32"))?;
        e.imports.push(offset);
    }

    for sym in &pkg.symbols {
        e.add_symbol(sym)?;
    }
    e.exports.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let imports_len = 4 * e.imports.len() as u64;
    let exports_len = 8 * e.exports.len() as u64;
    let imports_offset = HEADER_SIZE;
    let exports_offset = imports_offset + imports_len;
    let types_offset = exports_offset + exports_len;
    let symbols_offset = types_offset + e.types.len();
    let strings_offset = symbols_offset + e.symbols.len();
    let linkages_offset = strings_offset + e.strings.len();
    let code_offset = linkages_offset + e.linkages.len();
    let checksum_offset = code_offset + e.code.len();
    let exports_offset =
        u32::try_from(exports_offset).map_err(|_| too_large(&pkg.path, "too many imports"))?;

    let mut b = Builder {
        buf: Vec::with_capacity(checksum_offset as usize + CHECKSUM_SIZE),
    };
    b.u32(MAGIC);
    b.u8(pkg.arch.rpkg_tag);
    b.u8(VERSION);
    b.u16(package_name);
    b.u32(imports_offset as u32);
    b.u32(exports_offset);
    b.u64(types_offset);
    b.u64(symbols_offset);
    b.u64(strings_offset);
    b.u64(linkages_offset);
    b.u64(code_offset);
    b.u64(checksum_offset);

    for import in &e.imports {
        b.u32(*import);
    }
    for (_, symbol) in &e.exports {
        b.u64(*symbol);
    }
    b.bytes(&e.types.buf);
    b.bytes(&e.symbols.buf);
    b.bytes(&e.strings.buf);
    b.bytes(&e.linkages.buf);
    b.bytes(&e.code.buf);

    if b.len() != checksum_offset {
        return Err(too_large(
            &pkg.path,
            format!("internal error: encoded {} bytes before the checksum, expected {}", b.len(), checksum_offset),
        ));
    }
    let sum = Sha256::digest(&b.buf);
    b.bytes(&sum);

    log::debug!(
        "encoded {}: {} symbols, {} bytes of code, {} bytes total",
        pkg.path,
        pkg.symbols.len(),
        e.code.len(),
        b.len()
    );
    Ok(b.buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::X86_64;

    #[test]
    fn test_string_interning() {
        let mut e = Encoder::new();
        assert_eq!(e.add_string(b"").unwrap(), 0);
        assert_eq!(e.add_string(b"abc").unwrap(), 4);
        assert_eq!(e.add_string(b"abcd").unwrap(), 12);
        assert_eq!(e.add_string(b"abc").unwrap(), 4);
        assert_eq!(e.strings.len(), 20);
        assert_eq!(&e.strings.buf[4..12], &[0, 0, 0, 3, b'a', b'b', b'c', 0]);
    }

    #[test]
    fn test_type_dedup() {
        let mut e = Encoder::new();
        assert_eq!(e.add_type(None).unwrap(), 0);
        let int = e.add_type(Some(&Type::INT64)).unwrap();
        assert_eq!(int, 4);
        assert_eq!(e.add_type(Some(&Type::INT64)).unwrap(), int);
        assert_eq!(&e.types.buf[4..12], &[2, 0, 0, 4, 0, 0, 0, 6]);
    }

    #[test]
    fn test_synthetic_types_rejected() {
        let mut pkg = Package::new("example.com/foo", X86_64);
        pkg.add_constant("m", Type::MemoryState, SymbolValue::Int(0), false);
        assert!(matches!(encode(&pkg), Err(CodecError::Encode { .. })));
    }

    #[test]
    fn test_function_needs_signature() {
        let mut pkg = Package::new("example.com/foo", X86_64);
        pkg.add_constant(
            "f",
            Type::INT64,
            SymbolValue::Function(FunctionCode {
                code: vec![0xc3],
                links: Vec::new(),
            }),
            false,
        );
        assert!(matches!(encode(&pkg), Err(CodecError::Encode { .. })));
    }
}
