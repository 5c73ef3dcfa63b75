//! rpkg decoder.
//!
//! The checksum is verified before anything else is trusted, then every
//! region is parsed in full. Any inconsistency rejects the whole file.

use super::*;
use crate::core::error::{CodecError, CodecResult};
use crate::ir::{LinkType, Param, Span};
use hashbrown::HashMap;
use sha2::{Digest, Sha256};

/// The fixed-size file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub arch: u8,
    pub version: u8,
    /// Offset of the package path in the strings region.
    pub package_name: u16,
    pub imports_offset: u32,
    pub exports_offset: u32,
    pub types_offset: u64,
    pub symbols_offset: u64,
    pub strings_offset: u64,
    pub linkages_offset: u64,
    pub code_offset: u64,
    pub checksum_offset: u64,
}

impl Header {
    fn parse(data: &[u8]) -> CodecResult<Header> {
        let mut r = Reader::new("header", data);
        Ok(Header {
            magic: r.u32()?,
            arch: r.u8()?,
            version: r.u8()?,
            package_name: r.u16()?,
            imports_offset: r.u32()?,
            exports_offset: r.u32()?,
            types_offset: r.u64()?,
            symbols_offset: r.u64()?,
            strings_offset: r.u64()?,
            linkages_offset: r.u64()?,
            code_offset: r.u64()?,
            checksum_offset: r.u64()?,
        })
    }

    /// Region boundaries in file order, with the record size each region
    /// length must be a multiple of.
    fn regions(&self) -> [(&'static str, u64, u64, u64); 7] {
        [
            ("imports", self.imports_offset as u64, self.exports_offset as u64, 4),
            ("exports", self.exports_offset as u64, self.types_offset, 8),
            ("types", self.types_offset, self.symbols_offset, 4),
            ("symbols", self.symbols_offset, self.strings_offset, SYMBOL_SIZE),
            ("strings", self.strings_offset, self.linkages_offset, 4),
            ("linkages", self.linkages_offset, self.code_offset, LINKAGE_SIZE),
            ("code", self.code_offset, self.checksum_offset, 4),
        ]
    }
}

/// Bounds-checked big-endian reader over one region.
pub(super) struct Reader<'a> {
    region: &'static str,
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(super) fn new(region: &'static str, data: &'a [u8]) -> Self {
        Self { region, data, pos: 0 }
    }

    pub(super) fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub(super) fn offset(&self) -> u64 {
        self.pos as u64
    }

    pub(super) fn bytes(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.data.len()).ok_or_else(|| {
            CodecError::malformed(
                self.region,
                format!("{} bytes at offset {} overrun the region ({} bytes)", n, self.pos, self.data.len()),
            )
        })?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub(super) fn array<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub(super) fn u8(&mut self) -> CodecResult<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub(super) fn u16(&mut self) -> CodecResult<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub(super) fn u24(&mut self) -> CodecResult<u32> {
        let [a, b, c] = self.array::<3>()?;
        Ok(u32::from_be_bytes([0, a, b, c]))
    }

    pub(super) fn u32(&mut self) -> CodecResult<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub(super) fn u64(&mut self) -> CodecResult<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    /// Consumes padding to the next multiple of 4, which must be zero.
    pub(super) fn padding(&mut self) -> CodecResult<()> {
        while self.pos % 4 != 0 {
            let at = self.pos;
            if self.u8()? != 0 {
                return Err(CodecError::malformed(self.region, format!("non-zero padding at offset {at}")));
            }
        }
        Ok(())
    }
}

fn region(body: &[u8], start: u64, end: u64) -> &[u8] {
    &body[start as usize..end as usize]
}

struct RawType<'a> {
    kind: TypeKind,
    payload: &'a [u8],
}

/// A validated rpkg file.
pub struct Decoder<'a> {
    header: Header,
    arch: Arch,
    checksum: [u8; CHECKSUM_SIZE],
    package: String,
    strings: Vec<(u64, &'a [u8])>,
    string_index: HashMap<u64, usize>,
    types: Vec<(u64, Option<Type>)>,
    code: Vec<(u64, &'a [u8])>,
    imports: Vec<String>,
    exports: Vec<u64>,
    symbols: Vec<Symbol>,
    linkages: Vec<(u64, Link)>,
}

impl<'a> Decoder<'a> {
    /// Parses and validates `data`.
    pub fn new(data: &'a [u8]) -> CodecResult<Self> {
        let min = HEADER_SIZE as usize + CHECKSUM_SIZE;
        if data.len() < min {
            return Err(CodecError::Truncated { len: data.len() });
        }

        // The checksum is always the trailing 32 bytes, so corruption
        // anywhere, including the header, is caught here.
        let (body, stored) = data.split_at(data.len() - CHECKSUM_SIZE);
        let actual = Sha256::digest(body);
        if actual.as_slice() != stored {
            return Err(CodecError::ChecksumMismatch {
                expected: to_hex(stored),
                actual: to_hex(&actual),
            });
        }
        let mut checksum = [0u8; CHECKSUM_SIZE];
        checksum.copy_from_slice(stored);

        let header = Header::parse(&data[..HEADER_SIZE as usize])?;
        if header.magic != MAGIC {
            return Err(CodecError::BadMagic { got: header.magic });
        }
        if header.version != VERSION {
            return Err(CodecError::UnsupportedVersion { got: header.version });
        }
        let arch = Arch::from_rpkg_tag(header.arch).ok_or(CodecError::UnknownArch { tag: header.arch })?;

        if header.imports_offset as u64 != HEADER_SIZE {
            return Err(CodecError::malformed(
                "header",
                format!("imports start at {}, expected {}", header.imports_offset, HEADER_SIZE),
            ));
        }
        if header.checksum_offset != body.len() as u64 {
            return Err(CodecError::malformed(
                "header",
                format!("checksum at {}, but the file has {} bytes before its checksum", header.checksum_offset, body.len()),
            ));
        }
        for (region, start, end, record) in header.regions() {
            if end < start {
                return Err(CodecError::malformed(region, format!("ends at {end} before it starts at {start}")));
            }
            if (end - start) % record != 0 {
                return Err(CodecError::malformed(
                    region,
                    format!("length {} is not a multiple of {}", end - start, record),
                ));
            }
        }

        let mut d = Decoder {
            header,
            arch,
            checksum,
            package: String::new(),
            strings: Vec::new(),
            string_index: HashMap::new(),
            types: Vec::new(),
            code: Vec::new(),
            imports: Vec::new(),
            exports: Vec::new(),
            symbols: Vec::new(),
            linkages: Vec::new(),
        };

        d.parse_strings(region(body, header.strings_offset, header.linkages_offset))?;
        d.package = d.utf8("header", header.package_name as u64)?;
        d.parse_types(region(body, header.types_offset, header.symbols_offset))?;
        d.parse_code(region(body, header.code_offset, header.checksum_offset))?;
        d.parse_imports(region(body, header.imports_offset as u64, header.exports_offset as u64))?;
        d.parse_symbols(region(body, header.symbols_offset, header.strings_offset))?;
        d.parse_exports(region(body, header.exports_offset as u64, header.types_offset))?;
        d.parse_linkages(region(body, header.linkages_offset, header.code_offset))?;

        log::debug!(
            "decoded {} ({}): {} imports, {} symbols, {} linkages",
            d.package,
            d.arch,
            d.imports.len(),
            d.symbols.len(),
            d.linkages.len()
        );
        Ok(d)
    }

    fn parse_strings(&mut self, data: &'a [u8]) -> CodecResult<()> {
        let mut r = Reader::new("strings", data);
        while !r.is_empty() {
            let offset = r.offset();
            let len = r.u32()? as usize;
            let s = r.bytes(len)?;
            r.padding()?;
            self.string_index.insert(offset, self.strings.len());
            self.strings.push((offset, s));
        }
        Ok(())
    }

    fn string(&self, region: &'static str, offset: u64) -> CodecResult<&'a [u8]> {
        self.string_index
            .get(&offset)
            .map(|&i| self.strings[i].1)
            .ok_or_else(|| CodecError::malformed(region, format!("no string at strings offset {offset}")))
    }

    fn utf8(&self, region: &'static str, offset: u64) -> CodecResult<String> {
        let s = self.string(region, offset)?;
        String::from_utf8(s.to_vec())
            .map_err(|_| CodecError::malformed(region, format!("string at offset {offset} is not valid UTF-8")))
    }

    fn parse_types(&mut self, data: &'a [u8]) -> CodecResult<()> {
        let mut raw = Vec::new();
        let mut r = Reader::new("types", data);
        while !r.is_empty() {
            let offset = r.offset();
            let tag = r.u8()?;
            let kind = TypeKind::from_u8(tag)
                .ok_or_else(|| CodecError::malformed("types", format!("unknown type kind {tag} at offset {offset}")))?;
            let len = r.u24()? as usize;
            let payload = r.bytes(len)?;
            r.padding()?;
            raw.push((offset, RawType { kind, payload }));
        }

        let index: HashMap<u64, usize> = raw.iter().enumerate().map(|(i, (offset, _))| (*offset, i)).collect();
        let mut resolved: HashMap<u64, Option<Type>> = HashMap::new();
        for (offset, _) in &raw {
            let ty = self.resolve_type(&raw, &index, &mut resolved, *offset, 0)?;
            self.types.push((*offset, ty));
        }
        Ok(())
    }

    fn resolve_type(
        &self,
        raw: &[(u64, RawType<'a>)],
        index: &HashMap<u64, usize>,
        resolved: &mut HashMap<u64, Option<Type>>,
        offset: u64,
        depth: usize,
    ) -> CodecResult<Option<Type>> {
        const MAX_DEPTH: usize = 64;

        if let Some(ty) = resolved.get(&offset) {
            return Ok(ty.clone());
        }
        if depth > MAX_DEPTH {
            return Err(CodecError::malformed("types", format!("type at offset {offset} nests too deeply")));
        }
        let entry = index
            .get(&offset)
            .map(|&i| &raw[i].1)
            .ok_or_else(|| CodecError::malformed("types", format!("no type at types offset {offset}")))?;

        let mut r = Reader::new("types", entry.payload);
        let ty = match entry.kind {
            TypeKind::None => None,
            TypeKind::Basic => {
                let tag = r.u32()?;
                let kind = basic_kind_from_tag(tag)
                    .ok_or_else(|| CodecError::malformed("types", format!("unknown basic kind {tag} at offset {offset}")))?;
                Some(Type::Basic(kind))
            }
            TypeKind::Function => {
                let params_len = r.u32()? as usize;
                if params_len % 16 != 0 {
                    return Err(CodecError::malformed(
                        "types",
                        format!("signature at offset {offset} has {params_len} bytes of parameters"),
                    ));
                }
                let mut params = Vec::with_capacity(params_len / 16);
                for _ in 0..params_len / 16 {
                    let name = self.utf8("types", r.u64()?)?;
                    let param_type = r.u64()?;
                    let ty = self.resolve_type(raw, index, resolved, param_type, depth + 1)?.ok_or_else(|| {
                        CodecError::malformed("types", format!("parameter {name} of signature at offset {offset} has no type"))
                    })?;
                    params.push(Param::new(name, ty));
                }
                let result = r.u64()?;
                let result = self.resolve_type(raw, index, resolved, result, depth + 1)?;
                self.string("types", r.u64()?)?;
                Some(Type::Signature(Signature::new(params, result)))
            }
        };
        if !r.is_empty() {
            return Err(CodecError::malformed(
                "types",
                format!("type at offset {offset} has {} trailing bytes", entry.payload.len() - r.pos),
            ));
        }

        resolved.insert(offset, ty.clone());
        Ok(ty)
    }

    fn type_at(&self, offset: u64) -> CodecResult<Option<Type>> {
        self.types
            .iter()
            .find(|(o, _)| *o == offset)
            .map(|(_, ty)| ty.clone())
            .ok_or_else(|| CodecError::malformed("symbols", format!("no type at types offset {offset}")))
    }

    fn parse_code(&mut self, data: &'a [u8]) -> CodecResult<()> {
        let mut r = Reader::new("code", data);
        while !r.is_empty() {
            let offset = r.offset();
            let len = r.u32()? as usize;
            let code = r.bytes(len)?;
            r.padding()?;
            self.code.push((offset, code));
        }
        Ok(())
    }

    fn parse_imports(&mut self, data: &'a [u8]) -> CodecResult<()> {
        let mut r = Reader::new("imports", data);
        while !r.is_empty() {
            let offset = r.u32()?;
            let import = self.utf8("imports", offset as u64)?;
            self.imports.push(import);
        }
        Ok(())
    }

    fn parse_symbols(&mut self, data: &'a [u8]) -> CodecResult<()> {
        let mut r = Reader::new("symbols", data);
        while !r.is_empty() {
            let offset = r.offset();
            let raw_kind = r.u32()?;
            let kind = SymKind::from_u32(raw_kind).ok_or_else(|| {
                CodecError::malformed("symbols", format!("unknown symbol kind {raw_kind} at offset {offset}"))
            })?;
            let package = self.utf8("symbols", r.u64()?)?;
            let name = self.utf8("symbols", r.u64()?)?;
            let ty = self
                .type_at(r.u64()?)?
                .ok_or_else(|| CodecError::malformed("symbols", format!("symbol {name} has no type")))?;
            let raw_value = r.u64()?;

            let value = match kind {
                SymKind::BooleanConstant => match raw_value {
                    0 => SymbolValue::Bool(false),
                    1 => SymbolValue::Bool(true),
                    v => {
                        return Err(CodecError::malformed(
                            "symbols",
                            format!("boolean constant {name} has value {v}"),
                        ))
                    }
                },
                SymKind::IntegerConstant => SymbolValue::Int(raw_value),
                SymKind::BigIntegerConstant | SymKind::BigNegativeIntegerConstant => SymbolValue::BigInt {
                    negative: kind == SymKind::BigNegativeIntegerConstant,
                    magnitude: self.string("symbols", raw_value)?.to_vec(),
                },
                SymKind::StringConstant => SymbolValue::Str(self.utf8("symbols", raw_value)?),
                SymKind::Function => {
                    if !matches!(ty, Type::Signature(_)) {
                        return Err(CodecError::malformed(
                            "symbols",
                            format!("function {name} has non-function type {ty}"),
                        ));
                    }
                    let code = self
                        .code
                        .iter()
                        .find(|(o, _)| *o == raw_value)
                        .map(|(_, code)| code.to_vec())
                        .ok_or_else(|| {
                            CodecError::malformed("symbols", format!("function {name} has no code at offset {raw_value}"))
                        })?;
                    SymbolValue::Function(FunctionCode {
                        code,
                        links: Vec::new(),
                    })
                }
            };

            self.symbols.push(Symbol {
                package,
                name,
                ty,
                exported: false,
                value,
            });
        }
        Ok(())
    }

    /// Index of the symbol record at `offset` in the symbols region.
    fn symbol_index(&self, region: &'static str, offset: u64) -> CodecResult<usize> {
        let index = (offset / SYMBOL_SIZE) as usize;
        if offset % SYMBOL_SIZE != 0 || index >= self.symbols.len() {
            return Err(CodecError::malformed(region, format!("no symbol at symbols offset {offset}")));
        }
        Ok(index)
    }

    fn parse_exports(&mut self, data: &'a [u8]) -> CodecResult<()> {
        let mut r = Reader::new("exports", data);
        while !r.is_empty() {
            let offset = r.u64()?;
            let index = self.symbol_index("exports", offset)?;
            self.symbols[index].exported = true;
            self.exports.push(offset);
        }
        Ok(())
    }

    fn parse_linkages(&mut self, data: &'a [u8]) -> CodecResult<()> {
        let mut r = Reader::new("linkages", data);
        while !r.is_empty() {
            let source = r.u64()?;
            let index = self.symbol_index("linkages", source)?;
            let package = self.utf8("linkages", r.u64()?)?;
            let name = self.utf8("linkages", r.u64()?)?;
            let raw_type = r.u8()?;
            let link_type = LinkType::from_u8(raw_type)
                .ok_or_else(|| CodecError::malformed("linkages", format!("unknown link type {raw_type}")))?;
            let size = r.u24()?;
            if size > 64 {
                return Err(CodecError::malformed("linkages", format!("link size {size} is larger than 64 bits")));
            }
            let offset = r.u32()?;
            let address = r.u32()?;

            let name = if package.is_empty() {
                name
            } else {
                format!("{package}.{name}")
            };
            let link = Link {
                span: Span::default(),
                name,
                link_type,
                size: size as u8,
                offset,
                address,
            };

            let sym = &mut self.symbols[index];
            if sym.function().is_none() {
                return Err(CodecError::malformed(
                    "linkages",
                    format!("link source {} is a {}, not a function", sym.absolute_name(), sym.kind()),
                ));
            }
            if let SymbolValue::Function(fun) = &mut sym.value {
                fun.links.push(link.clone());
            }
            self.linkages.push((source, link));
        }
        Ok(())
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// The SHA-256 checksum stored in the file.
    pub fn checksum(&self) -> &[u8; CHECKSUM_SIZE] {
        &self.checksum
    }

    pub fn package_path(&self) -> &str {
        &self.package
    }

    pub fn imports(&self) -> &[String] {
        &self.imports
    }

    /// Exported symbol offsets, in file order.
    pub fn exports(&self) -> &[u64] {
        &self.exports
    }

    /// Types with their offsets. The none type is `None`.
    pub fn types(&self) -> &[(u64, Option<Type>)] {
        &self.types
    }

    /// Symbols in file order. The symbol at index `i` is at offset `36 * i`.
    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn strings(&self) -> &[(u64, &'a [u8])] {
        &self.strings
    }

    /// Links with the offset of their source symbol.
    pub fn linkages(&self) -> &[(u64, Link)] {
        &self.linkages
    }

    pub fn into_package(self) -> Package {
        Package {
            path: self.package,
            arch: self.arch,
            imports: self.imports,
            symbols: self.symbols,
        }
    }
}

/// Decodes an rpkg file.
pub fn decode(data: &[u8]) -> CodecResult<Package> {
    Ok(Decoder::new(data)?.into_package())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::X86_64;

    fn reseal(data: &mut Vec<u8>) {
        let len = data.len() - CHECKSUM_SIZE;
        let sum = Sha256::digest(&data[..len]);
        data[len..].copy_from_slice(&sum);
    }

    fn sample() -> Vec<u8> {
        let mut pkg = Package::new("example.com/foo", X86_64);
        pkg.add_constant("Flag", Type::BOOL, SymbolValue::Bool(true), true);
        pkg.add_literal(".lit0", "hello");
        encode(&pkg).unwrap()
    }

    #[test]
    fn test_truncated() {
        assert_eq!(decode(&[0; 10]), Err(CodecError::Truncated { len: 10 }));
    }

    #[test]
    fn test_header_errors_after_checksum() {
        let mut data = sample();
        data[4] = 0x7f;
        reseal(&mut data);
        assert_eq!(decode(&data), Err(CodecError::UnknownArch { tag: 0x7f }));

        let mut data = sample();
        data[5] = 2;
        reseal(&mut data);
        assert_eq!(decode(&data), Err(CodecError::UnsupportedVersion { got: 2 }));

        let mut data = sample();
        data[0] = b'R';
        reseal(&mut data);
        assert!(matches!(decode(&data), Err(CodecError::BadMagic { .. })));
    }

    #[test]
    fn test_bad_boolean() {
        let mut data = sample();
        let d = Decoder::new(&data).unwrap();
        let value = d.header().symbols_offset as usize + 28;
        data[value + 7] = 2;
        reseal(&mut data);
        assert!(matches!(
            decode(&data),
            Err(CodecError::Malformed { region: "symbols", .. })
        ));
    }

    #[test]
    fn test_non_zero_padding() {
        let mut data = sample();
        let d = Decoder::new(&data).unwrap();
        // "example.com/foo" is 15 bytes, so its entry ends with one byte of padding.
        let pad = d.header().strings_offset as usize + 4 + 4 + 15;
        assert_eq!(data[pad], 0);
        data[pad] = 1;
        reseal(&mut data);
        assert!(matches!(
            decode(&data),
            Err(CodecError::Malformed { region: "strings", .. })
        ));
    }

    #[test]
    fn test_accessors() {
        let data = sample();
        let d = Decoder::new(&data).unwrap();
        assert_eq!(d.package_path(), "example.com/foo");
        assert_eq!(d.arch(), X86_64);
        assert_eq!(d.exports(), &[0]);
        assert_eq!(d.symbols().len(), 2);
        assert_eq!(d.types()[0], (0, None));
        assert_eq!(d.strings()[0], (0, &b""[..]));
        assert_eq!(&d.checksum()[..], &data[data.len() - CHECKSUM_SIZE..]);
    }
}
