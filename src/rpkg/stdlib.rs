// This module implements the rstd container, which bundles the rpkg files of a standard
// library into one file so a link can take every standard package from a single input.
// An rstd file is an 8-byte header (magic, architecture tag, version, package count), one
// entry per package (a u16-length-prefixed package path padded with zeros to a multiple
// of 8, then the u64 offset and u64 length of that package's rpkg data), and finally the
// rpkg files themselves, back to back in the same order as the entries. Entries are
// sorted by package path, so bundling the same packages always produces the same bytes.
// The container has no checksum of its own: each bundled rpkg carries one and is
// validated by the rpkg decoder when it is extracted.

//! rstd standard-library bundles.

use super::decode::Reader;
use super::encode::Builder;
use super::{Decoder, Package};
use crate::core::error::{CodecError, CodecResult};
use crate::sys::Arch;

/// "rstd" in ASCII.
pub const STDLIB_MAGIC: u32 = 0x72737464;
pub const STDLIB_VERSION: u8 = 1;
pub const STDLIB_HEADER_SIZE: usize = 8;

/// The fixed-size rstd header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StdlibHeader {
    pub magic: u32,
    pub arch: u8,
    pub version: u8,
    pub num_packages: u16,
}

/// Where one bundled package's rpkg data lives in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdlibPackageHeader {
    pub package: String,
    pub offset: u64,
    pub length: u64,
}

/// Zero bytes needed after a `2 + name_len` byte package name.
fn name_padding(name_len: usize) -> usize {
    (8 - (2 + name_len) % 8) % 8
}

fn bundle_error(reason: impl Into<String>) -> CodecError {
    CodecError::Encode {
        what: "rstd bundle".into(),
        reason: reason.into(),
    }
}

/// Bundles the rpkg files in `rpkgs`, which must all target `arch`.
///
/// Every file is validated first, and no package may appear twice.
pub fn encode_stdlib(arch: &Arch, rpkgs: &[Vec<u8>]) -> CodecResult<Vec<u8>> {
    if rpkgs.is_empty() {
        return Err(bundle_error("no packages"));
    }
    let count = u16::try_from(rpkgs.len()).map_err(|_| bundle_error(format!("{} packages is too many", rpkgs.len())))?;

    let mut files = Vec::with_capacity(rpkgs.len());
    for (i, data) in rpkgs.iter().enumerate() {
        let decoder = Decoder::new(data).map_err(|source| CodecError::Bundled {
            package: format!("#{}", i + 1),
            source: Box::new(source),
        })?;
        let path = decoder.package_path().to_string();
        if decoder.arch() != *arch {
            return Err(bundle_error(format!("{} is for {}, not {}", path, decoder.arch(), arch)));
        }
        if files.iter().any(|(seen, _)| *seen == path) {
            return Err(bundle_error(format!("package {path} appears more than once")));
        }
        if path.len() > u16::MAX as usize {
            return Err(bundle_error(format!("package path {path} is too long")));
        }
        files.push((path, data.as_slice()));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));

    let entries_len: usize = files.iter().map(|(path, _)| 2 + path.len() + name_padding(path.len()) + 16).sum();
    let mut offset = (STDLIB_HEADER_SIZE + entries_len) as u64;
    let total = offset as usize + files.iter().map(|(_, data)| data.len()).sum::<usize>();

    let mut b = Builder {
        buf: Vec::with_capacity(total),
    };
    b.u32(STDLIB_MAGIC);
    b.u8(arch.rpkg_tag);
    b.u8(STDLIB_VERSION);
    b.u16(count);
    for (path, data) in &files {
        b.u16(path.len() as u16);
        b.bytes(path.as_bytes());
        b.bytes(&[0; 8][..name_padding(path.len())]);
        b.u64(offset);
        b.u64(data.len() as u64);
        offset += data.len() as u64;
    }
    for (_, data) in &files {
        b.bytes(data);
    }

    log::debug!("bundled {} packages into {} bytes", files.len(), b.buf.len());
    Ok(b.buf)
}

/// A validated rstd file.
pub struct StdlibDecoder<'a> {
    data: &'a [u8],
    header: StdlibHeader,
    arch: Arch,
    packages: Vec<StdlibPackageHeader>,
}

impl<'a> StdlibDecoder<'a> {
    /// Parses the header and package table of `data` and checks that the
    /// bundled files exactly fill the rest of it.
    pub fn new(data: &'a [u8]) -> CodecResult<Self> {
        if data.len() < STDLIB_HEADER_SIZE {
            return Err(CodecError::Truncated { len: data.len() });
        }

        let mut r = Reader::new("rstd header", data);
        let header = StdlibHeader {
            magic: r.u32()?,
            arch: r.u8()?,
            version: r.u8()?,
            num_packages: r.u16()?,
        };
        if header.magic != STDLIB_MAGIC {
            return Err(CodecError::BadMagic { got: header.magic });
        }
        let arch = Arch::from_rpkg_tag(header.arch).ok_or(CodecError::UnknownArch { tag: header.arch })?;
        if header.version != STDLIB_VERSION {
            return Err(CodecError::UnsupportedVersion { got: header.version });
        }
        if header.num_packages == 0 {
            return Err(CodecError::malformed("rstd header", "no packages"));
        }

        let mut packages = Vec::with_capacity(header.num_packages as usize);
        for i in 1..=header.num_packages {
            let len = r.u16()? as usize;
            let name = r.bytes(len)?;
            let package = std::str::from_utf8(name)
                .map_err(|e| CodecError::malformed("rstd header", format!("package {i} name: {e}")))?
                .to_string();
            if r.bytes(name_padding(len))?.iter().any(|&b| b != 0) {
                return Err(CodecError::malformed("rstd header", format!("package {i} name has non-zero padding")));
            }
            packages.push(StdlibPackageHeader {
                package,
                offset: r.u64()?,
                length: r.u64()?,
            });
        }

        let mut want = r.offset();
        for pkg in &packages {
            if pkg.offset != want {
                return Err(CodecError::malformed(
                    "rstd header",
                    format!("package {} at offset {:#x}, expected {:#x}", pkg.package, pkg.offset, want),
                ));
            }
            want = want.checked_add(pkg.length).ok_or_else(|| {
                CodecError::malformed("rstd header", format!("package {} length overflows", pkg.package))
            })?;
        }
        if want != data.len() as u64 {
            return Err(CodecError::malformed(
                "rstd header",
                format!("packages end at {:#x}, but the file has {:#x} bytes", want, data.len()),
            ));
        }

        Ok(StdlibDecoder {
            data,
            header,
            arch,
            packages,
        })
    }

    pub fn header(&self) -> &StdlibHeader {
        &self.header
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Package entries, sorted by package path.
    pub fn packages(&self) -> &[StdlibPackageHeader] {
        &self.packages
    }

    /// The raw rpkg data of one bundled package.
    pub fn extract(&self, pkg: &StdlibPackageHeader) -> &'a [u8] {
        &self.data[pkg.offset as usize..(pkg.offset + pkg.length) as usize]
    }

    /// Decodes one bundled package, which must target the bundle's
    /// architecture and have the path its entry names.
    pub fn decode(&self, entry: &StdlibPackageHeader) -> CodecResult<Package> {
        let bundled = |source: CodecError| CodecError::Bundled {
            package: entry.package.clone(),
            source: Box::new(source),
        };
        let pkg = super::decode(self.extract(entry)).map_err(bundled)?;
        if pkg.arch != self.arch {
            return Err(bundled(CodecError::malformed(
                "rpkg",
                format!("package is for {}, but the bundle is for {}", pkg.arch, self.arch),
            )));
        }
        if pkg.path != entry.package {
            return Err(bundled(CodecError::malformed("rpkg", format!("package path is {}", pkg.path))));
        }
        Ok(pkg)
    }

    /// Decodes every bundled package in entry order.
    pub fn decode_all(&self) -> CodecResult<Vec<Package>> {
        self.packages.iter().map(|entry| self.decode(entry)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpkg::encode;
    use crate::sys::X86_64;

    fn rpkg(path: &str) -> Vec<u8> {
        encode(&Package::new(path, X86_64)).unwrap()
    }

    #[test]
    fn test_name_padding() {
        assert_eq!(name_padding(6), 0);
        assert_eq!(name_padding(7), 7);
        assert_eq!(name_padding(14), 0);
        assert_eq!(name_padding(0), 6);
    }

    #[test]
    fn test_header_layout() {
        let data = encode_stdlib(&X86_64, &[rpkg("strings"), rpkg("os")]).unwrap();
        assert_eq!(&data[..8], &[b'r', b's', b't', b'd', 1, 1, 0, 2]);

        // "os": 2 + 2 bytes of name, 4 bytes of padding.
        assert_eq!(&data[8..16], &[0, 2, b'o', b's', 0, 0, 0, 0]);
        let first = u64::from_be_bytes(data[16..24].try_into().unwrap());
        assert_eq!(first, 8 + 24 + 32);

        let d = StdlibDecoder::new(&data).unwrap();
        let names: Vec<_> = d.packages().iter().map(|p| p.package.as_str()).collect();
        assert_eq!(names, ["os", "strings"]);
        assert_eq!(d.extract(&d.packages()[1]), rpkg("strings").as_slice());
    }

    #[test]
    fn test_encode_rejects_bad_input() {
        assert!(encode_stdlib(&X86_64, &[]).is_err());
        assert!(matches!(
            encode_stdlib(&X86_64, &[rpkg("os"), rpkg("os")]),
            Err(CodecError::Encode { reason, .. }) if reason.contains("more than once")
        ));

        let mut corrupt = rpkg("os");
        corrupt[70] ^= 1;
        assert!(matches!(
            encode_stdlib(&X86_64, &[corrupt]),
            Err(CodecError::Bundled { source, .. }) if matches!(*source, CodecError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_decoder_rejects_bad_tables() {
        let data = encode_stdlib(&X86_64, &[rpkg("os")]).unwrap();

        assert!(matches!(StdlibDecoder::new(&data[..4]), Err(CodecError::Truncated { len: 4 })));
        assert!(matches!(
            StdlibDecoder::new(&data[..data.len() - 1]),
            Err(CodecError::Malformed { .. })
        ));

        let mut bad = data.clone();
        bad[0] = b'x';
        assert!(matches!(StdlibDecoder::new(&bad), Err(CodecError::BadMagic { .. })));

        let mut bad = data.clone();
        bad[6..8].copy_from_slice(&[0, 0]);
        assert!(matches!(StdlibDecoder::new(&bad), Err(CodecError::Malformed { .. })));

        let mut bad = data.clone();
        bad[12] = 1;
        assert!(matches!(StdlibDecoder::new(&bad), Err(CodecError::Malformed { reason, .. }) if reason.contains("padding")));

        let mut bad = data;
        bad.push(0);
        assert!(matches!(StdlibDecoder::new(&bad), Err(CodecError::Malformed { .. })));
    }
}
