// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * FOTA package format: PACK header parsing
 *
 * Copyright (c) 2025 Code Construct
 */

//! Firmware package header
//!
//! A package is a fixed, little-endian header followed by the image
//! payloads. The header carries up to [`PACK_IMG_SLOTS`] image descriptors
//! (name, package offset, size), an additive header checksum and the
//! digest/signature material used by [`crate::verify`].

use core::ops::Range;

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use nom::{
    bytes::complete::take,
    combinator::map,
    multi::count,
    number::complete::{le_u16, le_u32},
    sequence::tuple,
    Finish, IResult,
};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use thiserror::Error;

type VResult<I, O> = IResult<I, O>;

/// Package magic, "PACK" in little-endian
pub const PACK_HEAD_MAGIC: u32 = 0x4B43_4150;
/// Header format version produced by current packers
pub const PACK_HEAD_VERSION: u16 = 2;
/// Length of the fixed header layout
pub const HEADER_LEN: usize = 1024;
/// Number of descriptor slots in the fixed layout
pub const PACK_IMG_SLOTS: usize = 15;
/// Maximum number of images a package may carry
pub const MAX_IMAGES: usize = 8;
/// Length of the NUL-padded image name field
pub const IMG_NAME_LEN: usize = 16;
/// Length of the md5sum field
pub const MD5_LEN: usize = 16;
/// Length of the signature field
pub const SIGNATURE_LEN: usize = 512;

const HEADER_SIZE_RANGE: Range<usize> = 6..8;
const CHECKSUM_RANGE: Range<usize> = 8..12;
const SIGNATURE_RANGE: Range<usize> = 36..36 + SIGNATURE_LEN;
const RESERVED_LEN: usize = 29 * 4;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FormatError {
    #[error("Header truncated: have {have} bytes, need {need}")]
    Truncated { need: usize, have: usize },
    #[error("Bad package magic 0x{0:08x}")]
    BadMagic(u32),
    #[error("Bad header size {size} (buffer {avail} bytes)")]
    BadHeaderSize { size: u16, avail: usize },
    #[error("Too many images: {0}")]
    TooManyImages(u32),
    #[error("Header checksum mismatch: header 0x{expected:08x}, computed 0x{computed:08x}")]
    ChecksumMismatch { expected: u32, computed: u32 },
    #[error("Unknown digest type {0}")]
    UnknownDigest(u16),
    #[error("Unknown signature type {0}")]
    UnknownSignature(u16),
    #[error("Bad image name in descriptor {0}")]
    BadImageName(usize),
    #[error("Image {0} starts inside the package header")]
    ImageBeforeHeader(String),
    #[error("Image {0} overlaps the previous image")]
    Overlap(String),
    #[error("Image {0} appears more than once")]
    DuplicateImage(String),
    #[error("Image {0} extends past the end of the package")]
    OutOfBounds(String),
    #[error("Can't parse package header")]
    Parse,
}

type Result<T> = core::result::Result<T, FormatError>;

#[derive(FromPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DigestType {
    None = 0,
    Sha1 = 1,
    Md5 = 2,
    Sha224 = 3,
    Sha256 = 4,
    Sha384 = 5,
    Sha512 = 6,
    Sm3 = 7,
}

#[derive(FromPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SignatureType {
    None = 0,
    Rsa1024 = 1,
    Rsa2048 = 2,
    Ecc256 = 3,
    Ecc160 = 4,
    Sm2 = 5,
    Aes128Ccm = 10,
}

/// A single image entry from the header descriptor table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub name: String,
    /// Offset of the image payload from the start of the package
    pub offset: u32,
    pub size: u32,
}

impl ImageDescriptor {
    pub fn new(name: &str, offset: u32, size: u32) -> Self {
        Self {
            name: name.into(),
            offset,
            size,
        }
    }

    /// Package offset one past the last byte of this image
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.size as u64
    }

    pub fn range(&self) -> Range<u64> {
        self.offset as u64..self.end()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageHeader {
    pub version: u16,
    pub header_size: u16,
    pub checksum: u32,
    pub md5sum: [u8; MD5_LEN],
    pub digest: DigestType,
    pub signature_type: SignatureType,
    pub signature: Vec<u8>,
    pub images: Vec<ImageDescriptor>,
}

struct RawHeader<'a> {
    version: u16,
    header_size: u16,
    checksum: u32,
    image_count: u32,
    md5sum: &'a [u8],
    digest: u16,
    signature_type: u16,
    signature: &'a [u8],
    slots: Vec<(&'a [u8], u32, u32)>,
}

fn parse_slot(buf: &[u8]) -> VResult<&[u8], (&[u8], u32, u32)> {
    tuple((take(IMG_NAME_LEN), le_u32, le_u32))(buf)
}

fn parse_raw(buf: &[u8]) -> VResult<&[u8], RawHeader<'_>> {
    map(
        tuple((
            le_u32,
            le_u16,
            le_u16,
            le_u32,
            le_u32,
            take(MD5_LEN),
            le_u16,
            le_u16,
            take(SIGNATURE_LEN),
            take(RESERVED_LEN),
            count(parse_slot, PACK_IMG_SLOTS),
        )),
        |(
            _magic,
            version,
            header_size,
            checksum,
            image_count,
            md5sum,
            digest,
            signature_type,
            signature,
            _reserved,
            slots,
        )| RawHeader {
            version,
            header_size,
            checksum,
            image_count,
            md5sum,
            digest,
            signature_type,
            signature,
            slots,
        },
    )(buf)
}

fn parse_name(b: &[u8]) -> Option<String> {
    let len = b.iter().position(|c| *c == 0).unwrap_or(b.len());
    let name = &b[..len];
    if name.is_empty() || !name.iter().all(u8::is_ascii_graphic) {
        return None;
    }
    core::str::from_utf8(name).ok().map(String::from)
}

/// Additive header checksum
///
/// Wrapping 32-bit sum of `bytes`, with the checksum and signature fields
/// counted as zero.
pub fn checksum(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .enumerate()
        .filter(|(i, _)| {
            !CHECKSUM_RANGE.contains(i) && !SIGNATURE_RANGE.contains(i)
        })
        .fold(0u32, |sum, (_, b)| sum.wrapping_add(*b as u32))
}

/// Header bytes covered by a package signature: the fixed layout with the
/// signature field zeroed.
pub fn digest_input(raw: &[u8]) -> Vec<u8> {
    let mut d = raw[..raw.len().min(HEADER_LEN)].to_vec();
    let end = SIGNATURE_RANGE.end.min(d.len());
    if end > SIGNATURE_RANGE.start {
        d[SIGNATURE_RANGE.start..end].fill(0);
    }
    d
}

impl PackageHeader {
    /// Create an empty header with no images, digest or signature.
    pub fn new() -> Self {
        Self {
            version: PACK_HEAD_VERSION,
            header_size: HEADER_LEN as u16,
            checksum: 0,
            md5sum: [0; MD5_LEN],
            digest: DigestType::None,
            signature_type: SignatureType::None,
            signature: vec![0; SIGNATURE_LEN],
            images: Vec::new(),
        }
    }

    /// Parse a header from the start of a package.
    ///
    /// `buf` must contain at least `header_size` bytes. The checksum is
    /// verified before any descriptor is decoded.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let truncated = || FormatError::Truncated {
            need: HEADER_LEN,
            have: buf.len(),
        };

        let (_, magic) = le_u32::<_, nom::error::Error<_>>(buf)
            .finish()
            .map_err(|_| truncated())?;
        if magic != PACK_HEAD_MAGIC {
            return Err(FormatError::BadMagic(magic));
        }

        if buf.len() < HEADER_LEN {
            return Err(truncated());
        }

        let (_, raw) = parse_raw(&buf[..HEADER_LEN])
            .finish()
            .map_err(|_| FormatError::Parse)?;

        let hs = raw.header_size as usize;
        if hs < HEADER_LEN || hs > buf.len() {
            return Err(FormatError::BadHeaderSize {
                size: raw.header_size,
                avail: buf.len(),
            });
        }

        if raw.image_count as usize > MAX_IMAGES {
            return Err(FormatError::TooManyImages(raw.image_count));
        }

        let computed = checksum(&buf[..hs]);
        if computed != raw.checksum {
            return Err(FormatError::ChecksumMismatch {
                expected: raw.checksum,
                computed,
            });
        }

        if raw.version != PACK_HEAD_VERSION {
            warn!("Unexpected package header version {}", raw.version);
        }

        let digest = DigestType::from_u16(raw.digest)
            .ok_or(FormatError::UnknownDigest(raw.digest))?;
        let signature_type = SignatureType::from_u16(raw.signature_type)
            .ok_or(FormatError::UnknownSignature(raw.signature_type))?;

        let images = raw
            .slots
            .iter()
            .take(raw.image_count as usize)
            .enumerate()
            .map(|(i, (name, offset, size))| {
                let name = parse_name(name).ok_or(FormatError::BadImageName(i))?;
                Ok(ImageDescriptor {
                    name,
                    offset: *offset,
                    size: *size,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut md5sum = [0u8; MD5_LEN];
        md5sum.copy_from_slice(raw.md5sum);

        Ok(Self {
            version: raw.version,
            header_size: raw.header_size,
            checksum: raw.checksum,
            md5sum,
            digest,
            signature_type,
            signature: raw.signature.to_vec(),
            images,
        })
    }

    /// Serialise to the on-wire layout, `header_size` bytes long.
    ///
    /// The stored `checksum` is written as-is, see [`seal`](Self::seal).
    pub fn to_bytes(&self) -> Vec<u8> {
        let total = HEADER_LEN.max(self.header_size as usize);
        let mut b = Vec::with_capacity(total);
        b.extend_from_slice(&PACK_HEAD_MAGIC.to_le_bytes());
        b.extend_from_slice(&self.version.to_le_bytes());
        b.extend_from_slice(&self.header_size.to_le_bytes());
        b.extend_from_slice(&self.checksum.to_le_bytes());
        b.extend_from_slice(&(self.images.len() as u32).to_le_bytes());
        b.extend_from_slice(&self.md5sum);
        b.extend_from_slice(&(self.digest as u16).to_le_bytes());
        b.extend_from_slice(&(self.signature_type as u16).to_le_bytes());

        let mut sig = self.signature.clone();
        sig.resize(SIGNATURE_LEN, 0);
        b.extend_from_slice(&sig);
        b.extend_from_slice(&[0u8; RESERVED_LEN]);

        for i in 0..PACK_IMG_SLOTS {
            let mut name = [0u8; IMG_NAME_LEN];
            let (offset, size) = match self.images.get(i) {
                Some(img) => {
                    let n = img.name.as_bytes();
                    let l = n.len().min(IMG_NAME_LEN);
                    name[..l].copy_from_slice(&n[..l]);
                    (img.offset, img.size)
                }
                None => (0, 0),
            };
            b.extend_from_slice(&name);
            b.extend_from_slice(&offset.to_le_bytes());
            b.extend_from_slice(&size.to_le_bytes());
        }

        b.resize(total, 0);
        b
    }

    /// Recompute and store the header checksum.
    pub fn seal(&mut self) {
        self.checksum = checksum(&self.to_bytes());
    }

    /// Check descriptor placement.
    ///
    /// Images must start after the header, be in ascending offset order
    /// without overlap, and end within `total` bytes when the package
    /// length is known.
    pub fn validate_layout(&self, total: Option<u64>) -> Result<()> {
        let hs = self.header_size as u64;
        let mut prev_end = hs;
        for (i, img) in self.images.iter().enumerate() {
            if self.images[..i].iter().any(|p| p.name == img.name) {
                return Err(FormatError::DuplicateImage(img.name.clone()));
            }
            let start = img.offset as u64;
            if start < hs {
                return Err(FormatError::ImageBeforeHeader(img.name.clone()));
            }
            if start < prev_end {
                return Err(FormatError::Overlap(img.name.clone()));
            }
            if let Some(t) = total {
                if img.end() > t {
                    return Err(FormatError::OutOfBounds(img.name.clone()));
                }
            }
            prev_end = img.end();
        }
        Ok(())
    }

    /// Header length declared at the start of a package, readable before
    /// the rest of the header has arrived
    pub fn declared_size(buf: &[u8]) -> Option<usize> {
        let b = buf.get(HEADER_SIZE_RANGE)?;
        Some(u16::from_le_bytes([b[0], b[1]]) as usize)
    }

    /// Total package length implied by the descriptors
    pub fn package_size(&self) -> u64 {
        self.images
            .iter()
            .map(ImageDescriptor::end)
            .max()
            .unwrap_or(0)
            .max(self.header_size as u64)
    }

    pub fn image(&self, name: &str) -> Option<&ImageDescriptor> {
        self.images.iter().find(|i| i.name == name)
    }
}

impl Default for PackageHeader {
    fn default() -> Self {
        Self::new()
    }
}
