// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * FOTA agent: package verification
 *
 * Copyright (c) 2025 Code Construct
 */

//! Integrity checks on a fully written package.
//!
//! Images are read back from their destinations. Packages without a
//! digest type are checked against the MD5 sum in the header; SHA1 and
//! SHA256 packages carry an RSA PKCS#1 v1.5 signature over the header
//! (signature zeroed) followed by every image.

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::pkg::{digest_input, DigestType, SignatureType};
use crate::progress::DownloadProgress;
use crate::target::TargetKind;

const READ_CHUNK: usize = 4096;

const RSA_EXPONENT: u32 = 0x10001;

// 1024-bit production signing key
const EMBEDDED_MODULUS: [u8; 128] = [
    0xeb, 0xe3, 0xa4, 0x41, 0x10, 0xd6, 0x25, 0x98, 0xc2, 0x27, 0x8b, 0x36,
    0xac, 0xfa, 0xc3, 0x86, 0x01, 0x21, 0x16, 0x64, 0x6f, 0xf2, 0x37, 0x72,
    0xf4, 0xc0, 0x60, 0xab, 0x38, 0x60, 0x47, 0x7a, 0x94, 0x7f, 0x80, 0x48,
    0xa8, 0xeb, 0xa5, 0xf7, 0x1b, 0x9f, 0xf2, 0xc2, 0xf9, 0x39, 0x08, 0xbc,
    0xa9, 0x3e, 0x3c, 0x0c, 0x52, 0x15, 0xb3, 0x57, 0x81, 0x5e, 0x02, 0xf2,
    0xd7, 0x7e, 0x04, 0x4c, 0x6d, 0x93, 0xc4, 0x5d, 0xa3, 0x97, 0x17, 0xa6,
    0x83, 0xa5, 0x9c, 0xc4, 0x91, 0xcc, 0x2d, 0x78, 0xeb, 0x64, 0xbf, 0x05,
    0x4d, 0x0b, 0xed, 0x09, 0x4f, 0xd4, 0x2d, 0x46, 0x2d, 0xf0, 0xfc, 0xd0,
    0x03, 0xc0, 0xb7, 0x5c, 0x19, 0x6a, 0x87, 0x11, 0xff, 0xf8, 0xa4, 0x6a,
    0x55, 0xa2, 0xf6, 0x25, 0xb9, 0x00, 0x96, 0xaf, 0x2c, 0x7f, 0x15, 0xb9,
    0xe3, 0xe3, 0x24, 0x3d, 0xc3, 0xa7, 0xa4, 0x37,
];

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("Image {name}: size mismatch, expected {expected}, found {actual}")]
    SizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },
    #[error("Package digest mismatch")]
    DigestMismatch,
    #[error("Package signature is invalid")]
    SignatureInvalid,
    #[error("Unsupported digest type {0:?}")]
    UnsupportedDigest(DigestType),
    #[error("Unsupported signature type {0:?}")]
    UnsupportedSignature(SignatureType),
    #[error("Bad verification key: {0}")]
    Key(#[from] rsa::Error),
    #[error("IO error reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

type Result<T> = std::result::Result<T, VerifyError>;

/// Public key that package signatures are checked against
#[derive(Debug, Clone)]
pub struct VerifyKey {
    key: RsaPublicKey,
}

impl VerifyKey {
    /// The key built into the agent
    pub fn embedded() -> Result<Self> {
        Self::from_modulus(&EMBEDDED_MODULUS)
    }

    /// Key from a big-endian modulus, with exponent 65537
    pub fn from_modulus(modulus: &[u8]) -> Result<Self> {
        let key = RsaPublicKey::new(
            BigUint::from_bytes_be(modulus),
            BigUint::from(RSA_EXPONENT),
        )?;
        Ok(Self { key })
    }

    pub fn from_public_key(key: RsaPublicKey) -> Self {
        Self { key }
    }

    /// Modulus length in bytes, which is also the signature length
    pub fn size(&self) -> usize {
        self.key.size()
    }
}

enum Hasher {
    Md5(md5::Context),
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(c) => c.consume(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
        }
    }
}

/// Verify a fully written package.
///
/// `raw_header` is the package header as received. Per-image `read`
/// counters in `progress` are updated as images are read back.
pub fn verify(
    progress: &mut DownloadProgress,
    raw_header: &[u8],
    key: &VerifyKey,
) -> Result<()> {
    check_sizes(progress)?;

    let mut hasher = match progress.digest {
        DigestType::None | DigestType::Md5 => Hasher::Md5(md5::Context::new()),
        DigestType::Sha1 | DigestType::Sha256 => {
            if !matches!(
                progress.signature_type,
                SignatureType::Rsa1024 | SignatureType::Rsa2048
            ) {
                return Err(VerifyError::UnsupportedSignature(progress.signature_type));
            }
            let mut h = match progress.digest {
                DigestType::Sha1 => Hasher::Sha1(Sha1::new()),
                _ => Hasher::Sha256(Sha256::new()),
            };
            h.update(&digest_input(raw_header));
            h
        }
        d => return Err(VerifyError::UnsupportedDigest(d)),
    };

    read_images(progress, &mut hasher)?;

    match hasher {
        Hasher::Md5(c) => {
            let d = c.compute();
            if d.0 != progress.md5sum {
                warn!("MD5 mismatch: computed {d:x}");
                return Err(VerifyError::DigestMismatch);
            }
        }
        Hasher::Sha1(h) => check_signature(
            progress,
            key,
            Pkcs1v15Sign::new::<Sha1>(),
            &h.finalize(),
        )?,
        Hasher::Sha256(h) => check_signature(
            progress,
            key,
            Pkcs1v15Sign::new::<Sha256>(),
            &h.finalize(),
        )?,
    }

    info!("Package verified");
    Ok(())
}

fn check_sizes(progress: &DownloadProgress) -> Result<()> {
    for img in &progress.images {
        let expected = img.size as u64;
        if img.written != expected {
            return Err(VerifyError::SizeMismatch {
                name: img.name.clone(),
                expected,
                actual: img.written,
            });
        }
        // devices and volumes report their partition size, so only plain
        // files can be checked
        if img.kind == TargetKind::PlainFile {
            let actual = std::fs::metadata(&img.path)
                .map_err(|source| VerifyError::Io {
                    path: img.path.clone(),
                    source,
                })?
                .len();
            if actual != expected {
                return Err(VerifyError::SizeMismatch {
                    name: img.name.clone(),
                    expected,
                    actual,
                });
            }
        }
    }
    Ok(())
}

fn read_images(progress: &mut DownloadProgress, hasher: &mut Hasher) -> Result<()> {
    let mut buf = vec![0u8; READ_CHUNK];
    for img in progress.images.iter_mut() {
        let io_err = |source| VerifyError::Io {
            path: img.path.clone(),
            source,
        };
        let f = File::open(&img.path).map_err(io_err)?;
        let mut r = f.take(img.size as u64);
        img.read = 0;
        loop {
            let n = r.read(&mut buf).map_err(|source| VerifyError::Io {
                path: img.path.clone(),
                source,
            })?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            img.read += n as u64;
        }
        if img.read != img.size as u64 {
            return Err(VerifyError::Io {
                path: img.path.clone(),
                source: io::ErrorKind::UnexpectedEof.into(),
            });
        }
        debug!("{}: read back {} bytes", img.name, img.read);
    }
    Ok(())
}

fn check_signature(
    progress: &DownloadProgress,
    key: &VerifyKey,
    scheme: Pkcs1v15Sign,
    hash: &[u8],
) -> Result<()> {
    let len = key.size();
    let sig = progress
        .signature
        .get(..len)
        .ok_or(VerifyError::SignatureInvalid)?;
    key.key
        .verify(scheme, hash, sig)
        .map_err(|_| VerifyError::SignatureInvalid)
}
