// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * FOTA agent: shared unit test helpers
 *
 * Copyright (c) 2025 Code Construct
 */

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::pkg::{digest_input, DigestType, ImageDescriptor, PackageHeader, SignatureType, HEADER_LEN};
use crate::target::DeviceOps;
use crate::verify::VerifyKey;

pub const TEST_KEY_PEM: &str = include_str!("../tests/data/test_key.pem");

pub fn start_log() {
    let _ = env_logger::Builder::new()
        .filter(None, log::LevelFilter::Trace)
        .is_test(true)
        .try_init();
}

fn header_for(images: &[(&str, &[u8])], header_size: u16) -> PackageHeader {
    let mut h = PackageHeader::new();
    h.header_size = header_size;
    let mut off = header_size as u32;
    let mut md5 = md5::Context::new();
    for (name, data) in images {
        h.images.push(ImageDescriptor::new(name, off, data.len() as u32));
        off += data.len() as u32;
        md5.consume(data);
    }
    h.md5sum = md5.compute().0;
    h
}

fn assemble(h: &PackageHeader, images: &[(&str, &[u8])]) -> Vec<u8> {
    let mut pkg = h.to_bytes();
    for (_, data) in images {
        pkg.extend_from_slice(data);
    }
    pkg
}

/// Package with images laid out back to back and an MD5 sum
pub fn build_package(images: &[(&str, &[u8])]) -> Vec<u8> {
    build_package_sized(images, HEADER_LEN as u16)
}

/// As [`build_package`], with a `header_size` byte header
pub fn build_package_sized(images: &[(&str, &[u8])], header_size: u16) -> Vec<u8> {
    let mut h = header_for(images, header_size);
    h.seal();
    assemble(&h, images)
}

fn test_key() -> RsaPrivateKey {
    RsaPrivateKey::from_pkcs1_pem(TEST_KEY_PEM).unwrap()
}

pub fn test_verify_key() -> VerifyKey {
    VerifyKey::from_public_key(RsaPublicKey::from(&test_key()))
}

/// Package signed with the test key, `digest` is SHA1 or SHA256
pub fn build_signed_package(images: &[(&str, &[u8])], digest: DigestType) -> Vec<u8> {
    let mut h = header_for(images, HEADER_LEN as u16);
    h.digest = digest;
    h.signature_type = SignatureType::Rsa1024;
    h.seal();

    let unsigned = assemble(&h, images);
    let input = digest_input(&unsigned[..HEADER_LEN]);
    let body = &unsigned[HEADER_LEN..];
    let key = test_key();
    let sig = match digest {
        DigestType::Sha1 => {
            let hash = Sha1::new().chain_update(&input).chain_update(body).finalize();
            key.sign(Pkcs1v15Sign::new::<Sha1>(), &hash)
        }
        _ => {
            let hash = Sha256::new().chain_update(&input).chain_update(body).finalize();
            key.sign(Pkcs1v15Sign::new::<Sha256>(), &hash)
        }
    }
    .unwrap();
    h.signature[..sig.len()].copy_from_slice(&sig);
    assemble(&h, images)
}

/// Device queries answered from fixed sizes
pub struct FakeDevices {
    default_size: u64,
    free: u64,
    sizes: Mutex<HashMap<PathBuf, u64>>,
    updates: Mutex<Vec<u64>>,
    volumes: Mutex<HashMap<String, u32>>,
}

impl FakeDevices {
    pub fn new(default_size: u64, free: u64) -> Self {
        Self {
            default_size,
            free,
            sizes: Default::default(),
            updates: Default::default(),
            volumes: Default::default(),
        }
    }

    pub fn set_size(&self, path: &Path, size: u64) {
        self.sizes.lock().unwrap().insert(path.into(), size);
    }

    pub fn set_volume(&self, name: &str, idx: u32) {
        self.volumes.lock().unwrap().insert(name.into(), idx);
    }

    /// Lengths passed to each UBI volume update
    pub fn updates(&self) -> Vec<u64> {
        self.updates.lock().unwrap().clone()
    }

    fn size(&self, path: &Path) -> io::Result<u64> {
        Ok(*self
            .sizes
            .lock()
            .unwrap()
            .get(path)
            .unwrap_or(&self.default_size))
    }
}

impl DeviceOps for FakeDevices {
    fn block_size(&self, path: &Path) -> io::Result<u64> {
        self.size(path)
    }

    fn mtd_size(&self, path: &Path) -> io::Result<u64> {
        self.size(path)
    }

    fn ubi_volume_size(&self, path: &Path) -> io::Result<u64> {
        self.size(path)
    }

    fn ubi_start_update(&self, _dev: &File, len: u64) -> io::Result<()> {
        self.updates.lock().unwrap().push(len);
        Ok(())
    }

    fn free_space(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.free)
    }

    fn ubi_volume_index(&self, name: &str) -> io::Result<Option<u32>> {
        Ok(self.volumes.lock().unwrap().get(name).copied())
    }
}
