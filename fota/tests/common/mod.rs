// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! Packages, fake devices and an agent on a scratch directory.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use fota::env::{MemBootEnv, MemSettings, RecordingRunner};
use fota::pkg::{digest_input, DigestType, SignatureType, HEADER_LEN};
use fota::{
    Agent, Config, DeviceOps, ImageDescriptor, PackageHeader, PackageSource,
    PartitionTable, Platform, RootFs, Timeouts, VerifyKey,
};

pub type TestAgent = Agent<MemBootEnv, RecordingRunner, MemSettings>;

pub fn start_log() {
    let _ = env_logger::Builder::new()
        .filter(None, log::LevelFilter::Trace)
        .is_test(true)
        .try_init();
}

fn test_key() -> RsaPrivateKey {
    RsaPrivateKey::from_pkcs1_pem(include_str!("../data/test_key.pem")).unwrap()
}

pub fn verify_key() -> VerifyKey {
    VerifyKey::from_public_key(RsaPublicKey::from(&test_key()))
}

/// SHA256/RSA signed package with images back to back
pub fn signed_package(images: &[(&str, &[u8])]) -> Vec<u8> {
    let mut h = PackageHeader::new();
    let mut off = HEADER_LEN as u32;
    for (name, data) in images {
        h.images.push(ImageDescriptor::new(name, off, data.len() as u32));
        off += data.len() as u32;
    }
    h.digest = DigestType::Sha256;
    h.signature_type = SignatureType::Rsa1024;
    h.seal();

    let mut hash = Sha256::new();
    hash.update(digest_input(&h.to_bytes()));
    for (_, data) in images {
        hash.update(data);
    }
    let sig = test_key()
        .sign(Pkcs1v15Sign::new::<Sha256>(), &hash.finalize())
        .unwrap();
    h.signature[..sig.len()].copy_from_slice(&sig);

    let mut pkg = h.to_bytes();
    for (_, data) in images {
        pkg.extend_from_slice(data);
    }
    pkg
}

/// Serves a package, optionally cut short
pub struct MemSource {
    pub data: Vec<u8>,
    pub limit: Option<usize>,
    pub opens: Vec<u64>,
}

impl MemSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            limit: None,
            opens: Vec::new(),
        }
    }

    pub fn cut_at(data: Vec<u8>, limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::new(data)
        }
    }
}

impl PackageSource for MemSource {
    fn open(
        &mut self,
        _url: &str,
        offset: u64,
        _timeouts: Timeouts,
    ) -> io::Result<Box<dyn Read + Send>> {
        self.opens.push(offset);
        let end = self.limit.unwrap_or(self.data.len());
        let mut c = Cursor::new(self.data[..end].to_vec());
        c.set_position(offset);
        Ok(Box::new(c))
    }
}

#[derive(Default)]
pub struct FakeDevices {
    pub sizes: Mutex<HashMap<PathBuf, u64>>,
}

impl FakeDevices {
    pub const DEFAULT_SIZE: u64 = 64 * 1024;
    pub const FREE: u64 = 1024 * 1024;

    fn size(&self, path: &Path) -> u64 {
        *self
            .sizes
            .lock()
            .unwrap()
            .get(path)
            .unwrap_or(&Self::DEFAULT_SIZE)
    }
}

impl DeviceOps for FakeDevices {
    fn block_size(&self, path: &Path) -> io::Result<u64> {
        Ok(self.size(path))
    }

    fn mtd_size(&self, path: &Path) -> io::Result<u64> {
        Ok(self.size(path))
    }

    fn ubi_volume_size(&self, path: &Path) -> io::Result<u64> {
        Ok(self.size(path))
    }

    fn ubi_start_update(&self, _dev: &File, _len: u64) -> io::Result<()> {
        Ok(())
    }

    fn free_space(&self, _path: &Path) -> io::Result<u64> {
        Ok(Self::FREE)
    }

    fn ubi_volume_index(&self, _name: &str) -> io::Result<Option<u32>> {
        Ok(None)
    }
}

/// An eMMC-style device: slot partitions are plain files in a scratch
/// directory, which also holds the state files.
pub struct Device {
    pub dir: tempfile::TempDir,
    pub ops: Arc<FakeDevices>,
    pub env: MemBootEnv,
    pub settings: MemSettings,
}

impl Device {
    pub fn new() -> Self {
        start_log();
        let dir = tempfile::tempdir().unwrap();
        for f in ["boot0", "kernelA", "kernelB", "rootfsA", "rootfsB"] {
            std::fs::write(dir.path().join(f), b"").unwrap();
        }
        Self {
            dir,
            ops: Arc::new(FakeDevices::default()),
            env: MemBootEnv::with(&[
                ("boot_partition", "bootA"),
                ("root_partition", "rootfsA"),
            ]),
            settings: MemSettings::new(),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn config(&self) -> Config {
        let mut c = Config::with_state_dir(self.dir.path());
        c.buffer_size = 2048;
        c.reboot = false;
        c
    }

    pub fn table(&self) -> PartitionTable {
        let mut t = PartitionTable::new(RootFs::Ext4, &self.path("boot0"));
        t.add_slots("kernel", &self.path("kernelA"), &self.path("kernelB"));
        t.add_slots("rootfs", &self.path("rootfsA"), &self.path("rootfsB"));
        t
    }

    /// Boot an agent with the current environment and settings
    pub fn agent(&self) -> TestAgent {
        let platform = Platform {
            env: self.env.clone(),
            runner: RecordingRunner::new(),
            settings: self.settings.clone(),
        };
        let a = Agent::new(
            self.config(),
            self.table(),
            self.ops.clone(),
            platform,
            verify_key(),
        )
        .unwrap();
        a.start().unwrap();
        a
    }

    /// Power off: keep the agent's environment and settings
    pub fn shutdown(&mut self, agent: TestAgent) {
        agent.with_platform(|p| {
            self.env = p.env.clone();
            self.settings = p.settings.clone();
        });
    }
}
