// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * FOTA agent: resumable download state
 *
 * Copyright (c) 2025 Code Construct
 */

//! Download progress record and its persistence.
//!
//! The record is written as a small binary file, replaced atomically on
//! every update so a power loss leaves either the old or the new record.

use std::ffi::{OsStr, OsString};
use std::fs::{self, File};
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use nom::{
    bytes::complete::{tag, take},
    combinator::{all_consuming, map, map_opt, verify},
    multi::{length_count, length_data},
    number::complete::{le_u16, le_u32, le_u64, le_u8},
    sequence::tuple,
    Finish, IResult,
};
use num_traits::FromPrimitive;
use thiserror::Error;

use crate::pkg::{DigestType, PackageHeader, SignatureType, MD5_LEN};
use crate::resolve::Slot;
use crate::target::TargetKind;

type VResult<I, O> = IResult<I, O>;

const PROGRESS_MAGIC: &[u8; 4] = b"FPRG";
const PROGRESS_VERSION: u16 = 2;

#[derive(Error, Debug)]
pub enum ProgressError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Corrupt progress record: {0}")]
    Corrupt(String),
    #[error("{0} too long for the progress record")]
    TooLong(&'static str),
}

type Result<T> = std::result::Result<T, ProgressError>;

/// Progress of one image within the package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageProgress {
    pub name: String,
    /// Offset of the image within the package
    pub offset: u32,
    pub size: u32,
    pub kind: TargetKind,
    /// Slot written, for slotted images
    pub slot: Option<Slot>,
    /// File or device the image bytes are written to
    pub path: PathBuf,
    /// Physical destination, differs from `path` for staged images
    pub device: PathBuf,
    pub capacity: u64,
    /// Bytes durably written
    pub written: u64,
    /// Bytes read back during verification
    pub read: u64,
}

impl ImageProgress {
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.size as u64
    }

    pub fn is_complete(&self) -> bool {
        self.written >= self.size as u64
    }

    /// Bytes of this image that lie before package offset `pos`
    pub fn written_at(&self, pos: u64) -> u64 {
        pos.saturating_sub(self.offset as u64).min(self.size as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Package source
    pub url: String,
    /// Package offset durably reached
    pub offset: u64,
    pub header_size: u16,
    pub digest: DigestType,
    pub signature_type: SignatureType,
    pub md5sum: [u8; MD5_LEN],
    pub signature: Vec<u8>,
    pub images: Vec<ImageProgress>,
}

impl DownloadProgress {
    /// Start a record for `header`, with images not yet resolved.
    pub fn new(url: &str, header: &PackageHeader) -> Self {
        Self {
            url: url.into(),
            offset: 0,
            header_size: header.header_size,
            digest: header.digest,
            signature_type: header.signature_type,
            md5sum: header.md5sum,
            signature: header.signature.clone(),
            images: Vec::new(),
        }
    }

    /// Total package length
    pub fn total_size(&self) -> u64 {
        self.images
            .iter()
            .map(ImageProgress::end)
            .max()
            .unwrap_or(0)
            .max(self.header_size as u64)
    }

    /// All images fully written
    pub fn is_complete(&self) -> bool {
        self.images.iter().all(ImageProgress::is_complete)
    }

    pub fn image(&self, name: &str) -> Option<&ImageProgress> {
        self.images.iter().find(|i| i.name == name)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        fn put_str(b: &mut Vec<u8>, s: &[u8], field: &'static str) -> Result<()> {
            let len = u32::try_from(s.len()).map_err(|_| ProgressError::TooLong(field))?;
            b.extend_from_slice(&len.to_le_bytes());
            b.extend_from_slice(s);
            Ok(())
        }

        let mut b = Vec::new();
        b.extend_from_slice(PROGRESS_MAGIC);
        b.extend_from_slice(&PROGRESS_VERSION.to_le_bytes());
        put_str(&mut b, self.url.as_bytes(), "URL")?;
        b.extend_from_slice(&self.offset.to_le_bytes());
        b.extend_from_slice(&self.header_size.to_le_bytes());
        b.extend_from_slice(&(self.digest as u16).to_le_bytes());
        b.extend_from_slice(&(self.signature_type as u16).to_le_bytes());
        b.extend_from_slice(&self.md5sum);
        put_str(&mut b, &self.signature, "signature")?;
        b.push(self.images.len() as u8);
        for i in &self.images {
            put_str(&mut b, i.name.as_bytes(), "image name")?;
            b.extend_from_slice(&i.offset.to_le_bytes());
            b.extend_from_slice(&i.size.to_le_bytes());
            b.push(i.kind as u8);
            b.push(match i.slot {
                None => 0,
                Some(Slot::A) => 1,
                Some(Slot::B) => 2,
            });
            put_str(&mut b, i.path.as_os_str().as_bytes(), "image path")?;
            put_str(&mut b, i.device.as_os_str().as_bytes(), "device path")?;
            b.extend_from_slice(&i.capacity.to_le_bytes());
            b.extend_from_slice(&i.written.to_le_bytes());
            b.extend_from_slice(&i.read.to_le_bytes());
        }
        Ok(b)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let (_, p) = all_consuming(parse_progress)(buf)
            .finish()
            .map_err(|e| {
                let at = buf.len() - e.input.len();
                ProgressError::Corrupt(format!("parse failed at byte {at}"))
            })?;
        Ok(p)
    }
}

fn parse_string(buf: &[u8]) -> VResult<&[u8], String> {
    map_opt(length_data(le_u32), |s: &[u8]| {
        core::str::from_utf8(s).ok().map(String::from)
    })(buf)
}

fn parse_path(buf: &[u8]) -> VResult<&[u8], PathBuf> {
    map(length_data(le_u32), |s: &[u8]| {
        PathBuf::from(OsString::from(OsStr::from_bytes(s)))
    })(buf)
}

fn parse_slot(buf: &[u8]) -> VResult<&[u8], Option<Slot>> {
    map_opt(le_u8, |s| match s {
        0 => Some(None),
        1 => Some(Some(Slot::A)),
        2 => Some(Some(Slot::B)),
        _ => None,
    })(buf)
}

fn parse_image(buf: &[u8]) -> VResult<&[u8], ImageProgress> {
    map(
        tuple((
            parse_string,
            le_u32,
            le_u32,
            map_opt(le_u8, TargetKind::from_u8),
            parse_slot,
            parse_path,
            parse_path,
            le_u64,
            le_u64,
            le_u64,
        )),
        |(name, offset, size, kind, slot, path, device, capacity, written, read)| {
            ImageProgress {
                name,
                offset,
                size,
                kind,
                slot,
                path,
                device,
                capacity,
                written,
                read,
            }
        },
    )(buf)
}

fn parse_progress(buf: &[u8]) -> VResult<&[u8], DownloadProgress> {
    map(
        tuple((
            tag(&PROGRESS_MAGIC[..]),
            verify(le_u16, |v: &u16| *v == PROGRESS_VERSION),
            parse_string,
            le_u64,
            le_u16,
            map_opt(le_u16, DigestType::from_u16),
            map_opt(le_u16, SignatureType::from_u16),
            take(MD5_LEN),
            length_data(le_u32),
            length_count(le_u8, parse_image),
        )),
        |(
            _magic,
            _version,
            url,
            offset,
            header_size,
            digest,
            signature_type,
            md5,
            signature,
            images,
        )| {
            let mut md5sum = [0u8; MD5_LEN];
            md5sum.copy_from_slice(md5);
            DownloadProgress {
                url,
                offset,
                header_size,
                digest,
                signature_type,
                md5sum,
                signature: signature.to_vec(),
                images,
            }
        },
    )(buf)
}

/// Replace `path` with `data`, surviving power loss at any point.
fn write_durable(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut f = File::create(&tmp)?;
    f.write_all(data)?;
    f.sync_all()?;
    drop(f);
    fs::rename(&tmp, path)?;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        r => r,
    }
}

/// Persisted progress record and raw header copy
#[derive(Debug, Clone)]
pub struct ProgressStore {
    progress_path: PathBuf,
    header_path: PathBuf,
}

impl ProgressStore {
    pub fn new(progress_path: &Path, header_path: &Path) -> Self {
        Self {
            progress_path: progress_path.into(),
            header_path: header_path.into(),
        }
    }

    /// Load the recorded progress, `None` if there is none.
    pub fn load(&self) -> Result<Option<DownloadProgress>> {
        let buf = match fs::read(&self.progress_path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        DownloadProgress::from_bytes(&buf).map(Some)
    }

    pub fn save(&self, p: &DownloadProgress) -> Result<()> {
        trace!("saving progress at offset {}", p.offset);
        write_durable(&self.progress_path, &p.to_bytes()?)?;
        Ok(())
    }

    pub fn save_header(&self, raw: &[u8]) -> Result<()> {
        write_durable(&self.header_path, raw)?;
        Ok(())
    }

    pub fn load_header(&self) -> Result<Vec<u8>> {
        Ok(fs::read(&self.header_path)?)
    }

    /// Discard all recorded state
    pub fn clear(&self) -> Result<()> {
        remove_if_exists(&self.progress_path)?;
        remove_if_exists(&self.header_path)?;
        Ok(())
    }

    /// Offset to resume a download of `url` from.
    ///
    /// Progress recorded for a different package is discarded. A corrupt
    /// record is treated as no progress.
    pub fn resume_offset(&self, url: &str) -> Result<u64> {
        let p = match self.load() {
            Ok(p) => p,
            Err(ProgressError::Corrupt(e)) => {
                warn!("Discarding progress record: {e}");
                None
            }
            Err(e) => return Err(e),
        };
        match p {
            Some(p) if p.url == url => {
                info!("Resuming {url} at offset {}", p.offset);
                Ok(p.offset)
            }
            _ => {
                self.clear()?;
                Ok(0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::ImageDescriptor;

    fn sample() -> DownloadProgress {
        let mut h = PackageHeader::new();
        h.digest = DigestType::Sha256;
        h.signature_type = SignatureType::Rsa1024;
        h.md5sum = [7; MD5_LEN];
        h.images.push(ImageDescriptor::new("kernel", 1024, 100));
        let mut p = DownloadProgress::new("http://example.com/fota.bin", &h);
        p.offset = 1074;
        p.images.push(ImageProgress {
            name: "kernel".into(),
            offset: 1024,
            size: 100,
            kind: TargetKind::UbiVolume,
            slot: Some(Slot::B),
            path: "/dev/ubi0_6".into(),
            device: "/dev/ubi0_6".into(),
            capacity: 10 << 20,
            written: 50,
            read: 0,
        });
        p
    }

    #[test]
    fn record_roundtrip() {
        let p = sample();
        let b = p.to_bytes().unwrap();
        assert_eq!(&b[..4], b"FPRG");
        assert_eq!(DownloadProgress::from_bytes(&b).unwrap(), p);
        assert_eq!(p.total_size(), 1124);
        assert!(!p.is_complete());
    }

    #[test]
    fn corrupt_record() {
        let b = sample().to_bytes().unwrap();
        assert!(matches!(
            DownloadProgress::from_bytes(&b[..b.len() - 1]),
            Err(ProgressError::Corrupt(_))
        ));
        let mut t = b.clone();
        t.push(0);
        assert!(matches!(
            DownloadProgress::from_bytes(&t),
            Err(ProgressError::Corrupt(_))
        ));
    }

    #[test]
    fn long_fields() {
        // lengths beyond 16 bits survive a reload
        let mut p = sample();
        p.url = format!("http://example.com/{}", "x".repeat(70_000));
        p.images[0].path = format!("/data/{}", "p".repeat(66_000)).into();
        let b = p.to_bytes().unwrap();
        assert_eq!(DownloadProgress::from_bytes(&b).unwrap(), p);

        // an older record layout is rejected
        let mut old = b.clone();
        old[4..6].copy_from_slice(&1u16.to_le_bytes());
        assert!(matches!(
            DownloadProgress::from_bytes(&old),
            Err(ProgressError::Corrupt(_))
        ));
    }

    #[test]
    fn store() {
        let dir = tempfile::tempdir().unwrap();
        let s = ProgressStore::new(&dir.path().join("info"), &dir.path().join("hdr"));
        assert_eq!(s.load().unwrap(), None);

        let p = sample();
        s.save(&p).unwrap();
        s.save_header(b"header").unwrap();
        assert_eq!(s.load().unwrap(), Some(p.clone()));
        assert_eq!(s.load_header().unwrap(), b"header");
        assert!(!dir.path().join("info.tmp").exists());

        assert_eq!(s.resume_offset(&p.url).unwrap(), 1074);
        // a different package discards the old state
        assert_eq!(s.resume_offset("http://example.com/other.bin").unwrap(), 0);
        assert_eq!(s.load().unwrap(), None);
        assert!(s.load_header().is_err());
    }

    #[test]
    fn corrupt_store_resumes_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let s = ProgressStore::new(&dir.path().join("info"), &dir.path().join("hdr"));
        fs::write(dir.path().join("info"), b"FPRGjunk").unwrap();
        assert_eq!(s.resume_offset("x").unwrap(), 0);
        assert!(!dir.path().join("info").exists());
    }

    #[test]
    fn written_at() {
        let i = &sample().images[0];
        assert_eq!(i.written_at(0), 0);
        assert_eq!(i.written_at(1050), 26);
        assert_eq!(i.written_at(5000), 100);
    }
}
