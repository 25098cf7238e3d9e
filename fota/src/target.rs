// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * FOTA agent: writable image targets
 *
 * Copyright (c) 2025 Code Construct
 */

//! Destinations for image data.
//!
//! A [`Target`] is an open handle on a plain file, a raw block device or a
//! UBI volume. Device specific queries go through [`DeviceOps`], which the
//! platform crate implements with the relevant ioctls.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use num_derive::FromPrimitive;

#[derive(FromPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TargetKind {
    PlainFile = 0,
    RawBlock = 1,
    UbiVolume = 2,
}

/// Platform device queries
pub trait DeviceOps {
    /// Size in bytes of a block device
    fn block_size(&self, path: &Path) -> io::Result<u64>;

    /// Size in bytes of an MTD character device
    fn mtd_size(&self, path: &Path) -> io::Result<u64>;

    /// Reserved size in bytes of a UBI volume
    fn ubi_volume_size(&self, path: &Path) -> io::Result<u64>;

    /// Begin a volume update of `len` bytes on an open UBI volume.
    ///
    /// The volume contents are discarded.
    fn ubi_start_update(&self, dev: &File, len: u64) -> io::Result<()>;

    /// Bytes available to unprivileged writers on the filesystem
    /// containing `path`
    fn free_space(&self, path: &Path) -> io::Result<u64>;

    /// Index of the UBI volume named `name` on ubi0
    fn ubi_volume_index(&self, name: &str) -> io::Result<Option<u32>>;
}

pub type SharedOps = Arc<dyn DeviceOps + Send + Sync>;

/// An open image destination
#[derive(Debug)]
pub struct Target {
    kind: TargetKind,
    path: PathBuf,
    file: File,
    capacity: u64,
}

impl Target {
    /// Open a target for writing.
    ///
    /// Plain files are created if needed, and truncated when `fresh`.
    /// Devices must already exist.
    pub fn open(
        kind: TargetKind,
        path: &Path,
        capacity: u64,
        fresh: bool,
    ) -> io::Result<Self> {
        let mut o = OpenOptions::new();
        o.write(true);
        if kind == TargetKind::PlainFile {
            o.create(true).truncate(fresh);
        }
        let file = o.open(path)?;
        trace!("opened {kind:?} target {}", path.display());
        Ok(Self {
            kind,
            path: path.into(),
            file,
            capacity,
        })
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    /// Maximum number of bytes this target can hold
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Whether writing can continue from an arbitrary position
    pub fn can_resume(&self) -> bool {
        self.kind != TargetKind::UbiVolume
    }

    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf)
    }

    /// Position the next write at `pos` bytes into the target.
    ///
    /// Plain files are truncated there, so no stale data follows the
    /// resume point.
    pub fn seek_to(&mut self, pos: u64) -> io::Result<()> {
        if self.kind == TargetKind::PlainFile {
            self.file.set_len(pos)?;
        }
        self.file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    pub fn sync(&mut self) -> io::Result<()> {
        self.file.flush()?;
        match self.kind {
            TargetKind::PlainFile => self.file.sync_all(),
            _ => self.file.sync_data(),
        }
    }
}
