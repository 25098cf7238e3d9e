// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * FOTA agent: streaming package writer
 *
 * Copyright (c) 2025 Code Construct
 */

//! Demultiplexes a package byte stream into its image partitions.
//!
//! The stream must be delivered in order. The header at offset 0 decides
//! where every image goes; subsequent bytes are split by image range and
//! written to the matching target, with the progress record persisted
//! after each write so the download can continue after a restart.

use std::io;

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use thiserror::Error;

use crate::config::UbiResume;
use crate::pkg::{FormatError, PackageHeader};
use crate::progress::{DownloadProgress, ImageProgress, ProgressError, ProgressStore};
use crate::resolve::{ResolveError, Resolver};
use crate::target::{Target, TargetKind};

#[derive(Error, Debug)]
pub enum RejectReason {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Persist(#[from] ProgressError),
}

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Non-sequential write at {got}, expected {expected}")]
    NonSequential { expected: u64, got: u64 },
    #[error("Package header rejected: {0}")]
    HeaderRejected(#[from] RejectReason),
    #[error("Image {name} exceeds its partition ({capacity} bytes)")]
    ImageTooLarge { name: String, capacity: u64 },
    #[error("Write past the package end at {end}")]
    PastEnd { end: u64 },
    #[error("IO error writing {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("Can't persist progress: {0}")]
    Persist(#[from] ProgressError),
}

impl WriteError {
    /// Whether the download may continue from the last durable offset
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Persist(_))
    }

    fn io(name: &str) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::Io {
            name: name.into(),
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum SeekError {
    #[error("Seek to {requested} is beyond the durable offset {durable}")]
    BeyondDurable { requested: u64, durable: u64 },
    #[error("No recorded progress for this package")]
    NoProgress,
    #[error("Can't resume the UBI volume update of {0}")]
    ResumeUnsupported(String),
    #[error("Can't reopen image: {0}")]
    Reopen(#[from] ResolveError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Progress error: {0}")]
    Persist(#[from] ProgressError),
}

/// Byte range of `a` that overlaps `b`, if any
fn overlap(a: (u64, u64), b: (u64, u64)) -> Option<(u64, u64)> {
    let s = a.0.max(b.0);
    let e = a.1.min(b.1);
    (s < e).then_some((s, e))
}

/// Streaming writer for one package download
pub struct DemuxWriter {
    resolver: Resolver,
    store: ProgressStore,
    url: String,
    ubi_resume: UbiResume,
    cursor: u64,
    progress: Option<DownloadProgress>,
    // parallel to progress.images, None once an image is complete
    targets: Vec<Option<Target>>,
}

impl DemuxWriter {
    pub fn new(
        resolver: Resolver,
        store: ProgressStore,
        url: &str,
        ubi_resume: UbiResume,
    ) -> Self {
        Self {
            resolver,
            store,
            url: url.into(),
            ubi_resume,
            cursor: 0,
            progress: None,
            targets: Vec::new(),
        }
    }

    /// Next stream offset expected by [`write_at`](Self::write_at)
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn progress(&self) -> Option<&DownloadProgress> {
        self.progress.as_ref()
    }

    /// Package length, once the header has been seen
    pub fn total_size(&self) -> Option<u64> {
        self.progress.as_ref().map(DownloadProgress::total_size)
    }

    pub fn is_complete(&self) -> bool {
        self.progress
            .as_ref()
            .is_some_and(DownloadProgress::is_complete)
    }

    pub fn into_progress(self) -> Option<DownloadProgress> {
        self.progress
    }

    /// Write `buf` at package offset `offset`.
    ///
    /// `offset` must equal the current cursor. The write at offset 0 must
    /// contain the complete package header.
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize, WriteError> {
        if offset != self.cursor {
            return Err(WriteError::NonSequential {
                expected: self.cursor,
                got: offset,
            });
        }
        if buf.is_empty() {
            return Ok(0);
        }

        if self.progress.is_none() {
            self.start(buf)?;
        }

        let Some(progress) = self.progress.as_mut() else {
            return Err(WriteError::NonSequential {
                expected: 0,
                got: offset,
            });
        };

        let end = offset + buf.len() as u64;
        let total = progress.total_size();
        if end > total {
            return Err(WriteError::PastEnd { end: total });
        }

        // Check every image before writing any of them
        for img in &progress.images {
            if let Some((s, e)) = overlap((img.offset as u64, img.end()), (offset, end)) {
                let pos = e - img.offset as u64;
                if pos > img.capacity {
                    return Err(WriteError::ImageTooLarge {
                        name: img.name.clone(),
                        capacity: img.capacity,
                    });
                }
                trace!("{}: {} bytes at {}", img.name, e - s, s - img.offset as u64);
            }
        }

        let mut touched = Vec::new();
        for (i, img) in progress.images.iter_mut().enumerate() {
            let Some((s, e)) = overlap((img.offset as u64, img.end()), (offset, end))
            else {
                continue;
            };
            let t = self.targets.get_mut(i).and_then(Option::as_mut).ok_or_else(|| {
                WriteError::io(&img.name)(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "image target is closed",
                ))
            })?;
            let data = &buf[(s - offset) as usize..(e - offset) as usize];
            t.write_all(data).map_err(WriteError::io(&img.name))?;
            img.written = e - img.offset as u64;
            touched.push(i);
        }

        for i in touched {
            let img = &progress.images[i];
            if let Some(t) = self.targets[i].as_mut() {
                t.sync().map_err(WriteError::io(&img.name))?;
            }
            if img.is_complete() {
                info!("{}: complete, {} bytes", img.name, img.size);
                self.targets[i] = None;
            }
        }

        self.cursor = end;
        progress.offset = end;
        self.store.save(progress)?;
        Ok(buf.len())
    }

    fn start(&mut self, buf: &[u8]) -> Result<(), WriteError> {
        let header = PackageHeader::parse(buf).map_err(RejectReason::from)?;
        header.validate_layout(None).map_err(RejectReason::from)?;
        info!(
            "Package: {} images, {} bytes, digest {:?}",
            header.images.len(),
            header.package_size(),
            header.digest
        );

        let mut progress = DownloadProgress::new(&self.url, &header);
        let mut targets = Vec::new();
        for img in &header.images {
            let r = match self.resolver.resolve(&img.name, img.size as u64) {
                Ok(r) => r,
                Err(e) => {
                    warn!("Can't place image {}: {e}", img.name);
                    drop(targets);
                    self.discard(&progress);
                    return Err(RejectReason::from(e).into());
                }
            };
            progress.images.push(ImageProgress {
                name: img.name.clone(),
                offset: img.offset,
                size: img.size,
                kind: r.target.kind(),
                slot: r.slot,
                path: r.target.path().into(),
                device: r.device,
                capacity: r.target.capacity(),
                written: 0,
                read: 0,
            });
            targets.push((img.size > 0).then_some(r.target));
        }

        let hs = header.header_size as usize;
        let persisted = self
            .store
            .save_header(&buf[..hs])
            .and_then(|_| self.store.save(&progress));
        if let Err(e) = persisted {
            drop(targets);
            self.discard(&progress);
            return Err(RejectReason::from(e).into());
        }

        self.progress = Some(progress);
        self.targets = targets;
        Ok(())
    }

    // Undo a rejected start: remove created files and any persisted state
    fn discard(&self, progress: &DownloadProgress) {
        for img in &progress.images {
            if img.kind == TargetKind::PlainFile {
                if let Err(e) = std::fs::remove_file(&img.path) {
                    debug!("removing {}: {e}", img.path.display());
                }
            }
        }
        if let Err(e) = self.store.clear() {
            warn!("Can't clear progress: {e}");
        }
    }

    /// Reposition the stream at `offset`, which must not be beyond the
    /// durably recorded offset.
    ///
    /// The recorded progress is reloaded, so any write that failed part
    /// way through is discarded. Completed images are not reopened.
    pub fn seek(&mut self, offset: u64) -> Result<(), SeekError> {
        self.targets.clear();

        if offset == 0 {
            self.progress = None;
            self.cursor = 0;
            return Ok(());
        }

        let mut p = match self.store.load()? {
            Some(p) if p.url == self.url => p,
            _ => return Err(SeekError::NoProgress),
        };

        if offset > p.offset {
            return Err(SeekError::BeyondDurable {
                requested: offset,
                durable: p.offset,
            });
        }

        // Images before the seek point are complete and later ones start
        // afresh, so a partial image is reopened before any new volume
        // update begins.
        let mut targets = Vec::new();
        for img in p.images.iter_mut() {
            let w = img.written_at(offset);
            img.written = w;
            img.read = 0;
            if w >= img.size as u64 {
                targets.push(None);
                continue;
            }
            let fresh = w == 0;
            let mut t = self.resolver.reopen(
                img.kind,
                &img.path,
                img.capacity,
                img.size as u64,
                fresh,
            )?;
            if !fresh {
                if !t.can_resume() {
                    match self.ubi_resume {
                        UbiResume::Restart => {
                            return Err(SeekError::ResumeUnsupported(img.name.clone()))
                        }
                        UbiResume::Seek => {
                            warn!("{}: continuing volume update at {w}", img.name)
                        }
                    }
                }
                t.seek_to(w)?;
            }
            debug!("{}: resuming at {w}", img.name);
            targets.push(Some(t));
        }

        p.offset = offset;
        self.store.save(&p)?;
        self.cursor = offset;
        self.progress = Some(p);
        self.targets = targets;
        Ok(())
    }
}
