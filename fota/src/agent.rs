// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * FOTA agent: update pipeline
 *
 * Copyright (c) 2025 Code Construct
 */

//! Drives an update from version check to switchover.
//!
//! [`Agent`] may be shared between threads. Only one download or commit
//! runs at a time; other callers get [`AgentError::AlreadyInProgress`]
//! rather than waiting.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use thiserror::Error;

use crate::config::{keys, Config, Timeouts};
use crate::env::{BootEnv, EnvError, Runner, Settings};
use crate::event::{Event, Notifier, ProgressMeter};
use crate::pkg::{PackageHeader, HEADER_LEN};
use crate::progress::{DownloadProgress, ProgressError, ProgressStore};
use crate::resolve::{PartitionTable, ResolveError, Resolver};
use crate::switch::{BootOutcome, SwitchError, SwitchState, Switchover};
use crate::target::SharedOps;
use crate::verify::{verify, VerifyError, VerifyKey};
use crate::writer::{DemuxWriter, SeekError, WriteError};

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Agent already started")]
    AlreadyStarted,
    #[error("Agent not started")]
    NotStarted,
    #[error("Update already in progress")]
    AlreadyInProgress,
    #[error("Cancelled")]
    Cancelled,
    #[error("No update available")]
    NoUpdate,
    #[error("Package ended at offset {offset}, before all images were received")]
    Truncated { offset: u64 },
    #[error("Package source error: {0}")]
    Source(#[source] io::Error),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Seek(#[from] SeekError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error(transparent)]
    Switch(#[from] SwitchError),
    #[error(transparent)]
    Progress(#[from] ProgressError),
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl AgentError {
    /// Numeric status reported in error events, as a negative errno
    pub fn code(&self) -> i32 {
        match self {
            // EBUSY
            Self::AlreadyStarted | Self::AlreadyInProgress => -16,
            // EPERM
            Self::NotStarted => -1,
            // ECANCELED
            Self::Cancelled => -125,
            // ENOENT
            Self::NoUpdate => -2,
            Self::Verify(VerifyError::Io { .. }) => -5,
            // EBADMSG
            Self::Verify(_) => -74,
            Self::Write(WriteError::HeaderRejected(_)) => -22,
            // EFBIG
            Self::Write(WriteError::ImageTooLarge { .. })
            | Self::Resolve(ResolveError::ImageTooLarge { .. }) => -27,
            // ENOSPC
            Self::Resolve(ResolveError::InsufficientSpace { .. }) => -28,
            Self::Resolve(ResolveError::UnknownImage(_)) => -22,
            Self::Switch(SwitchError::InvalidTransition { .. }) => -22,
            _ => -5,
        }
    }

    /// Whether the transfer may continue from the last durable offset
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Source(_) | Self::Truncated { .. } => true,
            Self::Write(e) => e.is_retryable(),
            Self::Seek(SeekError::Io(_)) => true,
            _ => false,
        }
    }
}

type Result<T> = std::result::Result<T, AgentError>;

/// Latest version advertised by the update server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: String,
    pub url: String,
    pub changelog: String,
    pub timestamp: Option<String>,
}

/// Queries the update server
pub trait VersionSource {
    fn latest(&mut self) -> io::Result<VersionInfo>;
}

/// Fetches package bytes
pub trait PackageSource {
    /// Open `url`, positioned at `offset`. Network transports apply
    /// `timeouts` to the connection.
    fn open(
        &mut self,
        url: &str,
        offset: u64,
        timeouts: Timeouts,
    ) -> io::Result<Box<dyn Read + Send>>;
}

/// Packages from the local filesystem, `file://` URLs or plain paths
#[derive(Debug, Default)]
pub struct FileSource;

impl PackageSource for FileSource {
    fn open(
        &mut self,
        url: &str,
        offset: u64,
        _timeouts: Timeouts,
    ) -> io::Result<Box<dyn Read + Send>> {
        let path = url.strip_prefix("file://").unwrap_or(url);
        let mut f = File::open(path)?;
        f.seek(SeekFrom::Start(offset))?;
        Ok(Box::new(f))
    }
}

/// Platform collaborators used by the agent
pub struct Platform<E, R, S> {
    pub env: E,
    pub runner: R,
    pub settings: S,
}

struct Inner<E, R, S> {
    platform: Platform<E, R, S>,
    config: Config,
    switch: Switchover,
    // verified and ready to commit
    verified: Option<DownloadProgress>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Busy<'a>(&'a AtomicBool);

impl<'a> Busy<'a> {
    fn claim(flag: &'a AtomicBool) -> Result<Self> {
        if flag.swap(true, Ordering::SeqCst) {
            return Err(AgentError::AlreadyInProgress);
        }
        Ok(Self(flag))
    }
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// Read until `buf` is full or the source ends
fn read_chunk(r: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match r.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(l) => n += l,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}

// Read the complete package header into the start of `buf`, growing it
// when the header is larger than the usual size
fn read_header(r: &mut dyn Read, buf: &mut Vec<u8>) -> Result<usize> {
    let n = read_chunk(r, &mut buf[..HEADER_LEN]).map_err(AgentError::Source)?;
    let hs = match PackageHeader::declared_size(&buf[..n]) {
        Some(hs) if n == HEADER_LEN && hs > HEADER_LEN => hs,
        // the writer rejects anything short or malformed
        _ => return Ok(n),
    };

    if buf.len() < hs {
        buf.resize(hs, 0);
    }
    let rest = read_chunk(r, &mut buf[n..hs]).map_err(AgentError::Source)?;
    if n + rest < hs {
        return Err(AgentError::Truncated {
            offset: (n + rest) as u64,
        });
    }
    Ok(hs)
}

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct Agent<E, R, S> {
    table: PartitionTable,
    ops: SharedOps,
    key: VerifyKey,
    store: ProgressStore,
    inner: Mutex<Inner<E, R, S>>,
    events: Mutex<Notifier>,
    started: AtomicBool,
    busy: AtomicBool,
    cancel: AtomicBool,
}

impl<E: BootEnv, R: Runner, S: Settings> Agent<E, R, S> {
    pub fn new(
        config: Config,
        table: PartitionTable,
        ops: SharedOps,
        platform: Platform<E, R, S>,
        key: VerifyKey,
    ) -> Result<Self> {
        let switch =
            Switchover::from_env(table.rootfs, &config, table.slot_names(), &platform.env)?;
        let store = ProgressStore::new(&config.progress_path, &config.header_path);
        Ok(Self {
            table,
            ops,
            key,
            store,
            inner: Mutex::new(Inner {
                platform,
                config,
                switch,
                verified: None,
            }),
            events: Mutex::new(Notifier::default()),
            started: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
        })
    }

    /// Receive events from now on, replacing any previous subscriber
    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = channel();
        *lock(&self.events) = Notifier::new(tx);
        rx
    }

    fn emit(&self, ev: Event) {
        lock(&self.events).emit(ev)
    }

    fn fail(&self, e: AgentError) -> AgentError {
        error!("{e}");
        self.emit(Event::Error {
            code: e.code(),
            msg: e.to_string(),
        });
        e
    }

    /// Access the platform collaborators
    pub fn with_platform<T>(&self, f: impl FnOnce(&mut Platform<E, R, S>) -> T) -> T {
        f(&mut lock(&self.inner).platform)
    }

    pub fn config(&self) -> Config {
        lock(&self.inner).config.clone()
    }

    /// Start accepting update requests. Tunables are reloaded from the
    /// settings store.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(AgentError::AlreadyStarted);
        }
        self.cancel.store(false, Ordering::SeqCst);
        let mut inner = lock(&self.inner);
        let Inner {
            platform, config, ..
        } = &mut *inner;
        config.load_settings(&platform.settings);
        info!("Agent started");
        Ok(())
    }

    /// Stop accepting requests and cancel any running download
    pub fn stop(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        if self.started.swap(false, Ordering::SeqCst) {
            info!("Agent stopped");
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SwitchState {
        lock(&self.inner).switch.state()
    }

    fn ensure_started(&self) -> Result<()> {
        if !self.is_started() {
            return Err(AgentError::NotStarted);
        }
        Ok(())
    }

    fn transition(&self, to: SwitchState) -> Result<()> {
        Ok(lock(&self.inner).switch.transition(to)?)
    }

    fn set_idle(&self) {
        if let Err(e) = self.transition(SwitchState::Idle) {
            debug!("staying in state: {e}");
        }
    }

    /// Ask the update server for the latest version.
    ///
    /// The advertised version, changelog and URL are recorded. Recorded
    /// progress for any other URL is discarded.
    pub fn version_check(&self, source: &mut dyn VersionSource) -> Result<VersionInfo> {
        self.ensure_started()?;
        let _busy = Busy::claim(&self.busy)?;

        let info = source.latest().map_err(AgentError::Source)?;
        debug!("latest version {info:?}");

        let (current, local_changelog) = {
            let mut inner = lock(&self.inner);
            let s = &mut inner.platform.settings;
            s.set_string(keys::NEW_VERSION, &info.version)?;
            s.set_string(keys::NEW_CHANGELOG, &info.changelog)?;
            s.set_string(keys::IMG_URL, &info.url)?;
            (
                s.get_string(keys::APP_VERSION),
                s.get_string(keys::CHANGELOG),
            )
        };

        let offset = self.store.resume_offset(&info.url)?;
        info!(
            "Version {} available, current {}, resume at {offset}",
            info.version,
            current.as_deref().unwrap_or("unknown")
        );

        self.emit(Event::Version {
            current,
            new: info.version.clone(),
            changelog: info.changelog.clone(),
            local_changelog,
        });
        Ok(info)
    }

    /// Check for updates every `sleep_time` while automatic checks are
    /// enabled, downloading any version other than the running one.
    ///
    /// Returns once a verified package is waiting for
    /// [`restart`](Self::restart), or when the agent is stopped. Failed
    /// checks and downloads are retried at the next interval.
    pub fn run(
        &self,
        versions: &mut dyn VersionSource,
        packages: &mut dyn PackageSource,
    ) -> Result<()> {
        self.ensure_started()?;
        let config = self.config();
        if !config.auto_check {
            info!("Automatic update checks disabled");
            return Ok(());
        }

        while self.is_started() {
            if matches!(
                self.state(),
                SwitchState::SwitchPending | SwitchState::Committed
            ) {
                return Ok(());
            }
            match self.check_and_download(versions, packages) {
                Ok(true) => return Ok(()),
                Ok(false) => (),
                Err(AgentError::Cancelled | AgentError::NotStarted) => break,
                Err(e) => warn!("Update check failed: {e}"),
            }
            self.pause(config.sleep_time);
        }
        info!("Automatic update checks stopped");
        Ok(())
    }

    fn check_and_download(
        &self,
        versions: &mut dyn VersionSource,
        packages: &mut dyn PackageSource,
    ) -> Result<bool> {
        let info = self.version_check(versions)?;
        let current = self.with_platform(|p| p.settings.get_string(keys::APP_VERSION));
        if current.as_deref() == Some(info.version.as_str()) {
            debug!("Version {} is running", info.version);
            return Ok(false);
        }
        self.download(packages)?;
        Ok(true)
    }

    // Sleep for `d`, waking early when the agent is stopped
    fn pause(&self, d: Duration) {
        let deadline = Instant::now() + d;
        while self.is_started() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(POLL_INTERVAL));
        }
    }

    /// Download the package found by the last version check
    pub fn download(&self, source: &mut dyn PackageSource) -> Result<()> {
        self.ensure_started()?;
        let _busy = Busy::claim(&self.busy)?;
        let url = lock(&self.inner)
            .platform
            .settings
            .get_string(keys::IMG_URL)
            .ok_or(AgentError::NoUpdate)?;
        self.run_download(&url, source)
    }

    /// Download the package at `url`
    pub fn download_url(&self, url: &str, source: &mut dyn PackageSource) -> Result<()> {
        self.ensure_started()?;
        let _busy = Busy::claim(&self.busy)?;
        lock(&self.inner)
            .platform
            .settings
            .set_string(keys::IMG_URL, url)?;
        self.run_download(url, source)
    }

    fn run_download(&self, url: &str, source: &mut dyn PackageSource) -> Result<()> {
        self.transition(SwitchState::Downloading)
            .map_err(|e| self.fail(e))?;
        lock(&self.inner).verified = None;

        let r = self
            .transfer(url, source)
            .and_then(|p| self.verify_download(p));
        match r {
            Ok(p) => {
                let mut inner = lock(&self.inner);
                inner.switch.transition(SwitchState::SwitchPending)?;
                inner.verified = Some(p);
                drop(inner);
                self.emit(Event::Finished);
                Ok(())
            }
            Err(e) => {
                self.set_idle();
                Err(self.fail(e))
            }
        }
    }

    fn transfer(&self, url: &str, source: &mut dyn PackageSource) -> Result<DownloadProgress> {
        let (config, resolver) = {
            let inner = lock(&self.inner);
            let r = Resolver::new(
                self.table.clone(),
                self.ops.clone(),
                &inner.config,
                &inner.platform.env,
            )?;
            (inner.config.clone(), r)
        };
        let mut writer =
            DemuxWriter::new(resolver, self.store.clone(), url, config.ubi_resume);

        let mut offset = self.store.resume_offset(url)?;
        let mut attempts = 0;
        loop {
            match self.transfer_once(&mut writer, source, url, offset, &config) {
                Ok(()) => break,
                Err(e) if e.is_retryable() && attempts < config.retry_count => {
                    attempts += 1;
                    warn!("Transfer failed, retry {attempts}/{}: {e}", config.retry_count);
                    offset = match self.store.load()? {
                        Some(p) if p.url == url => p.offset,
                        _ => 0,
                    };
                }
                Err(e) => return Err(e),
            }
        }

        writer
            .into_progress()
            .ok_or(AgentError::Truncated { offset: 0 })
    }

    fn transfer_once(
        &self,
        writer: &mut DemuxWriter,
        source: &mut dyn PackageSource,
        url: &str,
        offset: u64,
        config: &Config,
    ) -> Result<()> {
        let offset = match writer.seek(offset) {
            Ok(()) => offset,
            Err(e @ (SeekError::ResumeUnsupported(_) | SeekError::NoProgress)) => {
                warn!("Can't resume at {offset}, restarting: {e}");
                self.store.clear()?;
                writer.seek(0)?;
                0
            }
            Err(e) => return Err(e.into()),
        };

        let mut reader = source
            .open(url, offset, config.timeouts())
            .map_err(AgentError::Source)?;
        let mut meter = ProgressMeter::new(offset, writer.total_size().unwrap_or(0));
        let mut buf = vec![0u8; config.buffer_size.max(HEADER_LEN)];

        while !writer.is_complete() {
            if self.cancel.load(Ordering::SeqCst) {
                info!("Download cancelled at {}", writer.cursor());
                return Err(AgentError::Cancelled);
            }

            let pos = writer.cursor();
            // the header arrives alone, then reads stop at the package end
            let n = match writer.total_size() {
                Some(t) => {
                    let want = usize::try_from(t - pos).unwrap_or(usize::MAX).min(buf.len());
                    read_chunk(&mut reader, &mut buf[..want]).map_err(AgentError::Source)?
                }
                None => read_header(&mut reader, &mut buf)?,
            };
            if n == 0 {
                return Err(AgentError::Truncated { offset: pos });
            }
            writer.write_at(pos, &buf[..n])?;

            if let Some(t) = writer.total_size() {
                meter.set_total(t);
            }
            self.emit(Event::Progress(meter.report(writer.cursor())));
        }
        Ok(())
    }

    fn verify_download(&self, mut p: DownloadProgress) -> Result<DownloadProgress> {
        self.transition(SwitchState::Verifying)?;
        let header = self.store.load_header()?;
        if let Err(e) = verify(&mut p, &header, &self.key) {
            self.discard(&p);
            return Err(e.into());
        }
        self.store.save(&p)?;
        Ok(p)
    }

    // Drop a package that can't be used
    fn discard(&self, p: &DownloadProgress) {
        warn!("Discarding downloaded package {}", p.url);
        for img in &p.images {
            if img.kind == crate::target::TargetKind::PlainFile {
                if let Err(e) = std::fs::remove_file(&img.path) {
                    debug!("removing {}: {e}", img.path.display());
                }
            }
        }
        if let Err(e) = self.store.clear() {
            warn!("Can't clear progress: {e}");
        }
    }

    // A complete download recorded by an earlier process
    fn recover(&self) -> Result<DownloadProgress> {
        let mut p = match self.store.load()? {
            Some(p) if p.is_complete() => p,
            _ => return Err(AgentError::NoUpdate),
        };
        info!("Re-verifying downloaded package {}", p.url);
        self.transition(SwitchState::Verifying)?;
        let header = self.store.load_header()?;
        if let Err(e) = verify(&mut p, &header, &self.key) {
            self.discard(&p);
            self.set_idle();
            return Err(e.into());
        }
        self.transition(SwitchState::SwitchPending)?;
        Ok(p)
    }

    /// Commit the verified package and reboot after `delay`.
    pub fn restart(&self, delay: Duration) -> Result<()> {
        self.ensure_started()?;
        let _busy = Busy::claim(&self.busy)?;
        self.commit().map_err(|e| self.fail(e))?;

        self.emit(Event::Restart);
        if !self.config().reboot {
            info!("Reboot disabled, switchover takes effect on next boot");
            return Ok(());
        }
        std::thread::sleep(delay);
        let mut inner = lock(&self.inner);
        let Inner {
            platform, switch, ..
        } = &mut *inner;
        switch
            .reboot(&mut platform.runner)
            .map_err(|e| self.fail(e.into()))
    }

    fn commit(&self) -> Result<()> {
        let pending = lock(&self.inner).verified.take();
        let p = match pending {
            Some(p) => p,
            None => self.recover()?,
        };

        let mut inner = lock(&self.inner);
        let Inner {
            platform, switch, ..
        } = &mut *inner;
        let r = switch.commit(
            &p,
            &mut platform.env,
            &mut platform.runner,
            self.ops.as_ref(),
        );
        if let Err(e) = r {
            inner.verified = Some(p);
            return Err(e.into());
        }
        drop(inner);

        if let Err(e) = self.store.clear() {
            warn!("Can't clear progress: {e}");
        }
        Ok(())
    }

    /// Confirm or roll back a pending update, run once after boot
    pub fn boot_check(&self) -> Result<BootOutcome> {
        let _busy = Busy::claim(&self.busy)?;
        let mut inner = lock(&self.inner);
        let Inner {
            platform, switch, ..
        } = &mut *inner;
        let outcome = switch.boot_check(
            &mut platform.env,
            &mut platform.settings,
            self.ops.as_ref(),
        )?;
        drop(inner);

        if outcome != BootOutcome::NoUpdate {
            self.store.clear()?;
        }
        Ok(outcome)
    }

    /// Space available for an image, or on the root filesystem for `None`
    pub fn available_size(&self, name: Option<&str>) -> Result<u64> {
        let inner = lock(&self.inner);
        match name {
            None | Some("root") => Ok(self.ops.free_space(&inner.config.root)?),
            Some(name) => {
                let r = Resolver::new(
                    self.table.clone(),
                    self.ops.clone(),
                    &inner.config,
                    &inner.platform.env,
                )?;
                Ok(r.capacity(name)?)
            }
        }
    }
}
