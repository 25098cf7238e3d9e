// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * FOTA agent: runtime configuration
 *
 * Copyright (c) 2025 Code Construct
 */

use std::path::{Path, PathBuf};
use std::time::Duration;

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use crate::env::Settings;

/// Settings store keys
pub mod keys {
    pub const RETRY_COUNT: &str = "fota_retry_count";
    pub const AUTO_CHECK: &str = "fota_autock";
    pub const SLEEP_TIME: &str = "fota_sleeptime";
    pub const READ_TIMEOUT: &str = "fota_rtimeoutms";
    pub const WRITE_TIMEOUT: &str = "fota_wtimeoutms";
    pub const IMG_URL: &str = "cop_img_url";
    pub const NEW_VERSION: &str = "cop_version";
    pub const NEW_CHANGELOG: &str = "newchangelog";
    pub const APP_VERSION: &str = "app_version";
    pub const CHANGELOG: &str = "changelog";
}

/// How an interrupted UBI volume update is resumed
///
/// A UBI volume update must be written in one pass from the start, so a
/// partially written volume can't simply be continued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UbiResume {
    /// Refuse the resume; the download restarts from offset 0.
    #[default]
    Restart,
    /// Reposition within the volume and continue writing. Only valid on
    /// platforms whose UBI driver tolerates it.
    Seek,
}

impl core::str::FromStr for UbiResume {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "restart" => Ok(Self::Restart),
            "seek" => Ok(Self::Seek),
            _ => Err(format!("unknown UBI resume policy '{s}'")),
        }
    }
}

/// Transport timeouts for a package download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Longest wait for incoming data
    pub read: Duration,
    /// Longest wait to send a request
    pub write: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Persisted download progress record
    pub progress_path: PathBuf,
    /// Copy of the raw package header
    pub header_path: PathBuf,
    /// Directory for images staged before an external flasher runs
    pub staging_dir: PathBuf,
    /// Scratch file for diff images
    pub diff_path: PathBuf,
    /// Filesystem queried for free space
    pub root: PathBuf,
    /// Transfer chunk size
    pub buffer_size: usize,
    /// Boots allowed before the bootloader falls back
    pub boot_limit: u32,
    /// Transfer retries after a retryable failure
    pub retry_count: u32,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub auto_check: bool,
    /// Interval between automatic version checks
    pub sleep_time: Duration,
    pub ubi_resume: UbiResume,
    /// Reboot once the switchover is committed
    pub reboot: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            progress_path: "/fotaimgsinfo.bin".into(),
            header_path: "/fotaimgsheader.bin".into(),
            staging_dir: "/".into(),
            diff_path: "/diff".into(),
            root: "/".into(),
            buffer_size: 64 * 1024,
            boot_limit: 5,
            retry_count: 0,
            read_timeout: Duration::from_millis(3000),
            write_timeout: Duration::from_millis(3000),
            auto_check: false,
            sleep_time: Duration::from_millis(30000),
            ubi_resume: UbiResume::default(),
            reboot: true,
        }
    }
}

impl Config {
    /// Default configuration with all state files under `dir`
    pub fn with_state_dir(dir: &Path) -> Self {
        Self {
            progress_path: dir.join("fotaimgsinfo.bin"),
            header_path: dir.join("fotaimgsheader.bin"),
            staging_dir: dir.into(),
            diff_path: dir.join("diff"),
            root: dir.into(),
            ..Default::default()
        }
    }

    /// Apply tunables from the settings store. Absent keys keep their
    /// current values.
    pub fn load_settings(&mut self, s: &dyn Settings) {
        let ms = |k| {
            s.get_int(k)
                .filter(|v| *v >= 0)
                .map(|v| Duration::from_millis(v as u64))
        };

        if let Some(v) = s.get_int(keys::RETRY_COUNT) {
            self.retry_count = v.max(0) as u32;
        }
        if let Some(v) = s.get_int(keys::AUTO_CHECK) {
            self.auto_check = v != 0;
        }
        if let Some(v) = ms(keys::SLEEP_TIME) {
            self.sleep_time = v;
        }
        if let Some(v) = ms(keys::READ_TIMEOUT) {
            self.read_timeout = v;
        }
        if let Some(v) = ms(keys::WRITE_TIMEOUT) {
            self.write_timeout = v;
        }
        debug!("config: {self:?}");
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            read: self.read_timeout,
            write: self.write_timeout,
        }
    }

    /// Where an image that is flashed by an external tool is staged
    pub fn staging_path(&self, name: &str) -> PathBuf {
        self.staging_dir.join(format!("fota_{name}.bin"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::MemSettings;

    #[test]
    fn settings_override() {
        let mut s = MemSettings::new();
        s.set_int(keys::RETRY_COUNT, 3).unwrap();
        s.set_int(keys::AUTO_CHECK, 1).unwrap();
        s.set_int(keys::READ_TIMEOUT, -4).unwrap();
        s.set_int(keys::SLEEP_TIME, 1000).unwrap();
        s.set_int(keys::WRITE_TIMEOUT, 500).unwrap();

        let mut c = Config::default();
        c.load_settings(&s);
        assert_eq!(c.retry_count, 3);
        assert!(c.auto_check);
        assert_eq!(c.sleep_time, Duration::from_secs(1));
        assert_eq!(
            c.timeouts(),
            Timeouts {
                read: Duration::from_millis(3000),
                write: Duration::from_millis(500),
            }
        );
    }

    #[test]
    fn state_dir() {
        let c = Config::with_state_dir(Path::new("/tmp/x"));
        assert_eq!(c.progress_path, Path::new("/tmp/x/fotaimgsinfo.bin"));
        assert_eq!(c.staging_path("uboot"), Path::new("/tmp/x/fota_uboot.bin"));
        assert_eq!("seek".parse::<UbiResume>(), Ok(UbiResume::Seek));
    }
}
