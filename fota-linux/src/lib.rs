// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * FOTA agent: Linux platform support
 *
 * Copyright (c) 2025 Code Construct
 */

#![warn(missing_docs)]

//! Linux implementations of the `fota` platform traits.
//!
//! [`LinuxDevices`] answers capacity queries through the block, MTD and
//! UBI ioctls and sysfs, [`FwEnv`] reads and writes the U-Boot environment
//! with `fw_printenv`/`fw_setenv`, and [`FileSettings`] keeps settings as
//! one file per key.
//!
//! ```no_run
//! use fota_linux::{detect_rootfs, discover};
//!
//! let rootfs = detect_rootfs()?;
//! let table = discover(rootfs)?;
//! # Ok::<(), std::io::Error>(())
//! ```

use core::mem;
use std::ffi::CString;
use std::fs::{self, File};
use std::io::Error;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use fota::DeviceOps;

mod bootenv;
mod discover;
mod settings;

pub use bootenv::{CommandRunner, FwEnv};
pub use discover::{detect_rootfs, discover, discover_emmc, rootfs_from_cmdline};
pub use settings::FileSettings;

/* ioctl request encoding, asm-generic layout */
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> u32 {
    (dir << 30) | ((size as u32) << 16) | ((ty as u32) << 8) | nr as u32
}

/* from linux/mtd/mtd-abi.h */
#[repr(C)]
#[allow(non_camel_case_types)]
#[derive(Default)]
struct mtd_info_user {
    typ: u8,
    flags: u32,
    size: u32,
    erasesize: u32,
    writesize: u32,
    oobsize: u32,
    padding: u64,
}

const BLKGETSIZE64: u32 = ioc(IOC_READ, 0x12, 114, mem::size_of::<libc::size_t>());
const MEMGETINFO: u32 = ioc(IOC_READ, b'M', 1, mem::size_of::<mtd_info_user>());
const UBI_IOCVOLUP: u32 = ioc(IOC_WRITE, b'O', 0, mem::size_of::<i64>());

// helper for IO error construction
fn last_os_error() -> Error {
    Error::last_os_error()
}

/// Device queries for block devices, MTD partitions and UBI volumes
#[derive(Debug, Clone)]
pub struct LinuxDevices {
    sysfs: PathBuf,
    ubi_dev: String,
}

impl Default for LinuxDevices {
    fn default() -> Self {
        Self::new(Path::new("/sys"))
    }
}

impl LinuxDevices {
    /// Create with sysfs mounted at `sysfs`. Volumes are looked up on
    /// `ubi0`.
    pub fn new(sysfs: &Path) -> Self {
        Self {
            sysfs: sysfs.into(),
            ubi_dev: "ubi0".into(),
        }
    }

    fn ubi_class(&self) -> PathBuf {
        self.sysfs.join("class/ubi")
    }

    fn read_sysfs_u64(path: &Path) -> std::io::Result<u64> {
        let s = fs::read_to_string(path)?;
        s.trim().parse().map_err(|_| {
            Error::new(
                std::io::ErrorKind::InvalidData,
                format!("bad value in {}: {s:?}", path.display()),
            )
        })
    }
}

impl DeviceOps for LinuxDevices {
    fn block_size(&self, path: &Path) -> std::io::Result<u64> {
        let f = File::open(path)?;
        let meta = f.metadata()?;
        if meta.is_file() {
            return Ok(meta.len());
        }

        let mut size: u64 = 0;
        // safety: BLKGETSIZE64 writes a single u64
        let rc = unsafe {
            libc::ioctl(f.as_raw_fd(), BLKGETSIZE64 as _, &mut size as *mut u64)
        };
        if rc < 0 {
            return Err(last_os_error());
        }
        trace!("{}: {size} bytes", path.display());
        Ok(size)
    }

    fn mtd_size(&self, path: &Path) -> std::io::Result<u64> {
        let f = File::open(path)?;
        let mut info = mtd_info_user::default();
        // safety: info matches the kernel's mtd_info_user layout
        let rc = unsafe {
            libc::ioctl(
                f.as_raw_fd(),
                MEMGETINFO as _,
                &mut info as *mut mtd_info_user,
            )
        };
        if rc < 0 {
            return Err(last_os_error());
        }
        trace!(
            "{}: mtd type {} size {} erase {}",
            path.display(),
            info.typ,
            info.size,
            info.erasesize
        );
        Ok(info.size as u64)
    }

    fn ubi_volume_size(&self, path: &Path) -> std::io::Result<u64> {
        let name = path.file_name().ok_or_else(|| {
            Error::new(std::io::ErrorKind::InvalidInput, "no volume name")
        })?;
        let vol = self.ubi_class().join(name);
        let ebs = Self::read_sysfs_u64(&vol.join("reserved_ebs"))?;
        let eb_size = Self::read_sysfs_u64(&vol.join("usable_eb_size"))?;
        Ok(ebs * eb_size)
    }

    fn ubi_start_update(&self, dev: &File, len: u64) -> std::io::Result<()> {
        let bytes = len as i64;
        // safety: UBI_IOCVOLUP reads a single i64
        let rc = unsafe {
            libc::ioctl(dev.as_raw_fd(), UBI_IOCVOLUP as _, &bytes as *const i64)
        };
        if rc < 0 {
            return Err(last_os_error());
        }
        debug!("UBI volume update started, {len} bytes");
        Ok(())
    }

    fn free_space(&self, path: &Path) -> std::io::Result<u64> {
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| Error::new(std::io::ErrorKind::InvalidInput, e))?;
        // safety: statvfs is plain data, all-zero is a valid value
        let mut st: libc::statvfs = unsafe { mem::zeroed() };
        // safety: cpath is NUL terminated, st is a valid out pointer
        let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut st) };
        if rc < 0 {
            return Err(last_os_error());
        }
        Ok(st.f_bavail as u64 * st.f_bsize as u64)
    }

    fn ubi_volume_index(&self, name: &str) -> std::io::Result<Option<u32>> {
        let prefix = format!("{}_", self.ubi_dev);
        for ent in fs::read_dir(self.ubi_class())? {
            let ent = ent?;
            let fname = ent.file_name();
            let Some(idx) = fname
                .to_str()
                .and_then(|f| f.strip_prefix(&prefix))
                .and_then(|i| i.parse().ok())
            else {
                continue;
            };
            match fs::read_to_string(ent.path().join("name")) {
                Ok(n) if n.trim() == name => return Ok(Some(idx)),
                Ok(_) => (),
                Err(e) => debug!("{}: {e}", ent.path().display()),
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
fn start_log() {
    let _ = env_logger::Builder::new()
        .filter(None, log::LevelFilter::Trace)
        .is_test(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_numbers() {
        assert_eq!(mem::size_of::<mtd_info_user>(), 32);
        assert_eq!(MEMGETINFO, 0x8020_4d01);
        assert_eq!(UBI_IOCVOLUP, 0x4008_4f00);
        if mem::size_of::<libc::size_t>() == 8 {
            assert_eq!(BLKGETSIZE64, 0x8008_1272);
        }
    }

    fn fake_volume(sysfs: &Path, dir: &str, name: &str, ebs: u64) {
        let v = sysfs.join("class/ubi").join(dir);
        fs::create_dir_all(&v).unwrap();
        fs::write(v.join("name"), format!("{name}\n")).unwrap();
        fs::write(v.join("reserved_ebs"), format!("{ebs}\n")).unwrap();
        fs::write(v.join("usable_eb_size"), "126976\n").unwrap();
    }

    #[test]
    fn ubi_sysfs() {
        start_log();
        let d = tempfile::tempdir().unwrap();
        fake_volume(d.path(), "ubi0_7", "rootfsA", 100);
        fake_volume(d.path(), "ubi0_8", "rootfsB", 100);
        fake_volume(d.path(), "ubi1_0", "data", 10);
        fs::create_dir_all(d.path().join("class/ubi/ubi0")).unwrap();

        let dev = LinuxDevices::new(d.path());
        assert_eq!(dev.ubi_volume_index("rootfsB").unwrap(), Some(8));
        assert_eq!(dev.ubi_volume_index("data").unwrap(), None);
        assert_eq!(
            dev.ubi_volume_size(Path::new("/dev/ubi0_7")).unwrap(),
            100 * 126976
        );
        assert!(dev.ubi_volume_size(Path::new("/dev/ubi0_9")).is_err());
    }

    #[test]
    fn regular_files() {
        let d = tempfile::tempdir().unwrap();
        let f = d.path().join("img");
        fs::write(&f, [0u8; 4096]).unwrap();

        let dev = LinuxDevices::default();
        assert_eq!(dev.block_size(&f).unwrap(), 4096);
        assert!(dev.free_space(d.path()).unwrap() > 0);
        assert!(dev.free_space(&d.path().join("missing")).is_err());
    }
}
