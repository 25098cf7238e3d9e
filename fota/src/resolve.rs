// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * FOTA agent: A/B partition resolution
 *
 * Copyright (c) 2025 Code Construct
 */

//! Maps package image names to writable partitions.
//!
//! Slotted images (kernel, rootfs and custom A/B partitions) are always
//! written to the slot that is not currently active, as recorded in the
//! boot environment. The bootloader image is staged to a file for an
//! external flasher, and diff images go to a scratch file.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use thiserror::Error;

use crate::config::Config;
use crate::env::{BootEnv, EnvError};
use crate::target::{SharedOps, Target, TargetKind};

pub const IMG_UBOOT: &str = "uboot";
pub const IMG_KERNEL: &str = "kernel";
pub const IMG_ROOTFS: &str = "rootfs";
pub const IMG_DIFF: &str = "diff";

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Unknown image '{0}'")]
    UnknownImage(String),
    #[error("Image {name} ({size} bytes) is larger than its partition ({capacity} bytes)")]
    ImageTooLarge { name: String, size: u64, capacity: u64 },
    #[error("Insufficient space for {name}: {size} bytes, {free} free")]
    InsufficientSpace { name: String, size: u64, free: u64 },
    #[error("Boot environment error: {0}")]
    Env(#[from] EnvError),
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ResolveError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.into(),
            source,
        }
    }
}

type Result<T> = std::result::Result<T, ResolveError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn other(self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    fn index(self) -> usize {
        match self {
            Slot::A => 0,
            Slot::B => 1,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::A => write!(f, "A"),
            Slot::B => write!(f, "B"),
        }
    }
}

/// Root filesystem layout of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootFs {
    /// Raw NAND with UBI volumes
    Ubi,
    /// eMMC with ext4 partitions
    Ext4,
}

/// Boot environment key holding the active slot of `name`
pub fn slot_key(name: &str) -> String {
    match name {
        IMG_KERNEL => "boot_partition".into(),
        IMG_ROOTFS => "root_partition".into(),
        n => format!("{n}_partition"),
    }
}

/// Boot environment value selecting `slot` for `name`
pub fn slot_value(name: &str, slot: Slot) -> String {
    match name {
        IMG_KERNEL => format!("boot{slot}"),
        IMG_ROOTFS => format!("rootfs{slot}"),
        _ => slot.to_string(),
    }
}

/// Interpret a boot environment slot value
pub fn parse_slot(name: &str, value: &str) -> Option<Slot> {
    let [a, b] = [Slot::A, Slot::B].map(|s| slot_value(name, s));
    if value.contains(&a) {
        Some(Slot::A)
    } else if value.contains(&b) {
        Some(Slot::B)
    } else {
        None
    }
}

/// Read the active slot of `name` from the boot environment
pub fn active_slot(env: &dyn BootEnv, name: &str) -> Result<Option<Slot>> {
    let v = env.get(&slot_key(name))?;
    Ok(v.and_then(|v| parse_slot(name, &v)))
}

/// Physical partition layout
#[derive(Debug, Clone)]
pub struct PartitionTable {
    pub rootfs: RootFs,
    /// Bootloader device, queried for capacity only
    pub uboot: PathBuf,
    slots: BTreeMap<String, [PathBuf; 2]>,
}

impl PartitionTable {
    pub fn new(rootfs: RootFs, uboot: &Path) -> Self {
        Self {
            rootfs,
            uboot: uboot.into(),
            slots: BTreeMap::new(),
        }
    }

    /// Default NAND layout: bootloader on mtd1, kernel and rootfs in UBI
    /// volumes 5-8 of ubi0.
    pub fn ubi_default() -> Self {
        let mut t = Self::new(RootFs::Ubi, Path::new("/dev/mtd1"));
        t.add_slots(IMG_KERNEL, Path::new("/dev/ubi0_5"), Path::new("/dev/ubi0_6"));
        t.add_slots(IMG_ROOTFS, Path::new("/dev/ubi0_7"), Path::new("/dev/ubi0_8"));
        t
    }

    pub fn add_slots(&mut self, name: &str, a: &Path, b: &Path) {
        self.slots.insert(name.into(), [a.into(), b.into()]);
    }

    pub fn add_slot(&mut self, name: &str, slot: Slot, path: &Path) {
        let e = self.slots.entry(name.into()).or_default();
        e[slot.index()] = path.into();
    }

    pub fn slot_path(&self, name: &str, slot: Slot) -> Option<&Path> {
        self.slots
            .get(name)
            .map(|s| s[slot.index()].as_path())
            .filter(|p| !p.as_os_str().is_empty())
    }

    /// Names of all slotted images
    pub fn slot_names(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    /// Kind of target a slot device is written as
    pub fn kind_of(&self, path: &Path) -> TargetKind {
        let ubi = path
            .file_name()
            .and_then(|f| f.to_str())
            .is_some_and(|f| f.starts_with("ubi"));
        if self.rootfs == RootFs::Ubi && ubi {
            TargetKind::UbiVolume
        } else {
            TargetKind::RawBlock
        }
    }
}

/// Outcome of resolving one image
#[derive(Debug)]
pub struct Resolved {
    pub target: Target,
    /// Physical destination of the image
    pub device: PathBuf,
    /// Set when the image is staged to a file rather than written in place
    pub staging: Option<PathBuf>,
    /// Slot being written, for slotted images
    pub slot: Option<Slot>,
}

/// Resolves images for a single update attempt.
///
/// The active slots are read from the boot environment once, when the
/// resolver is created.
pub struct Resolver {
    table: PartitionTable,
    ops: SharedOps,
    config: Config,
    active: BTreeMap<String, Option<Slot>>,
}

impl Resolver {
    pub fn new(
        table: PartitionTable,
        ops: SharedOps,
        config: &Config,
        env: &dyn BootEnv,
    ) -> Result<Self> {
        let mut active = BTreeMap::new();
        for name in table.slot_names() {
            let s = active_slot(env, name)?;
            debug!("{name}: active slot {s:?}");
            active.insert(name.to_string(), s);
        }
        Ok(Self {
            table,
            ops,
            config: config.clone(),
            active,
        })
    }

    pub fn table(&self) -> &PartitionTable {
        &self.table
    }

    /// Slot that an update of `name` is written to
    ///
    /// Slot A is written unless it is the active one.
    pub fn target_slot(&self, name: &str) -> Option<Slot> {
        let active = self.active.get(name)?;
        Some(match active {
            Some(Slot::A) => Slot::B,
            _ => Slot::A,
        })
    }

    /// Capacity available to `name`, without opening anything
    pub fn capacity(&self, name: &str) -> Result<u64> {
        let ops = &self.ops;
        match name {
            IMG_DIFF => {
                let root = &self.config.root;
                ops.free_space(root).map_err(ResolveError::io(root))
            }
            IMG_UBOOT => {
                let dev = &self.table.uboot;
                let size = match self.table.rootfs {
                    RootFs::Ubi => ops.mtd_size(dev),
                    RootFs::Ext4 => ops.block_size(dev),
                };
                size.map_err(ResolveError::io(dev))
            }
            _ => {
                let dev = self.slot_device(name)?;
                let size = match self.table.kind_of(dev) {
                    TargetKind::UbiVolume => ops.ubi_volume_size(dev),
                    _ => ops.block_size(dev),
                };
                size.map_err(ResolveError::io(dev))
            }
        }
    }

    fn slot_device(&self, name: &str) -> Result<&Path> {
        self.target_slot(name)
            .and_then(|s| self.table.slot_path(name, s))
            .ok_or_else(|| ResolveError::UnknownImage(name.into()))
    }

    /// Open the destination for image `name` of `size` bytes.
    ///
    /// Capacity is checked before anything is opened. UBI volumes have a
    /// volume update started for exactly `size` bytes.
    pub fn resolve(&self, name: &str, size: u64) -> Result<Resolved> {
        let too_large = |capacity| ResolveError::ImageTooLarge {
            name: name.into(),
            size,
            capacity,
        };

        match name {
            IMG_DIFF => {
                let free = self.capacity(name)?;
                if size >= free {
                    return Err(ResolveError::InsufficientSpace {
                        name: name.into(),
                        size,
                        free,
                    });
                }
                let p = &self.config.diff_path;
                let target = Target::open(TargetKind::PlainFile, p, size, true)
                    .map_err(ResolveError::io(p))?;
                Ok(Resolved {
                    target,
                    device: p.clone(),
                    staging: None,
                    slot: None,
                })
            }
            IMG_UBOOT => {
                let capacity = self.capacity(name)?;
                if size > capacity {
                    return Err(too_large(capacity));
                }
                let p = self.config.staging_path(name);
                let target = Target::open(TargetKind::PlainFile, &p, capacity, true)
                    .map_err(ResolveError::io(&p))?;
                Ok(Resolved {
                    target,
                    device: self.table.uboot.clone(),
                    staging: Some(p),
                    slot: None,
                })
            }
            _ => {
                let dev = self.slot_device(name)?;
                let capacity = self.capacity(name)?;
                if size > capacity {
                    return Err(too_large(capacity));
                }
                let kind = self.table.kind_of(dev);
                let target = Target::open(kind, dev, capacity, true)
                    .map_err(ResolveError::io(dev))?;
                if kind == TargetKind::UbiVolume {
                    self.ops
                        .ubi_start_update(target.file(), size)
                        .map_err(ResolveError::io(dev))?;
                }
                info!("{name}: writing {}", dev.display());
                Ok(Resolved {
                    target,
                    device: dev.into(),
                    staging: None,
                    slot: self.target_slot(name),
                })
            }
        }
    }

    /// Re-open a previously resolved destination to continue writing.
    ///
    /// `fresh` restarts the destination from empty, including a new UBI
    /// volume update of `size` bytes.
    pub fn reopen(
        &self,
        kind: TargetKind,
        path: &Path,
        capacity: u64,
        size: u64,
        fresh: bool,
    ) -> Result<Target> {
        let target = Target::open(kind, path, capacity, fresh)
            .map_err(ResolveError::io(path))?;
        if fresh && kind == TargetKind::UbiVolume {
            self.ops
                .ubi_start_update(target.file(), size)
                .map_err(ResolveError::io(path))?;
        }
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::MemBootEnv;
    use crate::testutil::FakeDevices;
    use std::sync::Arc;

    fn setup(env: &MemBootEnv) -> (tempfile::TempDir, Resolver, Arc<FakeDevices>) {
        let dir = tempfile::tempdir().unwrap();
        let d = dir.path();
        let mut table = PartitionTable::new(RootFs::Ext4, &d.join("boot0"));
        for n in ["kernel", "rootfs", "tee"] {
            table.add_slots(n, &d.join(format!("{n}A")), &d.join(format!("{n}B")));
            std::fs::write(d.join(format!("{n}A")), b"").unwrap();
            std::fs::write(d.join(format!("{n}B")), b"").unwrap();
        }
        let ops = Arc::new(FakeDevices::new(1000, 5000));
        ops.set_size(&d.join("boot0"), 64);
        let r = Resolver::new(table, ops.clone(), &Config::with_state_dir(d), env).unwrap();
        (dir, r, ops)
    }

    #[test]
    fn slot_names() {
        assert_eq!(slot_key("kernel"), "boot_partition");
        assert_eq!(slot_key("rootfs"), "root_partition");
        assert_eq!(slot_key("tee"), "tee_partition");
        assert_eq!(slot_value("kernel", Slot::B), "bootB");
        assert_eq!(slot_value("rootfs", Slot::A), "rootfsA");
        assert_eq!(parse_slot("rootfs", "rootfsB\n"), Some(Slot::B));
        assert_eq!(parse_slot("kernel", "rootfsB"), None);
        assert_eq!(parse_slot("tf", "A"), Some(Slot::A));
        assert_eq!(Slot::A.other(), Slot::B);
    }

    #[test]
    fn inactive_slot() {
        let env = MemBootEnv::with(&[
            ("boot_partition", "bootA"),
            ("root_partition", "rootfsB"),
        ]);
        let (dir, r, _) = setup(&env);
        assert_eq!(r.target_slot("kernel"), Some(Slot::B));
        assert_eq!(r.target_slot("rootfs"), Some(Slot::A));
        // unset selects A
        assert_eq!(r.target_slot("tee"), Some(Slot::A));

        let res = r.resolve("kernel", 100).unwrap();
        assert_eq!(res.device, dir.path().join("kernelB"));
        assert_eq!(res.slot, Some(Slot::B));
        assert_eq!(res.target.kind(), TargetKind::RawBlock);
        assert_eq!(res.target.capacity(), 1000);
    }

    #[test]
    fn too_large() {
        let (_dir, r, _) = setup(&MemBootEnv::new());
        assert!(matches!(
            r.resolve("rootfs", 1001),
            Err(ResolveError::ImageTooLarge { capacity: 1000, .. })
        ));
        // uboot staged, bounded by the boot device
        assert!(matches!(
            r.resolve("uboot", 65),
            Err(ResolveError::ImageTooLarge { capacity: 64, .. })
        ));
        assert!(!r.config.staging_path("uboot").exists());

        let res = r.resolve("uboot", 64).unwrap();
        assert_eq!(res.staging.as_deref(), Some(res.target.path()));
        assert_eq!(res.target.kind(), TargetKind::PlainFile);
    }

    #[test]
    fn diff_space() {
        let (dir, r, _) = setup(&MemBootEnv::new());
        assert!(matches!(
            r.resolve("diff", 5000),
            Err(ResolveError::InsufficientSpace { free: 5000, .. })
        ));
        let res = r.resolve("diff", 4999).unwrap();
        assert_eq!(res.target.path(), dir.path().join("diff"));
    }

    #[test]
    fn unknown() {
        let (_dir, r, _) = setup(&MemBootEnv::new());
        assert!(matches!(
            r.resolve("bogus", 1),
            Err(ResolveError::UnknownImage(_))
        ));
    }

    #[test]
    fn ubi_volume_update() {
        let dir = tempfile::tempdir().unwrap();
        let d = dir.path();
        let mut table = PartitionTable::new(RootFs::Ubi, &d.join("mtd1"));
        table.add_slots("rootfs", &d.join("ubi0_7"), &d.join("ubi0_8"));
        std::fs::write(d.join("ubi0_7"), b"").unwrap();
        let ops = Arc::new(FakeDevices::new(2000, 0));
        let env = MemBootEnv::with(&[("root_partition", "rootfsB")]);
        let r = Resolver::new(table, ops.clone(), &Config::with_state_dir(d), &env)
            .unwrap();

        let res = r.resolve("rootfs", 1500).unwrap();
        assert_eq!(res.target.kind(), TargetKind::UbiVolume);
        assert_eq!(ops.updates(), vec![1500]);
    }
}
