// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * FOTA agent: partition layout discovery
 *
 * Copyright (c) 2025 Code Construct
 */

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use fota::resolve::{IMG_KERNEL, IMG_ROOTFS};
use fota::{PartitionTable, RootFs, Slot};

const EMMC_DISK: &str = "/sys/block/mmcblk0";
const EMMC_UBOOT: &str = "/dev/mmcblk0boot0";

/// Root filesystem type from a kernel command line
pub fn rootfs_from_cmdline(cmdline: &str) -> RootFs {
    if cmdline.split_whitespace().any(|a| a == "rootfstype=ext4") {
        RootFs::Ext4
    } else {
        RootFs::Ubi
    }
}

/// Root filesystem type of the running system
pub fn detect_rootfs() -> io::Result<RootFs> {
    let cmdline = fs::read_to_string("/proc/cmdline")?;
    Ok(rootfs_from_cmdline(&cmdline))
}

/// Partition layout of the running system
pub fn discover(rootfs: RootFs) -> io::Result<PartitionTable> {
    match rootfs {
        RootFs::Ubi => Ok(PartitionTable::ubi_default()),
        RootFs::Ext4 => discover_emmc(
            Path::new(EMMC_DISK),
            Path::new("/dev"),
            Path::new(EMMC_UBOOT),
        ),
    }
}

// Image name and slot for an eMMC partition name. Slot B partitions carry
// a 'B' suffix, slot A an optional 'A'.
fn image_slot(partname: &str) -> (String, Slot) {
    let (base, slot) = match partname.strip_suffix('B') {
        Some(b) => (b, Slot::B),
        None => (partname.strip_suffix('A').unwrap_or(partname), Slot::A),
    };
    let name = match base {
        "boot" | "kernel" => IMG_KERNEL,
        "root" | "rootfs" => IMG_ROOTFS,
        b => b,
    };
    (name.to_string(), slot)
}

fn uevent_value<'a>(uevent: &'a str, key: &str) -> Option<&'a str> {
    uevent
        .lines()
        .find_map(|l| l.strip_prefix(key)?.strip_prefix('='))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Build an eMMC partition table from the partitions of the disk at
/// `disk` in sysfs, with device nodes under `dev`.
///
/// Only images with partitions for both slots are included.
pub fn discover_emmc(disk: &Path, dev: &Path, uboot: &Path) -> io::Result<PartitionTable> {
    let disk_name = disk
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();

    let mut found: BTreeMap<String, [Option<PathBuf>; 2]> = BTreeMap::new();
    for ent in fs::read_dir(disk)? {
        let ent = ent?;
        let is_part = ent
            .file_name()
            .to_str()
            .is_some_and(|n| n.starts_with(&disk_name) && n != disk_name);
        if !is_part {
            continue;
        }
        let uevent = match fs::read_to_string(ent.path().join("uevent")) {
            Ok(u) => u,
            Err(e) => {
                debug!("{}: {e}", ent.path().display());
                continue;
            }
        };
        let (Some(partname), Some(devname)) = (
            uevent_value(&uevent, "PARTNAME"),
            uevent_value(&uevent, "DEVNAME"),
        ) else {
            continue;
        };

        let (name, slot) = image_slot(partname);
        let path = dev.join(devname);
        debug!("{partname}: {name} slot {slot} at {}", path.display());
        let e = found.entry(name).or_default();
        e[if slot == Slot::A { 0 } else { 1 }] = Some(path);
    }

    let mut table = PartitionTable::new(RootFs::Ext4, uboot);
    for (name, slots) in found {
        match slots {
            [Some(a), Some(b)] => table.add_slots(&name, &a, &b),
            _ => trace!("{name}: not an A/B partition"),
        }
    }

    if table.slot_names().next().is_none() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no A/B partitions on {}", disk.display()),
        ));
    }
    Ok(table)
}
