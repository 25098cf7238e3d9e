// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

mod common;

use std::time::Duration;

use fota::config::keys;
use fota::resolve::ResolveError;
use fota::writer::{RejectReason, WriteError};
use fota::{
    AgentError, BootEnv, BootOutcome, ProgressStore, Settings, SwitchState, VerifyError,
};

use common::{signed_package, Device, MemSource};

fn images() -> (Vec<u8>, Vec<u8>) {
    let kernel = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let rootfs = (0..7000u32).map(|i| (i % 13) as u8).collect();
    (kernel, rootfs)
}

fn package() -> Vec<u8> {
    let (k, r) = images();
    signed_package(&[("kernel", &k[..]), ("rootfs", &r[..])])
}

fn store(dev: &Device) -> ProgressStore {
    let c = dev.config();
    ProgressStore::new(&c.progress_path, &c.header_path)
}

#[test]
fn resume_after_power_loss() {
    let mut dev = Device::new();
    let agent = dev.agent();

    let mut src = MemSource::cut_at(package(), 6000);
    let r = agent.download_url("http://fw/1.pkg", &mut src);
    assert!(matches!(r, Err(AgentError::Truncated { offset: 6000 })));
    assert_eq!(agent.state(), SwitchState::Idle);
    dev.shutdown(agent);

    let agent = dev.agent();
    let mut src = MemSource::new(package());
    agent.download_url("http://fw/1.pkg", &mut src).unwrap();
    assert_eq!(src.opens, vec![6000]);
    assert_eq!(agent.state(), SwitchState::SwitchPending);

    let (k, r) = images();
    assert_eq!(std::fs::read(dev.path("kernelB")).unwrap(), k);
    assert_eq!(std::fs::read(dev.path("rootfsB")).unwrap(), r);
    assert_eq!(std::fs::read(dev.path("kernelA")).unwrap(), b"");
}

#[test]
fn new_url_starts_over() {
    let mut dev = Device::new();
    let agent = dev.agent();
    let mut src = MemSource::cut_at(package(), 3000);
    assert!(agent.download_url("http://fw/1.pkg", &mut src).is_err());
    dev.shutdown(agent);

    let agent = dev.agent();
    let mut src = MemSource::new(package());
    agent.download_url("http://fw/2.pkg", &mut src).unwrap();
    assert_eq!(src.opens, vec![0]);
    let p = store(&dev).load().unwrap().unwrap();
    assert_eq!(p.url, "http://fw/2.pkg");
    assert!(p.is_complete());
}

#[test]
fn corrupt_image_never_switches() {
    let dev = Device::new();
    let agent = dev.agent();

    let mut pkg = package();
    pkg[2000] ^= 0x80;
    let r = agent.download_url("http://fw/1.pkg", &mut MemSource::new(pkg));
    assert!(matches!(
        r,
        Err(AgentError::Verify(VerifyError::SignatureInvalid))
    ));
    assert_eq!(agent.state(), SwitchState::Idle);
    assert!(store(&dev).load().unwrap().is_none());
    assert!(agent.restart(Duration::ZERO).is_err());
    agent.with_platform(|p| {
        assert_eq!(p.env.get("root_partition").unwrap().as_deref(), Some("rootfsA"));
        assert_eq!(p.env.get("upgrade_available").unwrap(), None);
    });
}

#[test]
fn oversized_image_rejected() {
    let dev = Device::new();
    dev.ops
        .sizes
        .lock()
        .unwrap()
        .insert(dev.path("rootfsB"), 4096);
    let agent = dev.agent();

    let r = agent.download_url("http://fw/1.pkg", &mut MemSource::new(package()));
    assert!(matches!(
        r,
        Err(AgentError::Write(WriteError::HeaderRejected(
            RejectReason::Resolve(ResolveError::ImageTooLarge { .. })
        )))
    ));
    assert_eq!(agent.state(), SwitchState::Idle);
    assert!(store(&dev).load().unwrap().is_none());
}

#[test]
fn update_confirmed_after_reboot() {
    let mut dev = Device::new();
    dev.settings.set_string(keys::APP_VERSION, "1.0").unwrap();
    let agent = dev.agent();
    agent.with_platform(|p| {
        p.settings.set_string(keys::NEW_VERSION, "2.0").unwrap();
        p.settings.set_string(keys::NEW_CHANGELOG, "new kernel").unwrap();
    });

    agent
        .download_url("http://fw/2.pkg", &mut MemSource::new(package()))
        .unwrap();
    agent.restart(Duration::ZERO).unwrap();
    assert_eq!(agent.state(), SwitchState::Committed);
    dev.shutdown(agent);

    assert_eq!(dev.env.get("bootlimit").unwrap().as_deref(), Some("5"));
    assert_eq!(dev.env.get("boot_partition").unwrap().as_deref(), Some("bootB"));
    // the bootloader counts one boot
    dev.env.set("bootcount", "1").unwrap();

    let agent = dev.agent();
    assert_eq!(agent.state(), SwitchState::Committed);
    assert_eq!(agent.boot_check().unwrap(), BootOutcome::Confirmed);
    assert_eq!(agent.state(), SwitchState::Confirmed);
    dev.shutdown(agent);

    let env = &dev.env;
    assert_eq!(env.get("root_partition").unwrap().as_deref(), Some("rootfsB"));
    assert_eq!(env.get("root_partition_alt").unwrap(), None);
    assert_eq!(env.get("upgrade_available").unwrap().as_deref(), Some("0"));
    let s = &dev.settings;
    assert_eq!(s.get_string("versionB").as_deref(), Some("2.0"));
    assert_eq!(s.get_string(keys::APP_VERSION).as_deref(), Some("2.0"));
    assert_eq!(s.get_string(keys::CHANGELOG).as_deref(), Some("new kernel"));

    // a later boot has nothing to do
    let agent = dev.agent();
    assert_eq!(agent.boot_check().unwrap(), BootOutcome::NoUpdate);
}

#[test]
fn failed_boots_roll_back() {
    let mut dev = Device::new();
    let agent = dev.agent();
    agent
        .download_url("http://fw/2.pkg", &mut MemSource::new(package()))
        .unwrap();
    agent.restart(Duration::ZERO).unwrap();
    dev.shutdown(agent);

    dev.env.set("bootcount", "6").unwrap();
    let agent = dev.agent();
    assert_eq!(agent.boot_check().unwrap(), BootOutcome::RolledBack);
    dev.shutdown(agent);

    let env = &dev.env;
    assert_eq!(env.get("boot_partition").unwrap().as_deref(), Some("bootA"));
    assert_eq!(env.get("root_partition").unwrap().as_deref(), Some("rootfsA"));
    assert_eq!(env.get("bootcount").unwrap().as_deref(), Some("0"));
    assert_eq!(dev.settings.get_string("versionB"), None);
}

#[test]
fn commit_after_agent_restart() {
    let mut dev = Device::new();
    let agent = dev.agent();
    agent
        .download_url("http://fw/2.pkg", &mut MemSource::new(package()))
        .unwrap();
    dev.shutdown(agent);

    // the new process re-verifies the recorded download before switching
    let agent = dev.agent();
    assert_eq!(agent.state(), SwitchState::Idle);
    agent.restart(Duration::ZERO).unwrap();
    assert_eq!(agent.state(), SwitchState::Committed);
    agent.with_platform(|p| {
        assert_eq!(p.env.get("root_partition").unwrap().as_deref(), Some("rootfsB"));
        assert!(p.runner.ran("sync"));
    });
    assert!(store(&dev).load().unwrap().is_none());
}
