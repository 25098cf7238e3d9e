// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * FOTA agent: A/B switchover and rollback guard
 *
 * Copyright (c) 2025 Code Construct
 */

//! Switchover state machine.
//!
//! A verified package is committed in phases: external tools first
//! (diff patching, bootloader flashing), then the boot environment slot
//! pointers, and only once both succeed the bootloader rollback guard is
//! armed. On the following boot [`Switchover::boot_check`] either confirms
//! the new slots or reverts them if the boot count ran over its limit.

use std::io;

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use thiserror::Error;

use crate::config::{keys, Config};
use crate::env::{BootEnv, EnvError, Runner, Settings};
use crate::progress::DownloadProgress;
use crate::resolve::{
    active_slot, slot_key, slot_value, ResolveError, RootFs, Slot, IMG_DIFF, IMG_ROOTFS,
    IMG_UBOOT,
};
use crate::target::DeviceOps;

const BOOTLIMIT: &str = "bootlimit";
const BOOTCOUNT: &str = "bootcount";
const UPGRADE_AVAILABLE: &str = "upgrade_available";
const NAND_ROOT_ALT: &str = "nand_root_alt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchState {
    Idle,
    Downloading,
    Verifying,
    SwitchPending,
    Committed,
    Confirmed,
    RolledBack,
}

impl SwitchState {
    fn can_enter(self, to: SwitchState) -> bool {
        use SwitchState::*;
        matches!(
            (self, to),
            (Idle | Confirmed | RolledBack, Downloading)
                | (Idle | Confirmed | RolledBack, Verifying)
                | (Downloading, Verifying)
                | (SwitchPending, Downloading | Verifying)
                | (Verifying, SwitchPending)
                | (SwitchPending, Committed)
                | (Committed, Confirmed | RolledBack)
                | (Downloading | Verifying | SwitchPending, Idle)
                | (Confirmed | RolledBack, Idle)
        )
    }
}

/// Result of the post-boot check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    /// No update was pending
    NoUpdate,
    /// The new slots booted and are now permanent
    Confirmed,
    /// The new slots failed to boot, the previous ones are active again
    RolledBack,
}

#[derive(Error, Debug)]
pub enum SwitchError {
    #[error("Invalid transition from {from:?} to {to:?}")]
    InvalidTransition { from: SwitchState, to: SwitchState },
    #[error("Can't determine the {0} slot")]
    UnknownSlot(String),
    #[error("{tool} failed: {source}")]
    Tool {
        tool: String,
        #[source]
        source: EnvError,
    },
    #[error("Boot environment error: {0}")]
    Env(#[from] EnvError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, SwitchError>;

fn run_tool(runner: &mut dyn Runner, tool: &str, args: &[&str]) -> Result<()> {
    runner.run(tool, args).map_err(|source| SwitchError::Tool {
        tool: tool.into(),
        source,
    })
}

pub struct Switchover {
    state: SwitchState,
    rootfs: RootFs,
    boot_limit: u32,
    // slotted image names, for rollback
    slots: Vec<String>,
}

impl Switchover {
    pub fn new<'a>(
        rootfs: RootFs,
        config: &Config,
        slots: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            state: SwitchState::Idle,
            rootfs,
            boot_limit: config.boot_limit,
            slots: slots.into_iter().map(String::from).collect(),
        }
    }

    /// Create in the state recorded by the boot environment: `Committed`
    /// when a rollback guard is armed, otherwise `Idle`.
    pub fn from_env<'a>(
        rootfs: RootFs,
        config: &Config,
        slots: impl IntoIterator<Item = &'a str>,
        env: &dyn BootEnv,
    ) -> Result<Self> {
        let mut s = Self::new(rootfs, config, slots);
        if Self::guard_armed(env)? {
            s.state = SwitchState::Committed;
        }
        Ok(s)
    }

    fn guard_armed(env: &dyn BootEnv) -> Result<bool> {
        Ok(env
            .get(UPGRADE_AVAILABLE)?
            .is_some_and(|v| !v.contains('0')))
    }

    pub fn state(&self) -> SwitchState {
        self.state
    }

    pub fn transition(&mut self, to: SwitchState) -> Result<()> {
        if !self.state.can_enter(to) {
            return Err(SwitchError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        debug!("switch state {:?} -> {:?}", self.state, to);
        self.state = to;
        Ok(())
    }

    /// Commit a verified package.
    ///
    /// Runs external tools, flips the slot pointers and arms the rollback
    /// guard. Pointer changes are reverted if any of them fail, and the
    /// guard is only armed after everything else succeeded. Follow with
    /// [`reboot`](Self::reboot).
    pub fn commit(
        &mut self,
        progress: &DownloadProgress,
        env: &mut dyn BootEnv,
        runner: &mut dyn Runner,
        ops: &dyn DeviceOps,
    ) -> Result<()> {
        if !self.state.can_enter(SwitchState::Committed) {
            return Err(SwitchError::InvalidTransition {
                from: self.state,
                to: SwitchState::Committed,
            });
        }

        self.run_tools(progress, env, runner)?;

        let changes = self.slot_changes(progress, ops)?;
        let previous = changes
            .iter()
            .map(|(k, _)| Ok((k.clone(), env.get(k)?)))
            .collect::<Result<Vec<_>>>()?;

        let flipped = changes
            .iter()
            .try_for_each(|(k, v)| {
                info!("setting {k}={v}");
                env.set(k, v)
            })
            .map_err(SwitchError::from)
            .and_then(|_| run_tool(runner, "sync", &[]));
        if let Err(e) = flipped {
            error!("Slot switch failed, restoring: {e}");
            Self::restore(env, &previous);
            return Err(e);
        }

        let limit = self.boot_limit.to_string();
        let guard = env.apply(&[
            (BOOTLIMIT, Some(&limit)),
            (BOOTCOUNT, Some("0")),
            (UPGRADE_AVAILABLE, Some("1")),
        ]);
        if let Err(e) = guard {
            error!("Can't arm rollback guard, restoring: {e}");
            Self::restore(env, &previous);
            if let Err(e) = env.set(UPGRADE_AVAILABLE, "0") {
                warn!("Can't disarm guard: {e}");
            }
            return Err(e.into());
        }

        self.state = SwitchState::Committed;
        info!("Switchover committed, boot limit {}", self.boot_limit);
        Ok(())
    }

    /// Reboot into the committed slots.
    pub fn reboot(&self, runner: &mut dyn Runner) -> Result<()> {
        if self.state != SwitchState::Committed {
            return Err(SwitchError::InvalidTransition {
                from: self.state,
                to: SwitchState::Committed,
            });
        }
        run_tool(runner, "reboot", &["-n"])
    }

    fn run_tools(
        &self,
        progress: &DownloadProgress,
        env: &dyn BootEnv,
        runner: &mut dyn Runner,
    ) -> Result<()> {
        // diff patches apply against the running rootfs, before anything
        // else changes
        if let Some(diff) = progress.image(IMG_DIFF) {
            let path = diff.path.to_string_lossy();
            let r = match active_slot(env, IMG_ROOTFS) {
                Ok(Some(_)) => run_tool(runner, "ota-burndiff", &[&path]),
                Ok(None) => Err(SwitchError::UnknownSlot(IMG_ROOTFS.into())),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = r {
                if let Err(e) = std::fs::remove_file(&diff.path) {
                    warn!("Can't remove {}: {e}", diff.path.display());
                }
                return Err(e);
            }
        }

        if let Some(uboot) = progress.image(IMG_UBOOT) {
            let path = uboot.path.to_string_lossy();
            run_tool(runner, "ota-burnuboot", &[&path])?;
        }
        Ok(())
    }

    fn slot_changes(
        &self,
        progress: &DownloadProgress,
        ops: &dyn DeviceOps,
    ) -> Result<Vec<(String, String)>> {
        let mut changes = Vec::new();
        for img in &progress.images {
            let Some(slot) = img.slot else {
                continue;
            };
            let key = slot_key(&img.name);
            changes.push((format!("{key}_alt"), slot_value(&img.name, slot.other())));
            changes.push((key, slot_value(&img.name, slot)));

            if img.name == IMG_ROOTFS && self.rootfs == RootFs::Ubi {
                let vol = slot_value(IMG_ROOTFS, slot.other());
                let idx = ops
                    .ubi_volume_index(&vol)?
                    .ok_or(SwitchError::UnknownSlot(vol))?;
                changes.push((NAND_ROOT_ALT.into(), format!("/dev/ubiblock0_{idx}")));
            }
        }
        Ok(changes)
    }

    fn restore(env: &mut dyn BootEnv, previous: &[(String, Option<String>)]) {
        for (k, v) in previous {
            let r = match v {
                Some(v) => env.set(k, v),
                None => env.unset(k),
            };
            if let Err(e) = r {
                error!("Can't restore {k}: {e}");
            }
        }
    }

    /// Evaluate the rollback guard after boot.
    ///
    /// On confirmation the pending version and changelog are recorded in
    /// `settings` against the active rootfs slot. The guard is cleared in
    /// both outcomes.
    pub fn boot_check(
        &mut self,
        env: &mut dyn BootEnv,
        settings: &mut dyn Settings,
        ops: &dyn DeviceOps,
    ) -> Result<BootOutcome> {
        if !Self::guard_armed(env)? {
            debug!("no update pending");
            return Ok(BootOutcome::NoUpdate);
        }
        self.state = SwitchState::Committed;

        let limit = env.get_int(BOOTLIMIT)?;
        let count = env.get_int(BOOTCOUNT)?;

        let outcome = if count > limit {
            warn!("Boot count {count} exceeds limit {limit}, rolling back");
            for name in &self.slots {
                let key = slot_key(name);
                if let Some(alt) = env.get(&format!("{key}_alt"))? {
                    info!("reverting {key} to {alt}");
                    env.set(&key, alt.trim())?;
                }
            }
            BootOutcome::RolledBack
        } else {
            info!("Update confirmed after {count} boots");
            if self.rootfs == RootFs::Ubi {
                if let Some(root) = env.get(&slot_key(IMG_ROOTFS))? {
                    if let Some(idx) = ops.ubi_volume_index(root.trim())? {
                        env.set(NAND_ROOT_ALT, &format!("/dev/ubiblock0_{idx}"))?;
                    }
                }
            }
            Self::record_version(env, settings)?;
            BootOutcome::Confirmed
        };

        let alt_keys = self
            .slots
            .iter()
            .map(|n| format!("{}_alt", slot_key(n)))
            .collect::<Vec<_>>();
        let mut clear = vec![
            (BOOTLIMIT, Some("0")),
            (BOOTCOUNT, Some("0")),
            (UPGRADE_AVAILABLE, Some("0")),
        ];
        clear.extend(alt_keys.iter().map(|k| (k.as_str(), None)));
        env.apply(&clear)?;

        self.transition(match outcome {
            BootOutcome::RolledBack => SwitchState::RolledBack,
            _ => SwitchState::Confirmed,
        })?;
        Ok(outcome)
    }

    fn record_version(env: &dyn BootEnv, settings: &mut dyn Settings) -> Result<()> {
        let suffix = match active_slot(env, IMG_ROOTFS)? {
            Some(Slot::A) => Slot::A,
            _ => Slot::B,
        };

        if let Some(v) = settings.get_string(keys::NEW_VERSION) {
            settings.set_string(&format!("version{suffix}"), &v)?;
            settings.set_string(keys::APP_VERSION, &v)?;
            info!("Version now {v}");
        }
        if let Some(c) = settings.get_string(keys::NEW_CHANGELOG) {
            settings.set_string(&format!("changelog{suffix}"), &c)?;
            settings.set_string(keys::CHANGELOG, &c)?;
        }
        Ok(())
    }
}
