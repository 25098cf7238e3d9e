// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * FOTA agent: firmware-over-the-air update core
 *
 * Copyright (c) 2025 Code Construct
 */

//! Firmware-over-the-air update agent.
//!
//! A package is a 1024-byte header followed by up to eight images. The
//! [`DemuxWriter`] splits a package stream into the inactive A/B slot of
//! each image, recording progress so a download can resume. A complete
//! package is checked with [`verify`], then [`Switchover`] flips the boot
//! environment to the new slots behind a boot-count rollback guard.
//!
//! Platform access goes through the traits in [`env`] and
//! [`target::DeviceOps`]; the `fota-linux` crate provides Linux
//! implementations.

#![forbid(unsafe_code)]

pub mod agent;
pub mod config;
pub mod env;
pub mod event;
pub mod pkg;
pub mod progress;
pub mod resolve;
pub mod switch;
pub mod target;
pub mod verify;
pub mod writer;

#[cfg(test)]
mod testutil;

pub use agent::{Agent, AgentError, FileSource, PackageSource, Platform, VersionInfo, VersionSource};
pub use config::{Config, Timeouts, UbiResume};
pub use env::{BootEnv, Runner, Settings};
pub use event::{Event, TransferProgress};
pub use pkg::{FormatError, ImageDescriptor, PackageHeader};
pub use progress::{DownloadProgress, ProgressStore};
pub use resolve::{PartitionTable, Resolver, RootFs, Slot};
pub use switch::{BootOutcome, SwitchState, Switchover};
pub use target::{DeviceOps, SharedOps, TargetKind};
pub use verify::{verify, VerifyError, VerifyKey};
pub use writer::DemuxWriter;
