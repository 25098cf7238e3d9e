// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * FOTA agent: client notifications
 *
 * Copyright (c) 2025 Code Construct
 */

use std::sync::mpsc::Sender;

#[allow(unused)]
use log::{debug, error, info, trace, warn};

/// Transfer statistics for a download in progress
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    /// Package size
    pub total: u64,
    /// Bytes received, including any resumed prefix
    pub current: u64,
    pub percent: u8,
    /// Transfer rate since this attempt started
    pub bps: f32,
    pub duration: chrono::Duration,
    pub remaining: chrono::Duration,
}

impl TransferProgress {
    pub fn speed_kbps(&self) -> u32 {
        (self.bps / 1024.0) as u32
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A version check found an update
    Version {
        current: Option<String>,
        new: String,
        changelog: String,
        local_changelog: Option<String>,
    },
    Progress(TransferProgress),
    /// Download complete and verified
    Finished,
    /// Switchover committed, about to reboot
    Restart,
    Error { code: i32, msg: String },
}

/// Delivers events to an optional subscriber
#[derive(Debug, Default)]
pub struct Notifier {
    tx: Option<Sender<Event>>,
}

impl Notifier {
    pub fn new(tx: Sender<Event>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn emit(&mut self, ev: Event) {
        trace!("event {ev:?}");
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(ev).is_err() {
            debug!("event receiver gone");
            self.tx = None;
        }
    }
}

/// Computes transfer rates against a starting point
pub struct ProgressMeter {
    start: chrono::DateTime<chrono::Utc>,
    base: u64,
    total: u64,
}

impl ProgressMeter {
    /// Start measuring at `base` bytes of a `total` byte transfer
    pub fn new(base: u64, total: u64) -> Self {
        Self {
            start: chrono::Utc::now(),
            base,
            total,
        }
    }

    pub fn set_total(&mut self, total: u64) {
        self.total = total;
    }

    pub fn report(&self, current: u64) -> TransferProgress {
        let elapsed = chrono::Utc::now() - self.start;
        self.report_at(current, elapsed)
    }

    fn report_at(&self, current: u64, elapsed: chrono::Duration) -> TransferProgress {
        let done = current.saturating_sub(self.base);
        let us = elapsed.num_microseconds().unwrap_or(i64::MAX).max(1);
        let bps = done as f32 * 1_000_000.0 / us as f32;

        let left = self.total.saturating_sub(current);
        let remaining = if done > 0 {
            let us_left = (us as f64 * left as f64 / done as f64) as i64;
            chrono::Duration::microseconds(us_left)
        } else {
            chrono::Duration::zero()
        };

        let percent = if self.total == 0 {
            0
        } else {
            (current.min(self.total) * 100 / self.total) as u8
        };

        TransferProgress {
            total: self.total,
            current,
            percent,
            bps,
            duration: elapsed,
            remaining,
        }
    }
}
