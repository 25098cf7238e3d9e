// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * FOTA agent: platform collaborators
 *
 * Copyright (c) 2025 Code Construct
 */

//! Interfaces to the boot environment, external tools and the settings
//! store.
//!
//! The core never shells out directly. Platform crates provide
//! implementations of these traits, and the in-memory versions here are
//! used for testing and dry runs.

use std::collections::{BTreeMap, HashSet};

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnvError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{tool} failed: {status}")]
    Tool { tool: String, status: String },
    #[error("Bad value for {key}: {value:?}")]
    BadValue { key: String, value: String },
}

impl EnvError {
    pub fn new_tool(tool: &str, status: impl ToString) -> Self {
        Self::Tool {
            tool: tool.into(),
            status: status.to_string(),
        }
    }
}

type Result<T> = std::result::Result<T, EnvError>;

/// Bootloader environment variables
pub trait BootEnv {
    /// Read a variable, `None` when unset or empty.
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&mut self, key: &str, value: &str) -> Result<()>;

    fn unset(&mut self, key: &str) -> Result<()>;

    /// Apply a batch of changes, `None` values unset the key.
    ///
    /// Backends that can apply a script in one write should override this.
    fn apply(&mut self, changes: &[(&str, Option<&str>)]) -> Result<()> {
        for (k, v) in changes {
            match v {
                Some(v) => self.set(k, v)?,
                None => self.unset(k)?,
            }
        }
        Ok(())
    }

    /// Read an integer variable, unset values read as 0.
    fn get_int(&self, key: &str) -> Result<u32> {
        match self.get(key)? {
            None => Ok(0),
            Some(v) => v.trim().parse().map_err(|_| EnvError::BadValue {
                key: key.into(),
                value: v,
            }),
        }
    }
}

/// Runs external tools: patch application, bootloader flashing, reboot.
pub trait Runner {
    fn run(&mut self, tool: &str, args: &[&str]) -> Result<()>;
}

/// Persistent key-value settings
pub trait Settings {
    fn get_string(&self, key: &str) -> Option<String>;

    fn set_string(&mut self, key: &str, value: &str) -> Result<()>;

    fn remove(&mut self, key: &str) -> Result<()>;

    fn get_int(&self, key: &str) -> Option<i64> {
        self.get_string(key).and_then(|v| v.trim().parse().ok())
    }

    fn set_int(&mut self, key: &str, value: i64) -> Result<()> {
        self.set_string(key, &value.to_string())
    }
}

/// In-memory boot environment
#[derive(Debug, Default, Clone)]
pub struct MemBootEnv {
    pub vars: BTreeMap<String, String>,
    /// Keys that fail on `set`, for exercising error paths
    pub fail_set: HashSet<String>,
}

impl MemBootEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(vars: &[(&str, &str)]) -> Self {
        Self {
            vars: vars
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }
}

impl BootEnv for MemBootEnv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.vars.get(key).filter(|v| !v.is_empty()).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        if self.fail_set.contains(key) {
            return Err(EnvError::new_tool("fw_setenv", format!("can't set {key}")));
        }
        self.vars.insert(key.into(), value.into());
        Ok(())
    }

    fn unset(&mut self, key: &str) -> Result<()> {
        self.vars.remove(key);
        Ok(())
    }
}

/// Records tool invocations instead of running them
#[derive(Debug, Default, Clone)]
pub struct RecordingRunner {
    pub calls: Vec<Vec<String>>,
    /// Tools that report failure
    pub fail: HashSet<String>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `tool` was run
    pub fn ran(&self, tool: &str) -> bool {
        self.calls.iter().any(|c| c.first().map(String::as_str) == Some(tool))
    }
}

impl Runner for RecordingRunner {
    fn run(&mut self, tool: &str, args: &[&str]) -> Result<()> {
        let mut call = vec![tool.to_string()];
        call.extend(args.iter().map(|a| a.to_string()));
        info!("run: {}", call.join(" "));
        self.calls.push(call);
        if self.fail.contains(tool) {
            return Err(EnvError::new_tool(tool, "exit status 1"));
        }
        Ok(())
    }
}

/// In-memory settings store
#[derive(Debug, Default, Clone)]
pub struct MemSettings {
    pub values: BTreeMap<String, String>,
}

impl MemSettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Settings for MemSettings {
    fn get_string(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set_string(&mut self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.into(), value.into());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.values.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_env_batch() {
        let mut env = MemBootEnv::with(&[("bootcount", "3"), ("x", "1")]);
        env.apply(&[("bootlimit", Some("5")), ("x", None)]).unwrap();
        assert_eq!(env.get("bootlimit").unwrap().as_deref(), Some("5"));
        assert_eq!(env.get("x").unwrap(), None);
        assert_eq!(env.get_int("bootcount").unwrap(), 3);
        assert_eq!(env.get_int("missing").unwrap(), 0);

        env.set("bootcount", "lots").unwrap();
        assert!(matches!(
            env.get_int("bootcount"),
            Err(EnvError::BadValue { .. })
        ));
    }

    #[test]
    fn settings_int() {
        let mut s = MemSettings::new();
        assert_eq!(s.get_int("fota_offset"), None);
        s.set_int("fota_offset", 4096).unwrap();
        assert_eq!(s.get_int("fota_offset"), Some(4096));
        assert_eq!(s.get_string("fota_offset").as_deref(), Some("4096"));
    }

    #[test]
    fn runner_records() {
        let mut r = RecordingRunner::new();
        r.fail.insert("ota-burndiff".into());
        r.run("sync", &[]).unwrap();
        assert!(r.run("ota-burndiff", &["/diff"]).is_err());
        assert!(r.ran("sync"));
        assert_eq!(r.calls[1], vec!["ota-burndiff", "/diff"]);
    }
}
