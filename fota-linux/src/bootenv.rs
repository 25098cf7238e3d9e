// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * FOTA agent: U-Boot environment and external tools
 *
 * Copyright (c) 2025 Code Construct
 */

use std::io::Write;
use std::process::{Command, Stdio};

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use fota::env::{BootEnv, EnvError, Runner};

type Result<T> = std::result::Result<T, EnvError>;

/// U-Boot environment through the `fw_printenv`/`fw_setenv` tools
#[derive(Debug, Clone)]
pub struct FwEnv {
    printenv: String,
    setenv: String,
}

impl Default for FwEnv {
    fn default() -> Self {
        Self::new("fw_printenv", "fw_setenv")
    }
}

impl FwEnv {
    /// Use the given tool commands, for alternative config files or
    /// wrappers
    pub fn new(printenv: &str, setenv: &str) -> Self {
        Self {
            printenv: printenv.into(),
            setenv: setenv.into(),
        }
    }

    fn setenv(&self, args: &[&str]) -> Result<()> {
        debug!("{} {}", self.setenv, args.join(" "));
        let status = Command::new(&self.setenv).args(args).status()?;
        if !status.success() {
            return Err(EnvError::new_tool(&self.setenv, status));
        }
        Ok(())
    }
}

/// One line of a `fw_setenv -s` script, a bare key deletes it
fn script_line(key: &str, value: Option<&str>) -> String {
    match value {
        Some(v) => format!("{key} {v}\n"),
        None => format!("{key}\n"),
    }
}

/// fw_printenv's diagnostic for a variable that isn't set
const NOT_DEFINED: &str = "not defined";

impl BootEnv for FwEnv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let out = Command::new(&self.printenv).arg("-n").arg(key).output()?;
        if !out.status.success() {
            let err = String::from_utf8_lossy(&out.stderr);
            if err.contains(NOT_DEFINED) {
                trace!("{key} not set");
                return Ok(None);
            }
            warn!("{} {key}: {}", self.printenv, err.trim());
            return Err(EnvError::new_tool(
                &self.printenv,
                format!("{}: {}", out.status, err.trim()),
            ));
        }
        let v = String::from_utf8_lossy(&out.stdout).trim().to_string();
        Ok((!v.is_empty()).then_some(v))
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.setenv(&[key, value])
    }

    fn unset(&mut self, key: &str) -> Result<()> {
        self.setenv(&[key])
    }

    fn apply(&mut self, changes: &[(&str, Option<&str>)]) -> Result<()> {
        let script = changes
            .iter()
            .map(|(k, v)| script_line(k, *v))
            .collect::<String>();
        debug!("{} -s -:\n{script}", self.setenv);

        let mut child = Command::new(&self.setenv)
            .args(["-s", "-"])
            .stdin(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes())?;
        }
        let status = child.wait()?;
        if !status.success() {
            return Err(EnvError::new_tool(&self.setenv, status));
        }
        Ok(())
    }
}

/// Runs external tools as child processes
#[derive(Debug, Default, Clone)]
pub struct CommandRunner;

impl Runner for CommandRunner {
    fn run(&mut self, tool: &str, args: &[&str]) -> Result<()> {
        info!("running {tool} {}", args.join(" "));
        let status = Command::new(tool).args(args).status()?;
        if !status.success() {
            warn!("{tool} failed: {status}");
            return Err(EnvError::new_tool(tool, status));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    #[test]
    fn script() {
        assert_eq!(script_line("bootcount", Some("0")), "bootcount 0\n");
        assert_eq!(script_line("root_partition_alt", None), "root_partition_alt\n");
    }

    #[test]
    fn runner_status() {
        crate::start_log();
        let mut r = CommandRunner;
        r.run("true", &[]).unwrap();
        assert!(matches!(
            r.run("false", &[]),
            Err(EnvError::Tool { .. })
        ));
        assert!(matches!(
            r.run("/nonexistent/tool", &[]),
            Err(EnvError::Io(_))
        ));
    }

    #[test]
    fn printenv_missing_tool() {
        let env = FwEnv::new("/nonexistent/fw_printenv", "/nonexistent/fw_setenv");
        assert!(matches!(env.get("bootcount"), Err(EnvError::Io(_))));
    }

    // Executable stand-in for fw_printenv
    fn stub_tool(dir: &Path, name: &str, script: &str) -> String {
        let p = dir.join(name);
        fs::write(&p, format!("#!/bin/sh\n{script}\n")).unwrap();
        fs::set_permissions(&p, fs::Permissions::from_mode(0o755)).unwrap();
        p.to_str().unwrap().to_string()
    }

    #[test]
    fn printenv_output() {
        // `echo -n value` stands in for fw_printenv -n key
        let env = FwEnv::new("echo", "true");
        assert_eq!(env.get("rootfsB").unwrap().as_deref(), Some("rootfsB"));

        let d = tempfile::tempdir().unwrap();
        let undefined = stub_tool(
            d.path(),
            "undefined",
            r###"echo "## Error: \"$2\" not defined" >&2; exit 1"###,
        );
        let mut env = FwEnv::new(&undefined, "cat");
        assert_eq!(env.get("bootcount").unwrap(), None);
        env.apply(&[("bootcount", Some("0")), ("x", None)]).unwrap();
    }

    #[test]
    fn printenv_failure() {
        crate::start_log();
        let d = tempfile::tempdir().unwrap();
        let broken = stub_tool(
            d.path(),
            "broken",
            "echo \"Cannot parse config file '/etc/fw_env.config': No such file or directory\" >&2; exit 1",
        );
        let env = FwEnv::new(&broken, "cat");
        match env.get("boot_partition") {
            Err(EnvError::Tool { tool, status }) => {
                assert_eq!(tool, broken);
                assert!(status.contains("fw_env.config"), "{status}");
            }
            r => panic!("unexpected {r:?}"),
        }

        // no diagnostic at all is a failure too
        let env = FwEnv::new("false", "cat");
        assert!(matches!(env.get("bootcount"), Err(EnvError::Tool { .. })));
    }
}
