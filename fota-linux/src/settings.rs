// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * FOTA agent: file-backed settings store
 *
 * Copyright (c) 2025 Code Construct
 */

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use fota::env::{EnvError, Settings};

/// Settings kept as one file per key under a directory.
///
/// File names are the hex encoding of the key, the contents are the raw
/// value.
#[derive(Debug, Clone)]
pub struct FileSettings {
    dir: PathBuf,
}

impl FileSettings {
    /// Use `dir` for storage, creating it if needed
    pub fn open(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self { dir: dir.into() })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.dir.join(hex::encode(key))
    }
}

impl Settings for FileSettings {
    fn get_string(&self, key: &str) -> Option<String> {
        match fs::read(self.key_path(key)) {
            Ok(v) => Some(String::from_utf8_lossy(&v).into_owned()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("Can't read setting {key}: {e}");
                None
            }
        }
    }

    fn set_string(&mut self, key: &str, value: &str) -> Result<(), EnvError> {
        let path = self.key_path(key);
        let tmp = path.with_extension("tmp");
        let mut f = fs::File::create(&tmp)?;
        f.write_all(value.as_bytes())?;
        f.sync_all()?;
        fs::rename(&tmp, &path)?;
        trace!("set {key}={value}");
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), EnvError> {
        match fs::remove_file(self.key_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store() {
        let d = tempfile::tempdir().unwrap();
        let mut s = FileSettings::open(&d.path().join("kv")).unwrap();

        assert_eq!(s.get_string("cop_version"), None);
        s.set_string("cop_version", "2.0.1").unwrap();
        s.set_int("fota_retry_count", 3).unwrap();
        assert_eq!(s.get_string("cop_version").as_deref(), Some("2.0.1"));
        assert_eq!(s.get_int("fota_retry_count"), Some(3));
        assert!(d.path().join("kv").join(hex::encode("cop_version")).exists());

        // values persist across instances
        let mut s = FileSettings::open(&d.path().join("kv")).unwrap();
        assert_eq!(s.get_string("cop_version").as_deref(), Some("2.0.1"));
        s.remove("cop_version").unwrap();
        s.remove("cop_version").unwrap();
        assert_eq!(s.get_string("cop_version"), None);
    }
}
