// Copyright (C) 2025 The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Enrollment Store
//!
//! A filesystem-backed map from device uid to a persisted record plus an
//! optional challenge-response key:
//!
//! ```text
//! <root>/version              # store format version
//! <root>/devices/<uid>/device # text record, stable key=value lines
//! <root>/devices/<uid>/key    # 64 hex chars, mode 0600
//! ```
//!
//! Writes are atomic (sibling temp file, fsync, rename); the store
//! assumes a single writer but tolerates partial state on restart.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;

use crate::device::{Policy, Security};
use crate::error::{Error, Result};
use crate::fsio;
use crate::key::Key;

/// Current on-disk format version.
pub const STORE_VERSION: u32 = 1;

/// The persisted fields of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub uid: String,
    pub name: String,
    pub vendor: String,
    pub policy: Policy,
    pub ctime: u64,
    pub security: Security,
    pub generation: u32,
}

/// The on-disk enrollment database.
pub struct Store {
    root: PathBuf,
    devices: PathBuf,
}

impl Store {
    /// Open (or initialize) a store rooted at `root`.
    ///
    /// A brand-new store is stamped with the current format version. An
    /// existing store without a version file reports version 0 and wants
    /// [`Store::upgrade`].
    pub fn new(root: impl Into<PathBuf>) -> Result<Store> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| Error::store("create", &root, e))?;

        let store = Store { devices: root.join("devices"), root };

        if !store.version_path().exists() && store.is_empty() {
            store.write_version(STORE_VERSION)?;
        }
        fs::create_dir_all(&store.devices)
            .map_err(|e| Error::store("create", &store.devices, e))?;

        debug!("store at '{}' (version {})", store.root.display(), store.version());
        Ok(store)
    }

    /// The store root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn version_path(&self) -> PathBuf {
        self.root.join("version")
    }

    fn device_dir(&self, uid: &str) -> PathBuf {
        self.devices.join(uid)
    }

    fn is_empty(&self) -> bool {
        match fs::read_dir(&self.devices) {
            Ok(mut rd) => rd.next().is_none(),
            Err(_) => true,
        }
    }

    fn write_version(&self, version: u32) -> Result<()> {
        let path = self.version_path();
        fsio::write_atomic(&path, format!("{}\n", version).as_bytes(), None)
            .map_err(|e| Error::store("write version of", &path, e))
    }

    /// The on-disk format version; 0 for a pre-versioning store.
    pub fn version(&self) -> u32 {
        fs::read_to_string(self.version_path())
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Bring an old store up to the current format version.
    ///
    /// Returns whether anything was changed.
    pub fn upgrade(&self) -> Result<bool> {
        if self.version() >= STORE_VERSION {
            return Ok(false);
        }
        // version 0 → 1 only adds the version stamp itself
        self.write_version(STORE_VERSION)?;
        Ok(true)
    }

    /// All enrolled uids, in arbitrary order.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut uids = Vec::new();
        let entries = match fs::read_dir(&self.devices) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(uids),
            Err(e) => return Err(Error::store("list", &self.devices, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| Error::store("list", &self.devices, e))?;
            if entry.path().is_dir() {
                if let Ok(name) = entry.file_name().into_string() {
                    uids.push(name);
                }
            }
        }
        Ok(uids)
    }

    /// Whether a record exists for `uid`.
    pub fn contains(&self, uid: &str) -> bool {
        self.device_dir(uid).join("device").exists()
    }

    /// Load the record for `uid`.
    pub fn get(&self, uid: &str) -> Result<Record> {
        let path = self.device_dir(uid).join("device");
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(uid.to_string()))
            }
            Err(e) => return Err(Error::store("read", &path, e)),
        };

        let mut fields: HashMap<&str, &str> = HashMap::new();
        for line in content.lines() {
            if let Some((k, v)) = line.split_once('=') {
                fields.insert(k, v);
            }
        }

        let data_err = |detail: String| Error::StoreData { uid: uid.to_string(), detail };

        let name = fields
            .get("name")
            .ok_or_else(|| data_err("missing 'name'".to_string()))?
            .to_string();
        let vendor = fields
            .get("vendor")
            .ok_or_else(|| data_err("missing 'vendor'".to_string()))?
            .to_string();
        let policy = fields
            .get("policy")
            .ok_or_else(|| data_err("missing 'policy'".to_string()))?
            .parse::<Policy>()
            .map_err(|e| data_err(e.to_string()))?;
        let ctime = match fields.get("ctime") {
            Some(v) => v.parse::<u64>().map_err(|_| data_err(format!("bad ctime '{}'", v)))?,
            None => 0,
        };
        // be lenient about levels written by a newer daemon
        let security = fields
            .get("security")
            .and_then(|v| v.parse::<Security>().ok())
            .unwrap_or(Security::Unknown);
        let generation =
            fields.get("generation").and_then(|v| v.parse::<u32>().ok()).unwrap_or(0);

        Ok(Record { uid: uid.to_string(), name, vendor, policy, ctime, security, generation })
    }

    /// Persist a record, atomically.
    ///
    /// An existing record's first-seen time is kept when the incoming one
    /// has none, and [`Policy::Default`] never overwrites a concrete
    /// stored policy.
    pub fn put(&self, rec: &Record) -> Result<()> {
        let dir = self.device_dir(&rec.uid);
        fs::create_dir_all(&dir).map_err(|e| Error::store("create", &dir, e))?;

        let mut rec = rec.clone();
        if let Ok(old) = self.get(&rec.uid) {
            if rec.ctime == 0 {
                rec.ctime = old.ctime;
            }
            if rec.policy == Policy::Default {
                rec.policy = old.policy;
            }
        }

        let text = format!(
            "name={}\nvendor={}\npolicy={}\nctime={}\nsecurity={}\ngeneration={}\n",
            rec.name, rec.vendor, rec.policy, rec.ctime, rec.security, rec.generation
        );
        let path = dir.join("device");
        fsio::write_atomic(&path, text.as_bytes(), None)
            .map_err(|e| Error::store("write", &path, e))
    }

    /// Remove the record and key for `uid`. Removing a missing uid is
    /// not an error.
    pub fn delete(&self, uid: &str) -> Result<()> {
        let dir = self.device_dir(uid);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::store("delete", &dir, e)),
        }
    }

    /// Whether a key is on file for `uid`.
    pub fn has_key(&self, uid: &str) -> bool {
        self.device_dir(uid).join("key").exists()
    }

    /// Load the key for `uid`.
    pub fn load_key(&self, uid: &str) -> Result<Key> {
        let path = self.device_dir(uid).join("key");
        match Key::load(&path) {
            Err(Error::NotFound(_)) => Err(Error::NotFound(uid.to_string())),
            other => other,
        }
    }

    /// Persist the key for `uid` (mode 0600, atomic).
    pub fn put_key(&self, uid: &str, key: &Key) -> Result<()> {
        let dir = self.device_dir(uid);
        fs::create_dir_all(&dir).map_err(|e| Error::store("create", &dir, e))?;
        key.save(&dir.join("key"))
    }

    /// Remove the key for `uid`. Removing a missing key is not an error.
    pub fn delete_key(&self, uid: &str) -> Result<()> {
        let path = self.device_dir(uid).join("key");
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::store("delete", &path, e)),
        }
    }
}
