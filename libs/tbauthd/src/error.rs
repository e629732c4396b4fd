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

//! # Error
//!
//! The daemon-wide error type. Every fallible operation in this crate
//! returns [`Result`]; which variant is produced determines how callers
//! react (see the per-variant notes).

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// All error conditions the daemon distinguishes.
#[derive(Debug, Error)]
pub enum Error {
    /// A sysfs read or write failed, or an expected attribute was missing.
    ///
    /// Essential attributes (`unique_id` at add time, `authorized` at status
    /// computation) fail the surrounding event; non-essential ones are
    /// demoted to warnings by the caller.
    #[error("udev: could not get '{attr}' for {}: {source}", path.display())]
    Udev {
        path: PathBuf,
        attr: String,
        #[source]
        source: io::Error,
    },

    /// I/O failure against the enrollment store.
    #[error("store: could not {op} '{}': {source}", path.display())]
    Store {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The enrollment store holds a record that does not parse.
    #[error("store: invalid record for '{uid}': {detail}")]
    StoreData { uid: String, detail: String },

    /// The authorization write failed or the challenge did not verify.
    /// Recorded in the device status; never terminates the daemon.
    #[error("authorization failed: {0}")]
    Auth(String),

    /// Caller-facing validation failure (bad uid, bad policy value).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The uid (or other key) is absent from the relevant scope.
    #[error("'{0}' not found")]
    NotFound(String),

    /// A key file exists but does not contain a valid key.
    #[error("key data is invalid")]
    BadKey,

    /// A key file exists but is empty.
    #[error("no key data")]
    NoKey,

    /// Catch-all internal failure.
    #[error("{0}")]
    Failed(String),
}

impl Error {
    pub(crate) fn udev(path: &Path, attr: impl Into<String>, source: io::Error) -> Self {
        Error::Udev { path: path.to_path_buf(), attr: attr.into(), source }
    }

    pub(crate) fn store(op: &'static str, path: &Path, source: io::Error) -> Self {
        Error::Store { op, path: path.to_path_buf(), source }
    }

    /// Whether this error means "the thing does not exist".
    pub fn is_notfound(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
