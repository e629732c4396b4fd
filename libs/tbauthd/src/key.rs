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

//! # Key Material
//!
//! Pre-shared keys for secure-level (challenge-response) authorization.
//! A key is 32 random bytes, stored and written to sysfs as 64 lowercase
//! hex characters.

use std::fs;
use std::io;
use std::path::Path;

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{Error, Result};
use crate::fsio;

/// Raw key length in bytes.
pub const KEY_BYTES: usize = 32;
/// Length of the hex encoding.
pub const KEY_CHARS: usize = 64;

/// A device challenge-response key.
#[derive(Clone, PartialEq, Eq)]
pub struct Key([u8; KEY_BYTES]);

impl Key {
    /// Generate a fresh key from the OS random number generator.
    pub fn generate() -> Key {
        let mut bytes = [0u8; KEY_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Key(bytes)
    }

    /// Parse a key from its hex encoding.
    ///
    /// Empty input yields [`Error::NoKey`]; input of the wrong length or
    /// with non-hex characters yields [`Error::BadKey`].
    pub fn from_hex(s: &str) -> Result<Key> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::NoKey);
        }
        if s.len() != KEY_CHARS {
            return Err(Error::BadKey);
        }
        let mut bytes = [0u8; KEY_BYTES];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| Error::BadKey)?;
        Ok(Key(bytes))
    }

    /// The 64 character lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Load a key from a file previously written with [`Key::save`].
    pub fn load(path: &Path) -> Result<Key> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(path.display().to_string()))
            }
            Err(e) => return Err(Error::store("read key", path, e)),
        };
        Key::from_hex(&content)
    }

    /// Write the key to `path` with mode 0600, fsynced before rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        fsio::write_atomic(path, self.to_hex().as_bytes(), Some(0o600))
            .map_err(|e| Error::store("write key", path, e))
    }
}

// Keep key bytes out of debug output.
impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Key(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_roundtrips_through_hex() {
        let key = Key::generate();
        let hex = key.to_hex();
        assert_eq!(hex.len(), KEY_CHARS);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        let parsed = Key::from_hex(&hex).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn from_hex_rejects_bad_input() {
        assert!(matches!(Key::from_hex(""), Err(Error::NoKey)));
        assert!(matches!(Key::from_hex("\n"), Err(Error::NoKey)));
        assert!(matches!(Key::from_hex("abcd"), Err(Error::BadKey)));
        let bad = "zz".repeat(KEY_BYTES);
        assert!(matches!(Key::from_hex(&bad), Err(Error::BadKey)));
    }
}
