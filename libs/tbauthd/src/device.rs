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

//! # Device
//!
//! Per-device object mediating between sysfs and store state: identity,
//! status tracking across connect/disconnect/authorize transitions, and
//! the authorization protocol driver.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use log::warn;

use crate::bus;
use crate::error::{Error, Result};
use crate::key::Key;
use crate::store::{Record, Store};
use crate::sysfs::{LinkSpeed, Sysfs};

/// Authorization state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Not connected; only known from the store.
    Disconnected,
    /// Reappeared on the bus, status not yet computed.
    Connecting,
    /// Connected but not authorized.
    Connected,
    /// An authorization attempt failed. Terminal for this connection
    /// episode; cleared by disconnect/reconnect or explicit user action.
    AuthError,
    /// An authorization attempt is in flight.
    Authorizing,
    /// Authorized.
    Authorized,
    /// Authorized via key challenge.
    AuthorizedSecure,
    /// Authorized for display output only.
    AuthorizedDponly,
}

impl Status {
    /// Whether the device is authorized at any level.
    pub fn is_authorized(self) -> bool {
        matches!(self, Status::Authorized | Status::AuthorizedSecure | Status::AuthorizedDponly)
    }

    /// Whether the device is present on the bus.
    pub fn is_connected(self) -> bool {
        self != Status::Disconnected
    }
}

/// Per-device authorization preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Treated as [`Policy::Manual`] unless overridden.
    Default,
    /// Never authorize without user action.
    Manual,
    /// Authorize automatically on reconnect.
    Auto,
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Policy::Default => "default",
            Policy::Manual => "manual",
            Policy::Auto => "auto",
        };
        f.write_str(s)
    }
}

impl FromStr for Policy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Policy> {
        match s {
            "default" => Ok(Policy::Default),
            "manual" => Ok(Policy::Manual),
            "auto" => Ok(Policy::Auto),
            _ => Err(Error::InvalidArgument(format!("invalid policy '{}'", s))),
        }
    }
}

/// Security level of a Thunderbolt domain, copied onto each device at the
/// time of connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    /// Every device is authorized by the firmware.
    None,
    /// Authorization requires user consent.
    User,
    /// Like `User`, plus challenge-response key verification.
    Secure,
    /// Only display output is tunneled.
    DpOnly,
    /// Only USB is tunneled.
    UsbOnly,
    /// Unrecognized level.
    Unknown,
}

impl fmt::Display for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Security::None => "none",
            Security::User => "user",
            Security::Secure => "secure",
            Security::DpOnly => "dponly",
            Security::UsbOnly => "usbonly",
            Security::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl FromStr for Security {
    type Err = Error;

    fn from_str(s: &str) -> Result<Security> {
        match s {
            "none" => Ok(Security::None),
            "user" => Ok(Security::User),
            "secure" => Ok(Security::Secure),
            "dponly" => Ok(Security::DpOnly),
            "usbonly" => Ok(Security::UsbOnly),
            "unknown" => Ok(Security::Unknown),
            _ => Err(Error::InvalidArgument(format!("invalid security level '{}'", s))),
        }
    }
}

/// Whether a challenge-response key exists for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    /// No key.
    Missing,
    /// A key was generated this episode but is not in the store.
    New,
    /// A key is present in the store.
    Stored,
}

/// A Thunderbolt device (host controller or peripheral).
#[derive(Debug, Clone)]
pub struct Device {
    uid: String,
    name: String,
    vendor: String,
    status: Status,
    policy: Policy,
    stored: bool,
    keystate: KeyState,
    syspath: Option<PathBuf>,
    parent_uid: Option<String>,
    security: Security,
    ctime: u64,
    generation: u32,
    link_speed: LinkSpeed,
    boot: bool,
    iommu: bool,
    host: bool,
}

impl Device {
    /// Construct a device from a live kernel node.
    ///
    /// `unique_id` and `authorized` are essential; identity, security and
    /// the informational attributes degrade to defaults with a warning.
    pub fn new_from_udev(sysfs: &Sysfs, node: &Path) -> Result<Device> {
        let uid = sysfs.read_attr(node, "unique_id")?;

        let host = node.parent().map(|p| sysfs.is_domain(p)).unwrap_or(false);
        let ident = if host { sysfs.host_identify(node) } else { sysfs.identify(node) };
        let (name, vendor) = match ident {
            Ok(id) => (id.name, id.vendor),
            Err(e) => {
                warn!("[{}] could not identify device: {}", uid, e);
                ("unknown".to_string(), "unknown".to_string())
            }
        };

        let security = sysfs.security_of(node).unwrap_or_else(|e| {
            warn!("[{}] could not read security level: {}", uid, e);
            Security::Unknown
        });

        let parent_uid =
            node.parent().and_then(|p| sysfs.read_attr_opt(p, "unique_id").ok().flatten());

        let iommu = sysfs.read_iommu(node).unwrap_or_else(|e| {
            warn!("[{}] could not read iommu: {}", uid, e);
            false
        });

        let status = compute_status(sysfs, node, security)?;

        Ok(Device {
            uid,
            name,
            vendor,
            status,
            policy: Policy::Default,
            stored: false,
            keystate: KeyState::Missing,
            syspath: Some(node.to_path_buf()),
            parent_uid,
            security,
            ctime: sysfs.node_ctime(node),
            generation: sysfs.read_generation(node),
            link_speed: sysfs.read_link_speed(node),
            boot: sysfs.read_boot(node),
            iommu,
            host,
        })
    }

    /// Reconstruct a disconnected device from its store record.
    pub fn from_record(rec: &Record, have_key: bool) -> Device {
        Device {
            uid: rec.uid.clone(),
            name: rec.name.clone(),
            vendor: rec.vendor.clone(),
            status: Status::Disconnected,
            policy: rec.policy,
            stored: true,
            keystate: if have_key { KeyState::Stored } else { KeyState::Missing },
            syspath: None,
            parent_uid: None,
            security: rec.security,
            ctime: rec.ctime,
            generation: rec.generation,
            link_speed: LinkSpeed::default(),
            boot: false,
            iommu: false,
            host: false,
        }
    }

    /// The persistable projection of this device.
    pub fn to_record(&self) -> Record {
        Record {
            uid: self.uid.clone(),
            name: self.name.clone(),
            vendor: self.vendor.clone(),
            policy: self.policy,
            ctime: self.ctime,
            security: self.security,
            generation: self.generation,
        }
    }

    /// A previously disconnected device reappeared: bind the syspath and
    /// recompute the status.
    ///
    /// The security level is re-captured here; it never changes across a
    /// single connection.
    pub fn connected(&mut self, sysfs: &Sysfs, node: &Path) -> Result<Status> {
        self.status = Status::Connecting;
        self.syspath = Some(node.to_path_buf());

        self.security = sysfs.security_of(node).unwrap_or_else(|e| {
            warn!("[{}] could not read security level: {}", self.uid, e);
            Security::Unknown
        });
        self.parent_uid =
            node.parent().and_then(|p| sysfs.read_attr_opt(p, "unique_id").ok().flatten());
        self.host = node.parent().map(|p| sysfs.is_domain(p)).unwrap_or(false);
        self.generation = sysfs.read_generation(node);
        self.link_speed = sysfs.read_link_speed(node);
        self.boot = sysfs.read_boot(node);
        if self.ctime == 0 {
            self.ctime = sysfs.node_ctime(node);
        }

        let status = compute_status(sysfs, node, self.security)?;
        self.status = status;
        Ok(status)
    }

    /// The device was unplugged. Transient state is cleared; everything
    /// persisted survives.
    pub fn disconnected(&mut self) {
        self.syspath = None;
        self.parent_uid = None;
        self.status = Status::Disconnected;
        self.link_speed = LinkSpeed::default();
        if self.keystate == KeyState::New {
            // an unpersisted key dies with the connection
            self.keystate = KeyState::Missing;
        }
    }

    /// Re-read the mutable sysfs attributes and return the new status.
    pub fn update_from_udev(&mut self, sysfs: &Sysfs, node: &Path) -> Result<Status> {
        self.link_speed = sysfs.read_link_speed(node);
        self.boot = sysfs.read_boot(node);
        let status = compute_status(sysfs, node, self.security)?;
        self.status = status;
        Ok(status)
    }

    /// Run the authorization protocol against sysfs.
    ///
    /// The security level is captured at the moment of the call. On
    /// success the status reflects the authorization level reached; on
    /// failure it is [`Status::AuthError`] and the error is returned.
    pub(crate) fn authorize(&mut self, sysfs: &Sysfs, store: &Store) -> Result<Status> {
        let node = match &self.syspath {
            Some(n) => n.clone(),
            None => return Err(Error::Auth(format!("[{}] not connected", self.uid))),
        };
        let security = self.security;
        self.status = Status::Authorizing;

        match self.run_protocol(sysfs, store, &node, security) {
            Ok(status) => {
                self.status = status;
                Ok(status)
            }
            Err(e) => {
                self.status = Status::AuthError;
                Err(e)
            }
        }
    }

    fn run_protocol(
        &mut self,
        sysfs: &Sysfs,
        store: &Store,
        node: &Path,
        security: Security,
    ) -> Result<Status> {
        match security {
            Security::Secure => {
                if self.stored && store.has_key(&self.uid) {
                    // challenge-verify against the stored key
                    let key = store.load_key(&self.uid)?;
                    sysfs
                        .write_key(node, &key.to_hex())
                        .map_err(|e| Error::Auth(format!("could not write key: {}", e)))?;
                    write_authorize_retry(sysfs, node, 2)?;
                    self.keystate = KeyState::Stored;
                    Ok(Status::AuthorizedSecure)
                } else {
                    // first-time enrollment: provision a fresh key and
                    // verify the device echoes it back
                    let key = Key::generate();
                    sysfs
                        .write_key(node, &key.to_hex())
                        .map_err(|e| Error::Auth(format!("could not write key: {}", e)))?;
                    write_authorize_retry(sysfs, node, 1)?;
                    let echoed = sysfs.read_key(node)?;
                    if echoed != key.to_hex() {
                        return Err(Error::Auth(format!(
                            "[{}] device did not accept the new key",
                            self.uid
                        )));
                    }
                    if self.stored {
                        store.put_key(&self.uid, &key)?;
                        self.keystate = KeyState::Stored;
                    } else {
                        self.keystate = KeyState::New;
                    }
                    Ok(Status::AuthorizedSecure)
                }
            }
            Security::DpOnly => {
                write_authorize_retry(sysfs, node, 1)?;
                Ok(Status::AuthorizedDponly)
            }
            _ => {
                write_authorize_retry(sysfs, node, 1)?;
                Ok(Status::Authorized)
            }
        }
    }

    /* getters */

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn stored(&self) -> bool {
        self.stored
    }

    pub fn keystate(&self) -> KeyState {
        self.keystate
    }

    pub fn syspath(&self) -> Option<&Path> {
        self.syspath.as_deref()
    }

    pub fn parent_uid(&self) -> Option<&str> {
        self.parent_uid.as_deref()
    }

    pub fn security(&self) -> Security {
        self.security
    }

    pub fn ctime(&self) -> u64 {
        self.ctime
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn link_speed(&self) -> LinkSpeed {
        self.link_speed
    }

    pub fn boot(&self) -> bool {
        self.boot
    }

    pub fn iommu(&self) -> bool {
        self.iommu
    }

    pub fn is_host(&self) -> bool {
        self.host
    }

    /// The bus object path for this device.
    pub fn object_path(&self) -> String {
        bus::device_object_path(&self.uid)
    }

    pub(crate) fn set_policy(&mut self, policy: Policy) {
        self.policy = policy;
    }

    pub(crate) fn set_stored(&mut self, stored: bool) {
        self.stored = stored;
    }

    pub(crate) fn set_keystate(&mut self, keystate: KeyState) {
        self.keystate = keystate;
    }
}

/// Derive the status from the `authorized` attribute and the security
/// level captured at connection time.
fn compute_status(sysfs: &Sysfs, node: &Path, security: Security) -> Result<Status> {
    let auth = sysfs.read_authorized(node)?;
    Ok(match auth {
        0 => Status::Connected,
        2 => Status::AuthorizedSecure,
        _ if security == Security::DpOnly => Status::AuthorizedDponly,
        _ => Status::Authorized,
    })
}

const AUTHORIZE_RETRIES: u32 = 5;
const AUTHORIZE_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Write the authorization level, retrying EBUSY with bounded backoff.
fn write_authorize_retry(sysfs: &Sysfs, node: &Path, level: u32) -> Result<()> {
    let mut attempt = 0;
    loop {
        match sysfs.write_authorize(node, level) {
            Ok(()) => return Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) && attempt < AUTHORIZE_RETRIES => {
                attempt += 1;
                thread::sleep(AUTHORIZE_RETRY_DELAY * attempt);
            }
            Err(e) if e.raw_os_error() == Some(libc::EKEYREJECTED) => {
                return Err(Error::Auth("key challenge mismatch".to_string()));
            }
            Err(e) => {
                return Err(Error::Auth(format!("could not write to 'authorized': {}", e)));
            }
        }
    }
}
