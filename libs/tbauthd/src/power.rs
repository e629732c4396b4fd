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

//! # Force Power
//!
//! Some systems cut power to the Thunderbolt controller when nothing is
//! plugged in; the firmware exposes a WMI `force_power` attribute to
//! switch it back on. Interested parties acquire a [`PowerGuard`]; the
//! controller is forced on while at least one guard is alive.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{info, warn};

use crate::error::{Error, Result};
use crate::sysfs::Sysfs;

/// WMI GUID of the Intel Thunderbolt force-power method.
pub const FORCE_POWER_GUID: &str = "86CCFD48-205E-4A77-9C48-2021CBEDE341";

/// Observed state of the force-power switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// Force power is unsupported or unreadable.
    Unset,
    Off,
    On,
}

#[derive(Debug)]
struct Inner {
    holders: Vec<String>,
}

/// Handle to the controller's force-power switch.
#[derive(Clone, Debug)]
pub struct ForcePower {
    attr: Option<PathBuf>,
    inner: Arc<Mutex<Inner>>,
}

impl ForcePower {
    /// Look for the force-power attribute on the WMI bus.
    pub fn discover(sysfs: &Sysfs) -> ForcePower {
        let mut attr = None;
        if let Ok(entries) = fs::read_dir(sysfs.wmi_devices()) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                if !name.to_string_lossy().starts_with(FORCE_POWER_GUID) {
                    continue;
                }
                let candidate = entry.path().join("force_power");
                if candidate.exists() {
                    info!("force power support at {}", candidate.display());
                    attr = Some(candidate);
                    break;
                }
            }
        }
        ForcePower { attr, inner: Arc::new(Mutex::new(Inner { holders: Vec::new() })) }
    }

    /// Whether force power is available on this system.
    pub fn supported(&self) -> bool {
        self.attr.is_some()
    }

    /// Current state of the switch.
    pub fn state(&self) -> PowerState {
        let Some(attr) = &self.attr else {
            return PowerState::Unset;
        };
        match fs::read_to_string(attr) {
            Ok(v) if v.trim() == "1" => PowerState::On,
            Ok(_) => PowerState::Off,
            Err(_) => PowerState::Unset,
        }
    }

    /// Acquire a guard; the first one switches the controller on.
    pub fn acquire(&self, who: &str) -> Result<PowerGuard> {
        let attr = self
            .attr
            .clone()
            .ok_or_else(|| Error::NotFound("force_power".to_string()))?;

        let mut inner = self.inner.lock().expect("force power lock");
        if inner.holders.is_empty() {
            fs::write(&attr, "1").map_err(|e| {
                Error::Failed(format!("could not force power on: {}", e))
            })?;
            info!("force power: on ({})", who);
        }
        inner.holders.push(who.to_string());

        Ok(PowerGuard { power: self.clone(), who: who.to_string() })
    }

    fn release(&self, who: &str) {
        let mut inner = self.inner.lock().expect("force power lock");
        if let Some(pos) = inner.holders.iter().position(|h| h == who) {
            inner.holders.remove(pos);
        }
        if inner.holders.is_empty() {
            if let Some(attr) = &self.attr {
                match fs::write(attr, "0") {
                    Ok(()) => info!("force power: off"),
                    Err(e) => warn!("could not release force power: {}", e),
                }
            }
        }
    }
}

/// Keeps the controller powered while alive.
#[derive(Debug)]
pub struct PowerGuard {
    power: ForcePower,
    who: String,
}

impl PowerGuard {
    pub fn who(&self) -> &str {
        &self.who
    }
}

impl Drop for PowerGuard {
    fn drop(&mut self) {
        self.power.release(&self.who);
    }
}
