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

//! # Sysfs Probe
//!
//! A pure-function façade over the kernel's Thunderbolt sysfs hierarchy.
//! All paths are resolved relative to a root directory so tests can point
//! the probe at a fake tree.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const DEVTYPE_DOMAIN: &str = "thunderbolt_domain";
const DEVTYPE_DEVICE: &str = "thunderbolt_device";

/// Human readable identity of a device, from sysfs or the DMI fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ident {
    pub name: String,
    pub vendor: String,
}

/// Lane count and speed (gigabit/s) in both directions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkSpeed {
    pub rx_lanes: u32,
    pub rx_speed: u32,
    pub tx_lanes: u32,
    pub tx_speed: u32,
}

/// Handle to the (possibly faked) sysfs tree.
///
/// It holds paths to the sysfs entries the daemon consumes: the
/// Thunderbolt bus, the DMI identification attributes and the WMI bus
/// used for force-power control.
#[derive(Clone)]
pub struct Sysfs {
    sys_root: PathBuf,
    tb_devices: PathBuf,
    dmi_id: PathBuf,
    wmi_devices: PathBuf,
}

impl Sysfs {
    /// Creates a new `Sysfs` instance for the real `/sys`.
    pub fn new() -> Self {
        Self::with_root_path(PathBuf::from("/"))
    }

    /// Creates a `Sysfs` instance rooted at a specified directory.
    pub fn with_root_path(root: PathBuf) -> Self {
        let root = fs::canonicalize(&root).unwrap_or(root);
        Sysfs {
            sys_root: root.join("sys"),
            tb_devices: root.join("sys/bus/thunderbolt/devices"),
            dmi_id: root.join("sys/devices/virtual/dmi/id"),
            wmi_devices: root.join("sys/bus/wmi/devices"),
        }
    }

    /// Maps a uevent devpath (e.g. `/devices/.../0-1`) to a node path.
    pub fn node_from_devpath(&self, devpath: &Path) -> PathBuf {
        let relative = devpath.strip_prefix("/").unwrap_or(devpath);
        self.sys_root.join(relative)
    }

    /// The WMI bus device directory (force-power discovery).
    pub(crate) fn wmi_devices(&self) -> &Path {
        &self.wmi_devices
    }

    /* attribute plumbing */

    /// Read an attribute that is expected to be present.
    pub fn read_attr(&self, node: &Path, attr: &str) -> Result<String> {
        let path = node.join(attr);
        match fs::read_to_string(&path) {
            Ok(s) => Ok(s.trim_end_matches('\n').to_string()),
            Err(e) => Err(Error::udev(node, attr, e)),
        }
    }

    /// Read an attribute that may legitimately be absent (ENOENT → `None`).
    pub fn read_attr_opt(&self, node: &Path, attr: &str) -> Result<Option<String>> {
        let path = node.join(attr);
        match fs::read_to_string(&path) {
            Ok(s) => Ok(Some(s.trim_end_matches('\n').to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::udev(node, attr, e)),
        }
    }

    fn read_attr_uint(&self, node: &Path, attr: &str) -> u32 {
        self.read_attr_opt(node, attr)
            .ok()
            .flatten()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .unwrap_or(0)
    }

    fn devtype(&self, node: &Path) -> Option<String> {
        let content = fs::read_to_string(node.join("uevent")).ok()?;
        content.lines().find_map(|l| l.strip_prefix("DEVTYPE=").map(str::to_string))
    }

    fn is_thunderbolt(&self, node: &Path) -> bool {
        match fs::read_link(node.join("subsystem")) {
            Ok(target) => target.to_string_lossy().ends_with("/bus/thunderbolt"),
            Err(_) => false,
        }
    }

    /// Whether the node is a Thunderbolt domain controller.
    pub fn is_domain(&self, node: &Path) -> bool {
        self.is_thunderbolt(node) && self.devtype(node).as_deref() == Some(DEVTYPE_DOMAIN)
    }

    /// Whether the node is a Thunderbolt device (host or peripheral).
    pub fn is_device(&self, node: &Path) -> bool {
        self.is_thunderbolt(node) && self.devtype(node).as_deref() == Some(DEVTYPE_DEVICE)
    }

    /* identity */

    fn read_attr_name(&self, node: &Path, attr: &str) -> Result<String> {
        // "<attr>_name" carries the human readable form; plain "<attr>"
        // is the numeric fallback.
        if let Some(v) = self.read_attr_opt(node, &format!("{attr}_name"))? {
            return Ok(v);
        }
        self.read_attr(node, attr)
    }

    /// Read name and vendor of a device node.
    pub fn identify(&self, node: &Path) -> Result<Ident> {
        let vendor = self.read_attr_name(node, "vendor")?;
        let name = self.read_attr_name(node, "device")?;
        Ok(Ident { name, vendor })
    }

    /// Read name and vendor of the host controller.
    ///
    /// Controllers with a DROM carry the normal device identity; embedded
    /// ones do not, and the SMBIOS/DMI system information is used instead.
    pub fn host_identify(&self, node: &Path) -> Result<Ident> {
        if let Ok(id) = self.identify(node) {
            return Ok(id);
        }

        let dmi = self.dmi_id.clone();
        let vendor = self.read_attr(&dmi, "sys_vendor")?;

        // Almost all systems put the human readable string in
        // product_name; Lenovo instead uses product_version.
        let (attr, vendor) = if vendor.eq_ignore_ascii_case("lenovo") {
            ("product_version", "Lenovo".to_string())
        } else {
            ("product_name", vendor)
        };

        let name = self.read_attr(&dmi, attr)?;
        Ok(Ident { name, vendor })
    }

    /* topology */

    /// Walk the parent chain to the domain controller of a device node.
    pub fn domain_of(&self, node: &Path) -> Option<PathBuf> {
        let mut cur = node.parent();
        while let Some(p) = cur {
            if !p.starts_with(&self.sys_root) {
                return None;
            }
            if self.is_domain(p) {
                return Some(p.to_path_buf());
            }
            cur = p.parent();
        }
        None
    }

    /// Security level of the domain a node belongs to.
    pub fn security_of(&self, node: &Path) -> Result<crate::device::Security> {
        let domain = if self.is_domain(node) {
            node.to_path_buf()
        } else {
            self.domain_of(node).ok_or_else(|| {
                Error::udev(
                    node,
                    "security",
                    io::Error::new(io::ErrorKind::NotFound, "failed to determine domain device"),
                )
            })?
        };
        let val = self.read_attr(&domain, "security")?;
        Ok(val.parse().unwrap_or(crate::device::Security::Unknown))
    }

    /// Canonical syspaths of all Thunderbolt device nodes on the bus,
    /// parents ordered before their children.
    pub fn enumerate(&self) -> Result<Vec<PathBuf>> {
        let mut nodes = Vec::new();
        let entries = match fs::read_dir(&self.tb_devices) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(nodes),
            Err(e) => return Err(Error::udev(&self.tb_devices, ".", e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| Error::udev(&self.tb_devices, ".", e))?;
            let path = entry.path();
            let node = fs::canonicalize(&path).unwrap_or(path);
            if self.is_device(&node) {
                nodes.push(node);
            }
        }
        nodes.sort();
        Ok(nodes)
    }

    fn domains(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        let entries = match fs::read_dir(&self.tb_devices) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(Error::udev(&self.tb_devices, ".", e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| Error::udev(&self.tb_devices, ".", e))?;
            let path = entry.path();
            let node = fs::canonicalize(&path).unwrap_or(path);
            if self.is_domain(&node) {
                out.push(node);
            }
        }
        Ok(out)
    }

    /// Number of domains with at least one connected device.
    pub fn count_hosts(&self) -> Result<usize> {
        let devices = self.enumerate()?;
        let mut count = 0;
        for domain in self.domains()? {
            if devices.iter().any(|d| d.starts_with(&domain)) {
                count += 1;
            }
        }
        Ok(count)
    }

    /// PCI device id of the NHI implementing the given domain.
    pub fn nhi_pci_id_for_domain(&self, node: &Path) -> Result<u32> {
        if !self.is_domain(node) {
            return Err(Error::udev(
                node,
                "device",
                io::Error::new(io::ErrorKind::InvalidInput, "not a thunderbolt domain"),
            ));
        }
        let parent = node.parent().ok_or_else(|| {
            Error::udev(
                node,
                "device",
                io::Error::new(io::ErrorKind::NotFound, "failed to get parent for domain"),
            )
        })?;
        let raw = self.read_attr(parent, "device")?;
        let digits = raw.trim().trim_start_matches("0x");
        u32::from_str_radix(digits, 16).map_err(|_| {
            Error::udev(
                parent,
                "device",
                io::Error::new(io::ErrorKind::InvalidData, format!("bad PCI id '{}'", raw)),
            )
        })
    }

    /* device attributes */

    /// Read the `authorized` attribute. Essential for status computation.
    pub fn read_authorized(&self, node: &Path) -> Result<i32> {
        let raw = self.read_attr(node, "authorized")?;
        raw.trim().parse::<i32>().map_err(|_| {
            Error::udev(
                node,
                "authorized",
                io::Error::new(io::ErrorKind::InvalidData, format!("bad value '{}'", raw)),
            )
        })
    }

    /// Read the `key` attribute back, e.g. to verify a just-written key.
    pub fn read_key(&self, node: &Path) -> Result<String> {
        self.read_attr(node, "key")
    }

    /// Whether the device was authorized by the boot firmware.
    pub fn read_boot(&self, node: &Path) -> bool {
        self.read_attr_uint(node, "boot") > 0
    }

    /// Thunderbolt hardware generation; 0 when unreported.
    pub fn read_generation(&self, node: &Path) -> u32 {
        self.read_attr_uint(node, "generation")
    }

    /// Read the four link speed attributes; missing ones become zero.
    pub fn read_link_speed(&self, node: &Path) -> LinkSpeed {
        LinkSpeed {
            rx_lanes: self.read_attr_uint(node, "rx_lanes"),
            rx_speed: self.read_attr_uint(node, "rx_speed"),
            tx_lanes: self.read_attr_uint(node, "tx_lanes"),
            tx_speed: self.read_attr_uint(node, "tx_speed"),
        }
    }

    /// Whether the IOMMU protects DMA for this device. Absence means no.
    pub fn read_iommu(&self, node: &Path) -> Result<bool> {
        Ok(self.read_attr_opt(node, "iommu")?.map(|s| s.trim() == "1").unwrap_or(false))
    }

    /// ctime of the sysfs node, as seconds; 0 when unavailable.
    pub fn node_ctime(&self, node: &Path) -> u64 {
        fs::symlink_metadata(node).map(|m| m.ctime().max(0) as u64).unwrap_or(0)
    }

    /// Read the preboot ACL of a domain.
    ///
    /// `None` means the attribute does not exist (the controller has no
    /// bootacl support) — distinct from an existing but empty list.
    pub fn read_boot_acl(&self, node: &Path) -> Result<Option<Vec<String>>> {
        match self.read_attr_opt(node, "boot_acl")? {
            None => Ok(None),
            Some(v) if v.is_empty() => Ok(Some(Vec::new())),
            Some(v) => Ok(Some(v.split(',').map(str::to_string).collect())),
        }
    }

    /// Replace the preboot ACL of a domain.
    ///
    /// A sysfs attribute cannot be replaced via rename; the single write
    /// syscall is the atomic unit here.
    pub fn write_boot_acl(&self, node: &Path, acl: &[String]) -> Result<()> {
        let val = acl.join(",");
        fs::write(node.join("boot_acl"), val).map_err(|e| Error::udev(node, "boot_acl", e))
    }

    /* authorization writes */

    /// Write the authorization level ("1" to accept, "2" to challenge).
    ///
    /// Raw `io::Result` so the caller can classify EBUSY (retry) and
    /// EKEYREJECTED (challenge mismatch).
    pub fn write_authorize(&self, node: &Path, level: u32) -> io::Result<()> {
        if !self.is_thunderbolt(node) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a thunderbolt devpath"));
        }
        fs::write(node.join("authorized"), level.to_string())
    }

    /// Write a key (64 hex chars) to the `key` attribute.
    pub fn write_key(&self, node: &Path, key_hex: &str) -> io::Result<()> {
        if !self.is_thunderbolt(node) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a thunderbolt devpath"));
        }
        fs::write(node.join("key"), key_hex)
    }
}

impl Default for Sysfs {
    fn default() -> Self {
        Self::new()
    }
}

/* NHI PCI id related */

struct NhiEntry {
    pci_id: u32,
    stable: bool, // Does the UUID survive a reboot
}

static NHI_TABLE: &[NhiEntry] = &[
    NhiEntry { pci_id: 0x157d, stable: true },  // WIN_RIDGE_2C_NHI
    NhiEntry { pci_id: 0x15bf, stable: true },  // ALPINE_RIDGE_LP_NHI
    NhiEntry { pci_id: 0x15d2, stable: true },  // ALPINE_RIDGE_C_4C_NHI
    NhiEntry { pci_id: 0x15d9, stable: true },  // ALPINE_RIDGE_C_2C_NHI
    NhiEntry { pci_id: 0x15dc, stable: true },  // ALPINE_RIDGE_LP_USBONLY_NHI
    NhiEntry { pci_id: 0x15dd, stable: true },  // ALPINE_RIDGE_USBONLY_NHI
    NhiEntry { pci_id: 0x15de, stable: true },  // ALPINE_RIDGE_C_USBONLY_NHI
    NhiEntry { pci_id: 0x15e8, stable: true },  // TITAN_RIDGE_2C_NHI
    NhiEntry { pci_id: 0x15eb, stable: true },  // TITAN_RIDGE_4C_NHI
    NhiEntry { pci_id: 0x8a0d, stable: false }, // ICL_NHI1
    NhiEntry { pci_id: 0x8a17, stable: false }, // ICL_NHI0
    NhiEntry { pci_id: 0x9a1b, stable: false }, // TGL_NHI0
    NhiEntry { pci_id: 0x9a1d, stable: false }, // TGL_NHI1
];

/// Whether a host controller keeps its uid across reboots.
///
/// Unknown PCI ids yield [`Error::NotFound`]; callers treat that as
/// "assume unstable".
pub fn nhi_uuid_is_stable(pci_id: u32) -> Result<bool> {
    NHI_TABLE
        .iter()
        .find(|e| e.pci_id == pci_id)
        .map(|e| e.stable)
        .ok_or_else(|| Error::NotFound(format!("NHI PCI id '0x{:04x}'", pci_id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nhi_table_lookup() {
        assert_eq!(nhi_uuid_is_stable(0x15e8).unwrap(), true);
        assert_eq!(nhi_uuid_is_stable(0x9a1b).unwrap(), false);
        assert!(nhi_uuid_is_stable(0xffff).unwrap_err().is_notfound());
    }
}
