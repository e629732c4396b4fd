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

//! A fake sysfs tree for exercising the probe and the manager.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use tbauthd::sysfs::Sysfs;
use tempfile::TempDir;

pub const FORCE_POWER_GUID: &str = "86CCFD48-205E-4A77-9C48-2021CBEDE341";

pub struct MockSysfs {
    dir: TempDir,
}

impl MockSysfs {
    pub fn new() -> MockSysfs {
        let dir = TempDir::new().expect("failed to create temp dir");
        let root = dir.path();
        fs::create_dir_all(root.join("sys/devices")).expect("mock devices dir");
        fs::create_dir_all(root.join("sys/bus/thunderbolt/devices")).expect("mock tbt bus dir");
        fs::create_dir_all(root.join("sys/devices/virtual/dmi/id")).expect("mock dmi dir");
        MockSysfs { dir }
    }

    pub fn root(&self) -> PathBuf {
        fs::canonicalize(self.dir.path()).expect("canonical mock root")
    }

    pub fn sysfs(&self) -> Sysfs {
        Sysfs::with_root_path(self.root())
    }

    fn bus_dir(&self) -> PathBuf {
        self.root().join("sys/bus/thunderbolt/devices")
    }

    fn link_subsystem(&self, node: &Path) {
        symlink(self.root().join("sys/bus/thunderbolt"), node.join("subsystem"))
            .expect("mock subsystem symlink");
    }

    fn link_bus(&self, name: &str, node: &Path) {
        symlink(node, self.bus_dir().join(name)).expect("mock bus symlink");
    }

    /// Create a PCI NHI node (the parent of a domain).
    pub fn add_nhi(&self, name: &str, pci_id: &str) -> PathBuf {
        let node = self.root().join("sys/devices").join(name);
        fs::create_dir_all(&node).expect("mock nhi dir");
        fs::write(node.join("device"), format!("{}\n", pci_id)).expect("mock nhi pci id");
        node
    }

    /// Create a domain controller under `parent` (or under sys/devices).
    pub fn add_domain_under(&self, parent: Option<&Path>, name: &str, security: &str) -> PathBuf {
        let base = parent.map(Path::to_path_buf).unwrap_or_else(|| self.root().join("sys/devices"));
        let node = base.join(name);
        fs::create_dir_all(&node).expect("mock domain dir");
        fs::write(node.join("uevent"), "DEVTYPE=thunderbolt_domain\n").expect("mock uevent");
        fs::write(node.join("security"), format!("{}\n", security)).expect("mock security");
        self.link_subsystem(&node);
        self.link_bus(name, &node);
        node
    }

    pub fn add_domain(&self, name: &str, security: &str) -> PathBuf {
        self.add_domain_under(None, name, security)
    }

    /// Create a device node under `parent` (a domain or another device).
    pub fn add_device(&self, parent: &Path, name: &str, uid: &str, authorized: &str) -> PathBuf {
        let node = parent.join(name);
        fs::create_dir_all(&node).expect("mock device dir");
        fs::write(node.join("uevent"), "DEVTYPE=thunderbolt_device\n").expect("mock uevent");
        fs::write(node.join("unique_id"), format!("{}\n", uid)).expect("mock unique_id");
        fs::write(node.join("authorized"), format!("{}\n", authorized)).expect("mock authorized");
        fs::write(node.join("vendor_name"), "GNOME.org\n").expect("mock vendor_name");
        fs::write(node.join("device_name"), "Laptop\n").expect("mock device_name");
        self.link_subsystem(&node);
        self.link_bus(name, &node);
        node
    }

    /// Simulate an unplug: drop the bus entry and the device directory.
    pub fn unplug(&self, name: &str, node: &Path) {
        let _ = fs::remove_file(self.bus_dir().join(name));
        let _ = fs::remove_dir_all(node);
    }

    /// The uevent devpath for a node (relative to /sys, leading slash).
    pub fn devpath(&self, node: &Path) -> PathBuf {
        let rel = node.strip_prefix(self.root().join("sys")).expect("node under mock root");
        Path::new("/").join(rel)
    }

    pub fn attr(&self, node: &Path, name: &str) -> String {
        fs::read_to_string(node.join(name))
            .unwrap_or_else(|_| panic!("missing attribute '{}'", name))
            .trim_end_matches('\n')
            .to_string()
    }

    pub fn set_attr(&self, node: &Path, name: &str, value: &str) {
        fs::write(node.join(name), format!("{}\n", value)).expect("mock attribute write");
    }

    pub fn del_attr(&self, node: &Path, name: &str) {
        fs::remove_file(node.join(name)).expect("mock attribute removal");
    }

    pub fn set_dmi(&self, sys_vendor: &str, product_name: &str, product_version: &str) {
        let dmi = self.root().join("sys/devices/virtual/dmi/id");
        fs::write(dmi.join("sys_vendor"), format!("{}\n", sys_vendor)).expect("mock dmi");
        fs::write(dmi.join("product_name"), format!("{}\n", product_name)).expect("mock dmi");
        fs::write(dmi.join("product_version"), format!("{}\n", product_version))
            .expect("mock dmi");
    }

    /// Create the WMI force-power attribute; returns its path.
    pub fn add_force_power(&self, initial: &str) -> PathBuf {
        let dev = self.root().join("sys/bus/wmi/devices").join(FORCE_POWER_GUID);
        fs::create_dir_all(&dev).expect("mock wmi dir");
        let attr = dev.join("force_power");
        fs::write(&attr, initial).expect("mock force_power");
        attr
    }
}
