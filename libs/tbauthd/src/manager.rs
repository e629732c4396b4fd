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

//! # Manager
//!
//! The reconciliation loop: it owns the live device set, consults the
//! enrollment store, dispatches hot-plug events and drives devices
//! through authorization. Everything runs on one cooperative loop;
//! authorization kick-offs are deferred through a queue so event
//! dispatch returns promptly.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use kobject_uevent::ActionType;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use uevent::AsyncUEventSocket;

use crate::bus::{BusFacade, Request, Signal};
use crate::device::{Device, KeyState, Policy, Status};
use crate::error::{Error, Result};
use crate::store::Store;
use crate::sysfs::{self, Sysfs};

/// A parsed hot-plug event, as the manager consumes it.
#[derive(Debug)]
pub struct HotplugEvent {
    pub action: ActionType,
    pub devpath: PathBuf,
    pub subsystem: String,
}

impl HotplugEvent {
    pub fn new(action: ActionType, devpath: impl Into<PathBuf>) -> Self {
        HotplugEvent { action, devpath: devpath.into(), subsystem: "thunderbolt".to_string() }
    }

    fn from_uevent(ev: kobject_uevent::UEvent) -> Self {
        HotplugEvent { action: ev.action, devpath: ev.devpath, subsystem: ev.subsystem }
    }

    fn sysname(&self) -> &str {
        self.devpath.file_name().and_then(OsStr::to_str).unwrap_or("")
    }
}

/// A stream of hot-plug events feeding the manager's loop.
#[async_trait]
pub trait EventSource: Send {
    async fn next_event(&mut self) -> Result<HotplugEvent>;
}

/// [`EventSource`] over a netlink uevent socket.
pub struct NetlinkEventSource {
    socket: Arc<dyn AsyncUEventSocket>,
}

impl NetlinkEventSource {
    pub fn new(socket: Arc<dyn AsyncUEventSocket>) -> Self {
        NetlinkEventSource { socket }
    }
}

#[async_trait]
impl EventSource for NetlinkEventSource {
    async fn next_event(&mut self) -> Result<HotplugEvent> {
        let ev = self.socket.read().await.map_err(|e| Error::Failed(e.to_string()))?;
        Ok(HotplugEvent::from_uevent(ev))
    }
}

/// The event-driven controller reconciling kernel state, the in-memory
/// device set and the enrollment store.
pub struct Manager {
    sysfs: Sysfs,
    store: Store,
    devices: Vec<Device>,
    signals: mpsc::UnboundedSender<Signal>,
    requests: Option<mpsc::UnboundedReceiver<Request>>,
    auth_tx: mpsc::UnboundedSender<String>,
    auth_rx: Option<mpsc::UnboundedReceiver<String>>,
}

impl Manager {
    pub fn new(sysfs: Sysfs, store: Store, bus: BusFacade) -> Manager {
        let (auth_tx, auth_rx) = mpsc::unbounded_channel();
        Manager {
            sysfs,
            store,
            devices: Vec::new(),
            signals: bus.signals,
            requests: Some(bus.requests),
            auth_tx,
            auth_rx: Some(auth_rx),
        }
    }

    /// Load the enrollment store and enumerate the current bus state.
    ///
    /// Per-uid store failures are logged and skipped; they never abort
    /// startup.
    pub fn start(&mut self) -> Result<()> {
        debug!("loading devices from store");
        for uid in self.store.list()? {
            match self.store.get(&uid) {
                Ok(rec) => {
                    let have_key = self.store.has_key(&uid);
                    self.devices.push(Device::from_record(&rec, have_key));
                }
                Err(e) => warn!("[{}] failed to load from store: {}", uid, e),
            }
        }

        debug!("enumerating devices from sysfs");
        for node in self.sysfs.enumerate()? {
            let uid = match self.sysfs.read_attr(&node, "unique_id") {
                Ok(uid) => uid,
                Err(e) => {
                    warn!("skipping {}: {}", node.display(), e);
                    continue;
                }
            };
            match self.index_of_uid(&uid) {
                None => self.device_added(&node),
                Some(i) if !self.devices[i].status().is_connected() => {
                    self.device_attached(i, &node)
                }
                Some(_) => {}
            }
        }

        match self.sysfs.count_hosts() {
            Ok(n) => debug!("{} active thunderbolt hosts", n),
            Err(e) => debug!("could not count hosts: {}", e),
        }

        Ok(())
    }

    /// Run the main loop: udev events drive state, kernel events are
    /// traced, bus requests and deferred authorizations are resolved in
    /// between.
    pub async fn run<U, K>(mut self, mut udev: U, mut kernel: K) -> Result<()>
    where
        U: EventSource,
        K: EventSource,
    {
        let mut requests = self
            .requests
            .take()
            .ok_or_else(|| Error::Failed("manager is already running".to_string()))?;
        let mut auth_rx = self
            .auth_rx
            .take()
            .ok_or_else(|| Error::Failed("manager is already running".to_string()))?;

        info!("manager running ({} devices)", self.devices.len());
        loop {
            tokio::select! {
                res = udev.next_event() => match res {
                    Ok(ev) => {
                        debug!("uevent [ udev ]: {:?} {}", ev.action, ev.devpath.display());
                        self.handle_event(&ev);
                    }
                    Err(e) => error!("error reading udev uevent: {}", e),
                },
                res = kernel.next_event() => match res {
                    Ok(ev) => debug!("uevent [kernel]: {:?} {}", ev.action, ev.devpath.display()),
                    Err(e) => error!("error reading kernel uevent: {}", e),
                },
                Some(req) = requests.recv() => self.handle_request(req),
                Some(uid) = auth_rx.recv() => self.authorize_scheduled(&uid),
            }
        }
    }

    /* event dispatch */

    /// Dispatch one udev event. Failures are contained here; the loop
    /// always continues.
    pub fn handle_event(&mut self, ev: &HotplugEvent) {
        if ev.subsystem != "thunderbolt" {
            return;
        }
        // the domain controller itself is not a device
        if ev.sysname().starts_with("domain") {
            return;
        }

        let node = self.sysfs.node_from_devpath(&ev.devpath);

        match ev.action {
            ActionType::Add | ActionType::Change => {
                let uid = match self.sysfs.read_attr(&node, "unique_id") {
                    Ok(uid) => uid,
                    Err(e) => {
                        debug!("dropping {:?} event without unique_id: {}", ev.action, e);
                        return;
                    }
                };
                match self.index_of_uid(&uid) {
                    None => self.device_added(&node),
                    Some(i) if !self.devices[i].status().is_connected() => {
                        self.device_attached(i, &node)
                    }
                    Some(i) => self.device_changed(i, &node),
                }
            }
            ActionType::Remove => match self.index_of_syspath(&node) {
                None => {}
                Some(i) if self.devices[i].stored() => self.device_detached(i),
                Some(i) => self.device_removed(i),
            },
            _ => {}
        }
    }

    /// Drain the deferred authorization queue. The run loop does this via
    /// `select!`; tests call it directly after dispatching events.
    pub fn process_pending(&mut self) {
        loop {
            let uid = match self.auth_rx.as_mut().and_then(|rx| rx.try_recv().ok()) {
                Some(uid) => uid,
                None => break,
            };
            self.authorize_scheduled(&uid);
        }
    }

    fn device_added(&mut self, node: &Path) {
        let dev = match Device::new_from_udev(&self.sysfs, node) {
            Ok(dev) => dev,
            Err(e) => {
                warn!("could not create device for udev: {}", e);
                return;
            }
        };

        if dev.is_host() {
            self.note_host_stability(&dev, node);
        }

        info!("[{}] added ({})", dev.uid(), node.display());
        let path = dev.object_path();
        self.devices.push(dev);
        self.emit(Signal::DeviceAdded { path });

        let idx = self.devices.len() - 1;
        self.maybe_authorize(idx);
    }

    fn device_attached(&mut self, idx: usize, node: &Path) {
        let before = self.devices[idx].status();
        let status = match self.devices[idx].connected(&self.sysfs, node) {
            Ok(status) => status,
            Err(e) => {
                warn!("[{}] attach failed: {}", self.devices[idx].uid(), e);
                return;
            }
        };

        info!("[{}] connected: {:?} ({})", self.devices[idx].uid(), status, node.display());
        self.note_status(idx, before);

        if status != Status::Connected {
            return;
        }
        self.maybe_authorize(idx);
    }

    fn device_changed(&mut self, idx: usize, node: &Path) {
        let before = self.devices[idx].status();
        let after = match self.devices[idx].update_from_udev(&self.sysfs, node) {
            Ok(status) => status,
            Err(e) => {
                warn!("[{}] update failed: {}", self.devices[idx].uid(), e);
                return;
            }
        };

        debug!("[{}] device changed: {:?}", self.devices[idx].uid(), after);
        self.note_status(idx, before);

        if !after.is_authorized() {
            return;
        }

        // an authorized device may unblock enrolled children behind it
        for child in self.children_of(idx) {
            self.maybe_authorize(child);
        }
    }

    fn device_detached(&mut self, idx: usize) {
        let before = self.devices[idx].status();
        let syspath = self.devices[idx]
            .syspath()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        info!("[{}] disconnected ({})", self.devices[idx].uid(), syspath);

        self.devices[idx].disconnected();
        self.note_status(idx, before);
    }

    fn device_removed(&mut self, idx: usize) {
        let dev = self.devices.remove(idx);
        info!(
            "[{}] removed ({})",
            dev.uid(),
            dev.syspath().map(|p| p.display().to_string()).unwrap_or_default()
        );
        self.emit(Signal::DeviceRemoved { path: dev.object_path() });
    }

    /* device lookup */

    fn index_of_uid(&self, uid: &str) -> Option<usize> {
        self.devices.iter().position(|d| d.uid() == uid)
    }

    fn index_of_syspath(&self, node: &Path) -> Option<usize> {
        self.devices.iter().position(|d| d.syspath() == Some(node))
    }

    /// The parent is the device one syspath segment above; when no such
    /// device is in the set, the device sits directly under the host.
    fn parent_index(&self, idx: usize) -> Option<usize> {
        let path = self.devices[idx].syspath()?;
        let parent_path = path.parent()?;
        self.devices.iter().position(|d| d.syspath() == Some(parent_path))
    }

    fn children_of(&self, idx: usize) -> Vec<usize> {
        let Some(parent_path) = self.devices[idx].syspath() else {
            return Vec::new();
        };
        self.devices
            .iter()
            .enumerate()
            .filter(|(_, d)| d.syspath().and_then(Path::parent) == Some(parent_path))
            .map(|(i, _)| i)
            .collect()
    }

    /* authorization */

    fn parent_authorized(&self, idx: usize) -> bool {
        match self.parent_index(idx) {
            Some(p) => self.devices[p].status().is_authorized(),
            None => true,
        }
    }

    fn auto_auth_eligible(&self, idx: usize) -> bool {
        let dev = &self.devices[idx];
        dev.stored()
            && dev.policy() == Policy::Auto
            && dev.status() == Status::Connected
            && self.parent_authorized(idx)
    }

    fn maybe_authorize(&mut self, idx: usize) {
        let dev = &self.devices[idx];
        debug!(
            "[{}] checking possible authorization: {} ({:?})",
            dev.uid(),
            dev.policy(),
            dev.status()
        );
        if self.auto_auth_eligible(idx) {
            let uid = self.devices[idx].uid().to_string();
            let _ = self.auth_tx.send(uid);
        }
    }

    /// A scheduled authorization runs on a later loop turn; the device
    /// may have disconnected or changed in between, so eligibility is
    /// re-checked before any sysfs write happens.
    fn authorize_scheduled(&mut self, uid: &str) {
        let idx = match self.index_of_uid(uid) {
            Some(idx) => idx,
            None => {
                debug!("[{}] vanished before authorization", uid);
                return;
            }
        };
        if !self.auto_auth_eligible(idx) {
            debug!("[{}] no longer eligible for authorization", uid);
            return;
        }
        info!("[{}] authorizing", uid);
        let _ = self.run_authorize(idx);
    }

    fn run_authorize(&mut self, idx: usize) -> Result<()> {
        let before = self.devices[idx].status();
        let result = self.devices[idx].authorize(&self.sysfs, &self.store);
        match &result {
            Ok(status) => info!("[{}] authorized: {:?}", self.devices[idx].uid(), status),
            Err(e) => warn!("[{}] authorization failed: {}", self.devices[idx].uid(), e),
        }
        self.note_status(idx, before);
        result.map(|_| ())
    }

    /* bus methods */

    fn handle_request(&mut self, req: Request) {
        match req {
            Request::ListDevices { reply } => {
                let _ = reply.send(self.list_devices());
            }
            Request::Authorize { uid, reply } => {
                let _ = reply.send(self.authorize_device(&uid));
            }
            Request::Enroll { uid, policy, reply } => {
                let _ = reply.send(self.enroll(&uid, policy));
            }
            Request::Forget { uid, reply } => {
                let _ = reply.send(self.forget(&uid));
            }
        }
    }

    /// Object paths of all known devices, connected or not.
    pub fn list_devices(&self) -> Vec<String> {
        self.devices.iter().map(Device::object_path).collect()
    }

    /// Persist a device and its policy; a connected, unauthorized device
    /// is authorized right away (provisioning a key on secure domains).
    pub fn enroll(&mut self, uid: &str, policy: Policy) -> Result<()> {
        let idx = self.index_of_uid(uid).ok_or_else(|| Error::NotFound(uid.to_string()))?;

        self.devices[idx].set_policy(policy);
        self.store.put(&self.devices[idx].to_record())?;
        self.devices[idx].set_stored(true);
        info!("[{}] enrolled ({})", uid, policy);

        if self.devices[idx].status() == Status::Connected {
            self.run_authorize(idx)?;
        }
        Ok(())
    }

    /// Drop a device from the store; a disconnected device is evicted
    /// from the set as well.
    pub fn forget(&mut self, uid: &str) -> Result<()> {
        let idx = self.index_of_uid(uid);
        if idx.is_none() && !self.store.contains(uid) {
            return Err(Error::NotFound(uid.to_string()));
        }

        self.store.delete(uid)?;
        info!("[{}] forgotten", uid);

        if let Some(idx) = idx {
            self.devices[idx].set_stored(false);
            self.devices[idx].set_keystate(KeyState::Missing);
            if !self.devices[idx].status().is_connected() {
                self.device_removed(idx);
            }
        }
        Ok(())
    }

    /// Explicit, user-initiated authorization; also the retry path out of
    /// [`Status::AuthError`].
    pub fn authorize_device(&mut self, uid: &str) -> Result<()> {
        let idx = self.index_of_uid(uid).ok_or_else(|| Error::NotFound(uid.to_string()))?;
        let status = self.devices[idx].status();
        if !status.is_connected() {
            return Err(Error::InvalidArgument(format!("device '{}' is not connected", uid)));
        }
        if status.is_authorized() || status == Status::Authorizing {
            return Err(Error::InvalidArgument(format!("device '{}' is already authorized", uid)));
        }
        self.run_authorize(idx)
    }

    /// The live device set (read-only).
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Find a device by uid (read-only).
    pub fn device_by_uid(&self, uid: &str) -> Option<&Device> {
        self.index_of_uid(uid).map(|i| &self.devices[i])
    }

    /* helpers */

    fn emit(&self, signal: Signal) {
        // a missing transport is fine, signals are best-effort
        let _ = self.signals.send(signal);
    }

    fn note_status(&mut self, idx: usize, before: Status) {
        let dev = &self.devices[idx];
        if dev.status() != before {
            self.emit(Signal::StatusChanged { path: dev.object_path(), status: dev.status() });
        }
    }

    fn note_host_stability(&self, dev: &Device, node: &Path) {
        let Some(domain) = self.sysfs.domain_of(node) else {
            return;
        };
        match self
            .sysfs
            .nhi_pci_id_for_domain(&domain)
            .and_then(sysfs::nhi_uuid_is_stable)
        {
            Ok(true) => {}
            // unknown controllers are assumed unstable as well
            Ok(false) => info!(
                "[{}] host uid is not stable across reboots; it will be re-enrolled each boot",
                dev.uid()
            ),
            Err(e) => debug!("[{}] NHI lookup: {}", dev.uid(), e),
        }
    }
}
