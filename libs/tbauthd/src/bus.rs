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

//! # Bus Façade
//!
//! The narrow interface between the system-bus transport and the domain
//! objects. The transport itself lives elsewhere; this module defines the
//! object path scheme, the lifecycle signals the manager emits, and the
//! method-call requests it consumes.

use tokio::sync::{mpsc, oneshot};

use crate::device::{Policy, Status};
use crate::error::{Error, Result};

/// Object path of the manager.
pub const MANAGER_PATH: &str = "/org/tbauthd";
/// Prefix for per-device object paths.
pub const DEVICES_PATH: &str = "/org/tbauthd/devices";

/// Daemon version, exposed as the manager's `Version` property.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Object path for a device uid ('-' is not valid in a path element).
pub fn device_object_path(uid: &str) -> String {
    format!("{}/{}", DEVICES_PATH, uid.replace('-', "_"))
}

/// Lifecycle signals, translated to wire events by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    DeviceAdded { path: String },
    DeviceRemoved { path: String },
    StatusChanged { path: String, status: Status },
}

/// Method calls arriving from the transport, resolved on the main loop.
#[derive(Debug)]
pub enum Request {
    ListDevices { reply: oneshot::Sender<Vec<String>> },
    Authorize { uid: String, reply: oneshot::Sender<Result<()>> },
    Enroll { uid: String, policy: Policy, reply: oneshot::Sender<Result<()>> },
    Forget { uid: String, reply: oneshot::Sender<Result<()>> },
}

/// The manager-side endpoints of the façade.
pub struct BusFacade {
    pub(crate) requests: mpsc::UnboundedReceiver<Request>,
    pub(crate) signals: mpsc::UnboundedSender<Signal>,
}

/// The transport-side endpoints of the façade.
pub struct BusHandle {
    requests: mpsc::UnboundedSender<Request>,
    signals: mpsc::UnboundedReceiver<Signal>,
}

/// Create a connected façade/handle pair.
pub fn channel() -> (BusFacade, BusHandle) {
    let (req_tx, req_rx) = mpsc::unbounded_channel();
    let (sig_tx, sig_rx) = mpsc::unbounded_channel();
    (
        BusFacade { requests: req_rx, signals: sig_tx },
        BusHandle { requests: req_tx, signals: sig_rx },
    )
}

impl BusHandle {
    async fn call<T>(
        &self,
        req: Request,
        rx: oneshot::Receiver<T>,
    ) -> std::result::Result<T, Error> {
        self.requests
            .send(req)
            .map_err(|_| Error::Failed("manager is gone".to_string()))?;
        rx.await.map_err(|_| Error::Failed("manager dropped the request".to_string()))
    }

    /// `ListDevices()` — object paths of all known devices.
    pub async fn list_devices(&self) -> Result<Vec<String>> {
        let (tx, rx) = oneshot::channel();
        self.call(Request::ListDevices { reply: tx }, rx).await
    }

    /// `Authorize()` on the device object for `uid`.
    pub async fn authorize(&self, uid: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.call(Request::Authorize { uid: uid.to_string(), reply: tx }, rx).await?
    }

    /// `Enroll(policy)` on the device object for `uid`.
    pub async fn enroll(&self, uid: &str, policy: Policy) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.call(Request::Enroll { uid: uid.to_string(), policy, reply: tx }, rx).await?
    }

    /// `Forget()` on the device object for `uid`.
    pub async fn forget(&self, uid: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.call(Request::Forget { uid: uid.to_string(), reply: tx }, rx).await?
    }

    /// Wait for the next lifecycle signal.
    pub async fn next_signal(&mut self) -> Option<Signal> {
        self.signals.recv().await
    }

    /// Non-blocking signal poll.
    pub fn try_signal(&mut self) -> Option<Signal> {
        self.signals.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_paths() {
        assert_eq!(MANAGER_PATH, "/org/tbauthd");
        assert_eq!(
            device_object_path("fbc83890-e9bf-45e5-a777-b3728490989c"),
            "/org/tbauthd/devices/fbc83890_e9bf_45e5_a777_b3728490989c"
        );
    }
}
