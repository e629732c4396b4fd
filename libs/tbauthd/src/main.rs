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

//! The daemon binary: wires the sysfs probe, the enrollment store, the
//! uevent sockets and the bus façade to the manager loop.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use log::info;

use tbauthd::bus;
use tbauthd::manager::{Manager, NetlinkEventSource};
use tbauthd::power::ForcePower;
use tbauthd::store::Store;
use tbauthd::sysfs::Sysfs;
use uevent::{AsyncNetlinkUEventSocket, AsyncUEventSocket, UEventChannel};

const DEFAULT_DB_DIR: &str = "/var/lib/tbauthd";

fn db_dir() -> PathBuf {
    std::env::var_os("TBAUTHD_DB").map(PathBuf::from).unwrap_or_else(|| {
        PathBuf::from(DEFAULT_DB_DIR)
    })
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("tbauthd {} starting", bus::version());

    // Single-threaded by design: all state lives on one cooperative loop.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create runtime")?;

    runtime.block_on(async {
        let sysfs = Sysfs::new();
        let store = Store::new(db_dir()).context("failed to open enrollment store")?;
        if store.upgrade().context("failed to upgrade enrollment store")? {
            info!("enrollment store upgraded");
        }

        let power = ForcePower::discover(&sysfs);
        if power.supported() {
            info!("force power: {:?}", power.state());
        }

        let udev: Arc<dyn AsyncUEventSocket> = Arc::new(
            AsyncNetlinkUEventSocket::create(UEventChannel::Udev)
                .context("failed to open udev uevent socket")?,
        );
        let kernel: Arc<dyn AsyncUEventSocket> = Arc::new(
            AsyncNetlinkUEventSocket::create(UEventChannel::Kernel)
                .context("failed to open kernel uevent socket")?,
        );

        let (facade, _bus) = bus::channel();
        let mut manager = Manager::new(sysfs, store, facade);
        manager.start().context("failed to initialize manager")?;

        manager
            .run(NetlinkEventSource::new(udev), NetlinkEventSource::new(kernel))
            .await
            .context("manager loop failed")
    })
}
