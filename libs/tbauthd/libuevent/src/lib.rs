// Copyright (C) 2025 The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # uevent
//!
//! Listen for kernel hot-plug events (kobject uevents) over netlink.
//!
//! Two multicast channels exist on the uevent netlink family: the raw
//! "kernel" channel and the "udev" channel carrying events that have been
//! processed by the udev daemon. Consumers pick one per socket.

/// Netlink socket implementations, blocking and async.
pub mod netlink;

pub use netlink::{AsyncNetlinkUEventSocket, AsyncUEventSocket, NetlinkUEventSocket, UEventChannel};
