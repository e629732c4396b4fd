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

//! # Thunderbolt Authorization Daemon
//!
//! This crate implements the core of a system daemon that manages
//! Thunderbolt peripheral authorization on a Linux host. It observes the
//! kernel's Thunderbolt subsystem via hot-plug events, tracks every
//! device ever seen, persists enrollment state and user policy, and
//! drives devices through an authorization state machine so that
//! enrolled devices are re-authorized automatically on reconnect while
//! unknown devices wait for user confirmation.
//!
//! The primary entry point is the [`manager::Manager`], wired to a
//! [`sysfs::Sysfs`] probe, a [`store::Store`] and a [`bus::BusFacade`].

/// The bus façade: object paths, signals and method-call requests.
pub mod bus;
/// Per-device objects and the authorization state machine.
pub mod device;
/// The daemon-wide error type.
pub mod error;
/// Pre-shared key material for secure-level authorization.
pub mod key;
/// The reconciliation loop.
pub mod manager;
/// Force-power control for the Thunderbolt controller.
pub mod power;
/// The on-disk enrollment store.
pub mod store;
/// The sysfs probe.
pub mod sysfs;

mod fsio;

pub use error::{Error, Result};
