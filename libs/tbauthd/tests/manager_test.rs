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

mod common;

use common::MockSysfs;

use std::path::PathBuf;

use async_trait::async_trait;
use kobject_uevent::ActionType;
use tempfile::TempDir;

use tbauthd::bus::{self, BusHandle, Signal};
use tbauthd::device::{KeyState, Policy, Security, Status};
use tbauthd::error::Error;
use tbauthd::key::Key;
use tbauthd::manager::{EventSource, HotplugEvent, Manager};
use tbauthd::store::{Record, Store};

fn record(uid: &str, policy: Policy, security: Security) -> Record {
    Record {
        uid: uid.to_string(),
        name: "Dock".to_string(),
        vendor: "GNOME.org".to_string(),
        policy,
        ctime: 574416000,
        security,
        generation: 3,
    }
}

/// A domain with a (firmware-authorized) host device, a store directory
/// and a started manager.
fn setup(security: &str) -> (MockSysfs, TempDir, PathBuf, Manager, BusHandle) {
    let mock = MockSysfs::new();
    let db = TempDir::new().unwrap();
    let domain = mock.add_domain("domain0", security);
    let host = mock.add_device(&domain, "0-0", "host0", "1");

    let (mgr, mut handle) = start_manager(&mock, &db);
    // the host's own added signal is not interesting to the scenarios
    while handle.try_signal().is_some() {}
    (mock, db, host, mgr, handle)
}

fn start_manager(mock: &MockSysfs, db: &TempDir) -> (Manager, BusHandle) {
    let (facade, handle) = bus::channel();
    let store = Store::new(db.path()).unwrap();
    let mut mgr = Manager::new(mock.sysfs(), store, facade);
    mgr.start().unwrap();
    (mgr, handle)
}

fn add_event(mock: &MockSysfs, node: &PathBuf) -> HotplugEvent {
    HotplugEvent::new(ActionType::Add, mock.devpath(node))
}

// S1: a first-seen device on a user-security domain waits for the user.
#[test]
fn first_seen_device_waits_for_user() {
    let (mock, _db, host, mut mgr, mut handle) = setup("user");
    let node = mock.add_device(&host, "0-1", "u1", "0");

    mgr.handle_event(&add_event(&mock, &node));
    mgr.process_pending();

    let dev = mgr.device_by_uid("u1").expect("device present");
    assert_eq!(dev.status(), Status::Connected);
    assert_eq!(dev.policy(), Policy::Default);
    assert_eq!(dev.security(), Security::User);
    assert!(!dev.stored());

    // nobody touched the authorize attribute
    assert_eq!(mock.attr(&node, "authorized"), "0");

    assert_eq!(
        handle.try_signal(),
        Some(Signal::DeviceAdded { path: bus::device_object_path("u1") })
    );
    assert_eq!(handle.try_signal(), None);
}

// Property 5: applying the same add event twice changes nothing.
#[test]
fn duplicate_add_events_are_idempotent() {
    let (mock, _db, host, mut mgr, mut handle) = setup("user");
    let node = mock.add_device(&host, "0-1", "u1", "0");
    let ev = add_event(&mock, &node);

    mgr.handle_event(&ev);
    mgr.process_pending();
    let count = mgr.devices().len();
    assert_eq!(handle.try_signal(), Some(Signal::DeviceAdded { path: bus::device_object_path("u1") }));

    mgr.handle_event(&ev);
    mgr.process_pending();

    assert_eq!(mgr.devices().len(), count);
    assert_eq!(mgr.device_by_uid("u1").unwrap().status(), Status::Connected);
    assert_eq!(handle.try_signal(), None);
}

// S2: enrollment authorizes right away, and reconnecting an enrolled
// device re-authorizes it without user action.
#[test]
fn enroll_then_reconnect_autoauthorizes() {
    let (mock, db, host, mut mgr, _handle) = setup("user");
    let node = mock.add_device(&host, "0-1", "u1", "0");
    mgr.handle_event(&add_event(&mock, &node));
    mgr.process_pending();

    mgr.enroll("u1", Policy::Auto).unwrap();

    let dev = mgr.device_by_uid("u1").unwrap();
    assert!(dev.stored());
    assert_eq!(dev.status(), Status::Authorized);
    assert_eq!(mock.attr(&node, "authorized"), "1");

    let store = Store::new(db.path()).unwrap();
    assert_eq!(store.get("u1").unwrap().policy, Policy::Auto);

    // unplug: the device stays around because it is enrolled
    let devpath = mock.devpath(&node);
    mock.unplug("0-1", &node);
    mgr.handle_event(&HotplugEvent::new(ActionType::Remove, devpath));

    let dev = mgr.device_by_uid("u1").expect("stored device retained");
    assert_eq!(dev.status(), Status::Disconnected);
    assert_eq!(dev.syspath(), None);
    assert!(dev.stored());
    assert_eq!(dev.policy(), Policy::Auto);

    // replug: connected briefly, then authorized from the queue
    let node = mock.add_device(&host, "0-1", "u1", "0");
    mgr.handle_event(&add_event(&mock, &node));
    assert_eq!(mgr.device_by_uid("u1").unwrap().status(), Status::Connected);

    mgr.process_pending();
    assert_eq!(mgr.device_by_uid("u1").unwrap().status(), Status::Authorized);
    assert_eq!(mock.attr(&node, "authorized"), "1");
}

// S3: a stored key means challenge-verify ("2"), no new key material.
#[test]
fn secure_reauth_challenges_with_stored_key() {
    let mock = MockSysfs::new();
    let db = TempDir::new().unwrap();
    let domain = mock.add_domain("domain0", "secure");
    let host = mock.add_device(&domain, "0-0", "host0", "1");

    let key = Key::generate();
    {
        let store = Store::new(db.path()).unwrap();
        store.put(&record("u2", Policy::Auto, Security::Secure)).unwrap();
        store.put_key("u2", &key).unwrap();
    }

    let (mut mgr, _handle) = start_manager(&mock, &db);
    let dev = mgr.device_by_uid("u2").expect("loaded from store");
    assert_eq!(dev.status(), Status::Disconnected);
    assert_eq!(dev.keystate(), KeyState::Stored);

    let node = mock.add_device(&host, "0-1", "u2", "0");
    mgr.handle_event(&add_event(&mock, &node));
    mgr.process_pending();

    let dev = mgr.device_by_uid("u2").unwrap();
    assert_eq!(dev.status(), Status::AuthorizedSecure);
    assert_eq!(dev.keystate(), KeyState::Stored);

    // challenge write, with the stored key and no fresh one
    assert_eq!(mock.attr(&node, "authorized"), "2");
    assert_eq!(mock.attr(&node, "key"), key.to_hex());

    let store = Store::new(db.path()).unwrap();
    assert_eq!(store.load_key("u2").unwrap(), key);
}

// S4: first-time enrollment on a secure domain provisions a key.
#[test]
fn secure_first_enrollment_provisions_key() {
    let (mock, db, host, mut mgr, _handle) = setup("secure");
    let node = mock.add_device(&host, "0-1", "u4", "0");
    mgr.handle_event(&add_event(&mock, &node));
    mgr.process_pending();
    assert_eq!(mgr.device_by_uid("u4").unwrap().status(), Status::Connected);

    mgr.enroll("u4", Policy::Auto).unwrap();

    let dev = mgr.device_by_uid("u4").unwrap();
    assert_eq!(dev.status(), Status::AuthorizedSecure);
    assert_eq!(dev.keystate(), KeyState::Stored);

    let written = mock.attr(&node, "key");
    assert_eq!(written.len(), 64);
    assert_eq!(mock.attr(&node, "authorized"), "1");

    let store = Store::new(db.path()).unwrap();
    assert!(store.has_key("u4"));
    assert_eq!(store.load_key("u4").unwrap().to_hex(), written);
}

// S5 and properties 3/4: a child is only authorized once its parent is,
// and no authorize write happens before that.
#[test]
fn cascading_authorization_waits_for_parent() {
    let mock = MockSysfs::new();
    let db = TempDir::new().unwrap();
    let domain = mock.add_domain("domain0", "user");
    let host = mock.add_device(&domain, "0-0", "host0", "1");

    {
        let store = Store::new(db.path()).unwrap();
        store.put(&record("p1", Policy::Auto, Security::User)).unwrap();
        store.put(&record("c1", Policy::Auto, Security::User)).unwrap();
    }

    let (mut mgr, _handle) = start_manager(&mock, &db);

    let pnode = mock.add_device(&host, "0-1", "p1", "0");
    mgr.handle_event(&add_event(&mock, &pnode));

    let cnode = mock.add_device(&pnode, "0-3", "c1", "0");
    mgr.handle_event(&add_event(&mock, &cnode));

    mgr.process_pending();

    // the parent is authorized, the child was never eligible
    assert_eq!(mgr.device_by_uid("p1").unwrap().status(), Status::Authorized);
    assert_eq!(mock.attr(&pnode, "authorized"), "1");
    assert_eq!(mgr.device_by_uid("c1").unwrap().status(), Status::Connected);
    assert_eq!(mock.attr(&cnode, "authorized"), "0");

    // the kernel reports the parent's change; now the child cascades
    mgr.handle_event(&HotplugEvent::new(ActionType::Change, mock.devpath(&pnode)));
    mgr.process_pending();

    assert_eq!(mgr.device_by_uid("c1").unwrap().status(), Status::Authorized);
    assert_eq!(mock.attr(&cnode, "authorized"), "1");
}

// S6: forgetting an unplugged device removes it everywhere.
#[test]
fn forget_unplugged_device() {
    let mock = MockSysfs::new();
    let db = TempDir::new().unwrap();
    mock.add_domain("domain0", "user");

    {
        let store = Store::new(db.path()).unwrap();
        store.put(&record("u3", Policy::Auto, Security::User)).unwrap();
    }

    let (mut mgr, mut handle) = start_manager(&mock, &db);
    assert_eq!(mgr.device_by_uid("u3").unwrap().status(), Status::Disconnected);
    assert_eq!(handle.try_signal(), None);

    mgr.forget("u3").unwrap();

    assert!(mgr.device_by_uid("u3").is_none());
    let store = Store::new(db.path()).unwrap();
    assert!(!store.contains("u3"));
    assert!(!store.has_key("u3"));

    assert_eq!(
        handle.try_signal(),
        Some(Signal::DeviceRemoved { path: bus::device_object_path("u3") })
    );
}

// A device that was never enrolled is evicted on unplug.
#[test]
fn unenrolled_device_is_evicted_on_remove() {
    let (mock, _db, host, mut mgr, mut handle) = setup("user");
    let node = mock.add_device(&host, "0-1", "u1", "0");
    mgr.handle_event(&add_event(&mock, &node));
    let _ = handle.try_signal();

    let devpath = mock.devpath(&node);
    mock.unplug("0-1", &node);
    mgr.handle_event(&HotplugEvent::new(ActionType::Remove, devpath));

    assert!(mgr.device_by_uid("u1").is_none());
    assert_eq!(
        handle.try_signal(),
        Some(Signal::DeviceRemoved { path: bus::device_object_path("u1") })
    );
}

#[test]
fn caller_facing_validation() {
    let (mock, _db, host, mut mgr, _handle) = setup("user");

    assert!(mgr.enroll("ghost", Policy::Auto).unwrap_err().is_notfound());
    assert!(mgr.forget("ghost").unwrap_err().is_notfound());
    assert!(mgr.authorize_device("ghost").unwrap_err().is_notfound());

    let node = mock.add_device(&host, "0-1", "u1", "0");
    mgr.handle_event(&add_event(&mock, &node));
    mgr.enroll("u1", Policy::Auto).unwrap();

    // already authorized
    let err = mgr.authorize_device("u1").unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)), "unexpected error: {err}");

    // disconnected devices cannot be authorized
    let devpath = mock.devpath(&node);
    mock.unplug("0-1", &node);
    mgr.handle_event(&HotplugEvent::new(ActionType::Remove, devpath));
    let err = mgr.authorize_device("u1").unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)), "unexpected error: {err}");
}

/// An event source that never yields; stands in for a quiet socket.
struct PendingSource;

#[async_trait]
impl EventSource for PendingSource {
    async fn next_event(&mut self) -> tbauthd::Result<HotplugEvent> {
        std::future::pending().await
    }
}

// Method calls travel through the bus façade into the running loop.
#[tokio::test]
async fn bus_requests_reach_the_manager() {
    let mock = MockSysfs::new();
    let db = TempDir::new().unwrap();
    let domain = mock.add_domain("domain0", "user");
    let host = mock.add_device(&domain, "0-0", "host0", "1");
    let node = mock.add_device(&host, "0-1", "u1", "0");

    let (mgr, mut handle) = start_manager(&mock, &db);
    let loop_task = tokio::spawn(mgr.run(PendingSource, PendingSource));

    let mut paths = handle.list_devices().await.unwrap();
    paths.sort();
    assert_eq!(
        paths,
        vec![bus::device_object_path("host0"), bus::device_object_path("u1")]
    );

    handle.enroll("u1", Policy::Auto).await.unwrap();
    assert_eq!(mock.attr(&node, "authorized"), "1");

    let err = handle.authorize("u1").await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)), "unexpected error: {err}");

    handle.forget("u1").await.unwrap();
    let store = Store::new(db.path()).unwrap();
    assert!(!store.contains("u1"));

    loop_task.abort();
}
