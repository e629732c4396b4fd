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

//! Read kernel Uevents through netlink
//!

use anyhow::{anyhow, bail, Context, Result};
use kobject_uevent;
use nix::poll;
use nix::sys::socket;
use tokio::io::unix::AsyncFd;

use async_trait::async_trait;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

// udev uses a receive buffer of up to 128M for its own monitor; a hot-plug
// consumer that dequeues promptly gets by with far less. 1MB leaves plenty
// of headroom for event bursts during device tree enumeration.
const UEVENT_BUF_SIZE: usize = 1024 * 1024;

/// The netlink multicast channel a socket subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UEventChannel {
    /// Raw events, straight from the kernel.
    Kernel,
    /// Events processed and re-broadcast by the udev daemon.
    Udev,
}

impl UEventChannel {
    fn group(self) -> u32 {
        match self {
            UEventChannel::Kernel => 0x1,
            UEventChannel::Udev => 0x2,
        }
    }

    /// Channel name, for logging.
    pub fn name(self) -> &'static str {
        match self {
            UEventChannel::Kernel => "kernel",
            UEventChannel::Udev => "udev",
        }
    }
}

fn create_socket(channel: UEventChannel) -> Result<OwnedFd> {
    let addr = socket::NetlinkAddr::new(0, channel.group());
    let s = socket::socket(
        socket::AddressFamily::Netlink,
        socket::SockType::Datagram,
        socket::SockFlag::SOCK_NONBLOCK | socket::SockFlag::SOCK_CLOEXEC,
        socket::SockProtocol::NetlinkKObjectUEvent,
    )?;
    socket::setsockopt(&s, socket::sockopt::RcvBuf, &UEVENT_BUF_SIZE)?;
    socket::setsockopt(&s, socket::sockopt::PassCred, &true)?;
    socket::bind(s.as_raw_fd(), &addr)?;

    Ok(s)
}

/// Blocking socket for listening on KObject Uevents.
pub struct NetlinkUEventSocket {
    fd: OwnedFd,
    channel: UEventChannel,
}

impl NetlinkUEventSocket {
    /// Create a listener on the given uevent netlink channel.
    pub fn create(channel: UEventChannel) -> Result<Self> {
        let fd = create_socket(channel)?;
        Ok(Self { fd, channel })
    }

    /// The channel this socket is subscribed to.
    pub fn channel(&self) -> UEventChannel {
        self.channel
    }

    /// Wait for one or more kernel events to appear on the netlink socket.
    fn wait(&self) -> Result<()> {
        loop {
            let mut fds = [poll::PollFd::new(self.fd.as_fd(), poll::PollFlags::POLLIN)];
            let nr = poll::poll(&mut fds, poll::PollTimeout::NONE)?;
            if nr == 0 {
                continue;
            }
            // Fetch returned event which caused this wakeup.
            let revents = fds[0].revents().context("Invalid revents found")?;
            if revents.contains(poll::PollFlags::POLLIN) {
                break;
            }
        }
        Ok(())
    }

    /// Wait and read one uevent.
    pub fn read(&self) -> Result<kobject_uevent::UEvent> {
        self.wait()?;
        let mut buffer = [0u8; UEVENT_BUF_SIZE];
        let count = socket::recv(self.fd.as_raw_fd(), &mut buffer, socket::MsgFlags::empty())?;
        if count == 0 {
            bail!("Netlink socket recv return 0 bytes");
        }
        kobject_uevent::UEvent::from_netlink_packet(&buffer[0..count]).map_err(|e| anyhow!("{e}"))
    }
}

/// Asynchronous UEvent socket operations.
#[async_trait]
pub trait AsyncUEventSocket: Send + Sync {
    /// Waits for data from the netlink socket and returns the parsed uevent.
    async fn read(&self) -> Result<kobject_uevent::UEvent>;
}

/// Asynchronous implementation of the uevent socket listener.
pub struct AsyncNetlinkUEventSocket {
    afd: AsyncFd<OwnedFd>,
    channel: UEventChannel,
}

impl AsyncNetlinkUEventSocket {
    /// Create an async listener on the given uevent netlink channel.
    pub fn create(channel: UEventChannel) -> Result<Self> {
        let fd = create_socket(channel)?;
        let afd = AsyncFd::new(fd)?;

        Ok(Self { afd, channel })
    }

    /// The channel this socket is subscribed to.
    pub fn channel(&self) -> UEventChannel {
        self.channel
    }
}

#[async_trait]
impl AsyncUEventSocket for AsyncNetlinkUEventSocket {
    /// Waits for data from the netlink socket and returns the parsed uevent.
    async fn read(&self) -> Result<kobject_uevent::UEvent> {
        let mut buffer = [0u8; UEVENT_BUF_SIZE];

        loop {
            let mut guard = self.afd.readable().await?;

            if let Ok(result) = guard.try_io(|inner| {
                Ok(socket::recv(inner.as_raw_fd(), &mut buffer, socket::MsgFlags::empty())?)
            }) {
                let bytes_read = result?;

                if bytes_read == 0 {
                    bail!("Netlink socket read returned 0 bytes");
                }

                return kobject_uevent::UEvent::from_netlink_packet(&buffer[0..bytes_read])
                    .map_err(|e| anyhow!("{e}"));
            }
        }
    }
}
