// SPDX-License-Identifier: GPL-3.0-only
use std::os::fd::AsRawFd;

use tokio::sync::mpsc;

use super::subscription::{TopologyChanged, forward};

/// How long a single poll waits before checking whether anyone still listens
const POLL_TIMEOUT_MS: libc::c_int = 1000;

/// Watches udev for DRM connector changes
///
/// Lives on a dedicated thread because udev's MonitorSocket is not Send.
pub struct DrmMonitor {
    socket: udev::MonitorSocket,
}

impl DrmMonitor {
    /// Listen on the DRM subsystem; connector hotplug shows up as a
    /// `change` event on the card's `drm_minor` device.
    pub fn new() -> Result<Self, std::io::Error> {
        let socket = udev::MonitorBuilder::new()?
            .match_subsystem_devtype("drm", "drm_minor")?
            .listen()?;

        Ok(Self { socket })
    }

    /// Forward events until the channel closes or polling fails
    ///
    /// Returns the error that ended the loop; `Interrupted` means the
    /// receiver went away.
    pub fn run(self, tx: &mpsc::Sender<TopologyChanged>) -> std::io::Error {
        info!("Display hotplug monitoring started (drm subsystem)");

        let fd = self.socket.as_raw_fd();

        loop {
            let mut poll_fd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };

            // SAFETY: poll_fd is a single valid pollfd for the lifetime of the call
            let poll_result = unsafe { libc::poll(&mut poll_fd, 1, POLL_TIMEOUT_MS) };

            if poll_result < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return err;
            }

            if poll_result == 0 {
                if tx.is_closed() {
                    return std::io::Error::new(std::io::ErrorKind::Interrupted, "receiver dropped");
                }
                continue;
            }

            for event in self.socket.iter() {
                match event.event_type() {
                    udev::EventType::Add | udev::EventType::Remove | udev::EventType::Change => {
                        debug!(
                            "udev event: type={:?}, syspath={:?}",
                            event.event_type(),
                            event.syspath()
                        );
                        if !forward(tx) {
                            return std::io::Error::new(
                                std::io::ErrorKind::Interrupted,
                                "receiver dropped",
                            );
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}
