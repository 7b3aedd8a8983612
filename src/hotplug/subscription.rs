// SPDX-License-Identifier: GPL-3.0-only
use tokio::sync::mpsc;

use crate::error::PlatformError;

/// "The display configuration changed"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyChanged;

/// Forward one notification from an OS thread into the engine channel
///
/// Returns `false` once the receiving side is gone and the watcher thread
/// should stop.
pub(super) fn forward(tx: &mpsc::Sender<TopologyChanged>) -> bool {
    match tx.try_send(TopologyChanged) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            // A queued notification already forces a fresh enumeration
            debug!("Notification channel full, dropping display change event");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            info!("Notification channel closed, stopping display watcher");
            false
        }
    }
}

/// Subscribe to display topology changes
///
/// Spawns a dedicated watcher thread. The returned receiver yields one
/// [`TopologyChanged`] per OS event. Fails if the watcher cannot be set up.
pub fn subscribe(capacity: usize) -> Result<mpsc::Receiver<TopologyChanged>, PlatformError> {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    // Watcher setup happens on its own thread; report the result back here
    let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<(), PlatformError>>(1);

    spawn_watcher(tx, ready_tx)?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(rx),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(PlatformError::Subscription(
            "display watcher thread exited during setup".to_string(),
        )),
    }
}

type Ready = std::sync::mpsc::SyncSender<Result<(), PlatformError>>;

#[cfg(windows)]
fn spawn_watcher(tx: mpsc::Sender<TopologyChanged>, ready: Ready) -> Result<(), PlatformError> {
    std::thread::Builder::new()
        .name("display-change".to_string())
        .spawn(move || super::display_change::run(tx, ready))
        .map(|_| ())
        .map_err(PlatformError::Io)
}

#[cfg(target_os = "linux")]
fn spawn_watcher(tx: mpsc::Sender<TopologyChanged>, ready: Ready) -> Result<(), PlatformError> {
    use super::udev_monitor::DrmMonitor;

    std::thread::Builder::new()
        .name("drm-hotplug".to_string())
        .spawn(move || {
            // MonitorSocket is not Send, so it is created on this thread
            let monitor = match DrmMonitor::new() {
                Ok(monitor) => monitor,
                Err(e) => {
                    let _ = ready.send(Err(PlatformError::Subscription(e.to_string())));
                    return;
                }
            };
            let _ = ready.send(Ok(()));

            let err = monitor.run(&tx);
            if err.kind() != std::io::ErrorKind::Interrupted {
                error!("Display hotplug monitoring stopped: {}", err);
            }
        })
        .map(|_| ())
        .map_err(PlatformError::Io)
}

#[cfg(not(any(windows, target_os = "linux")))]
fn spawn_watcher(_tx: mpsc::Sender<TopologyChanged>, _ready: Ready) -> Result<(), PlatformError> {
    Err(PlatformError::Subscription(
        "display change notifications are not supported on this platform".to_string(),
    ))
}
