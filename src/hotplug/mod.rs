// SPDX-License-Identifier: GPL-3.0-only
//! Display topology-change notifications
//!
//! OS notifications are received on a dedicated thread and forwarded into a
//! bounded tokio channel consumed by the reconciliation engine. The
//! notification carries no payload: it only says that something about the
//! display configuration changed.

#[cfg(windows)]
mod display_change;
mod subscription;
#[cfg(target_os = "linux")]
mod udev_monitor;

pub use subscription::{TopologyChanged, subscribe};
