// SPDX-License-Identifier: GPL-3.0-only
mod backend;
#[cfg(target_os = "linux")]
mod edid;
mod enumeration;
mod resolver;

pub use backend::{DeviceRecord, DisplayId, DisplayPlatform, TargetDescriptor};
pub use enumeration::SystemDisplays;
pub use resolver::resolve;
