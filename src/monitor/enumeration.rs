// SPDX-License-Identifier: GPL-3.0-only
//! Display device enumeration backed by the running OS
//!
//! - Windows: `EnumDisplayDevicesW` over all display adapters
//! - Linux: connected DRM connectors under `/sys/class/drm`

use crate::error::PlatformError;

use super::backend::{DeviceRecord, DisplayPlatform};

/// Enumerates the display devices of the machine we are running on
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDisplays;

impl DisplayPlatform for SystemDisplays {
    fn enumerate_display_devices(&self) -> Result<Vec<DeviceRecord>, PlatformError> {
        #[cfg(windows)]
        {
            Ok(win32::enumerate_adapters())
        }

        #[cfg(target_os = "linux")]
        {
            drm::enumerate_connectors(std::path::Path::new(drm::DRM_CLASS_DIR))
        }

        #[cfg(not(any(windows, target_os = "linux")))]
        {
            Err(PlatformError::Enumeration(
                "display enumeration is not supported on this platform".to_string(),
            ))
        }
    }
}

#[cfg(windows)]
mod win32 {
    use windows_sys::Win32::Graphics::Gdi::{DISPLAY_DEVICEW, EnumDisplayDevicesW};

    use super::DeviceRecord;

    /// Ask for identifiers in interface-name form
    const EDD_GET_DEVICE_INTERFACE_NAME: u32 = 0x0000_0001;

    fn wide_to_string(buf: &[u16]) -> String {
        let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
        String::from_utf16_lossy(&buf[..len])
    }

    pub fn enumerate_adapters() -> Vec<DeviceRecord> {
        let mut records = Vec::new();
        let mut index = 0u32;

        loop {
            // SAFETY: DISPLAY_DEVICEW is plain data; all-zero is a valid value
            let mut device: DISPLAY_DEVICEW = unsafe { std::mem::zeroed() };
            device.cb = std::mem::size_of::<DISPLAY_DEVICEW>() as u32;

            // SAFETY: `device` is a properly sized, writable DISPLAY_DEVICEW
            let ok = unsafe {
                EnumDisplayDevicesW(
                    std::ptr::null(),
                    index,
                    &mut device,
                    EDD_GET_DEVICE_INTERFACE_NAME,
                )
            };
            if ok == 0 {
                break;
            }

            records.push(DeviceRecord::new(
                wide_to_string(&device.DeviceString),
                wide_to_string(&device.DeviceName),
                index,
            ));
            index += 1;
        }

        records
    }
}

#[cfg(target_os = "linux")]
mod drm {
    use std::fs;
    use std::path::Path;

    use crate::error::PlatformError;
    use crate::monitor::edid;

    use super::DeviceRecord;

    pub const DRM_CLASS_DIR: &str = "/sys/class/drm";

    /// Connector directories look like `card0-HDMI-A-1`
    fn connector_name(entry: &str) -> Option<&str> {
        let rest = entry.strip_prefix("card")?;
        let (card, connector) = rest.split_once('-')?;
        (!card.is_empty() && card.bytes().all(|b| b.is_ascii_digit()) && !connector.is_empty())
            .then_some(connector)
    }

    pub fn enumerate_connectors(root: &Path) -> Result<Vec<DeviceRecord>, PlatformError> {
        let mut entries: Vec<String> = fs::read_dir(root)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| connector_name(name).is_some())
            .collect();
        // read_dir order is arbitrary; keep enumeration order stable across calls
        entries.sort();

        let mut records = Vec::new();
        for entry in entries {
            let Some(connector) = connector_name(&entry) else {
                continue;
            };
            let dir = root.join(&entry);

            let status = fs::read_to_string(dir.join("status")).unwrap_or_default();
            if status.trim() != "connected" {
                continue;
            }

            let description = fs::read(dir.join("edid"))
                .ok()
                .and_then(|blob| edid::monitor_name(&blob))
                .unwrap_or_else(|| connector.to_string());

            let index = records.len() as u32;
            records.push(DeviceRecord::new(description, connector, index));
        }

        Ok(records)
    }

}
