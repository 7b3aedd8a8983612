// SPDX-License-Identifier: GPL-3.0-only
use crate::error::PlatformError;

/// OS-assigned name of a display device, e.g. `\\.\DISPLAY5`
pub type DisplayId = String;

/// One entry of a display enumeration
///
/// Produced fresh by every call to [`DisplayPlatform::enumerate_display_devices`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    /// Human-readable description, e.g. "IddSampleDriver Device"
    pub description: String,
    /// Identifier the OS currently assigns to the device
    pub identifier: DisplayId,
    /// Position of the device in enumeration order
    pub sequence_index: u32,
}

impl DeviceRecord {
    pub fn new(description: impl Into<String>, identifier: impl Into<String>, sequence_index: u32) -> Self {
        Self {
            description: description.into(),
            identifier: identifier.into(),
            sequence_index,
        }
    }
}

/// The description of the adapter we track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    description: String,
}

impl TargetDescriptor {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
        }
    }

    /// Case-insensitive comparison against an enumerated description
    pub fn matches(&self, description: &str) -> bool {
        // Device descriptions may carry non-ASCII vendor names
        self.description.to_lowercase() == description.to_lowercase()
    }
}

impl std::fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.description)
    }
}

/// Source of display device enumerations
pub trait DisplayPlatform {
    /// Enumerate all display devices currently known to the OS
    fn enumerate_display_devices(&self) -> Result<Vec<DeviceRecord>, PlatformError>;
}
