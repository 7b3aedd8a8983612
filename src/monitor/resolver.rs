// SPDX-License-Identifier: GPL-3.0-only
//! Target adapter lookup

use crate::error::PlatformError;

use super::backend::{DeviceRecord, DisplayPlatform, TargetDescriptor};

/// Pick the target adapter out of an enumeration
///
/// When several devices carry the target description the last one in
/// enumeration order wins.
pub fn select_target(records: Vec<DeviceRecord>, target: &TargetDescriptor) -> Option<DeviceRecord> {
    records
        .into_iter()
        .rfind(|record| target.matches(&record.description))
}

/// Enumerate display devices and return the current record of the target
///
/// `Ok(None)` means the adapter is not present right now.
pub fn resolve<P>(platform: &P, target: &TargetDescriptor) -> Result<Option<DeviceRecord>, PlatformError>
where
    P: DisplayPlatform + ?Sized,
{
    let records = platform.enumerate_display_devices()?;
    debug!("Enumerated {} display device(s)", records.len());

    for record in &records {
        trace!(
            index = record.sequence_index,
            description = %record.description,
            identifier = %record.identifier,
            "Display device"
        );
    }

    let found = select_target(records, target);
    match &found {
        Some(record) => debug!(identifier = %record.identifier, "Resolved {}", target),
        None => debug!("{} is not present", target),
    }
    Ok(found)
}
