// SPDX-License-Identifier: GPL-3.0-only
//! Minimal EDID reading for connector descriptions

/// Size of the EDID base block
const BASE_BLOCK_LEN: usize = 128;

/// Offsets of the four 18-byte display descriptors in the base block
const DESCRIPTOR_OFFSETS: [usize; 4] = [54, 72, 90, 108];

/// Display descriptor tag for the monitor name
const MONITOR_NAME_TAG: u8 = 0xFC;

const EDID_HEADER: [u8; 8] = [0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00];

/// Extract the monitor name from an EDID blob
///
/// Returns `None` for empty or malformed blobs and when no name descriptor
/// is present.
pub fn monitor_name(edid: &[u8]) -> Option<String> {
    if edid.len() < BASE_BLOCK_LEN || edid[..8] != EDID_HEADER {
        return None;
    }

    DESCRIPTOR_OFFSETS.iter().find_map(|&offset| {
        let descriptor = &edid[offset..offset + 18];
        // Display descriptors start with a zero pixel clock
        if descriptor[0..3] != [0, 0, 0] || descriptor[3] != MONITOR_NAME_TAG {
            return None;
        }

        let text = &descriptor[5..18];
        let end = text.iter().position(|&b| b == 0x0A).unwrap_or(text.len());
        let name = String::from_utf8_lossy(&text[..end]).trim().to_string();
        (!name.is_empty()).then_some(name)
    })
}
