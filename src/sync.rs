// SPDX-License-Identifier: GPL-3.0-only
//! Config artifact synchronization
//!
//! The downstream service reads a line-oriented `key = value` file. We only
//! ever own one key in it; every other line is kept byte-for-byte and in
//! its original order.

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::SyncError;

/// Key the downstream service reads the display identifier from
pub const OUTPUT_NAME_KEY: &str = "output_name";

/// A `key = value` text file held as ordered lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDocument {
    lines: Vec<String>,
    line_ending: &'static str,
    /// The text started with a UTF-8 byte order mark
    bom: bool,
}

const BOM: char = '\u{feff}';

/// The key of a `key = value` line, if it has one
fn line_key(line: &str) -> Option<&str> {
    line.split_once('=').map(|(key, _)| key.trim())
}

impl ConfigDocument {
    pub fn parse(content: &str) -> Self {
        let (bom, content) = match content.strip_prefix(BOM) {
            Some(rest) => (true, rest),
            None => (false, content),
        };
        let line_ending = if content.contains("\r\n") { "\r\n" } else { "\n" };
        let lines = content
            .lines()
            .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
            .collect();

        Self {
            lines,
            line_ending,
            bom,
        }
    }

    /// Current value of `key`, taken from its first occurrence
    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            let (k, value) = line.split_once('=')?;
            (k.trim() == key).then(|| value.trim())
        })
    }

    /// Set `key` to `value`
    ///
    /// The first line carrying `key` is rewritten in place and any later
    /// duplicates are dropped. Without such a line, `key = value` is
    /// appended at the end.
    pub fn set(&mut self, key: &str, value: &str) {
        let replacement = format!("{key} = {value}");
        let mut found = false;

        self.lines.retain_mut(|line| {
            if line_key(line) != Some(key) {
                return true;
            }
            if found {
                return false;
            }
            found = true;
            *line = replacement.clone();
            true
        });

        if !found {
            self.lines.push(replacement);
        }
    }

    /// Render back to text; always ends with a line ending
    ///
    /// A byte order mark present when parsing is written back.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.bom {
            out.push(BOM);
        }
        for line in &self.lines {
            out.push_str(line);
            out.push_str(self.line_ending);
        }
        out
    }
}

fn read_document(path: &Path) -> Result<(String, ConfigDocument), SyncError> {
    let content = fs::read_to_string(path).map_err(|source| SyncError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let document = ConfigDocument::parse(&content);
    Ok((content, document))
}

/// Replace `path` with `content` by writing a sibling temp file and renaming it over
///
/// The temp file takes over the current file's permissions before the
/// rename. On Windows that only covers the read-only flag; the temp file
/// gets the directory's inherited ACL, and the grant that follows every
/// write restores access for everyone.
fn write_atomically(path: &Path, content: &str) -> Result<(), SyncError> {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    let write_err = |source| SyncError::Write {
        path: path.to_path_buf(),
        source,
    };

    let permissions = fs::metadata(path).map_err(write_err)?.permissions();

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(content.as_bytes()).map_err(write_err)?;
    tmp.as_file().set_permissions(permissions).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;

    Ok(())
}

/// Set `key = value` in the config file at `path`
///
/// The file must exist. Running this twice with the same value leaves the
/// file byte-identical to running it once.
pub fn set_key(path: &Path, key: &str, value: &str) -> Result<(), SyncError> {
    let (original, mut document) = read_document(path)?;
    document.set(key, value);
    let updated = document.render();

    if updated == original {
        debug!(path = %path.display(), "{} already set to {}", key, value);
        return Ok(());
    }

    write_atomically(path, &updated)?;
    info!(path = %path.display(), "Set {} = {}", key, value);
    Ok(())
}

/// Read the current value of `key` from the config file at `path`
pub fn get_key(path: &Path, key: &str) -> Result<Option<String>, SyncError> {
    let (_, document) = read_document(path)?;
    Ok(document.get(key).map(str::to_string))
}
