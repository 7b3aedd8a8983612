// SPDX-License-Identifier: GPL-3.0-only
//! Access widening for the config artifact
//!
//! The downstream service may run under a different, less privileged
//! account than we do. After every write the artifact is opened up to every
//! local user so the service can read and rewrite it.

use std::path::Path;

use crate::error::PermissionError;

/// Grants broad read/write access to a file
pub trait AccessGrantor {
    /// Idempotent: granting twice has the same effect as granting once
    fn grant_broad_access(&self, path: &Path) -> Result<(), PermissionError>;
}

/// Grantor using the OS's own permission model
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemGrantor;

impl AccessGrantor for SystemGrantor {
    fn grant_broad_access(&self, path: &Path) -> Result<(), PermissionError> {
        #[cfg(windows)]
        {
            grant_everyone_full_control(path)
        }

        #[cfg(unix)]
        {
            grant_world_read_write(path)
        }

        #[cfg(not(any(windows, unix)))]
        {
            Err(PermissionError::Rejected {
                path: path.to_path_buf(),
                reason: "not supported on this platform".to_string(),
            })
        }
    }
}

/// Well-known SID of the "Everyone" group; locale independent unlike the name
#[cfg(windows)]
const EVERYONE_SID: &str = "*S-1-1-0";

#[cfg(windows)]
fn grant_everyone_full_control(path: &Path) -> Result<(), PermissionError> {
    use std::os::windows::process::CommandExt;
    use std::process::Command;

    const CREATE_NO_WINDOW: u32 = 0x0800_0000;

    let output = Command::new("icacls")
        .arg(path)
        .arg("/grant")
        .arg(format!("{EVERYONE_SID}:F"))
        .creation_flags(CREATE_NO_WINDOW)
        .output()
        .map_err(|source| PermissionError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let reason = if stderr.trim().is_empty() { stdout } else { stderr };
        return Err(PermissionError::Rejected {
            path: path.to_path_buf(),
            reason: reason.trim().to_string(),
        });
    }

    info!(path = %path.display(), "Granted Everyone full control");
    Ok(())
}

#[cfg(unix)]
const WORLD_READ_WRITE: u32 = 0o666;

#[cfg(unix)]
fn grant_world_read_write(path: &Path) -> Result<(), PermissionError> {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    let io_err = |source| PermissionError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut permissions = fs::metadata(path).map_err(io_err)?.permissions();
    let mode = permissions.mode();
    let wanted = mode | WORLD_READ_WRITE;

    if mode == wanted {
        debug!(path = %path.display(), "Permissions already open ({:o})", mode & 0o7777);
        return Ok(());
    }

    permissions.set_mode(wanted);
    fs::set_permissions(path, permissions).map_err(io_err)?;
    info!(path = %path.display(), "Permissions changed to {:o}", wanted & 0o7777);
    Ok(())
}
