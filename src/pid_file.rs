// SPDX-License-Identifier: Apache-2.0

//! PID file handling.

use std::io;
use std::path::Path;

use tracing::{error, info};

/// Write the agent's process ID to the given location.
pub fn write_pid_file(path: impl AsRef<Path>) -> io::Result<()> {
    let path = path.as_ref();
    let pid = std::process::id().to_string();

    if let Err(e) = std::fs::write(path, &pid) {
        error!(path = %path.display(), error = %e, "Failed to write PID file");
        return Err(e);
    }

    info!(path = %path.display(), "PID file written");
    Ok(())
}

/// Delete the PID file on clean exit.
pub fn remove_pid_file(path: impl AsRef<Path>) -> io::Result<()> {
    let path = path.as_ref();
    if let Err(e) = std::fs::remove_file(path) {
        error!(path = %path.display(), error = %e, "Unable to remove PID file");
        return Err(e);
    }
    Ok(())
}
