//! Error types for sandbox operations.

use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for building and running sandboxed commands.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Invalid caller-supplied configuration (empty program name, empty
    /// mount path, and similar).
    #[error("sandbox configuration error: {0}")]
    Config(String),

    /// Failed to resolve a path to canonical form, or the path does not
    /// exist on the host.
    #[error("failed to resolve path '{path}': {source}")]
    PathResolution {
        /// The path that could not be resolved.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The host launcher binary is not installed.
    #[error("sandbox launcher '{0}' not found")]
    LauncherMissing(&'static str),

    /// Failed to create the per-launch temp directory.
    #[error("failed to create temp directory: {0}")]
    TempSetup(#[source] std::io::Error),

    /// Failed to read the current working directory while defaulting an
    /// unset `work_dir`.
    #[error("failed to read current directory: {0}")]
    Workdir(#[source] std::io::Error),

    /// The launch was cancelled before the child was spawned.
    #[error("launch cancelled")]
    Cancelled,

    /// Failed to spawn the launcher process.
    #[error("failed to spawn sandbox: {0}")]
    Spawn(#[source] std::io::Error),

    /// Failed to wait for the sandboxed child.
    #[error("failed to wait for sandbox process: {0}")]
    Wait(#[source] std::io::Error),

    /// Failed to send a signal to the sandboxed child.
    #[error("failed to signal sandbox process: {0}")]
    Signal(#[source] nix::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_resolution_display_includes_path() {
        let err = SandboxError::PathResolution {
            path: PathBuf::from("/no/such/mount"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/no/such/mount"));
    }

    #[test]
    fn launcher_missing_display() {
        let err = SandboxError::LauncherMissing("bwrap");
        assert!(err.to_string().contains("bwrap"));
    }
}
