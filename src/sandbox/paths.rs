//! Path canonicalization and mount deduplication.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::error::SandboxError;
use super::policy::MountMode;

/// Resolve a path to its canonical form by evaluating all symlinks.
///
/// Both platforms need this for consistent comparison keys, and the Seatbelt
/// evaluator matches on post-symlink paths (`/var` is `/private/var` on
/// macOS; `/bin` is `/usr/bin` on usr-merged Linux distributions). A policy
/// parameter of `/var` would never match a write to `/private/var/tmp/foo`
/// without it.
///
/// Canonicalization happens in the trusted parent before sandboxing, on
/// paths taken from the `Policy` value, so it cannot be raced by the child.
pub fn canonical_path(path: &Path) -> Result<PathBuf, SandboxError> {
    if path.as_os_str().is_empty() {
        return Err(SandboxError::Config("empty path".to_string()));
    }
    std::fs::canonicalize(path).map_err(|source| SandboxError::PathResolution {
        path: path.to_path_buf(),
        source,
    })
}

/// Tracks mounted paths to prevent duplicate `(mode, target)` entries.
///
/// Insertion order is preserved in a parallel target list so that generated
/// launcher commands are stable.
#[derive(Debug, Default)]
pub struct MountSet {
    entries: HashSet<(MountMode, PathBuf)>,
    targets: Vec<PathBuf>,
}

impl MountSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a `(mode, target)` pair is already present.
    pub fn has(&self, mode: MountMode, target: &Path) -> bool {
        self.entries.contains(&(mode, target.to_path_buf()))
    }

    /// Record a `(mode, target)` pair. Returns `false` if it was already
    /// present (the insert is a no-op).
    pub fn insert(&mut self, mode: MountMode, target: &Path) -> bool {
        if !self.entries.insert((mode, target.to_path_buf())) {
            return false;
        }
        self.targets.push(target.to_path_buf());
        true
    }

    /// Targets in insertion order.
    pub fn targets(&self) -> &[PathBuf] {
        &self.targets
    }

    /// Number of distinct entries.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_path_rejects_empty() {
        let err = canonical_path(Path::new("")).unwrap_err();
        assert!(matches!(err, SandboxError::Config(_)));
    }

    #[test]
    fn canonical_path_fails_for_missing_source() {
        let err = canonical_path(Path::new("/nonexistent-nestbox-test-path")).unwrap_err();
        assert!(matches!(err, SandboxError::PathResolution { .. }));
    }

    #[test]
    fn canonical_path_resolves_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        std::fs::create_dir(&real).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let resolved = canonical_path(&link).unwrap();
        assert_eq!(resolved, canonical_path(&real).unwrap());
        assert!(!resolved.ends_with("link"));
    }

    #[test]
    fn mount_set_dedups_by_mode_and_target() {
        let mut set = MountSet::new();
        assert!(set.insert(MountMode::ReadOnly, Path::new("/usr")));
        assert!(!set.insert(MountMode::ReadOnly, Path::new("/usr")));
        // Same target, different mode is a distinct entry.
        assert!(set.insert(MountMode::ReadWrite, Path::new("/usr")));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn mount_set_preserves_insertion_order() {
        let mut set = MountSet::new();
        set.insert(MountMode::ReadOnly, Path::new("/b"));
        set.insert(MountMode::ReadOnly, Path::new("/a"));
        set.insert(MountMode::ReadOnly, Path::new("/c"));
        set.insert(MountMode::ReadOnly, Path::new("/a"));
        let targets: Vec<_> = set.targets().iter().map(|p| p.display().to_string()).collect();
        assert_eq!(targets, vec!["/b", "/a", "/c"]);
    }
}
