//! Per-launch plan materialization shared by both launchers.
//!
//! A [`LaunchPlan`] is the immutable, fully canonicalized record a launcher
//! translates into its host mechanism: bubblewrap argument vectors on Linux,
//! an SBPL profile plus parameter bindings on macOS. Materializing it deep-
//! copies everything out of the [`Policy`], so concurrent launches sharing a
//! policy never observe each other.

use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use super::error::SandboxError;
use super::paths::canonical_path;
use super::policy::{Mount, MountMode, NetworkMode, Policy};

/// A mount whose source and target have been canonicalized and whose source
/// is known to exist on the host.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedMount {
    pub mode: MountMode,
    pub source: PathBuf,
    pub target: PathBuf,
}

/// Derived immutable record of everything one launch needs.
#[derive(Debug)]
pub(crate) struct LaunchPlan {
    /// Canonicalized mounts, caller order preserved: read-only first, then
    /// read-write. Deduplication happens at emission time via `MountSet`.
    pub mounts: Vec<ResolvedMount>,
    /// Canonicalized working directory (policy's, or the parent's current
    /// directory when unset).
    pub work_dir: PathBuf,
    pub provide_tmp: bool,
    pub network_mode: NetworkMode,
    pub allow_shared_namespaces: bool,
    pub allow_parent_survival: bool,
    pub allow_session_control: bool,
    pub program: OsString,
    pub args: Vec<String>,
    pub cancel: CancellationToken,
}

impl LaunchPlan {
    /// Canonicalize and deep-copy a policy into a plan.
    ///
    /// Cancellation is checked between canonicalization passes; a cancelled
    /// token aborts with [`SandboxError::Cancelled`] before any filesystem
    /// work for the remaining mounts happens.
    pub fn materialize(
        policy: &Policy,
        program: &OsStr,
        args: &[String],
        cancel: CancellationToken,
    ) -> Result<Self, SandboxError> {
        let mut mounts =
            Vec::with_capacity(policy.read_only_mounts.len() + policy.read_write_mounts.len());

        resolve_mounts(&policy.read_only_mounts, MountMode::ReadOnly, &cancel, &mut mounts)?;
        resolve_mounts(&policy.read_write_mounts, MountMode::ReadWrite, &cancel, &mut mounts)?;

        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }

        let work_dir = match &policy.work_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().map_err(SandboxError::Workdir)?,
        };
        let work_dir = canonical_path(&work_dir)?;

        Ok(Self {
            mounts,
            work_dir,
            provide_tmp: policy.provide_tmp,
            network_mode: policy.network_mode,
            allow_shared_namespaces: policy.allow_shared_namespaces,
            allow_parent_survival: policy.allow_parent_survival,
            allow_session_control: policy.allow_session_control,
            program: program.to_os_string(),
            args: args.to_vec(),
            cancel,
        })
    }
}

fn resolve_mounts(
    mounts: &[Mount],
    mode: MountMode,
    cancel: &CancellationToken,
    out: &mut Vec<ResolvedMount>,
) -> Result<(), SandboxError> {
    for mount in mounts {
        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }
        out.push(ResolvedMount {
            mode,
            source: canonical_path(&mount.source)?,
            target: canonical_path(&mount.target)?,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn plan_for(policy: &Policy) -> Result<LaunchPlan, SandboxError> {
        LaunchPlan::materialize(
            policy,
            OsStr::new("true"),
            &[],
            CancellationToken::new(),
        )
    }

    #[test]
    fn missing_mount_source_fails_at_plan_time() {
        let mut policy = Policy::default();
        policy
            .read_only_mounts
            .push(Mount::same("/nonexistent-nestbox-plan-test"));
        let err = plan_for(&policy).unwrap_err();
        assert!(matches!(err, SandboxError::PathResolution { .. }));
    }

    #[test]
    fn work_dir_defaults_to_current_dir() {
        let policy = Policy::default();
        let plan = plan_for(&policy).unwrap();
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(plan.work_dir, canonical_path(&cwd).unwrap());
    }

    #[test]
    fn mounts_keep_caller_order_readonly_first() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::create_dir(&a).unwrap();
        std::fs::create_dir(&b).unwrap();

        let mut policy = Policy::default();
        policy.work_dir = Some(dir.path().to_path_buf());
        policy.read_only_mounts.push(Mount::same(&b));
        policy.read_only_mounts.push(Mount::same(&a));
        policy.read_write_mounts.push(Mount::same(&a));

        let plan = plan_for(&policy).unwrap();
        assert_eq!(plan.mounts.len(), 3);
        assert_eq!(plan.mounts[0].mode, MountMode::ReadOnly);
        assert!(plan.mounts[0].target.ends_with("b"));
        assert!(plan.mounts[1].target.ends_with("a"));
        assert_eq!(plan.mounts[2].mode, MountMode::ReadWrite);
    }

    #[test]
    fn plan_resolves_symlinked_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        std::fs::create_dir(&real).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let mut policy = Policy::default();
        policy.work_dir = Some(link);
        let plan = plan_for(&policy).unwrap();
        assert!(plan.work_dir.ends_with("real"));
        assert!(!plan.work_dir.to_string_lossy().contains("link"));
    }

    #[test]
    fn plan_copies_are_independent_across_launches() {
        let policy = Policy::baseline();
        let first = plan_for(&policy).unwrap();
        let second = plan_for(&policy).unwrap();
        assert_eq!(first.mounts.len(), second.mounts.len());
        let targets = |plan: &LaunchPlan| -> Vec<PathBuf> {
            plan.mounts.iter().map(|m| m.target.clone()).collect()
        };
        assert_eq!(targets(&first), targets(&second));
    }

    #[test]
    fn empty_mount_path_is_config_error() {
        let mut policy = Policy::default();
        policy.read_only_mounts.push(Mount::same(Path::new("")));
        let err = plan_for(&policy).unwrap_err();
        assert!(matches!(err, SandboxError::Config(_)));
    }
}
