//! macOS launcher: compiles a launch plan into a Seatbelt (SBPL) profile
//! with parameter bindings for `/usr/bin/sandbox-exec`.
//!
//! The profile compiler is pure string and path work, so it is compiled and
//! unit-tested on every platform; only launch-time backend selection in
//! [`crate::sandbox::Policy::command`] is platform-dependent.

use std::ffi::OsString;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tempfile::TempDir;
use tracing::debug;
use uuid::Uuid;

use super::error::SandboxError;
use super::handle::SandboxCommand;
use super::paths::{canonical_path, MountSet};
use super::plan::LaunchPlan;
use super::policy::{MountMode, NetworkMode};

const SEATBELT_BINARY: &str = "/usr/bin/sandbox-exec";

/// Base profile embedded at build time. The only variable part is the
/// `nestbox-LOGTAG` placeholder; per-launch rules are appended, never
/// spliced, so untrusted input cannot inject into the template.
const BASE_PROFILE: &str = include_str!("seatbelt_base.sbpl");

const LOG_TAG_PLACEHOLDER: &str = "nestbox-LOGTAG";

/// Check whether the Seatbelt evaluator is installed on this host.
pub fn seatbelt_available() -> bool {
    Path::new(SEATBELT_BINARY).exists()
}

/// Unique per-launch tag embedded into profile rules so that sandbox
/// violation log lines can be attributed to a specific launch.
fn generate_log_tag() -> String {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let suffix = Uuid::new_v4().simple().to_string();
    format!("nestbox-{}-{}", seconds, &suffix[..8])
}

/// Everything `sandbox-exec` needs for one launch.
pub(crate) struct SeatbeltLaunch {
    /// Full profile: base template plus appended subpath and network rules.
    pub profile: String,
    /// argv after the binary: `-p <profile>`, `-D` bindings, `--`, command.
    pub args: Vec<OsString>,
    /// Created temp directory when the plan asked for one. Travels with the
    /// child handle and is removed when that handle drops.
    pub temp_dir: Option<TempDir>,
    /// Canonicalized working directory; `sandbox-exec` does not change the
    /// child's directory, so the spawner sets it on the command.
    pub work_dir: PathBuf,
}

/// Compile a plan into a profile, parameter bindings, and argv.
pub(crate) fn prepare(plan: &LaunchPlan) -> Result<SeatbeltLaunch, SandboxError> {
    // Readable roots: every mount source plus the working directory.
    // Writable roots: read-write sources plus the working directory.
    // Writable implies readable, so read-write sources land in both sets.
    let mut readable = MountSet::new();
    let mut writable = MountSet::new();

    for mount in &plan.mounts {
        readable.insert(MountMode::ReadOnly, &mount.source);
        if mount.mode == MountMode::ReadWrite {
            writable.insert(MountMode::ReadWrite, &mount.source);
        }
    }
    readable.insert(MountMode::ReadOnly, &plan.work_dir);
    writable.insert(MountMode::ReadWrite, &plan.work_dir);

    let mut temp_dir = None;
    if plan.provide_tmp {
        let dir = tempfile::Builder::new()
            .prefix("nestbox-sandbox-")
            .tempdir()
            .map_err(SandboxError::TempSetup)?;
        // Canonicalize to survive the /var -> /private/var symlink; the
        // child reaches the directory through TMPDIR.
        let canon = canonical_path(dir.path())?;
        readable.insert(MountMode::ReadOnly, &canon);
        writable.insert(MountMode::ReadWrite, &canon);
        temp_dir = Some(dir);
    }

    let tag = generate_log_tag();
    let profile = render_profile(&tag, readable.targets(), writable.targets(), plan.network_mode);

    let mut args: Vec<OsString> = vec!["-p".into(), profile.clone().into()];
    for (i, path) in readable.targets().iter().enumerate() {
        let mut arg = OsString::from(format!("-DREADABLE_ROOT_{}=", i));
        arg.push(path.as_os_str());
        args.push(arg);
    }
    for (i, path) in writable.targets().iter().enumerate() {
        let mut arg = OsString::from(format!("-DWRITABLE_ROOT_{}=", i));
        arg.push(path.as_os_str());
        args.push(arg);
    }
    args.push("--".into());
    args.push(plan.program.clone());
    for arg in &plan.args {
        args.push(arg.into());
    }

    Ok(SeatbeltLaunch {
        profile,
        args,
        temp_dir,
        work_dir: plan.work_dir.clone(),
    })
}

fn render_profile(
    tag: &str,
    readable: &[PathBuf],
    writable: &[PathBuf],
    network: NetworkMode,
) -> String {
    let mut profile = BASE_PROFILE.replace(LOG_TAG_PLACEHOLDER, tag);
    profile.push('\n');

    if !readable.is_empty() {
        profile.push_str("(allow file-read*\n");
        for i in 0..readable.len() {
            let _ = writeln!(profile, "  (subpath (param \"READABLE_ROOT_{}\"))", i);
        }
        let _ = writeln!(profile, "  (with message \"{}-read\"))", tag);
    }

    if !writable.is_empty() {
        profile.push_str("(allow file-write*\n");
        for i in 0..writable.len() {
            let _ = writeln!(profile, "  (subpath (param \"WRITABLE_ROOT_{}\"))", i);
        }
        let _ = writeln!(profile, "  (with message \"{}-write\"))", tag);
    }

    match network {
        NetworkMode::Full => {
            profile.push_str("(allow network-outbound)\n");
            profile.push_str("(allow network-inbound)\n");
        }
        NetworkMode::LoopbackOnly => {
            // Seatbelt wants the "localhost:*" spelling; the evaluator
            // resolves it to 127.0.0.1 and ::1.
            profile.push_str("(allow network-outbound\n  (remote ip \"localhost:*\"))\n");
            profile.push_str("(allow network-inbound\n  (local ip \"localhost:*\"))\n");
        }
        NetworkMode::Blocked => {}
    }

    profile
}

/// Produce a configured, not-yet-started sandboxed command for a plan.
pub(crate) fn command_for_plan(plan: LaunchPlan) -> Result<SandboxCommand, SandboxError> {
    if !seatbelt_available() {
        return Err(SandboxError::LauncherMissing("sandbox-exec"));
    }

    if plan.cancel.is_cancelled() {
        return Err(SandboxError::Cancelled);
    }

    let launch = prepare(&plan)?;
    debug!(
        work_dir = %launch.work_dir.display(),
        profile_bytes = launch.profile.len(),
        "seatbelt launch"
    );

    let mut command = tokio::process::Command::new(SEATBELT_BINARY);
    command.args(&launch.args);
    command.current_dir(&launch.work_dir);
    if let Some(dir) = &launch.temp_dir {
        command.env("TMPDIR", dir.path());
    }

    Ok(SandboxCommand::new(command, launch.temp_dir, plan.cancel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::policy::{Mount, Policy};
    use std::ffi::OsStr;
    use tokio_util::sync::CancellationToken;

    fn plan_for(policy: &Policy) -> LaunchPlan {
        LaunchPlan::materialize(
            policy,
            OsStr::new("python3"),
            &["-c".to_string(), "print()".to_string()],
            CancellationToken::new(),
        )
        .unwrap()
    }

    fn fixture() -> (tempfile::TempDir, Policy) {
        let dir = tempfile::tempdir().unwrap();
        let ro = dir.path().join("ro");
        let rw = dir.path().join("rw");
        let work = dir.path().join("work");
        std::fs::create_dir(&ro).unwrap();
        std::fs::create_dir(&rw).unwrap();
        std::fs::create_dir(&work).unwrap();

        let mut policy = Policy::default();
        policy.read_only_mounts.push(Mount::same(&ro));
        policy.read_write_mounts.push(Mount::same(&rw));
        policy.work_dir = Some(work);
        (dir, policy)
    }

    fn string_args(launch: &SeatbeltLaunch) -> Vec<String> {
        launch
            .args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn log_tag_placeholder_is_replaced() {
        let (_dir, policy) = fixture();
        let launch = prepare(&plan_for(&policy)).unwrap();
        assert!(!launch.profile.contains(LOG_TAG_PLACEHOLDER));
        assert!(launch.profile.contains("nestbox-"));
        assert!(launch.profile.contains("-read"));
        assert!(launch.profile.contains("-write"));
    }

    #[test]
    fn log_tags_are_unique_per_launch() {
        assert_ne!(generate_log_tag(), generate_log_tag());
    }

    #[test]
    fn readable_covers_all_sources_writable_only_rw_and_workdir() {
        let (_dir, policy) = fixture();
        let launch = prepare(&plan_for(&policy)).unwrap();

        // ro source, rw source, workdir readable; rw source and workdir writable.
        assert!(launch.profile.contains("(subpath (param \"READABLE_ROOT_2\"))"));
        assert!(!launch.profile.contains("READABLE_ROOT_3"));
        assert!(launch.profile.contains("(subpath (param \"WRITABLE_ROOT_1\"))"));
        assert!(!launch.profile.contains("WRITABLE_ROOT_2"));

        let args = string_args(&launch);
        let readable_binds = args.iter().filter(|a| a.starts_with("-DREADABLE_ROOT_")).count();
        let writable_binds = args.iter().filter(|a| a.starts_with("-DWRITABLE_ROOT_")).count();
        assert_eq!(readable_binds, 3);
        assert_eq!(writable_binds, 2);
    }

    #[test]
    fn duplicate_sources_bind_once() {
        let (_dir, mut policy) = fixture();
        let dup = policy.read_only_mounts[0].clone();
        policy.read_only_mounts.push(dup);
        let launch = prepare(&plan_for(&policy)).unwrap();

        let args = string_args(&launch);
        let readable_binds = args.iter().filter(|a| a.starts_with("-DREADABLE_ROOT_")).count();
        assert_eq!(readable_binds, 3);
    }

    #[test]
    fn argv_shape_is_profile_params_separator_command() {
        let (_dir, policy) = fixture();
        let launch = prepare(&plan_for(&policy)).unwrap();
        let args = string_args(&launch);

        assert_eq!(args[0], "-p");
        assert_eq!(args[1], launch.profile);
        let sep = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(args[sep + 1], "python3");
        assert_eq!(args[sep + 2], "-c");
        for arg in &args[2..sep] {
            assert!(arg.starts_with("-D"), "unexpected arg before --: {arg}");
        }
    }

    #[test]
    fn blocked_network_emits_no_rules() {
        let (_dir, policy) = fixture();
        let launch = prepare(&plan_for(&policy)).unwrap();
        assert!(!launch.profile.contains("(allow network-outbound"));
        assert!(!launch.profile.contains("(allow network-inbound"));
    }

    #[test]
    fn loopback_only_gates_on_localhost() {
        let (_dir, mut policy) = fixture();
        policy.network_mode = NetworkMode::LoopbackOnly;
        let launch = prepare(&plan_for(&policy)).unwrap();
        assert!(launch
            .profile
            .contains("(allow network-outbound\n  (remote ip \"localhost:*\"))"));
        assert!(launch
            .profile
            .contains("(allow network-inbound\n  (local ip \"localhost:*\"))"));
    }

    #[test]
    fn full_network_allows_unconditionally() {
        let (_dir, mut policy) = fixture();
        policy.network_mode = NetworkMode::Full;
        let launch = prepare(&plan_for(&policy)).unwrap();
        assert!(launch.profile.contains("(allow network-outbound)\n"));
        assert!(launch.profile.contains("(allow network-inbound)\n"));
        assert!(!launch.profile.contains("localhost:*"));
    }

    #[test]
    fn provide_tmp_creates_directory_and_binds_it_both_ways() {
        let (_dir, mut policy) = fixture();
        policy.provide_tmp = true;
        let launch = prepare(&plan_for(&policy)).unwrap();

        let temp = launch.temp_dir.as_ref().expect("temp dir created");
        assert!(temp.path().exists());

        let args = string_args(&launch);
        let canon = canonical_path(temp.path()).unwrap().display().to_string();
        assert!(args.iter().any(|a| a.starts_with("-DREADABLE_ROOT_") && a.ends_with(&canon)));
        assert!(args.iter().any(|a| a.starts_with("-DWRITABLE_ROOT_") && a.ends_with(&canon)));
    }

    #[test]
    fn no_tmp_requested_means_no_directory() {
        let (_dir, policy) = fixture();
        let launch = prepare(&plan_for(&policy)).unwrap();
        assert!(launch.temp_dir.is_none());
    }

    #[test]
    fn base_profile_denies_by_default() {
        assert!(BASE_PROFILE.starts_with("(version 1)"));
        assert!(BASE_PROFILE.contains("(deny default"));
        assert!(BASE_PROFILE.contains(LOG_TAG_PLACEHOLDER));
    }
}
