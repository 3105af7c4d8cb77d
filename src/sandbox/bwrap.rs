//! Linux launcher: translates a launch plan into a bubblewrap argv.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::SandboxError;
use super::handle::SandboxCommand;
use super::paths::MountSet;
use super::plan::LaunchPlan;
use super::policy::{MountMode, NetworkMode};

const BWRAP_BINARY: &str = "bwrap";

/// On usr-merged distributions `/bin`, `/lib`, `/lib64`, and `/sbin` are
/// symlinks into `/usr`. They must be recreated inside the sandbox for
/// interpreter executables and shared libraries to stay reachable.
const USR_MERGE_SYMLINKS: &[(&str, &str)] = &[
    ("/bin", "usr/bin"),
    ("/lib", "usr/lib"),
    ("/lib64", "usr/lib64"),
    ("/sbin", "usr/sbin"),
];

/// Check whether bubblewrap is installed on this host.
pub fn bwrap_available() -> bool {
    which::which(BWRAP_BINARY).is_ok()
}

fn bwrap_path() -> Result<PathBuf, SandboxError> {
    which::which(BWRAP_BINARY).map_err(|_| SandboxError::LauncherMissing(BWRAP_BINARY))
}

/// Builder for bubblewrap command lines.
pub struct BwrapBuilder {
    args: Vec<OsString>,
}

impl BwrapBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self { args: Vec::new() }
    }

    /// Add a raw argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add a read-only bind mount.
    pub fn bind_ro(self, src: &Path, dest: &Path) -> Self {
        self.arg("--ro-bind").arg(src).arg(dest)
    }

    /// Add a read-write bind mount.
    pub fn bind_rw(self, src: &Path, dest: &Path) -> Self {
        self.arg("--bind").arg(src).arg(dest)
    }

    /// Add a bind mount with the flag of the given mode.
    pub fn bind(self, mode: MountMode, src: &Path, dest: &Path) -> Self {
        self.arg(mode.bwrap_flag()).arg(src).arg(dest)
    }

    /// Mount a private tmpfs at `dest`.
    pub fn tmpfs(self, dest: &Path) -> Self {
        self.arg("--tmpfs").arg(dest)
    }

    /// Mount procfs at `dest`.
    pub fn proc_mount(self, dest: &Path) -> Self {
        self.arg("--proc").arg(dest)
    }

    /// Mount a minimal `/dev`.
    pub fn dev_minimal(self) -> Self {
        self.arg("--dev").arg("/dev")
    }

    /// Create a symlink inside the sandbox.
    pub fn symlink(self, target: &str, link: &str) -> Self {
        self.arg("--symlink").arg(target).arg(link)
    }

    /// Unshare every namespace (network, IPC, PID, UTS, cgroup).
    pub fn unshare_all(self) -> Self {
        self.arg("--unshare-all")
    }

    /// Unshare only the network namespace.
    pub fn unshare_net(self) -> Self {
        self.arg("--unshare-net")
    }

    /// Terminate the child when the parent exits.
    pub fn die_with_parent(self) -> Self {
        self.arg("--die-with-parent")
    }

    /// Detach the child from the controlling terminal session.
    pub fn new_session(self) -> Self {
        self.arg("--new-session")
    }

    /// Set the initial directory inside the sandbox.
    pub fn chdir(self, path: &Path) -> Self {
        self.arg("--chdir").arg(path)
    }

    /// Append the `--` separator, the program, and its arguments.
    pub fn command(mut self, program: &OsString, args: &[String]) -> Self {
        self.args.push("--".into());
        self.args.push(program.clone());
        for arg in args {
            self.args.push(arg.into());
        }
        self
    }

    /// The accumulated arguments.
    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Build a command invoking bubblewrap at `bwrap` with these arguments.
    pub fn build(self, bwrap: &Path) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(bwrap);
        cmd.args(&self.args);
        cmd
    }

    /// The command line as a loggable string.
    pub fn to_command_line(&self) -> String {
        let mut parts = vec![BWRAP_BINARY.to_string()];
        for arg in &self.args {
            let s = arg.to_string_lossy();
            if s.contains(' ') || s.contains('"') {
                parts.push(format!("'{}'", s.replace('\'', "'\\''")));
            } else {
                parts.push(s.into_owned());
            }
        }
        parts.join(" ")
    }
}

impl Default for BwrapBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Translate a plan into bubblewrap arguments.
///
/// Ordering contract: caller mounts (in insertion order), essential virtual
/// filesystems, tmpfs, usr-merge symlinks, namespace and lifecycle flags,
/// working-directory bind and chdir, then the `--` separator and the
/// command. bubblewrap interprets mount operations sequentially, so this
/// order is load-bearing.
fn translate(plan: &LaunchPlan) -> BwrapBuilder {
    let mut seen = MountSet::new();
    let mut builder = BwrapBuilder::new();

    for mount in &plan.mounts {
        if !seen.insert(mount.mode, &mount.target) {
            continue;
        }
        builder = builder.bind(mount.mode, &mount.source, &mount.target);
    }

    builder = builder
        .proc_mount(Path::new("/proc"))
        .dev_minimal();

    if plan.provide_tmp {
        builder = builder.tmpfs(Path::new("/tmp"));
    }

    for (link, target) in USR_MERGE_SYMLINKS {
        if let Ok(meta) = std::fs::symlink_metadata(link) {
            if meta.file_type().is_symlink() {
                builder = builder.symlink(target, link);
            }
        }
    }

    if !plan.allow_shared_namespaces {
        builder = builder.unshare_all();
    } else if plan.network_mode != NetworkMode::Full {
        // Shared namespaces requested, but the network stays private.
        builder = builder.unshare_net();
    }

    if !plan.allow_parent_survival {
        builder = builder.die_with_parent();
    }
    if !plan.allow_session_control {
        builder = builder.new_session();
    }

    if seen.insert(MountMode::ReadWrite, &plan.work_dir) {
        builder = builder.bind_rw(&plan.work_dir, &plan.work_dir);
    }
    builder = builder.chdir(&plan.work_dir);

    builder.command(&plan.program, &plan.args)
}

/// Produce a configured, not-yet-started sandboxed command for a plan.
pub(crate) fn command_for_plan(plan: LaunchPlan) -> Result<SandboxCommand, SandboxError> {
    let bwrap = bwrap_path()?;

    if plan.cancel.is_cancelled() {
        return Err(SandboxError::Cancelled);
    }

    let builder = translate(&plan);
    debug!(command = %builder.to_command_line(), "bubblewrap launch");

    let command = builder.build(&bwrap);
    Ok(SandboxCommand::new(command, None, plan.cancel))
}
