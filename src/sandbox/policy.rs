//! Security policy for sandboxed command execution.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::SandboxError;
use super::handle::SandboxCommand;
use super::plan::LaunchPlan;
use super::{bwrap, seatbelt};

/// A filesystem path binding into the sandbox.
///
/// All mounts are required: if a mount source does not exist at launch time,
/// the launch fails with [`SandboxError::PathResolution`]. This keeps the
/// security boundary deterministic instead of silently narrower.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Absolute path on the host filesystem to mount.
    pub source: PathBuf,
    /// Absolute path inside the sandbox where `source` appears. Typically
    /// the same as `source` to keep path consistency.
    pub target: PathBuf,
}

impl Mount {
    /// Create a mount with distinct source and target.
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }

    /// Create a mount where source and target are the same path.
    pub fn same(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            source: path.clone(),
            target: path,
        }
    }
}

/// Access mode of a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MountMode {
    /// Mounted read-only.
    ReadOnly,
    /// Mounted read-write.
    ReadWrite,
}

impl MountMode {
    /// The bubblewrap flag for this mode.
    pub(crate) fn bwrap_flag(self) -> &'static str {
        match self {
            MountMode::ReadOnly => "--ro-bind",
            MountMode::ReadWrite => "--bind",
        }
    }
}

/// Network reachability of the sandboxed child.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NetworkMode {
    /// No network access (the default).
    ///
    /// Linux: the network namespace is unshared. macOS: no network rules
    /// are emitted, so the deny-default base profile blocks all traffic.
    #[default]
    Blocked,

    /// Localhost-only network access.
    ///
    /// macOS: Seatbelt rules allow outbound and inbound traffic only for
    /// `localhost`. This is the recommended mode for untrusted code that
    /// needs IPC over TCP (for example a Jupyter kernel) while the external
    /// internet stays unreachable.
    ///
    /// Linux: behaves the same as [`NetworkMode::Blocked`]. The unshared
    /// network namespace keeps a private loopback, so localhost IPC already
    /// works inside the sandbox and there is no peer beyond it to reach.
    LoopbackOnly,

    /// Full network access, including the internet.
    ///
    /// Linux: only meaningful together with
    /// [`Policy::allow_shared_namespaces`] — with namespaces unshared the
    /// child has no reachable peers regardless of this mode.
    Full,
}

/// Security boundaries for sandboxed command execution.
///
/// The default value provides maximum isolation: no mounts, no `/tmp`,
/// network blocked, all Linux namespaces unshared, child dies with the
/// parent, and a new session is created. Commands launched under it will
/// fail to find their executable; see [`Policy::baseline`] for a usable
/// starting configuration.
///
/// # Concurrency
///
/// A `Policy` is safe to reuse across concurrent launches. Each call to
/// [`Policy::command`] deep-copies the mount sequences before resolving
/// anything, so one launch can never observe another's additions. This makes
/// a single long-lived `Policy` suitable for HTTP handlers and other
/// concurrent contexts.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    /// Paths mounted read-only inside the sandbox (for example `/usr`,
    /// `/bin`, `/lib`). These let the child execute system binaries and
    /// load shared libraries.
    pub read_only_mounts: Vec<Mount>,

    /// Paths mounted read-write inside the sandbox. Limit these to what the
    /// child genuinely needs to write.
    pub read_write_mounts: Vec<Mount>,

    /// Working directory for the sandboxed command. When `None`, the
    /// parent's current directory is used at launch time.
    ///
    /// The working directory is automatically mounted read-write and set as
    /// the child's initial directory; it never needs to appear in
    /// [`Policy::read_write_mounts`].
    pub work_dir: Option<PathBuf>,

    /// Whether the child sees an isolated temp directory.
    ///
    /// Linux: a private tmpfs mounted at `/tmp`, discarded on exit.
    /// macOS: a host-side temp directory is created per launch, `TMPDIR`
    /// points into it, and it is removed when the child handle is dropped.
    /// Callers needing durable cleanup semantics should mount their own
    /// directory read-write instead.
    pub provide_tmp: bool,

    /// Network reachability. Defaults to [`NetworkMode::Blocked`].
    pub network_mode: NetworkMode,

    /// Linux only: skip unsharing namespaces (`--unshare-all`), leaving the
    /// child in the parent's namespaces. Required for
    /// [`NetworkMode::Full`] to be effective on Linux. Ignored on macOS,
    /// where Seatbelt has no namespace concept.
    pub allow_shared_namespaces: bool,

    /// Linux only: let the sandboxed process outlive its parent (skips
    /// `--die-with-parent`). Ignored on macOS.
    pub allow_parent_survival: bool,

    /// Linux only: let the sandboxed process control the terminal session
    /// (skips `--new-session`). Ignored on macOS.
    pub allow_session_control: bool,
}

impl Policy {
    /// A reasonable baseline for running ordinary commands in a sandbox:
    /// minimal system directories mounted read-only (only those present on
    /// the host) plus an isolated temp directory. Network stays blocked.
    ///
    /// Application-specific mounts (Homebrew prefixes, virtualenvs, data
    /// directories) must be added by the caller, typically via
    /// [`Policy::augment`] or by pushing onto the mount vectors.
    pub fn baseline() -> Self {
        let mut policy = Policy {
            provide_tmp: true,
            ..Policy::default()
        };

        let (required, optional): (&[&str], &[&str]) = if cfg!(target_os = "macos") {
            (&["/usr", "/bin", "/System", "/Library", "/etc"], &["/sbin"])
        } else {
            (&["/usr", "/bin", "/lib", "/etc"], &["/sbin", "/lib64", "/run"])
        };

        for path in required.iter().chain(optional) {
            if Path::new(path).exists() {
                policy.read_only_mounts.push(Mount::same(*path));
            }
        }

        policy
    }

    /// Return a new policy with the given mounts appended.
    ///
    /// Both mount sequences are deep-copied, so the receiver is never
    /// observed in a mutated state by concurrent launches. Wrapper layers
    /// use this to decorate a shared policy with interpreter-specific
    /// mounts without touching it.
    pub fn augment(&self, read_only: &[Mount], read_write: &[Mount]) -> Policy {
        let mut copy = self.clone();
        copy.read_only_mounts.extend_from_slice(read_only);
        copy.read_write_mounts.extend_from_slice(read_write);
        copy
    }

    /// Build a not-yet-started sandboxed command for `program` with `args`.
    ///
    /// The returned [`SandboxCommand`] has not been spawned; the caller can
    /// plumb stdio and then [`SandboxCommand::spawn`] or
    /// [`SandboxCommand::output`] it. Configuration, path-resolution, and
    /// launcher-discovery failures all surface here, before any child
    /// exists.
    pub fn command(
        &self,
        program: impl AsRef<OsStr>,
        args: &[String],
    ) -> Result<SandboxCommand, SandboxError> {
        self.command_with_cancel(program, args, CancellationToken::new())
    }

    /// Like [`Policy::command`], with a cancellation handle.
    ///
    /// Cancelling the token before spawn aborts plan materialization at the
    /// next canonicalization step. Cancelling after spawn makes
    /// [`super::SandboxChild::wait`] terminate the child.
    pub fn command_with_cancel(
        &self,
        program: impl AsRef<OsStr>,
        args: &[String],
        cancel: CancellationToken,
    ) -> Result<SandboxCommand, SandboxError> {
        let program = program.as_ref();
        if program.is_empty() {
            return Err(SandboxError::Config(
                "command name must not be empty".to_string(),
            ));
        }

        let plan = LaunchPlan::materialize(self, program, args, cancel)?;
        debug!(program = %plan.program.to_string_lossy(), "materialized launch plan");

        if cfg!(target_os = "macos") {
            seatbelt::command_for_plan(plan)
        } else {
            bwrap::command_for_plan(plan)
        }
    }
}
