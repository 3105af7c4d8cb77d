//! Sandboxed command execution.
//!
//! A [`Policy`] declares the security boundary — mounts, working directory,
//! temp-directory provisioning, network reachability, lifecycle flags — and
//! [`Policy::command`] compiles it for the host's sandbox mechanism:
//!
//! - Linux: a bubblewrap argument vector (namespace isolation, explicit
//!   bind mounts, `--die-with-parent`);
//! - macOS: a Seatbelt SBPL profile with `-D` parameter bindings evaluated
//!   by `/usr/bin/sandbox-exec`.
//!
//! Both translations share one canonicalization and deduplication pass, so
//! the boundary is identical in meaning on either platform. Launch-time
//! failures (missing mount source, missing launcher, unresolvable paths)
//! surface before any child process exists.
//!
//! The child is spawned, never exec'd in place, so the parent keeps running;
//! a long-lived server can hold one `Policy` and launch from it concurrently.

mod bwrap;
mod error;
mod handle;
mod paths;
mod plan;
mod policy;
mod seatbelt;

pub use bwrap::{bwrap_available, BwrapBuilder};
pub use error::SandboxError;
pub use handle::{SandboxChild, SandboxCommand};
pub use paths::{canonical_path, MountSet};
pub use policy::{Mount, MountMode, NetworkMode, Policy};
pub use seatbelt::seatbelt_available;
