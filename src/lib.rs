//! nestbox: sandboxed child-process execution for long-running hosts.
//!
//! This crate spawns untrusted child processes (typically scripting-language
//! interpreters) inside an operating-system sandbox, without replacing the
//! parent image. It is designed for embedding into servers and agent hosts
//! that repeatedly launch isolated workloads from shared configuration.
//!
//! Platform support:
//! - Linux: bubblewrap (`bwrap`) with namespace isolation
//! - macOS: Seatbelt (`/usr/bin/sandbox-exec`) with a generated SBPL profile
//!
//! # Security model
//!
//! The zero-value [`sandbox::Policy`] provides maximum isolation: no
//! filesystem access, network blocked, no `/tmp`, all namespaces unshared on
//! Linux, child dies with the parent. [`sandbox::Policy::baseline`] adds the
//! minimal read-only system mounts needed to run ordinary commands.
//! Application paths (virtualenvs, data directories) are mounted explicitly
//! by the caller.
//!
//! # Egress filtering
//!
//! [`proxy::NetworkProxy`] runs an HTTP proxy (with CONNECT tunneling) and a
//! SOCKS5 proxy in-process, enforcing a [`proxy::NetworkFilter`] allow/deny
//! host list. Its environment bundle ([`proxy::NetworkProxy::env`]) is
//! appended to a sandboxed child's environment by the caller.
//!
//! # Example
//!
//! ```no_run
//! use nestbox::sandbox::Policy;
//!
//! # async fn run() -> Result<(), nestbox::sandbox::SandboxError> {
//! let policy = Policy::baseline();
//! let cmd = policy.command("echo", &["hello world".into()])?;
//! let output = cmd.output().await?;
//! assert!(output.status.success());
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod proxy;
pub mod sandbox;
