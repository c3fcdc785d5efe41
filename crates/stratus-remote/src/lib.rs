//! Remote command and file transfer dispatch for Stratus.
//!
//! This crate provides:
//! - [`Host`] and [`HostSet`] describing where to run and how to log in
//! - The [`RemoteShell`] / [`RemoteSession`] transport interface
//! - [`OpenSshTransport`] driving the system `ssh` and `scp` clients
//! - [`RemoteCommandDispatcher`] running one [`Operation`] on many hosts
//!   concurrently with ordered, non-interleaved output
//! - [`ScriptedTransport`], an in-memory shell for tests

#![forbid(unsafe_code)]

pub mod dispatcher;
pub mod error;
pub mod host;
pub mod mock;
pub mod openssh;
pub mod transport;

pub use dispatcher::{BatchReport, CommandResult, CommandStatus, RemoteCommandDispatcher};
pub use error::{RemoteError, RemoteResult};
pub use host::{Credential, Host, HostSet, DEFAULT_PORT};
pub use mock::{HostScript, ScriptedCall, ScriptedFailure, ScriptedTransport};
pub use openssh::{OpenSshTransport, SshOptions};
pub use transport::{Operation, OutputSink, RemoteSession, RemoteShell};
