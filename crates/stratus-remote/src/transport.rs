//! Remote shell transport interface.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use crate::error::RemoteResult;
use crate::host::Host;

/// Destination for the output of a remote operation.
pub type OutputSink<'a> = &'a mut (dyn AsyncWrite + Send + Unpin);

/// Opens sessions to hosts.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Open a session to `host` using its credential.
    async fn connect(&self, host: &Host) -> RemoteResult<Box<dyn RemoteSession>>;
}

/// An open session to one host.
///
/// Every operation writes what the remote side prints into `output` and
/// stops with [`crate::RemoteError::Cancelled`] once `cancel` fires.
#[async_trait]
pub trait RemoteSession: Send {
    /// Run a shell command.
    async fn exec(
        &mut self,
        command: &str,
        output: OutputSink<'_>,
        cancel: &CancellationToken,
    ) -> RemoteResult<()>;

    /// Run a local script file through the remote shell's standard input.
    async fn exec_script(
        &mut self,
        script: &Path,
        output: OutputSink<'_>,
        cancel: &CancellationToken,
    ) -> RemoteResult<()>;

    /// Copy a local file or directory to `remote`.
    async fn upload(
        &mut self,
        local: &Path,
        remote: &str,
        output: OutputSink<'_>,
        cancel: &CancellationToken,
    ) -> RemoteResult<()>;

    /// Copy `remote` into the local directory `local_dir`.
    async fn download(
        &mut self,
        remote: &str,
        local_dir: &Path,
        recursive: bool,
        output: OutputSink<'_>,
        cancel: &CancellationToken,
    ) -> RemoteResult<()>;

    /// Release the session.
    async fn close(&mut self) -> RemoteResult<()> {
        Ok(())
    }
}

/// What to do on every host of a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Run a shell command.
    Execute(String),
    /// Run a local script on the remote shell.
    ExecuteFile(PathBuf),
    /// Copy a local path to the hosts.
    Upload {
        /// Local file or directory.
        local: PathBuf,
        /// Remote destination.
        remote: String,
    },
    /// Copy a remote path from the hosts.
    Download {
        /// Remote file or directory.
        remote: String,
        /// Local directory receiving the copy.
        local_dir: PathBuf,
        /// Copy directories recursively.
        recursive: bool,
    },
}

impl Operation {
    /// Short name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Execute(_) => "execute",
            Self::ExecuteFile(_) => "execute_file",
            Self::Upload { .. } => "upload",
            Self::Download { .. } => "download",
        }
    }

    /// The operation as run on `host` when several hosts share a dispatch.
    ///
    /// Downloads go into a per-host subdirectory so hosts do not overwrite
    /// each other's files.
    #[must_use]
    pub fn for_host_in_batch(&self, host: &Host) -> Self {
        match self {
            Self::Download {
                remote,
                local_dir,
                recursive,
            } => Self::Download {
                remote: remote.clone(),
                local_dir: local_dir.join(&host.address),
                recursive: *recursive,
            },
            other => other.clone(),
        }
    }

    /// Run the operation over an open session.
    pub async fn run(
        &self,
        session: &mut dyn RemoteSession,
        output: OutputSink<'_>,
        cancel: &CancellationToken,
    ) -> RemoteResult<()> {
        match self {
            Self::Execute(command) => session.exec(command, output, cancel).await,
            Self::ExecuteFile(script) => session.exec_script(script, output, cancel).await,
            Self::Upload { local, remote } => session.upload(local, remote, output, cancel).await,
            Self::Download {
                remote,
                local_dir,
                recursive,
            } => {
                session
                    .download(remote, local_dir, *recursive, output, cancel)
                    .await
            }
        }
    }
}
