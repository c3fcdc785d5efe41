//! Scripted in-memory remote shell.
//!
//! Each host answers with canned output after a configurable delay and can be
//! told to fail. The transport records what ran and in which order hosts
//! finished, which makes dispatch ordering observable in tests.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::{RemoteError, RemoteResult};
use crate::host::Host;
use crate::transport::{OutputSink, RemoteSession, RemoteShell};

/// How a scripted host fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedFailure {
    /// The command exits with this status after printing its output.
    Exit(i32),
    /// The transport drops after the output.
    Transport(String),
    /// Local I/O fails with this kind.
    Io(io::ErrorKind),
    /// The host refuses the connection.
    ConnectRefused,
}

/// Behaviour of one scripted host.
#[derive(Debug, Clone, Default)]
pub struct HostScript {
    output: Vec<u8>,
    delay: Duration,
    failure: Option<ScriptedFailure>,
}

impl HostScript {
    /// Host printing `output`.
    #[must_use]
    pub fn new(output: impl Into<Vec<u8>>) -> Self {
        Self {
            output: output.into(),
            ..Self::default()
        }
    }

    /// Wait this long before answering.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail every operation this way.
    #[must_use]
    pub fn failing(mut self, failure: ScriptedFailure) -> Self {
        self.failure = Some(failure);
        self
    }
}

/// Something a scripted host was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedCall {
    /// Shell command.
    Exec(String),
    /// Local script.
    Script(PathBuf),
    /// Upload of `local` to `remote`.
    Upload {
        /// Local source.
        local: PathBuf,
        /// Remote destination.
        remote: String,
    },
    /// Download of `remote` into `local_dir`.
    Download {
        /// Remote source.
        remote: String,
        /// Local destination directory.
        local_dir: PathBuf,
    },
}

#[derive(Default)]
struct Journal {
    calls: Vec<(String, ScriptedCall)>,
    completed: Vec<String>,
    closed: Vec<String>,
}

/// [`RemoteShell`] answering from per-host scripts.
#[derive(Default, Clone)]
pub struct ScriptedTransport {
    scripts: Arc<HashMap<String, HostScript>>,
    journal: Arc<Mutex<Journal>>,
}

impl ScriptedTransport {
    /// Transport with no hosts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the host at `address`.
    #[must_use]
    pub fn host(mut self, address: impl Into<String>, script: HostScript) -> Self {
        Arc::make_mut(&mut self.scripts).insert(address.into(), script);
        self
    }

    fn journal(&self) -> std::sync::MutexGuard<'_, Journal> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Calls received, tagged with the host address.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, ScriptedCall)> {
        self.journal().calls.clone()
    }

    /// Host addresses in the order their operations finished.
    #[must_use]
    pub fn completion_order(&self) -> Vec<String> {
        self.journal().completed.clone()
    }

    /// Host addresses whose sessions were closed.
    #[must_use]
    pub fn closed(&self) -> Vec<String> {
        self.journal().closed.clone()
    }
}

#[async_trait]
impl RemoteShell for ScriptedTransport {
    async fn connect(&self, host: &Host) -> RemoteResult<Box<dyn RemoteSession>> {
        let Some(script) = self.scripts.get(&host.address) else {
            return Err(RemoteError::transport(&host.address, "unknown host"));
        };
        if script.failure == Some(ScriptedFailure::ConnectRefused) {
            return Err(RemoteError::transport(&host.address, "connection refused"));
        }
        Ok(Box::new(ScriptedSession {
            address: host.address.clone(),
            script: script.clone(),
            journal: Arc::clone(&self.journal),
        }))
    }
}

struct ScriptedSession {
    address: String,
    script: HostScript,
    journal: Arc<Mutex<Journal>>,
}

impl ScriptedSession {
    async fn answer(
        &self,
        call: ScriptedCall,
        output: OutputSink<'_>,
        cancel: &CancellationToken,
    ) -> RemoteResult<()> {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .calls
            .push((self.address.clone(), call));

        tokio::select! {
            () = tokio::time::sleep(self.script.delay) => {}
            () = cancel.cancelled() => return Err(RemoteError::Cancelled),
        }

        output
            .write_all(&self.script.output)
            .await
            .map_err(|e| RemoteError::io(&self.address, e))?;
        output
            .flush()
            .await
            .map_err(|e| RemoteError::io(&self.address, e))?;

        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .completed
            .push(self.address.clone());

        match &self.script.failure {
            None | Some(ScriptedFailure::ConnectRefused) => Ok(()),
            Some(ScriptedFailure::Exit(exit_code)) => Err(RemoteError::Execution {
                host: self.address.clone(),
                exit_code: *exit_code,
            }),
            Some(ScriptedFailure::Transport(message)) => {
                Err(RemoteError::transport(&self.address, message.as_str()))
            }
            Some(ScriptedFailure::Io(kind)) => {
                Err(RemoteError::io(&self.address, io::Error::from(*kind)))
            }
        }
    }
}

#[async_trait]
impl RemoteSession for ScriptedSession {
    async fn exec(
        &mut self,
        command: &str,
        output: OutputSink<'_>,
        cancel: &CancellationToken,
    ) -> RemoteResult<()> {
        self.answer(ScriptedCall::Exec(command.to_owned()), output, cancel)
            .await
    }

    async fn exec_script(
        &mut self,
        script: &Path,
        output: OutputSink<'_>,
        cancel: &CancellationToken,
    ) -> RemoteResult<()> {
        self.answer(ScriptedCall::Script(script.to_path_buf()), output, cancel)
            .await
    }

    async fn upload(
        &mut self,
        local: &Path,
        remote: &str,
        output: OutputSink<'_>,
        cancel: &CancellationToken,
    ) -> RemoteResult<()> {
        let call = ScriptedCall::Upload {
            local: local.to_path_buf(),
            remote: remote.to_owned(),
        };
        self.answer(call, output, cancel).await
    }

    async fn download(
        &mut self,
        remote: &str,
        local_dir: &Path,
        _recursive: bool,
        output: OutputSink<'_>,
        cancel: &CancellationToken,
    ) -> RemoteResult<()> {
        let call = ScriptedCall::Download {
            remote: remote.to_owned(),
            local_dir: local_dir.to_path_buf(),
        };
        let mut listing = Vec::new();
        self.answer(call, &mut listing, cancel).await?;

        let file_name = Path::new(remote)
            .file_name()
            .map_or_else(|| "download".into(), ToOwned::to_owned);
        tokio::fs::create_dir_all(local_dir)
            .await
            .map_err(|e| RemoteError::io(&self.address, e))?;
        tokio::fs::write(local_dir.join(file_name), &listing)
            .await
            .map_err(|e| RemoteError::io(&self.address, e))?;

        output
            .write_all(&listing)
            .await
            .map_err(|e| RemoteError::io(&self.address, e))
    }

    async fn close(&mut self) -> RemoteResult<()> {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
            .push(self.address.clone());
        Ok(())
    }
}
