//! Remote shell over the system `ssh` and `scp` clients.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{RemoteError, RemoteResult};
use crate::host::{Credential, Host};
use crate::transport::{OutputSink, RemoteSession, RemoteShell};

/// Exit status `ssh` uses for its own failures.
const SSH_TRANSPORT_FAILURE: i32 = 255;
/// Connection attempts when retries are enabled.
const CONNECTION_ATTEMPTS: u32 = 3;
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Settings for [`OpenSshTransport`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SshOptions {
    /// `ssh` executable.
    pub ssh_program: PathBuf,
    /// `scp` executable.
    pub scp_program: PathBuf,
    /// `sshpass` executable, used for password credentials.
    pub sshpass_program: PathBuf,
    /// Retry connection establishment.
    pub connect_retries: bool,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            ssh_program: PathBuf::from("ssh"),
            scp_program: PathBuf::from("scp"),
            sshpass_program: PathBuf::from("sshpass"),
            connect_retries: false,
        }
    }
}

/// [`RemoteShell`] spawning one `ssh` or `scp` process per operation.
#[derive(Debug, Clone, Default)]
pub struct OpenSshTransport {
    options: SshOptions,
}

impl OpenSshTransport {
    /// Create a transport.
    #[must_use]
    pub const fn new(options: SshOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl RemoteShell for OpenSshTransport {
    async fn connect(&self, host: &Host) -> RemoteResult<Box<dyn RemoteSession>> {
        if let Credential::KeyFile(key) = &host.credential {
            if !tokio::fs::try_exists(key).await.unwrap_or(false) {
                return Err(RemoteError::transport(
                    &host.address,
                    format!("key file {} not found", key.display()),
                ));
            }
        }
        Ok(Box::new(OpenSshSession {
            host: host.clone(),
            options: self.options.clone(),
        }))
    }
}

/// Session state is just the host; every operation is its own process.
struct OpenSshSession {
    host: Host,
    options: SshOptions,
}

impl OpenSshSession {
    /// Base command for `program`, wrapped in `sshpass` for passwords.
    fn command(&self, program: &Path) -> Command {
        let mut command = match &self.host.credential {
            Credential::KeyFile(_) => Command::new(program),
            Credential::Password(password) => {
                let mut command = Command::new(&self.options.sshpass_program);
                command.arg("-e").arg(program);
                command.env("SSHPASS", password.expose_secret());
                command
            }
        };

        command
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "LogLevel=ERROR"]);
        if self.options.connect_retries {
            command.arg("-o").arg(format!("ConnectionAttempts={CONNECTION_ATTEMPTS}"));
        }
        match &self.host.credential {
            Credential::KeyFile(key) => {
                command.args(["-o", "BatchMode=yes"]).arg("-i").arg(key);
            }
            Credential::Password(_) => {
                command.args(["-o", "PubkeyAuthentication=no"]);
            }
        }
        command.kill_on_drop(true);
        command
    }

    fn ssh(&self, remote_command: &str) -> Command {
        let mut command = self.command(&self.options.ssh_program);
        command
            .stdin(Stdio::null())
            .arg("-p")
            .arg(self.host.port.to_string())
            .arg(self.host.destination())
            .arg(remote_command);
        command
    }

    fn scp(&self, recursive: bool) -> Command {
        let mut command = self.command(&self.options.scp_program);
        command.stdin(Stdio::null()).arg("-P").arg(self.host.port.to_string());
        if recursive {
            command.arg("-r");
        }
        command
    }

    fn remote_path(&self, path: &str) -> String {
        format!("{}:{}", self.host.destination(), path)
    }

    /// Spawn `command`, copy its output into `output` and map its exit status.
    async fn run(
        &self,
        mut command: Command,
        output: OutputSink<'_>,
        cancel: &CancellationToken,
    ) -> RemoteResult<()> {
        let address = &self.host.address;
        command.stdout(Stdio::piped()).stderr(Stdio::piped());

        debug!(host = %address, program = ?command.as_std().get_program(), "spawning remote shell process");
        let mut child = command.spawn().map_err(|e| RemoteError::io(address, e))?;

        let pumped = tokio::select! {
            result = pump(&mut child, output) => Some(result),
            () = cancel.cancelled() => None,
        };
        let Some(result) = pumped else {
            if let Err(e) = child.kill().await {
                debug!(host = %address, error = %e, "failed to kill cancelled process");
            }
            return Err(RemoteError::Cancelled);
        };

        result.map_err(|e| RemoteError::io(address, e))?;
        let status = child.wait().await.map_err(|e| RemoteError::io(address, e))?;
        check_status(address, status)
    }
}

/// Copy stdout and stderr into `output` as they arrive.
async fn pump(child: &mut Child, output: OutputSink<'_>) -> std::io::Result<()> {
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_buf = vec![0u8; READ_BUFFER_SIZE];
    let mut err_buf = vec![0u8; READ_BUFFER_SIZE];

    while stdout.is_some() || stderr.is_some() {
        let (from_stdout, read) = tokio::select! {
            read = read_chunk(&mut stdout, &mut out_buf), if stdout.is_some() => (true, read?),
            read = read_chunk(&mut stderr, &mut err_buf), if stderr.is_some() => (false, read?),
        };
        match (from_stdout, read) {
            (true, 0) => stdout = None,
            (false, 0) => stderr = None,
            (true, n) => output.write_all(&out_buf[..n]).await?,
            (false, n) => output.write_all(&err_buf[..n]).await?,
        }
    }
    output.flush().await
}

async fn read_chunk<R: AsyncRead + Unpin>(
    stream: &mut Option<R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match stream {
        Some(stream) => stream.read(buf).await,
        None => Ok(0),
    }
}

fn check_status(address: &str, status: ExitStatus) -> RemoteResult<()> {
    match status.code() {
        Some(0) => Ok(()),
        Some(SSH_TRANSPORT_FAILURE) => Err(RemoteError::transport(
            address,
            "ssh could not establish the connection (exit status 255)",
        )),
        Some(exit_code) => Err(RemoteError::Execution {
            host: address.to_owned(),
            exit_code,
        }),
        None => Err(RemoteError::transport(address, "process terminated by signal")),
    }
}

#[async_trait]
impl RemoteSession for OpenSshSession {
    async fn exec(
        &mut self,
        command: &str,
        output: OutputSink<'_>,
        cancel: &CancellationToken,
    ) -> RemoteResult<()> {
        self.run(self.ssh(command), output, cancel).await
    }

    async fn exec_script(
        &mut self,
        script: &Path,
        output: OutputSink<'_>,
        cancel: &CancellationToken,
    ) -> RemoteResult<()> {
        let address = &self.host.address;
        let file = tokio::fs::File::open(script)
            .await
            .map_err(|e| RemoteError::io(address, e))?
            .into_std()
            .await;

        let mut command = self.ssh("bash -s");
        command.stdin(Stdio::from(file));
        self.run(command, output, cancel).await
    }

    async fn upload(
        &mut self,
        local: &Path,
        remote: &str,
        output: OutputSink<'_>,
        cancel: &CancellationToken,
    ) -> RemoteResult<()> {
        let recursive = tokio::fs::metadata(local)
            .await
            .map_err(|e| RemoteError::io(&self.host.address, e))?
            .is_dir();
        let mut command = self.scp(recursive);
        command.arg(local).arg(self.remote_path(remote));
        self.run(command, output, cancel).await
    }

    async fn download(
        &mut self,
        remote: &str,
        local_dir: &Path,
        recursive: bool,
        output: OutputSink<'_>,
        cancel: &CancellationToken,
    ) -> RemoteResult<()> {
        tokio::fs::create_dir_all(local_dir)
            .await
            .map_err(|e| RemoteError::io(&self.host.address, e))?;
        let mut command = self.scp(recursive);
        command.arg(self.remote_path(remote)).arg(local_dir);
        self.run(command, output, cancel).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::ffi::OsStr;

    use super::*;

    fn session(credential: Credential, connect_retries: bool) -> OpenSshSession {
        OpenSshSession {
            host: Host::new("10.0.0.5", "hadoop", credential).with_port(2222),
            options: SshOptions {
                connect_retries,
                ..SshOptions::default()
            },
        }
    }

    fn args(command: &Command) -> Vec<String> {
        command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn key_auth_uses_batch_mode_and_identity() {
        let session = session(Credential::KeyFile(PathBuf::from("/keys/c.pem")), false);
        let command = session.ssh("uptime");
        let args = args(&command);

        assert_eq!(command.as_std().get_program(), OsStr::new("ssh"));
        assert!(args.windows(2).any(|w| w == ["-o", "BatchMode=yes"]));
        assert!(args.windows(2).any(|w| w == ["-i", "/keys/c.pem"]));
        assert!(args.windows(2).any(|w| w == ["-p", "2222"]));
        assert!(!args.iter().any(|a| a.starts_with("ConnectionAttempts")));
        assert_eq!(&args[args.len() - 2..], ["hadoop@10.0.0.5", "uptime"]);
    }

    #[test]
    fn password_auth_runs_under_sshpass_without_leaking_the_password() {
        let session = session(Credential::password("s3cret"), true);
        let command = session.ssh("uptime");
        let args = args(&command);

        assert_eq!(command.as_std().get_program(), OsStr::new("sshpass"));
        assert_eq!(&args[..2], ["-e", "ssh"]);
        assert!(!args.iter().any(|a| a.contains("s3cret")));
        assert!(args.iter().any(|a| a == "ConnectionAttempts=3"));
        let env: Vec<_> = command.as_std().get_envs().collect();
        assert!(env
            .iter()
            .any(|(k, v)| *k == OsStr::new("SSHPASS") && *v == Some(OsStr::new("s3cret"))));
    }

    #[test]
    fn scp_download_targets_remote_path() {
        let session = session(Credential::KeyFile(PathBuf::from("/keys/c.pem")), false);
        let mut command = session.scp(true);
        command.arg(session.remote_path("/var/log")).arg("/tmp/out");
        let args = args(&command);

        assert!(args.windows(2).any(|w| w == ["-P", "2222"]));
        assert!(args.contains(&"-r".to_owned()));
        assert_eq!(&args[args.len() - 2..], ["hadoop@10.0.0.5:/var/log", "/tmp/out"]);
    }

    #[test]
    fn exit_status_mapping() {
        use std::os::unix::process::ExitStatusExt;

        assert!(check_status("h", ExitStatus::from_raw(0)).is_ok());
        assert!(matches!(
            check_status("h", ExitStatus::from_raw(2 << 8)),
            Err(RemoteError::Execution { exit_code: 2, .. })
        ));
        assert!(matches!(
            check_status("h", ExitStatus::from_raw(255 << 8)),
            Err(RemoteError::Transport { .. })
        ));
        assert!(matches!(
            check_status("h", ExitStatus::from_raw(9)),
            Err(RemoteError::Transport { .. })
        ));
    }

    #[tokio::test]
    async fn missing_key_file_fails_to_connect() {
        let transport = OpenSshTransport::default();
        let host = Host::new(
            "10.0.0.5",
            "hadoop",
            Credential::KeyFile(PathBuf::from("/nonexistent/key.pem")),
        );
        let err = transport.connect(&host).await.err().unwrap();
        assert!(matches!(err, RemoteError::Transport { .. }));
    }

    #[tokio::test]
    async fn local_process_output_is_captured() {
        let session = session(Credential::KeyFile(PathBuf::from("/k")), false);
        let mut command = Command::new("sh");
        command.args(["-c", "echo out; echo err 1>&2; exit 4"]);
        let mut output = Vec::new();

        let err = session
            .run(command, &mut output, &CancellationToken::new())
            .await
            .unwrap_err();

        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("out\n"));
        assert!(text.contains("err\n"));
        assert!(matches!(err, RemoteError::Execution { exit_code: 4, .. }));
    }
}
