//! Implementation of the remote dispatch commands (`exec`, `exec-file`,
//! `upload`, `download`).

use std::sync::Arc;

use anyhow::bail;
use clap::Args;
use stratus_control::{RemoteConfig, StratusConfig};
use stratus_remote::{
    Credential, Host, HostSet, OpenSshTransport, Operation, RemoteCommandDispatcher, SshOptions,
};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Which hosts to reach and how to log in.
#[derive(Args)]
pub struct HostArgs {
    /// Host address; repeat for several hosts, output follows this order
    #[arg(long = "host", required = true)]
    pub hosts: Vec<String>,

    /// Login user (overrides configuration)
    #[arg(long)]
    pub user: Option<String>,

    /// Password used when no key file is configured
    #[arg(long, env = "STRATUS_SSH_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

pub async fn run(
    operation: Operation,
    args: HostArgs,
    config: &StratusConfig,
) -> anyhow::Result<()> {
    let remote = &config.remote;
    let credential = match (&remote.key_file, args.password) {
        (Some(key_file), _) => Credential::KeyFile(key_file.clone()),
        (None, Some(password)) => Credential::password(password),
        (None, None) => bail!("no credential: set remote.key_file or STRATUS_SSH_PASSWORD"),
    };
    let user = args.user.unwrap_or_else(|| remote.user.clone());

    let hosts: HostSet = args
        .hosts
        .into_iter()
        .map(|address| {
            Host::new(address, user.as_str(), credential.clone()).with_port(remote.port)
        })
        .collect();

    let transport = OpenSshTransport::new(ssh_options(remote));
    let dispatcher = RemoteCommandDispatcher::new(Arc::new(transport));

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling remote operation");
            interrupt.cancel();
        }
    });

    let mut stdout = tokio::io::stdout();
    dispatcher
        .run(&hosts, &operation, &mut stdout, &cancel)
        .await?;
    Ok(())
}

fn ssh_options(remote: &RemoteConfig) -> SshOptions {
    SshOptions {
        ssh_program: remote.ssh_program.clone(),
        scp_program: remote.scp_program.clone(),
        connect_retries: remote.connect_retries,
        ..SshOptions::default()
    }
}
