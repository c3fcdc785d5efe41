//! Stratus CLI - operate clusters and run commands on their hosts.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use stratus_control::StratusConfig;
use stratus_remote::Operation;

use commands::cluster::ClusterArgs;
use commands::remote::HostArgs;
use commands::step::StepArgs;

#[derive(Parser)]
#[command(name = "stratus")]
#[command(about = "Operate named compute clusters and dispatch work to their hosts")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to stratus.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the lifecycle of a named cluster
    Cluster(ClusterArgs),

    /// Submit work steps to a running cluster
    Step(StepArgs),

    /// Run a shell command on hosts
    Exec {
        #[command(flatten)]
        hosts: HostArgs,

        /// Command line to run
        command: String,
    },

    /// Run a local script on hosts
    ExecFile {
        #[command(flatten)]
        hosts: HostArgs,

        /// Script to stream to the remote shell
        script: PathBuf,
    },

    /// Copy a local file or directory to hosts
    Upload {
        #[command(flatten)]
        hosts: HostArgs,

        /// Local source
        local: PathBuf,

        /// Remote destination
        remote: String,
    },

    /// Copy a remote path from hosts
    Download {
        #[command(flatten)]
        hosts: HostArgs,

        /// Copy directories recursively
        #[arg(short, long)]
        recursive: bool,

        /// Remote source
        remote: String,

        /// Local directory receiving the copy
        local_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => StratusConfig::from_file(path)?,
        None => StratusConfig::load()?,
    };

    match cli.command {
        Commands::Cluster(args) => commands::cluster::run(args, &config).await?,
        Commands::Step(args) => commands::step::run(args, &config).await?,
        Commands::Exec { hosts, command } => {
            commands::remote::run(Operation::Execute(command), hosts, &config).await?;
        }
        Commands::ExecFile { hosts, script } => {
            commands::remote::run(Operation::ExecuteFile(script), hosts, &config).await?;
        }
        Commands::Upload {
            hosts,
            local,
            remote,
        } => {
            commands::remote::run(Operation::Upload { local, remote }, hosts, &config).await?;
        }
        Commands::Download {
            hosts,
            recursive,
            remote,
            local_dir,
        } => {
            let operation = Operation::Download {
                remote,
                local_dir,
                recursive,
            };
            commands::remote::run(operation, hosts, &config).await?;
        }
    }
    Ok(())
}
