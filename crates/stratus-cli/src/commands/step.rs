//! Implementation of the `stratus step` commands.

use clap::{Args, Subcommand};
use stratus_control::{ControlResult, StepSpec, StratusConfig};

use super::cluster::{self, ClusterName};

#[derive(Args)]
pub struct StepArgs {
    #[command(subcommand)]
    command: StepCommand,
}

#[derive(Subcommand)]
enum StepCommand {
    /// Submit a job step to the named cluster
    Submit {
        /// Cluster to run on
        #[arg(long = "cluster")]
        cluster: String,

        /// Step name
        #[arg(long)]
        name: String,

        /// Job artifact (jar or script location)
        #[arg(long)]
        artifact: String,

        /// Entry point inside the artifact
        #[arg(long)]
        entry_point: String,

        /// Input location
        #[arg(long)]
        input: String,

        /// Output location
        #[arg(long)]
        output: String,

        /// Wait for the step to finish and print its metadata
        #[arg(long)]
        wait: bool,

        /// Extra arguments passed to the job
        #[arg(last = true)]
        args: Vec<String>,
    },
}

pub async fn run(args: StepArgs, config: &StratusConfig) -> ControlResult<()> {
    let StepCommand::Submit {
        cluster,
        name,
        artifact,
        entry_point,
        input,
        output,
        wait,
        args,
    } = args.command;

    let cluster = cluster::open(ClusterName { name: cluster }, config)?;
    cluster.connect_by_name().await?;

    let spec = StepSpec::new(name, artifact, entry_point, input, output).with_args(args);
    let step = cluster.submit_step(spec).await?;
    println!("Submitted step {} as #{}", step.name(), step.index());

    if !wait {
        return Ok(());
    }

    step.join().await?;
    println!("Step {} {}", step.name(), step.status());

    let metadata = step.metadata().await?;
    for (key, value) in metadata.iter() {
        println!("  {key} = {value}");
    }
    Ok(())
}
