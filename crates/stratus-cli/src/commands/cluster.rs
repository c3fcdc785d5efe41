//! Implementation of the `stratus cluster` commands.

use clap::{Args, Subcommand};
use stratus_control::{
    create_control_service, Cluster, ClusterDescription, ClusterId, ClusterSpec, ControlResult,
    ControlService, StratusConfig, ThrottleGuard,
};

#[derive(Args)]
pub struct ClusterArgs {
    #[command(subcommand)]
    command: ClusterCommand,
}

/// Selects the cluster by name.
#[derive(Args)]
pub struct ClusterName {
    /// Cluster name
    #[arg(long)]
    pub name: String,
}

#[derive(Subcommand)]
enum ClusterCommand {
    /// Create the cluster and wait until it is ready
    Start {
        #[command(flatten)]
        cluster: ClusterName,

        /// Total number of instances, master included
        #[arg(long, default_value_t = 1)]
        instances: u32,

        /// Key pair installed on every node
        #[arg(long)]
        key_name: Option<String>,

        /// Where the control plane writes cluster logs
        #[arg(long)]
        log_uri: Option<String>,

        /// Do not record per-step debugging metadata
        #[arg(long)]
        no_debugging: bool,
    },

    /// Attach to a running cluster
    Connect {
        #[command(flatten)]
        cluster: ClusterName,

        /// Attach to this identity instead of looking the name up
        #[arg(long)]
        id: Option<String>,
    },

    /// Reconcile with the control plane and print the result
    Sync {
        #[command(flatten)]
        cluster: ClusterName,
    },

    /// List live clusters carrying the name without attaching to them
    Status {
        #[command(flatten)]
        cluster: ClusterName,
    },

    /// Wait for running steps, then terminate the cluster
    Shutdown {
        #[command(flatten)]
        cluster: ClusterName,
    },
}

pub async fn run(args: ClusterArgs, config: &StratusConfig) -> ControlResult<()> {
    match args.command {
        ClusterCommand::Start {
            cluster,
            instances,
            key_name,
            log_uri,
            no_debugging,
        } => {
            let mut spec = ClusterSpec::new(cluster.name).with_instance_count(instances);
            spec.key_name = key_name;
            spec.log_uri = log_uri;
            spec.enable_debugging = !no_debugging;

            let cluster = Cluster::from_config(spec, config)?;
            cluster.start().await?;
            print_cluster(&cluster);
        }
        ClusterCommand::Connect { cluster, id } => {
            let cluster = open(cluster, config)?;
            match id {
                Some(id) => cluster.connect_by_id(&ClusterId::new(id)).await?,
                None => cluster.connect_by_name().await?,
            }
            print_cluster(&cluster);
        }
        ClusterCommand::Sync { cluster } => {
            let cluster = open(cluster, config)?;
            cluster.synchronize_state().await?;
            print_cluster(&cluster);
        }
        ClusterCommand::Status { cluster } => {
            let (control, _) = create_control_service(&config.control)?;
            let throttle = ThrottleGuard::new(&config.throttle);
            let ids = throttle
                .call("list_by_name", || control.list_by_name(&cluster.name))
                .await?;
            let descriptions = throttle
                .call("describe", || control.describe_all(&ids))
                .await?;
            for line in status_lines(&cluster.name, &descriptions) {
                println!("{line}");
            }
        }
        ClusterCommand::Shutdown { cluster } => {
            let cluster = open(cluster, config)?;
            cluster.connect_by_name().await?;
            let id = cluster.cluster_id();
            cluster.shutdown().await?;
            if let Some(id) = id {
                println!("Terminating {} ({id})", cluster.name());
            }
        }
    }
    Ok(())
}

/// An unconnected view of the named cluster.
pub fn open(cluster: ClusterName, config: &StratusConfig) -> ControlResult<Cluster> {
    Cluster::from_config(ClusterSpec::new(cluster.name), config)
}

fn print_cluster(cluster: &Cluster) {
    let snapshot = cluster.snapshot();
    match snapshot.id {
        Some(id) => println!("{}: {} ({id})", cluster.name(), snapshot.state),
        None => println!("{}: {}", cluster.name(), snapshot.state),
    }
}

/// One line per live cluster carrying `name`.
fn status_lines(name: &str, descriptions: &[ClusterDescription]) -> Vec<String> {
    if descriptions.is_empty() {
        return vec![format!("{name}: no live cluster")];
    }
    descriptions
        .iter()
        .map(|d| match &d.address {
            Some(address) => format!("{name}: {} ({}) at {address}", d.state, d.id),
            None => format!("{name}: {} ({})", d.state, d.id),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use stratus_control::ResourceState;

    use super::*;

    fn description(id: &str, state: ResourceState, address: Option<&str>) -> ClusterDescription {
        ClusterDescription {
            id: ClusterId::new(id),
            name: "etl".to_owned(),
            state,
            address: address.map(str::to_owned),
            attributes: Default::default(),
            created_at: Default::default(),
        }
    }

    #[test]
    fn status_reports_missing_cluster() {
        assert_eq!(status_lines("etl", &[]), vec!["etl: no live cluster"]);
    }

    #[test]
    fn status_lists_every_match() {
        let lines = status_lines(
            "etl",
            &[
                description("c-1", ResourceState::Ready, Some("10.0.0.5")),
                description("c-2", ResourceState::Creating, None),
            ],
        );
        assert_eq!(
            lines,
            vec!["etl: ready (c-1) at 10.0.0.5", "etl: creating (c-2)"]
        );
    }
}
