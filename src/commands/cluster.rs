//! Implementation of the `cluster` command.

use std::fmt::Write as _;

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use colored::Colorize as _;

use crate::client::HttpJobService;
use crate::client::JobService;
use crate::cluster::Cluster;
use crate::cluster::ClusterUtilization;
use crate::cluster::Node;
use crate::cluster::NodeResources;
use crate::cluster::Priority;
use crate::cluster::UtilizationSummary;
use crate::commands::CommandResult;
use crate::config::Config;

/// Arguments for the `cluster` command.
#[derive(Parser, Debug)]
pub struct Args {
    /// The cluster subcommand.
    #[command(subcommand)]
    command: ClusterSubcommand,
}

/// Subcommands of the `cluster` command.
#[derive(Subcommand, Debug)]
pub enum ClusterSubcommand {
    /// Lists clusters and their nodes.
    ///
    /// Only on-premise clusters are listed unless `--cloud` is given.
    List {
        /// List cloud clusters instead.
        #[arg(long)]
        cloud: bool,
    },

    /// Shows the current use of a cluster.
    Util {
        /// The full name of the cluster, e.g. `ai2/jupiter`.
        #[arg(value_name = "CLUSTER")]
        cluster: String,

        /// Also show each node.
        #[arg(long)]
        nodes: bool,
    },
}

/// Lists the clusters of one kind with their nodes sorted by hostname.
pub async fn list_clusters<S>(service: &S, cloud: bool) -> anyhow::Result<Vec<(Cluster, Vec<Node>)>>
where
    S: JobService + ?Sized,
{
    let clusters = service
        .clusters()
        .await
        .context("failed to list clusters")?;

    let mut listed = Vec::new();
    for cluster in clusters.into_iter().filter(|c| c.cloud == cloud) {
        let mut nodes = service.cluster_nodes(&cluster.name).await.with_context(|| {
            format!(
                "failed to list the nodes of cluster `{name}`",
                name = cluster.name
            )
        })?;
        nodes.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        listed.push((cluster, nodes));
    }

    Ok(listed)
}

/// Describes a node's resources.
fn describe(resources: &NodeResources) -> String {
    format!(
        "CPUs: {cpus}, GPUs: {gpus}",
        cpus = resources.cpus,
        gpus = resources.describe_gpus()
    )
}

/// Renders a cluster and its nodes.
fn render_cluster(cluster: &Cluster, nodes: &[Node]) -> String {
    let mut out = format!(
        "{icon} {name}, {count} nodes\n",
        icon = cluster.icon(),
        name = cluster.name.magenta().bold(),
        count = nodes.len()
    );
    if let Some(spec) = &cluster.node_spec {
        let _ = writeln!(out, "  {spec}", spec = describe(spec));
    }
    for node in nodes {
        let _ = writeln!(
            out,
            "  {hostname} - {resources}",
            hostname = node.hostname.cyan().italic(),
            resources = describe(&node.resources)
        );
    }
    out
}

/// Renders the summary of a cluster's utilization.
fn render_summary(util: &ClusterUtilization, summary: &UtilizationSummary) -> String {
    let cluster = &util.cluster;
    let mut out = format!(
        "{icon} {name}\n",
        icon = cluster.icon(),
        name = cluster.name.magenta().bold()
    );
    if let Some(url) = &cluster.url {
        let _ = writeln!(out, "URL: {url}");
    }
    if cluster.require_preemptible {
        let _ = writeln!(out, "{}", "All jobs must be preemptible.".yellow());
    }
    match summary.cordoned_nodes {
        0 => {}
        1 => {
            let _ = writeln!(out, "{}", "1 node is cordoned.".yellow());
        }
        n => {
            let _ = writeln!(out, "{}", format!("{n} nodes are cordoned.").yellow());
        }
    }

    let _ = writeln!(
        out,
        "Running jobs: {total} total ({preemptible} preemptible)",
        total = util.running_jobs,
        preemptible = util.running_preemptible_jobs
    );
    for priority in Priority::ALL {
        let running = UtilizationSummary::count(&summary.running, priority);
        let _ = match priority {
            Priority::Preemptible => writeln!(out, "  {:<12} {running}", priority.as_str()),
            _ => writeln!(
                out,
                "  {:<12} {running} ({preemptible} preemptible)",
                priority.as_str(),
                preemptible = UtilizationSummary::count(&summary.running_preemptible, priority)
            ),
        };
    }

    let _ = writeln!(out, "Queued jobs: {total} total", total = util.queued_jobs);
    for priority in Priority::ALL {
        let _ = writeln!(
            out,
            "  {:<12} {queued}",
            priority.as_str(),
            queued = UtilizationSummary::count(&summary.queued, priority)
        );
    }

    let ratio = |free: u64, total: u64| {
        let text = format!("{free}/{total}");
        if free > 0 { text.green() } else { text.red() }
    };
    let _ = writeln!(
        out,
        "Free nodes: {}",
        ratio(summary.free_nodes as u64, summary.total_nodes as u64)
    );
    let _ = writeln!(
        out,
        "Free GPUs: {}",
        ratio(summary.free_gpus.into(), summary.total_gpus.into())
    );
    out
}

/// Renders each node of a cluster's utilization, sorted by hostname.
fn render_nodes(util: &ClusterUtilization) -> String {
    let mut nodes: Vec<_> = util.nodes.iter().collect();
    nodes.sort_by(|a, b| a.hostname.cmp(&b.hostname));

    let mut out = String::new();
    for node in nodes {
        let _ = write!(
            out,
            "{hostname}: {jobs} jobs ({preemptible} preemptible), ",
            hostname = node.hostname.cyan().italic(),
            jobs = node.running_jobs,
            preemptible = node.running_preemptible_jobs
        );
        if node.cordoned {
            let _ = writeln!(out, "{}", "cordoned".red());
            continue;
        }

        let _ = writeln!(
            out,
            "CPUs free: {cpus_free}/{cpus}, GPUs free: {gpus_free}/{gpus}",
            cpus_free = node.free.cpus,
            cpus = node.limits.cpus,
            gpus_free = node.free.gpus,
            gpus = node.limits.gpus
        );
    }
    out
}

/// The main function for the `cluster` command.
pub async fn cluster(args: Args, config: Config) -> CommandResult {
    let service = HttpJobService::new(&config.service)?;
    match args.command {
        ClusterSubcommand::List { cloud } => {
            let clusters = list_clusters(&service, cloud).await?;
            if clusters.is_empty() {
                eprintln!("no clusters found");
            }
            for (cluster, nodes) in &clusters {
                print!("{}", render_cluster(cluster, nodes));
            }
        }
        ClusterSubcommand::Util { cluster, nodes } => {
            let util = service
                .cluster_utilization(&cluster)
                .await
                .with_context(|| format!("failed to get the utilization of cluster `{cluster}`"))?;
            print!("{}", render_summary(&util, &util.summarize()));
            if nodes {
                println!();
                print!("{}", render_nodes(&util));
            }
        }
    }

    Ok(())
}
