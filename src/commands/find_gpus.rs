//! Implementation of the `find-gpus` command.

use std::cmp::Reverse;

use anyhow::Context;
use clap::Parser;
use colored::ColoredString;
use colored::Colorize as _;
use tracing::warn;

use crate::client::HttpJobService;
use crate::client::JobService;
use crate::cluster::Cluster;
use crate::commands::CommandResult;
use crate::config::Config;

/// The number of free GPUs below which a cluster is shown as busy.
const BUSY_BELOW: u32 = 8;

/// Arguments for the `find-gpus` command.
#[derive(Parser, Debug)]
pub struct Args {
    /// Show every cluster, not just the ones with free GPUs.
    #[arg(short, long)]
    pub all: bool,

    /// Only show clusters whose GPU type contains this text, e.g. `h100`.
    ///
    /// May be repeated.
    #[arg(short, long = "gpu-type", value_name = "TYPE")]
    pub gpu_types: Vec<String>,
}

/// A cluster and the type of its GPUs.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuAvailability {
    /// The cluster.
    pub cluster: Cluster,
    /// The GPU type, if known.
    pub gpu_type: Option<String>,
}

/// Determines the GPU type of a cluster from its node spec or its first node.
async fn gpu_type<S>(service: &S, cluster: &Cluster) -> Option<String>
where
    S: JobService + ?Sized,
{
    if let Some(ty) = cluster.node_spec.as_ref().and_then(|n| n.gpu_type.clone()) {
        return Some(ty);
    }

    match service.cluster_nodes(&cluster.name).await {
        Ok(nodes) => nodes.into_iter().next()?.resources.gpu_type,
        Err(e) => {
            warn!(
                "failed to list the nodes of cluster `{name}`: {e}",
                name = cluster.name
            );
            None
        }
    }
}

/// Finds clusters with free GPUs, most free first.
///
/// Unless `args.all` is set, clusters without free GPUs are left out.
pub async fn find_gpus<S>(service: &S, args: &Args) -> anyhow::Result<Vec<GpuAvailability>>
where
    S: JobService + ?Sized,
{
    let mut clusters = service
        .clusters()
        .await
        .context("failed to list clusters")?;
    clusters.sort_by_key(|c| Reverse(c.free_gpus()));

    let patterns: Vec<_> = args.gpu_types.iter().map(|p| p.to_lowercase()).collect();
    let mut found = Vec::new();
    for cluster in clusters {
        if !args.all && cluster.free_gpus() == 0 {
            break;
        }

        let gpu_type = gpu_type(service, &cluster).await;
        if !patterns.is_empty() {
            let Some(ty) = &gpu_type else {
                continue;
            };
            let ty = ty.to_lowercase();
            if !patterns.iter().any(|p| ty.contains(p.as_str())) {
                continue;
            }
        }

        found.push(GpuAvailability { cluster, gpu_type });
    }

    Ok(found)
}

/// Colors a count of free GPUs.
fn colored_free(free: u32) -> ColoredString {
    let text = format!("{free:>4}");
    match free {
        0 => text.red(),
        n if n < BUSY_BELOW => text.yellow(),
        _ => text.green(),
    }
}

/// Renders a row of the listing.
fn row(entry: &GpuAvailability, name_width: usize, type_width: usize) -> String {
    let slots = entry.cluster.slots.unwrap_or_default();
    let mut row = format!(
        "{name}  {free}  {ty:<type_width$}  {assigned}/{total}",
        name = format!("{name:<name_width$}", name = entry.cluster.name)
            .cyan()
            .bold(),
        free = colored_free(slots.available),
        ty = entry.gpu_type.as_deref().unwrap_or("UNKNOWN"),
        assigned = slots.assigned,
        total = slots.total,
    );
    if let Some(url) = &entry.cluster.url {
        row.push_str("  ");
        row.push_str(url);
    }
    row
}

/// The main function for the `find-gpus` command.
pub async fn find(args: Args, config: Config) -> CommandResult {
    let service = HttpJobService::new(&config.service)?;
    let found = find_gpus(&service, &args).await?;
    if found.is_empty() {
        eprintln!("no clusters with free GPUs found");
        return Ok(());
    }

    let name_width = found
        .iter()
        .map(|e| e.cluster.name.len())
        .max()
        .unwrap_or_default();
    let type_width = found
        .iter()
        .map(|e| e.gpu_type.as_deref().unwrap_or("UNKNOWN").len())
        .max()
        .unwrap_or_default();
    for entry in &found {
        println!("{}", row(entry, name_width, type_width));
    }

    Ok(())
}
