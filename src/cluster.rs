//! The cluster model reported by the job service.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// The compute resources of a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct NodeResources {
    /// The number of CPUs.
    pub cpus: f64,
    /// The number of GPUs.
    pub gpus: u32,
    /// The model of the GPUs, if the node has any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_type: Option<String>,
}

impl NodeResources {
    /// Describes the GPUs, e.g. `8 x H100`.
    pub fn describe_gpus(&self) -> String {
        match &self.gpu_type {
            Some(ty) => format!("{gpus} x {ty}", gpus = self.gpus),
            None => self.gpus.to_string(),
        }
    }
}

/// The scheduling slots of a cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct SlotCounts {
    /// Slots free for new jobs.
    pub available: u32,
    /// Slots held by jobs.
    pub assigned: u32,
    /// Every slot.
    pub total: u32,
}

/// A cluster jobs can be submitted to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Cluster {
    /// The full name of the cluster, e.g. `ai2/jupiter`.
    pub name: String,
    /// The web page of the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Whether the cluster runs on cloud machines.
    #[serde(default)]
    pub cloud: bool,
    /// Whether every job on the cluster must be preemptible.
    #[serde(default)]
    pub require_preemptible: bool,
    /// The resources of each node, for clusters of uniform nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_spec: Option<NodeResources>,
    /// The cluster's GPU slots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slots: Option<SlotCounts>,
}

impl Cluster {
    /// Gets the number of free GPU slots.
    pub fn free_gpus(&self) -> u32 {
        self.slots.map(|s| s.available).unwrap_or_default()
    }

    /// Gets the icon shown next to the cluster's name.
    pub fn icon(&self) -> &'static str {
        if self.cloud { "☁️" } else { "🏠" }
    }
}

/// A node of a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Node {
    /// The node's hostname.
    pub hostname: String,
    /// The node's resources.
    #[serde(default)]
    pub resources: NodeResources,
}

/// The priority of a job on a cluster, from highest to lowest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Urgent priority.
    Urgent,
    /// High priority.
    High,
    /// Normal priority.
    Normal,
    /// Low priority.
    Low,
    /// Preemptible priority.
    Preemptible,
}

impl Priority {
    /// Every priority, from highest to lowest.
    pub const ALL: [Self; 5] = [
        Self::Urgent,
        Self::High,
        Self::Normal,
        Self::Low,
        Self::Preemptible,
    ];

    /// Gets the display name of the priority.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
            Self::Preemptible => "preemptible",
        }
    }
}

/// The use of a single node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NodeUtilization {
    /// The node's hostname.
    pub hostname: String,
    /// The node's resources.
    #[serde(default)]
    pub limits: NodeResources,
    /// The resources no job holds.
    #[serde(default)]
    pub free: NodeResources,
    /// The number of jobs running on the node.
    #[serde(default)]
    pub running_jobs: u32,
    /// The number of preemptible jobs running on the node.
    #[serde(default)]
    pub running_preemptible_jobs: u32,
    /// Whether the node accepts no new jobs.
    #[serde(default)]
    pub cordoned: bool,
}

/// A job counted in a cluster's utilization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ClusterJob {
    /// The job's priority; jobs without one are not counted by priority.
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Whether the job is running.
    #[serde(default)]
    pub running: bool,
    /// Whether the job is waiting for resources.
    #[serde(default)]
    pub queued: bool,
    /// Whether the job may be preempted.
    #[serde(default)]
    pub preemptible: bool,
}

/// The current use of a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ClusterUtilization {
    /// The cluster.
    pub cluster: Cluster,
    /// The use of each node.
    #[serde(default)]
    pub nodes: Vec<NodeUtilization>,
    /// The jobs running or queued on the cluster.
    #[serde(default)]
    pub jobs: Vec<ClusterJob>,
    /// The number of running jobs.
    #[serde(default)]
    pub running_jobs: u32,
    /// The number of running preemptible jobs.
    #[serde(default)]
    pub running_preemptible_jobs: u32,
    /// The number of queued jobs.
    #[serde(default)]
    pub queued_jobs: u32,
}

/// Totals computed from a [`ClusterUtilization`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtilizationSummary {
    /// Nodes that are not cordoned and run no jobs.
    pub free_nodes: usize,
    /// Every node.
    pub total_nodes: usize,
    /// Cordoned nodes.
    pub cordoned_nodes: usize,
    /// Free GPUs on nodes that are not cordoned.
    pub free_gpus: u32,
    /// Every GPU, cordoned nodes included.
    pub total_gpus: u32,
    /// Running jobs by priority.
    pub running: BTreeMap<Priority, u32>,
    /// Running preemptible jobs by priority.
    pub running_preemptible: BTreeMap<Priority, u32>,
    /// Queued jobs by priority.
    pub queued: BTreeMap<Priority, u32>,
}

impl UtilizationSummary {
    /// Looks up a per-priority count.
    pub fn count(counts: &BTreeMap<Priority, u32>, priority: Priority) -> u32 {
        counts.get(&priority).copied().unwrap_or_default()
    }
}

impl ClusterUtilization {
    /// Computes the totals shown for the cluster.
    pub fn summarize(&self) -> UtilizationSummary {
        let mut summary = UtilizationSummary {
            total_nodes: self.nodes.len(),
            ..Default::default()
        };

        for node in &self.nodes {
            summary.total_gpus += node.limits.gpus;
            if node.cordoned {
                summary.cordoned_nodes += 1;
                continue;
            }

            if node.running_jobs == 0 {
                summary.free_nodes += 1;
            }
            summary.free_gpus += node.free.gpus;
        }

        for job in &self.jobs {
            let Some(priority) = job.priority else {
                continue;
            };

            if job.running {
                *summary.running.entry(priority).or_default() += 1;
                if job.preemptible {
                    *summary.running_preemptible.entry(priority).or_default() += 1;
                }
            } else if job.queued {
                *summary.queued.entry(priority).or_default() += 1;
            }
        }

        summary
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn node(hostname: &str, free_gpus: u32, running_jobs: u32, cordoned: bool) -> NodeUtilization {
        NodeUtilization {
            hostname: hostname.to_string(),
            limits: NodeResources {
                cpus: 64.0,
                gpus: 8,
                gpu_type: Some("H100".to_string()),
            },
            free: NodeResources {
                cpus: 8.0,
                gpus: free_gpus,
                gpu_type: Some("H100".to_string()),
            },
            running_jobs,
            running_preemptible_jobs: 0,
            cordoned,
        }
    }

    fn job(priority: Option<Priority>, running: bool, preemptible: bool) -> ClusterJob {
        ClusterJob {
            priority,
            running,
            queued: !running,
            preemptible,
        }
    }

    #[test]
    fn summaries_skip_cordoned_nodes() {
        let util = ClusterUtilization {
            cluster: Cluster {
                name: "ai2/jupiter".to_string(),
                url: None,
                cloud: false,
                require_preemptible: false,
                node_spec: None,
                slots: None,
            },
            nodes: vec![
                node("a", 8, 0, false),
                node("b", 2, 3, false),
                node("c", 8, 0, true),
            ],
            jobs: vec![
                job(Some(Priority::High), true, true),
                job(Some(Priority::High), true, false),
                job(Some(Priority::Low), false, false),
                job(None, true, false),
            ],
            running_jobs: 3,
            running_preemptible_jobs: 1,
            queued_jobs: 1,
        };

        let summary = util.summarize();
        assert_eq!(summary.free_nodes, 1);
        assert_eq!(summary.total_nodes, 3);
        assert_eq!(summary.cordoned_nodes, 1);
        assert_eq!(summary.free_gpus, 10);
        assert_eq!(summary.total_gpus, 24);
        assert_eq!(
            UtilizationSummary::count(&summary.running, Priority::High),
            2
        );
        assert_eq!(
            UtilizationSummary::count(&summary.running_preemptible, Priority::High),
            1
        );
        assert_eq!(UtilizationSummary::count(&summary.queued, Priority::Low), 1);
        assert_eq!(
            UtilizationSummary::count(&summary.running, Priority::Urgent),
            0
        );
    }

    #[test]
    fn clusters_deserialize_with_defaults() {
        let cluster: Cluster = serde_json::from_str(
            r#"{"name": "ai2/augusta", "cloud": true, "slots": {"available": 4, "total": 16}}"#,
        )
        .unwrap();
        assert_eq!(cluster.free_gpus(), 4);
        assert_eq!(cluster.slots.unwrap().assigned, 0);
        assert!(cluster.node_spec.is_none());
        assert_eq!(cluster.icon(), "☁️");
    }

    #[test]
    fn gpu_descriptions() {
        let mut resources = NodeResources {
            cpus: 1.0,
            gpus: 8,
            gpu_type: Some("H100".to_string()),
        };
        assert_eq!(resources.describe_gpus(), "8 x H100");
        resources.gpu_type = None;
        assert_eq!(resources.describe_gpus(), "8");
    }
}
