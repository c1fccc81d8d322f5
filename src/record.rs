//! What happened to every node of one subject's run.

use std::fmt::Write as _;
use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use console::Style;

use crate::core::Fingerprint;
use crate::error::Logs;
use crate::graph::PipelineGraph;
use crate::tool::Outputs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Reused from the artifact store without running.
    SkippedCached,
    /// Never ran because something it depends on failed.
    FailedUpstream,
    Cancelled,
}

impl NodeStatus {
    /// Whether the node's outputs are available downstream.
    pub fn is_done(self) -> bool {
        matches!(self, NodeStatus::Succeeded | NodeStatus::SkippedCached)
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, NodeStatus::Pending | NodeStatus::Running)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Succeeded => "succeeded",
            NodeStatus::Failed => "failed",
            NodeStatus::SkippedCached => "skipped-cached",
            NodeStatus::FailedUpstream => "failed-upstream",
            NodeStatus::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone)]
pub struct NodeResult {
    pub name: String,
    pub status: NodeStatus,
    pub outputs: Outputs,
    pub fingerprint: Option<Fingerprint>,
    /// Executions started for this node, 0 when cached or never reached.
    pub attempts: u32,
    pub duration: Duration,
    pub error: Option<String>,
    pub logs: Logs,
}

impl NodeResult {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: NodeStatus::Pending,
            outputs: Outputs::new(),
            fingerprint: None,
            attempts: 0,
            duration: Duration::ZERO,
            error: None,
            logs: Logs::default(),
        }
    }
}

/// Per-node results for one subject, indexed like the graph's nodes.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub label: String,
    pub results: Vec<NodeResult>,
    pub cancelled: bool,
}

impl RunRecord {
    pub fn new(graph: &PipelineGraph) -> Self {
        Self {
            label: graph.manifest().label(),
            results: graph
                .nodes()
                .map(|(_, node)| NodeResult::new(node.name.clone()))
                .collect(),
            cancelled: false,
        }
    }

    /// Every node succeeded or was reused.
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.results.iter().all(|r| r.status.is_done())
    }

    pub fn result(&self, name: &str) -> Option<&NodeResult> {
        self.results.iter().find(|r| r.name == name)
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &NodeResult> {
        self.results
            .iter()
            .filter(|r| r.status == NodeStatus::Failed)
    }

    /// One line per node, colored by status.
    pub fn summary(&self) -> String {
        let mut out = String::new();

        for result in &self.results {
            let style = match result.status {
                NodeStatus::Succeeded => Style::new().green(),
                NodeStatus::SkippedCached => Style::new().blue(),
                NodeStatus::Failed | NodeStatus::FailedUpstream => Style::new().red(),
                _ => Style::new().yellow(),
            };

            let _ = write!(
                out,
                "  {:<24} {}",
                result.name,
                style.apply_to(result.status)
            );

            if result.attempts > 1 {
                let _ = write!(out, " after {} attempts", result.attempts);
            }

            if result.status == NodeStatus::Succeeded {
                let _ = write!(out, " ({:.2?})", result.duration);
            }

            out.push('\n');
        }

        out
    }

    /// Writes the error and captured logs of every failed node to
    /// `<dir>/<label>/<node>.log` and returns the files written.
    pub fn write_failure_logs(&self, dir: &Utf8Path) -> std::io::Result<Vec<Utf8PathBuf>> {
        let mut written = Vec::new();

        for result in self.failed() {
            let subject_dir = dir.join(&self.label);
            fs::create_dir_all(&subject_dir)?;

            let path = subject_dir.join(format!("{}.log", result.name));
            let mut text = format!(
                "node: {}\nsubject: {}\nattempts: {}\n",
                result.name, self.label, result.attempts
            );

            if let Some(error) = &result.error {
                let _ = writeln!(text, "error: {error}");
            }

            let _ = writeln!(text, "{}", result.logs);

            fs::write(&path, text)?;
            written.push(path);
        }

        Ok(written)
    }

    /// Renders the graph as a Mermaid diagram colored by node status.
    pub fn render_mermaid(&self, graph: &PipelineGraph) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        for (index, node) in graph.nodes() {
            let Some(result) = self.results.get(index.index()) else {
                continue;
            };

            let color = match result.status {
                NodeStatus::Succeeded => "#90EE90",
                NodeStatus::SkippedCached => "#ADD8E6",
                NodeStatus::Failed => "#FF7F7F",
                NodeStatus::FailedUpstream => "#FFB6C1",
                NodeStatus::Cancelled => "#D3D3D3",
                NodeStatus::Pending | NodeStatus::Running => "#FFFFE0",
            };

            let name = node.name.replace('"', "\\\"");
            let _ = writeln!(
                f,
                "    {}[\"{}\\n{}\"]",
                index.index(),
                name,
                result.status
            );
            let _ = writeln!(f, "    style {} fill:{}", index.index(), color);

            for dependency in &node.dependencies {
                let _ = writeln!(f, "    {} --> {}", dependency.index(), index.index());
            }
        }

        f
    }
}
