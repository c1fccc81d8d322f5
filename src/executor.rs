//! Dependency-driven parallel execution of one subject's graph.
//!
//! The coordinator runs on the calling thread and owns all bookkeeping.
//! Attempts run on a dedicated rayon pool whose size is the concurrency
//! limit, and report back over a channel. The coordinator loop:
//!
//! 1. Pops ready nodes in declaration order while fewer than
//!    `max_concurrency` attempts are in flight.
//! 2. Fingerprints each popped node. If the store already holds every output
//!    for that fingerprint the node is reused without running.
//! 3. Otherwise spawns an attempt, which runs the adapter in a fresh working
//!    directory and commits the result to the store.
//! 4. On completion, releases dependents, retries transient failures, or
//!    marks every descendant as failed upstream.
//!
//! Cancellation stops dispatch; running attempts observe the same token and
//! kill their subprocess.

use std::collections::{BTreeSet, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use petgraph::graph::NodeIndex;
use rayon::ThreadPool;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::{CancelToken, Fingerprint, FingerprintBuilder, Settings};
use crate::error::{ConfigError, ToolError};
use crate::graph::{Binding, Node, PipelineGraph};
use crate::record::{NodeStatus, RunRecord};
use crate::store::{ArtifactKey, ArtifactStore, DONE_MARKER};
use crate::tool::{Outputs, Params, ToolAdapter, ToolOutput, WorkDir};
use crate::utils::{STYLE_NODE, STYLE_RUN, as_overhead};

/// Bumped whenever the fingerprint layout changes, invalidating old caches.
const FINGERPRINT_DOMAIN: &str = "neuroflow/fingerprint/v1";

struct Completion {
    index: usize,
    attempt: u32,
    result: Result<ToolOutput, ToolError>,
    duration: Duration,
}

/// Executes graphs against a shared artifact store.
pub struct Scheduler<'a> {
    settings: Settings,
    store: &'a ArtifactStore,
    adapter: ToolAdapter,
    cancel: CancelToken,
    pool: ThreadPool,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        settings: &Settings,
        store: &'a ArtifactStore,
        cancel: CancelToken,
    ) -> Result<Self, ConfigError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.max_concurrency.max(1))
            .thread_name(|i| format!("neuroflow-worker-{i}"))
            .build()?;

        Ok(Self {
            settings: settings.clone(),
            store,
            adapter: ToolAdapter::new(settings, cancel.clone()),
            cancel,
            pool,
        })
    }

    pub fn adapter(&self) -> &ToolAdapter {
        &self.adapter
    }

    pub fn store(&self) -> &ArtifactStore {
        self.store
    }

    /// Runs every node of `graph` that can run and reports what happened to
    /// each of them. Node failures are recorded, never returned.
    pub fn execute(&self, graph: &PipelineGraph) -> RunRecord {
        let mut record = RunRecord::new(graph);
        let label = record.label.clone();
        let total = graph.len();

        if total == 0 {
            return record;
        }

        let max_in_flight = self.settings.max_concurrency.max(1);
        let start = Instant::now();

        let mut remaining: Vec<usize> = graph
            .nodes()
            .map(|(_, node)| node.dependencies.len())
            .collect();
        let mut ready: BTreeSet<usize> = (0..total).filter(|&i| remaining[i] == 0).collect();
        let mut digests: HashMap<Utf8PathBuf, Fingerprint> = HashMap::new();
        let mut in_flight = 0usize;

        let root_span = tracing::info_span!("subject", label = label.as_str());
        root_span.pb_set_length(total as u64);
        root_span.pb_set_style(&STYLE_RUN);
        root_span.pb_set_message(&format!("Processing {label}"));
        let _enter = root_span.enter();

        self.pool.in_place_scope(|s| {
            let (tx, rx) = channel::<Completion>();

            let spawn = |index: usize, attempt: u32, params: Params, fingerprint: Fingerprint| {
                let tx = tx.clone();
                let node = graph.node(NodeIndex::new(index));
                let label = label.as_str();
                let parent = root_span.clone();

                s.spawn(move |_| {
                    let span = tracing::info_span!(parent: &parent, "node", name = node.name.as_str());
                    span.pb_set_style(&STYLE_NODE);
                    span.pb_set_message(&format!("{} (attempt {attempt})", node.name));
                    let _enter = span.enter();

                    let start = Instant::now();
                    let result = catch_unwind(AssertUnwindSafe(|| {
                        self.attempt(label, node, &params, fingerprint, attempt)
                    }))
                    .unwrap_or_else(|panic| Err(ToolError::Panic(panic_message(panic))));

                    let _ = tx.send(Completion {
                        index,
                        attempt,
                        result,
                        duration: start.elapsed(),
                    });
                });
            };

            // Params are kept so a retry runs the exact same invocation.
            let mut prepared: HashMap<usize, Params> = HashMap::new();

            loop {
                while in_flight < max_in_flight && !self.cancel.is_cancelled() {
                    let Some(index) = ready.pop_first() else {
                        break;
                    };

                    let node = graph.node(NodeIndex::new(index));

                    let (params, fingerprint) = match prepare(node, &record, &mut digests) {
                        Ok(prepared) => prepared,
                        Err(err) => {
                            tracing::error!("{label}: couldn't prepare {}: {err}", node.name);
                            fail(graph, &mut record, index, err);
                            root_span.pb_set_position(settled(&record));
                            continue;
                        }
                    };

                    record.results[index].fingerprint = Some(fingerprint);

                    if let Some(outputs) = self.cached(&label, node, fingerprint) {
                        tracing::info!("{label}: {} is up to date", node.name);
                        let result = &mut record.results[index];
                        result.status = NodeStatus::SkippedCached;
                        result.outputs = outputs;
                        release(graph, &record, index, &mut remaining, &mut ready);
                        root_span.pb_set_position(settled(&record));
                        continue;
                    }

                    let result = &mut record.results[index];
                    result.status = NodeStatus::Running;
                    result.attempts = 1;

                    spawn(index, 1, params.clone(), fingerprint);
                    prepared.insert(index, params);
                    in_flight += 1;
                }

                if in_flight == 0 {
                    break;
                }

                let Ok(done) = rx.recv() else {
                    break;
                };
                in_flight -= 1;

                let node = graph.node(NodeIndex::new(done.index));
                let result = &mut record.results[done.index];
                result.duration += done.duration;

                match done.result {
                    Ok(output) => {
                        tracing::info!(
                            "{label}: {} finished {}",
                            node.name,
                            as_overhead(Instant::now() - done.duration)
                        );
                        result.status = NodeStatus::Succeeded;
                        result.outputs = output.outputs;
                        result.logs = output.logs;
                        prepared.remove(&done.index);
                        release(graph, &record, done.index, &mut remaining, &mut ready);
                    }
                    // After cancellation no error is the node's own failure.
                    Err(err)
                        if matches!(err, ToolError::Cancelled) || self.cancel.is_cancelled() =>
                    {
                        result.status = NodeStatus::Cancelled;
                        result.error = Some(ToolError::Cancelled.to_string());
                        result.logs = err.logs().cloned().unwrap_or_default();
                        prepared.remove(&done.index);
                    }
                    Err(err)
                        if err.is_transient(&self.settings.transient_exit_codes)
                            && done.attempt <= self.settings.retries =>
                    {
                        tracing::warn!(
                            "{label}: {} failed transiently (attempt {}), retrying: {}",
                            node.name,
                            done.attempt,
                            first_line(&err)
                        );

                        let attempt = done.attempt + 1;
                        result.attempts = attempt;

                        let params = prepared.get(&done.index).cloned().unwrap_or_default();
                        let fingerprint = result.fingerprint.unwrap_or_default();
                        spawn(done.index, attempt, params, fingerprint);
                        in_flight += 1;
                    }
                    Err(err) => {
                        tracing::error!("{label}: {} failed: {}", node.name, first_line(&err));
                        prepared.remove(&done.index);
                        fail(graph, &mut record, done.index, err);
                    }
                }

                root_span.pb_set_position(settled(&record));
            }
        });

        if self.cancel.is_cancelled() {
            record.cancelled = true;

            for result in &mut record.results {
                if !result.status.is_terminal() {
                    result.status = NodeStatus::Cancelled;
                }
            }
        }

        tracing::info!(
            "{label}: {} run, {} reused, {} failed {}",
            record.count(NodeStatus::Succeeded),
            record.count(NodeStatus::SkippedCached),
            record.count(NodeStatus::Failed) + record.count(NodeStatus::FailedUpstream),
            as_overhead(start)
        );

        record
    }

    /// Outputs of `node` when every one of them is in the store for
    /// `fingerprint` and still on disk.
    fn cached(&self, label: &str, node: &Node, fingerprint: Fingerprint) -> Option<Outputs> {
        if node.outputs.is_empty() {
            let key = ArtifactKey::new(label, &node.name, DONE_MARKER);
            return self.store.lookup(&key, fingerprint).map(|_| Outputs::new());
        }

        let mut outputs = Outputs::new();

        for name in node.outputs.keys() {
            let key = ArtifactKey::new(label, &node.name, name);
            let artifact = self.store.lookup(&key, fingerprint)?;
            outputs.insert(name.clone(), artifact.paths);
        }

        Some(outputs)
    }

    /// One execution of `node`, from empty working directory to registered
    /// artifacts.
    fn attempt(
        &self,
        label: &str,
        node: &Node,
        params: &Params,
        fingerprint: Fingerprint,
        attempt: u32,
    ) -> Result<ToolOutput, ToolError> {
        if attempt > 1 {
            self.pause(self.settings.retry_delay);
        }

        let workdir = WorkDir::create(attempt_dir(&self.settings, label, &node.name, attempt))?;
        let timeout = node.timeout.or(self.settings.default_timeout);

        let output = match self
            .adapter
            .run(&node.adapter, params, &node.outputs, &workdir, timeout)
        {
            Ok(output) => output,
            Err(err) => {
                if self.settings.keep_failed_workdirs && !matches!(err, ToolError::Cancelled) {
                    let kept = workdir.keep();
                    tracing::debug!("kept working directory {kept} for inspection");
                }
                return Err(err);
            }
        };

        let outputs = self
            .store
            .commit_dir(workdir, label, &node.name, fingerprint, &output.outputs)?;

        Ok(ToolOutput {
            outputs,
            logs: output.logs,
        })
    }

    /// Sleeps for `delay`, waking early on cancellation.
    fn pause(&self, delay: Duration) {
        let until = Instant::now() + delay;

        while !self.cancel.is_cancelled() {
            let now = Instant::now();
            if now >= until {
                break;
            }
            std::thread::sleep(self.settings.poll_interval.min(until - now));
        }
    }
}

/// Resolves the parameters of `node` and computes its fingerprint from the
/// tool identity, parameter values, input file contents, upstream
/// fingerprints and declared outputs.
fn prepare(
    node: &Node,
    record: &RunRecord,
    digests: &mut HashMap<Utf8PathBuf, Fingerprint>,
) -> Result<(Params, Fingerprint), ToolError> {
    let mut fp = FingerprintBuilder::new(FINGERPRINT_DOMAIN);
    fp.field("node", &node.name)
        .field("tool", node.adapter.identity());

    let mut params = Params::new();

    for (key, binding) in &node.params {
        fp.field("param", key);

        let values = match binding {
            Binding::Literal(values) => {
                fp.field("count", (values.len() as u64).to_le_bytes());
                for value in values {
                    fp.field("literal", value);
                }
                values.clone()
            }
            Binding::Input { paths, .. } => {
                fp.field("count", (paths.len() as u64).to_le_bytes());
                let mut values = Vec::with_capacity(paths.len());

                for path in paths {
                    let path = path.canonicalize_utf8()?;
                    let digest = match digests.get(&path) {
                        Some(digest) => *digest,
                        None => {
                            let digest = Fingerprint::hash_file(&path)?;
                            digests.insert(path.clone(), digest);
                            digest
                        }
                    };

                    fp.field("file", path.file_name().unwrap_or_default())
                        .fingerprint("content", digest);
                    values.push(path.into_string());
                }

                values
            }
            Binding::Upstream { node, output, .. } => {
                let upstream = &record.results[node.index()];
                let paths = upstream.outputs.get(output).cloned().unwrap_or_default();

                fp.fingerprint("upstream", upstream.fingerprint.unwrap_or_default())
                    .field("output", output);

                paths.into_iter().map(Utf8PathBuf::into_string).collect()
            }
        };

        params.insert(key.clone(), values);
    }

    for (name, pattern) in &node.outputs {
        fp.field("out", name).field("pattern", pattern);
    }

    Ok((params, fp.finish()))
}

/// Marks dependents of a finished node whose dependencies are all done as
/// ready.
fn release(
    graph: &PipelineGraph,
    record: &RunRecord,
    index: usize,
    remaining: &mut [usize],
    ready: &mut BTreeSet<usize>,
) {
    for dependent in graph.dependents(NodeIndex::new(index)) {
        let dependent = dependent.index();
        remaining[dependent] -= 1;

        if remaining[dependent] == 0 && record.results[dependent].status == NodeStatus::Pending {
            ready.insert(dependent);
        }
    }
}

/// Records the failure of `index` and propagates it to every pending
/// descendant.
fn fail(graph: &PipelineGraph, record: &mut RunRecord, index: usize, err: ToolError) {
    let name = graph.node(NodeIndex::new(index)).name.clone();
    let result = &mut record.results[index];

    result.status = NodeStatus::Failed;
    result.logs = err.logs().cloned().unwrap_or_default();
    result.error = Some(err.to_string());

    let mut stack: Vec<NodeIndex> = graph.dependents(NodeIndex::new(index)).collect();

    while let Some(next) = stack.pop() {
        let result = &mut record.results[next.index()];

        if result.status != NodeStatus::Pending {
            continue;
        }

        result.status = NodeStatus::FailedUpstream;
        result.error = Some(format!("upstream node '{name}' failed"));
        stack.extend(graph.dependents(next));
    }
}

fn settled(record: &RunRecord) -> u64 {
    record
        .results
        .iter()
        .filter(|r| r.status.is_terminal())
        .count() as u64
}

fn first_line(err: &ToolError) -> String {
    err.to_string().lines().next().unwrap_or_default().to_string()
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown payload")
    }
}

/// Where failed attempts of `node` for `label` leave their working
/// directories.
pub fn attempt_dir(settings: &Settings, label: &str, node: &str, attempt: u32) -> Utf8PathBuf {
    settings
        .scratch_dir()
        .join(label)
        .join(node)
        .join(format!("attempt-{attempt}"))
}
