//! The run driver: discovery, one isolated run per subject, staging and the
//! overall verdict.

use std::fmt::Write as _;
use std::time::Instant;

use camino::Utf8Path;
use console::Style;

use crate::core::{CancelToken, Settings};
use crate::error::{ConfigError, GraphError, NeuroflowError, SinkError, StoreError};
use crate::executor::Scheduler;
use crate::graph;
use crate::manifest::{SubjectManifest, discover};
use crate::record::RunRecord;
use crate::sink::{DataSink, SinkReport};
use crate::store::ArtifactStore;
use crate::template::PipelineTemplate;
use crate::utils::as_overhead;

/// Every subject succeeded.
pub const EXIT_SUCCESS: i32 = 0;
/// At least one subject failed.
pub const EXIT_FAILURE: i32 = 1;
/// Nothing ran because the configuration or environment is unusable.
pub const EXIT_CONFIG: i32 = 2;
/// Interrupted.
pub const EXIT_CANCELLED: i32 = 130;

#[derive(Debug)]
pub enum SubjectOutcome {
    /// The template couldn't be resolved for this subject.
    GraphFailed(GraphError),
    /// The graph ran; the sink only runs after a successful record.
    Executed {
        record: RunRecord,
        sink: Option<Result<SinkReport, SinkError>>,
        diagram: String,
    },
}

#[derive(Debug)]
pub struct SubjectReport {
    pub label: String,
    pub outcome: SubjectOutcome,
}

impl SubjectReport {
    pub fn is_success(&self) -> bool {
        match &self.outcome {
            SubjectOutcome::GraphFailed(_) => false,
            SubjectOutcome::Executed { record, sink, .. } => {
                record.is_success() && matches!(sink, Some(Ok(_)))
            }
        }
    }

    pub fn record(&self) -> Option<&RunRecord> {
        match &self.outcome {
            SubjectOutcome::Executed { record, .. } => Some(record),
            SubjectOutcome::GraphFailed(_) => None,
        }
    }

    pub fn sink(&self) -> Option<&SinkReport> {
        match &self.outcome {
            SubjectOutcome::Executed {
                sink: Some(Ok(report)),
                ..
            } => Some(report),
            _ => None,
        }
    }

    /// Mermaid diagram of the subject's graph colored by node status.
    pub fn diagram(&self) -> Option<&str> {
        match &self.outcome {
            SubjectOutcome::Executed { diagram, .. } => Some(diagram),
            SubjectOutcome::GraphFailed(_) => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub subjects: Vec<SubjectReport>,
    pub cancelled: bool,
    /// Adapter invocations across all subjects, cached nodes excluded.
    pub invocations: usize,
    /// Set when the artifact index couldn't be persisted after the run. The
    /// outputs exist, but the next run won't find them in the cache.
    pub index_error: Option<StoreError>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        !self.cancelled
            && self.index_error.is_none()
            && self.subjects.iter().all(SubjectReport::is_success)
    }

    pub fn subject(&self, label: &str) -> Option<&SubjectReport> {
        self.subjects.iter().find(|s| s.label == label)
    }

    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            EXIT_CANCELLED
        } else if self.is_success() {
            EXIT_SUCCESS
        } else {
            EXIT_FAILURE
        }
    }

    /// Human-readable summary table for every subject.
    pub fn render(&self) -> String {
        let mut out = String::new();

        for subject in &self.subjects {
            let verdict = if subject.is_success() {
                Style::new().green().apply_to("ok")
            } else {
                Style::new().red().bold().apply_to("FAILED")
            };

            let _ = writeln!(out, "{} {}", subject.label, verdict);

            match &subject.outcome {
                SubjectOutcome::GraphFailed(err) => {
                    let _ = writeln!(out, "  graph error: {err}");
                }
                SubjectOutcome::Executed { record, sink, .. } => {
                    out.push_str(&record.summary());

                    match sink {
                        Some(Ok(report)) => {
                            let _ = writeln!(
                                out,
                                "  staged {} files, {} unchanged, {} sidecars",
                                report.written.len(),
                                report.unchanged.len(),
                                report.sidecars.len()
                            );
                        }
                        Some(Err(err)) => {
                            let _ = writeln!(out, "  sink error: {err}");
                        }
                        None => {}
                    }
                }
            }
        }

        if let Some(err) = &self.index_error {
            let label = Style::new().red().bold().apply_to("index not saved:");
            let _ = writeln!(out, "{label} {err}");
        }

        if self.cancelled {
            let _ = writeln!(out, "{}", Style::new().yellow().apply_to("run cancelled"));
        }

        out
    }
}

/// A pipeline template bound to execution settings.
pub struct Pipeline {
    template: PipelineTemplate,
    settings: Settings,
    cancel: CancelToken,
}

impl Pipeline {
    pub fn new(template: PipelineTemplate, settings: Settings) -> Self {
        Self {
            template,
            settings,
            cancel: CancelToken::new(),
        }
    }

    /// Uses `cancel` instead of a private token, so the run can be stopped
    /// from elsewhere.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn template(&self) -> &PipelineTemplate {
        &self.template
    }

    /// Discovers subjects under `input_root` and processes each of them,
    /// staging final outputs under `output_dir`.
    pub fn run(
        &self,
        input_root: impl AsRef<Utf8Path>,
        output_dir: impl AsRef<Utf8Path>,
        participants: &[String],
    ) -> Result<RunSummary, NeuroflowError> {
        let input_root = input_root.as_ref();
        let manifests = discover(input_root, participants)?;

        if manifests.is_empty() {
            return Err(ConfigError::NoSubjects(input_root.to_path_buf()).into());
        }

        tracing::info!("found {} subject(s) under {}", manifests.len(), input_root);

        self.run_manifests(&manifests, output_dir)
    }

    /// Processes already-built manifests. Failures stay within their
    /// subject; only problems with the shared store are returned as errors.
    pub fn run_manifests(
        &self,
        manifests: &[SubjectManifest],
        output_dir: impl AsRef<Utf8Path>,
    ) -> Result<RunSummary, NeuroflowError> {
        let start = Instant::now();
        let store = ArtifactStore::open(self.settings.store_dir())?;
        let scheduler = Scheduler::new(&self.settings, &store, self.cancel.clone())?;
        let sink = DataSink::new(output_dir, self.template.out_path_base());

        let mut summary = RunSummary::default();

        for manifest in manifests {
            if self.cancel.is_cancelled() {
                break;
            }

            let label = manifest.label();

            let graph = match graph::build(manifest, &self.template) {
                Ok(graph) => graph,
                Err(err) => {
                    tracing::error!("{label}: {err}");
                    summary.subjects.push(SubjectReport {
                        label,
                        outcome: SubjectOutcome::GraphFailed(err),
                    });
                    continue;
                }
            };

            let record = scheduler.execute(&graph);

            match record.write_failure_logs(&self.settings.logs_dir()) {
                Ok(paths) => {
                    for path in paths {
                        tracing::warn!("{label}: failure log written to {path}");
                    }
                }
                Err(err) => tracing::warn!("{label}: couldn't write failure logs: {err}"),
            }

            let staged = record.is_success().then(|| sink.materialize(&graph, &record));

            if let Some(Err(err)) = &staged {
                tracing::error!("{label}: {err}");
            }

            if let Err(err) = store.flush() {
                tracing::warn!("couldn't persist the artifact index: {err}");
            }

            summary.subjects.push(SubjectReport {
                label,
                outcome: SubjectOutcome::Executed {
                    diagram: record.render_mermaid(&graph),
                    record,
                    sink: staged,
                },
            });
        }

        if let Err(err) = store.flush() {
            tracing::error!("couldn't persist the artifact index: {err}");
            summary.index_error = Some(err);
        }

        summary.cancelled = self.cancel.is_cancelled();
        summary.invocations = scheduler.adapter().invocations();

        tracing::info!(
            "processed {} subject(s), {} tool invocation(s) {}",
            summary.subjects.len(),
            summary.invocations,
            as_overhead(start)
        );

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::NodeStatus;
    use crate::template::{Builtin, NodeSpec, ParamSpec};

    fn report(label: &str, success: bool) -> SubjectReport {
        if success {
            SubjectReport {
                label: label.into(),
                outcome: SubjectOutcome::Executed {
                    record: RunRecord {
                        label: label.into(),
                        results: Vec::new(),
                        cancelled: false,
                    },
                    sink: Some(Ok(SinkReport::default())),
                    diagram: String::new(),
                },
            }
        } else {
            SubjectReport {
                label: label.into(),
                outcome: SubjectOutcome::GraphFailed(GraphError::DuplicateNode("n".into())),
            }
        }
    }

    #[test]
    fn test_exit_codes() {
        let mut summary = RunSummary::default();
        summary.subjects.push(report("sub-01", true));
        assert_eq!(summary.exit_code(), EXIT_SUCCESS);

        summary.subjects.push(report("sub-02", false));
        assert_eq!(summary.exit_code(), EXIT_FAILURE);
        assert!(summary.render().contains("graph error"));

        summary.cancelled = true;
        assert_eq!(summary.exit_code(), EXIT_CANCELLED);
    }

    #[test]
    fn test_graph_error_isolated_to_subject() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();

        let template = PipelineTemplate::new("p", "1").node(
            NodeSpec::builtin("stage", Builtin::Copy)
                .param("in", ParamSpec::input("T1w"))
                .output("image", "image.nii.gz"),
        );
        let settings = Settings::default()
            .with_work_dir(root.join("work"))
            .with_concurrency(2);

        let t1w = root.join("sub-01_T1w.nii.gz");
        std::fs::write(&t1w, "t1").unwrap();

        let manifests = vec![
            SubjectManifest::new("01", None).with_input("T1w", t1w),
            SubjectManifest::new("02", None).with_input("bold", root.join("bold.nii.gz")),
        ];

        let summary = Pipeline::new(template, settings)
            .run_manifests(&manifests, root.join("out"))
            .unwrap();

        let first = summary.subject("sub-01").unwrap();
        assert!(first.is_success());
        assert_eq!(
            first.record().unwrap().results[0].status,
            NodeStatus::Succeeded
        );

        let second = summary.subject("sub-02").unwrap();
        assert!(matches!(
            second.outcome,
            SubjectOutcome::GraphFailed(GraphError::UnresolvedReference { .. })
        ));
        assert_eq!(summary.exit_code(), EXIT_FAILURE);
    }

    #[test]
    fn test_unsaved_index_is_a_failed_run() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let settings = Settings::default().with_work_dir(root.join("work"));

        // A directory where the index is staged makes every flush fail.
        std::fs::create_dir_all(settings.store_dir().join("index.cbor.tmp")).unwrap();

        let template = PipelineTemplate::new("p", "1").node(
            NodeSpec::builtin("a", Builtin::Touch)
                .param("content", ParamSpec::literal("x"))
                .output("out", "a.txt"),
        );

        let summary = Pipeline::new(template, settings)
            .run_manifests(&[SubjectManifest::new("01", None)], root.join("out"))
            .unwrap();

        assert!(summary.subject("sub-01").unwrap().is_success());
        assert!(summary.index_error.is_some());
        assert_eq!(summary.exit_code(), EXIT_FAILURE);
        assert!(summary.render().contains("index not saved"));
    }

    #[test]
    fn test_run_requires_subjects() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let pipeline = Pipeline::new(
            PipelineTemplate::new("p", "1"),
            Settings::default().with_work_dir(root.join("work")),
        );

        let err = pipeline.run(root, root.join("out"), &[]).unwrap_err();
        assert!(matches!(err, NeuroflowError::Config(ConfigError::NoSubjects(_))));
    }
}
