use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::core::Fingerprint;
use crate::store::ArtifactKey;

/// Text captured from a tool's standard streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Logs {
    pub stdout: String,
    pub stderr: String,
}

impl Logs {
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}

impl std::fmt::Display for Logs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "--- stdout ---")?;
        writeln!(f, "{}", self.stdout.trim_end())?;
        writeln!(f, "--- stderr ---")?;
        write!(f, "{}", self.stderr.trim_end())
    }
}

/// Errors raised while turning a template into a resolved graph. Any of these
/// stops the affected subject before a single node runs.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Node '{node}' references '{reference}', which cannot be resolved")]
    UnresolvedReference { node: String, reference: String },

    #[error("Dependency cycle detected at node '{node}'")]
    Cycle { node: String },

    #[error("Node '{0}' is declared more than once")]
    DuplicateNode(String),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "a signal".to_string(),
    }
}

/// Errors raised by a single tool invocation.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool exited with {}\n{logs}", exit_label(.code))]
    Exit { code: Option<i32>, logs: Logs },

    #[error("Tool timed out after {after:.2?}\n{logs}")]
    Timeout { after: Duration, logs: Logs },

    #[error("Output '{output}' matched no files for pattern '{pattern}'\n{logs}")]
    MissingOutput {
        output: String,
        pattern: String,
        logs: Logs,
    },

    #[error("Couldn't start '{program}'.\n{source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Tool panicked: {0}")]
    Panic(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Pattern(#[from] glob::PatternError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ToolError {
    /// Whether retrying the same invocation could succeed.
    ///
    /// Timeouts, signals and the configured exit codes count as resource
    /// contention; everything else is a property of the inputs.
    pub fn is_transient(&self, transient_codes: &[i32]) -> bool {
        match self {
            ToolError::Timeout { .. } => true,
            ToolError::Exit { code: None, .. } => true,
            ToolError::Exit {
                code: Some(code), ..
            } => transient_codes.contains(code),
            _ => false,
        }
    }

    pub fn logs(&self) -> Option<&Logs> {
        match self {
            ToolError::Exit { logs, .. }
            | ToolError::Timeout { logs, .. }
            | ToolError::MissingOutput { logs, .. } => Some(logs),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(
        "Artifact {key} with fingerprint {fingerprint} is already registered with different paths: {existing:?} vs {attempted:?}"
    )]
    DuplicateArtifact {
        key: ArtifactKey,
        fingerprint: Fingerprint,
        existing: Vec<Utf8PathBuf>,
        attempted: Vec<Utf8PathBuf>,
    },

    #[error("Artifact store I/O error.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't decode artifact index '{0}'.\n{1}")]
    Decode(Utf8PathBuf, String),

    #[error("Couldn't encode artifact index '{0}'.\n{1}")]
    Encode(Utf8PathBuf, String),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Couldn't write '{path}'.\n{source}")]
    Write {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Run for '{0}' did not succeed, refusing to stage outputs")]
    IncompleteRun(String),

    #[error("Source role '{role}' is not available for subject '{subject}'")]
    MissingSource { subject: String, role: String },

    #[error("Source file '{0}' does not follow the BIDS naming convention")]
    InvalidSource(Utf8PathBuf),

    #[error("No artifact recorded for {0}")]
    MissingArtifact(String),

    #[error("Output '{output}' has {files} files but {labels} extra values")]
    ExtraValues {
        output: String,
        files: usize,
        labels: usize,
    },

    #[error("Couldn't serialize sidecar.\n{0}")]
    Sidecar(#[from] serde_json::Error),
}

/// Problems found before any subject starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read '{path}'.\n{source}")]
    Read {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't parse pipeline template '{path}'.\n{source}")]
    Template {
        path: Utf8PathBuf,
        source: serde_json::Error,
    },

    #[error("Input root '{0}' is not a directory")]
    InputRoot(Utf8PathBuf),

    #[error("No subjects found under '{0}'")]
    NoSubjects(Utf8PathBuf),

    #[error("Path is not valid UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error(transparent)]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't build worker pool.\n{0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Error)]
pub enum NeuroflowError {
    #[error("Configuration error:\n{0}")]
    Config(#[from] ConfigError),

    #[error("Error while building the task graph:\n{0}")]
    Graph(#[from] GraphError),

    #[error("Artifact store error:\n{0}")]
    Store(#[from] StoreError),

    #[error("Error while staging outputs:\n{0}")]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let codes = crate::core::DEFAULT_TRANSIENT_EXIT_CODES;

        let contention = ToolError::Exit {
            code: Some(75),
            logs: Logs::default(),
        };
        let bad_input = ToolError::Exit {
            code: Some(1),
            logs: Logs::default(),
        };
        let signal = ToolError::Exit {
            code: None,
            logs: Logs::default(),
        };
        let timeout = ToolError::Timeout {
            after: Duration::from_secs(1),
            logs: Logs::default(),
        };
        let missing = ToolError::MissingOutput {
            output: "out".into(),
            pattern: "*.nii.gz".into(),
            logs: Logs::default(),
        };

        assert!(contention.is_transient(codes));
        assert!(signal.is_transient(codes));
        assert!(timeout.is_transient(codes));
        assert!(!bad_input.is_transient(codes));
        assert!(!missing.is_transient(codes));
        assert!(!ToolError::InvalidParameter("x".into()).is_transient(codes));
        assert!(!ToolError::Cancelled.is_transient(codes));
    }

    #[test]
    fn test_exit_message_carries_logs() {
        let err = ToolError::Exit {
            code: Some(3),
            logs: Logs {
                stdout: "hello".into(),
                stderr: "broken header".into(),
            },
        };
        let text = err.to_string();

        assert!(text.contains("code 3"));
        assert!(text.contains("broken header"));
        assert_eq!(err.logs().map(|l| l.stdout.as_str()), Some("hello"));
    }
}
