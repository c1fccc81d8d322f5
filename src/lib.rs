#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod core;
mod error;
pub mod executor;
pub mod graph;
pub mod manifest;
pub mod pipeline;
pub mod record;
pub mod sink;
pub mod store;
pub mod template;
pub mod tool;
mod utils;

pub use crate::core::{
    CancelToken, DEFAULT_TRANSIENT_EXIT_CODES, Fingerprint, FingerprintBuilder, Settings,
    split_ext,
};
pub use crate::error::*;
pub use crate::executor::Scheduler;
pub use crate::graph::PipelineGraph;
pub use crate::manifest::{BidsName, SubjectManifest, discover};
pub use crate::pipeline::{Pipeline, RunSummary, SubjectOutcome, SubjectReport};
pub use crate::record::{NodeResult, NodeStatus, RunRecord};
pub use crate::sink::{DataSink, SinkReport};
pub use crate::store::{Artifact, ArtifactKey, ArtifactStore};
pub use crate::template::{
    AdapterSpec, Builtin, CommandSpec, NodeSpec, ParamSpec, PipelineTemplate, SinkSpec,
};
pub use crate::tool::{ToolAdapter, WorkDir};

#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
