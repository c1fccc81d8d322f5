//! Declarative pipeline templates.
//!
//! A template is data describing a graph: an ordered list of [`NodeSpec`]s
//! whose parameters are either literal values or symbolic references to
//! manifest roles and to other nodes' outputs. The graph builder resolves
//! those references per subject.
//!
//! Templates are usually loaded from JSON:
//!
//! ```json
//! {
//!   "name": "anat",
//!   "version": "1.0.0",
//!   "nodes": [
//!     {
//!       "name": "normalize",
//!       "adapter": { "kind": "command", "program": "antsRegistrationSyNQuick.sh",
//!                    "version": "2.4.3",
//!                    "args": ["-d", "3", "-m", "{moving}", "-f", "{fixed}", "-o", "norm_"] },
//!       "params": { "moving": { "input": { "role": "T1w" } }, "fixed": "/opt/templates/mni.nii.gz" },
//!       "outputs": { "warped": "norm_Warped.nii.gz" },
//!       "sinks": [ { "output": "warped", "source": "T1w", "space": "MNI152NLin2009cAsym", "desc": "preproc" } ]
//!     }
//!   ]
//! }
//! ```
//!
//! The same structure can be built in code with the builder methods on
//! [`NodeSpec`].

use std::collections::BTreeMap;
use std::fs;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineTemplate {
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// Directory under the output root holding the derivatives tree. Defaults
    /// to the template name.
    #[serde(default)]
    pub out_path_base: Option<String>,
    pub nodes: Vec<NodeSpec>,
}

impl PipelineTemplate {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            out_path_base: None,
            nodes: Vec::new(),
        }
    }

    pub fn node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn out_path_base(&self) -> &str {
        self.out_path_base.as_deref().unwrap_or(&self.name)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_json(&text).map_err(|source| ConfigError::Template {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// One step of a pipeline as written in the template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    /// Explicit upstream nodes. References in `params` add to this list.
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub adapter: AdapterSpec,
    #[serde(default)]
    pub params: BTreeMap<String, ParamSpec>,
    /// Output name to path pattern (glob) relative to the working directory.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Outputs staged into the derivatives tree once the run succeeds.
    #[serde(default)]
    pub sinks: Vec<SinkSpec>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, adapter: AdapterSpec) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            adapter,
            params: BTreeMap::new(),
            outputs: BTreeMap::new(),
            timeout_secs: None,
            sinks: Vec::new(),
        }
    }

    /// Node running `program` with the given argument template.
    pub fn command<I, S>(name: impl Into<String>, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            name,
            AdapterSpec::Command(CommandSpec {
                program: program.into(),
                args: args.into_iter().map(Into::into).collect(),
                version: String::new(),
                env: BTreeMap::new(),
            }),
        )
    }

    pub fn builtin(name: impl Into<String>, op: Builtin) -> Self {
        Self::new(name, AdapterSpec::Builtin { op })
    }

    pub fn depends_on(mut self, node: impl Into<String>) -> Self {
        self.depends_on.push(node.into());
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: ParamSpec) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    pub fn output(mut self, name: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.outputs.insert(name.into(), pattern.into());
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn sink(mut self, sink: SinkSpec) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Sets the tool version recorded in fingerprints. No-op for builtins.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        if let AdapterSpec::Command(command) = &mut self.adapter {
            command.version = version.into();
        }
        self
    }

    /// Every node name this node refers to, explicit dependencies first, in
    /// declaration order and without duplicates.
    pub fn referenced_nodes(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();

        let implicit = self.params.values().filter_map(|param| match param {
            ParamSpec::Ref(Reference::Output { node, .. }) => Some(node.as_str()),
            _ => None,
        });

        for name in self.depends_on.iter().map(String::as_str).chain(implicit) {
            if !names.contains(&name) {
                names.push(name);
            }
        }

        names
    }
}

/// What executes a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterSpec {
    /// An external executable.
    Command(CommandSpec),
    /// A computation performed in-process.
    Builtin { op: Builtin },
}

impl AdapterSpec {
    /// Stable description of the tool, part of every fingerprint.
    pub fn identity(&self) -> String {
        match self {
            AdapterSpec::Command(command) => {
                let mut identity = format!("{}@{}", command.program, command.version);
                for arg in &command.args {
                    identity.push('\u{1f}');
                    identity.push_str(arg);
                }
                for (key, value) in &command.env {
                    identity.push('\u{1e}');
                    identity.push_str(key);
                    identity.push('=');
                    identity.push_str(value);
                }
                identity
            }
            AdapterSpec::Builtin { op } => format!("builtin:{}", op.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    /// Argument template. `{param}` is replaced by a parameter value (a list
    /// parameter standing alone expands into several arguments) and
    /// `{out:name}` by the absolute path of a declared output. Literal braces
    /// are written `{{` and `}}`, e.g. `'{{print $1}}'` or `${{FSLDIR}}`.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub version: String,
    /// Extra environment on top of the configured base environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Builtin {
    /// Copies the files of parameter `in` into the working directory; a
    /// single file is renamed to the sole output pattern when it is a plain
    /// file name.
    Copy,
    /// Creates every declared output, filled with parameter `content`.
    Touch,
}

impl Builtin {
    pub fn name(self) -> &'static str {
        match self {
            Builtin::Copy => "copy",
            Builtin::Touch => "touch",
        }
    }
}

/// A parameter value as written in the template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamSpec {
    Literal(String),
    List(Vec<String>),
    Ref(Reference),
}

impl ParamSpec {
    pub fn literal(value: impl Into<String>) -> Self {
        ParamSpec::Literal(value.into())
    }

    pub fn input(role: impl Into<String>) -> Self {
        ParamSpec::Ref(Reference::Input {
            role: role.into(),
            default: None,
        })
    }

    pub fn input_or(role: impl Into<String>, default: impl Into<String>) -> Self {
        ParamSpec::Ref(Reference::Input {
            role: role.into(),
            default: Some(default.into()),
        })
    }

    pub fn output(node: impl Into<String>, output: impl Into<String>) -> Self {
        ParamSpec::Ref(Reference::Output {
            node: node.into(),
            output: output.into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reference {
    /// Files the manifest lists under `role`, or `default` when absent.
    Input {
        role: String,
        #[serde(default)]
        default: Option<String>,
    },
    /// Files produced by `output` of node `node`.
    Output { node: String, output: String },
}

/// How a final output is named in the derivatives tree.
///
/// The destination follows the BIDS-derivatives convention:
/// `sub-<s>[/ses-<t>]/<modality>/<source stem>[_space-][_desc-][_<entity>-][_<extra>][_<suffix>][_<dtype>]<ext>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkSpec {
    /// Output of the owning node to stage.
    pub output: String,
    /// Manifest role whose first file provides the naming reference.
    pub source: String,
    #[serde(default)]
    pub space: Option<String>,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub suffix: Option<String>,
    /// Keep the source's datatype suffix (`_T1w`, `_bold`).
    #[serde(default)]
    pub keep_dtype: bool,
    /// `true` gzips, `false` decompresses, absent copies as-is.
    #[serde(default)]
    pub compress: Option<bool>,
    /// Additional entities, in order, written as `_<key>-<value>`.
    #[serde(default)]
    pub entities: Vec<Entity>,
    /// One label per file for multi-file outputs.
    #[serde(default)]
    pub extra_values: Option<Vec<String>>,
    /// Written to a JSON sidecar when a single file is staged.
    #[serde(default)]
    pub meta: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub key: String,
    pub value: String,
}

impl SinkSpec {
    pub fn new(output: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            source: source.into(),
            space: None,
            desc: None,
            suffix: None,
            keep_dtype: false,
            compress: None,
            entities: Vec::new(),
            extra_values: None,
            meta: BTreeMap::new(),
        }
    }

    pub fn space(mut self, space: impl Into<String>) -> Self {
        self.space = Some(space.into());
        self
    }

    pub fn desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = Some(desc.into());
        self
    }

    pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    pub fn keep_dtype(mut self) -> Self {
        self.keep_dtype = true;
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = Some(compress);
        self
    }

    pub fn entity(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entities.push(Entity {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn extra_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = r#"{
        "name": "anat",
        "version": "1.0.0",
        "nodes": [
            {
                "name": "normalize",
                "adapter": { "kind": "command", "program": "antsRegistration", "version": "2.4.3",
                             "args": ["-i", "{moving}", "-o", "{out:warped}"] },
                "params": {
                    "moving": { "input": { "role": "T1w" } },
                    "fixed": "/opt/mni.nii.gz",
                    "labels": ["csf", "gm", "wm"]
                },
                "outputs": { "warped": "warped.nii.gz" },
                "timeout_secs": 3600
            },
            {
                "name": "segment",
                "depends_on": ["normalize"],
                "adapter": { "kind": "builtin", "op": "copy" },
                "params": { "in": { "output": { "node": "normalize", "output": "warped" } } },
                "outputs": { "seg": "seg.nii.gz" },
                "sinks": [ { "output": "seg", "source": "T1w", "desc": "aseg", "suffix": "dseg",
                             "entities": [ { "key": "from", "value": "orig" } ],
                             "meta": { "SkullStripped": true } } ]
            }
        ]
    }"#;

    #[test]
    fn test_parse_template() {
        let template = PipelineTemplate::from_json(TEMPLATE).unwrap();

        assert_eq!(template.name, "anat");
        assert_eq!(template.out_path_base(), "anat");
        assert_eq!(template.nodes.len(), 2);

        let normalize = &template.nodes[0];
        assert_eq!(normalize.params["moving"], ParamSpec::input("T1w"));
        assert_eq!(normalize.params["fixed"], ParamSpec::literal("/opt/mni.nii.gz"));
        assert_eq!(
            normalize.params["labels"],
            ParamSpec::List(vec!["csf".into(), "gm".into(), "wm".into()])
        );
        assert_eq!(normalize.timeout_secs, Some(3600));

        let segment = &template.nodes[1];
        assert_eq!(segment.adapter, AdapterSpec::Builtin { op: Builtin::Copy });
        assert_eq!(segment.params["in"], ParamSpec::output("normalize", "warped"));
        assert_eq!(segment.sinks[0].entities[0].key, "from");
        assert_eq!(segment.sinks[0].meta["SkullStripped"], serde_json::json!(true));
    }

    #[test]
    fn test_builder_matches_json() {
        let parsed = PipelineTemplate::from_json(TEMPLATE).unwrap();

        let built = PipelineTemplate::new("anat", "1.0.0")
            .node(
                NodeSpec::command(
                    "normalize",
                    "antsRegistration",
                    ["-i", "{moving}", "-o", "{out:warped}"],
                )
                .version("2.4.3")
                .param("moving", ParamSpec::input("T1w"))
                .param("fixed", ParamSpec::literal("/opt/mni.nii.gz"))
                .param(
                    "labels",
                    ParamSpec::List(vec!["csf".into(), "gm".into(), "wm".into()]),
                )
                .output("warped", "warped.nii.gz")
                .timeout_secs(3600),
            )
            .node(
                NodeSpec::builtin("segment", Builtin::Copy)
                    .depends_on("normalize")
                    .param("in", ParamSpec::output("normalize", "warped"))
                    .output("seg", "seg.nii.gz")
                    .sink(
                        SinkSpec::new("seg", "T1w")
                            .desc("aseg")
                            .suffix("dseg")
                            .entity("from", "orig")
                            .meta("SkullStripped", true),
                    ),
            );

        assert_eq!(parsed, built);
    }

    #[test]
    fn test_referenced_nodes_dedup() {
        let spec = NodeSpec::builtin("c", Builtin::Touch)
            .depends_on("a")
            .param("x", ParamSpec::output("b", "out"))
            .param("y", ParamSpec::output("a", "out"));

        assert_eq!(spec.referenced_nodes(), vec!["a", "b"]);
    }

    #[test]
    fn test_identity_tracks_version() {
        let a = NodeSpec::command("n", "bet", ["{in}"]).version("6.0");
        let b = NodeSpec::command("n", "bet", ["{in}"]).version("6.1");
        assert_ne!(a.adapter.identity(), b.adapter.identity());
    }
}
