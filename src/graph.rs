//! The dependency graph builder.
//!
//! [`build`] takes a [`SubjectManifest`] and a [`PipelineTemplate`] and binds
//! every symbolic reference in the template: manifest roles become concrete
//! file lists, output references become edges to the producing node. The
//! result is a [`PipelineGraph`], a petgraph DAG whose node indices follow
//! template declaration order. That order is what the scheduler uses to break
//! ties between nodes that become ready together.
//!
//! Building is a pure transformation. Calling it twice with the same inputs
//! yields the same graph.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::GraphError;
use crate::manifest::SubjectManifest;
use crate::template::{AdapterSpec, ParamSpec, PipelineTemplate, Reference, SinkSpec};

/// A parameter after resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// Literal values from the template.
    Literal(Vec<String>),
    /// Files taken from the manifest (or the declared default).
    Input {
        role: String,
        paths: Vec<Utf8PathBuf>,
    },
    /// Files produced by an upstream node, known only once it has run.
    Upstream {
        node: NodeIndex,
        name: String,
        output: String,
    },
}

/// A processing node with all references bound.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub adapter: AdapterSpec,
    pub params: BTreeMap<String, Binding>,
    pub outputs: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    pub sinks: Vec<SinkSpec>,
    /// Upstream nodes in declaration order.
    pub dependencies: Vec<NodeIndex>,
}

/// The resolved DAG for one subject.
#[derive(Debug)]
pub struct PipelineGraph {
    pub(crate) manifest: Arc<SubjectManifest>,
    pub(crate) graph: DiGraph<Node, ()>,
    pub(crate) pipeline: String,
    pub(crate) version: String,
}

impl PipelineGraph {
    pub fn manifest(&self) -> &SubjectManifest {
        &self.manifest
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeIndex, &Node)> {
        self.graph
            .node_indices()
            .map(move |index| (index, &self.graph[index]))
    }

    pub fn node(&self, index: NodeIndex) -> &Node {
        &self.graph[index]
    }

    pub fn find(&self, name: &str) -> Option<NodeIndex> {
        self.graph
            .node_indices()
            .find(|&index| self.graph[index].name == name)
    }

    /// Direct dependents of `index`.
    pub fn dependents(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(index, Direction::Outgoing)
    }
}

/// Resolves `template` against `manifest`.
pub fn build(
    manifest: &SubjectManifest,
    template: &PipelineTemplate,
) -> Result<PipelineGraph, GraphError> {
    let mut indices: HashMap<&str, NodeIndex> = HashMap::new();
    let mut graph = DiGraph::with_capacity(template.nodes.len(), template.nodes.len());

    // First pass: register every name so references can point forward.
    for (i, spec) in template.nodes.iter().enumerate() {
        if indices.insert(spec.name.as_str(), NodeIndex::new(i)).is_some() {
            return Err(GraphError::DuplicateNode(spec.name.clone()));
        }
    }

    for spec in &template.nodes {
        let mut dependencies = Vec::new();

        for name in spec.referenced_nodes() {
            if name == spec.name {
                return Err(GraphError::Cycle {
                    node: spec.name.clone(),
                });
            }

            let index = *indices
                .get(name)
                .ok_or_else(|| GraphError::UnresolvedReference {
                    node: spec.name.clone(),
                    reference: format!("node {name}"),
                })?;

            dependencies.push(index);
        }

        let mut params = BTreeMap::new();

        for (key, param) in &spec.params {
            let binding = match param {
                ParamSpec::Literal(value) => Binding::Literal(vec![value.clone()]),
                ParamSpec::List(values) => Binding::Literal(values.clone()),
                ParamSpec::Ref(Reference::Input { role, default }) => {
                    let paths = match (manifest.get(role), default) {
                        (Some(paths), _) => paths.to_vec(),
                        (None, Some(default)) => vec![Utf8PathBuf::from(default)],
                        (None, None) => {
                            return Err(GraphError::UnresolvedReference {
                                node: spec.name.clone(),
                                reference: format!("input {role}"),
                            });
                        }
                    };

                    Binding::Input {
                        role: role.clone(),
                        paths,
                    }
                }
                ParamSpec::Ref(Reference::Output { node, output }) => {
                    let index = indices[node.as_str()];
                    let upstream = &template.nodes[index.index()];

                    if !upstream.outputs.contains_key(output) {
                        return Err(GraphError::UnresolvedReference {
                            node: spec.name.clone(),
                            reference: format!("output {node}.{output}"),
                        });
                    }

                    Binding::Upstream {
                        node: index,
                        name: node.clone(),
                        output: output.clone(),
                    }
                }
            };

            params.insert(key.clone(), binding);
        }

        graph.add_node(Node {
            name: spec.name.clone(),
            adapter: spec.adapter.clone(),
            params,
            outputs: spec.outputs.clone(),
            timeout: spec.timeout_secs.map(Duration::from_secs),
            sinks: spec.sinks.clone(),
            dependencies,
        });
    }

    for index in graph.node_indices() {
        for dependency in graph[index].dependencies.clone() {
            graph.add_edge(dependency, index, ());
        }
    }

    if let Err(cycle) = toposort(&graph, None) {
        return Err(GraphError::Cycle {
            node: graph[cycle.node_id()].name.clone(),
        });
    }

    Ok(PipelineGraph {
        manifest: Arc::new(manifest.clone()),
        graph,
        pipeline: template.name.clone(),
        version: template.version.clone(),
    })
}

impl std::fmt::Display for PipelineGraph {
    /// Renders the graph as a Mermaid flowchart.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for (index, node) in self.nodes() {
            let name = node.name.replace('"', "\\\"");
            writeln!(f, "    {:?}[\"{}\"]", index.index(), name)?;

            if !node.sinks.is_empty() {
                writeln!(f, "    {:?} --> Sink", index.index())?;
            }
        }

        writeln!(f, "    Sink[Sink]")?;

        for edge in self.graph.raw_edges() {
            let outputs: Vec<&str> = self.graph[edge.target()]
                .params
                .values()
                .filter_map(|binding| match binding {
                    Binding::Upstream { node, output, .. } if *node == edge.source() => {
                        Some(output.as_str())
                    }
                    _ => None,
                })
                .collect();

            if outputs.is_empty() {
                writeln!(
                    f,
                    "    {:?} --> {:?}",
                    edge.source().index(),
                    edge.target().index()
                )?;
            } else {
                writeln!(
                    f,
                    "    {:?} -- \"{}\" --> {:?}",
                    edge.source().index(),
                    outputs.join(", "),
                    edge.target().index()
                )?;
            }
        }

        Ok(())
    }
}
