//! The stage dependency graph.
//!
//! Stages declare input bindings and outputs. Bindings to upstream outputs
//! become graph edges; a `Collect` binding is a join over several upstream
//! stages and only resolves once every one of them has finished.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use indexmap::IndexMap;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ArtifactKind, ParamName};

use super::materialize::CommandTemplate;

/// Which part of the pipeline a stage belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    /// Only planned when the final report is generated
    Report,

    /// Differential expression and pathway enrichment
    Expression,

    /// HUMAnN2 profiling sub-graph
    Metagenomics,
}

/// Where a stage input comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingSource {
    /// A resolved pipeline parameter
    Param(ParamName),

    /// A fixed list of files known at planning time (e.g. a sample's reads)
    Files(Vec<PathBuf>),

    /// One output of one upstream stage
    Upstream { stage: String, output: String },

    /// The same output of every listed upstream stage (barrier)
    Collect { stages: Vec<String>, output: String },
}

impl BindingSource {
    /// Upstream stages this source waits for
    pub fn upstream_stages(&self) -> Vec<&str> {
        match self {
            Self::Upstream { stage, .. } => vec![stage.as_str()],
            Self::Collect { stages, .. } => stages.iter().map(String::as_str).collect(),
            Self::Param(_) | Self::Files(_) => Vec::new(),
        }
    }
}

/// A named input of a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputBinding {
    /// Name the command template uses to refer to the input
    pub alias: String,
    pub source: BindingSource,
}

impl InputBinding {
    pub fn param(alias: impl Into<String>, name: ParamName) -> Self {
        Self {
            alias: alias.into(),
            source: BindingSource::Param(name),
        }
    }

    pub fn files(alias: impl Into<String>, files: Vec<PathBuf>) -> Self {
        Self {
            alias: alias.into(),
            source: BindingSource::Files(files),
        }
    }

    pub fn upstream(
        alias: impl Into<String>,
        stage: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            alias: alias.into(),
            source: BindingSource::Upstream {
                stage: stage.into(),
                output: output.into(),
            },
        }
    }

    pub fn collect(alias: impl Into<String>, stages: Vec<String>, output: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            source: BindingSource::Collect {
                stages,
                output: output.into(),
            },
        }
    }
}

/// A declared output of a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDecl {
    pub name: String,
    pub kind: ArtifactKind,

    /// Path relative to the working directory; a glob for file sets
    pub pattern: String,

    /// Subdirectory of the output root the artifact is copied to
    pub publish_to: Option<String>,
}

impl OutputDecl {
    pub fn new(name: impl Into<String>, kind: ArtifactKind, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            pattern: pattern.into(),
            publish_to: None,
        }
    }

    pub fn published(mut self, subdir: impl Into<String>) -> Self {
        self.publish_to = Some(subdir.into());
        self
    }
}

/// One external-tool step of the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub branch: Branch,
    pub inputs: Vec<InputBinding>,
    pub outputs: Vec<OutputDecl>,
    pub command: CommandTemplate,
}

impl Stage {
    pub fn new(name: impl Into<String>, branch: Branch) -> Self {
        Self {
            name: name.into(),
            branch,
            inputs: Vec::new(),
            outputs: Vec::new(),
            command: CommandTemplate::default(),
        }
    }

    pub fn bind(mut self, binding: InputBinding) -> Self {
        self.inputs.push(binding);
        self
    }

    pub fn output(mut self, output: OutputDecl) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn command(mut self, command: CommandTemplate) -> Self {
        self.command = command;
        self
    }

    pub fn get_output(&self, name: &str) -> Option<&OutputDecl> {
        self.outputs.iter().find(|o| o.name == name)
    }

    /// Distinct upstream stages, in binding order
    pub fn upstream_stages(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.inputs
            .iter()
            .flat_map(|b| b.source.upstream_stages())
            .filter(|s| seen.insert(*s))
            .collect()
    }
}

/// Structural problems in a stage graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("stage '{0}' is declared twice")]
    DuplicateStage(String),

    #[error("stage '{stage}' binds input '{alias}' twice")]
    DuplicateAlias { stage: String, alias: String },

    #[error("stage '{stage}' depends on unknown stage '{upstream}'")]
    UnknownStage { stage: String, upstream: String },

    #[error("stage '{stage}' consumes output '{output}' which '{upstream}' does not declare")]
    UnknownOutput {
        stage: String,
        upstream: String,
        output: String,
    },

    #[error("stage '{stage}' collects '{alias}' from no stages")]
    EmptyCollection { stage: String, alias: String },

    #[error("stage graph contains a cycle through '{0}'")]
    Cycle(String),
}

/// A validated, acyclic set of stages
#[derive(Debug, Clone)]
pub struct StageGraph {
    stages: IndexMap<String, Stage>,
    graph: DiGraph<String, ()>,
    nodes: HashMap<String, NodeIndex>,
}

impl StageGraph {
    /// Build and validate a graph from stage declarations
    pub fn new(stages: Vec<Stage>) -> Result<Self, GraphError> {
        let mut by_name = IndexMap::new();
        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();

        for stage in stages {
            if by_name.contains_key(&stage.name) {
                return Err(GraphError::DuplicateStage(stage.name));
            }
            let mut aliases = BTreeSet::new();
            for binding in &stage.inputs {
                if !aliases.insert(binding.alias.as_str()) {
                    return Err(GraphError::DuplicateAlias {
                        stage: stage.name.clone(),
                        alias: binding.alias.clone(),
                    });
                }
            }
            nodes.insert(stage.name.clone(), graph.add_node(stage.name.clone()));
            by_name.insert(stage.name.clone(), stage);
        }

        for stage in by_name.values() {
            for binding in &stage.inputs {
                let output = match &binding.source {
                    BindingSource::Upstream { output, .. } => output,
                    BindingSource::Collect { stages, output } => {
                        if stages.is_empty() {
                            return Err(GraphError::EmptyCollection {
                                stage: stage.name.clone(),
                                alias: binding.alias.clone(),
                            });
                        }
                        output
                    }
                    _ => continue,
                };

                for upstream in binding.source.upstream_stages() {
                    let producer: &Stage =
                        by_name.get(upstream).ok_or_else(|| GraphError::UnknownStage {
                            stage: stage.name.clone(),
                            upstream: upstream.to_string(),
                        })?;
                    if producer.get_output(output).is_none() {
                        return Err(GraphError::UnknownOutput {
                            stage: stage.name.clone(),
                            upstream: upstream.to_string(),
                            output: output.clone(),
                        });
                    }
                    graph.update_edge(nodes[upstream], nodes[&stage.name], ());
                }
            }
        }

        if let Err(cycle) = toposort(&graph, None) {
            return Err(GraphError::Cycle(graph[cycle.node_id()].clone()));
        }

        Ok(Self {
            stages: by_name,
            graph,
            nodes,
        })
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stages.contains_key(name)
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.get(name)
    }

    /// Stages in declaration order
    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.stages.values()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.keys().map(String::as_str).collect()
    }

    /// Direct upstream stages of a stage
    pub fn upstream(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, Direction::Incoming)
    }

    /// Direct consumers of a stage's outputs
    pub fn downstream(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, Direction::Outgoing)
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Vec<&str> {
        let Some(&node) = self.nodes.get(name) else {
            return Vec::new();
        };
        let mut names: Vec<&str> = self
            .graph
            .neighbors_directed(node, direction)
            .map(|n| self.graph[n].as_str())
            .collect();
        names.sort_unstable();
        names
    }

    /// Every stage reachable from `name`, excluding `name` itself
    pub fn transitive_dependents(&self, name: &str) -> Vec<&str> {
        let Some(&start) = self.nodes.get(name) else {
            return Vec::new();
        };
        let mut dfs = Dfs::new(&self.graph, start);
        let mut found = Vec::new();
        while let Some(node) = dfs.next(&self.graph) {
            if node != start {
                found.push(self.graph[node].as_str());
            }
        }
        found.sort_unstable();
        found
    }

    /// A dependency-respecting order of all stages
    pub fn topological_order(&self) -> Vec<&str> {
        // Acyclicity is checked in `new`
        toposort(&self.graph, None)
            .map(|order| order.into_iter().map(|n| self.graph[n].as_str()).collect())
            .unwrap_or_default()
    }
}
