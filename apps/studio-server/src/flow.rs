// [[STUDIO]]/apps/studio-server/src/flow.rs
// Purpose: Closure-based reference engine. Steps are registered by id and
//          return a Transition; the graph also declares its static topology.
// Architecture: Engine Boundary (reference implementation)
// Dependencies: async-trait, futures, anyhow

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use thiserror::Error;

use crate::dag::{Topology, TopologyError};
use crate::engine::{Advance, GraphEngine, StepContext, StepId};
use crate::models::GraphModel;

#[derive(Error, Debug, PartialEq)]
pub enum FlowError {
    #[error("Unknown step: {0}")]
    UnknownStep(String),
    #[error("Unknown join: {0}")]
    UnknownJoin(String),
    #[error("Unknown graph: {0}")]
    UnknownGraph(String),
    #[error("Fork {0} has no branches")]
    EmptyFork(String),
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// A step to run next: the node and the value handed to it.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowStep {
    pub node_id: String,
    pub input: Value,
}

impl FlowStep {
    pub fn new(node_id: impl Into<String>, input: Value) -> Self {
        Self {
            node_id: node_id.into(),
            input,
        }
    }
}

impl StepId for FlowStep {
    fn step_id(&self) -> String {
        self.node_id.clone()
    }
}

/// What a step decided.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Goto(FlowStep),
    Fork {
        fork_id: Option<String>,
        branches: Vec<FlowStep>,
    },
    Join { join_id: String, value: Value },
    End(Value),
}

impl Transition {
    pub fn goto(node_id: &str, input: Value) -> Self {
        Transition::Goto(FlowStep::new(node_id, input))
    }

    /// Broadcast `input` to every branch.
    pub fn fork(fork_id: &str, branches: &[&str], input: Value) -> Self {
        Transition::Fork {
            fork_id: Some(fork_id.to_string()),
            branches: branches
                .iter()
                .map(|id| FlowStep::new(*id, input.clone()))
                .collect(),
        }
    }

    pub fn join(join_id: &str, value: Value) -> Self {
        Transition::Join {
            join_id: join_id.to_string(),
            value,
        }
    }

    pub fn end(output: Value) -> Self {
        Transition::End(output)
    }
}

type StepFn<D> =
    Box<dyn Fn(Value, StepContext<D>) -> BoxFuture<'static, anyhow::Result<Transition>> + Send + Sync>;

/// Merge join inputs: objects are folded left to right (later keys win),
/// anything else is collected into an array in fork order.
pub fn merge_inputs(inputs: Vec<Value>) -> Value {
    if !inputs.iter().all(Value::is_object) {
        return Value::Array(inputs);
    }
    let mut merged = Map::new();
    for input in inputs {
        if let Value::Object(fields) = input {
            merged.extend(fields);
        }
    }
    Value::Object(merged)
}

pub struct FlowGraph<D> {
    start: String,
    steps: HashMap<String, StepFn<D>>,
    joins: HashSet<String>,
    end_node: Option<String>,
    topology: Topology,
}

impl<D: Send + Sync + 'static> FlowGraph<D> {
    pub fn new(start: &str) -> Self {
        Self {
            start: start.to_string(),
            steps: HashMap::new(),
            joins: HashSet::new(),
            end_node: None,
            topology: Topology::new(),
        }
    }

    /// Register an executable step.
    pub fn step<F, Fut>(mut self, node_id: &str, label: &str, run: F) -> Result<Self, FlowError>
    where
        F: Fn(Value, StepContext<D>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Transition>> + Send + 'static,
    {
        self.topology.add_node(node_id, label)?;
        self.steps
            .insert(node_id.to_string(), Box::new(move |input, ctx| run(input, ctx).boxed()));
        Ok(self)
    }

    /// Register a join. The merged branch values continue to `then`, or end
    /// the run when `then` is `None`.
    pub fn join_step(mut self, join_id: &str, label: &str, then: Option<&str>) -> Result<Self, FlowError> {
        let then = then.map(str::to_string);
        self.joins.insert(join_id.to_string());
        self = self.step(join_id, label, move |input, _ctx| {
            let transition = match &then {
                Some(next) => Transition::goto(next, input),
                None => Transition::end(input),
            };
            async move { Ok::<_, anyhow::Error>(transition) }
        })?;
        Ok(self)
    }

    /// Topology-only node, such as a named fork point.
    pub fn node(mut self, node_id: &str, label: &str) -> Result<Self, FlowError> {
        self.topology.add_node(node_id, label)?;
        Ok(self)
    }

    pub fn edge(mut self, from: &str, to: &str) -> Result<Self, FlowError> {
        self.topology.add_edge(from, to)?;
        Ok(self)
    }

    pub fn dynamic_edge(mut self, from: &str) -> Result<Self, FlowError> {
        self.topology.add_dynamic_edge(from)?;
        Ok(self)
    }

    /// Model an explicit end node. Runs then finish through an edge to it.
    pub fn end_node(mut self, node_id: &str, label: &str) -> Result<Self, FlowError> {
        self.topology.add_node(node_id, label)?;
        self.end_node = Some(node_id.to_string());
        Ok(self)
    }

    /// Declare that `node_id` may end the run.
    pub fn ends(mut self, node_id: &str) -> Result<Self, FlowError> {
        self.topology.mark_terminal(node_id)?;
        if let Some(end) = self.end_node.clone() {
            self.topology.add_edge(node_id, &end)?;
        }
        Ok(self)
    }

    /// Fails when the start step was never registered.
    pub fn build(self) -> Result<Self, FlowError> {
        if !self.steps.contains_key(&self.start) {
            return Err(FlowError::UnknownStep(self.start.clone()));
        }
        Ok(self)
    }

    pub fn start_step(&self, input: Value) -> FlowStep {
        FlowStep::new(self.start.clone(), input)
    }

    pub fn topology(&self) -> GraphModel {
        self.topology.to_model()
    }

    fn require(&self, node_id: &str) -> Result<(), FlowError> {
        if self.steps.contains_key(node_id) {
            Ok(())
        } else {
            Err(FlowError::UnknownStep(node_id.to_string()))
        }
    }
}

#[async_trait]
impl<D: Send + Sync + 'static> GraphEngine for FlowGraph<D> {
    type Step = FlowStep;
    type Deps = D;

    async fn advance(&self, step: FlowStep, ctx: &StepContext<D>) -> anyhow::Result<Advance<FlowStep>> {
        let run = self
            .steps
            .get(&step.node_id)
            .ok_or_else(|| FlowError::UnknownStep(step.node_id.clone()))?;

        let advance = match run(step.input, ctx.clone()).await? {
            Transition::Goto(next) => {
                self.require(&next.node_id)?;
                Advance::Next(next)
            }
            Transition::Fork { fork_id, branches } => {
                if branches.is_empty() {
                    return Err(FlowError::EmptyFork(fork_id.unwrap_or(step.node_id)).into());
                }
                for branch in &branches {
                    self.require(&branch.node_id)?;
                }
                Advance::Fork { fork_id, branches }
            }
            Transition::Join { join_id, value } => {
                if !self.joins.contains(&join_id) {
                    return Err(FlowError::UnknownJoin(join_id).into());
                }
                Advance::Join { join_id, value }
            }
            Transition::End(output) => Advance::End {
                output,
                end_node: self.end_node.clone(),
            },
        };
        Ok(advance)
    }

    async fn join(&self, join_id: &str, inputs: Vec<Value>, _ctx: &StepContext<D>) -> anyhow::Result<FlowStep> {
        if !self.joins.contains(join_id) {
            return Err(FlowError::UnknownJoin(join_id.to_string()).into());
        }
        Ok(FlowStep::new(join_id, merge_inputs(inputs)))
    }
}
