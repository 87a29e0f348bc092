// [[STUDIO]]/apps/studio-server/src/engine.rs
// Purpose: Contract between the run machinery and whatever executes steps.
// Architecture: Engine Boundary
// Dependencies: async-trait, anyhow

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::interaction::InteractionHub;

/// Anything the engine hands back as "the next thing to run".
pub trait StepId {
    fn step_id(&self) -> String;
}

/// Result of advancing one step.
#[derive(Debug)]
pub enum Advance<S> {
    /// Continue with a single successor
    Next(S),
    /// Run `branches` concurrently. `fork_id` names the fan-out point when the
    /// engine models one.
    Fork {
        fork_id: Option<String>,
        branches: Vec<S>,
    },
    /// This branch delivers `value` to the join `join_id`
    Join { join_id: String, value: Value },
    /// The run is finished. `end_node` is set when the engine models an
    /// explicit end node.
    End { output: Value, end_node: Option<String> },
}

/// What a step sees while it runs.
pub struct StepContext<D> {
    run_id: String,
    deps: Arc<D>,
    interaction: Arc<InteractionHub>,
}

impl<D> Clone for StepContext<D> {
    fn clone(&self) -> Self {
        Self {
            run_id: self.run_id.clone(),
            deps: Arc::clone(&self.deps),
            interaction: Arc::clone(&self.interaction),
        }
    }
}

impl<D> StepContext<D> {
    pub fn new(run_id: &str, deps: Arc<D>, interaction: Arc<InteractionHub>) -> Self {
        Self {
            run_id: run_id.to_string(),
            deps,
            interaction,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn deps(&self) -> &D {
        &self.deps
    }

    pub fn interaction(&self) -> &InteractionHub {
        &self.interaction
    }
}

/// A step-graph executor. Implementations own all business logic; the run
/// machinery only calls `advance` and `join` and watches what comes back.
#[async_trait]
pub trait GraphEngine: Send + Sync + 'static {
    type Step: StepId + Send + 'static;
    type Deps: Send + Sync + 'static;

    async fn advance(
        &self,
        step: Self::Step,
        ctx: &StepContext<Self::Deps>,
    ) -> anyhow::Result<Advance<Self::Step>>;

    /// Combine the values delivered to `join_id` (in fork order) into the
    /// step that continues after the join.
    async fn join(
        &self,
        join_id: &str,
        inputs: Vec<Value>,
        ctx: &StepContext<Self::Deps>,
    ) -> anyhow::Result<Self::Step> {
        let _ = (inputs, ctx);
        anyhow::bail!("engine does not support joins (join {})", join_id)
    }
}
