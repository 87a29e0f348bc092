// [[STUDIO]]/apps/studio-server/src/runtime.rs
// Purpose: Producer loop that drives an instrumented engine to a terminal state.
// Architecture: Domain Logic Layer
// Dependencies: Tokio (JoinSet, select), Futures, tokio-util

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::bus::{EventBus, RunOutcome};
use crate::engine::{Advance, GraphEngine, StepContext};
use crate::instrument::Instrumented;
use crate::interaction::InteractionHub;

#[derive(Error, Debug)]
pub enum RunFailure {
    /// A step or join failed; its `Error` event is already on the bus.
    #[error("step failed: {0}")]
    Step(anyhow::Error),
    /// The bus closed underneath this branch (another branch ended the run).
    #[error("run already terminated")]
    Halted,
    #[error("run cancelled")]
    Cancelled,
    /// Fault in the driving machinery itself; nothing was reported yet.
    #[error("{0}")]
    Internal(String),
}

enum BranchOutcome {
    Finished(Value),
    Joined { join_id: String, value: Value },
}

enum ForkOutcome<S> {
    Continue(S),
    Finished(Value),
}

/// Everything one run's producer needs, shared by all of its branches.
pub struct Driver<E: GraphEngine> {
    engine: Instrumented<E>,
    bus: Arc<EventBus>,
}

impl<E: GraphEngine> Driver<E> {
    pub fn new(engine: Arc<E>, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            engine: Instrumented::new(engine, bus.clone()),
            bus,
        })
    }

    /// Run from `start` until a terminal result. The terminal event itself is
    /// emitted by the instrumentation layer.
    pub async fn run(self: Arc<Self>, start: E::Step, ctx: StepContext<E::Deps>) -> Result<Value, RunFailure> {
        match self.branch(start, ctx).await? {
            BranchOutcome::Finished(output) => Ok(output),
            BranchOutcome::Joined { join_id, .. } => Err(RunFailure::Internal(format!(
                "join {} reached outside of a fork",
                join_id
            ))),
        }
    }

    fn branch(self: Arc<Self>, mut step: E::Step, ctx: StepContext<E::Deps>) -> BoxFuture<'static, Result<BranchOutcome, RunFailure>> {
        async move {
            loop {
                if self.bus.is_complete() {
                    return Err(RunFailure::Halted);
                }
                match self.engine.advance(step, &ctx).await.map_err(RunFailure::Step)? {
                    Advance::Next(next) => step = next,
                    Advance::End { output, .. } => return Ok(BranchOutcome::Finished(output)),
                    Advance::Join { join_id, value } => return Ok(BranchOutcome::Joined { join_id, value }),
                    Advance::Fork { fork_id, branches } => {
                        match self.clone().fork(fork_id, branches, ctx.clone()).await? {
                            ForkOutcome::Continue(next) => step = next,
                            ForkOutcome::Finished(output) => return Ok(BranchOutcome::Finished(output)),
                        }
                    }
                }
            }
        }
        .boxed()
    }

    /// Run every branch as its own task and hand the joined values, in fork
    /// order, to the engine's join. Dropping the set aborts the siblings of a
    /// failed branch.
    async fn fork(
        self: Arc<Self>,
        fork_id: Option<String>,
        branches: Vec<E::Step>,
        ctx: StepContext<E::Deps>,
    ) -> Result<ForkOutcome<E::Step>, RunFailure> {
        let label = fork_id.unwrap_or_else(|| "<anonymous>".to_string());
        if branches.is_empty() {
            return Err(RunFailure::Internal(format!("fork {} produced no branches", label)));
        }

        let count = branches.len();
        let mut set = JoinSet::new();
        for (index, branch) in branches.into_iter().enumerate() {
            let driver = self.clone();
            let ctx = ctx.clone();
            set.spawn(async move { (index, driver.branch(branch, ctx).await) });
        }
        tracing::debug!("Run {}: fork {} spawned {} branches", ctx.run_id(), label, count);

        let mut joined: Vec<Option<(String, Value)>> = (0..count).map(|_| None).collect();
        while let Some(finished) = set.join_next().await {
            let (index, outcome) = finished.map_err(|e| branch_task_failure(&label, e))?;
            match outcome? {
                BranchOutcome::Finished(output) => {
                    set.abort_all();
                    return Ok(ForkOutcome::Finished(output));
                }
                BranchOutcome::Joined { join_id, value } => joined[index] = Some((join_id, value)),
            }
        }

        let mut join_ids: Vec<String> = Vec::with_capacity(count);
        let mut inputs = Vec::with_capacity(count);
        for (join_id, value) in joined.into_iter().flatten() {
            if !join_ids.contains(&join_id) {
                join_ids.push(join_id);
            }
            inputs.push(value);
        }
        let join_id = match join_ids.as_slice() {
            [single] => single.clone(),
            _ => {
                return Err(RunFailure::Internal(format!(
                    "branches of fork {} converged on different joins: {}",
                    label,
                    join_ids.join(", ")
                )))
            }
        };

        let next = self
            .engine
            .join(&join_id, inputs, &ctx)
            .await
            .map_err(RunFailure::Step)?;
        Ok(ForkOutcome::Continue(next))
    }
}

fn branch_task_failure(fork: &str, err: JoinError) -> RunFailure {
    if err.is_cancelled() {
        RunFailure::Cancelled
    } else {
        RunFailure::Internal(format!("branch of fork {} panicked: {}", fork, err))
    }
}

/// Drive one run on the current task until it ends or `cancel` fires.
pub async fn produce<E: GraphEngine>(
    driver: Arc<Driver<E>>,
    start: E::Step,
    ctx: StepContext<E::Deps>,
    cancel: CancellationToken,
) -> Result<Value, RunFailure> {
    tokio::select! {
        result = driver.run(start, ctx) => result,
        _ = cancel.cancelled() => Err(RunFailure::Cancelled),
    }
}

/// Make sure the stream of a finished producer is terminated exactly once,
/// whatever way the producer ended, then release pending interactions.
pub async fn settle(
    run_id: &str,
    bus: &EventBus,
    interaction: &InteractionHub,
    result: Result<Result<Value, RunFailure>, JoinError>,
) -> RunOutcome {
    let synthesized = match result {
        Ok(Ok(_)) => {
            tracing::info!("Run {} completed successfully", run_id);
            None
        }
        Ok(Err(RunFailure::Cancelled)) => Some(("run cancelled".to_string(), RunOutcome::Cancelled)),
        Ok(Err(RunFailure::Internal(message))) => {
            tracing::error!("Run {} failed internally: {}", run_id, message);
            Some((message, RunOutcome::Failed))
        }
        Ok(Err(RunFailure::Step(err))) => {
            tracing::error!("Run {} failed: {:#}", run_id, err);
            Some((err.to_string(), RunOutcome::Failed))
        }
        Ok(Err(RunFailure::Halted)) => None,
        Err(err) if err.is_cancelled() => Some(("run cancelled".to_string(), RunOutcome::Cancelled)),
        Err(err) => {
            tracing::error!("Run {} producer panicked: {}", run_id, err);
            Some((format!("run producer crashed: {}", err), RunOutcome::Failed))
        }
    };

    if let Some((message, outcome)) = synthesized {
        if bus.close_with_error(&message, outcome).await {
            tracing::warn!("Run {}: synthesized terminal error: {}", run_id, message);
        }
    }
    if !bus.is_complete() {
        bus.close_with_error("run ended without a terminal event", RunOutcome::Failed)
            .await;
    }

    interaction.cancel_all();
    bus.wait_complete().await
}
