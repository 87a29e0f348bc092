// [[STUDIO]]/apps/studio-server/src/instrument.rs
// Purpose: Decorator that turns advance/join results into lifecycle events.
// Architecture: Engine Boundary (observer)
// Dependencies: async-trait, anyhow

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::bus::EventEmitter;
use crate::engine::{Advance, GraphEngine, StepContext, StepId};
use crate::events::EventKind;

/// Wraps an engine without changing what it returns. Safe to call from many
/// branches of one run at once: every event goes through the run's emitter,
/// and each call emits its own events in order.
pub struct Instrumented<E> {
    inner: Arc<E>,
    emitter: Arc<dyn EventEmitter>,
}

impl<E: GraphEngine> Instrumented<E> {
    pub fn new(inner: Arc<E>, emitter: Arc<dyn EventEmitter>) -> Self {
        Self { inner, emitter }
    }

    async fn emit(&self, kind: EventKind) {
        // A closed bus means another branch already ended the run.
        if let Err(e) = self.emitter.emit(kind).await {
            tracing::debug!("Instrumentation event not delivered: {}", e);
        }
    }

    /// Events that follow a successful advance of `node_id`. Built up front so
    /// no borrow of the engine's step is held while emitting.
    fn lifecycle(node_id: &str, advance: &Advance<E::Step>) -> Vec<EventKind> {
        let edge = |source: &str, target: String| EventKind::EdgeTaken {
            source_node_id: source.to_string(),
            target_node_id: Some(target),
        };
        let mut events = vec![EventKind::NodeEnd {
            node_id: node_id.to_string(),
        }];

        match advance {
            Advance::Next(next) => events.push(edge(node_id, next.step_id())),
            Advance::Fork {
                fork_id: Some(fork_id),
                branches,
            } => {
                events.push(edge(node_id, fork_id.clone()));
                events.extend(branches.iter().map(|b| edge(fork_id, b.step_id())));
            }
            Advance::Fork {
                fork_id: None,
                branches,
            } => events.extend(branches.iter().map(|b| edge(node_id, b.step_id()))),
            Advance::Join { join_id, .. } => events.push(edge(node_id, join_id.clone())),
            Advance::End { end_node, .. } => {
                if let Some(end_node) = end_node {
                    events.push(edge(node_id, end_node.clone()));
                }
                events.push(EventKind::RunEnd);
            }
        }
        events
    }
}

#[async_trait]
impl<E: GraphEngine> GraphEngine for Instrumented<E> {
    type Step = E::Step;
    type Deps = E::Deps;

    async fn advance(
        &self,
        step: Self::Step,
        ctx: &StepContext<Self::Deps>,
    ) -> anyhow::Result<Advance<Self::Step>> {
        let node_id = step.step_id();
        self.emit(EventKind::NodeStart {
            node_id: node_id.clone(),
        })
        .await;

        match self.inner.advance(step, ctx).await {
            Ok(advance) => {
                for kind in Self::lifecycle(&node_id, &advance) {
                    self.emit(kind).await;
                }
                Ok(advance)
            }
            Err(err) => {
                tracing::warn!("Run {}: node {} failed: {:#}", ctx.run_id(), node_id, err);
                self.emit(EventKind::error(err.to_string(), Some(node_id)))
                    .await;
                Err(err)
            }
        }
    }

    async fn join(
        &self,
        join_id: &str,
        inputs: Vec<Value>,
        ctx: &StepContext<Self::Deps>,
    ) -> anyhow::Result<Self::Step> {
        match self.inner.join(join_id, inputs, ctx).await {
            Ok(step) => Ok(step),
            Err(err) => {
                tracing::warn!("Run {}: join {} failed: {:#}", ctx.run_id(), join_id, err);
                self.emit(EventKind::error(err.to_string(), Some(join_id.to_string())))
                    .await;
                Err(err)
            }
        }
    }
}
