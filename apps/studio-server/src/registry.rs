// [[STUDIO]]/apps/studio-server/src/registry.rs
// Purpose: Run Registry. Owns every live run and its event bus, keyed by run id.
// Architecture: Multiplexing Layer
// Dependencies: DashMap, Tokio, tokio-util

use chrono::Utc;
use dashmap::DashMap;
use futures::future;
use futures::stream::{self, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::{EventBus, RunOutcome};
use crate::engine::{GraphEngine, StepContext};
use crate::events::RuntimeEvent;
use crate::interaction::{InteractionError, InteractionHub};
use crate::models::{RunSnapshot, RunStatus};
use crate::runtime::{self, Driver};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Run not found: {0}")]
    RunNotFound(String),
    #[error(transparent)]
    Interaction(#[from] InteractionError),
}

/// Knobs applied to every run the registry starts.
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Bus capacity; `None` is unbounded
    pub event_buffer: Option<usize>,
    pub input_timeout: Option<Duration>,
    /// How long a finished run nobody drained stays registered
    pub retention: Duration,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            event_buffer: None,
            input_timeout: None,
            retention: Duration::from_secs(600),
        }
    }
}

/// Bookkeeping for one run.
pub struct RunState {
    pub run_id: String,
    pub graph: String,
    pub start_time: String,
    pub bus: Arc<EventBus>,
    pub interaction: Arc<InteractionHub>,
    cancel: CancellationToken,
    // Signalled once the registry has let go of the run.
    detached: Notify,
}

impl RunState {
    /// Derived from the bus and the pending set, so it can only move forward
    /// once terminal.
    pub fn status(&self) -> RunStatus {
        match self.bus.outcome() {
            Some(RunOutcome::Completed) => RunStatus::Completed,
            Some(RunOutcome::Failed) => RunStatus::Failed,
            Some(RunOutcome::Cancelled) => RunStatus::Cancelled,
            None if self.interaction.pending_count() > 0 => RunStatus::AwaitingInput,
            None => RunStatus::Running,
        }
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.run_id.clone(),
            graph: self.graph.clone(),
            status: self.status(),
            start_time: self.start_time.clone(),
            pending_inputs: self.interaction.pending_requests(),
            metrics: self.bus.metrics(),
        }
    }
}

pub struct RunRegistry {
    runs: Arc<DashMap<String, Arc<RunState>>>,
    settings: RunSettings,
}

impl RunRegistry {
    pub fn new(settings: RunSettings) -> Self {
        Self {
            runs: Arc::new(DashMap::new()),
            settings,
        }
    }

    /// Start a run on its own task and return its id immediately.
    pub fn start_run<E: GraphEngine>(&self, graph: &str, engine: Arc<E>, start: E::Step, deps: E::Deps) -> String {
        let run_id = Uuid::new_v4().simple().to_string();
        let bus = Arc::new(EventBus::new(&run_id, self.settings.event_buffer));
        let interaction = Arc::new(InteractionHub::new(self.settings.input_timeout));
        if let Err(e) = interaction.bind(&run_id, bus.clone()) {
            // Fresh hub; binding cannot conflict.
            tracing::error!("Run {}: {}", run_id, e);
        }

        let state = Arc::new(RunState {
            run_id: run_id.clone(),
            graph: graph.to_string(),
            start_time: Utc::now().to_rfc3339(),
            bus: bus.clone(),
            interaction: interaction.clone(),
            cancel: CancellationToken::new(),
            detached: Notify::new(),
        });
        self.runs.insert(run_id.clone(), state.clone());

        let ctx = StepContext::new(&run_id, Arc::new(deps), interaction.clone());
        let driver = Driver::new(engine, bus.clone());
        let producer = tokio::spawn(runtime::produce(driver, start, ctx, state.cancel.clone()));

        // Supervisor: terminate the stream whatever happened to the producer,
        // then forget the run if nobody drained or removed it in time.
        let runs = self.runs.clone();
        let retention = self.settings.retention;
        tokio::spawn(async move {
            let outcome = runtime::settle(&state.run_id, &bus, &interaction, producer.await).await;
            tracing::info!("Run {} settled as {:?}", state.run_id, outcome);

            tokio::select! {
                _ = state.detached.notified() => {
                    tracing::debug!("Run {} released", state.run_id);
                }
                _ = tokio::time::sleep(retention) => {
                    if runs
                        .remove_if(&state.run_id, |_, current| Arc::ptr_eq(current, &state))
                        .is_some()
                    {
                        tracing::debug!("Run {} expired from registry", state.run_id);
                    }
                }
            }
        });

        tracing::info!("Started run {} of graph {}", run_id, graph);
        run_id
    }

    pub fn get(&self, run_id: &str) -> Option<Arc<RunState>> {
        self.runs.get(run_id).map(|r| r.value().clone())
    }

    pub fn snapshot(&self, run_id: &str) -> Result<RunSnapshot, RegistryError> {
        self.get(run_id)
            .map(|run| run.snapshot())
            .ok_or_else(|| RegistryError::RunNotFound(run_id.to_string()))
    }

    pub fn list(&self) -> Vec<RunSnapshot> {
        let mut runs: Vec<_> = self.runs.iter().map(|r| r.snapshot()).collect();
        runs.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        runs
    }

    /// Answer a pending input request of `run_id`.
    pub async fn resolve(&self, run_id: &str, request_id: &str, response: &str) -> Result<bool, RegistryError> {
        let run = self
            .get(run_id)
            .ok_or_else(|| RegistryError::RunNotFound(run_id.to_string()))?;
        Ok(run.interaction.resolve_input(request_id, response).await?)
    }

    pub fn remove(&self, run_id: &str) -> Option<Arc<RunState>> {
        let (_, run) = self.runs.remove(run_id)?;
        run.detached.notify_one();
        Some(run)
    }

    /// Cancel one run. Returns `false` when it had already ended.
    pub async fn cancel(&self, run_id: &str) -> Result<bool, RegistryError> {
        let run = self
            .get(run_id)
            .ok_or_else(|| RegistryError::RunNotFound(run_id.to_string()))?;
        Ok(Self::cancel_run(&run).await)
    }

    async fn cancel_run(run: &RunState) -> bool {
        // Close the stream first so a step failing on its released waiter
        // cannot claim the terminal slot.
        let closed = run.bus.close_with_error("run cancelled", RunOutcome::Cancelled).await;
        run.cancel.cancel();
        run.interaction.cancel_all();
        if closed {
            tracing::info!("Run {} cancelled", run.run_id);
        }
        closed
    }

    /// Drain `run_id`'s bus. Once the terminal event has been delivered the
    /// run is removed; a consumer that stops early leaves it registered.
    pub fn event_stream(&self, run_id: &str) -> Result<impl Stream<Item = RuntimeEvent> + Send + 'static, RegistryError> {
        let run = self
            .get(run_id)
            .ok_or_else(|| RegistryError::RunNotFound(run_id.to_string()))?;
        let runs = self.runs.clone();
        let run_id = run.run_id.clone();
        let bus = run.bus.clone();

        let detach = stream::once(async move {
            runs.remove_if(&run.run_id, |_, current| Arc::ptr_eq(current, &run));
            run.detached.notify_one();
            tracing::info!("Run {} drained; detached from registry", run.run_id);
        })
        .filter_map(|()| future::ready(None::<RuntimeEvent>));

        Ok(bus
            .stream()
            .inspect(move |event| {
                if event.is_terminal() {
                    tracing::debug!("Run {}: terminal event #{} delivered", run_id, event.seq);
                }
            })
            .chain(detach))
    }

    /// Cancel every run and clear the registry.
    pub async fn shutdown(&self) {
        let runs: Vec<Arc<RunState>> = self.runs.iter().map(|r| r.value().clone()).collect();
        self.runs.clear();
        tracing::info!("Shutting down {} run(s)", runs.len());
        for run in runs {
            Self::cancel_run(&run).await;
            run.detached.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demos::{self, DemoDeps};
    use crate::events::EventKind;
    use crate::flow::{FlowGraph, Transition};
    use serde_json::Value;
    use std::collections::HashSet;

    fn registry() -> RunRegistry {
        RunRegistry::new(RunSettings::default())
    }

    fn start(registry: &RunRegistry, name: &str) -> String {
        let graph: Arc<FlowGraph<DemoDeps>> = Arc::new(demos::build(name).unwrap());
        let start = graph.start_step(Value::Null);
        registry.start_run(name, graph, start, DemoDeps::instant())
    }

    async fn first(_input: Value, _ctx: StepContext<()>) -> anyhow::Result<Transition> {
        Ok(Transition::goto("Second", Value::Null))
    }

    async fn second(_input: Value, _ctx: StepContext<()>) -> anyhow::Result<Transition> {
        Ok(Transition::end(Value::from("done")))
    }

    fn two_steps() -> FlowGraph<()> {
        FlowGraph::new("First")
            .step("First", "First", first)
            .and_then(|g| g.step("Second", "Second", second))
            .and_then(|g| g.edge("First", "Second"))
            .and_then(|g| g.ends("Second"))
            .and_then(FlowGraph::build)
            .unwrap()
    }

    async fn fan_out(_input: Value, _ctx: StepContext<()>) -> anyhow::Result<Transition> {
        Ok(Transition::fork("AskFork", &["AskLeft", "AskRight"], Value::Null))
    }

    async fn ask(ctx: &StepContext<()>, node_id: &str) -> anyhow::Result<Transition> {
        let answer = ctx
            .interaction()
            .request_input(node_id, &format!("{}?", node_id), vec![], None)
            .await?;
        let mut fields = serde_json::Map::new();
        fields.insert(node_id.to_string(), Value::String(answer));
        Ok(Transition::join("Answers", Value::Object(fields)))
    }

    async fn ask_left(_input: Value, ctx: StepContext<()>) -> anyhow::Result<Transition> {
        ask(&ctx, "AskLeft").await
    }

    async fn ask_right(_input: Value, ctx: StepContext<()>) -> anyhow::Result<Transition> {
        ask(&ctx, "AskRight").await
    }

    fn two_questions() -> FlowGraph<()> {
        FlowGraph::new("Ask")
            .step("Ask", "Ask", fan_out)
            .and_then(|g| g.step("AskLeft", "Ask Left", ask_left))
            .and_then(|g| g.step("AskRight", "Ask Right", ask_right))
            .and_then(|g| g.join_step("Answers", "Answers", None))
            .and_then(|g| g.node("AskFork", "Ask Fork"))
            .and_then(|g| g.edge("Ask", "AskFork"))
            .and_then(|g| g.edge("AskFork", "AskLeft"))
            .and_then(|g| g.edge("AskFork", "AskRight"))
            .and_then(|g| g.edge("AskLeft", "Answers"))
            .and_then(|g| g.edge("AskRight", "Answers"))
            .and_then(|g| g.ends("Answers"))
            .and_then(FlowGraph::build)
            .unwrap()
    }

    fn buffered(capacity: usize) -> RunRegistry {
        RunRegistry::new(RunSettings {
            event_buffer: Some(capacity),
            ..RunSettings::default()
        })
    }

    /// Waits until only the caller still holds `run`.
    async fn released(run: &Arc<RunState>) -> bool {
        for _ in 0..100 {
            if Arc::strong_count(run) == 1 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn collect(registry: &RunRegistry, run_id: &str) -> Vec<RuntimeEvent> {
        registry.event_stream(run_id).unwrap().collect().await
    }

    async fn next_input_request(stream: &mut (impl Stream<Item = RuntimeEvent> + Unpin)) -> (String, Vec<RuntimeEvent>) {
        let mut seen = Vec::new();
        while let Some(event) = stream.next().await {
            let request_id = match &event.kind {
                EventKind::InputRequest { request_id, .. } => Some(request_id.clone()),
                _ => None,
            };
            seen.push(event);
            if let Some(request_id) = request_id {
                return (request_id, seen);
            }
        }
        panic!("stream ended without an input request");
    }

    #[tokio::test]
    async fn test_sequential_run_event_sequence() {
        let registry = registry();
        let graph = Arc::new(two_steps());
        let start = graph.start_step(Value::Null);
        let run_id = registry.start_run("two_steps", graph, start, ());
        let events = collect(&registry, &run_id).await;

        let kinds: Vec<_> = events.iter().map(|e| e.kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::NodeStart { node_id: "First".into() },
                EventKind::NodeEnd { node_id: "First".into() },
                EventKind::EdgeTaken {
                    source_node_id: "First".into(),
                    target_node_id: Some("Second".into())
                },
                EventKind::NodeStart { node_id: "Second".into() },
                EventKind::NodeEnd { node_id: "Second".into() },
                EventKind::RunEnd,
            ]
        );
        assert!(events.iter().all(|e| e.run_id == run_id));
        // drained runs are detached
        assert!(registry.get(&run_id).is_none());
    }

    #[tokio::test]
    async fn test_failing_step_yields_single_error_last() {
        let registry = registry();
        let run_id = start(&registry, "failure");
        let events = collect(&registry, &run_id).await;

        assert_eq!(events[0].kind.name(), "node_start");
        let errors: Vec<_> = events
            .iter()
            .filter(|e| matches!(e.kind, EventKind::Error { .. }))
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].kind,
            EventKind::error("boom", Some("Explode".into()))
        );
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_human_input_round_trip() {
        let registry = registry();
        let run_id = start(&registry, "human_in_the_loop");
        let mut stream = Box::pin(registry.event_stream(&run_id).unwrap());

        let (request_id, _) = next_input_request(&mut stream).await;
        assert_eq!(registry.get(&run_id).unwrap().status(), RunStatus::AwaitingInput);

        // unknown ids are rejected without touching the stream
        assert_eq!(registry.resolve(&run_id, "nope", "yes").await, Ok(false));
        assert!(registry.resolve(&run_id, &request_id, "yes").await.unwrap());

        let rest: Vec<_> = stream.collect().await;
        let names: Vec<_> = rest.iter().map(|e| e.kind.name()).collect();
        assert_eq!(names[0], "input_response");
        assert_eq!(names[1], "node_end");
        assert_eq!(names.last(), Some(&"run_end"));
        assert!(rest.iter().all(|e| !matches!(
            &e.kind,
            EventKind::InputResponse { request_id: id, .. } if id == "nope"
        )));
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let registry = registry();
        assert_eq!(
            registry.resolve("missing", "r", "yes").await,
            Err(RegistryError::RunNotFound("missing".into()))
        );
        assert!(registry.event_stream("missing").is_err());
        assert!(registry.cancel("missing").await.is_err());
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_cancel_releases_pending_input() {
        let registry = registry();
        let run_id = start(&registry, "human_in_the_loop");
        let mut stream = Box::pin(registry.event_stream(&run_id).unwrap());
        next_input_request(&mut stream).await;

        assert!(registry.cancel(&run_id).await.unwrap());
        let rest: Vec<_> = stream.collect().await;
        assert_eq!(rest.last().unwrap().kind, EventKind::error("run cancelled", None));
        assert_eq!(rest.iter().filter(|e| e.is_terminal()).count(), 1);
        assert!(!registry.cancel(&run_id).await.unwrap_or(false));
    }

    #[tokio::test]
    async fn test_runs_are_isolated() {
        let registry = registry();
        let failing = start(&registry, "failure");
        let ordered = start(&registry, "ordered");
        assert_ne!(failing, ordered);

        let ordered_events = collect(&registry, &ordered).await;
        assert_eq!(ordered_events.last().unwrap().kind, EventKind::RunEnd);
        let failing_events = collect(&registry, &failing).await;
        assert_eq!(failing_events.last().unwrap().kind.name(), "error");
    }

    #[tokio::test]
    async fn test_shutdown_clears_and_cancels() {
        let registry = registry();
        let run_id = start(&registry, "human_in_the_loop");
        let run = registry.get(&run_id).unwrap();

        registry.shutdown().await;
        assert_eq!(registry.len(), 0);
        assert_eq!(run.bus.wait_complete().await, RunOutcome::Cancelled);
        assert_eq!(run.status(), RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_remove_detaches_run_without_stopping_it() {
        let registry = registry();
        let run_id = start(&registry, "ordered");
        let run = registry.remove(&run_id).unwrap();

        assert!(registry.get(&run_id).is_none());
        assert!(registry.remove(&run_id).is_none());
        assert_eq!(run.bus.wait_complete().await, RunOutcome::Completed);
    }

    #[tokio::test]
    async fn test_undrained_run_expires_after_retention() {
        let registry = RunRegistry::new(RunSettings {
            retention: Duration::from_millis(10),
            ..RunSettings::default()
        });
        let run_id = start(&registry, "ordered");
        let run = registry.get(&run_id).unwrap();
        run.bus.wait_complete().await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.get(&run_id).is_none());
    }

    #[tokio::test]
    async fn test_concurrent_input_requests_resolve_out_of_order() {
        let registry = registry();
        let graph = Arc::new(two_questions());
        let start = graph.start_step(Value::Null);
        let run_id = registry.start_run("two_questions", graph, start, ());
        let mut stream = Box::pin(registry.event_stream(&run_id).unwrap());

        let (first, _) = next_input_request(&mut stream).await;
        let (second, _) = next_input_request(&mut stream).await;
        assert_ne!(first, second);
        assert_eq!(registry.get(&run_id).unwrap().interaction.pending_count(), 2);

        // answer the later request first
        assert!(registry.resolve(&run_id, &second, "two").await.unwrap());
        assert!(registry.resolve(&run_id, &first, "one").await.unwrap());
        assert_eq!(registry.resolve(&run_id, &first, "again").await, Ok(false));

        let rest: Vec<_> = stream.collect().await;
        let answered: Vec<_> = rest
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::InputResponse { request_id, response, .. } => Some((request_id.clone(), response.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(
            answered,
            vec![(second.clone(), "two".to_string()), (first.clone(), "one".to_string())]
        );
        let requested: HashSet<_> = [first, second].into_iter().collect();
        assert!(answered.iter().all(|(id, _)| requested.contains(id)));
        assert_eq!(rest.last().unwrap().kind, EventKind::RunEnd);
    }

    #[tokio::test]
    async fn test_cancel_does_not_wait_for_a_full_queue() {
        let registry = buffered(1);
        let run_id = start(&registry, "ordered");
        // nobody drains: the producer blocks on its second event
        tokio::time::sleep(Duration::from_millis(20)).await;

        let cancelled = tokio::time::timeout(Duration::from_secs(2), registry.cancel(&run_id)).await;
        assert_eq!(cancelled, Ok(Ok(true)));

        let events = tokio::time::timeout(Duration::from_secs(2), collect(&registry, &run_id))
            .await
            .unwrap();
        assert_eq!(events[0].kind, EventKind::NodeStart { node_id: "Start".into() });
        assert_eq!(events.last().unwrap().kind, EventKind::error("run cancelled", None));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        let seqs: Vec<_> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (0..events.len() as u64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_shutdown_does_not_wait_for_a_full_queue() {
        let registry = buffered(1);
        let run_id = start(&registry, "ordered");
        let run = registry.get(&run_id).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(tokio::time::timeout(Duration::from_secs(2), registry.shutdown()).await.is_ok());
        assert_eq!(run.bus.wait_complete().await, RunOutcome::Cancelled);
        assert!(released(&run).await);
    }

    #[tokio::test]
    async fn test_drained_run_is_released_before_retention() {
        let registry = registry();
        let run_id = start(&registry, "ordered");
        let run = registry.get(&run_id).unwrap();

        collect(&registry, &run_id).await;
        assert!(registry.get(&run_id).is_none());
        assert!(released(&run).await);
    }
}
