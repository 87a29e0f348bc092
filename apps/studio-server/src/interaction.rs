// [[STUDIO]]/apps/studio-server/src/interaction.rs
// Purpose: Tool-call bookkeeping and human-input suspension points for a run.
// Architecture: Run Interaction Layer
// Dependencies: DashMap, Tokio (oneshot), Uuid

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::bus::{BusError, EventEmitter};
use crate::events::EventKind;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InteractionError {
    #[error("interaction hub used before it was bound to a run")]
    NotBound,
    #[error("interaction hub is bound to run {bound}, refusing to rebind to {requested}")]
    AlreadyBound { bound: String, requested: String },
    #[error("tool call id {0} was already used in this run")]
    DuplicateCallId(String),
    #[error("tool result for unknown call id {0}")]
    UnknownCallId(String),
    #[error("tool call {0} already has a result")]
    ResultAlreadyRecorded(String),
    #[error("input request {0} was cancelled")]
    Cancelled(String),
    #[error("input request {request_id} timed out after {timeout:?}")]
    TimedOut { request_id: String, timeout: Duration },
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// A step suspended in [`InteractionHub::request_input`].
pub struct PendingInteraction {
    pub node_id: String,
    pub request_id: String,
    waiter: oneshot::Sender<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingSummary {
    pub request_id: String,
    pub node_id: String,
}

struct Binding {
    run_id: String,
    emitter: Arc<dyn EventEmitter>,
}

/// Per-run interaction coordinator. Bound exactly once to the run's emitter;
/// shared by every branch of the run.
pub struct InteractionHub {
    binding: OnceLock<Binding>,
    pending: DashMap<String, PendingInteraction>,
    // call_id -> result recorded
    calls: DashMap<String, bool>,
    input_timeout: Option<Duration>,
    closed: AtomicBool,
}

impl InteractionHub {
    pub fn new(input_timeout: Option<Duration>) -> Self {
        Self {
            binding: OnceLock::new(),
            pending: DashMap::new(),
            calls: DashMap::new(),
            input_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Attach the hub to a run. Rebinding to the same run is a no-op.
    pub fn bind(&self, run_id: &str, emitter: Arc<dyn EventEmitter>) -> Result<(), InteractionError> {
        let bound = self.binding.get_or_init(|| Binding {
            run_id: run_id.to_string(),
            emitter,
        });
        if bound.run_id != run_id {
            tracing::error!(
                "Interaction hub for run {} asked to rebind to run {}",
                bound.run_id,
                run_id
            );
            return Err(InteractionError::AlreadyBound {
                bound: bound.run_id.clone(),
                requested: run_id.to_string(),
            });
        }
        Ok(())
    }

    fn binding(&self) -> Result<&Binding, InteractionError> {
        self.binding.get().ok_or_else(|| {
            tracing::error!("Interaction hub used before bind");
            InteractionError::NotBound
        })
    }

    pub fn run_id(&self) -> Option<&str> {
        self.binding.get().map(|b| b.run_id.as_str())
    }

    /// Emit a `ToolCall` and return its call id (generated when `call_id` is `None`).
    pub async fn emit_tool_call(
        &self,
        node_id: &str,
        tool_name: &str,
        arguments: Value,
        call_id: Option<String>,
    ) -> Result<String, InteractionError> {
        let binding = self.binding()?;
        let call_id = call_id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        match self.calls.entry(call_id.clone()) {
            Entry::Occupied(_) => return Err(InteractionError::DuplicateCallId(call_id)),
            Entry::Vacant(slot) => {
                slot.insert(false);
            }
        }

        binding
            .emitter
            .emit(EventKind::ToolCall {
                node_id: node_id.to_string(),
                tool_name: tool_name.to_string(),
                call_id: call_id.clone(),
                arguments,
            })
            .await?;
        Ok(call_id)
    }

    pub async fn emit_tool_result(
        &self,
        node_id: &str,
        tool_name: &str,
        call_id: &str,
        output: Value,
        success: bool,
    ) -> Result<(), InteractionError> {
        let binding = self.binding()?;
        {
            let mut recorded = self
                .calls
                .get_mut(call_id)
                .ok_or_else(|| InteractionError::UnknownCallId(call_id.to_string()))?;
            if *recorded {
                return Err(InteractionError::ResultAlreadyRecorded(call_id.to_string()));
            }
            *recorded = true;
        }

        binding
            .emitter
            .emit(EventKind::ToolResult {
                node_id: node_id.to_string(),
                tool_name: tool_name.to_string(),
                call_id: call_id.to_string(),
                output,
                success,
            })
            .await?;
        Ok(())
    }

    /// Emit an `InputRequest` and suspend the calling step until
    /// [`resolve_input`](Self::resolve_input) answers it.
    pub async fn request_input(
        &self,
        node_id: &str,
        prompt: &str,
        options: Vec<String>,
        context: Option<Value>,
    ) -> Result<String, InteractionError> {
        let binding = self.binding()?;
        let request_id = Uuid::new_v4().simple().to_string();
        let (tx, rx) = oneshot::channel();

        self.pending.insert(
            request_id.clone(),
            PendingInteraction {
                node_id: node_id.to_string(),
                request_id: request_id.clone(),
                waiter: tx,
            },
        );
        // cancel_all may have run between the caller's last await and the insert
        if self.closed.load(Ordering::SeqCst) {
            self.pending.remove(&request_id);
            return Err(InteractionError::Cancelled(request_id));
        }

        let emitted = binding
            .emitter
            .emit(EventKind::InputRequest {
                node_id: node_id.to_string(),
                request_id: request_id.clone(),
                prompt: prompt.to_string(),
                options,
                context,
            })
            .await;
        if let Err(e) = emitted {
            self.pending.remove(&request_id);
            return Err(e.into());
        }
        tracing::info!("Run {}: node {} awaiting input {}", binding.run_id, node_id, request_id);

        let received = match self.input_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.pending.remove(&request_id);
                    tracing::warn!("Run {}: input {} timed out", binding.run_id, request_id);
                    return Err(InteractionError::TimedOut { request_id, timeout });
                }
            },
            None => rx.await,
        };
        received.map_err(|_| InteractionError::Cancelled(request_id))
    }

    /// Answer a pending request. Returns `Ok(false)` when `request_id` is not
    /// pending (never issued, already answered, or its step is gone).
    pub async fn resolve_input(&self, request_id: &str, response: &str) -> Result<bool, InteractionError> {
        let binding = self.binding()?;
        let pending = match self.pending.remove(request_id) {
            Some((_, pending)) => pending,
            None => {
                tracing::debug!("Run {}: no pending input {}", binding.run_id, request_id);
                return Ok(false);
            }
        };
        if pending.waiter.is_closed() {
            return Ok(false);
        }

        // The response event must be queued before the step can resume.
        binding
            .emitter
            .emit(EventKind::InputResponse {
                node_id: pending.node_id.clone(),
                request_id: pending.request_id.clone(),
                response: response.to_string(),
            })
            .await?;

        if pending.waiter.send(response.to_string()).is_err() {
            tracing::warn!("Run {}: step for input {} went away", binding.run_id, request_id);
        }
        Ok(true)
    }

    /// Release every waiter with a cancellation and refuse new requests.
    pub fn cancel_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let released = self.pending.len();
        self.pending.clear();
        if released > 0 {
            tracing::info!(
                "Run {}: released {} pending input request(s)",
                self.run_id().unwrap_or("<unbound>"),
                released
            );
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_requests(&self) -> Vec<PendingSummary> {
        let mut pending: Vec<_> = self
            .pending
            .iter()
            .map(|p| PendingSummary {
                request_id: p.request_id.clone(),
                node_id: p.node_id.clone(),
            })
            .collect();
        pending.sort_by(|a, b| a.request_id.cmp(&b.request_id));
        pending
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Emitter that keeps everything in memory.
    #[derive(Default)]
    pub(crate) struct RecordingEmitter {
        pub(crate) events: Mutex<Vec<EventKind>>,
    }

    impl RecordingEmitter {
        pub(crate) fn kinds(&self) -> Vec<EventKind> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventEmitter for RecordingEmitter {
        async fn emit(&self, kind: EventKind) -> Result<u64, BusError> {
            let mut events = self.events.lock().unwrap();
            events.push(kind);
            Ok(events.len() as u64 - 1)
        }
    }

    fn bound_hub(timeout: Option<Duration>) -> (Arc<InteractionHub>, Arc<RecordingEmitter>) {
        let emitter = Arc::new(RecordingEmitter::default());
        let hub = Arc::new(InteractionHub::new(timeout));
        hub.bind("run-1", emitter.clone()).unwrap();
        (hub, emitter)
    }

    async fn wait_for_pending(hub: &InteractionHub) -> String {
        loop {
            if let Some(p) = hub.pending_requests().into_iter().next() {
                return p.request_id;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_request_input_suspends_until_resolved() {
        let (hub, emitter) = bound_hub(None);

        let asking = {
            let hub = hub.clone();
            tokio::spawn(async move {
                hub.request_input("AskApproval", "Approve?", vec!["yes".into(), "no".into()], Some("draft".into()))
                    .await
            })
        };
        let request_id = wait_for_pending(&hub).await;
        assert!(!asking.is_finished());

        assert!(hub.resolve_input(&request_id, "yes").await.unwrap());
        assert_eq!(asking.await.unwrap().unwrap(), "yes");

        let kinds = emitter.kinds();
        assert_eq!(kinds.len(), 2);
        match &kinds[0] {
            EventKind::InputRequest { request_id: id, context, .. } => {
                assert_eq!(id, &request_id);
                assert_eq!(context, &Some(Value::from("draft")));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            kinds[1],
            EventKind::InputResponse {
                node_id: "AskApproval".into(),
                request_id: request_id.clone(),
                response: "yes".into(),
            }
        );
        assert_eq!(hub.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_resolving_unknown_or_answered_request_is_reported() {
        let (hub, emitter) = bound_hub(None);
        assert!(!hub.resolve_input("never-issued", "yes").await.unwrap());
        assert!(emitter.kinds().is_empty());

        let asking = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.request_input("N", "ok?", vec![], None).await })
        };
        let request_id = wait_for_pending(&hub).await;
        assert!(hub.resolve_input(&request_id, "a").await.unwrap());
        assert!(!hub.resolve_input(&request_id, "b").await.unwrap());
        assert_eq!(asking.await.unwrap().unwrap(), "a");
        assert_eq!(emitter.kinds().len(), 2);
    }

    #[tokio::test]
    async fn test_unbound_hub_fails() {
        let hub = InteractionHub::new(None);
        let err = hub.request_input("N", "p", vec![], None).await.unwrap_err();
        assert_eq!(err, InteractionError::NotBound);
        assert_eq!(hub.resolve_input("x", "y").await.unwrap_err(), InteractionError::NotBound);
    }

    #[tokio::test]
    async fn test_rebinding_to_other_run_fails() {
        let (hub, _) = bound_hub(None);
        let other = Arc::new(RecordingEmitter::default());
        assert!(hub.bind("run-1", other.clone()).is_ok());
        assert!(matches!(
            hub.bind("run-2", other),
            Err(InteractionError::AlreadyBound { .. })
        ));
        assert_eq!(hub.run_id(), Some("run-1"));
    }

    #[tokio::test]
    async fn test_cancel_all_releases_waiters() {
        let (hub, _) = bound_hub(None);
        let asking = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.request_input("N", "p", vec![], None).await })
        };
        wait_for_pending(&hub).await;

        hub.cancel_all();
        assert!(matches!(asking.await.unwrap(), Err(InteractionError::Cancelled(_))));
        assert!(matches!(
            hub.request_input("N", "p", vec![], None).await,
            Err(InteractionError::Cancelled(_))
        ));
    }

    #[tokio::test]
    async fn test_input_timeout_removes_pending_request() {
        let (hub, _) = bound_hub(Some(Duration::from_millis(10)));
        let err = hub.request_input("N", "p", vec![], None).await.unwrap_err();
        assert!(matches!(err, InteractionError::TimedOut { .. }));
        assert_eq!(hub.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_tool_call_ids_are_unique_and_correlated() {
        let (hub, emitter) = bound_hub(None);
        let generated = hub
            .emit_tool_call("CallTool", "lookup", serde_json::json!({"q": "status"}), None)
            .await
            .unwrap();
        assert!(!generated.is_empty());

        hub.emit_tool_call("CallTool", "lookup", Value::Null, Some("c1".into()))
            .await
            .unwrap();
        assert_eq!(
            hub.emit_tool_call("CallTool", "lookup", Value::Null, Some("c1".into())).await,
            Err(InteractionError::DuplicateCallId("c1".into()))
        );

        hub.emit_tool_result("CallTool", "lookup", "c1", "ok".into(), true)
            .await
            .unwrap();
        assert_eq!(
            hub.emit_tool_result("CallTool", "lookup", "c1", "again".into(), true).await,
            Err(InteractionError::ResultAlreadyRecorded("c1".into()))
        );
        assert_eq!(
            hub.emit_tool_result("CallTool", "lookup", "nope", Value::Null, false).await,
            Err(InteractionError::UnknownCallId("nope".into()))
        );
        assert_eq!(emitter.kinds().len(), 3);
    }
}
