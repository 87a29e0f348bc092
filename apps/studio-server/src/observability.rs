use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::events::EventKind;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub events_emitted: u64,
    pub nodes_started: u64,
    pub tool_calls: u64,
    pub input_requests: u64,
    pub errors: u64,
}

/// Lock-free tallies updated by the bus on every enqueue.
#[derive(Debug, Default)]
pub struct RunCounters {
    events_emitted: AtomicU64,
    nodes_started: AtomicU64,
    tool_calls: AtomicU64,
    input_requests: AtomicU64,
    errors: AtomicU64,
}

impl RunCounters {
    pub fn record(&self, kind: &EventKind) {
        self.events_emitted.fetch_add(1, Ordering::Relaxed);
        let counter = match kind {
            EventKind::NodeStart { .. } => &self.nodes_started,
            EventKind::ToolCall { .. } => &self.tool_calls,
            EventKind::InputRequest { .. } => &self.input_requests,
            EventKind::Error { .. } => &self.errors,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RunMetrics {
        RunMetrics {
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            nodes_started: self.nodes_started.load(Ordering::Relaxed),
            tool_calls: self.tool_calls.load(Ordering::Relaxed),
            input_requests: self.input_requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Install the global subscriber. `RUST_LOG` directives override the defaults.
pub fn init_tracing() {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in ["studio_kernel=debug", "tower_http=trace"] {
        match directive.parse() {
            Ok(d) => filter = filter.add_directive(d),
            Err(e) => eprintln!("invalid tracing directive {}: {}", directive, e),
        }
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
