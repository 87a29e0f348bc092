// [[STUDIO]]/apps/studio-server/src/demos.rs
// Purpose: Built-in graphs served by the studio when no other graph is wired in.
// Architecture: Application Layer (sample workloads)
// Dependencies: FlowGraph, Tokio (time)

use serde_json::{json, Value};
use std::time::Duration;

use crate::config;
use crate::engine::StepContext;
use crate::flow::{FlowError, FlowGraph, Transition};

pub const NAMES: [&str; 8] = [
    "ordered",
    "human_in_the_loop",
    "tool_usage",
    "streaming_events",
    "parallel_joins",
    "ai_concierge",
    "error_handling",
    "failure",
];

/// Knobs shared by every demo step.
#[derive(Debug, Clone)]
pub struct DemoDeps {
    /// Multiplier applied to every simulated delay; 0 skips them
    pub pace: f64,
    pub max_steps: u64,
    pub ticks: u64,
    pub chunk_delay: Duration,
    pub input_ready: bool,
    pub results_available: bool,
    pub thread_locked: bool,
    pub fail_validation: bool,
}

impl Default for DemoDeps {
    fn default() -> Self {
        Self {
            pace: 1.0,
            max_steps: 4,
            ticks: 5,
            chunk_delay: Duration::from_secs(1),
            input_ready: true,
            results_available: true,
            thread_locked: false,
            fail_validation: true,
        }
    }
}

impl DemoDeps {
    /// Read the demo switches (`STREAMING_TICKS`, `PARALLEL_INPUT_READY`,
    /// `CONCIERGE_RESULTS_AVAILABLE`, `CONCIERGE_THREAD_LOCKED`,
    /// `ERROR_HANDLING_FAIL`). Malformed values keep the defaults.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok();
        let defaults = Self::default();
        Self {
            ticks: var("STREAMING_TICKS")
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .map(|ticks| ticks.max(1))
                .unwrap_or(defaults.ticks),
            input_ready: config::flag(var("PARALLEL_INPUT_READY"), defaults.input_ready),
            results_available: config::flag(
                var("CONCIERGE_RESULTS_AVAILABLE"),
                defaults.results_available,
            ),
            thread_locked: config::flag(var("CONCIERGE_THREAD_LOCKED"), defaults.thread_locked),
            fail_validation: config::flag(var("ERROR_HANDLING_FAIL"), defaults.fail_validation),
            ..defaults
        }
    }

    pub fn instant() -> Self {
        Self {
            pace: 0.0,
            ..Self::default()
        }
    }

    async fn pause(&self, millis: u64) {
        self.pause_for(Duration::from_millis(millis)).await
    }

    async fn pause_for(&self, delay: Duration) {
        if self.pace > 0.0 {
            tokio::time::sleep(delay.mul_f64(self.pace)).await;
        }
    }
}

type Ctx = StepContext<DemoDeps>;
type StepResult = anyhow::Result<Transition>;

pub fn build(name: &str) -> Result<FlowGraph<DemoDeps>, FlowError> {
    match name {
        "ordered" => ordered(),
        "human_in_the_loop" => human_in_the_loop(),
        "tool_usage" => tool_usage(),
        "streaming_events" => streaming_events(),
        "parallel_joins" => parallel_joins(),
        "ai_concierge" => ai_concierge(),
        "error_handling" => error_handling(),
        "failure" => failure(),
        other => Err(FlowError::UnknownGraph(other.to_string())),
    }
}

fn text(input: &Value, key: &str) -> String {
    input[key].as_str().unwrap_or_default().to_string()
}

// ordered: a counter loop alternating between odd and even steps

fn ordered() -> Result<FlowGraph<DemoDeps>, FlowError> {
    FlowGraph::new("Start")
        .step("Start", "Start", ordered_start)?
        .step("Work", "Work", ordered_work)?
        .step("OddStep", "Odd Step", ordered_next)?
        .step("EvenStep", "Even Step", ordered_next)?
        .step("Done", "Done", ordered_done)?
        .edge("Start", "Work")?
        .edge("Work", "OddStep")?
        .edge("Work", "EvenStep")?
        .edge("Work", "Done")?
        .edge("OddStep", "Work")?
        .edge("EvenStep", "Work")?
        .ends("Done")?
        .build()
}

async fn ordered_start(_input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(200).await;
    Ok(Transition::goto("Work", json!({ "step": 1 })))
}

async fn ordered_work(input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(300).await;
    let step = input["step"].as_u64().unwrap_or(1);
    if step >= ctx.deps().max_steps {
        return Ok(Transition::goto(
            "Done",
            json!({ "message": format!("done after {} steps", step) }),
        ));
    }
    let next = if step % 2 == 0 { "EvenStep" } else { "OddStep" };
    Ok(Transition::goto(next, json!({ "next_step": step + 1 })))
}

async fn ordered_next(input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(200).await;
    Ok(Transition::goto("Work", json!({ "step": input["next_step"] })))
}

async fn ordered_done(input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(100).await;
    Ok(Transition::end(Value::String(text(&input, "message"))))
}

// human_in_the_loop: a draft that needs an explicit approval

const DRAFT_CONTEXT: &str = "Draft summary:\n\
- Title: Quarterly Support Trends\n\
- Key claim: Ticket resolution time improved by 14%\n\
- Open concern: Week 3 had a spike in escalations\n\
- Recommendation: Approve publishing with a brief risk note";

fn human_in_the_loop() -> Result<FlowGraph<DemoDeps>, FlowError> {
    FlowGraph::new("Start")
        .step("Start", "Start", hitl_start)?
        .step("Draft", "Draft", hitl_draft)?
        .step("AwaitApproval", "Await Approval", hitl_await_approval)?
        .step("Finalize", "Finalize", finalize_message)?
        .edge("Start", "Draft")?
        .edge("Draft", "AwaitApproval")?
        .edge("AwaitApproval", "Finalize")?
        .ends("Finalize")?
        .build()
}

async fn hitl_start(_input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(100).await;
    Ok(Transition::goto("Draft", Value::Null))
}

async fn hitl_draft(_input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(200).await;
    Ok(Transition::goto(
        "AwaitApproval",
        json!({ "review_context": DRAFT_CONTEXT }),
    ))
}

async fn hitl_await_approval(input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(300).await;
    let response = ctx
        .interaction()
        .request_input(
            "AwaitApproval",
            "Approve this run?",
            vec!["yes".to_string(), "no".to_string()],
            Some(Value::String(text(&input, "review_context"))),
        )
        .await?;

    let approved = matches!(
        response.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "approve" | "approved"
    );
    if !approved {
        anyhow::bail!("Rejected by human");
    }
    Ok(Transition::goto(
        "Finalize",
        json!({ "message": "Approved by human" }),
    ))
}

async fn finalize_message(input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(200).await;
    Ok(Transition::end(Value::String(text(&input, "message"))))
}

// tool_usage: one correlated tool call

fn tool_usage() -> Result<FlowGraph<DemoDeps>, FlowError> {
    FlowGraph::new("Start")
        .step("Start", "Start", tool_start)?
        .step("CallTool", "Call Tool", tool_call)?
        .step("Summarize", "Summarize", tool_summarize)?
        .edge("Start", "CallTool")?
        .edge("CallTool", "Summarize")?
        .ends("Summarize")?
        .build()
}

async fn tool_start(_input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(100).await;
    Ok(Transition::goto("CallTool", json!({ "query": "status check" })))
}

async fn tool_call(input: Value, ctx: Ctx) -> StepResult {
    let query = text(&input, "query");
    let call_id = ctx
        .interaction()
        .emit_tool_call("CallTool", "lookup", json!({ "query": query }), None)
        .await?;
    ctx.deps().pause(200).await;

    let result = format!("tool result for '{}'", query);
    ctx.interaction()
        .emit_tool_result("CallTool", "lookup", &call_id, Value::String(result.clone()), true)
        .await?;
    Ok(Transition::goto(
        "Summarize",
        json!({ "query": query, "result": result }),
    ))
}

async fn tool_summarize(input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(200).await;
    Ok(Transition::end(Value::String(format!(
        "Used tool '{}' -> {}",
        text(&input, "query"),
        text(&input, "result")
    ))))
}

// streaming_events: a step looping on itself, one tool pair per tick

fn streaming_events() -> Result<FlowGraph<DemoDeps>, FlowError> {
    FlowGraph::new("Start")
        .step("Start", "Start", stream_start)?
        .step("Tick", "Tick", stream_tick)?
        .step("Done", "Done", stream_done)?
        .edge("Start", "Tick")?
        .edge("Tick", "Tick")?
        .edge("Tick", "Done")?
        .ends("Done")?
        .build()
}

async fn stream_start(_input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(100).await;
    Ok(Transition::goto("Tick", json!({ "count": 1 })))
}

async fn stream_tick(input: Value, ctx: Ctx) -> StepResult {
    let deps = ctx.deps();
    let count = input["count"].as_u64().unwrap_or(1);
    let total = deps.ticks;

    let call_id = ctx
        .interaction()
        .emit_tool_call(
            "Tick",
            "stream_chunk",
            json!({ "tick": count, "total": total }),
            None,
        )
        .await?;
    deps.pause_for(deps.chunk_delay).await;
    ctx.interaction()
        .emit_tool_result(
            "Tick",
            "stream_chunk",
            &call_id,
            json!({
                "tick": count,
                "total": total,
                "chunk": format!("Chunk {}: lorem ipsum event payload", count),
                "is_final": count >= total,
            }),
            true,
        )
        .await?;

    if count >= total {
        return Ok(Transition::goto("Done", json!({ "total": count })));
    }
    Ok(Transition::goto("Tick", json!({ "count": count + 1 })))
}

async fn stream_done(input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(100).await;
    Ok(Transition::end(Value::String(format!(
        "streamed {} ticks",
        input["total"]
    ))))
}

// parallel_joins: gate, fan out three fetches, join, synthesize

fn parallel_joins() -> Result<FlowGraph<DemoDeps>, FlowError> {
    FlowGraph::new("InputGate")
        .step("InputGate", "Input Gate", input_gate)?
        .step("Escalate", "Escalate", escalate)?
        .step("Planner", "Planner", planner)?
        .step("FetchProfile", "Fetch Profile", fetch_profile)?
        .step("FetchMetrics", "Fetch Metrics", fetch_metrics)?
        .step("FetchHistory", "Fetch History", fetch_history)?
        .join_step("FetchJoin", "Fetch Join", Some("Synthesize"))?
        .step("Synthesize", "Synthesize", synthesize)?
        .step("Finalize", "Finalize", finalize_passthrough)?
        .node("FetchFork", "Fetch Fork")?
        .end_node("End", "End")?
        .edge("InputGate", "Planner")?
        .edge("InputGate", "Escalate")?
        .edge("Planner", "FetchFork")?
        .edge("FetchFork", "FetchProfile")?
        .edge("FetchFork", "FetchMetrics")?
        .edge("FetchFork", "FetchHistory")?
        .edge("FetchProfile", "FetchJoin")?
        .edge("FetchMetrics", "FetchJoin")?
        .edge("FetchHistory", "FetchJoin")?
        .edge("FetchJoin", "Synthesize")?
        .edge("Synthesize", "Finalize")?
        .ends("Finalize")?
        .ends("Escalate")?
        .build()
}

async fn input_gate(_input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(150).await;
    let next = if ctx.deps().input_ready { "Planner" } else { "Escalate" };
    Ok(Transition::goto(next, Value::Null))
}

async fn escalate(_input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(200).await;
    Ok(Transition::end(Value::from("Escalated: manual review required")))
}

async fn planner(_input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(200).await;
    Ok(Transition::fork(
        "FetchFork",
        &["FetchProfile", "FetchMetrics", "FetchHistory"],
        Value::Null,
    ))
}

async fn fetch_profile(_input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(350).await;
    Ok(Transition::join("FetchJoin", json!({ "profile": "ready" })))
}

async fn fetch_metrics(_input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(400).await;
    Ok(Transition::join("FetchJoin", json!({ "metrics": "refreshed" })))
}

async fn fetch_history(_input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(450).await;
    Ok(Transition::join("FetchJoin", json!({ "history": "loaded" })))
}

/// Sorted field names of a joined object, comma separated.
fn joined_keys(input: &Value) -> String {
    let mut keys: Vec<&str> = input
        .as_object()
        .map(|fields| fields.keys().map(String::as_str).collect())
        .unwrap_or_default();
    keys.sort_unstable();
    keys.join(", ")
}

async fn synthesize(input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(200).await;
    Ok(Transition::goto(
        "Finalize",
        Value::String(format!("synthesized from {}", joined_keys(&input))),
    ))
}

async fn finalize_passthrough(input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(200).await;
    Ok(Transition::end(input))
}

// ai_concierge: two gates in front of an escalation or a three-way fetch

fn ai_concierge() -> Result<FlowGraph<DemoDeps>, FlowError> {
    FlowGraph::new("ResultsGate")
        .step("ResultsGate", "Results Gate", results_gate)?
        .step("ThreadGate", "Thread Gate", thread_gate)?
        .step("Escalate", "Escalate", concierge_escalate)?
        .step("PlannerLLM", "Planner LLM", concierge_planner)?
        .step("FetchQuestionnaire", "Fetch Questionnaire", fetch_questionnaire)?
        .step("FetchBiomarkers", "Fetch Biomarkers", fetch_biomarkers)?
        .step("FetchTranscript", "Fetch Transcript", fetch_transcript)?
        .join_step("FetchJoin", "Fetch Join", Some("AnswerLLM"))?
        .step("AnswerLLM", "Answer LLM", answer_llm)?
        .step("AttributionValidation", "Attribution Validation", finalize_passthrough)?
        .node("FetchFork", "Fetch Fork")?
        .end_node("End", "End")?
        .edge("ResultsGate", "ThreadGate")?
        .edge("ResultsGate", "Escalate")?
        .edge("ThreadGate", "Escalate")?
        .edge("ThreadGate", "PlannerLLM")?
        .edge("PlannerLLM", "FetchFork")?
        .edge("FetchFork", "FetchQuestionnaire")?
        .edge("FetchFork", "FetchBiomarkers")?
        .edge("FetchFork", "FetchTranscript")?
        .edge("FetchQuestionnaire", "FetchJoin")?
        .edge("FetchBiomarkers", "FetchJoin")?
        .edge("FetchTranscript", "FetchJoin")?
        .edge("FetchJoin", "AnswerLLM")?
        .edge("AnswerLLM", "AttributionValidation")?
        .ends("AttributionValidation")?
        .ends("Escalate")?
        .build()
}

async fn results_gate(_input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(150).await;
    let next = if ctx.deps().results_available { "ThreadGate" } else { "Escalate" };
    Ok(Transition::goto(next, Value::Null))
}

async fn thread_gate(_input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(150).await;
    let next = if ctx.deps().thread_locked { "Escalate" } else { "PlannerLLM" };
    Ok(Transition::goto(next, Value::Null))
}

async fn concierge_escalate(_input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(200).await;
    Ok(Transition::end(Value::from(
        "Escalated: lock thread and alert clinician",
    )))
}

async fn concierge_planner(_input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(200).await;
    Ok(Transition::fork(
        "FetchFork",
        &["FetchQuestionnaire", "FetchBiomarkers", "FetchTranscript"],
        Value::Null,
    ))
}

async fn fetch_questionnaire(_input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(350).await;
    Ok(Transition::join("FetchJoin", json!({ "questionnaire": "completed" })))
}

async fn fetch_biomarkers(_input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(400).await;
    Ok(Transition::join("FetchJoin", json!({ "biomarkers": "refreshed" })))
}

async fn fetch_transcript(_input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(450).await;
    Ok(Transition::join("FetchJoin", json!({ "transcript": "indexed" })))
}

async fn answer_llm(input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(200).await;
    Ok(Transition::goto(
        "AttributionValidation",
        Value::String(format!("answer drafted from {}", joined_keys(&input))),
    ))
}

// error_handling: a validation failure routed to a recovery path

fn error_handling() -> Result<FlowGraph<DemoDeps>, FlowError> {
    FlowGraph::new("Start")
        .step("Start", "Start", validate_start)?
        .step("Validate", "Validate", validate)?
        .step("HandleError", "Handle Error", handle_error)?
        .step("Recover", "Recover", finalize_message)?
        .step("Process", "Process", process)?
        .edge("Start", "Validate")?
        .edge("Validate", "HandleError")?
        .edge("Validate", "Process")?
        .edge("HandleError", "Recover")?
        .ends("Recover")?
        .ends("Process")?
        .build()
}

async fn validate_start(_input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(150).await;
    Ok(Transition::goto("Validate", Value::Null))
}

async fn validate(_input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(250).await;
    if ctx.deps().fail_validation {
        return Ok(Transition::goto(
            "HandleError",
            json!({ "reason": "Validation failed" }),
        ));
    }
    Ok(Transition::goto("Process", Value::Null))
}

async fn handle_error(input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(200).await;
    Ok(Transition::goto(
        "Recover",
        json!({ "message": format!("Recovered after error: {}", text(&input, "reason")) }),
    ))
}

async fn process(_input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(200).await;
    Ok(Transition::end(Value::from("Processed successfully")))
}

// failure: a step that raises

fn failure() -> Result<FlowGraph<DemoDeps>, FlowError> {
    FlowGraph::new("Start")
        .step("Start", "Start", failure_start)?
        .step("Explode", "Explode", explode)?
        .edge("Start", "Explode")?
        .build()
}

async fn failure_start(_input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(100).await;
    Ok(Transition::goto("Explode", Value::Null))
}

async fn explode(_input: Value, ctx: Ctx) -> StepResult {
    ctx.deps().pause(100).await;
    anyhow::bail!("boom")
}
