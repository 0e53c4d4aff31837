//! Tool round scheduler: run every call in a batch concurrently, emit
//! results in declaration order.
//!
//! Completions land in an index-keyed slot buffer; an emit cursor walks the
//! call list head-first and drains consecutive filled slots, so a fast call
//! declared second never jumps ahead of a slow call declared first. The
//! steering queue is polled after each completion and can short-circuit the
//! rest of the batch; the outer abort token cancels everything, with a grace
//! period for tools to wind down before synthetic results are minted.

use crate::agent_loop::{GetSteeringFn, GetToolContextFn};
use crate::events::{AgentEvent, EventSink, ToolUpdateSink};
use crate::registry::ToolRegistry;
use crate::types::*;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

/// How long cancelled tools get to return before their result is synthesized.
const ABORT_GRACE: Duration = Duration::from_secs(1);

pub(crate) const SKIPPED_BODY: &str = "Skipped due to queued user message.";
pub(crate) const ABORTED_BODY: &str = "Tool execution was aborted.";

/// One tool call extracted from an assistant message, arguments already
/// intent-stripped.
#[derive(Debug, Clone)]
pub(crate) struct PendingCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

pub(crate) enum BatchOutcome {
    /// Every call ran (or failed locally); continue the loop.
    Completed,
    /// A queued user message interrupted the batch; inject these before the
    /// next turn.
    Steered(Vec<AgentMessage>),
    /// The outer abort token fired.
    Aborted,
}

pub(crate) struct BatchOutput {
    pub tool_results: Vec<Message>,
    pub outcome: BatchOutcome,
}

enum Slot {
    Pending,
    Done(ToolResult, bool),
    Emitted,
}

pub(crate) async fn run_tool_batch(
    tools: &[Arc<dyn AgentTool>],
    calls: &[PendingCall],
    sink: &EventSink,
    cancel: &CancellationToken,
    get_steering: Option<&GetSteeringFn>,
    get_tool_context: Option<&GetToolContextFn>,
    ts: &mut Timestamps,
) -> BatchOutput {
    let registry = ToolRegistry::new(tools);
    let total = calls.len();
    let batch_id = Uuid::new_v4().to_string();
    let refs: Vec<ToolCallRef> = calls
        .iter()
        .map(|c| ToolCallRef {
            id: c.id.clone(),
            name: c.name.clone(),
        })
        .collect();

    let mut slots: Vec<Slot> = (0..total).map(|_| Slot::Pending).collect();
    let mut children: Vec<Option<CancellationToken>> = (0..total).map(|_| None).collect();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(usize, ToolResult, bool)>();
    let mut running = 0usize;

    for (index, call) in calls.iter().enumerate() {
        sink.push(AgentEvent::ToolExecutionStart {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            args: call.arguments.clone(),
        });

        let Some(tool) = registry.by_name(&call.name) else {
            warn!("Tool {} not found", call.name);
            slots[index] = Slot::Done(ToolResult::text(format!("Tool {} not found", call.name)), true);
            continue;
        };

        if let Some(error) = validate_arguments(&tool.parameters_schema(), &call.arguments) {
            slots[index] = Slot::Done(
                ToolResult::text(format!("Invalid arguments for {}: {}", call.name, error)),
                true,
            );
            continue;
        }

        let child = cancel.child_token();
        children[index] = Some(child.clone());

        let extra = get_tool_context
            .map(|f| f(&refs[index]))
            .unwrap_or(serde_json::Value::Null);
        let ctx = ToolCallContext {
            batch_id: batch_id.clone(),
            index,
            total,
            tool_calls: refs.clone(),
            extra,
        };
        let updates = ToolUpdateSink::new(call.id.clone(), call.name.clone(), sink.clone());

        let tool = tool.clone();
        let id = call.id.clone();
        let name = call.name.clone();
        let args = call.arguments.clone();
        let done = done_tx.clone();
        running += 1;
        tokio::spawn(async move {
            let outcome =
                AssertUnwindSafe(tool.execute(&id, args, child, updates, ctx)).catch_unwind().await;
            let (result, is_error) = match outcome {
                Ok(Ok(result)) => (result, false),
                Ok(Err(ToolError::Cancelled)) => (ToolResult::text(ABORTED_BODY), true),
                Ok(Err(e)) => (ToolResult::text(e.to_string()), true),
                Err(_) => {
                    warn!("Tool {} panicked", name);
                    (ToolResult::text(format!("Tool {} panicked", name)), true)
                }
            };
            done.send((index, result, is_error)).ok();
        });
    }
    drop(done_tx);

    let mut results: Vec<Message> = Vec::with_capacity(total);
    let mut next_emit = 0usize;
    emit_ready(&mut slots, &mut next_emit, calls, sink, ts, &mut results);

    let mut outcome = BatchOutcome::Completed;

    while running > 0 {
        tokio::select! {
            done = done_rx.recv() => {
                let Some((index, result, is_error)) = done else { break };
                running -= 1;
                if matches!(slots[index], Slot::Pending) {
                    slots[index] = Slot::Done(result, is_error);
                }
                emit_ready(&mut slots, &mut next_emit, calls, sink, ts, &mut results);

                if let Some(steering) = get_steering {
                    let queued = steering().await;
                    if !queued.is_empty() {
                        for child in children.iter().flatten() {
                            child.cancel();
                        }
                        fill_missing(&mut slots, SKIPPED_BODY);
                        emit_ready(&mut slots, &mut next_emit, calls, sink, ts, &mut results);
                        outcome = BatchOutcome::Steered(queued);
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => {
                for child in children.iter().flatten() {
                    child.cancel();
                }
                // Collect stragglers for the grace period, then synthesize.
                let deadline = Instant::now() + ABORT_GRACE;
                while running > 0 {
                    match timeout_at(deadline, done_rx.recv()).await {
                        Ok(Some((index, result, is_error))) => {
                            running -= 1;
                            if matches!(slots[index], Slot::Pending) {
                                slots[index] = Slot::Done(result, is_error);
                            }
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
                fill_missing(&mut slots, ABORTED_BODY);
                emit_ready(&mut slots, &mut next_emit, calls, sink, ts, &mut results);
                outcome = BatchOutcome::Aborted;
                break;
            }
        }
    }

    BatchOutput {
        tool_results: results,
        outcome,
    }
}

/// Synthesize aborted results for tool calls that never reached the
/// scheduler (the assistant stream itself was cut off mid-toolUse).
pub(crate) fn synthesize_aborted_results(
    calls: &[PendingCall],
    sink: &EventSink,
    ts: &mut Timestamps,
) -> Vec<Message> {
    let mut results = Vec::with_capacity(calls.len());
    for call in calls {
        sink.push(AgentEvent::ToolExecutionStart {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            args: call.arguments.clone(),
        });
        results.push(emit_result(
            call,
            ToolResult::text(ABORTED_BODY),
            true,
            sink,
            ts,
        ));
    }
    results
}

fn fill_missing(slots: &mut [Slot], body: &str) {
    for slot in slots.iter_mut() {
        if matches!(slot, Slot::Pending) {
            *slot = Slot::Done(ToolResult::text(body), true);
        }
    }
}

/// Walk the batch head-first and emit every consecutive completed slot.
fn emit_ready(
    slots: &mut [Slot],
    next_emit: &mut usize,
    calls: &[PendingCall],
    sink: &EventSink,
    ts: &mut Timestamps,
    results: &mut Vec<Message>,
) {
    while *next_emit < slots.len() {
        let slot = std::mem::replace(&mut slots[*next_emit], Slot::Emitted);
        let (result, is_error) = match slot {
            Slot::Done(result, is_error) => (result, is_error),
            other => {
                slots[*next_emit] = other;
                break;
            }
        };
        results.push(emit_result(&calls[*next_emit], result, is_error, sink, ts));
        *next_emit += 1;
    }
}

fn emit_result(
    call: &PendingCall,
    result: ToolResult,
    is_error: bool,
    sink: &EventSink,
    ts: &mut Timestamps,
) -> Message {
    sink.push(AgentEvent::ToolExecutionEnd {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        result: result.clone(),
        is_error,
    });

    let message = Message::ToolResult {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        content: result.content,
        is_error,
        details: result.details,
        timestamp: ts.next(),
    };

    sink.push(AgentEvent::MessageStart {
        message: message.clone().into(),
    });
    sink.push(AgentEvent::MessageEnd {
        message: message.clone().into(),
    });

    message
}

fn validate_arguments(schema: &serde_json::Value, args: &serde_json::Value) -> Option<String> {
    match jsonschema::validator_for(schema) {
        Ok(validator) => {
            let errors: Vec<String> = validator.iter_errors(args).map(|e| e.to_string()).collect();
            if errors.is_empty() {
                None
            } else {
                Some(errors.join("; "))
            }
        }
        Err(e) => {
            warn!("Unusable parameter schema, skipping validation: {}", e);
            None
        }
    }
}
