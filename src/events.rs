//! Agent events, the error taxonomy, and the `EventStream` handed to callers.
//!
//! The loop is a single producer pushing typed events into an unbounded
//! channel; `EventStream` is the consumer half, paired with a oneshot that
//! resolves to the run's newly appended messages once the loop terminates.
//! Dropping the stream early never cancels the run.

use crate::types::*;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

// ---------------------------------------------------------------------------
// Event union
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum AgentEvent {
    AgentStart,
    AgentEnd {
        messages: Vec<AgentMessage>,
    },
    TurnStart,
    TurnEnd {
        message: AgentMessage,
        tool_results: Vec<Message>,
    },
    MessageStart {
        message: AgentMessage,
    },
    MessageUpdate {
        message: AgentMessage,
        delta: StreamDelta,
    },
    MessageEnd {
        message: AgentMessage,
    },
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
        args: serde_json::Value,
    },
    ToolExecutionUpdate {
        tool_call_id: String,
        tool_name: String,
        partial_result: ToolResult,
    },
    ToolExecutionEnd {
        tool_call_id: String,
        tool_name: String,
        result: ToolResult,
        is_error: bool,
    },
    /// Fatal error. Always the last event, after `AgentEnd`; the same error
    /// rejects `EventStream::result`.
    Error {
        error: AgentError,
    },
}

#[derive(Debug, Clone)]
pub enum StreamDelta {
    Text { delta: String },
    Thinking { delta: String },
    ToolCallDelta { delta: String },
}

// ---------------------------------------------------------------------------
// Fatal errors
// ---------------------------------------------------------------------------

/// Errors that end a run. Per-call failures (bad arguments, a tool that
/// threw, steering skips, abort synthesis) are never fatal — they surface as
/// `is_error` tool-result messages and the loop keeps going.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    #[error("{0}")]
    IllegalState(String),
    #[error("stream error: {0}")]
    Stream(String),
}

// ---------------------------------------------------------------------------
// Event stream
// ---------------------------------------------------------------------------

/// Consumer handle returned by `agent_loop` / `agent_loop_continue`.
pub struct EventStream {
    events: mpsc::UnboundedReceiver<AgentEvent>,
    result: oneshot::Receiver<Result<Vec<AgentMessage>, AgentError>>,
}

impl EventStream {
    pub(crate) fn channel() -> (EventSink, ResultSender, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();
        (
            EventSink { tx },
            result_tx,
            EventStream {
                events: rx,
                result: result_rx,
            },
        )
    }

    /// Next event, or `None` once the loop has finished and every event has
    /// been drained.
    pub async fn next(&mut self) -> Option<AgentEvent> {
        self.events.recv().await
    }

    /// Wait for the run to terminate. `Ok` carries only the messages
    /// appended during this run, in append order. Undrained events are
    /// discarded.
    pub async fn result(self) -> Result<Vec<AgentMessage>, AgentError> {
        self.result.await.unwrap_or_else(|_| {
            Err(AgentError::IllegalState(
                "agent loop ended without a result".into(),
            ))
        })
    }

    /// Adapter for `futures::StreamExt` consumers. Discards the result
    /// future; use `next()` + `result()` when you need both.
    pub fn into_stream(self) -> UnboundedReceiverStream<AgentEvent> {
        UnboundedReceiverStream::new(self.events)
    }
}

pub(crate) type ResultSender = oneshot::Sender<Result<Vec<AgentMessage>, AgentError>>;

/// Producer half. Pushes never block and never fail the loop; a consumer
/// that stopped listening just stops receiving.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl EventSink {
    pub(crate) fn push(&self, event: AgentEvent) {
        self.tx.send(event).ok();
    }
}

// ---------------------------------------------------------------------------
// Tool progress sink
// ---------------------------------------------------------------------------

/// Handed to `AgentTool::execute`; forwards progress snapshots to event
/// consumers as `ToolExecutionUpdate`.
#[derive(Clone)]
pub struct ToolUpdateSink {
    tool_call_id: String,
    tool_name: String,
    sink: EventSink,
}

impl ToolUpdateSink {
    pub(crate) fn new(tool_call_id: String, tool_name: String, sink: EventSink) -> Self {
        Self {
            tool_call_id,
            tool_name,
            sink,
        }
    }

    pub fn send(&self, partial_result: ToolResult) {
        self.sink.push(AgentEvent::ToolExecutionUpdate {
            tool_call_id: self.tool_call_id.clone(),
            tool_name: self.tool_name.clone(),
            partial_result,
        });
    }
}
