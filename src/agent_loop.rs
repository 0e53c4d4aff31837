//! The core agent loop: prompt → LLM stream → tool round → repeat.
//!
//! - `agent_loop()` starts with new prompt messages
//! - `agent_loop_continue()` resumes from existing context
//!
//! Both spawn the loop onto the runtime and immediately return an
//! [`EventStream`]; iterate it for fine-grained progress, then await
//! `result()` for the messages appended during the run. The loop owns the
//! authoritative message list for the duration of the run and is the only
//! task that mutates it.

use crate::batch::{run_tool_batch, synthesize_aborted_results, BatchOutcome, PendingCall};
use crate::events::{AgentError, AgentEvent, EventSink, EventStream, StreamDelta};
use crate::intent::{inject_intent, strip_intent};
use crate::provider::{
    LlmContext, ProviderError, StreamEvent, StreamOptions, StreamProvider, ToolDefinition,
};
use crate::registry::ToolRegistry;
use crate::types::*;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Maps the working message list (plus system prompt and tool definitions)
/// to the LLM-shaped context handed to the provider. Called once per turn.
pub type ConvertToLlmFn =
    Box<dyn Fn(&[AgentMessage], &str, &[ToolDefinition]) -> LlmContext + Send + Sync>;
/// Runs before `convert_to_llm`; may prune or summarize history. Its output
/// feeds the turn only — the authoritative message list is untouched.
pub type TransformContextFn =
    Box<dyn Fn(Vec<AgentMessage>) -> BoxFuture<'static, Vec<AgentMessage>> + Send + Sync>;
/// Supplies queued user/external messages; polled between turns and after
/// each tool execution completes.
pub type GetSteeringFn = Box<dyn Fn() -> BoxFuture<'static, Vec<AgentMessage>> + Send + Sync>;
/// Caller extras attached to each `ToolCallContext`.
pub type GetToolContextFn = Box<dyn Fn(&ToolCallRef) -> serde_json::Value + Send + Sync>;

/// Configuration for the agent loop
pub struct AgentLoopConfig {
    pub provider: Arc<dyn StreamProvider>,
    pub model: String,

    /// Opaque; forwarded to the provider options only.
    pub session_id: Option<String>,
    /// Opaque; forwarded to the provider options only.
    pub thinking_budgets: Option<serde_json::Value>,

    /// Inject a required `_intent` field into every tool schema and lift the
    /// model's answer onto the stored tool calls.
    pub intent_tracing: bool,

    /// Convert AgentMessage[] → LlmContext before each LLM call.
    /// Default: keep only LLM-compatible messages.
    pub convert_to_llm: Option<ConvertToLlmFn>,

    /// Transform context before convert_to_llm (for pruning, compaction).
    pub transform_context: Option<TransformContextFn>,

    /// Get steering messages (user interruptions mid-run).
    pub get_steering_messages: Option<GetSteeringFn>,

    /// Per-call extras merged into each tool's `ToolCallContext`.
    pub get_tool_context: Option<GetToolContextFn>,
}

impl AgentLoopConfig {
    pub fn new(provider: Arc<dyn StreamProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            session_id: None,
            thinking_budgets: None,
            intent_tracing: false,
            convert_to_llm: None,
            transform_context: None,
            get_steering_messages: None,
            get_tool_context: None,
        }
    }
}

/// Default convert_to_llm: keep only user/assistant/toolResult messages.
fn default_convert_to_llm(
    messages: &[AgentMessage],
    system_prompt: &str,
    tools: &[ToolDefinition],
) -> LlmContext {
    LlmContext {
        system_prompt: system_prompt.to_string(),
        messages: messages.iter().filter_map(|m| m.as_llm().cloned()).collect(),
        tools: tools.to_vec(),
    }
}

/// Start an agent loop with new prompt messages.
///
/// `prompts` must be non-empty and user-originated (user or extension
/// roles). The context's messages are taken as the starting history; the
/// returned stream's `result()` yields only the messages appended during
/// this run.
pub fn agent_loop(
    prompts: Vec<AgentMessage>,
    context: AgentContext,
    config: AgentLoopConfig,
    cancel: CancellationToken,
) -> EventStream {
    let (sink, result_tx, stream) = EventStream::channel();
    tokio::spawn(async move {
        let (messages, error) = drive(prompts, context, config, &sink, &cancel).await;
        result_tx
            .send(match error {
                None => Ok(messages),
                Some(e) => Err(e),
            })
            .ok();
    });
    stream
}

/// Continue an agent loop from existing context. The last message must be a
/// non-assistant message (user or tool result); no events are emitted for
/// the pre-existing history.
pub fn agent_loop_continue(
    context: AgentContext,
    config: AgentLoopConfig,
    cancel: CancellationToken,
) -> EventStream {
    let (sink, result_tx, stream) = EventStream::channel();

    // Precondition failures still produce a fully-bracketed stream:
    // AgentStart, AgentEnd, then the terminal Error.
    let precondition = if context.messages.is_empty() {
        Some(AgentError::IllegalState(
            "Cannot continue: no messages in context".into(),
        ))
    } else if matches!(context.messages.last(), Some(m) if m.role() == "assistant") {
        Some(AgentError::IllegalState(
            "Cannot continue from an assistant message".into(),
        ))
    } else {
        None
    };
    if let Some(error) = precondition {
        sink.push(AgentEvent::AgentStart);
        sink.push(AgentEvent::AgentEnd { messages: vec![] });
        sink.push(AgentEvent::Error {
            error: error.clone(),
        });
        result_tx.send(Err(error)).ok();
        return stream;
    }

    tokio::spawn(async move {
        let (messages, error) = drive(Vec::new(), context, config, &sink, &cancel).await;
        result_tx
            .send(match error {
                None => Ok(messages),
                Some(e) => Err(e),
            })
            .ok();
    });
    stream
}

/// Shared driver. Emits `AgentStart` first and `AgentEnd` last on every
/// path; a fatal error additionally pushes `Error` after `AgentEnd`.
pub(crate) async fn drive(
    prompts: Vec<AgentMessage>,
    mut context: AgentContext,
    config: AgentLoopConfig,
    sink: &EventSink,
    cancel: &CancellationToken,
) -> (Vec<AgentMessage>, Option<AgentError>) {
    sink.push(AgentEvent::AgentStart);

    let mut ts = Timestamps::new();
    let mut new_messages: Vec<AgentMessage> = Vec::new();

    let error = turn_loop(
        prompts,
        &mut context,
        &mut new_messages,
        &config,
        sink,
        cancel,
        &mut ts,
    )
    .await;

    sink.push(AgentEvent::AgentEnd {
        messages: new_messages.clone(),
    });
    if let Some(e) = &error {
        sink.push(AgentEvent::Error { error: e.clone() });
    }

    (new_messages, error)
}

async fn poll_steering(config: &AgentLoopConfig) -> Vec<AgentMessage> {
    match &config.get_steering_messages {
        Some(f) => f().await,
        None => Vec::new(),
    }
}

async fn turn_loop(
    initial: Vec<AgentMessage>,
    context: &mut AgentContext,
    new_messages: &mut Vec<AgentMessage>,
    config: &AgentLoopConfig,
    sink: &EventSink,
    cancel: &CancellationToken,
    ts: &mut Timestamps,
) -> Option<AgentError> {
    // The initial prompts are injected exactly like steering messages:
    // inside the first turn, before the model request.
    let mut pending = initial;

    loop {
        if cancel.is_cancelled() {
            return None;
        }

        sink.push(AgentEvent::TurnStart);

        if pending.is_empty() {
            pending = poll_steering(config).await;
        }
        for msg in pending.drain(..) {
            sink.push(AgentEvent::MessageStart {
                message: msg.clone(),
            });
            sink.push(AgentEvent::MessageEnd {
                message: msg.clone(),
            });
            context.messages.push(msg.clone());
            new_messages.push(msg);
        }

        let TurnOutcome { message, fatal } =
            stream_assistant_turn(context, config, sink, cancel, ts).await;

        let agent_msg: AgentMessage = message.clone().into();
        context.messages.push(agent_msg.clone());
        new_messages.push(agent_msg.clone());

        if let Some(error) = fatal {
            sink.push(AgentEvent::TurnEnd {
                message: agent_msg,
                tool_results: vec![],
            });
            return Some(error);
        }

        let stop_reason = match &message {
            Message::Assistant { stop_reason, .. } => stop_reason.clone(),
            _ => StopReason::Stop,
        };

        match stop_reason {
            StopReason::Stop | StopReason::Length => {
                sink.push(AgentEvent::TurnEnd {
                    message: agent_msg,
                    tool_results: vec![],
                });
                return None;
            }
            StopReason::Error => {
                sink.push(AgentEvent::TurnEnd {
                    message: agent_msg,
                    tool_results: vec![],
                });
                let text = match &message {
                    Message::Assistant {
                        error_message: Some(e),
                        ..
                    } => e.clone(),
                    _ => "model stream reported an error".into(),
                };
                return Some(AgentError::Stream(text));
            }
            StopReason::Aborted => {
                // A cut-off stream can still carry completed tool calls;
                // each one must get a model-visible result.
                let calls = extract_tool_calls(&message);
                let mut tool_results = Vec::new();
                if !calls.is_empty() {
                    tool_results = synthesize_aborted_results(&calls, sink, ts);
                    for r in &tool_results {
                        let am: AgentMessage = r.clone().into();
                        context.messages.push(am.clone());
                        new_messages.push(am);
                    }
                }
                append_steering_explanation(config, context, new_messages, sink).await;
                sink.push(AgentEvent::TurnEnd {
                    message: agent_msg,
                    tool_results,
                });
                return None;
            }
            StopReason::ToolUse => {
                let calls = extract_tool_calls(&message);
                if calls.is_empty() {
                    warn!("Assistant stopped for toolUse without tool calls");
                    sink.push(AgentEvent::TurnEnd {
                        message: agent_msg,
                        tool_results: vec![],
                    });
                    return Some(AgentError::IllegalState(
                        "Assistant stopped for toolUse without tool calls".into(),
                    ));
                }

                let output = run_tool_batch(
                    &context.tools,
                    &calls,
                    sink,
                    cancel,
                    config.get_steering_messages.as_ref(),
                    config.get_tool_context.as_ref(),
                    ts,
                )
                .await;

                for r in &output.tool_results {
                    let am: AgentMessage = r.clone().into();
                    context.messages.push(am.clone());
                    new_messages.push(am);
                }
                sink.push(AgentEvent::TurnEnd {
                    message: agent_msg,
                    tool_results: output.tool_results,
                });

                match output.outcome {
                    BatchOutcome::Completed => {}
                    BatchOutcome::Steered(msgs) => {
                        pending = msgs;
                    }
                    BatchOutcome::Aborted => {
                        append_steering_explanation(config, context, new_messages, sink).await;
                        return None;
                    }
                }
            }
        }
    }
}

/// Post-abort steering poll: lets the caller put an explanation on record
/// before the run terminates.
async fn append_steering_explanation(
    config: &AgentLoopConfig,
    context: &mut AgentContext,
    new_messages: &mut Vec<AgentMessage>,
    sink: &EventSink,
) {
    for msg in poll_steering(config).await {
        sink.push(AgentEvent::MessageStart {
            message: msg.clone(),
        });
        sink.push(AgentEvent::MessageEnd {
            message: msg.clone(),
        });
        context.messages.push(msg.clone());
        new_messages.push(msg);
    }
}

fn extract_tool_calls(message: &Message) -> Vec<PendingCall> {
    match message {
        Message::Assistant { content, .. } => content
            .iter()
            .filter_map(|c| match c {
                Content::ToolCall {
                    id,
                    name,
                    arguments,
                    ..
                } => Some(PendingCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                }),
                _ => None,
            })
            .collect(),
        _ => vec![],
    }
}

/// Lift `_intent` out of every tool call's arguments onto the content part.
fn strip_intents(message: &mut Message) {
    if let Message::Assistant { content, .. } = message {
        for part in content.iter_mut() {
            if let Content::ToolCall {
                arguments, intent, ..
            } = part
            {
                if let Some(s) = strip_intent(arguments) {
                    *intent = Some(s);
                }
            }
        }
    }
}

struct TurnOutcome {
    message: Message,
    fatal: Option<AgentError>,
}

/// One model round-trip: build the LLM context, open the provider stream,
/// drain it into events, and finalize the assistant message.
async fn stream_assistant_turn(
    context: &AgentContext,
    config: &AgentLoopConfig,
    sink: &EventSink,
    cancel: &CancellationToken,
    ts: &mut Timestamps,
) -> TurnOutcome {
    // Turn-local context transform; the authoritative list stays as-is.
    let messages = match &config.transform_context {
        Some(f) => f(context.messages.clone()).await,
        None => context.messages.clone(),
    };

    // Tool schemas are transformed before conversion so the converter (and
    // the model) observe the traced schemas.
    let registry = ToolRegistry::new(&context.tools);
    let mut tool_defs = registry.definitions();
    if config.intent_tracing {
        for def in &mut tool_defs {
            def.parameters = inject_intent(&def.parameters);
        }
    }

    let llm_context = match &config.convert_to_llm {
        Some(f) => f(&messages, &context.system_prompt, &tool_defs),
        None => default_convert_to_llm(&messages, &context.system_prompt, &tool_defs),
    };

    let options = StreamOptions {
        session_id: config.session_id.clone(),
        thinking_budgets: config.thinking_budgets.clone(),
    };

    let (provider_tx, mut provider_rx) = mpsc::unbounded_channel();
    let provider = config.provider.clone();
    let model = config.model.clone();
    let stream_cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        provider
            .stream(&model, llm_context, options, provider_tx, stream_cancel)
            .await
    });

    let mut assembler = PartialAssistant::new(config.model.clone(), ts.next());
    let mut started = false;
    let mut final_message: Option<Message> = None;
    let mut stream_error: Option<String> = None;

    while let Some(event) = provider_rx.recv().await {
        match event {
            StreamEvent::Start => {
                started = true;
                sink.push(AgentEvent::MessageStart {
                    message: assembler.snapshot().into(),
                });
            }
            StreamEvent::TextDelta {
                content_index,
                delta,
            } => {
                assembler.text_delta(content_index, &delta);
                sink.push(AgentEvent::MessageUpdate {
                    message: assembler.snapshot().into(),
                    delta: StreamDelta::Text { delta },
                });
            }
            StreamEvent::ThinkingDelta {
                content_index,
                delta,
            } => {
                assembler.thinking_delta(content_index, &delta);
                sink.push(AgentEvent::MessageUpdate {
                    message: assembler.snapshot().into(),
                    delta: StreamDelta::Thinking { delta },
                });
            }
            StreamEvent::ToolCallStart {
                content_index,
                id,
                name,
            } => {
                assembler.tool_call_start(content_index, id, name);
            }
            StreamEvent::ToolCallDelta {
                content_index,
                delta,
            } => {
                assembler.tool_call_delta(content_index, &delta);
                sink.push(AgentEvent::MessageUpdate {
                    message: assembler.snapshot().into(),
                    delta: StreamDelta::ToolCallDelta { delta },
                });
            }
            StreamEvent::ToolCallEnd { content_index } => {
                assembler.tool_call_end(content_index);
            }
            StreamEvent::Done { message } => {
                final_message = Some(message);
            }
            StreamEvent::Error { error } => {
                stream_error = Some(error);
            }
        }
    }

    let stream_result = match handle.await {
        Ok(r) => r,
        Err(e) => Err(ProviderError::Other(format!("provider task failed: {e}"))),
    };

    let (mut message, fatal) = match (final_message, stream_result) {
        (Some(m), _) | (None, Ok(m)) => (m, None),
        (None, Err(e)) => {
            if cancel.is_cancelled() || matches!(e, ProviderError::Cancelled) {
                (assembler.finish(StopReason::Aborted, None), None)
            } else {
                let text = stream_error.unwrap_or_else(|| e.to_string());
                warn!("Provider error: {}", text);
                (
                    assembler.finish(StopReason::Error, Some(text.clone())),
                    Some(AgentError::Stream(text)),
                )
            }
        }
    };

    if config.intent_tracing {
        strip_intents(&mut message);
    }
    if let Message::Assistant { timestamp, .. } = &mut message {
        *timestamp = ts.next();
    }

    if !started {
        sink.push(AgentEvent::MessageStart {
            message: message.clone().into(),
        });
    }
    sink.push(AgentEvent::MessageEnd {
        message: message.clone().into(),
    });

    TurnOutcome { message, fatal }
}

// ---------------------------------------------------------------------------
// Partial message assembly
// ---------------------------------------------------------------------------

/// Accumulates streamed content so that an aborted or failed stream still
/// produces a well-formed assistant message, including any tool calls whose
/// arguments finished streaming.
struct PartialAssistant {
    model: String,
    timestamp: u64,
    content: BTreeMap<usize, Content>,
    tool_args: BTreeMap<usize, String>,
}

impl PartialAssistant {
    fn new(model: String, timestamp: u64) -> Self {
        Self {
            model,
            timestamp,
            content: BTreeMap::new(),
            tool_args: BTreeMap::new(),
        }
    }

    fn text_delta(&mut self, index: usize, delta: &str) {
        match self.content.entry(index).or_insert_with(|| Content::Text {
            text: String::new(),
        }) {
            Content::Text { text } => text.push_str(delta),
            _ => {}
        }
    }

    fn thinking_delta(&mut self, index: usize, delta: &str) {
        match self
            .content
            .entry(index)
            .or_insert_with(|| Content::Thinking {
                thinking: String::new(),
                signature: None,
            }) {
            Content::Thinking { thinking, .. } => thinking.push_str(delta),
            _ => {}
        }
    }

    fn tool_call_start(&mut self, index: usize, id: String, name: String) {
        self.content.insert(
            index,
            Content::ToolCall {
                id,
                name,
                arguments: serde_json::Value::Null,
                intent: None,
            },
        );
        self.tool_args.insert(index, String::new());
    }

    fn tool_call_delta(&mut self, index: usize, delta: &str) {
        if let Some(buf) = self.tool_args.get_mut(&index) {
            buf.push_str(delta);
        }
    }

    fn tool_call_end(&mut self, index: usize) {
        let Some(buf) = self.tool_args.remove(&index) else {
            return;
        };
        if buf.is_empty() {
            return;
        }
        if let Some(Content::ToolCall { arguments, .. }) = self.content.get_mut(&index) {
            match serde_json::from_str(&buf) {
                Ok(parsed) => *arguments = parsed,
                Err(e) => warn!("Unparsable tool call arguments: {}", e),
            }
        }
    }

    fn snapshot(&self) -> Message {
        Message::Assistant {
            content: self.content.values().cloned().collect(),
            stop_reason: StopReason::Stop,
            model: self.model.clone(),
            provider: "unknown".into(),
            usage: Usage::default(),
            timestamp: self.timestamp,
            error_message: None,
        }
    }

    fn finish(mut self, stop_reason: StopReason, error_message: Option<String>) -> Message {
        // Tool calls whose arguments never finished streaming keep Null args.
        let indexes: Vec<usize> = self.tool_args.keys().copied().collect();
        for index in indexes {
            self.tool_call_end(index);
        }
        Message::Assistant {
            content: self.content.into_values().collect(),
            stop_reason,
            model: self.model,
            provider: "unknown".into(),
            usage: Usage::default(),
            timestamp: self.timestamp,
            error_message,
        }
    }
}
