//! Stateful Agent struct — wraps the agent loop with conversation history,
//! a steering queue, and abort support.

use crate::agent_loop::{drive, AgentLoopConfig};
use crate::events::EventStream;
use crate::provider::StreamProvider;
use crate::types::*;
use futures::FutureExt;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Queue mode for steering messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Deliver one message per poll
    OneAtATime,
    /// Deliver all queued messages at once
    All,
}

/// The main Agent. Owns history, tools, and the provider.
pub struct Agent {
    pub system_prompt: String,
    pub model: String,
    pub intent_tracing: bool,
    pub session_id: Option<String>,
    pub thinking_budgets: Option<serde_json::Value>,
    messages: Vec<AgentMessage>,
    tools: Vec<Arc<dyn AgentTool>>,
    provider: Arc<dyn StreamProvider>,

    // Shared with the loop via the steering callback
    steering_queue: Arc<Mutex<Vec<AgentMessage>>>,
    steering_mode: QueueMode,

    cancel: Option<CancellationToken>,
    is_streaming: bool,
}

impl Agent {
    pub fn new(provider: impl StreamProvider + 'static) -> Self {
        Self {
            system_prompt: String::new(),
            model: String::new(),
            intent_tracing: false,
            session_id: None,
            thinking_budgets: None,
            messages: Vec::new(),
            tools: Vec::new(),
            provider: Arc::new(provider),
            steering_queue: Arc::new(Mutex::new(Vec::new())),
            steering_mode: QueueMode::OneAtATime,
            cancel: None,
            is_streaming: false,
        }
    }

    // -- Builder-style setters --

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_tools(mut self, tools: Vec<Arc<dyn AgentTool>>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_messages(mut self, msgs: Vec<AgentMessage>) -> Self {
        self.messages = msgs;
        self
    }

    pub fn with_intent_tracing(mut self, enabled: bool) -> Self {
        self.intent_tracing = enabled;
        self
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn with_thinking_budgets(mut self, budgets: serde_json::Value) -> Self {
        self.thinking_budgets = Some(budgets);
        self
    }

    // -- State access --

    pub fn messages(&self) -> &[AgentMessage] {
        &self.messages
    }

    pub fn is_streaming(&self) -> bool {
        self.is_streaming
    }

    pub fn set_tools(&mut self, tools: Vec<Arc<dyn AgentTool>>) {
        self.tools = tools;
    }

    pub fn clear_messages(&mut self) {
        self.messages.clear();
    }

    pub fn append_message(&mut self, msg: AgentMessage) {
        self.messages.push(msg);
    }

    pub fn replace_messages(&mut self, msgs: Vec<AgentMessage>) {
        self.messages = msgs;
    }

    pub fn save_messages(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.messages)
    }

    pub fn restore_messages(&mut self, json: &str) -> Result<(), serde_json::Error> {
        let msgs: Vec<AgentMessage> = serde_json::from_str(json)?;
        self.messages = msgs;
        Ok(())
    }

    // -- Queue management --

    /// Queue a steering message (interrupts the agent mid-tool-round)
    pub fn steer(&self, msg: AgentMessage) {
        self.steering_queue.lock().unwrap().push(msg);
    }

    pub fn clear_steering_queue(&self) {
        self.steering_queue.lock().unwrap().clear();
    }

    pub fn set_steering_mode(&mut self, mode: QueueMode) {
        self.steering_mode = mode;
    }

    // -- Control --

    pub fn abort(&self) {
        if let Some(ref cancel) = self.cancel {
            cancel.cancel();
        }
    }

    pub fn reset(&mut self) {
        self.messages.clear();
        self.clear_steering_queue();
        self.is_streaming = false;
        self.cancel = None;
    }

    // -- Prompting --

    /// Send a text prompt. Runs the loop to completion; the returned stream
    /// replays every event and resolves `result()` immediately.
    pub async fn prompt(&mut self, text: impl Into<String>) -> EventStream {
        let msg = AgentMessage::Llm(Message::user(text));
        self.prompt_messages(vec![msg]).await
    }

    /// Send messages as a prompt.
    pub async fn prompt_messages(&mut self, messages: Vec<AgentMessage>) -> EventStream {
        assert!(
            !self.is_streaming,
            "Agent is already streaming. Use steer()."
        );

        let (sink, result_tx, stream) = EventStream::channel();
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());
        self.is_streaming = true;

        let context = AgentContext {
            system_prompt: self.system_prompt.clone(),
            messages: self.messages.clone(),
            tools: self.tools.clone(),
        };

        let (new_messages, error) =
            drive(messages, context, self.build_config(), &sink, &cancel).await;

        self.messages.extend(new_messages.iter().cloned());
        result_tx
            .send(match error {
                None => Ok(new_messages),
                Some(e) => Err(e),
            })
            .ok();

        self.is_streaming = false;
        self.cancel = None;

        stream
    }

    /// Continue from the current history (for resuming after tool results
    /// or injected user messages).
    pub async fn continue_loop(&mut self) -> EventStream {
        assert!(!self.is_streaming, "Agent is already streaming.");
        assert!(!self.messages.is_empty(), "No messages to continue from.");

        let (sink, result_tx, stream) = EventStream::channel();
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());
        self.is_streaming = true;

        let context = AgentContext {
            system_prompt: self.system_prompt.clone(),
            messages: self.messages.clone(),
            tools: self.tools.clone(),
        };

        let (new_messages, error) =
            drive(Vec::new(), context, self.build_config(), &sink, &cancel).await;

        self.messages.extend(new_messages.iter().cloned());
        result_tx
            .send(match error {
                None => Ok(new_messages),
                Some(e) => Err(e),
            })
            .ok();

        self.is_streaming = false;
        self.cancel = None;

        stream
    }

    // -- Internal --

    fn build_config(&self) -> AgentLoopConfig {
        let queue = self.steering_queue.clone();
        let mode = self.steering_mode;

        let mut config = AgentLoopConfig::new(self.provider.clone(), self.model.clone());
        config.session_id = self.session_id.clone();
        config.thinking_budgets = self.thinking_budgets.clone();
        config.intent_tracing = self.intent_tracing;
        config.get_steering_messages = Some(Box::new(move || {
            let queue = queue.clone();
            async move {
                let mut q = queue.lock().unwrap();
                match mode {
                    QueueMode::OneAtATime => {
                        if q.is_empty() {
                            vec![]
                        } else {
                            vec![q.remove(0)]
                        }
                    }
                    QueueMode::All => q.drain(..).collect(),
                }
            }
            .boxed()
        }));
        config
    }
}
