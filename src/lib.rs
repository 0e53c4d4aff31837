pub mod agent;
pub mod agent_loop;
mod batch;
pub mod events;
pub mod intent;
pub mod provider;
pub mod registry;
pub mod types;

pub use agent::{Agent, QueueMode};
pub use agent_loop::{agent_loop, agent_loop_continue, AgentLoopConfig};
pub use events::{AgentError, AgentEvent, EventStream, StreamDelta, ToolUpdateSink};
pub use registry::ToolRegistry;
pub use types::*;
