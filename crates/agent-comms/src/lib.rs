//! Agent Communication Layer
//!
//! The messaging substrate independent agents cooperate through: a message
//! envelope, a broker that relays it over pub/sub channels, a directory of
//! live agents, and TTL-bound workflow contexts shared across processes.
//!
//! # Example
//!
//! ```no_run
//! use agent_comms::{payload, Broker, Message};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = Broker::in_process();
//!
//!     let message = Message::request("matcher", "scorer", "score", payload(json!({"cv_id": 7})));
//!     broker.publish(&message).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod message;
pub mod channel;
pub mod transport;
pub mod store;
pub mod registry;
pub mod context;
pub mod broker;

// In-process backend
pub mod in_process;

// Re-exports
pub use error::{CommsError, Result};
pub use message::{
    failure_payload, failure_reason, payload, success_payload, Message, MessageKind, Payload,
};
pub use channel::ChannelNames;
pub use transport::{Frame, Inbox, MessageTransport};
pub use store::KeyValueStore;
pub use registry::{AgentDirectory, AgentRegistration};
pub use context::{ContextStatus, ContextStore, WorkflowContext};
pub use broker::{Broker, BrokerHealth, BrokerStats};

pub use in_process::InProcessBackend;
