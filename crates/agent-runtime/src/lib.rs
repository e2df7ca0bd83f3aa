//! Agent Runtime
//!
//! An [`Agent`] wraps business handlers and talks to other agents only
//! through a shared [`Broker`](agent_comms::Broker). One receive loop per
//! agent resolves responses to pending requests and hands everything else
//! to the handler registered for the message's action.
//!
//! # Example
//!
//! ```no_run
//! use agent_comms::{payload, Broker, Payload};
//! use agent_core::AgentSettings;
//! use agent_runtime::Agent;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = Arc::new(Broker::in_process());
//!
//!     let scorer = Agent::new("scorer", "scorer", Arc::clone(&broker), AgentSettings::default());
//!     scorer.register_handler("ping", |agent, message| async move {
//!         agent.send_response(&message, payload(json!({"pong": true}))).await
//!     });
//!     scorer.start().await?;
//!
//!     let caller = Agent::new("api", "gateway", broker, AgentSettings::default());
//!     caller.start().await?;
//!
//!     let reply = caller.request("scorer", "ping", Payload::new()).await?;
//!     assert_eq!(reply.payload["pong"], true);
//!
//!     caller.stop().await?;
//!     scorer.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod error;
pub mod handler;
pub mod role;
pub mod stats;

mod pending;

// Re-exports
pub use agent::{Agent, AgentBuilder, AgentState};
pub use error::{Result, RuntimeError};
pub use handler::MessageHandler;
pub use role::{Dispatch, RoleActions, RoleHandler};
pub use stats::{AgentStats, StatsSnapshot};
