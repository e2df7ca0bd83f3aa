//! Agent Client
//!
//! A facade for callers that are not agents themselves, such as an HTTP
//! layer or a CLI. The client owns the backing agents it starts, sends
//! requests through its own caller agent, and turns replies into typed
//! results or business errors.
//!
//! # Example
//!
//! ```no_run
//! use agent_client::AgentClient;
//! use agent_comms::{payload, success_payload, Broker};
//! use agent_runtime::Agent;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = AgentClient::builder(Arc::new(Broker::in_process()))
//!         .agent("scorer", |broker, settings| {
//!             let agent = Agent::new("scorer", "scorer", broker, settings.clone());
//!             agent.register_handler("score", |agent, message| async move {
//!                 agent.send_response(&message, success_payload(json!(0.8))).await
//!             });
//!             Ok(agent)
//!         })
//!         .build();
//!
//!     let score: f64 = client.call("scorer", "score", payload(json!({"cv_id": 1}))).await?;
//!     println!("score = {score}");
//!
//!     client.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod error;
pub mod factory;

// Re-exports
pub use client::{decode_reply, AgentClient, AgentClientBuilder};
pub use error::{ClientError, Result};
pub use factory::{AgentFactory, SpawnFn};
