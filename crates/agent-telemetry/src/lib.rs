//! Agent Telemetry
//!
//! Structured events describing traffic through agents: lifecycle, sends,
//! receipts, timeouts, dead letters, and handler failures.
//!
//! # Example
//!
//! ```
//! use agent_telemetry::{TelemetryCollector, TelemetryEvent};
//!
//! let telemetry = TelemetryCollector::new(1000);
//! let mut subscriber = telemetry.subscribe();
//!
//! telemetry.emit(TelemetryEvent::agent_started("scorer", "scorer"));
//! assert!(subscriber.try_recv().is_ok());
//! ```

pub mod event;
pub mod collector;

// Re-exports
pub use event::TelemetryEvent;
pub use collector::TelemetryCollector;
