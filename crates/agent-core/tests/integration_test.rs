//! Integration tests for configuration and error handling

use agent_core::{
    config::{load_config_or_default, BusConfig},
    error::{AgentError, Result},
};

#[test]
fn test_config_loading_falls_back_to_defaults() {
    let config = load_config_or_default("nonexistent.toml");
    assert_eq!(config.logging.level, "info");
    assert_eq!(config.broker.broadcast_channel, "agent:broadcast");
}

#[test]
fn test_config_serialization_roundtrip() {
    let config = BusConfig::default();

    let json = serde_json::to_string(&config).expect("Failed to serialize");
    let deserialized: BusConfig = serde_json::from_str(&json).expect("Failed to deserialize");

    assert_eq!(config.broker.channel_prefix, deserialized.broker.channel_prefix);
    assert_eq!(
        config.agent.request_timeout_ms,
        deserialized.agent.request_timeout_ms
    );
    assert!(deserialized.validate().is_ok());
}

#[test]
fn test_error_handling() {
    let result: Result<()> = Err(AgentError::config("test error"));

    if let Err(e) = result {
        assert!(e.to_string().contains("test error"));
    } else {
        panic!("expected an error");
    }
}

#[test]
fn test_empty_prefix_is_invalid() {
    let mut config = BusConfig::default();
    config.broker.channel_prefix.clear();
    assert!(matches!(config.validate(), Err(AgentError::Config(_))));
}
