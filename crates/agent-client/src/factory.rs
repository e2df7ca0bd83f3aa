//! Factories for the agents a client brings up on demand

use agent_comms::Broker;
use agent_core::AgentSettings;
use agent_runtime::Agent;
use dashmap::DashMap;
use std::sync::Arc;

use crate::{ClientError, Result};

/// Builds one configured agent (handlers registered, not started)
pub type SpawnFn = Arc<dyn Fn(Arc<Broker>, &AgentSettings) -> Result<Agent> + Send + Sync>;

/// Named agent factories, spawned in name order
#[derive(Clone, Default)]
pub struct AgentFactory {
    factories: Arc<DashMap<String, SpawnFn>>,
}

impl AgentFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a factory; a second one under the same name replaces the first
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(Arc<Broker>, &AgentSettings) -> Result<Agent> + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::debug!(name = %name, "Registered agent factory");
        self.factories.insert(name, Arc::new(factory));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Build every agent; nothing is started
    pub fn build_all(&self, broker: &Arc<Broker>, settings: &AgentSettings) -> Result<Vec<Agent>> {
        self.names()
            .into_iter()
            .map(|name| {
                let factory = self
                    .factories
                    .get(&name)
                    .map(|entry| Arc::clone(entry.value()))
                    .ok_or_else(|| ClientError::spawn_failed(format!("factory '{}' removed", name)))?;
                factory(Arc::clone(broker), settings)
                    .map_err(|e| ClientError::spawn_failed(format!("{}: {}", name, e)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_all_in_name_order() {
        let factory = AgentFactory::new();
        factory.register("scorer", |broker, settings| {
            Ok(Agent::new("scorer-1", "scorer", broker, settings.clone()))
        });
        factory.register("parser", |broker, settings| {
            Ok(Agent::new("parser-1", "parser", broker, settings.clone()))
        });

        let broker = Arc::new(Broker::in_process());
        let agents = factory.build_all(&broker, &AgentSettings::default()).unwrap();
        let ids: Vec<_> = agents.iter().map(|a| a.id().to_string()).collect();
        assert_eq!(ids, vec!["parser-1", "scorer-1"]);
    }

    #[test]
    fn test_factory_failure_names_the_factory() {
        let factory = AgentFactory::new();
        factory.register("broken", |_, _| Err(ClientError::spawn_failed("no model")));

        let broker = Arc::new(Broker::in_process());
        let err = factory
            .build_all(&broker, &AgentSettings::default())
            .unwrap_err();
        assert!(err.to_string().contains("broken"));
    }
}
