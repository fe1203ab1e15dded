use super::agent::{AgentHandle, AgentId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::info;

/// Agents that completed their startup handshake, keyed by id.
#[derive(Default)]
pub struct AgentRegistry {
    agents: Mutex<HashMap<AgentId, Arc<AgentHandle>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn agents(&self) -> MutexGuard<'_, HashMap<AgentId, Arc<AgentHandle>>> {
        self.agents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, agent: Arc<AgentHandle>) {
        self.agents().insert(agent.id(), agent);
    }

    pub fn remove(&self, id: AgentId) -> Option<Arc<AgentHandle>> {
        self.agents().remove(&id)
    }

    pub fn get(&self, id: AgentId) -> Option<Arc<AgentHandle>> {
        self.agents().get(&id).cloned()
    }

    pub fn contains(&self, id: AgentId) -> bool {
        self.agents().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.agents().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents().is_empty()
    }

    /// Terminates every registered agent and waits for their threads.
    /// The lock is released before joining.
    pub fn teardown(&self) {
        let agents: Vec<Arc<AgentHandle>> = self.agents().drain().map(|(_, a)| a).collect();
        if agents.is_empty() {
            return;
        }
        info!(count = agents.len(), "useragent: tearing down agents");
        for agent in agents {
            agent.terminate();
        }
    }
}
