use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{Agent, AgentBuilder, AgentInfo};
use crate::config::AgentOptions;
use crate::transport::CallEndpoint;
use crate::{Error, Result};

/// Administrative change to a running agent.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct AgentUpdate {
    #[serde(default)]
    pub prompt: Option<String>,
    /// Merged into the agent's current options.
    #[serde(default)]
    pub options: Option<AgentOptions>,
}

/// The agents a process is running, keyed by agent id.
#[derive(Clone, Default)]
pub struct AgentDirectory {
    agents: Arc<Mutex<HashMap<String, Agent>>>,
}

impl AgentDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an agent answering calls on `endpoint` and register it.
    ///
    /// # Errors
    /// Returns an error if the agent configuration is rejected.
    pub async fn create(&self, builder: AgentBuilder, endpoint: impl CallEndpoint + 'static) -> Result<AgentInfo> {
        let agent = builder.create(endpoint)?;
        Ok(self.insert(agent).await)
    }

    /// Build an agent on a fresh WebSocket endpoint bound to `addr` and register it.
    ///
    /// # Errors
    /// Returns an error if the agent configuration is rejected or binding fails.
    pub async fn listen(&self, builder: AgentBuilder, addr: &str) -> Result<AgentInfo> {
        let agent = builder.listen(addr).await?;
        Ok(self.insert(agent).await)
    }

    async fn insert(&self, agent: Agent) -> AgentInfo {
        let info = agent.info();
        self.agents.lock().await.insert(info.id.clone(), agent);
        info
    }

    pub async fn list(&self) -> Vec<AgentInfo> {
        let mut infos: Vec<_> = self.agents.lock().await.values().map(Agent::info).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// # Errors
    /// Returns `NotFound` if no agent has this id.
    pub async fn get(&self, id: &str) -> Result<Agent> {
        self.agents
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("agent {id}")))
    }

    /// # Errors
    /// Returns `NotFound` if no agent has this id.
    pub async fn update(&self, id: &str, update: AgentUpdate) -> Result<AgentInfo> {
        let agent = self.get(id).await?;
        if let Some(prompt) = update.prompt {
            agent.set_prompt(prompt).await;
        }
        if let Some(options) = update.options {
            agent.set_options(&options).await;
        }
        Ok(agent.info())
    }

    /// Remove the agent and hang up its calls.
    ///
    /// # Errors
    /// Returns `NotFound` if no agent has this id.
    pub async fn destroy(&self, id: &str) -> Result<()> {
        let agent = self
            .agents
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("agent {id}")))?;
        agent.destroy().await;
        Ok(())
    }

    /// Destroy every agent, e.g. at shutdown.
    pub async fn clean(&self) {
        let agents: Vec<_> = self.agents.lock().await.drain().map(|(_, agent)| agent).collect();
        tracing::info!(count = agents.len(), "destroying all agents");
        futures::future::join_all(agents.iter().map(Agent::destroy)).await;
    }
}

impl std::fmt::Debug for AgentDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentDirectory").finish_non_exhaustive()
    }
}
