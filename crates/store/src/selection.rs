//! Per-session model and agent selections.
//!
//! These are the small identifiers that survive a restart; the persistence
//! layer stores each map as a JSON association list.

use std::collections::HashMap;

use chamber_protocol::ModelSelection;

#[derive(Debug)]
pub struct SelectionState {
    session_models: HashMap<String, ModelSelection>,
    session_agents: HashMap<String, String>,
    agent_models: HashMap<(String, String), ModelSelection>,
    default_agent: String,
    revision: u64,
}

impl SelectionState {
    pub fn new(default_agent: impl Into<String>) -> Self {
        Self {
            session_models: HashMap::new(),
            session_agents: HashMap::new(),
            agent_models: HashMap::new(),
            default_agent: default_agent.into(),
            revision: 0,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Selected agent, falling back to the configured default
    pub fn agent_for_session(&self, session_id: &str) -> &str {
        self.session_agents
            .get(session_id)
            .map(String::as_str)
            .unwrap_or(&self.default_agent)
    }

    /// Model for the session's current agent, then the session-wide pick.
    pub fn model_for_session(&self, session_id: &str) -> Option<&ModelSelection> {
        let agent = self.agent_for_session(session_id);
        self.agent_models
            .get(&(session_id.to_string(), agent.to_string()))
            .or_else(|| self.session_models.get(session_id))
    }

    pub fn set_session_model(&mut self, session_id: &str, model: ModelSelection) -> bool {
        let changed = self.session_models.insert(session_id.to_string(), model.clone()) != Some(model);
        self.bump(changed)
    }

    pub fn set_session_agent(&mut self, session_id: &str, agent: &str) -> bool {
        let changed = self
            .session_agents
            .insert(session_id.to_string(), agent.to_string())
            .as_deref()
            != Some(agent);
        self.bump(changed)
    }

    pub fn set_session_agent_model(
        &mut self,
        session_id: &str,
        agent: &str,
        model: ModelSelection,
    ) -> bool {
        let key = (session_id.to_string(), agent.to_string());
        let changed = self.agent_models.insert(key, model.clone()) != Some(model);
        self.bump(changed)
    }

    pub fn session_models(&self) -> &HashMap<String, ModelSelection> {
        &self.session_models
    }

    pub fn session_agents(&self) -> &HashMap<String, String> {
        &self.session_agents
    }

    pub fn agent_models(&self) -> &HashMap<(String, String), ModelSelection> {
        &self.agent_models
    }

    pub fn remove_session(&mut self, session_id: &str) -> bool {
        let mut changed = self.session_models.remove(session_id).is_some();
        changed |= self.session_agents.remove(session_id).is_some();
        let before = self.agent_models.len();
        self.agent_models.retain(|(session, _), _| session != session_id);
        changed |= before != self.agent_models.len();
        self.bump(changed)
    }

    pub fn restore(
        &mut self,
        session_models: Vec<(String, ModelSelection)>,
        session_agents: Vec<(String, String)>,
        agent_models: Vec<((String, String), ModelSelection)>,
    ) {
        self.session_models.extend(session_models);
        self.session_agents.extend(session_agents);
        self.agent_models.extend(agent_models);
        self.revision += 1;
    }

    fn bump(&mut self, changed: bool) -> bool {
        if changed {
            self.revision += 1;
        }
        changed
    }
}
