//! Permission gate.
//!
//! Resolves the effective edit mode of an agent inside a session and decides
//! whether an incoming permission request is answered automatically or
//! queued for the user. Agent definitions are read through an injected
//! lookup so this module never depends on the agent source directly.

use std::collections::HashMap;
use std::sync::Arc;

use chamber_protocol::{AgentDefinition, EditPermissionMode, PermissionRequest};
use tracing::debug;

use crate::error::StoreError;

/// Agent name -> definition
pub type AgentLookup = Arc<dyn Fn(&str) -> Option<AgentDefinition> + Send + Sync>;

/// Permission types covered by the `allow` edit mode
pub const EDIT_PERMISSION_TYPES: &[&str] = &[
    "edit",
    "multiedit",
    "write",
    "str_replace",
    "str_replace_based_edit_tool",
];

pub fn is_edit_permission(permission_type: &str) -> bool {
    EDIT_PERMISSION_TYPES
        .iter()
        .any(|t| t.eq_ignore_ascii_case(permission_type))
}

/// Outcome of routing a request through the gate
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// Answer "once" without showing the request
    AutoApprove(PermissionRequest),
    /// Queued for the user
    Pending(PermissionRequest),
    /// Already queued under the same id
    Duplicate,
}

pub struct PermissionGate {
    agent_lookup: AgentLookup,
    /// (session, agent) -> override; absent when equal to the agent default
    overrides: HashMap<(String, String), EditPermissionMode>,
    /// session -> requests in arrival order
    pending: HashMap<String, Vec<PermissionRequest>>,
    revision: u64,
}

impl PermissionGate {
    pub fn new(agent_lookup: AgentLookup) -> Self {
        Self {
            agent_lookup,
            overrides: HashMap::new(),
            pending: HashMap::new(),
            revision: 0,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Declared default of an agent. Unknown agents ask.
    pub fn agent_default_mode(&self, agent: &str) -> EditPermissionMode {
        match (self.agent_lookup)(agent) {
            Some(definition) => default_mode_for(&definition),
            None => EditPermissionMode::Ask,
        }
    }

    pub fn effective_edit_mode(&self, session_id: &str, agent: &str) -> EditPermissionMode {
        let default = self.agent_default_mode(agent);
        if default == EditPermissionMode::Deny {
            return default;
        }
        self.overrides
            .get(&(session_id.to_string(), agent.to_string()))
            .copied()
            .unwrap_or(default)
    }

    /// Store a mode for (session, agent). A mode equal to the agent default
    /// removes the override instead.
    ///
    /// `deny` only ever comes from the agent declaration: an agent declared
    /// `deny` cannot be unlocked, and `deny` cannot be chosen for any other
    /// agent. Refused requests return the effective mode unchanged.
    pub fn set_edit_mode(
        &mut self,
        session_id: &str,
        agent: &str,
        mode: EditPermissionMode,
    ) -> EditPermissionMode {
        let default = self.agent_default_mode(agent);
        if default == EditPermissionMode::Deny || mode == EditPermissionMode::Deny {
            if mode != default {
                debug!(
                    component = "permission",
                    event = "permission.edit_mode_refused",
                    session_id = %session_id,
                    agent = %agent,
                    requested = ?mode,
                    "Edit mode change refused"
                );
            }
            return self.effective_edit_mode(session_id, agent);
        }

        let key = (session_id.to_string(), agent.to_string());
        let changed = if mode == default {
            self.overrides.remove(&key).is_some()
        } else {
            self.overrides.insert(key, mode) != Some(mode)
        };
        if changed {
            self.revision += 1;
        }
        mode
    }

    /// Advance ask -> allow -> full -> ask. A session sitting at `deny` stays
    /// there.
    pub fn toggle_edit_mode(&mut self, session_id: &str, agent: &str) -> EditPermissionMode {
        let current = self.effective_edit_mode(session_id, agent);
        match current.escalated() {
            Some(next) => self.set_edit_mode(session_id, agent, next),
            None => current,
        }
    }

    pub fn decide(&self, request: &PermissionRequest, agent: &str) -> bool {
        match self.effective_edit_mode(&request.session_id, agent) {
            EditPermissionMode::Full => true,
            EditPermissionMode::Allow => is_edit_permission(&request.permission_type),
            EditPermissionMode::Ask | EditPermissionMode::Deny => false,
        }
    }

    /// Route a request: auto-approved requests never enter the pending list.
    pub fn add_permission(&mut self, request: PermissionRequest, agent: &str) -> GateDecision {
        if self.decide(&request, agent) {
            return GateDecision::AutoApprove(request);
        }

        let queue = self.pending.entry(request.session_id.clone()).or_default();
        if queue.iter().any(|p| p.id == request.id) {
            return GateDecision::Duplicate;
        }
        queue.push(request.clone());
        self.revision += 1;
        GateDecision::Pending(request)
    }

    /// Remove a pending request so it can be answered.
    pub fn take_pending(
        &mut self,
        session_id: &str,
        permission_id: &str,
    ) -> Result<PermissionRequest, StoreError> {
        let conflict = || StoreError::PermissionConflict {
            session_id: session_id.to_string(),
            permission_id: permission_id.to_string(),
        };
        let queue = self.pending.get_mut(session_id).ok_or_else(conflict)?;
        let index = queue
            .iter()
            .position(|p| p.id == permission_id)
            .ok_or_else(conflict)?;
        let request = queue.remove(index);
        if queue.is_empty() {
            self.pending.remove(session_id);
        }
        self.revision += 1;
        Ok(request)
    }

    /// Put a request back after its answer could not be delivered,
    /// keeping creation order.
    pub fn restore_pending(&mut self, request: PermissionRequest) {
        let queue = self.pending.entry(request.session_id.clone()).or_default();
        if queue.iter().any(|p| p.id == request.id) {
            return;
        }
        let at = queue
            .iter()
            .position(|p| p.created_at > request.created_at)
            .unwrap_or(queue.len());
        queue.insert(at, request);
        self.revision += 1;
    }

    pub fn pending_for(&self, session_id: &str) -> &[PermissionRequest] {
        self.pending.get(session_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn pending(&self) -> &HashMap<String, Vec<PermissionRequest>> {
        &self.pending
    }

    pub fn overrides(&self) -> &HashMap<(String, String), EditPermissionMode> {
        &self.overrides
    }

    /// Drop everything held for a deleted session
    pub fn remove_session(&mut self, session_id: &str) {
        let before = self.overrides.len();
        self.overrides.retain(|(session, _), _| session != session_id);
        let removed_pending = self.pending.remove(session_id).is_some();
        if removed_pending || before != self.overrides.len() {
            self.revision += 1;
        }
    }

    /// Restore persisted state. Overrides equal to the current agent default
    /// are dropped to keep storage sparse, and `deny` is never restored as an
    /// override.
    pub fn restore(
        &mut self,
        overrides: Vec<((String, String), EditPermissionMode)>,
        pending: Vec<(String, Vec<PermissionRequest>)>,
    ) {
        for ((session, agent), mode) in overrides {
            let default = self.agent_default_mode(&agent);
            if mode != default
                && mode != EditPermissionMode::Deny
                && default != EditPermissionMode::Deny
            {
                self.overrides.insert((session, agent), mode);
            }
        }
        for (session, requests) in pending {
            if !requests.is_empty() {
                self.pending.insert(session, requests);
            }
        }
        self.revision += 1;
    }
}

/// `permission.edit` when declared, else ask/deny depending on whether the
/// edit tool is enabled.
pub fn default_mode_for(agent: &AgentDefinition) -> EditPermissionMode {
    if let Some(mode) = agent.permission.edit {
        return mode;
    }
    match agent.tools.get("edit") {
        Some(false) => EditPermissionMode::Deny,
        _ => EditPermissionMode::Ask,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chamber_protocol::AgentPermission;

    fn agents() -> AgentLookup {
        Arc::new(|name: &str| {
            let mut definition = AgentDefinition {
                name: name.to_string(),
                ..AgentDefinition::default()
            };
            match name {
                "builder" => definition.permission = AgentPermission {
                    edit: Some(EditPermissionMode::Allow),
                    ..AgentPermission::default()
                },
                "reviewer" => {
                    definition.tools.insert("edit".to_string(), false);
                }
                "locked" => definition.permission.edit = Some(EditPermissionMode::Deny),
                "plain" => {}
                _ => return None,
            }
            Some(definition)
        })
    }

    fn request(id: &str, permission_type: &str, created_at: u64) -> PermissionRequest {
        PermissionRequest {
            id: id.to_string(),
            permission_type: permission_type.to_string(),
            session_id: "s1".to_string(),
            message_id: "m1".to_string(),
            call_id: Some(format!("call-{id}")),
            title: format!("{permission_type} request"),
            metadata: serde_json::Value::Null,
            created_at,
        }
    }

    #[test]
    fn defaults_follow_agent_declaration() {
        let gate = PermissionGate::new(agents());
        assert_eq!(gate.agent_default_mode("builder"), EditPermissionMode::Allow);
        assert_eq!(gate.agent_default_mode("reviewer"), EditPermissionMode::Deny);
        assert_eq!(gate.agent_default_mode("plain"), EditPermissionMode::Ask);
        assert_eq!(gate.agent_default_mode("missing"), EditPermissionMode::Ask);
    }

    #[test]
    fn allow_default_auto_approves_edits_only() {
        let mut gate = PermissionGate::new(agents());

        let decision = gate.add_permission(request("p1", "edit", 1), "builder");
        assert!(matches!(decision, GateDecision::AutoApprove(_)));
        assert!(gate.pending_for("s1").is_empty());

        let decision = gate.add_permission(request("p2", "bash", 2), "builder");
        assert!(matches!(decision, GateDecision::Pending(_)));
        assert_eq!(gate.pending_for("s1").len(), 1);
    }

    #[test]
    fn full_mode_auto_approves_everything() {
        let mut gate = PermissionGate::new(agents());
        gate.set_edit_mode("s1", "plain", EditPermissionMode::Full);
        let decision = gate.add_permission(request("p1", "webfetch", 1), "plain");
        assert!(matches!(decision, GateDecision::AutoApprove(_)));
    }

    #[test]
    fn three_toggles_return_to_ask() {
        let mut gate = PermissionGate::new(agents());
        assert_eq!(gate.toggle_edit_mode("s1", "plain"), EditPermissionMode::Allow);
        assert_eq!(gate.toggle_edit_mode("s1", "plain"), EditPermissionMode::Full);
        assert_eq!(gate.toggle_edit_mode("s1", "plain"), EditPermissionMode::Ask);
        // Back at the default: nothing stored.
        assert!(gate.overrides().is_empty());
    }

    #[test]
    fn toggling_deny_is_a_no_op() {
        let mut gate = PermissionGate::new(agents());
        let revision = gate.revision();
        assert_eq!(gate.toggle_edit_mode("s1", "locked"), EditPermissionMode::Deny);
        assert_eq!(gate.toggle_edit_mode("s1", "reviewer"), EditPermissionMode::Deny);
        assert_eq!(gate.revision(), revision);
        assert!(gate.overrides().is_empty());
    }

    #[test]
    fn overrides_are_scoped_per_session() {
        let mut gate = PermissionGate::new(agents());
        gate.set_edit_mode("s1", "plain", EditPermissionMode::Full);
        assert_eq!(gate.effective_edit_mode("s1", "plain"), EditPermissionMode::Full);
        assert_eq!(gate.effective_edit_mode("s2", "plain"), EditPermissionMode::Ask);
    }

    #[test]
    fn setting_default_clears_override() {
        let mut gate = PermissionGate::new(agents());
        gate.set_edit_mode("s1", "builder", EditPermissionMode::Full);
        assert_eq!(gate.overrides().len(), 1);
        gate.set_edit_mode("s1", "builder", EditPermissionMode::Allow);
        assert!(gate.overrides().is_empty());
    }

    #[test]
    fn deny_cannot_be_chosen_for_an_asking_agent() {
        let mut gate = PermissionGate::new(agents());
        let revision = gate.revision();

        assert_eq!(
            gate.set_edit_mode("s1", "plain", EditPermissionMode::Deny),
            EditPermissionMode::Ask
        );
        assert_eq!(gate.effective_edit_mode("s1", "plain"), EditPermissionMode::Ask);
        assert!(gate.overrides().is_empty());
        assert_eq!(gate.revision(), revision);
        assert_eq!(gate.toggle_edit_mode("s1", "plain"), EditPermissionMode::Allow);
    }

    #[test]
    fn deny_agents_stay_locked() {
        let mut gate = PermissionGate::new(agents());

        for agent in ["locked", "reviewer"] {
            assert_eq!(
                gate.set_edit_mode("s1", agent, EditPermissionMode::Full),
                EditPermissionMode::Deny
            );
            assert_eq!(gate.effective_edit_mode("s1", agent), EditPermissionMode::Deny);
        }
        assert!(gate.overrides().is_empty());

        let decision = gate.add_permission(request("p1", "edit", 1), "locked");
        assert!(matches!(decision, GateDecision::Pending(_)));
    }

    #[test]
    fn restore_skips_deny_overrides() {
        let mut gate = PermissionGate::new(agents());
        gate.restore(
            vec![
                (("s1".into(), "plain".into()), EditPermissionMode::Deny),
                (("s1".into(), "locked".into()), EditPermissionMode::Full),
                (("s1".into(), "builder".into()), EditPermissionMode::Full),
            ],
            Vec::new(),
        );
        assert_eq!(gate.overrides().len(), 1);
        assert_eq!(gate.effective_edit_mode("s1", "plain"), EditPermissionMode::Ask);
        assert_eq!(gate.effective_edit_mode("s1", "locked"), EditPermissionMode::Deny);
        assert_eq!(gate.effective_edit_mode("s1", "builder"), EditPermissionMode::Full);
    }

    #[test]
    fn duplicate_requests_are_queued_once() {
        let mut gate = PermissionGate::new(agents());
        gate.add_permission(request("p1", "bash", 1), "plain");
        assert_eq!(
            gate.add_permission(request("p1", "bash", 1), "plain"),
            GateDecision::Duplicate
        );
        assert_eq!(gate.pending_for("s1").len(), 1);
    }

    #[test]
    fn taking_unknown_permission_is_a_conflict() {
        let mut gate = PermissionGate::new(agents());
        gate.add_permission(request("p1", "bash", 1), "plain");
        assert!(gate.take_pending("s1", "p1").is_ok());
        assert!(matches!(
            gate.take_pending("s1", "p1"),
            Err(StoreError::PermissionConflict { .. })
        ));
    }

    #[test]
    fn restored_request_keeps_creation_order() {
        let mut gate = PermissionGate::new(agents());
        gate.add_permission(request("p1", "bash", 1), "plain");
        gate.add_permission(request("p2", "bash", 2), "plain");
        gate.add_permission(request("p3", "bash", 3), "plain");

        let taken = gate.take_pending("s1", "p2").unwrap();
        gate.restore_pending(taken);

        let ids: Vec<_> = gate.pending_for("s1").iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p2", "p3"]);
    }

    #[test]
    fn restore_drops_overrides_matching_defaults() {
        let mut gate = PermissionGate::new(agents());
        gate.restore(
            vec![
                (("s1".into(), "builder".into()), EditPermissionMode::Allow),
                (("s1".into(), "plain".into()), EditPermissionMode::Full),
            ],
            vec![("s1".into(), vec![request("p1", "bash", 1)])],
        );
        assert_eq!(gate.overrides().len(), 1);
        assert_eq!(gate.pending_for("s1").len(), 1);
    }
}
