//! Session registry: session entities and the current session.

use std::collections::HashMap;

use chamber_protocol::Session;

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
    current: Option<String>,
    revision: u64,
}

impl SessionRegistry {
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub fn sessions(&self) -> &HashMap<String, Session> {
        &self.sessions
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Returns `true` when the current session actually changed.
    pub fn set_current(&mut self, session_id: Option<&str>) -> bool {
        if self.current.as_deref() == session_id {
            return false;
        }
        self.current = session_id.map(str::to_string);
        self.revision += 1;
        true
    }

    /// Insert or replace. Returns `false` when nothing changed.
    pub fn upsert(&mut self, session: Session) -> bool {
        if self.sessions.get(&session.id) == Some(&session) {
            return false;
        }
        self.sessions.insert(session.id.clone(), session);
        self.revision += 1;
        true
    }

    pub fn rename(&mut self, session_id: &str, title: &str, now: u64) -> Option<&Session> {
        let session = self.sessions.get_mut(session_id)?;
        if session.title != title {
            session.title = title.to_string();
            session.updated_at = now;
            self.revision += 1;
        }
        Some(session)
    }

    /// Remove a session, clearing the current selection if it pointed there.
    pub fn remove(&mut self, session_id: &str) -> Option<Session> {
        let removed = self.sessions.remove(session_id);
        let was_current = self.current.as_deref() == Some(session_id);
        if was_current {
            self.current = None;
        }
        if removed.is_some() || was_current {
            self.revision += 1;
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, title: &str) -> Session {
        Session {
            id: id.to_string(),
            directory: "/work".to_string(),
            title: title.to_string(),
            created_by_client: true,
            created_at: 1,
            updated_at: 1,
        }
    }

    #[test]
    fn identical_upsert_keeps_revision() {
        let mut registry = SessionRegistry::default();
        assert!(registry.upsert(session("s1", "first")));
        let revision = registry.revision();
        assert!(!registry.upsert(session("s1", "first")));
        assert_eq!(registry.revision(), revision);
        assert!(registry.upsert(session("s1", "renamed")));
    }

    #[test]
    fn rename_touches_updated_at() {
        let mut registry = SessionRegistry::default();
        registry.upsert(session("s1", "first"));
        let renamed = registry.rename("s1", "second", 50).unwrap();
        assert_eq!(renamed.title, "second");
        assert_eq!(renamed.updated_at, 50);
        assert!(registry.rename("missing", "x", 1).is_none());
    }

    #[test]
    fn removing_current_session_clears_selection() {
        let mut registry = SessionRegistry::default();
        registry.upsert(session("s1", "first"));
        registry.set_current(Some("s1"));
        assert!(registry.remove("s1").is_some());
        assert_eq!(registry.current(), None);
    }

    #[test]
    fn set_current_reports_changes_only() {
        let mut registry = SessionRegistry::default();
        assert!(registry.set_current(Some("s1")));
        assert!(!registry.set_current(Some("s1")));
        assert!(registry.set_current(None));
    }
}
