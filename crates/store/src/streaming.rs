//! Streaming lifecycle tracker.
//!
//! One record per streamed message, keyed by message id. Only the store's
//! event pipeline writes here, so there are no competing writers for a
//! record. Timer-driven transitions happen in [`StreamingTracker::tick`].
//!
//! ```text
//! (none) --part--> streaming --quiet--> cooldown --quiet--> completed
//!                      ^                    |
//!                      +-------part---------+
//! streaming|cooldown --complete/abort--> completed --settled--> (removed)
//! ```

use std::collections::HashMap;

use chamber_protocol::{ActivityPhase, StreamLifecycle, StreamPhase};

use crate::config::StoreConfig;

/// Observable change produced by a tracker mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerChange {
    Stream {
        session_id: String,
        message_id: String,
        phase: StreamPhase,
    },
    Activity {
        session_id: String,
        phase: ActivityPhase,
    },
}

/// Session status as last reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackendStatus {
    Busy,
    CoolingSince(u64),
}

pub struct StreamingTracker {
    lifecycles: HashMap<String, StreamLifecycle>,
    backend: HashMap<String, BackendStatus>,
    phases: HashMap<String, ActivityPhase>,
    quiescence_ms: u64,
    completion_timeout_ms: u64,
    activity_cooldown_ms: u64,
    revision: u64,
}

impl StreamingTracker {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            lifecycles: HashMap::new(),
            backend: HashMap::new(),
            phases: HashMap::new(),
            quiescence_ms: config.stream_quiescence_ms,
            completion_timeout_ms: config.stream_completion_timeout_ms,
            activity_cooldown_ms: config.activity_cooldown_ms,
            revision: 0,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn lifecycle(&self, message_id: &str) -> Option<&StreamLifecycle> {
        self.lifecycles.get(message_id)
    }

    pub fn lifecycles(&self) -> impl Iterator<Item = &StreamLifecycle> {
        self.lifecycles.values()
    }

    /// A part arrived for `message_id`.
    pub fn record_part(&mut self, session_id: &str, message_id: &str, now: u64) -> Vec<TrackerChange> {
        let mut changes = Vec::new();
        match self.lifecycles.get_mut(message_id) {
            None => {
                self.lifecycles.insert(
                    message_id.to_string(),
                    StreamLifecycle {
                        message_id: message_id.to_string(),
                        session_id: session_id.to_string(),
                        phase: StreamPhase::Streaming,
                        started_at: now,
                        last_update_at: now,
                        completed_at: None,
                    },
                );
                changes.push(stream_change(session_id, message_id, StreamPhase::Streaming));
            }
            Some(record) => match record.phase {
                StreamPhase::Streaming => record.last_update_at = now,
                StreamPhase::Cooldown => {
                    record.phase = StreamPhase::Streaming;
                    record.last_update_at = now;
                    changes.push(stream_change(session_id, message_id, StreamPhase::Streaming));
                }
                // Late tool-state updates after completion don't reopen it.
                StreamPhase::Completed => {}
            },
        }
        self.revision += 1;
        self.project(session_id, &mut changes);
        changes
    }

    /// Explicit completion signal from the backend
    pub fn complete(&mut self, message_id: &str, now: u64) -> Vec<TrackerChange> {
        let mut changes = Vec::new();
        let Some(record) = self.lifecycles.get_mut(message_id) else {
            return changes;
        };
        if record.phase == StreamPhase::Completed {
            return changes;
        }
        record.phase = StreamPhase::Completed;
        record.completed_at = Some(now);
        let session_id = record.session_id.clone();
        changes.push(stream_change(&session_id, message_id, StreamPhase::Completed));
        self.revision += 1;
        self.project(&session_id, &mut changes);
        changes
    }

    /// UI acknowledged the final render. Only completed records are dropped.
    pub fn mark_settled(&mut self, message_id: &str) -> bool {
        let settled = matches!(
            self.lifecycles.get(message_id),
            Some(record) if record.phase == StreamPhase::Completed
        );
        if settled {
            self.lifecycles.remove(message_id);
            self.revision += 1;
        }
        settled
    }

    /// Backend reported the session busy or idle. Going idle from busy
    /// passes through a cooldown before the session reads as idle.
    pub fn set_backend_status(&mut self, session_id: &str, busy: bool, now: u64) -> Vec<TrackerChange> {
        let mut changes = Vec::new();
        let previous = self.backend.get(session_id).copied();
        let next = match (busy, previous) {
            (true, _) => Some(BackendStatus::Busy),
            (false, Some(BackendStatus::Busy)) => Some(BackendStatus::CoolingSince(now)),
            (false, other) => other,
        };
        if next == previous {
            return changes;
        }
        match next {
            Some(status) => self.backend.insert(session_id.to_string(), status),
            None => self.backend.remove(session_id),
        };
        self.revision += 1;
        self.project(session_id, &mut changes);
        changes
    }

    /// Advance timer-driven transitions.
    pub fn tick(&mut self, now: u64) -> Vec<TrackerChange> {
        let mut changes = Vec::new();
        let mut touched = Vec::new();

        for record in self.lifecycles.values_mut() {
            let quiet_for = now.saturating_sub(record.last_update_at);
            let next = match record.phase {
                StreamPhase::Streaming if quiet_for >= self.completion_timeout_ms => {
                    StreamPhase::Completed
                }
                StreamPhase::Streaming if quiet_for >= self.quiescence_ms => StreamPhase::Cooldown,
                StreamPhase::Cooldown if quiet_for >= self.completion_timeout_ms => {
                    StreamPhase::Completed
                }
                _ => continue,
            };
            record.phase = next;
            if next == StreamPhase::Completed {
                record.completed_at = Some(now);
            }
            changes.push(stream_change(&record.session_id, &record.message_id, next));
            touched.push(record.session_id.clone());
        }

        let cooldown = self.activity_cooldown_ms;
        let cooled: Vec<String> = self
            .backend
            .iter()
            .filter_map(|(session, status)| match status {
                BackendStatus::CoolingSince(since) if now.saturating_sub(*since) >= cooldown => {
                    Some(session.clone())
                }
                _ => None,
            })
            .collect();
        for session in cooled {
            self.backend.remove(&session);
            touched.push(session);
        }

        if !touched.is_empty() {
            self.revision += 1;
            touched.sort();
            touched.dedup();
            for session in touched {
                self.project(&session, &mut changes);
            }
        }
        changes
    }

    /// Terminate every live stream of a session (abort or rejection).
    pub fn abort_session(&mut self, session_id: &str, now: u64) -> Vec<TrackerChange> {
        let mut changes = Vec::new();
        for record in self.lifecycles.values_mut() {
            if record.session_id == session_id && record.phase != StreamPhase::Completed {
                record.phase = StreamPhase::Completed;
                record.completed_at = Some(now);
                changes.push(stream_change(session_id, &record.message_id, StreamPhase::Completed));
            }
        }
        let had_backend = self.backend.remove(session_id).is_some();
        if !changes.is_empty() || had_backend {
            self.revision += 1;
            self.project(session_id, &mut changes);
        }
        changes
    }

    /// Reset after a backend reconnect so no session stays stuck as busy.
    pub fn reset_all(&mut self, now: u64) -> Vec<TrackerChange> {
        let mut sessions: Vec<String> = self
            .lifecycles
            .values()
            .filter(|r| r.phase != StreamPhase::Completed)
            .map(|r| r.session_id.clone())
            .chain(self.backend.keys().cloned())
            .collect();
        sessions.sort();
        sessions.dedup();

        let mut changes = Vec::new();
        for session in sessions {
            changes.extend(self.abort_session(&session, now));
        }
        changes
    }

    pub fn session_phase(&self, session_id: &str) -> ActivityPhase {
        let mut phase = match self.backend.get(session_id) {
            Some(BackendStatus::Busy) => return ActivityPhase::Busy,
            Some(BackendStatus::CoolingSince(_)) => ActivityPhase::Cooldown,
            None => ActivityPhase::Idle,
        };
        for record in self.lifecycles.values().filter(|r| r.session_id == session_id) {
            match record.phase {
                StreamPhase::Streaming => return ActivityPhase::Busy,
                StreamPhase::Cooldown => phase = ActivityPhase::Cooldown,
                StreamPhase::Completed => {}
            }
        }
        phase
    }

    /// Sessions whose projected phase is not idle
    pub fn phases(&self) -> &HashMap<String, ActivityPhase> {
        &self.phases
    }

    pub fn is_idle(&self, session_id: &str) -> bool {
        self.session_phase(session_id) == ActivityPhase::Idle
    }

    /// Most recently started message of the session that is still live
    pub fn streaming_message_id(&self, session_id: &str) -> Option<&str> {
        self.lifecycles
            .values()
            .filter(|r| r.session_id == session_id && r.phase != StreamPhase::Completed)
            .max_by(|a, b| {
                a.started_at
                    .cmp(&b.started_at)
                    .then_with(|| a.message_id.cmp(&b.message_id))
            })
            .map(|r| r.message_id.as_str())
    }

    pub fn remove_session(&mut self, session_id: &str) {
        self.lifecycles.retain(|_, r| r.session_id != session_id);
        self.backend.remove(session_id);
        self.phases.remove(session_id);
        self.revision += 1;
    }

    /// Recompute the session's activity phase and report it if it moved.
    fn project(&mut self, session_id: &str, changes: &mut Vec<TrackerChange>) {
        let phase = self.session_phase(session_id);
        let previous = self.phases.get(session_id).copied().unwrap_or_default();
        if phase == previous {
            return;
        }
        if phase == ActivityPhase::Idle {
            self.phases.remove(session_id);
        } else {
            self.phases.insert(session_id.to_string(), phase);
        }
        changes.push(TrackerChange::Activity {
            session_id: session_id.to_string(),
            phase,
        });
    }
}

fn stream_change(session_id: &str, message_id: &str, phase: StreamPhase) -> TrackerChange {
    TrackerChange::Stream {
        session_id: session_id.to_string(),
        message_id: message_id.to_string(),
        phase,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> StreamingTracker {
        StreamingTracker::new(&StoreConfig {
            stream_quiescence_ms: 1_000,
            stream_completion_timeout_ms: 10_000,
            activity_cooldown_ms: 2_000,
            ..StoreConfig::default()
        })
    }

    fn phase_of(tracker: &StreamingTracker, id: &str) -> Option<StreamPhase> {
        tracker.lifecycle(id).map(|r| r.phase)
    }

    #[test]
    fn first_part_starts_streaming() {
        let mut t = tracker();
        let changes = t.record_part("s1", "m1", 0);
        assert_eq!(phase_of(&t, "m1"), Some(StreamPhase::Streaming));
        assert!(changes.contains(&TrackerChange::Activity {
            session_id: "s1".into(),
            phase: ActivityPhase::Busy
        }));
        assert_eq!(t.streaming_message_id("s1"), Some("m1"));
    }

    #[test]
    fn further_parts_refresh_last_update() {
        let mut t = tracker();
        t.record_part("s1", "m1", 0);
        let changes = t.record_part("s1", "m1", 500);
        assert!(changes.is_empty());
        assert_eq!(t.lifecycle("m1").unwrap().last_update_at, 500);
    }

    #[test]
    fn quiet_stream_cools_down_then_resumes() {
        let mut t = tracker();
        t.record_part("s1", "m1", 0);

        t.tick(999);
        assert_eq!(phase_of(&t, "m1"), Some(StreamPhase::Streaming));

        t.tick(1_000);
        assert_eq!(phase_of(&t, "m1"), Some(StreamPhase::Cooldown));
        assert_eq!(t.session_phase("s1"), ActivityPhase::Cooldown);

        t.record_part("s1", "m1", 1_200);
        assert_eq!(phase_of(&t, "m1"), Some(StreamPhase::Streaming));
        assert_eq!(t.session_phase("s1"), ActivityPhase::Busy);
    }

    #[test]
    fn completion_timeout_completes_stream() {
        let mut t = tracker();
        t.record_part("s1", "m1", 0);
        t.tick(1_000);
        t.tick(10_000);
        assert_eq!(phase_of(&t, "m1"), Some(StreamPhase::Completed));
        assert!(t.is_idle("s1"));
    }

    #[test]
    fn completed_is_terminal_until_settled() {
        let mut t = tracker();
        t.record_part("s1", "m1", 0);
        t.complete("m1", 10);

        t.record_part("s1", "m1", 20);
        assert_eq!(phase_of(&t, "m1"), Some(StreamPhase::Completed));
        assert!(t.complete("m1", 30).is_empty());

        assert!(t.mark_settled("m1"));
        assert!(t.lifecycle("m1").is_none());
    }

    #[test]
    fn settling_a_live_stream_is_refused() {
        let mut t = tracker();
        t.record_part("s1", "m1", 0);
        assert!(!t.mark_settled("m1"));
        assert!(t.lifecycle("m1").is_some());
    }

    #[test]
    fn abort_completes_all_live_streams_once() {
        let mut t = tracker();
        t.record_part("s1", "m1", 0);
        t.record_part("s1", "m2", 5);
        t.record_part("s2", "m3", 5);

        let changes = t.abort_session("s1", 50);
        assert_eq!(
            changes
                .iter()
                .filter(|c| matches!(c, TrackerChange::Stream { .. }))
                .count(),
            2
        );
        assert!(t.is_idle("s1"));
        assert!(!t.is_idle("s2"));

        assert!(t.abort_session("s1", 60).is_empty());
    }

    #[test]
    fn backend_idle_passes_through_cooldown() {
        let mut t = tracker();
        t.set_backend_status("s1", true, 0);
        assert_eq!(t.session_phase("s1"), ActivityPhase::Busy);

        t.set_backend_status("s1", false, 100);
        assert_eq!(t.session_phase("s1"), ActivityPhase::Cooldown);

        t.tick(2_000);
        assert_eq!(t.session_phase("s1"), ActivityPhase::Cooldown);
        let changes = t.tick(2_100);
        assert_eq!(t.session_phase("s1"), ActivityPhase::Idle);
        assert!(changes.contains(&TrackerChange::Activity {
            session_id: "s1".into(),
            phase: ActivityPhase::Idle
        }));
    }

    #[test]
    fn idle_report_without_busy_is_ignored() {
        let mut t = tracker();
        assert!(t.set_backend_status("s1", false, 0).is_empty());
        assert!(t.is_idle("s1"));
    }

    #[test]
    fn reset_returns_every_session_to_idle() {
        let mut t = tracker();
        t.record_part("s1", "m1", 0);
        t.set_backend_status("s2", true, 0);

        t.reset_all(10);
        assert!(t.is_idle("s1"));
        assert!(t.is_idle("s2"));
        assert_eq!(phase_of(&t, "m1"), Some(StreamPhase::Completed));
    }

    #[test]
    fn streaming_message_is_latest_live_one() {
        let mut t = tracker();
        t.record_part("s1", "m1", 0);
        t.record_part("s1", "m2", 10);
        assert_eq!(t.streaming_message_id("s1"), Some("m2"));
        t.complete("m2", 20);
        assert_eq!(t.streaming_message_id("s1"), Some("m1"));
    }
}
