//! Session window manager.
//!
//! Owns the in-memory message list of every session, the per-session memory
//! bookkeeping and the viewport anchors. Windows only ever shrink by
//! dropping whole messages from either end, so message order and ids are
//! never rewritten. The anchor and its padding are never dropped.

use std::collections::{HashMap, HashSet};

use chamber_protocol::{
    LoadDirection, Message, MessageInfo, MessagePage, MessageRole, Part, SessionMemoryState,
    ViewportAnchor,
};
use tracing::debug;

use crate::config::StoreConfig;
use crate::error::StoreError;

/// Which end of the list survives a trim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepSide {
    Newest,
    Oldest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimOutcome {
    Trimmed { removed: usize },
    Unchanged,
    /// Session is streaming; nothing was touched
    SkippedStreaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOutcome {
    pub added: usize,
    pub trimmed: usize,
}

/// Result of routing a streamed part into the windows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamAppend {
    /// Session has no materialized window; the next load picks the part up
    NotMaterialized,
    /// New message lies below the loaded window; pagination will bring it
    OutsideWindow,
    Applied,
}

#[derive(Debug, Default)]
pub struct EvictionReport {
    pub evicted: Vec<String>,
    /// `StoreError::EvictionSkipped` for each candidate that was refused
    pub skipped: Vec<StoreError>,
}

#[derive(Debug, Default)]
struct SessionWindow {
    messages: Vec<Message>,
    memory: SessionMemoryState,
    anchor: Option<ViewportAnchor>,
    registration: u64,
    revision: u64,
}

impl SessionWindow {
    fn sync_count(&mut self) {
        self.memory.loaded_count = self.messages.len();
        self.revision += 1;
    }

    fn position(&self, message_id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id() == message_id)
    }

    /// Inclusive index range trimming must keep
    fn protected_range(&self, padding: usize) -> Option<(usize, usize)> {
        let anchor = self.anchor.as_ref()?;
        if self.messages.is_empty() {
            return None;
        }
        let last = self.messages.len() - 1;
        let index = anchor.index.min(last);
        Some((index.saturating_sub(padding), (index + padding).min(last)))
    }

    /// Re-point the anchor at its message after a mutation.
    fn resolve_anchor(&mut self, session_id: &str) -> Result<(), StoreError> {
        let Some(anchor) = self.anchor.as_ref() else {
            return Ok(());
        };
        match self.position(&anchor.message_id) {
            Some(index) => {
                if let Some(anchor) = self.anchor.as_mut() {
                    anchor.index = index;
                }
                Ok(())
            }
            None => {
                let message_id = anchor.message_id.clone();
                self.anchor = None;
                Err(StoreError::StaleAnchor {
                    session_id: session_id.to_string(),
                    message_id,
                })
            }
        }
    }

    fn trim(&mut self, target: usize, keep: KeepSide, padding: usize) -> usize {
        let len = self.messages.len();
        let (start, end) = kept_range(len, target.max(1), self.protected_range(padding), keep);
        if start == 0 && end == len {
            return 0;
        }
        self.messages.truncate(end);
        self.messages.drain(..start);
        if start > 0 {
            self.memory.has_more_above = true;
        }
        if end < len {
            self.memory.has_more_below = true;
        }
        if let Some(anchor) = self.anchor.as_mut() {
            anchor.index = anchor.index.saturating_sub(start);
        }
        self.sync_count();
        len - self.messages.len()
    }
}

/// Half-open range `[start, end)` of a `len`-long list that a trim to
/// `target` keeps, always covering `protected`.
fn kept_range(
    len: usize,
    target: usize,
    protected: Option<(usize, usize)>,
    keep: KeepSide,
) -> (usize, usize) {
    if len <= target {
        return (0, len);
    }
    let mut size = target;
    let mut start = match keep {
        KeepSide::Newest => len - target,
        KeepSide::Oldest => 0,
    };
    if let Some((lo, hi)) = protected {
        size = size.max(hi - lo + 1);
        start = start.min(lo).max((hi + 1).saturating_sub(size));
    }
    let size = size.min(len);
    start = start.min(len - size);
    (start, start + size)
}

/// Drop messages whose id is already present in `existing` or earlier in
/// `incoming`.
/// Append `delta` to a stored part. When the incoming part carries its full
/// text and the stored text plus the delta does not reproduce it, nothing is
/// appended and the caller replaces the part.
fn apply_delta(existing: &mut Part, incoming: &Part, delta: &str) -> bool {
    match (existing.text(), incoming.text()) {
        (Some(stored), Some(full)) if !full.is_empty() => {
            let consistent = full.len() == stored.len() + delta.len()
                && full.starts_with(stored)
                && full.ends_with(delta);
            consistent && existing.append_delta(delta)
        }
        _ => existing.append_delta(delta),
    }
}

fn dedupe(existing: &[Message], incoming: Vec<Message>) -> Vec<Message> {
    let mut seen: HashSet<String> = existing.iter().map(|m| m.id().to_string()).collect();
    incoming
        .into_iter()
        .filter(|m| seen.insert(m.id().to_string()))
        .collect()
}

pub struct SessionWindowManager {
    windows: HashMap<String, SessionWindow>,
    next_registration: u64,
    window_size: usize,
    page_size: usize,
    viewport_padding: usize,
    max_materialized: usize,
    revision: u64,
}

impl SessionWindowManager {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            windows: HashMap::new(),
            next_registration: 0,
            window_size: config.window_size,
            page_size: config.page_size,
            viewport_padding: config.viewport_padding,
            max_materialized: config.max_materialized_sessions,
            revision: 0,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn session_revision(&self, session_id: &str) -> Option<u64> {
        self.windows.get(session_id).map(|w| w.revision)
    }

    pub fn session_ids(&self) -> impl Iterator<Item = &String> {
        self.windows.keys()
    }

    pub fn is_materialized(&self, session_id: &str) -> bool {
        self.windows
            .get(session_id)
            .is_some_and(|w| w.memory.materialized)
    }

    pub fn materialized_count(&self) -> usize {
        self.windows.values().filter(|w| w.memory.materialized).count()
    }

    pub fn messages(&self, session_id: &str) -> &[Message] {
        self.windows
            .get(session_id)
            .map(|w| w.messages.as_slice())
            .unwrap_or(&[])
    }

    pub fn memory(&self, session_id: &str) -> Option<&SessionMemoryState> {
        self.windows.get(session_id).map(|w| &w.memory)
    }

    pub fn anchor(&self, session_id: &str) -> Option<&ViewportAnchor> {
        self.windows.get(session_id).and_then(|w| w.anchor.as_ref())
    }

    pub fn message_role(&self, session_id: &str, message_id: &str) -> Option<MessageRole> {
        let window = self.windows.get(session_id)?;
        window
            .messages
            .iter()
            .find(|m| m.id() == message_id)
            .map(|m| m.info.role)
    }

    fn window_mut(&mut self, session_id: &str) -> &mut SessionWindow {
        let next_registration = &mut self.next_registration;
        self.revision += 1;
        self.windows
            .entry(session_id.to_string())
            .or_insert_with(|| {
                let registration = *next_registration;
                *next_registration += 1;
                SessionWindow {
                    registration,
                    ..SessionWindow::default()
                }
            })
    }

    /// Record an access without changing content.
    pub fn touch(&mut self, session_id: &str, now: u64) {
        if let Some(window) = self.windows.get_mut(session_id) {
            window.memory.last_access_at = now;
            window.revision += 1;
            self.revision += 1;
        }
    }

    /// Mirror the session's streaming state into its memory record.
    pub fn set_streaming(&mut self, session_id: &str, streaming: bool) {
        if let Some(window) = self.windows.get_mut(session_id) {
            if window.memory.streaming != streaming {
                window.memory.streaming = streaming;
                window.revision += 1;
                self.revision += 1;
            }
        }
    }

    /// Materialize a session from its most recent page. Returns `false`
    /// (and changes nothing) when the session is already materialized.
    pub fn apply_initial_load(&mut self, session_id: &str, page: MessagePage, now: u64) -> bool {
        if self.is_materialized(session_id) {
            return false;
        }
        let window_size = self.window_size;
        let window = self.window_mut(session_id);

        let mut messages = dedupe(&[], page.messages);
        let mut has_more_above = page.has_more_above;
        if messages.len() > window_size {
            messages.drain(..messages.len() - window_size);
            has_more_above = true;
        }

        window.messages = messages;
        window.memory.materialized = true;
        window.memory.has_more_above = has_more_above;
        window.memory.has_more_below = page.has_more_below;
        window.memory.last_access_at = now;
        window.sync_count();
        true
    }

    /// Cursor for the next page in `direction`, if there is more to load.
    pub fn page_cursor(&self, session_id: &str, direction: LoadDirection) -> Option<String> {
        let window = self.windows.get(session_id)?;
        if !window.memory.materialized {
            return None;
        }
        match direction {
            LoadDirection::Up if window.memory.has_more_above => {
                window.messages.first().map(|m| m.id().to_string())
            }
            LoadDirection::Down if window.memory.has_more_below => {
                window.messages.last().map(|m| m.id().to_string())
            }
            _ => None,
        }
    }

    /// Extend the window in `direction`. Loaded messages are kept; any
    /// overshoot past the window size is trimmed from the opposite end
    /// unless the session is streaming.
    pub fn apply_page(
        &mut self,
        session_id: &str,
        direction: LoadDirection,
        page: MessagePage,
        streaming: bool,
        now: u64,
    ) -> Result<PageOutcome, StoreError> {
        let window_size = self.window_size;
        let padding = self.viewport_padding;
        let Some(window) = self.windows.get_mut(session_id) else {
            return Ok(PageOutcome {
                added: 0,
                trimmed: 0,
            });
        };
        self.revision += 1;

        let incoming = dedupe(&window.messages, page.messages);
        let added = incoming.len();
        match direction {
            LoadDirection::Up => {
                window.messages.splice(0..0, incoming);
                window.memory.has_more_above = page.has_more_above;
            }
            LoadDirection::Down => {
                window.messages.extend(incoming);
                window.memory.has_more_below = page.has_more_below;
            }
        }
        window.memory.last_access_at = now;
        window.sync_count();
        let anchor_result = window.resolve_anchor(session_id);

        let trimmed = if streaming || window.messages.len() <= window_size {
            0
        } else {
            let keep = match direction {
                LoadDirection::Up => KeepSide::Oldest,
                LoadDirection::Down => KeepSide::Newest,
            };
            window.trim(window_size, keep, padding)
        };

        anchor_result.map(|_| PageOutcome { added, trimmed })
    }

    /// Record the message the viewport is centered on.
    pub fn update_anchor(&mut self, session_id: &str, index: usize, now: u64) -> Result<(), StoreError> {
        let Some(window) = self.windows.get_mut(session_id) else {
            return Ok(());
        };
        self.revision += 1;
        window.memory.last_access_at = now;
        window.revision += 1;

        match window.messages.get(index) {
            Some(message) => {
                window.anchor = Some(ViewportAnchor {
                    index,
                    message_id: message.id().to_string(),
                    pending: false,
                });
                Ok(())
            }
            None => {
                let message_id = window
                    .anchor
                    .take()
                    .map(|a| a.message_id)
                    .unwrap_or_else(|| format!("#{index}"));
                Err(StoreError::StaleAnchor {
                    session_id: session_id.to_string(),
                    message_id,
                })
            }
        }
    }

    /// Flag the anchor for restoration when the session becomes current.
    pub fn mark_anchor_pending(&mut self, session_id: &str) {
        if let Some(window) = self.windows.get_mut(session_id) {
            if let Some(anchor) = window.anchor.as_mut() {
                anchor.pending = true;
                window.revision += 1;
                self.revision += 1;
            }
        }
    }

    /// Shrink a session's window toward `target` messages, keeping the
    /// newest messages and never the anchor's viewport range.
    pub fn trim_to_viewport_window(
        &mut self,
        session_id: &str,
        target: usize,
        streaming: bool,
        now: u64,
    ) -> TrimOutcome {
        if streaming {
            return TrimOutcome::SkippedStreaming;
        }
        let padding = self.viewport_padding;
        let Some(window) = self.windows.get_mut(session_id) else {
            return TrimOutcome::Unchanged;
        };
        window.memory.last_access_at = now;
        let removed = window.trim(target, KeepSide::Newest, padding);
        self.revision += 1;
        if removed == 0 {
            TrimOutcome::Unchanged
        } else {
            debug!(
                component = "window",
                event = "window.trimmed",
                session_id = %session_id,
                removed,
                remaining = window.messages.len(),
                "Trimmed session window"
            );
            TrimOutcome::Trimmed { removed }
        }
    }

    /// Insert or update message metadata in a materialized window.
    pub fn upsert_message_info(&mut self, info: MessageInfo, now: u64) -> StreamAppend {
        let session_id = info.session_id.clone();
        if !self.is_materialized(&session_id) {
            return StreamAppend::NotMaterialized;
        }
        let window = self.window_mut(&session_id);
        window.memory.last_access_at = now;
        if let Some(index) = window.position(&info.id) {
            window.messages[index].info = info;
            window.revision += 1;
            return StreamAppend::Applied;
        }
        if window.memory.has_more_below {
            return StreamAppend::OutsideWindow;
        }
        window.messages.push(Message {
            info,
            parts: Vec::new(),
        });
        window.sync_count();
        StreamAppend::Applied
    }

    /// Insert or update a streamed part. Text deltas are appended to the
    /// existing part when present.
    pub fn upsert_part(&mut self, part: Part, delta: Option<&str>, now: u64) -> StreamAppend {
        let session_id = part.session_id.clone();
        if !self.is_materialized(&session_id) {
            return StreamAppend::NotMaterialized;
        }
        let window = self.window_mut(&session_id);
        window.memory.last_access_at = now;

        let index = match window.position(&part.message_id) {
            Some(index) => index,
            None if window.memory.has_more_below => return StreamAppend::OutsideWindow,
            None => {
                window.messages.push(Message {
                    info: MessageInfo::placeholder(
                        &part.message_id,
                        &session_id,
                        MessageRole::Assistant,
                        now,
                    ),
                    parts: Vec::new(),
                });
                window.sync_count();
                window.messages.len() - 1
            }
        };

        let message = &mut window.messages[index];
        let appended = match (delta, message.parts.iter_mut().find(|p| p.id == part.id)) {
            (Some(delta), Some(existing)) => apply_delta(existing, &part, delta),
            _ => false,
        };
        if !appended {
            message.upsert_part(part);
        }
        window.revision += 1;
        StreamAppend::Applied
    }

    /// Fully unload a session. The memory record survives with its
    /// registration and access time so a later load re-materializes it.
    pub fn evict(&mut self, session_id: &str) -> bool {
        let Some(window) = self.windows.get_mut(session_id) else {
            return false;
        };
        if !window.memory.materialized {
            return false;
        }
        window.messages = Vec::new();
        window.anchor = None;
        window.memory.materialized = false;
        window.memory.has_more_above = false;
        window.memory.has_more_below = false;
        window.sync_count();
        self.revision += 1;
        true
    }

    /// Unload least recently used sessions until at most the configured
    /// number stay materialized. The current session and sessions that are
    /// not idle are never unloaded.
    pub fn evict_least_recently_used(
        &mut self,
        current: Option<&str>,
        is_idle: impl Fn(&str) -> bool,
    ) -> EvictionReport {
        let mut report = EvictionReport::default();
        let mut count = self.materialized_count();
        if count <= self.max_materialized {
            return report;
        }

        let mut candidates: Vec<(u64, u64, String)> = self
            .windows
            .iter()
            .filter(|(_, w)| w.memory.materialized)
            .map(|(id, w)| (w.memory.last_access_at, w.registration, id.clone()))
            .collect();
        candidates.sort();

        for (_, _, session_id) in candidates {
            if count <= self.max_materialized {
                break;
            }
            if current == Some(session_id.as_str()) {
                report.skipped.push(StoreError::EvictionSkipped {
                    session_id,
                    reason: "current session",
                });
                continue;
            }
            if !is_idle(&session_id) {
                report.skipped.push(StoreError::EvictionSkipped {
                    session_id,
                    reason: "session is streaming",
                });
                continue;
            }
            if self.evict(&session_id) {
                count -= 1;
                report.evicted.push(session_id);
            }
        }
        report
    }

    /// Forget a deleted session entirely
    pub fn remove_session(&mut self, session_id: &str) -> bool {
        let removed = self.windows.remove(session_id).is_some();
        if removed {
            self.revision += 1;
        }
        removed
    }
}
