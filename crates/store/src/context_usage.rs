//! Context window usage accounting.
//!
//! Usage is measured against the *threshold* limit, i.e. the context limit
//! minus the output headroom the model needs to answer, so a session shows
//! 100% before the backend starts truncating.

use std::collections::HashMap;

use chamber_protocol::{ContextUsage, Message, MessageRole, PartKind};

/// Compute usage from a raw token count and the model's declared limits.
pub fn compute_usage(
    total_tokens: u64,
    context_limit: u64,
    output_limit: Option<u64>,
    default_reservation: u64,
    last_message_id: Option<String>,
) -> ContextUsage {
    let normalized_output = output_limit
        .filter(|limit| *limit > 0)
        .unwrap_or(default_reservation)
        .min(context_limit);
    let threshold_limit = context_limit.saturating_sub(normalized_output).max(1);

    // An unknown context limit reports nothing rather than a full window.
    let percentage = if context_limit == 0 {
        0.0
    } else {
        (total_tokens as f64 / threshold_limit as f64 * 100.0).clamp(0.0, 100.0)
    };

    ContextUsage {
        total_tokens,
        percentage,
        context_limit,
        output_limit,
        normalized_output,
        threshold_limit,
        last_message_id,
    }
}

/// Token count of one message: reported usage, else the last step-finish
/// part that carried tokens.
pub fn message_tokens(message: &Message) -> u64 {
    if let Some(total) = message.info.tokens.map(|t| t.total()).filter(|t| *t > 0) {
        return total;
    }
    message
        .parts
        .iter()
        .rev()
        .find_map(|part| match &part.kind {
            PartKind::StepFinish { tokens: Some(tokens) } if tokens.total() > 0 => {
                Some(tokens.total())
            }
            _ => None,
        })
        .unwrap_or(0)
}

/// Per-session cache, keyed by the last assistant message id.
#[derive(Debug)]
pub struct ContextUsageCache {
    entries: HashMap<String, ContextUsage>,
    default_reservation: u64,
    revision: u64,
}

impl ContextUsageCache {
    pub fn new(default_reservation: u64) -> Self {
        Self {
            entries: HashMap::new(),
            default_reservation,
            revision: 0,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn get(&self, session_id: &str) -> Option<&ContextUsage> {
        self.entries.get(session_id)
    }

    pub fn entries(&self) -> &HashMap<String, ContextUsage> {
        &self.entries
    }

    /// Cached usage for the session, refreshed only when the backing message
    /// or the limits changed. With no assistant message loaded the previous
    /// entry (if any) is kept and only rescaled, so eviction does not blank it.
    pub fn get_or_compute(
        &mut self,
        session_id: &str,
        messages: &[Message],
        context_limit: u64,
        output_limit: Option<u64>,
    ) -> Option<ContextUsage> {
        let last = last_assistant(messages);

        if let Some(cached) = self.entries.get(session_id) {
            let reusable = match last {
                Some(last) => {
                    cached.last_message_id.as_deref() == Some(last.id()) && cached.total_tokens > 0
                }
                None => true,
            };
            if reusable {
                if cached.context_limit == context_limit && cached.output_limit == output_limit {
                    return Some(cached.clone());
                }
                let rescaled = compute_usage(
                    cached.total_tokens,
                    context_limit,
                    output_limit,
                    self.default_reservation,
                    cached.last_message_id.clone(),
                );
                return Some(self.store(session_id, rescaled));
            }
        }

        let last = last?;
        let usage = compute_usage(
            message_tokens(last),
            context_limit,
            output_limit,
            self.default_reservation,
            Some(last.id().to_string()),
        );
        Some(self.store(session_id, usage))
    }

    /// Recompute from the messages regardless of the cached entry.
    pub fn update(
        &mut self,
        session_id: &str,
        messages: &[Message],
        context_limit: u64,
        output_limit: Option<u64>,
    ) -> Option<ContextUsage> {
        let last = last_assistant(messages)?;
        let usage = compute_usage(
            message_tokens(last),
            context_limit,
            output_limit,
            self.default_reservation,
            Some(last.id().to_string()),
        );
        Some(self.store(session_id, usage))
    }

    pub fn remove(&mut self, session_id: &str) {
        if self.entries.remove(session_id).is_some() {
            self.revision += 1;
        }
    }

    fn store(&mut self, session_id: &str, usage: ContextUsage) -> ContextUsage {
        let changed = self.entries.get(session_id) != Some(&usage);
        if changed {
            self.entries.insert(session_id.to_string(), usage.clone());
            self.revision += 1;
        }
        usage
    }
}

fn last_assistant(messages: &[Message]) -> Option<&Message> {
    messages
        .iter()
        .rev()
        .find(|m| m.info.role == MessageRole::Assistant)
}
