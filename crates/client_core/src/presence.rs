use std::{
    collections::{BTreeMap, BTreeSet},
    time::{Duration, Instant},
};

use shared::{
    domain::{ConversationId, UserId},
    protocol::ClientCommand,
};

/// Silence after which a typing indicator is dropped, and after which the
/// local user's own typing is announced as stopped.
pub const TYPING_EXPIRY: Duration = Duration::from_millis(2000);

/// Minimum spacing between repeated `Start` signals while keystrokes
/// continue. Must stay below [`TYPING_EXPIRY`] so remote indicators are
/// refreshed before they lapse.
pub const TYPING_REFRESH: Duration = Duration::from_millis(1000);

/// Online users as last reported by the relay. Cleared when the channel drops.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    online: BTreeSet<UserId>,
}

impl PresenceTracker {
    pub fn apply_snapshot(&mut self, user_ids: impl IntoIterator<Item = UserId>) {
        self.online = user_ids.into_iter().collect();
    }

    /// Returns `true` if the flag actually changed.
    pub fn apply_update(&mut self, user_id: UserId, is_online: bool) -> bool {
        if is_online {
            self.online.insert(user_id)
        } else {
            self.online.remove(&user_id)
        }
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.online.contains(&user_id)
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.online.iter().copied().collect()
    }

    pub fn clear(&mut self) {
        self.online.clear();
    }
}

/// Remote typing indicators keyed by (conversation, user), each stamped with
/// the time of the last `is_typing = true` event.
#[derive(Debug, Default)]
pub struct TypingTracker {
    entries: BTreeMap<(ConversationId, UserId), Instant>,
}

impl TypingTracker {
    pub fn apply(
        &mut self,
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
        now: Instant,
    ) -> bool {
        let key = (conversation_id, user_id);
        if is_typing {
            self.entries.insert(key, now).is_none()
        } else {
            self.entries.remove(&key).is_some()
        }
    }

    /// Drops indicators older than [`TYPING_EXPIRY`]; returns the affected
    /// conversations.
    pub fn expire(&mut self, now: Instant) -> BTreeSet<ConversationId> {
        let mut affected = BTreeSet::new();
        self.entries.retain(|(conversation_id, _), seen| {
            let alive = now.saturating_duration_since(*seen) < TYPING_EXPIRY;
            if !alive {
                affected.insert(*conversation_id);
            }
            alive
        });
        affected
    }

    pub fn typing_users(&self, conversation_id: ConversationId, now: Instant) -> Vec<UserId> {
        self.entries
            .iter()
            .filter(|((conversation, _), seen)| {
                *conversation == conversation_id
                    && now.saturating_duration_since(**seen) < TYPING_EXPIRY
            })
            .map(|((_, user_id), _)| *user_id)
            .collect()
    }

    /// Drops every indicator; returns the conversations that showed one.
    pub fn clear(&mut self) -> BTreeSet<ConversationId> {
        let affected = self
            .entries
            .keys()
            .map(|(conversation_id, _)| *conversation_id)
            .collect();
        self.entries.clear();
        affected
    }
}

/// Human-readable typing line. Two names are spelled out before the rest
/// collapse into a count.
pub fn typing_label(names: &[String]) -> Option<String> {
    match names {
        [] => None,
        [one] => Some(format!("{one} is typing…")),
        [first, second] => Some(format!("{first} and {second} are typing…")),
        [first, second, rest @ ..] => {
            let others = if rest.len() == 1 { "other" } else { "others" };
            Some(format!(
                "{first}, {second} and {} {others} are typing…",
                rest.len()
            ))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    Start(ConversationId),
    Stop(ConversationId),
}

impl TypingSignal {
    pub fn into_command(self, user_id: UserId) -> ClientCommand {
        match self {
            TypingSignal::Start(conversation_id) => ClientCommand::TypingStart {
                conversation_id,
                user_id,
            },
            TypingSignal::Stop(conversation_id) => ClientCommand::TypingStop {
                conversation_id,
                user_id,
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LocalTyping {
    conversation_id: ConversationId,
    last_keystroke: Instant,
    announced_at: Instant,
}

/// Local user's own typing state. Emits `Start` on the first keystroke,
/// repeats it at most every [`TYPING_REFRESH`] while typing goes on, and
/// emits `Stop` once the keyboard has been idle for [`TYPING_EXPIRY`].
#[derive(Debug, Default)]
pub struct TypingNotifier {
    active: Option<LocalTyping>,
}

impl TypingNotifier {
    pub fn keystroke(&mut self, conversation_id: ConversationId, now: Instant) -> Vec<TypingSignal> {
        let fresh = LocalTyping {
            conversation_id,
            last_keystroke: now,
            announced_at: now,
        };
        match self.active.as_mut() {
            Some(current) if current.conversation_id == conversation_id => {
                current.last_keystroke = now;
                if now.saturating_duration_since(current.announced_at) < TYPING_REFRESH {
                    return Vec::new();
                }
                current.announced_at = now;
                vec![TypingSignal::Start(conversation_id)]
            }
            Some(current) => {
                let previous = current.conversation_id;
                *current = fresh;
                vec![
                    TypingSignal::Stop(previous),
                    TypingSignal::Start(conversation_id),
                ]
            }
            None => {
                self.active = Some(fresh);
                vec![TypingSignal::Start(conversation_id)]
            }
        }
    }

    pub fn tick(&mut self, now: Instant) -> Option<TypingSignal> {
        let current = self.active?;
        if now.saturating_duration_since(current.last_keystroke) >= TYPING_EXPIRY {
            self.active = None;
            return Some(TypingSignal::Stop(current.conversation_id));
        }
        None
    }

    pub fn stop(&mut self) -> Option<TypingSignal> {
        self.active
            .take()
            .map(|current| TypingSignal::Stop(current.conversation_id))
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
