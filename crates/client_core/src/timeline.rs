use std::{collections::BTreeSet, fmt};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, Identity, MessageId, UserId},
    protocol::{MessageBody, MessagePayload},
};

use crate::error::TimelineError;

/// Client-side placeholder id. Rendered as `temp-<n>`; the namespace never
/// overlaps the integer ids the server assigns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TempId(u64);

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "temp-{}", self.0)
    }
}

/// Monotonic source of [`TempId`]s for one client.
#[derive(Debug, Default)]
pub struct TempIdGenerator {
    last: u64,
}

impl TempIdGenerator {
    pub fn next_id(&mut self) -> TempId {
        self.last += 1;
        TempId(self.last)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalId {
    Temp(TempId),
    Server(MessageId),
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalId::Temp(temp) => write!(f, "{temp}"),
            LocalId::Server(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub id: LocalId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_name: Option<String>,
    pub body: MessageBody,
    pub created_at: DateTime<Utc>,
    pub read_by: BTreeSet<UserId>,
}

impl TimelineEntry {
    pub fn from_payload(message: MessagePayload) -> Self {
        Self {
            id: LocalId::Server(message.message_id),
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            sender_name: message.sender_name,
            body: message.body,
            created_at: message.created_at,
            read_by: message.read_by,
        }
    }

    pub fn server_id(&self) -> Option<MessageId> {
        match self.id {
            LocalId::Server(id) => Some(id),
            LocalId::Temp(_) => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.id, LocalId::Temp(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// The temp entry now carries the server record.
    Replaced,
    /// The live event won the race; the temp entry was dropped.
    Deduplicated,
    /// The temp entry was gone (history reload), so the record was appended.
    Appended,
}

/// Visible message list of one conversation, reconciling optimistic entries
/// against server-confirmed records.
///
/// Deletions seen locally outlive the rows they touched: a tombstoned id
/// never shows content again and a removed id never comes back, whatever a
/// later history page says.
#[derive(Debug, Clone)]
pub struct Timeline {
    conversation_id: ConversationId,
    entries: Vec<TimelineEntry>,
    tombstoned: BTreeSet<MessageId>,
    removed: BTreeSet<MessageId>,
}

impl Timeline {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            entries: Vec::new(),
            tombstoned: BTreeSet::new(),
            removed: BTreeSet::new(),
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn contains(&self, message_id: MessageId) -> bool {
        self.position_of_server(message_id).is_some()
    }

    pub fn get(&self, message_id: MessageId) -> Option<&TimelineEntry> {
        self.position_of_server(message_id)
            .map(|index| &self.entries[index])
    }

    /// Oldest confirmed id currently shown; the cursor for older pages.
    pub fn oldest_server_id(&self) -> Option<MessageId> {
        self.entries.iter().find_map(TimelineEntry::server_id)
    }

    pub fn push_optimistic(&mut self, temp_id: TempId, sender: &Identity, body: MessageBody) {
        self.entries.push(TimelineEntry {
            id: LocalId::Temp(temp_id),
            conversation_id: self.conversation_id,
            sender_id: sender.user_id,
            sender_name: Some(sender.display_name.clone()),
            body,
            created_at: Utc::now(),
            read_by: BTreeSet::new(),
        });
    }

    pub fn confirm(
        &mut self,
        temp_id: TempId,
        message: MessagePayload,
    ) -> Result<ConfirmOutcome, TimelineError> {
        self.ensure_same_conversation(&message)?;

        let temp_index = self.position_of_temp(temp_id);
        if self.contains(message.message_id) {
            if let Some(index) = temp_index {
                self.entries.remove(index);
            }
            return Ok(ConfirmOutcome::Deduplicated);
        }

        match temp_index {
            Some(index) => {
                self.entries[index] = self.local_view(message);
                Ok(ConfirmOutcome::Replaced)
            }
            None => {
                self.entries.push(self.local_view(message));
                Ok(ConfirmOutcome::Appended)
            }
        }
    }

    /// Drops a failed optimistic entry. Returns `false` if it was not present.
    pub fn rollback(&mut self, temp_id: TempId) -> bool {
        match self.position_of_temp(temp_id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Appends a relayed message unless a row with its id is already shown.
    pub fn apply_incoming(&mut self, message: MessagePayload) -> Result<bool, TimelineError> {
        self.ensure_same_conversation(&message)?;
        if self.contains(message.message_id) || self.removed.contains(&message.message_id) {
            return Ok(false);
        }
        let entry = self.local_view(message);
        self.entries.push(entry);
        Ok(true)
    }

    /// Turns the message into a tombstone. Content and attachments go with it.
    pub fn mark_deleted(&mut self, message_id: MessageId) -> bool {
        self.tombstoned.insert(message_id);
        match self.position_of_server(message_id) {
            Some(index) if !self.entries[index].body.is_deleted() => {
                self.entries[index].body = MessageBody::Deleted;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, message_id: MessageId) -> bool {
        self.removed.insert(message_id);
        match self.position_of_server(message_id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn apply_read_receipt(&mut self, message_ids: &[MessageId], reader_id: UserId) -> usize {
        let mut changed = 0;
        for entry in &mut self.entries {
            let Some(id) = entry.server_id() else {
                continue;
            };
            if message_ids.contains(&id) && entry.read_by.insert(reader_id) {
                changed += 1;
            }
        }
        changed
    }

    /// Replaces confirmed rows with a fresh history page. Rows newer than the
    /// page (live arrivals that raced the fetch) and optimistic rows still in
    /// flight stay after it. Read marks already shown are kept.
    pub fn replace_history(&mut self, messages: Vec<MessagePayload>) {
        let (pending, confirmed): (Vec<TimelineEntry>, Vec<TimelineEntry>) =
            self.entries.drain(..).partition(TimelineEntry::is_pending);

        let mut seen = BTreeSet::new();
        for message in messages {
            if message.conversation_id != self.conversation_id
                || self.removed.contains(&message.message_id)
                || !seen.insert(message.message_id)
            {
                continue;
            }
            let mut entry = self.local_view(message);
            if let Some(known) = confirmed.iter().find(|known| known.id == entry.id) {
                entry.read_by.extend(known.read_by.iter().copied());
            }
            self.entries.push(entry);
        }

        let newest = seen.iter().next_back().copied();
        self.entries.extend(confirmed.into_iter().filter(|entry| {
            entry
                .server_id()
                .is_some_and(|id| !seen.contains(&id) && newest.map_or(true, |newest| id > newest))
        }));
        self.entries.extend(pending);
    }

    /// Puts an older page in front of the loaded rows. Ids already shown or
    /// removed locally are skipped; nothing loaded is touched. Returns how
    /// many rows were added.
    pub fn prepend_older(&mut self, messages: Vec<MessagePayload>) -> usize {
        let mut seen = BTreeSet::new();
        let mut older = Vec::new();
        for message in messages {
            if message.conversation_id != self.conversation_id
                || self.contains(message.message_id)
                || self.removed.contains(&message.message_id)
                || !seen.insert(message.message_id)
            {
                continue;
            }
            older.push(self.local_view(message));
        }
        let added = older.len();
        self.entries.splice(0..0, older);
        added
    }

    fn local_view(&self, message: MessagePayload) -> TimelineEntry {
        let mut entry = TimelineEntry::from_payload(message);
        if entry
            .server_id()
            .is_some_and(|id| self.tombstoned.contains(&id))
        {
            entry.body = MessageBody::Deleted;
        }
        entry
    }

    fn ensure_same_conversation(&self, message: &MessagePayload) -> Result<(), TimelineError> {
        if message.conversation_id != self.conversation_id {
            return Err(TimelineError::ConversationMismatch {
                expected: self.conversation_id,
                found: message.conversation_id,
            });
        }
        Ok(())
    }

    fn position_of_temp(&self, temp_id: TempId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.id == LocalId::Temp(temp_id))
    }

    fn position_of_server(&self, message_id: MessageId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.id == LocalId::Server(message_id))
    }
}

#[cfg(test)]
#[path = "tests/timeline_tests.rs"]
mod tests;
