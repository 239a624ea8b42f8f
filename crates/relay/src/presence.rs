use std::collections::HashMap;

use shared::domain::UserId;

/// Counts live authenticated connections per user. A user is online while
/// the count is non-zero; nothing here outlives the process.
#[derive(Debug, Default)]
pub(crate) struct PresenceRegistry {
    sessions: HashMap<UserId, usize>,
}

impl PresenceRegistry {
    /// Returns `true` when this connection brought the user online.
    pub(crate) fn connect(&mut self, user_id: UserId) -> bool {
        let count = self.sessions.entry(user_id).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Returns `true` when the last connection for the user went away.
    pub(crate) fn disconnect(&mut self, user_id: UserId) -> bool {
        let Some(count) = self.sessions.get_mut(&user_id) else {
            return false;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.sessions.remove(&user_id);
            return true;
        }
        false
    }

    pub(crate) fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.sessions.keys().copied().collect();
        users.sort();
        users
    }
}
