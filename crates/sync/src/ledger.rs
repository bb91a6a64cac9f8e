use std::collections::HashSet;

use tether_gateway::{Message, MessageId, UserId};

use super::settings::AppendStrategy;

/// Load status of the ledger, for skeletons and error banners.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LedgerState {
    #[default]
    Idle,
    Loading(UserId),
    Ready(UserId),
    LoadFailed { peer: UserId, reason: String },
}

impl LedgerState {
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading(_))
    }

    pub fn peer(&self) -> Option<&UserId> {
        match self {
            Self::Idle => None,
            Self::Loading(peer) | Self::Ready(peer) | Self::LoadFailed { peer, .. } => Some(peer),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Added at the tail.
    Appended,
    /// Added before later messages at this index.
    Inserted(usize),
    /// The id was already present; nothing changed.
    Duplicate,
}

impl AppendOutcome {
    pub fn is_added(self) -> bool {
        !matches!(self, Self::Duplicate)
    }
}

/// A message taken out by an optimistic delete, with its former position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedMessage {
    pub index: usize,
    pub message: Message,
}

/// Ordered, id-unique view of the selected conversation.
#[derive(Debug, Default)]
pub struct MessageLedger {
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
    state: LedgerState,
    strategy: AppendStrategy,
}

impl MessageLedger {
    pub fn new(strategy: AppendStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn ids(&self) -> Vec<&MessageId> {
        self.messages.iter().map(|message| &message.id).collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.ids.contains(message_id)
    }

    pub fn get(&self, message_id: &MessageId) -> Option<&Message> {
        if !self.contains(message_id) {
            return None;
        }
        self.messages.iter().find(|message| message.id == *message_id)
    }

    pub fn state(&self) -> &LedgerState {
        &self.state
    }

    pub fn strategy(&self) -> AppendStrategy {
        self.strategy
    }

    /// Replaces the contents wholesale, keeping the given order.
    ///
    /// A repeated id keeps its first occurrence.
    pub fn replace_all(&mut self, messages: Vec<Message>) {
        self.messages.clear();
        self.ids.clear();
        for message in messages {
            if self.ids.insert(message.id.clone()) {
                self.messages.push(message);
            } else {
                tracing::debug!(message_id = %message.id, "dropped repeated id in history");
            }
        }
    }

    pub fn append(&mut self, message: Message) -> AppendOutcome {
        if self.ids.contains(&message.id) {
            tracing::debug!(message_id = %message.id, "skipped duplicate append");
            return AppendOutcome::Duplicate;
        }

        self.ids.insert(message.id.clone());
        match self.strategy {
            AppendStrategy::Tail => {
                self.messages.push(message);
                AppendOutcome::Appended
            }
            AppendStrategy::Chronological => {
                let index = self
                    .messages
                    .partition_point(|existing| existing.created_at <= message.created_at);
                if index == self.messages.len() {
                    self.messages.push(message);
                    AppendOutcome::Appended
                } else {
                    self.messages.insert(index, message);
                    AppendOutcome::Inserted(index)
                }
            }
        }
    }

    /// Removes by id. Replies pointing at the removed message are left as they are.
    pub fn remove(&mut self, message_id: &MessageId) -> Option<RemovedMessage> {
        if !self.ids.remove(message_id) {
            return None;
        }

        let index = self
            .messages
            .iter()
            .position(|message| message.id == *message_id)?;
        let message = self.messages.remove(index);
        Some(RemovedMessage { index, message })
    }

    /// Puts a removed message back at its former position, clamped to the current length.
    ///
    /// Returns `false` when the id has reappeared in the meantime.
    pub fn restore(&mut self, removed: RemovedMessage) -> bool {
        if self.ids.contains(&removed.message.id) {
            return false;
        }

        let index = removed.index.min(self.messages.len());
        self.ids.insert(removed.message.id.clone());
        self.messages.insert(index, removed.message);
        true
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
    }

    /// Clears the contents and marks a fetch for `peer` in flight.
    pub fn begin_loading(&mut self, peer: UserId) {
        self.clear();
        self.state = LedgerState::Loading(peer);
    }

    pub fn mark_ready(&mut self, peer: UserId) {
        self.state = LedgerState::Ready(peer);
    }

    pub fn mark_failed(&mut self, peer: UserId, reason: impl Into<String>) {
        self.state = LedgerState::LoadFailed {
            peer,
            reason: reason.into(),
        };
    }

    pub fn mark_idle(&mut self) {
        self.state = LedgerState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn message(id: &str, at: i64) -> Message {
        Message {
            id: MessageId::new(id),
            sender_id: UserId::new("ana"),
            receiver_id: UserId::new("me"),
            text: Some(format!("text {id}")),
            image: None,
            created_at: Utc.timestamp_opt(at, 0).unwrap(),
            reply_to: None,
        }
    }

    fn ids(ledger: &MessageLedger) -> Vec<&str> {
        ledger.messages().iter().map(|message| message.id.as_str()).collect()
    }

    #[test]
    fn replace_all_keeps_gateway_order() {
        let mut ledger = MessageLedger::default();
        ledger.append(message("old", 1));
        ledger.replace_all(vec![message("m1", 30), message("m2", 10), message("m3", 20)]);
        assert_eq!(ids(&ledger), vec!["m1", "m2", "m3"]);
        assert!(!ledger.contains(&MessageId::new("old")));
    }

    #[test]
    fn replace_all_drops_repeated_ids() {
        let mut ledger = MessageLedger::default();
        ledger.replace_all(vec![message("m1", 1), message("m2", 2), message("m1", 3)]);
        assert_eq!(ids(&ledger), vec!["m1", "m2"]);
        assert_eq!(ledger.get(&MessageId::new("m1")).map(|m| m.created_at.timestamp()), Some(1));
    }

    #[test]
    fn repeated_appends_keep_each_id_once() {
        let mut ledger = MessageLedger::default();
        let sequence = ["m1", "m2", "m1", "m3", "m2", "m2", "m1"];
        for (offset, id) in sequence.iter().enumerate() {
            ledger.append(message(id, offset as i64));
        }
        assert_eq!(ids(&ledger), vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn tail_strategy_never_reorders() {
        let mut ledger = MessageLedger::new(AppendStrategy::Tail);
        ledger.append(message("late", 50));
        assert_eq!(ledger.append(message("early", 10)), AppendOutcome::Appended);
        assert_eq!(ids(&ledger), vec!["late", "early"]);
    }

    #[test]
    fn chronological_strategy_inserts_by_timestamp() {
        let mut ledger = MessageLedger::new(AppendStrategy::Chronological);
        ledger.append(message("m10", 10));
        ledger.append(message("m30", 30));
        assert_eq!(ledger.append(message("m20", 20)), AppendOutcome::Inserted(1));
        assert_eq!(ledger.append(message("m30b", 30)), AppendOutcome::Appended);
        assert_eq!(ledger.append(message("m20", 5)), AppendOutcome::Duplicate);
        assert_eq!(ids(&ledger), vec!["m10", "m20", "m30", "m30b"]);
    }

    #[test]
    fn remove_then_restore_returns_to_former_position() {
        let mut ledger = MessageLedger::default();
        ledger.replace_all(vec![message("m1", 1), message("m2", 2), message("m3", 3)]);

        let removed = ledger.remove(&MessageId::new("m2")).expect("present");
        assert_eq!(removed.index, 1);
        assert_eq!(ids(&ledger), vec!["m1", "m3"]);
        assert!(ledger.remove(&MessageId::new("m2")).is_none());

        assert!(ledger.restore(removed.clone()));
        assert_eq!(ids(&ledger), vec!["m1", "m2", "m3"]);
        assert!(!ledger.restore(removed));
    }

    #[test]
    fn restore_clamps_to_current_length() {
        let mut ledger = MessageLedger::default();
        ledger.replace_all(vec![message("m1", 1), message("m2", 2), message("m3", 3)]);
        let removed = ledger.remove(&MessageId::new("m3")).expect("present");
        ledger.remove(&MessageId::new("m2"));

        assert!(ledger.restore(removed));
        assert_eq!(ids(&ledger), vec!["m1", "m3"]);
    }

    #[test]
    fn begin_loading_clears_contents() {
        let mut ledger = MessageLedger::default();
        ledger.append(message("m1", 1));
        ledger.begin_loading(UserId::new("bo"));
        assert!(ledger.is_empty());
        assert!(ledger.state().is_loading());
        assert_eq!(ledger.state().peer(), Some(&UserId::new("bo")));
        assert!(ledger.append(message("m1", 1)).is_added());
    }
}
