use snafu::ResultExt;
use tether_gateway::{Message, PushChannel, PushEvent, PushRegistration, UserId};

use super::error::{SubscribeSnafu, SyncResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    Unbound,
    Bound(UserId),
}

/// An event accepted by the bound listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushDelivery {
    /// A message for the bound conversation.
    Message(Message),
    /// Presence snapshot. Not tied to any conversation, so it always passes the filter.
    Presence(Vec<UserId>),
}

#[derive(Debug)]
struct Binding {
    peer: UserId,
    registration: PushRegistration,
}

/// Sole owner of the push registration, filtered to one peer at a time.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    binding: Option<Binding>,
}

impl SubscriptionManager {
    pub fn state(&self) -> SubscriptionState {
        match &self.binding {
            Some(binding) => SubscriptionState::Bound(binding.peer.clone()),
            None => SubscriptionState::Unbound,
        }
    }

    pub fn bound_peer(&self) -> Option<&UserId> {
        self.binding.as_ref().map(|binding| &binding.peer)
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    /// Binds to `peer`, releasing any previous registration first.
    ///
    /// On failure the manager stays unbound.
    pub fn bind(&mut self, peer: UserId, channel: &dyn PushChannel) -> SyncResult<()> {
        self.unbind();
        let registration = channel.register().context(SubscribeSnafu {
            stage: "register-push-listener",
            peer: peer.clone(),
        })?;
        tracing::debug!(
            peer_id = %peer,
            registration_id = registration.id(),
            "push listener bound"
        );
        self.binding = Some(Binding { peer, registration });
        Ok(())
    }

    /// Releases the registration. Returns whether anything was bound.
    pub fn unbind(&mut self) -> bool {
        match self.binding.take() {
            Some(binding) => {
                tracing::debug!(
                    peer_id = %binding.peer,
                    registration_id = binding.registration.id(),
                    "push listener unbound"
                );
                true
            }
            None => false,
        }
    }

    pub fn accepts(&self, message: &Message) -> bool {
        self.binding
            .as_ref()
            .is_some_and(|binding| binding.accepts(message))
    }

    /// Drains every already-delivered event and returns the ones for the bound peer.
    pub fn drain_ready(&mut self) -> Vec<PushDelivery> {
        let Some(binding) = self.binding.as_mut() else {
            return Vec::new();
        };

        let mut accepted = Vec::new();
        while let Some(event) = binding.registration.try_recv() {
            if let Some(delivery) = binding.filter(event) {
                accepted.push(delivery);
            }
        }
        accepted
    }

    /// Waits for the next event for the bound peer.
    ///
    /// Returns `None` when unbound or when the channel closes.
    pub async fn next_accepted(&mut self) -> Option<PushDelivery> {
        let binding = self.binding.as_mut()?;
        loop {
            let event = binding.registration.recv().await?;
            if let Some(delivery) = binding.filter(event) {
                return Some(delivery);
            }
        }
    }
}

impl Binding {
    fn accepts(&self, message: &Message) -> bool {
        message.sender_id == self.peer || message.receiver_id == self.peer
    }

    fn filter(&self, event: PushEvent) -> Option<PushDelivery> {
        let message = match event {
            PushEvent::NewMessage(message) => message,
            PushEvent::OnlineUsers(users) => return Some(PushDelivery::Presence(users)),
        };
        if self.accepts(&message) {
            return Some(PushDelivery::Message(message));
        }

        tracing::debug!(
            peer_id = %self.peer,
            message_id = %message.id,
            sender_id = %message.sender_id,
            receiver_id = %message.receiver_id,
            "dropped push event for another conversation"
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use tether_gateway::{MessageId, PushHub};

    use super::*;

    fn push(id: &str, sender: &str, receiver: &str) -> PushEvent {
        PushEvent::NewMessage(Message {
            id: MessageId::new(id),
            sender_id: UserId::new(sender),
            receiver_id: UserId::new(receiver),
            text: Some("hey".to_string()),
            image: None,
            created_at: Utc.timestamp_opt(1, 0).unwrap(),
            reply_to: None,
        })
    }

    #[test]
    fn bind_replaces_previous_registration() {
        let hub = PushHub::default();
        let mut manager = SubscriptionManager::default();

        manager.bind(UserId::new("ana"), &hub).expect("bind");
        manager.bind(UserId::new("bo"), &hub).expect("rebind");
        assert_eq!(hub.listener_count(), 1);
        assert_eq!(manager.state(), SubscriptionState::Bound(UserId::new("bo")));
    }

    #[test]
    fn unbind_is_idempotent() {
        let hub = PushHub::default();
        let mut manager = SubscriptionManager::default();
        assert!(!manager.unbind());

        manager.bind(UserId::new("ana"), &hub).expect("bind");
        assert!(manager.unbind());
        assert!(!manager.unbind());
        assert_eq!(manager.state(), SubscriptionState::Unbound);
        assert_eq!(hub.listener_count(), 0);
    }

    #[test]
    fn only_events_for_bound_peer_are_forwarded() {
        let hub = PushHub::default();
        let mut manager = SubscriptionManager::default();
        manager.bind(UserId::new("ana"), &hub).expect("bind");

        hub.publish(push("m1", "ana", "me"));
        hub.publish(push("m2", "carol", "dave"));
        hub.publish(push("m3", "me", "ana"));
        hub.publish(push("m4", "bo", "me"));

        let ids: Vec<_> = manager
            .drain_ready()
            .into_iter()
            .filter_map(|delivery| match delivery {
                PushDelivery::Message(message) => Some(message.id),
                PushDelivery::Presence(_) => None,
            })
            .collect();
        assert_eq!(ids, vec![MessageId::new("m1"), MessageId::new("m3")]);
        assert!(manager.drain_ready().is_empty());
    }

    #[test]
    fn unbound_manager_accepts_nothing() {
        let hub = PushHub::default();
        let mut manager = SubscriptionManager::default();
        hub.publish(push("m1", "ana", "me"));
        assert!(manager.drain_ready().is_empty());

        let message = match push("m2", "ana", "me") {
            PushEvent::NewMessage(message) => message,
            other => panic!("expected a message event, got {other:?}"),
        };
        assert!(!manager.accepts(&message));
    }

    #[tokio::test]
    async fn next_accepted_skips_foreign_events() {
        let hub = PushHub::default();
        let mut manager = SubscriptionManager::default();
        manager.bind(UserId::new("ana"), &hub).expect("bind");

        hub.publish(push("m1", "carol", "me"));
        hub.publish(push("m2", "ana", "me"));

        let delivery = manager.next_accepted().await.expect("accepted event");
        assert!(matches!(
            delivery,
            PushDelivery::Message(message) if message.id == MessageId::new("m2")
        ));
    }

    #[test]
    fn presence_passes_filter_for_any_bound_peer() {
        let hub = PushHub::default();
        let mut manager = SubscriptionManager::default();
        manager.bind(UserId::new("ana"), &hub).expect("bind");

        hub.publish(push("m1", "carol", "dave"));
        hub.publish(PushEvent::OnlineUsers(vec![UserId::new("bo"), UserId::new("carol")]));

        assert_eq!(
            manager.drain_ready(),
            vec![PushDelivery::Presence(vec![
                UserId::new("bo"),
                UserId::new("carol")
            ])]
        );
    }
}
