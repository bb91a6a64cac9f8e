use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, TimeZone, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use snafu::ensure;
use tokio::sync::Semaphore;

use super::RemoteGateway;
use super::error::{GatewayResult, PushClosedSnafu, RejectedSnafu, StatusSnafu};
use super::ids::{MessageId, UserId};
use super::push::{PushChannel, PushHub, PushRegistration};
use super::types::{Message, Peer, PushEvent, ReplySnapshot, SendRequest};

const BASE_TIMESTAMP_SECS: i64 = 1_700_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayCall {
    ListPartners,
    FetchHistory,
    SendMessage,
    DeleteMessage,
}

impl GatewayCall {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ListPartners => "list-partners",
            Self::FetchHistory => "fetch-history",
            Self::SendMessage => "send-message",
            Self::DeleteMessage => "delete-message",
        }
    }
}

/// Holds calls of one kind until released.
///
/// Each [`CallGate::release_one`] lets exactly one waiting (or future) call through;
/// [`CallGate::open`] lets every current and future call through.
#[derive(Debug, Clone)]
pub struct CallGate {
    call: GatewayCall,
    permits: Arc<Semaphore>,
}

impl CallGate {
    pub fn call(&self) -> GatewayCall {
        self.call
    }

    pub fn release_one(&self) {
        self.permits.add_permits(1);
    }

    pub fn open(&self) {
        self.permits.close();
    }
}

#[derive(Default)]
struct MemoryState {
    peers: Vec<Peer>,
    messages: Vec<Message>,
    next_sequence: u64,
    calls: HashMap<GatewayCall, usize>,
    failures: HashMap<GatewayCall, VecDeque<String>>,
    gates: HashMap<GatewayCall, Arc<Semaphore>>,
}

impl MemoryState {
    fn next_stamp(&mut self) -> (MessageId, DateTime<Utc>) {
        self.next_sequence += 1;
        let sequence = self.next_sequence;
        let offset = i64::try_from(sequence).unwrap_or(i64::MAX - BASE_TIMESTAMP_SECS);
        let created_at = Utc
            .timestamp_opt(BASE_TIMESTAMP_SECS.saturating_add(offset), 0)
            .single()
            .unwrap_or_else(Utc::now);
        (MessageId::new(format!("m{sequence}")), created_at)
    }

    fn find(&self, message_id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == *message_id)
    }

    fn resolve_reply(&self, snapshot: &ReplySnapshot) -> ReplySnapshot {
        match self.find(&snapshot.message_id) {
            Some(target) => ReplySnapshot::of(target),
            None => ReplySnapshot::unresolved(snapshot.message_id.clone()),
        }
    }
}

/// In-process messaging backend with the same observable contract as the REST gateway.
///
/// Every stored message is visible to [`RemoteGateway::fetch_history`]; new messages are
/// fanned out on an embedded [`PushHub`]. Calls can be held with [`MemoryGateway::hold`]
/// or failed with [`MemoryGateway::fail_next`] to reproduce slow or flaky backends.
pub struct MemoryGateway {
    local_user: UserId,
    hub: PushHub,
    state: Mutex<MemoryState>,
    echo_sends: AtomicBool,
    push_connected: AtomicBool,
}

impl MemoryGateway {
    pub fn new(local_user: impl Into<UserId>) -> Self {
        Self {
            local_user: local_user.into(),
            hub: PushHub::default(),
            state: Mutex::new(MemoryState::default()),
            echo_sends: AtomicBool::new(true),
            push_connected: AtomicBool::new(true),
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn push_hub(&self) -> &PushHub {
        &self.hub
    }

    /// Whether a successful send is also announced on the push channel.
    pub fn set_echo_sends(&self, echo: bool) {
        self.echo_sends.store(echo, Ordering::Relaxed);
    }

    /// Simulates the push connection going away; new registrations fail until reconnected.
    pub fn set_push_connected(&self, connected: bool) {
        self.push_connected.store(connected, Ordering::Relaxed);
    }

    pub fn seed_peer(&self, peer: Peer) {
        let mut state = self.state();
        state.peers.retain(|existing| existing.id != peer.id);
        state.peers.push(peer);
    }

    /// Stores a message without announcing it.
    pub fn seed_message(
        &self,
        sender: impl Into<UserId>,
        receiver: impl Into<UserId>,
        text: impl Into<String>,
    ) -> Message {
        let mut state = self.state();
        let (id, created_at) = state.next_stamp();
        let message = Message {
            id,
            sender_id: sender.into(),
            receiver_id: receiver.into(),
            text: Some(text.into()),
            image: None,
            created_at,
            reply_to: None,
        };
        state.messages.push(message.clone());
        message
    }

    /// Stores a message and announces it on the push channel, as another client sending would.
    pub fn inject_incoming(
        &self,
        sender: impl Into<UserId>,
        receiver: impl Into<UserId>,
        text: impl Into<String>,
    ) -> Message {
        let message = self.seed_message(sender, receiver, text);
        self.hub.publish(PushEvent::NewMessage(message.clone()));
        message
    }

    /// Announces an already stored message again. Returns how many listeners received it.
    pub fn redeliver(&self, message_id: &MessageId) -> usize {
        let message = self.state().find(message_id).cloned();
        match message {
            Some(message) => self.hub.publish(PushEvent::NewMessage(message)),
            None => 0,
        }
    }

    /// Publishes the set of connected users. Returns how many listeners received it.
    pub fn announce_online<I>(&self, users: I) -> usize
    where
        I: IntoIterator,
        I::Item: Into<UserId>,
    {
        let users = users.into_iter().map(Into::into).collect();
        self.hub.publish(PushEvent::OnlineUsers(users))
    }

    pub fn stored_ids(&self) -> Vec<MessageId> {
        self.state()
            .messages
            .iter()
            .map(|message| message.id.clone())
            .collect()
    }

    /// Number of calls of this kind issued so far, including ones still held.
    pub fn calls(&self, call: GatewayCall) -> usize {
        self.state().calls.get(&call).copied().unwrap_or(0)
    }

    /// Makes the next call of this kind fail with `reason` once it is released.
    pub fn fail_next(&self, call: GatewayCall, reason: impl Into<String>) {
        self.state()
            .failures
            .entry(call)
            .or_default()
            .push_back(reason.into());
    }

    /// Holds calls of this kind until the returned gate releases them.
    pub fn hold(&self, call: GatewayCall) -> CallGate {
        let permits = Arc::new(Semaphore::new(0));
        self.state().gates.insert(call, Arc::clone(&permits));
        CallGate { call, permits }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn enter(&self, call: GatewayCall) -> GatewayResult<()> {
        let gate = {
            let mut state = self.state();
            *state.calls.entry(call).or_default() += 1;
            state.gates.get(&call).cloned()
        };

        if let Some(gate) = gate {
            tracing::debug!(call = call.as_str(), "memory gateway call held");
            // A closed gate means it was opened for good.
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let failure = self
            .state()
            .failures
            .get_mut(&call)
            .and_then(VecDeque::pop_front);
        if let Some(reason) = failure {
            tracing::debug!(call = call.as_str(), %reason, "memory gateway call failing");
            return RejectedSnafu {
                stage: call.as_str(),
                reason,
            }
            .fail();
        }

        Ok(())
    }

    async fn partners(&self) -> GatewayResult<Vec<Peer>> {
        self.enter(GatewayCall::ListPartners).await?;
        let state = self.state();
        Ok(state
            .peers
            .iter()
            .filter(|peer| peer.id != self.local_user)
            .cloned()
            .collect())
    }

    async fn history(&self, peer_id: &UserId) -> GatewayResult<Vec<Message>> {
        self.enter(GatewayCall::FetchHistory).await?;
        let state = self.state();
        Ok(state
            .messages
            .iter()
            .filter(|message| message.is_between(&self.local_user, peer_id))
            .map(|message| {
                let mut message = message.clone();
                message.reply_to = message
                    .reply_to
                    .as_ref()
                    .map(|snapshot| state.resolve_reply(snapshot));
                message
            })
            .collect())
    }

    async fn send(&self, peer_id: &UserId, request: SendRequest) -> GatewayResult<Message> {
        self.enter(GatewayCall::SendMessage).await?;
        ensure!(
            request.text.is_some() || request.image.is_some(),
            StatusSnafu {
                stage: GatewayCall::SendMessage.as_str(),
                status: 400_u16,
                message: "Message must contain text or an image",
            }
        );

        let message = {
            let mut state = self.state();
            let (id, created_at) = state.next_stamp();
            let reply_to = request.reply_to.map(|target| {
                state.resolve_reply(&ReplySnapshot::unresolved(target))
            });
            let message = Message {
                id,
                sender_id: self.local_user.clone(),
                receiver_id: peer_id.clone(),
                text: request.text,
                image: request.image,
                created_at,
                reply_to,
            };
            state.messages.push(message.clone());
            message
        };

        if self.echo_sends.load(Ordering::Relaxed) {
            self.hub.publish(PushEvent::NewMessage(message.clone()));
        }
        Ok(message)
    }

    async fn delete(&self, message_id: &MessageId) -> GatewayResult<()> {
        self.enter(GatewayCall::DeleteMessage).await?;
        let mut state = self.state();
        let before = state.messages.len();
        state.messages.retain(|message| message.id != *message_id);
        ensure!(
            state.messages.len() < before,
            StatusSnafu {
                stage: GatewayCall::DeleteMessage.as_str(),
                status: 404_u16,
                message: "Message not found",
            }
        );
        Ok(())
    }
}

impl RemoteGateway for MemoryGateway {
    fn list_conversation_partners<'a>(&'a self) -> BoxFuture<'a, GatewayResult<Vec<Peer>>> {
        self.partners().boxed()
    }

    fn fetch_history<'a>(
        &'a self,
        peer_id: &'a UserId,
    ) -> BoxFuture<'a, GatewayResult<Vec<Message>>> {
        self.history(peer_id).boxed()
    }

    fn send_message<'a>(
        &'a self,
        peer_id: &'a UserId,
        request: SendRequest,
    ) -> BoxFuture<'a, GatewayResult<Message>> {
        self.send(peer_id, request).boxed()
    }

    fn delete_message<'a>(&'a self, message_id: &'a MessageId) -> BoxFuture<'a, GatewayResult<()>> {
        self.delete(message_id).boxed()
    }
}

impl PushChannel for MemoryGateway {
    fn register(&self) -> GatewayResult<PushRegistration> {
        ensure!(
            self.push_connected.load(Ordering::Relaxed),
            PushClosedSnafu {
                stage: "register-push-listener",
            }
        );
        self.hub.register()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::types::Draft;

    fn gateway() -> MemoryGateway {
        let gateway = MemoryGateway::new("me");
        gateway.seed_peer(Peer::new("me", "Me"));
        gateway.seed_peer(Peer::new("ana", "Ana"));
        gateway.seed_peer(Peer::new("bo", "Bo"));
        gateway
    }

    #[tokio::test]
    async fn history_is_scoped_to_the_pair_and_ordered() {
        let gateway = gateway();
        let first = gateway.seed_message("ana", "me", "hi");
        gateway.seed_message("bo", "me", "other conversation");
        let second = gateway.seed_message("me", "ana", "hello");

        let history = gateway
            .fetch_history(&UserId::new("ana"))
            .await
            .expect("history");
        let ids: Vec<_> = history.iter().map(|message| message.id.clone()).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert!(history[0].created_at < history[1].created_at);
    }

    #[tokio::test]
    async fn partners_exclude_local_user() {
        let partners = gateway()
            .list_conversation_partners()
            .await
            .expect("partners");
        let names: Vec<_> = partners.iter().map(|peer| peer.full_name.as_str()).collect();
        assert_eq!(names, vec!["Ana", "Bo"]);
    }

    #[tokio::test]
    async fn send_populates_reply_and_echoes_on_push() {
        let gateway = gateway();
        let original = gateway.seed_message("ana", "me", "lunch?");
        let mut registration = gateway.register().expect("register");

        let sent = gateway
            .send_message(
                &UserId::new("ana"),
                SendRequest::new(Draft::text("sure"), Some(original.id.clone())),
            )
            .await
            .expect("send");

        let snapshot = sent.reply_to.as_ref().expect("reply snapshot");
        assert_eq!(snapshot.message_id, original.id);
        assert_eq!(snapshot.text.as_deref(), Some("lunch?"));
        assert_eq!(
            registration.try_recv(),
            Some(PushEvent::NewMessage(sent.clone()))
        );
    }

    #[tokio::test]
    async fn reply_to_deleted_message_dangles_on_read() {
        let gateway = gateway();
        let original = gateway.seed_message("ana", "me", "lunch?");
        gateway
            .send_message(
                &UserId::new("ana"),
                SendRequest::new(Draft::text("sure"), Some(original.id.clone())),
            )
            .await
            .expect("send");
        gateway.delete_message(&original.id).await.expect("delete");

        let history = gateway
            .fetch_history(&UserId::new("ana"))
            .await
            .expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(
            history[0].reply_to,
            Some(ReplySnapshot::unresolved(original.id))
        );
    }

    #[tokio::test]
    async fn deleting_unknown_message_is_not_found() {
        let error = gateway()
            .delete_message(&MessageId::new("missing"))
            .await
            .expect_err("missing message");
        assert_eq!(error.status(), Some(404));
    }

    #[tokio::test]
    async fn scripted_failure_applies_once() {
        let gateway = gateway();
        gateway.fail_next(GatewayCall::FetchHistory, "backend down");

        let error = gateway
            .fetch_history(&UserId::new("ana"))
            .await
            .expect_err("scripted failure");
        assert!(matches!(error, GatewayError::Rejected { .. }));
        assert!(gateway.fetch_history(&UserId::new("ana")).await.is_ok());
        assert_eq!(gateway.calls(GatewayCall::FetchHistory), 2);
    }

    #[tokio::test]
    async fn held_call_waits_for_release() {
        let gateway = gateway();
        let gate = gateway.hold(GatewayCall::ListPartners);
        let peer = UserId::new("ana");

        let mut pending = gateway.list_conversation_partners();
        assert!((&mut pending).now_or_never().is_none());
        assert_eq!(gateway.calls(GatewayCall::ListPartners), 1);

        gate.release_one();
        assert!(pending.await.is_ok());

        gate.open();
        assert!(gateway.fetch_history(&peer).await.is_ok());
        assert!(gateway.list_conversation_partners().await.is_ok());
    }

    #[test]
    fn disconnected_push_refuses_registration() {
        let gateway = gateway();
        gateway.set_push_connected(false);
        assert!(matches!(
            gateway.register(),
            Err(GatewayError::PushClosed { .. })
        ));
    }

    #[test]
    fn announced_presence_reaches_registered_listeners() {
        let gateway = gateway();
        assert_eq!(gateway.announce_online(["ana"]), 0);

        let mut registration = gateway.register().expect("register");
        assert_eq!(gateway.announce_online(["ana", "me"]), 1);
        assert_eq!(
            registration.try_recv(),
            Some(PushEvent::OnlineUsers(vec![UserId::new("ana"), UserId::new("me")]))
        );
    }
}
