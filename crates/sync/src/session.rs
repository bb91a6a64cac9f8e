use std::collections::HashSet;
use std::sync::Arc;

use snafu::{OptionExt, ResultExt, ensure};
use tether_gateway::{
    Draft, GatewayResult, Message, MessageId, Peer, PushChannel, RemoteGateway, SendRequest,
    UserId,
};

use super::directory::PeerDirectory;
use super::error::{
    ConversationLoadingSnafu, DeleteMessageSnafu, EmptyDraftSnafu, FetchHistorySnafu,
    LoadPartnersSnafu, NoConversationSelectedSnafu, SendMessageSnafu, SyncResult,
};
use super::ledger::{AppendOutcome, LedgerState, MessageLedger, RemovedMessage};
use super::reply::ReplyContext;
use super::selector::{ConversationSelector, Selection, SwitchTicket};
use super::settings::{AppendStrategy, DeleteFailurePolicy, SyncSettings};
use super::subscription::{PushDelivery, SubscriptionManager, SubscriptionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionOptions {
    pub delete_failure: DeleteFailurePolicy,
    pub append_strategy: AppendStrategy,
}

impl From<&SyncSettings> for SessionOptions {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            delete_failure: settings.delete_failure_policy,
            append_strategy: settings.append_strategy,
        }
    }
}

/// First half of a conversation switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchStart {
    Unchanged,
    Deselected,
    /// History for the ticket's peer must be fetched and handed to
    /// [`ChatSession::complete_switch`].
    Fetch(SwitchTicket),
}

impl SwitchStart {
    pub fn ticket(self) -> Option<SwitchTicket> {
        match self {
            Self::Fetch(ticket) => Some(ticket),
            Self::Unchanged | Self::Deselected => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchOutcome {
    Unchanged,
    Deselected,
    Loaded { peer: UserId, message_count: usize },
    /// The user moved on before the fetch finished; the result was discarded.
    Stale,
}

/// A reload whose fetch is in flight.
///
/// Remembers which messages the ledger held when it was issued, so messages added or removed
/// while the fetch runs survive the replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadTicket {
    pub switch: SwitchTicket,
    known: HashSet<MessageId>,
}

impl ReloadTicket {
    pub fn peer(&self) -> &UserId {
        &self.switch.peer
    }
}

/// What [`ChatSession::next_push`] merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushApplied {
    Message(AppendOutcome),
    Presence { online_count: usize },
}

impl PushApplied {
    pub fn is_added(self) -> bool {
        matches!(self, Self::Message(append) if append.is_added())
    }
}

/// A send whose gateway call is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub ticket: SwitchTicket,
    pub request: SendRequest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Committed {
        message: Message,
        append: AppendOutcome,
    },
    /// Persisted, but the conversation changed while the send was in flight.
    Detached { message: Message },
}

impl SendOutcome {
    pub fn message(&self) -> &Message {
        match self {
            Self::Committed { message, .. } | Self::Detached { message } => message,
        }
    }
}

/// A delete whose gateway call is in flight. The local removal already happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelete {
    pub message_id: MessageId,
    pub removed: Option<RemovedMessage>,
    pub ticket: Option<SwitchTicket>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Confirmed { removed_locally: bool },
}

/// One user's view of one active conversation.
///
/// All state changes go through `&mut self`. Every async operation has a `begin_*` /
/// `complete_*` pair so callers that drive the gateway themselves get the same stale-result
/// guards as the combined methods.
pub struct ChatSession {
    local_user: UserId,
    gateway: Arc<dyn RemoteGateway>,
    push: Arc<dyn PushChannel>,
    options: SessionOptions,
    selector: ConversationSelector,
    ledger: MessageLedger,
    reply: ReplyContext,
    subscription: SubscriptionManager,
    directory: PeerDirectory,
}

impl ChatSession {
    pub fn new(
        local_user: UserId,
        gateway: Arc<dyn RemoteGateway>,
        push: Arc<dyn PushChannel>,
        options: SessionOptions,
    ) -> Self {
        Self {
            local_user,
            gateway,
            push,
            options,
            selector: ConversationSelector::default(),
            ledger: MessageLedger::new(options.append_strategy),
            reply: ReplyContext::default(),
            subscription: SubscriptionManager::default(),
            directory: PeerDirectory::default(),
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }

    pub fn gateway(&self) -> &Arc<dyn RemoteGateway> {
        &self.gateway
    }

    pub fn selected_peer(&self) -> Option<&UserId> {
        self.selector.selected()
    }

    pub fn messages(&self) -> &[Message] {
        self.ledger.messages()
    }

    pub fn ledger(&self) -> &MessageLedger {
        &self.ledger
    }

    pub fn ledger_state(&self) -> &LedgerState {
        self.ledger.state()
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        self.subscription.state()
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    pub async fn load_partners(&mut self) -> SyncResult<&[Peer]> {
        self.directory.begin_load();
        let gateway = Arc::clone(&self.gateway);
        match gateway.list_conversation_partners().await {
            Ok(peers) => {
                let peers = peers
                    .into_iter()
                    .filter(|peer| peer.id != self.local_user)
                    .collect::<Vec<_>>();
                tracing::debug!(peer_count = peers.len(), "loaded conversation partners");
                self.directory.finish_load(Some(peers));
                Ok(self.directory.peers())
            }
            Err(source) => {
                tracing::warn!(error = %source, "failed to load conversation partners");
                self.directory.finish_load(None);
                Err(source).context(LoadPartnersSnafu {
                    stage: "load-partners",
                })
            }
        }
    }

    /// Switches to `peer` and loads its history.
    pub async fn select(&mut self, peer: Option<UserId>) -> SyncResult<SwitchOutcome> {
        let ticket = match self.begin_switch(peer) {
            SwitchStart::Unchanged => return Ok(SwitchOutcome::Unchanged),
            SwitchStart::Deselected => return Ok(SwitchOutcome::Deselected),
            SwitchStart::Fetch(ticket) => ticket,
        };

        let gateway = Arc::clone(&self.gateway);
        let result = gateway.fetch_history(&ticket.peer).await;
        self.complete_switch(ticket, result)
    }

    /// Applies the synchronous part of a switch: the old listener is released before any
    /// fetch for the new peer can be issued.
    pub fn begin_switch(&mut self, peer: Option<UserId>) -> SwitchStart {
        let Selection::Changed {
            previous,
            current,
            generation,
        } = self.selector.select(peer)
        else {
            return SwitchStart::Unchanged;
        };

        self.subscription.unbind();
        self.reply.clear();

        match current {
            None => {
                tracing::debug!(previous = ?previous, "conversation deselected");
                self.ledger.mark_idle();
                SwitchStart::Deselected
            }
            Some(peer) => {
                tracing::debug!(
                    previous = ?previous,
                    peer_id = %peer,
                    generation = generation.0,
                    "conversation switch started"
                );
                self.ledger.begin_loading(peer.clone());
                SwitchStart::Fetch(SwitchTicket { peer, generation })
            }
        }
    }

    pub fn complete_switch(
        &mut self,
        ticket: SwitchTicket,
        result: GatewayResult<Vec<Message>>,
    ) -> SyncResult<SwitchOutcome> {
        if !self.selector.is_current(&ticket) {
            tracing::warn!(
                peer_id = %ticket.peer,
                generation = ticket.generation.0,
                "discarded stale history fetch"
            );
            return Ok(SwitchOutcome::Stale);
        }

        let messages = match result {
            Ok(messages) => messages,
            Err(source) => {
                tracing::warn!(peer_id = %ticket.peer, error = %source, "history fetch failed");
                self.ledger.mark_failed(ticket.peer.clone(), source.to_string());
                return Err(source).context(FetchHistorySnafu {
                    stage: "complete-switch",
                    peer: ticket.peer,
                });
            }
        };

        // Bind before installing so a refused registration never leaves a ready ledger.
        if let Err(error) = self
            .subscription
            .bind(ticket.peer.clone(), self.push.as_ref())
        {
            tracing::warn!(peer_id = %ticket.peer, error = %error, "push subscription failed");
            self.ledger.mark_failed(ticket.peer.clone(), error.to_string());
            return Err(error);
        }

        let message_count = self.install_history(&ticket.peer, messages);
        tracing::info!(
            peer_id = %ticket.peer,
            generation = ticket.generation.0,
            message_count,
            "conversation switched"
        );
        Ok(SwitchOutcome::Loaded {
            peer: ticket.peer,
            message_count,
        })
    }

    /// Refetches the selected conversation. On failure the current contents stay.
    pub async fn reload(&mut self) -> SyncResult<SwitchOutcome> {
        let ticket = self.begin_reload()?;
        let gateway = Arc::clone(&self.gateway);
        let result = gateway.fetch_history(ticket.peer()).await;
        self.complete_reload(ticket, result)
    }

    pub fn begin_reload(&self) -> SyncResult<ReloadTicket> {
        let switch = self
            .selector
            .ticket_for_current()
            .context(NoConversationSelectedSnafu {
                stage: "begin-reload",
            })?;
        let known = self.ledger.ids().into_iter().cloned().collect();
        Ok(ReloadTicket { switch, known })
    }

    /// Installs a reloaded history.
    ///
    /// Messages that arrived after [`Self::begin_reload`] and are missing from the fetch are
    /// appended again. Messages removed locally in that window stay removed.
    pub fn complete_reload(
        &mut self,
        ticket: ReloadTicket,
        result: GatewayResult<Vec<Message>>,
    ) -> SyncResult<SwitchOutcome> {
        let ReloadTicket {
            switch: ticket,
            known,
        } = ticket;
        if !self.selector.is_current(&ticket) {
            tracing::warn!(peer_id = %ticket.peer, "discarded stale history reload");
            return Ok(SwitchOutcome::Stale);
        }

        let messages = match result {
            Ok(messages) => messages,
            Err(source) => {
                tracing::warn!(peer_id = %ticket.peer, error = %source, "history reload failed");
                return Err(source).context(FetchHistorySnafu {
                    stage: "complete-reload",
                    peer: ticket.peer,
                });
            }
        };

        if self.subscription.bound_peer() != Some(&ticket.peer) {
            self.subscription
                .bind(ticket.peer.clone(), self.push.as_ref())?;
        }

        let arrived = self
            .ledger
            .messages()
            .iter()
            .filter(|message| !known.contains(&message.id))
            .cloned()
            .collect::<Vec<_>>();
        let removed = known
            .into_iter()
            .filter(|message_id| !self.ledger.contains(message_id))
            .collect::<HashSet<_>>();
        let messages = messages
            .into_iter()
            .filter(|message| !removed.contains(&message.id))
            .collect();

        self.install_history(&ticket.peer, messages);
        let mut kept = 0;
        for message in arrived {
            if self.ledger.append(message).is_added() {
                kept += 1;
            }
        }
        let message_count = self.ledger.len();
        tracing::info!(
            peer_id = %ticket.peer,
            message_count,
            kept_arrivals = kept,
            "conversation reloaded"
        );
        Ok(SwitchOutcome::Loaded {
            peer: ticket.peer,
            message_count,
        })
    }

    fn install_history(&mut self, peer: &UserId, messages: Vec<Message>) -> usize {
        let received = messages.len();
        let messages = messages
            .into_iter()
            .filter(|message| message.is_between(&self.local_user, peer))
            .collect::<Vec<_>>();
        if messages.len() < received {
            tracing::debug!(
                peer_id = %peer,
                dropped = received - messages.len(),
                "dropped history entries from other conversations"
            );
        }

        self.ledger.replace_all(messages);
        self.ledger.mark_ready(peer.clone());
        self.ledger.len()
    }

    /// Merges every push event already delivered. Returns how many messages were added.
    ///
    /// Presence snapshots update the directory.
    pub fn pump_push(&mut self) -> usize {
        let mut added = 0;
        for delivery in self.subscription.drain_ready() {
            if self.apply_delivery(delivery).is_added() {
                added += 1;
            }
        }
        added
    }

    /// Waits for the next push event for the selected conversation and merges it.
    ///
    /// Returns `None` while unbound or once the push channel closes.
    pub async fn next_push(&mut self) -> Option<PushApplied> {
        let delivery = self.subscription.next_accepted().await?;
        Some(self.apply_delivery(delivery))
    }

    fn apply_delivery(&mut self, delivery: PushDelivery) -> PushApplied {
        match delivery {
            PushDelivery::Message(message) => PushApplied::Message(self.ledger.append(message)),
            PushDelivery::Presence(users) => {
                let local_user = &self.local_user;
                self.directory
                    .set_online(users.into_iter().filter(|user| user != local_user));
                let online_count = self.directory.online_count();
                tracing::debug!(online_count, "presence updated");
                PushApplied::Presence { online_count }
            }
        }
    }

    pub fn set_reply_target(&mut self, target: Option<Message>) {
        self.reply.set(target);
    }

    pub fn reply_target(&self) -> Option<&Message> {
        self.reply.current()
    }

    pub fn consume_reply_target(&mut self) -> Option<Message> {
        self.reply.consume()
    }

    pub async fn send(&mut self, draft: Draft) -> SyncResult<SendOutcome> {
        let pending = self.begin_send(draft)?;
        let gateway = Arc::clone(&self.gateway);
        let result = gateway
            .send_message(&pending.ticket.peer, pending.request.clone())
            .await;
        self.complete_send(pending, result)
    }

    /// Packages the draft with the current reply target. The target is not consumed yet.
    ///
    /// Refused while the conversation's history is still loading.
    pub fn begin_send(&self, draft: Draft) -> SyncResult<PendingSend> {
        let ticket = self
            .selector
            .ticket_for_current()
            .context(NoConversationSelectedSnafu {
                stage: "begin-send",
            })?;
        ensure!(
            !self.ledger.state().is_loading(),
            ConversationLoadingSnafu {
                stage: "begin-send",
                peer: ticket.peer.clone(),
            }
        );
        let draft = draft.normalized();
        ensure!(
            !draft.is_empty(),
            EmptyDraftSnafu {
                stage: "begin-send"
            }
        );

        Ok(PendingSend {
            ticket,
            request: SendRequest::new(draft, self.reply.current_id().cloned()),
        })
    }

    pub fn complete_send(
        &mut self,
        pending: PendingSend,
        result: GatewayResult<Message>,
    ) -> SyncResult<SendOutcome> {
        let message = match result {
            Ok(message) => message,
            Err(source) => {
                tracing::warn!(peer_id = %pending.ticket.peer, error = %source, "send failed");
                return Err(source).context(SendMessageSnafu {
                    stage: "complete-send",
                    peer: pending.ticket.peer,
                });
            }
        };

        // Only the target the send was built with is consumed.
        if pending.request.reply_to.is_some()
            && self.reply.current_id() == pending.request.reply_to.as_ref()
        {
            self.reply.consume();
        }

        if !self.selector.is_current(&pending.ticket) {
            tracing::debug!(
                peer_id = %pending.ticket.peer,
                message_id = %message.id,
                "send completed after conversation switch"
            );
            return Ok(SendOutcome::Detached { message });
        }

        let append = self.ledger.append(message.clone());
        Ok(SendOutcome::Committed { message, append })
    }

    pub async fn delete_message(&mut self, message_id: MessageId) -> SyncResult<DeleteOutcome> {
        let pending = self.begin_delete(message_id);
        let gateway = Arc::clone(&self.gateway);
        let result = gateway.delete_message(&pending.message_id).await;
        self.complete_delete(pending, result)
    }

    /// Removes the message locally before the gateway confirms.
    ///
    /// An id missing from the ledger is still sent to the gateway.
    pub fn begin_delete(&mut self, message_id: MessageId) -> PendingDelete {
        let removed = self.ledger.remove(&message_id);
        if removed.is_none() {
            tracing::debug!(message_id = %message_id, "deleting message not present locally");
        }

        PendingDelete {
            message_id,
            removed,
            ticket: self.selector.ticket_for_current(),
        }
    }

    pub fn complete_delete(
        &mut self,
        pending: PendingDelete,
        result: GatewayResult<()>,
    ) -> SyncResult<DeleteOutcome> {
        let PendingDelete {
            message_id,
            removed,
            ticket,
        } = pending;

        let Err(source) = result else {
            return Ok(DeleteOutcome::Confirmed {
                removed_locally: removed.is_some(),
            });
        };

        let still_current = ticket
            .as_ref()
            .is_some_and(|ticket| self.selector.is_current(ticket));
        let restored = match (self.options.delete_failure, removed) {
            (DeleteFailurePolicy::Restore, Some(removed)) if still_current => {
                self.ledger.restore(removed)
            }
            _ => false,
        };

        tracing::warn!(
            message_id = %message_id,
            restored,
            error = %source,
            "delete failed"
        );
        Err(source).context(DeleteMessageSnafu {
            stage: "complete-delete",
            message_id,
            restored,
        })
    }

    /// Releases the push listener. The session can still be used afterwards.
    pub fn close(&mut self) {
        if self.subscription.unbind() {
            tracing::debug!("chat session closed");
        }
    }
}
