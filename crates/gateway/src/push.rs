use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use super::error::GatewayResult;
use super::types::PushEvent;

pub const DEFAULT_PUSH_CAPACITY: usize = 256;

/// Session-wide source of push notifications.
///
/// Implementations are not scoped per conversation: every registration observes every event
/// published after it was created. Demultiplexing is the caller's job.
pub trait PushChannel: Send + Sync {
    fn register(&self) -> GatewayResult<PushRegistration>;
}

/// One live listener on a push channel.
///
/// Dropping the registration releases the listener slot on the channel.
pub struct PushRegistration {
    id: u64,
    events: broadcast::Receiver<PushEvent>,
}

impl PushRegistration {
    pub fn new(id: u64, events: broadcast::Receiver<PushEvent>) -> Self {
        Self { id, events }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the next event. Returns `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<PushEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        registration_id = self.id,
                        skipped,
                        "push listener lagged behind; notifications were dropped"
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next already-delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<PushEvent> {
        loop {
            match self.events.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        registration_id = self.id,
                        skipped,
                        "push listener lagged behind; notifications were dropped"
                    );
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

impl std::fmt::Debug for PushRegistration {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("PushRegistration")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// In-process fan-out for push notifications.
///
/// A transport adapter (or the in-memory backend) publishes decoded events here, and every
/// live [`PushRegistration`] receives them.
#[derive(Clone)]
pub struct PushHub {
    sender: broadcast::Sender<PushEvent>,
    next_registration_id: Arc<AtomicU64>,
}

impl Default for PushHub {
    fn default() -> Self {
        Self::new(DEFAULT_PUSH_CAPACITY)
    }
}

impl PushHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            next_registration_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Delivers an event to every live registration and returns how many received it.
    pub fn publish(&self, event: PushEvent) -> usize {
        match self.sender.send(event) {
            Ok(delivered) => delivered,
            Err(_) => {
                tracing::debug!("push event published with no registered listener");
                0
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl PushChannel for PushHub {
    fn register(&self) -> GatewayResult<PushRegistration> {
        let id = self.next_registration_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(registration_id = id, "push listener registered");
        Ok(PushRegistration::new(id, self.sender.subscribe()))
    }
}
