use snafu::Snafu;
use tether_gateway::{GatewayError, MessageId, UserId};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SyncError {
    #[snafu(display("failed to load conversation partners on `{stage}`: {source}"))]
    LoadPartners {
        stage: &'static str,
        source: GatewayError,
    },
    #[snafu(display("failed to fetch history with {peer} on `{stage}`: {source}"))]
    FetchHistory {
        stage: &'static str,
        peer: UserId,
        source: GatewayError,
    },
    #[snafu(display("failed to send message to {peer} on `{stage}`: {source}"))]
    SendMessage {
        stage: &'static str,
        peer: UserId,
        source: GatewayError,
    },
    #[snafu(display(
        "failed to delete message {message_id} on `{stage}` (restored locally: {restored}): {source}"
    ))]
    DeleteMessage {
        stage: &'static str,
        message_id: MessageId,
        restored: bool,
        source: GatewayError,
    },
    #[snafu(display("failed to subscribe to pushes for {peer} on `{stage}`: {source}"))]
    Subscribe {
        stage: &'static str,
        peer: UserId,
        source: GatewayError,
    },
    #[snafu(display("no conversation is selected on `{stage}`"))]
    NoConversationSelected { stage: &'static str },
    #[snafu(display("history for {peer} is still loading on `{stage}`"))]
    ConversationLoading { stage: &'static str, peer: UserId },
    #[snafu(display("draft has neither text nor image on `{stage}`"))]
    EmptyDraft { stage: &'static str },
}

impl SyncError {
    /// The gateway failure behind this error, if it came from a remote call.
    pub fn gateway_error(&self) -> Option<&GatewayError> {
        match self {
            Self::LoadPartners { source, .. }
            | Self::FetchHistory { source, .. }
            | Self::SendMessage { source, .. }
            | Self::DeleteMessage { source, .. }
            | Self::Subscribe { source, .. } => Some(source),
            Self::NoConversationSelected { .. }
            | Self::ConversationLoading { .. }
            | Self::EmptyDraft { .. } => None,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
