//! Remote collaborators of the conversation synchronizer.
//!
//! The REST backend is reached through [`RemoteGateway`]; the session-wide notification stream
//! through [`PushChannel`]. [`HttpGateway`] talks to the real backend and [`MemoryGateway`]
//! is an in-process backend for tests and scenario runs.

pub mod error;
pub mod http;
pub mod ids;
pub mod memory;
pub mod push;
pub mod types;

use futures::future::BoxFuture;

pub use error::{GatewayError, GatewayResult};
pub use http::{DEFAULT_ENDPOINT, HttpGateway, HttpGatewayConfig};
pub use ids::{MessageId, UserId};
pub use memory::{CallGate, GatewayCall, MemoryGateway};
pub use push::{DEFAULT_PUSH_CAPACITY, PushChannel, PushHub, PushRegistration};
pub use types::{
    Draft, Message, Peer, PushEvent, ReplyPreview, ReplySnapshot, SendRequest,
};

pub trait RemoteGateway: Send + Sync {
    fn list_conversation_partners<'a>(&'a self) -> BoxFuture<'a, GatewayResult<Vec<Peer>>>;

    /// Full history with `peer_id`, oldest first.
    fn fetch_history<'a>(
        &'a self,
        peer_id: &'a UserId,
    ) -> BoxFuture<'a, GatewayResult<Vec<Message>>>;

    /// Persists a new message and returns it with its server-assigned id and timestamp.
    fn send_message<'a>(
        &'a self,
        peer_id: &'a UserId,
        request: SendRequest,
    ) -> BoxFuture<'a, GatewayResult<Message>>;

    fn delete_message<'a>(&'a self, message_id: &'a MessageId) -> BoxFuture<'a, GatewayResult<()>>;
}
