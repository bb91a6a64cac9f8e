//! Keeps one user's view of one active conversation consistent across the history fetch,
//! local sends and deletes, and the session-wide push stream.
//!
//! [`ChatSession`] is the entry point. It owns the selector, the ledger, the reply context,
//! the push subscription and the partner directory. A switch releases the old listener,
//! fetches, and then binds and installs the history in one step.

pub mod directory;
pub mod error;
pub mod ledger;
pub mod reply;
pub mod selector;
pub mod session;
pub mod settings;
pub mod subscription;

pub use directory::PeerDirectory;
pub use error::{SyncError, SyncResult};
pub use ledger::{AppendOutcome, LedgerState, MessageLedger, RemovedMessage};
pub use reply::ReplyContext;
pub use selector::{ConversationSelector, Selection, SwitchGeneration, SwitchTicket};
pub use session::{
    ChatSession, DeleteOutcome, PendingDelete, PendingSend, PushApplied, ReloadTicket,
    SendOutcome, SessionOptions, SwitchOutcome, SwitchStart,
};
pub use settings::{
    AppendStrategy, DeleteFailurePolicy, SettingsError, SettingsStore, SyncSettings,
};
pub use subscription::{PushDelivery, SubscriptionManager, SubscriptionState};
