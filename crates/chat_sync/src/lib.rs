//! Live transcript synchronization for group conversations.
//!
//! A [`ConversationSession`] keeps one [`MessageStore`] consistent while three
//! producers feed it concurrently: the [`PushListener`], the
//! [`SnapshotPoller`] and optimistic sends through the [`SendCoordinator`].

use shared::domain::CorrelationToken;

pub mod activity;
pub mod config;
pub mod error;
pub mod http;
pub mod message;
pub mod poller;
pub mod profile;
pub mod push;
pub mod send;
pub mod session;
pub mod store;
pub mod transport;
pub mod ws;

pub use config::{load_settings, SyncSettings};
pub use error::{ConfigError, PushError, SendError, StoreError};
pub use http::HttpBackend;
pub use message::{DraftMessage, Message, MessageKey, MessageStatus};
pub use poller::{PollOutcome, SnapshotPoller};
pub use profile::ProfileDirectory;
pub use push::{PushListener, PushState, ReconnectPolicy};
pub use send::SendCoordinator;
pub use session::{ConversationSession, SessionDependencies};
pub use store::{MessageStore, Transcript};
pub use transport::{
    IdentitySource, MessageBackend, ProfileLookup, PushFrame, PushStream, PushTransport,
    SignedOut, StaticIdentity,
};
pub use ws::WebSocketPush;

/// Lifecycle notifications for the rendering layer. Transcript changes are
/// observed through [`MessageStore::watch`] instead.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    PushStateChanged(PushState),
    SendFailed {
        token: CorrelationToken,
        reason: String,
    },
    Error(String),
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
