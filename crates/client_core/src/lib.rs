use anyhow::Result;
use async_trait::async_trait;
use shared::{domain::Story, protocol::StoryList};

pub mod collection;
pub mod config;
pub mod controller;
pub mod error;
pub mod push;
pub mod remote;
pub mod runtime;

pub use collection::{CollectionChange, Observer, ReactiveCollection, SubscriptionId};
pub use config::{load_settings, SyncSettings};
pub use controller::{DuplicateAdds, Mutation, Outcome, SyncController, SyncEvent, SyncState};
pub use push::{decode_frame, PushEvent, WebSocketPushChannel};
pub use remote::HttpRemoteStore;
pub use runtime::{BoardSnapshot, SyncHandle, SyncRuntime};

/// The authoritative store behind the board.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch_all(&self) -> Result<StoryList>;
    async fn delete_story(&self, story: &Story) -> Result<()>;
}

/// Opens push sessions. A successful `open` is the connection's "open" signal.
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn open(&self) -> Result<Box<dyn PushSession>>;
}

/// One live push connection.
///
/// `next_frame` is raced against other work by the runtime and must be
/// cancel safe: dropping its future must not lose a frame.
#[async_trait]
pub trait PushSession: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;
    /// Next inbound text frame in transport order; `None` once the peer closed.
    async fn next_frame(&mut self) -> Option<Result<String>>;
}

/// Builds a runtime talking to the story server named in `settings`.
pub fn connect(settings: &SyncSettings) -> Result<(SyncRuntime, SyncHandle)> {
    settings.validate()?;
    let remote = std::sync::Arc::new(HttpRemoteStore::new(&settings.server_url)?);
    let push = std::sync::Arc::new(WebSocketPushChannel::new(settings.push_url.clone()));
    let runtime = SyncRuntime::new(settings, remote, push);
    let handle = runtime.handle();
    Ok((runtime, handle))
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
