//! The event loop that owns a [`SyncController`].
//!
//! One task multiplexes its sources with `tokio::select!`: the snapshot
//! fetch (retried after `snapshot_retry` when it fails), the push session and
//! local commands from [`SyncHandle`]s. Nothing else touches the controller,
//! so mutations are applied strictly one at a time.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use anyhow::Result;
use futures::future::BoxFuture;
use shared::{domain::Story, protocol::StoryList};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    time::Sleep,
};
use tracing::{debug, info, warn};

use crate::{
    collection::{Observer, SubscriptionId},
    config::SyncSettings,
    controller::{SyncController, SyncEvent, SyncState},
    error::SyncError,
    PushChannel, PushSession, RemoteStore,
};

const COMMAND_QUEUE: usize = 64;

enum SyncCommand {
    Add(Story),
    Delete(Story),
    Resync,
    Snapshot(oneshot::Sender<BoardSnapshot>),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardSnapshot {
    pub state: SyncState,
    pub stories: Vec<Story>,
    /// Mutations waiting for the snapshot to land.
    pub pending: usize,
}

/// Cloneable front door to a running [`SyncRuntime`].
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<SyncCommand>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncHandle {
    pub async fn add_story(&self, story: Story) -> Result<(), SyncError> {
        self.send(SyncCommand::Add(story)).await
    }

    pub async fn delete_story(&self, story: Story) -> Result<(), SyncError> {
        self.send(SyncCommand::Delete(story)).await
    }

    /// Fetches a fresh snapshot. Push mutations are held back until it lands.
    pub async fn resync(&self) -> Result<(), SyncError> {
        self.send(SyncCommand::Resync).await
    }

    pub async fn snapshot(&self) -> Result<BoardSnapshot, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.send(SyncCommand::Snapshot(tx)).await?;
        rx.await.map_err(|_| SyncError::RuntimeClosed)
    }

    pub async fn shutdown(&self) -> Result<(), SyncError> {
        self.send(SyncCommand::Shutdown).await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    async fn send(&self, command: SyncCommand) -> Result<(), SyncError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::RuntimeClosed)
    }
}

pub struct SyncRuntime {
    controller: SyncController,
    remote: Arc<dyn RemoteStore>,
    push: Arc<dyn PushChannel>,
    handshake: String,
    snapshot_retry: Duration,
    commands_tx: mpsc::Sender<SyncCommand>,
    commands_rx: mpsc::Receiver<SyncCommand>,
}

impl SyncRuntime {
    pub fn new(
        settings: &SyncSettings,
        remote: Arc<dyn RemoteStore>,
        push: Arc<dyn PushChannel>,
    ) -> Self {
        let controller = SyncController::new(
            Arc::clone(&remote),
            settings.duplicate_adds,
            settings.max_buffered_events,
        );
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        Self {
            controller,
            remote,
            push,
            handshake: settings.handshake.clone(),
            snapshot_retry: settings.snapshot_retry,
            commands_tx,
            commands_rx,
        }
    }

    pub fn handle(&self) -> SyncHandle {
        SyncHandle {
            commands: self.commands_tx.clone(),
            events: self.controller.event_sender(),
        }
    }

    /// Observers registered here run inside the runtime task, synchronously
    /// with each mutation.
    pub fn subscribe(&mut self, observer: Observer) -> SubscriptionId {
        self.controller.subscribe(observer)
    }

    /// Runs until [`SyncHandle::shutdown`] or until every handle is dropped,
    /// then hands the controller back.
    pub async fn run(self) -> SyncController {
        let SyncRuntime {
            mut controller,
            remote,
            push,
            handshake,
            snapshot_retry,
            commands_tx,
            mut commands_rx,
        } = self;
        drop(commands_tx);
        let events = controller.event_sender();

        let mut snapshot: Option<BoxFuture<'static, Result<StoryList>>> =
            Some(fetch_snapshot(Arc::clone(&remote)));
        let mut opening: Option<BoxFuture<'static, Result<Box<dyn PushSession>>>> =
            Some(Box::pin(async move { push.open().await }));
        let mut session: Option<Box<dyn PushSession>> = None;
        let mut retry: Option<Pin<Box<Sleep>>> = None;

        loop {
            tokio::select! {
                result = poll_slot(&mut snapshot) => {
                    snapshot = None;
                    match result {
                        Ok(list) => controller.apply_snapshot(list.stories),
                        Err(err) => {
                            controller.snapshot_failed(&err);
                            if !snapshot_retry.is_zero() {
                                debug!(
                                    delay_ms = snapshot_retry.as_millis() as u64,
                                    "scheduling snapshot retry"
                                );
                                retry = Some(Box::pin(tokio::time::sleep(snapshot_retry)));
                            }
                        }
                    }
                }
                () = poll_slot(&mut retry) => {
                    retry = None;
                    if snapshot.is_none() {
                        info!("retrying story snapshot");
                        snapshot = Some(fetch_snapshot(Arc::clone(&remote)));
                    }
                }
                opened = poll_slot(&mut opening) => {
                    opening = None;
                    session = open_session(&events, opened, &handshake).await;
                }
                frame = next_frame(&mut session) => match frame {
                    Some(Ok(raw)) => {
                        let outcome = controller.handle_frame(&raw);
                        debug!(?outcome, "push frame handled");
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "push channel failed");
                        session = None;
                        let _ = events.send(SyncEvent::ChannelClosed {
                            reason: Some(format!("{err:#}")),
                        });
                    }
                    None => {
                        info!("push channel closed");
                        session = None;
                        let _ = events.send(SyncEvent::ChannelClosed { reason: None });
                    }
                },
                command = commands_rx.recv() => match command {
                    Some(SyncCommand::Add(story)) => {
                        controller.local_add(story);
                    }
                    Some(SyncCommand::Delete(story)) => {
                        controller.local_delete(story);
                    }
                    Some(SyncCommand::Resync) => {
                        retry = None;
                        if snapshot.is_none() {
                            controller.begin_resync();
                            snapshot = Some(fetch_snapshot(Arc::clone(&remote)));
                        }
                    }
                    Some(SyncCommand::Snapshot(reply)) => {
                        let _ = reply.send(BoardSnapshot {
                            state: controller.state(),
                            stories: controller.stories().to_vec(),
                            pending: controller.pending_len(),
                        });
                    }
                    Some(SyncCommand::Shutdown) | None => break,
                },
            }
        }

        info!("sync runtime stopped");
        controller
    }
}

fn fetch_snapshot(remote: Arc<dyn RemoteStore>) -> BoxFuture<'static, Result<StoryList>> {
    Box::pin(async move { remote.fetch_all().await })
}

/// Sends the handshake on a freshly opened session. Nothing is read from the
/// session before this returns.
async fn open_session(
    events: &broadcast::Sender<SyncEvent>,
    opened: Result<Box<dyn PushSession>>,
    handshake: &str,
) -> Option<Box<dyn PushSession>> {
    let failure = match opened {
        Ok(mut session) => match session.send_text(handshake.to_string()).await {
            Ok(()) => {
                debug!("push handshake sent");
                return Some(session);
            }
            Err(err) => err.context("push handshake failed"),
        },
        Err(err) => err,
    };
    let reason = format!("{failure:#}");
    warn!(%reason, "push channel unavailable");
    let _ = events.send(SyncEvent::ChannelClosed {
        reason: Some(reason),
    });
    None
}

/// Awaits the future in `slot`, or never resolves when the slot is empty.
async fn poll_slot<F>(slot: &mut Option<F>) -> F::Output
where
    F: Future + Unpin,
{
    match slot {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_frame(session: &mut Option<Box<dyn PushSession>>) -> Option<Result<String>> {
    match session {
        Some(session) => session.next_frame().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "tests/runtime_tests.rs"]
mod tests;
