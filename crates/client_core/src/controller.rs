//! Reconciliation of local and pushed story mutations.
//!
//! [`SyncController`] is the only writer of its [`ReactiveCollection`]. It is
//! driven from a single task (see [`crate::runtime`]), so its methods are
//! plain `&mut self` calls and the collection needs no lock.
//!
//! Until the first snapshot lands the controller is `Initializing`: pushed
//! mutations are queued instead of applied, and local mutations are applied
//! and also queued. Once the snapshot resets the collection the queue is
//! replayed in arrival order. A delete that races ahead of the snapshot is
//! therefore not resurrected by it.

use std::{
    collections::{HashSet, VecDeque},
    str::FromStr,
    sync::Arc,
};

use serde::Deserialize;
use shared::domain::{Story, StoryId};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    collection::{Observer, ReactiveCollection, SubscriptionId},
    error::FrameError,
    push::{decode_frame, PushEvent},
    RemoteStore,
};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Added(Story),
    Deleted(StoryId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Initializing,
    Synced,
}

/// What to do with an add whose id is already on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateAdds {
    /// Swap the existing entry for the incoming copy, keeping its position.
    #[default]
    Replace,
    /// Keep the existing entry and drop the incoming one.
    Reject,
    /// Append anyway, allowing duplicate ids.
    Accept,
}

impl FromStr for DuplicateAdds {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(DuplicateAdds::Replace),
            "reject" => Ok(DuplicateAdds::Reject),
            "accept" => Ok(DuplicateAdds::Accept),
            other => Err(format!("unknown duplicate-add policy '{other}'")),
        }
    }
}

/// Signals for observers that care about more than the story list itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    StateChanged(SyncState),
    SnapshotFailed(String),
    FrameRejected(String),
    RemoteDeleteFailed { story_id: StoryId, reason: String },
    ChannelClosed { reason: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Appended,
    Replaced,
    DuplicateRejected,
    Removed(usize),
    /// Delete of an id that is not on the board.
    NotPresent,
    /// Held back until the snapshot arrives.
    Deferred,
    Ignored,
    Rejected,
}

pub struct SyncController {
    collection: ReactiveCollection,
    state: SyncState,
    duplicate_adds: DuplicateAdds,
    pending: VecDeque<Mutation>,
    max_pending: usize,
    remote: Arc<dyn RemoteStore>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncController {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        duplicate_adds: DuplicateAdds,
        max_pending: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            collection: ReactiveCollection::new(),
            state: SyncState::Initializing,
            duplicate_adds,
            pending: VecDeque::new(),
            max_pending: max_pending.max(1),
            remote,
            events,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn stories(&self) -> &[Story] {
        self.collection.items()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn subscribe(&mut self, observer: Observer) -> SubscriptionId {
        self.collection.subscribe(observer)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.collection.unsubscribe(id)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<SyncEvent> {
        self.events.clone()
    }

    /// Installs a snapshot from the remote store and replays anything queued
    /// while it was in flight.
    ///
    /// A queued add whose id the snapshot already holds is skipped: the
    /// snapshot is at least as new as anything queued before it arrived.
    pub fn apply_snapshot(&mut self, stories: Vec<Story>) {
        let replay = std::mem::take(&mut self.pending);
        let known: HashSet<StoryId> = stories.iter().map(|s| s.id).collect();
        info!(
            stories = stories.len(),
            replayed = replay.len(),
            "applying story snapshot"
        );
        self.collection.reset(stories);
        for mutation in replay {
            match &mutation {
                Mutation::Added(story) if known.contains(&story.id) => {
                    debug!(story_id = %story.id, "snapshot already has queued add");
                }
                _ => {
                    self.apply(&mutation);
                }
            }
        }
        self.set_state(SyncState::Synced);
    }

    /// The queue is kept so a later snapshot can still replay it.
    pub fn snapshot_failed(&mut self, err: &anyhow::Error) {
        warn!(error = %err, pending = self.pending.len(), "story snapshot fetch failed");
        let _ = self.events.send(SyncEvent::SnapshotFailed(format!("{err:#}")));
    }

    /// Drops back to `Initializing` ahead of a fresh snapshot fetch.
    pub fn begin_resync(&mut self) {
        self.set_state(SyncState::Initializing);
    }

    /// Optimistically removes `target` and asks the remote store to delete it.
    ///
    /// The remote call is not awaited. If it fails the board is left as is and
    /// a [`SyncEvent::RemoteDeleteFailed`] is emitted.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime, since the remote delete is
    /// spawned onto the current one.
    pub fn local_delete(&mut self, target: Story) -> Outcome {
        let mutation = Mutation::Deleted(target.id);
        let outcome = self.apply(&mutation);
        self.remember_if_initializing(mutation);
        self.spawn_remote_delete(target);
        outcome
    }

    /// Optimistically adds `story`. Remote propagation is out of band; the
    /// server's echo is reconciled through the duplicate-add policy.
    pub fn local_add(&mut self, story: Story) -> Outcome {
        let mutation = Mutation::Added(story);
        let outcome = self.apply(&mutation);
        self.remember_if_initializing(mutation);
        outcome
    }

    /// Decodes and dispatches one raw push frame. A malformed frame is logged,
    /// reported as [`SyncEvent::FrameRejected`], and otherwise dropped.
    pub fn handle_frame(&mut self, raw: &str) -> Outcome {
        match decode_frame(raw) {
            Ok(event) => self.handle_push(event),
            Err(err) => {
                self.reject_frame(raw, &err);
                Outcome::Rejected
            }
        }
    }

    pub fn handle_push(&mut self, event: PushEvent) -> Outcome {
        match event {
            PushEvent::Apply(mutation) => {
                if self.state == SyncState::Initializing {
                    debug!(?mutation, "deferring push mutation until snapshot");
                    self.enqueue(mutation);
                    Outcome::Deferred
                } else {
                    self.apply(&mutation)
                }
            }
            PushEvent::Ignored {
                action,
                object_type,
            } => {
                debug!(%action, ?object_type, "ignoring push frame");
                Outcome::Ignored
            }
        }
    }

    fn apply(&mut self, mutation: &Mutation) -> Outcome {
        match mutation {
            Mutation::Added(story) => self.apply_add(story.clone()),
            Mutation::Deleted(story_id) => {
                let removed = self.collection.remove_matching(|s| s.id == *story_id);
                if removed.is_empty() {
                    debug!(%story_id, "delete of absent story");
                    Outcome::NotPresent
                } else {
                    Outcome::Removed(removed.len())
                }
            }
        }
    }

    fn apply_add(&mut self, story: Story) -> Outcome {
        let existing = match self.duplicate_adds {
            DuplicateAdds::Accept => None,
            DuplicateAdds::Replace | DuplicateAdds::Reject => {
                self.collection.position(|s| s.same_story(&story))
            }
        };

        match (existing, self.duplicate_adds) {
            (None, _) => {
                self.collection.append(story);
                Outcome::Appended
            }
            (Some(index), DuplicateAdds::Replace) => {
                self.collection.replace_at(index, story);
                Outcome::Replaced
            }
            (Some(_), _) => {
                debug!(story_id = %story.id, "dropping duplicate add");
                Outcome::DuplicateRejected
            }
        }
    }

    fn remember_if_initializing(&mut self, mutation: Mutation) {
        if self.state == SyncState::Initializing {
            self.enqueue(mutation);
        }
    }

    fn enqueue(&mut self, mutation: Mutation) {
        if self.pending.len() >= self.max_pending {
            let dropped = self.pending.pop_front();
            warn!(
                max_pending = self.max_pending,
                ?dropped,
                "pending mutation queue full; dropping oldest"
            );
        }
        self.pending.push_back(mutation);
    }

    fn spawn_remote_delete(&self, target: Story) {
        let remote = Arc::clone(&self.remote);
        let events = self.events.clone();
        tokio::spawn(async move {
            let story_id = target.id;
            match remote.delete_story(&target).await {
                Ok(()) => debug!(%story_id, "remote delete confirmed"),
                Err(err) => {
                    warn!(%story_id, error = %err, "remote delete failed; board keeps local removal");
                    let _ = events.send(SyncEvent::RemoteDeleteFailed {
                        story_id,
                        reason: format!("{err:#}"),
                    });
                }
            }
        });
    }

    fn reject_frame(&self, raw: &str, err: &FrameError) {
        warn!(error = %err, frame_len = raw.len(), "dropping malformed push frame");
        let _ = self.events.send(SyncEvent::FrameRejected(err.to_string()));
    }

    fn set_state(&mut self, state: SyncState) {
        if self.state != state {
            info!(from = ?self.state, to = ?state, "sync state changed");
            self.state = state;
            let _ = self.events.send(SyncEvent::StateChanged(state));
        }
    }
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
