//! Scripted collaborators for controller and runtime tests.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{Story, StoryId},
    protocol::StoryList,
};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};

use crate::{controller::SyncEvent, PushChannel, PushSession, RemoteStore};

pub(crate) type SnapshotReply = Result<Vec<Story>, String>;

/// Remote store whose snapshots resolve only when the test says so.
pub(crate) struct ScriptedRemote {
    snapshots: Mutex<VecDeque<oneshot::Receiver<SnapshotReply>>>,
    deleted: mpsc::UnboundedSender<StoryId>,
    fail_deletes: bool,
}

pub(crate) struct RemoteControl {
    pub(crate) snapshots: VecDeque<oneshot::Sender<SnapshotReply>>,
    pub(crate) deleted: mpsc::UnboundedReceiver<StoryId>,
}

impl RemoteControl {
    pub(crate) fn resolve_next(&mut self, reply: SnapshotReply) {
        let tx = self.snapshots.pop_front().expect("scripted snapshot");
        tx.send(reply).expect("runtime waiting for snapshot");
    }
}

impl ScriptedRemote {
    pub(crate) fn new(snapshot_count: usize) -> (Arc<Self>, RemoteControl) {
        Self::build(snapshot_count, false)
    }

    pub(crate) fn failing_deletes(snapshot_count: usize) -> (Arc<Self>, RemoteControl) {
        Self::build(snapshot_count, true)
    }

    fn build(snapshot_count: usize, fail_deletes: bool) -> (Arc<Self>, RemoteControl) {
        let mut senders = VecDeque::new();
        let mut receivers = VecDeque::new();
        for _ in 0..snapshot_count {
            let (tx, rx) = oneshot::channel();
            senders.push_back(tx);
            receivers.push_back(rx);
        }
        let (deleted_tx, deleted_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                snapshots: Mutex::new(receivers),
                deleted: deleted_tx,
                fail_deletes,
            }),
            RemoteControl {
                snapshots: senders,
                deleted: deleted_rx,
            },
        )
    }
}

#[async_trait]
impl RemoteStore for ScriptedRemote {
    async fn fetch_all(&self) -> Result<StoryList> {
        let next = self.snapshots.lock().await.pop_front();
        let Some(rx) = next else {
            return Err(anyhow!("no snapshot scripted"));
        };
        match rx.await {
            Ok(Ok(stories)) => Ok(StoryList { stories }),
            Ok(Err(message)) => Err(anyhow!(message)),
            Err(_) => Err(anyhow!("snapshot script dropped")),
        }
    }

    async fn delete_story(&self, story: &Story) -> Result<()> {
        let _ = self.deleted.send(story.id);
        if self.fail_deletes {
            return Err(anyhow!("story {} not found", story.id));
        }
        Ok(())
    }
}

/// Push channel backed by in-memory queues. It can be opened once.
pub(crate) struct ScriptedPush {
    session: Mutex<Option<ScriptedSession>>,
}

pub(crate) struct PushControl {
    pub(crate) inbound: mpsc::UnboundedSender<String>,
    /// Every `send`/`recv` on the session in the order it happened.
    pub(crate) wire_log: Arc<StdMutex<Vec<String>>>,
}

impl ScriptedPush {
    pub(crate) fn new() -> (Arc<Self>, PushControl) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let wire_log = Arc::new(StdMutex::new(Vec::new()));
        let session = ScriptedSession {
            inbound: inbound_rx,
            wire_log: Arc::clone(&wire_log),
        };
        (
            Arc::new(Self {
                session: Mutex::new(Some(session)),
            }),
            PushControl {
                inbound: inbound_tx,
                wire_log,
            },
        )
    }

    pub(crate) fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            session: Mutex::new(None),
        })
    }
}

#[async_trait]
impl PushChannel for ScriptedPush {
    async fn open(&self) -> Result<Box<dyn PushSession>> {
        match self.session.lock().await.take() {
            Some(session) => Ok(Box::new(session)),
            None => Err(anyhow!("connection refused")),
        }
    }
}

struct ScriptedSession {
    inbound: mpsc::UnboundedReceiver<String>,
    wire_log: Arc<StdMutex<Vec<String>>>,
}

#[async_trait]
impl PushSession for ScriptedSession {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.wire_log.lock().expect("wire log").push(format!("send:{text}"));
        Ok(())
    }

    async fn next_frame(&mut self) -> Option<Result<String>> {
        // No await after the frame leaves the queue, so a dropped call loses nothing.
        let frame = self.inbound.recv().await?;
        self.wire_log.lock().expect("wire log").push(format!("recv:{frame}"));
        Some(Ok(frame))
    }
}

pub(crate) fn story(title: &str) -> Story {
    Story::new(title, "", 0)
}

pub(crate) fn push_frame(action: &str, story: &Story) -> String {
    serde_json::json!({ "action": action, "object_type": "story", "object": story }).to_string()
}

pub(crate) fn titles(stories: &[Story]) -> Vec<String> {
    stories.iter().map(|s| s.title.clone()).collect()
}

pub(crate) async fn next_event_matching(
    events: &mut broadcast::Receiver<SyncEvent>,
    predicate: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) => continue,
                Err(err) => panic!("event stream ended: {err}"),
            }
        }
    })
    .await
    .expect("timed out waiting for sync event")
}
