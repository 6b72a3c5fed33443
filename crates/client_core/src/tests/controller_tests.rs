use std::sync::Mutex as StdMutex;

use super::*;
use crate::{
    collection::CollectionChange,
    test_support::{next_event_matching, push_frame, story, titles, ScriptedRemote},
};

type ChangeLog = Arc<StdMutex<Vec<CollectionChange>>>;

fn controller(policy: DuplicateAdds) -> SyncController {
    let (remote, _control) = ScriptedRemote::new(0);
    SyncController::new(remote, policy, 16)
}

fn record_changes(controller: &mut SyncController) -> ChangeLog {
    let log: ChangeLog = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    controller.subscribe(Box::new(move |change: &CollectionChange, _: &[Story]| {
        sink.lock().expect("log").push(change.clone());
    }));
    log
}

fn synced(policy: DuplicateAdds, stories: Vec<Story>) -> SyncController {
    let mut controller = controller(policy);
    controller.apply_snapshot(stories);
    controller
}

#[test]
fn snapshot_replaces_contents_and_marks_synced() {
    let mut controller = controller(DuplicateAdds::Replace);
    let mut events = controller.subscribe_events();
    let changes = record_changes(&mut controller);
    assert_eq!(controller.state(), SyncState::Initializing);

    controller.apply_snapshot(vec![story("a"), story("b")]);

    assert_eq!(controller.state(), SyncState::Synced);
    assert_eq!(titles(controller.stories()), ["a", "b"]);
    assert_eq!(*changes.lock().expect("log"), [CollectionChange::Reset]);
    assert_eq!(
        events.try_recv().expect("event"),
        SyncEvent::StateChanged(SyncState::Synced)
    );
}

#[test]
fn pushed_delete_matches_by_id_not_by_contents() {
    let a = story("a");
    let b = story("b");
    let mut controller = synced(DuplicateAdds::Replace, vec![a.clone(), b.clone()]);

    let mut stale_copy = a.clone();
    stale_copy.title = "renamed elsewhere".into();
    stale_copy.position = 42;

    let outcome = controller.handle_frame(&push_frame("deleted", &stale_copy));

    assert_eq!(outcome, Outcome::Removed(1));
    assert_eq!(controller.stories(), [b]);
}

#[test]
fn deleted_frame_needs_only_the_id() {
    let a = story("a");
    let mut controller = synced(DuplicateAdds::Replace, vec![a.clone()]);

    let frame = format!(
        r#"{{"action":"deleted","object_type":"story","object":{{"id":"{}"}}}}"#,
        a.id
    );

    assert_eq!(controller.handle_frame(&frame), Outcome::Removed(1));
    assert!(controller.stories().is_empty());
}

#[test]
fn pushed_add_appends_at_the_end() {
    let mut controller = synced(DuplicateAdds::Replace, vec![story("a")]);
    let changes = record_changes(&mut controller);

    let outcome = controller.handle_frame(&push_frame("added", &story("b")));

    assert_eq!(outcome, Outcome::Appended);
    assert_eq!(titles(controller.stories()), ["a", "b"]);
    assert_eq!(
        *changes.lock().expect("log"),
        [CollectionChange::Appended { index: 1 }]
    );
}

#[test]
fn unknown_actions_and_foreign_types_leave_the_board_alone() {
    let a = story("a");
    let mut controller = synced(DuplicateAdds::Replace, vec![a.clone()]);
    let changes = record_changes(&mut controller);

    assert_eq!(
        controller.handle_frame(&push_frame("updated", &a)),
        Outcome::Ignored
    );
    let foreign = serde_json::json!({
        "action": "deleted",
        "object_type": "comment",
        "object": { "id": a.id },
    })
    .to_string();
    assert_eq!(controller.handle_frame(&foreign), Outcome::Ignored);

    assert_eq!(controller.stories(), [a]);
    assert!(changes.lock().expect("log").is_empty());
}

#[test]
fn deleting_an_absent_story_is_a_silent_no_op() {
    let a = story("a");
    let mut controller = synced(DuplicateAdds::Replace, vec![a.clone()]);
    let changes = record_changes(&mut controller);

    let outcome = controller.handle_frame(&push_frame("deleted", &story("ghost")));

    assert_eq!(outcome, Outcome::NotPresent);
    assert_eq!(controller.stories(), [a]);
    assert!(changes.lock().expect("log").is_empty());
}

#[test]
fn malformed_frames_are_reported_and_later_frames_still_apply() {
    let mut controller = synced(DuplicateAdds::Replace, vec![story("a")]);
    let mut events = controller.subscribe_events();

    assert_eq!(controller.handle_frame("{not json"), Outcome::Rejected);
    assert_eq!(
        controller.handle_frame(r#"{"action":"added","object_type":"story","object":{"id":"nope"}}"#),
        Outcome::Rejected
    );
    assert!(matches!(
        events.try_recv().expect("event"),
        SyncEvent::FrameRejected(_)
    ));
    assert!(matches!(
        events.try_recv().expect("event"),
        SyncEvent::FrameRejected(_)
    ));

    assert_eq!(
        controller.handle_frame(&push_frame("added", &story("b"))),
        Outcome::Appended
    );
    assert_eq!(titles(controller.stories()), ["a", "b"]);
}

#[test]
fn push_before_snapshot_is_deferred_then_replayed() {
    let a = story("a");
    let b = story("b");
    let c = story("c");
    let mut controller = controller(DuplicateAdds::Replace);

    assert_eq!(
        controller.handle_frame(&push_frame("deleted", &b)),
        Outcome::Deferred
    );
    assert_eq!(
        controller.handle_frame(&push_frame("added", &c)),
        Outcome::Deferred
    );
    assert!(controller.stories().is_empty());
    assert_eq!(controller.pending_len(), 2);

    // The snapshot was taken before either mutation reached the server.
    controller.apply_snapshot(vec![a.clone(), b]);

    assert_eq!(controller.stories(), [a, c]);
    assert_eq!(controller.pending_len(), 0);
}

#[test]
fn snapshot_that_already_has_a_deferred_add_does_not_duplicate_it() {
    let a = story("a");
    let mut controller = controller(DuplicateAdds::Replace);

    controller.handle_frame(&push_frame("added", &a));
    controller.apply_snapshot(vec![a.clone()]);

    assert_eq!(controller.stories(), [a]);
}

#[test]
fn snapshot_copy_wins_over_an_older_queued_add() {
    let first = story("v1");
    let mut newer = first.clone();
    newer.title = "v2".into();
    newer.position = 3;

    for policy in [DuplicateAdds::Replace, DuplicateAdds::Reject, DuplicateAdds::Accept] {
        let mut controller = controller(policy);
        assert_eq!(
            controller.handle_frame(&push_frame("added", &first)),
            Outcome::Deferred
        );
        // The follow-up update is not applied by this client.
        assert_eq!(
            controller.handle_frame(&push_frame("updated", &newer)),
            Outcome::Ignored
        );

        controller.apply_snapshot(vec![newer.clone()]);

        assert_eq!(controller.stories(), [newer.clone()], "{policy:?}");
    }
}

#[test]
fn queued_local_add_missing_from_snapshot_is_kept_once() {
    let a = story("a");
    let local = story("local");
    let mut controller = controller(DuplicateAdds::Replace);

    controller.local_add(local.clone());
    // Server echo of the same add, seen before the snapshot.
    controller.handle_frame(&push_frame("added", &local));

    controller.apply_snapshot(vec![a.clone()]);

    assert_eq!(controller.stories(), [a, local]);
}

#[tokio::test]
async fn local_mutations_during_initializing_survive_the_snapshot() {
    let a = story("a");
    let b = story("b");
    let fresh = story("fresh");
    let (remote, mut control) = ScriptedRemote::new(0);
    let mut controller = SyncController::new(remote, DuplicateAdds::Replace, 16);

    assert_eq!(controller.local_add(fresh.clone()), Outcome::Appended);
    assert_eq!(controller.local_delete(b.clone()), Outcome::NotPresent);
    assert_eq!(controller.stories(), [fresh.clone()]);

    controller.apply_snapshot(vec![a.clone(), b.clone()]);

    assert_eq!(controller.stories(), [a, fresh]);
    assert_eq!(control.deleted.recv().await, Some(b.id));
}

#[tokio::test]
async fn local_delete_removes_and_calls_remote_with_the_story() {
    let a = story("a");
    let b = story("b");
    let (remote, mut control) = ScriptedRemote::new(0);
    let mut controller = SyncController::new(remote, DuplicateAdds::Replace, 16);
    controller.apply_snapshot(vec![a.clone(), b.clone()]);

    assert_eq!(controller.local_delete(a.clone()), Outcome::Removed(1));
    assert_eq!(controller.stories(), [b]);
    assert_eq!(control.deleted.recv().await, Some(a.id));
}

#[tokio::test]
async fn remote_delete_failure_is_reported_without_rollback() {
    let a = story("a");
    let (remote, _control) = ScriptedRemote::failing_deletes(0);
    let mut controller = SyncController::new(remote, DuplicateAdds::Replace, 16);
    controller.apply_snapshot(vec![a.clone()]);
    let mut events = controller.subscribe_events();

    controller.local_delete(a.clone());

    let event = next_event_matching(&mut events, |e| {
        matches!(e, SyncEvent::RemoteDeleteFailed { .. })
    })
    .await;
    match event {
        SyncEvent::RemoteDeleteFailed { story_id, reason } => {
            assert_eq!(story_id, a.id);
            assert!(reason.contains("not found"), "{reason}");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(controller.stories().is_empty());
}

#[test]
fn echo_of_local_add_replaces_by_default() {
    let mut controller = synced(DuplicateAdds::Replace, vec![story("a")]);
    let local = story("b");
    controller.local_add(local.clone());
    let changes = record_changes(&mut controller);

    let mut echo = local.clone();
    echo.position = 7;
    let outcome = controller.handle_frame(&push_frame("added", &echo));

    assert_eq!(outcome, Outcome::Replaced);
    assert_eq!(controller.stories().len(), 2);
    assert_eq!(controller.stories()[1].position, 7);
    assert_eq!(
        *changes.lock().expect("log"),
        [CollectionChange::Replaced {
            index: 1,
            previous: local,
        }]
    );
}

#[test]
fn reject_policy_keeps_the_first_copy() {
    let a = story("a");
    let mut controller = synced(DuplicateAdds::Reject, vec![a.clone()]);

    let mut echo = a.clone();
    echo.title = "other".into();

    assert_eq!(
        controller.handle_frame(&push_frame("added", &echo)),
        Outcome::DuplicateRejected
    );
    assert_eq!(controller.stories(), [a]);
}

#[test]
fn accept_policy_allows_duplicates_and_delete_removes_them_all() {
    let a = story("a");
    let mut controller = synced(DuplicateAdds::Accept, vec![a.clone()]);
    let changes = record_changes(&mut controller);

    assert_eq!(
        controller.handle_frame(&push_frame("added", &a)),
        Outcome::Appended
    );
    assert_eq!(controller.stories().len(), 2);

    assert_eq!(
        controller.handle_frame(&push_frame("deleted", &a)),
        Outcome::Removed(2)
    );
    assert!(controller.stories().is_empty());
    let changes = changes.lock().expect("log");
    assert_eq!(changes.len(), 2);
    assert!(matches!(&changes[1], CollectionChange::Removed { removed } if removed.len() == 2));
}

#[test]
fn full_pending_queue_drops_the_oldest_mutation() {
    let (remote, _control) = ScriptedRemote::new(0);
    let mut controller = SyncController::new(remote, DuplicateAdds::Replace, 2);
    let (a, b, c) = (story("a"), story("b"), story("c"));

    for s in [&a, &b, &c] {
        assert_eq!(
            controller.handle_frame(&push_frame("added", s)),
            Outcome::Deferred
        );
    }
    assert_eq!(controller.pending_len(), 2);

    controller.apply_snapshot(Vec::new());

    assert_eq!(controller.stories(), [b, c]);
}

#[test]
fn failed_snapshot_keeps_the_queue_for_the_next_attempt() {
    let mut controller = controller(DuplicateAdds::Replace);
    let mut events = controller.subscribe_events();
    let a = story("a");
    controller.handle_frame(&push_frame("added", &a));

    controller.snapshot_failed(&anyhow::anyhow!("server responded 500"));

    assert_eq!(controller.state(), SyncState::Initializing);
    assert_eq!(controller.pending_len(), 1);
    assert!(matches!(
        events.try_recv().expect("event"),
        SyncEvent::SnapshotFailed(reason) if reason.contains("500")
    ));

    controller.apply_snapshot(Vec::new());
    assert_eq!(controller.stories(), [a]);
}

#[test]
fn resync_defers_pushes_until_the_next_snapshot() {
    let a = story("a");
    let b = story("b");
    let mut controller = synced(DuplicateAdds::Replace, vec![a.clone()]);
    let mut events = controller.subscribe_events();

    controller.begin_resync();
    assert_eq!(
        events.try_recv().expect("event"),
        SyncEvent::StateChanged(SyncState::Initializing)
    );
    assert_eq!(
        controller.handle_frame(&push_frame("deleted", &a)),
        Outcome::Deferred
    );
    assert_eq!(controller.stories(), [a.clone()]);

    controller.apply_snapshot(vec![a, b.clone()]);

    assert_eq!(controller.stories(), [b]);
    assert_eq!(controller.state(), SyncState::Synced);
}

#[test]
fn unsubscribed_observers_stop_hearing_changes() {
    let mut controller = synced(DuplicateAdds::Replace, Vec::new());
    let log: ChangeLog = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let id = controller.subscribe(Box::new(move |change: &CollectionChange, _: &[Story]| {
        sink.lock().expect("log").push(change.clone());
    }));

    controller.handle_frame(&push_frame("added", &story("a")));
    assert!(controller.unsubscribe(id));
    controller.handle_frame(&push_frame("added", &story("b")));

    assert_eq!(log.lock().expect("log").len(), 1);
    assert_eq!(controller.stories().len(), 2);
}
