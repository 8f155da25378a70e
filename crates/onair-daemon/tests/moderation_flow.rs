//! Request lifecycle: submit → moderate → queue, with the ledger as the
//! durable source of truth.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use onair_daemon::events::{BroadcastMessage, EventReceiver, EventSender};
use onair_daemon::ledger::Ledger;
use onair_daemon::moderation::{DecideOutcome, Moderation};
use onair_daemon::resolver::{DurationLookup, DurationResolver};
use onair_daemon::scheduler::Scheduler;
use onair_daemon::snapshot::SnapshotStore;
use onair_proto::model::{Genre, NotificationKind, Platform, RequestStatus};
use onair_proto::protocol::{ModerationAction, RequestDraft};

struct FixedLookup(u32);

#[async_trait]
impl DurationLookup for FixedLookup {
    async fn resolve(&self, _track: &str) -> anyhow::Result<u32> {
        Ok(self.0)
    }
}

struct FailingLookup;

#[async_trait]
impl DurationLookup for FailingLookup {
    async fn resolve(&self, _track: &str) -> anyhow::Result<u32> {
        anyhow::bail!("metadata service unavailable")
    }
}

struct Setup {
    scheduler: Arc<Scheduler>,
    moderation: Moderation,
    ledger: Arc<Ledger>,
    events: EventSender,
    _dir: tempfile::TempDir,
}

async fn setup(youtube: Box<dyn DurationLookup>) -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let events = onair_daemon::events::channel();
    let store = SnapshotStore::new(dir.path().join("snapshot.json"));
    let scheduler = Scheduler::new(events.clone(), store);
    let ledger = Arc::new(Ledger::in_memory().await.unwrap());
    let resolver = Arc::new(DurationResolver::with_lookups(
        youtube,
        Box::new(FailingLookup),
        180,
    ));
    let moderation = Moderation::new(ledger.clone(), resolver, scheduler.clone(), 60);
    Setup {
        scheduler,
        moderation,
        ledger,
        events,
        _dir: dir,
    }
}

fn draft(user_id: &str, title: &str) -> RequestDraft {
    RequestDraft {
        track: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".into(),
        username: "ada".into(),
        message: "play this please".into(),
        title: title.into(),
        user_id: user_id.into(),
    }
}

fn drain(rx: &mut EventReceiver) -> Vec<BroadcastMessage> {
    let mut messages = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        messages.push(msg);
    }
    messages
}

#[tokio::test]
async fn test_submit_records_request_and_emits_cooldown() {
    let s = setup(Box::new(FixedLookup(90))).await;
    let mut rx = s.events.subscribe();

    let before = Utc::now();
    let request = s
        .moderation
        .submit(Genre::Rock, Platform::Youtube, draft("u1", "Song"))
        .await
        .unwrap();

    assert_eq!(request.status, RequestStatus::Sent);
    assert!(!request.id.is_empty());

    let pending = s.ledger.select_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, request.id);
    assert_eq!(s.scheduler.pending().await.len(), 1);

    let messages = drain(&mut rx);
    let cooldown = messages
        .iter()
        .find_map(|msg| match msg {
            BroadcastMessage::Cooldown { genre, user_id, until } => {
                Some((*genre, user_id.clone(), *until))
            }
            _ => None,
        })
        .expect("a cooldown update should be broadcast");
    assert_eq!(cooldown.0, Genre::Rock);
    assert_eq!(cooldown.1, "u1");
    assert!(cooldown.2 >= before + chrono::Duration::seconds(59));

    assert!(messages
        .iter()
        .any(|msg| matches!(msg, BroadcastMessage::ModerationQueue { requests } if requests.len() == 1)));
}

#[tokio::test]
async fn test_approve_enqueues_with_resolved_duration() {
    let s = setup(Box::new(FixedLookup(90))).await;
    let request = s
        .moderation
        .submit(Genre::Rock, Platform::Youtube, draft("u1", "Song"))
        .await
        .unwrap();

    let mut rx = s.events.subscribe();
    let outcome = s
        .moderation
        .decide(&request.id, ModerationAction::Approve, None)
        .await
        .unwrap();
    assert_eq!(outcome, DecideOutcome::Approved);

    // The pair was idle, so the approved entry starts playing immediately.
    let view = s.scheduler.station_view(Genre::Rock, Platform::Youtube).await;
    let current = view.now_playing.expect("approved track should be playing");
    assert_eq!(current.entry.request.id, request.id);
    assert_eq!(current.entry.duration_secs, 90);
    assert_eq!(current.entry.request.status, RequestStatus::Approved);

    // Ledger row is terminal, pending set empty everywhere.
    assert!(s.ledger.select_pending().await.unwrap().is_empty());
    assert!(s.scheduler.pending().await.is_empty());
    let record = s
        .ledger
        .latest_for_genre(Genre::Rock)
        .await
        .unwrap()
        .expect("approved row");
    assert_eq!(record.duration_secs, Some(90));

    // Exactly one success notification, addressed to the requester.
    let notifications: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|msg| match msg {
            BroadcastMessage::Notification { notification } => Some(notification),
            _ => None,
        })
        .collect();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].user_id, "u1");
    assert_eq!(notifications[0].kind, NotificationKind::Success);
}

#[tokio::test]
async fn test_second_decision_on_same_id_is_noop() {
    let s = setup(Box::new(FixedLookup(90))).await;
    let request = s
        .moderation
        .submit(Genre::Rock, Platform::Youtube, draft("u1", "Song"))
        .await
        .unwrap();

    s.moderation
        .decide(&request.id, ModerationAction::Approve, None)
        .await
        .unwrap();
    let outcome = s
        .moderation
        .decide(&request.id, ModerationAction::Reject, Some("late".into()))
        .await
        .unwrap();
    assert_eq!(outcome, DecideOutcome::NotFound);

    // The first decision stands.
    let record = s.ledger.latest_for_genre(Genre::Rock).await.unwrap();
    assert!(record.is_some());
}

#[tokio::test]
async fn test_reject_never_enqueues_and_carries_reason() {
    let s = setup(Box::new(FixedLookup(90))).await;
    let request = s
        .moderation
        .submit(Genre::Rock, Platform::Youtube, draft("u2", "Long Song"))
        .await
        .unwrap();

    let mut rx = s.events.subscribe();
    let outcome = s
        .moderation
        .decide(&request.id, ModerationAction::Reject, Some("too long".into()))
        .await
        .unwrap();
    assert_eq!(outcome, DecideOutcome::Rejected);

    let view = s.scheduler.station_view(Genre::Rock, Platform::Youtube).await;
    assert!(view.now_playing.is_none());
    assert!(view.queue.is_empty());

    let notifications: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|msg| match msg {
            BroadcastMessage::Notification { notification } => Some(notification),
            _ => None,
        })
        .collect();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].user_id, "u2");
    assert_eq!(notifications[0].kind, NotificationKind::Error);
    assert!(notifications[0].message.contains("too long"));

    // Stored for later pickup over HTTP as well.
    let stored = s.scheduler.notifications_for("u2").await;
    assert_eq!(stored.len(), 1);
}

#[tokio::test]
async fn test_lookup_failure_falls_back_to_default_duration() {
    let s = setup(Box::new(FailingLookup)).await;
    let request = s
        .moderation
        .submit(Genre::Rock, Platform::Youtube, draft("u1", "Song"))
        .await
        .unwrap();

    s.moderation
        .decide(&request.id, ModerationAction::Approve, None)
        .await
        .unwrap();

    let view = s.scheduler.station_view(Genre::Rock, Platform::Youtube).await;
    assert_eq!(view.now_playing.unwrap().entry.duration_secs, 180);
}

#[tokio::test]
async fn test_back_to_back_approvals_queue_in_arrival_order() {
    let s = setup(Box::new(FixedLookup(120))).await;
    let first = s
        .moderation
        .submit(Genre::Rock, Platform::Youtube, draft("u1", "First"))
        .await
        .unwrap();
    let second = s
        .moderation
        .submit(Genre::Rock, Platform::Youtube, draft("u2", "Second"))
        .await
        .unwrap();
    let third = s
        .moderation
        .submit(Genre::Rock, Platform::Youtube, draft("u3", "Third"))
        .await
        .unwrap();

    for id in [&first.id, &second.id, &third.id] {
        s.moderation
            .decide(id, ModerationAction::Approve, None)
            .await
            .unwrap();
    }

    // Only the first approval started playback; the rest queued in order
    // behind it, with no second now-playing slot and no early start.
    let view = s.scheduler.station_view(Genre::Rock, Platform::Youtube).await;
    assert_eq!(view.now_playing.as_ref().unwrap().entry.request.id, first.id);
    let queued: Vec<_> = view.queue.iter().map(|e| e.request.id.clone()).collect();
    assert_eq!(queued, [second.id.clone(), third.id.clone()]);
}

#[tokio::test]
async fn test_pending_set_is_rebuilt_from_ledger() {
    let s = setup(Box::new(FixedLookup(90))).await;
    s.moderation
        .submit(Genre::Rock, Platform::Youtube, draft("u1", "Song"))
        .await
        .unwrap();

    // A second daemon generation with an empty mirror but the same ledger.
    let dir = tempfile::tempdir().unwrap();
    let scheduler = Scheduler::new(
        onair_daemon::events::channel(),
        SnapshotStore::new(dir.path().join("snapshot.json")),
    );
    let resolver = Arc::new(DurationResolver::with_lookups(
        Box::new(FixedLookup(90)),
        Box::new(FailingLookup),
        180,
    ));
    let moderation = Moderation::new(s.ledger.clone(), resolver, scheduler.clone(), 60);
    moderation.init_pending().await;

    assert_eq!(scheduler.pending().await.len(), 1);
}
