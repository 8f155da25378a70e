use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use onair_proto::model::{Genre, Notification, NowPlaying, Platform, QueueEntry, Request};

/// Internal fan-out messages.  Every connected socket client holds a
/// subscription; socket.rs maps these 1:1 onto wire broadcasts.
#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    Queue {
        genre: Genre,
        platform: Platform,
        entries: Vec<QueueEntry>,
    },
    NowPlaying {
        genre: Genre,
        platform: Platform,
        current: Option<NowPlaying>,
    },
    ModerationQueue {
        requests: Vec<Request>,
    },
    Cooldown {
        genre: Genre,
        user_id: String,
        until: DateTime<Utc>,
    },
    /// Addressed delivery: only connections registered for
    /// `notification.user_id` forward this to their client.
    Notification {
        notification: Notification,
    },
}

pub type EventSender = broadcast::Sender<BroadcastMessage>;
pub type EventReceiver = broadcast::Receiver<BroadcastMessage>;

pub fn channel() -> EventSender {
    let (sender, _) = broadcast::channel(256);
    sender
}
