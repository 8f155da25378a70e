use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Content genres.  Each genre runs its own independent playback timeline
/// per platform.  The set is fixed at compile time and not user-extensible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Genre {
    Rock,
    Hiphop,
    Electronic,
}

impl Genre {
    pub const ALL: [Genre; 3] = [Genre::Rock, Genre::Hiphop, Genre::Electronic];

    pub fn as_str(&self) -> &'static str {
        match self {
            Genre::Rock => "rock",
            Genre::Hiphop => "hiphop",
            Genre::Electronic => "electronic",
        }
    }
}

impl fmt::Display for Genre {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Genre {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rock" => Ok(Genre::Rock),
            "hiphop" => Ok(Genre::Hiphop),
            "electronic" => Ok(Genre::Electronic),
            other => anyhow::bail!("unknown genre: {}", other),
        }
    }
}

/// Source platform a track is played from.  Each (genre, platform) pair has
/// its own queue and now-playing slot; they never share timers or ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Youtube,
    Rutube,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::Youtube, Platform::Rutube];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Youtube => "youtube",
            Platform::Rutube => "rutube",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "youtube" => Ok(Platform::Youtube),
            "rutube" => Ok(Platform::Rutube),
            other => anyhow::bail!("unknown platform: {}", other),
        }
    }
}

/// Lifecycle of a listener request: created as `Sent`, then moved to exactly
/// one terminal state by a moderation decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Sent,
    Approved,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Sent => "sent",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for RequestStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(RequestStatus::Sent),
            "approved" => Ok(RequestStatus::Approved),
            "rejected" => Ok(RequestStatus::Rejected),
            other => anyhow::bail!("unknown request status: {}", other),
        }
    }
}

/// A listener's play request as recorded in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub genre: Genre,
    pub platform: Platform,
    /// Opaque source locator (video URL or platform id).
    pub track: String,
    pub username: String,
    #[serde(default)]
    pub message: String,
    pub title: String,
    pub user_id: String,
    pub status: RequestStatus,
    pub timestamp: DateTime<Utc>,
}

/// An approved request enriched with its resolved playback duration.
/// `duration_secs` is fixed once assigned and never renegotiated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    #[serde(flatten)]
    pub request: Request,
    pub duration_secs: u32,
}

/// The single track currently live for a (genre, platform) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NowPlaying {
    #[serde(flatten)]
    pub entry: QueueEntry,
    pub started_at: DateTime<Utc>,
}

impl NowPlaying {
    /// A track is playing iff `now - started_at < duration_secs`.
    pub fn is_playing(&self, now: DateTime<Utc>) -> bool {
        (now - self.started_at).num_seconds() < i64::from(self.entry.duration_secs)
    }

    /// Seconds until natural expiry.  Negative once the track has ended.
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        i64::from(self.entry.duration_secs) - (now - self.started_at).num_seconds()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Success,
    Error,
}

/// Personal message delivered on a user's notification channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: String,
    pub message: String,
    pub kind: NotificationKind,
    pub read: bool,
}

/// Queue and now-playing slot of one (genre, platform) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationView {
    pub genre: Genre,
    pub platform: Platform,
    pub queue: Vec<QueueEntry>,
    pub now_playing: Option<NowPlaying>,
}

/// Everything a freshly connected client needs to render without polling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FullState {
    pub stations: Vec<StationView>,
    pub selections: HashMap<Genre, Platform>,
    pub moderation_queue: Vec<Request>,
}
