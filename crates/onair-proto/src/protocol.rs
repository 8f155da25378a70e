use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{FullState, Genre, Notification, NowPlaying, Platform, QueueEntry, Request};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Fields of a request as submitted by a listener, before the daemon assigns
/// an id, timestamp and status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestDraft {
    pub track: String,
    pub username: String,
    #[serde(default)]
    pub message: String,
    pub title: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModerationAction {
    Approve,
    Reject,
}

/// Messages sent from clients to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "kebab-case")]
pub enum Command {
    GetQueue {
        genre: Genre,
        platform: Platform,
    },
    GetModerationQueue,
    ChangePlatform {
        genre: Genre,
        platform: Platform,
    },
    SyncPlatform {
        genre: Genre,
    },
    NewRequest {
        genre: Genre,
        platform: Platform,
        request: RequestDraft,
    },
    ModerateRequest {
        id: String,
        action: ModerationAction,
        #[serde(default)]
        reason: Option<String>,
    },
    RegisterUser {
        user_id: String,
    },
}

/// Messages sent from the daemon to clients (broadcasts and direct replies).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast", rename_all = "kebab-case")]
pub enum Broadcast {
    /// Sent immediately on connect: daemon version + full state bootstrap.
    Hello {
        protocol_version: u32,
        daemon_rev: u64,
        state: FullState,
    },
    QueueUpdate {
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
    CooldownUpdate {
        genre: Genre,
        user_id: String,
        until: DateTime<Utc>,
    },
    NewNotification {
        notification: Notification,
    },
    /// Direct reply to `sync-platform`: the genre's current platform
    /// selection and that pair's live track.
    PlatformSync {
        genre: Genre,
        platform: Platform,
        current: Option<NowPlaying>,
    },
    Error {
        message: String,
    },
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }

    /// Total size of the frame at the head of `data`, if the length header is
    /// complete.  Lets callers distinguish a partial frame from a complete
    /// but malformed one.
    pub fn frame_len(data: &[u8]) -> Option<usize> {
        if data.len() < 4 {
            return None;
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        Some(4 + len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_encode_decode() {
        let msg = Message::Command(Command::GetQueue {
            genre: Genre::Rock,
            platform: Platform::Youtube,
        });
        let encoded = msg.encode().unwrap();
        let (decoded, len) = Message::decode(&encoded).unwrap();
        assert_eq!(len, encoded.len());
        match decoded {
            Message::Command(Command::GetQueue { genre, platform }) => {
                assert_eq!(genre, Genre::Rock);
                assert_eq!(platform, Platform::Youtube);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_command_tag_is_kebab_case() {
        let msg = Message::Command(Command::GetModerationQueue);
        let encoded = msg.encode().unwrap();
        let json = std::str::from_utf8(&encoded[4..]).unwrap();
        assert!(json.contains("\"cmd\":\"get-moderation-queue\""));
    }

    #[test]
    fn test_hello_encode_decode() {
        let msg = Message::Broadcast(Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            daemon_rev: 42,
            state: FullState::default(),
        });
        let encoded = msg.encode().unwrap();
        let (decoded, _) = Message::decode(&encoded).unwrap();
        match decoded {
            Message::Broadcast(Broadcast::Hello {
                protocol_version,
                daemon_rev,
                ..
            }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(daemon_rev, 42);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_decode_partial_frame() {
        let msg = Message::Command(Command::SyncPlatform { genre: Genre::Rock });
        let encoded = msg.encode().unwrap();
        assert!(Message::decode(&encoded[..2]).is_err());
        assert!(Message::decode(&encoded[..encoded.len() - 1]).is_err());
        assert_eq!(Message::frame_len(&encoded), Some(encoded.len()));
        assert_eq!(Message::frame_len(&encoded[..2]), None);
    }

    #[test]
    fn test_unknown_genre_is_rejected() {
        let body = br#"{"cmd":"get-queue","genre":"jazz","platform":"youtube"}"#;
        let mut framed = (body.len() as u32).to_be_bytes().to_vec();
        framed.extend_from_slice(body);
        assert!(Message::decode(&framed).is_err());
        // The frame is complete, so a reader can skip it and keep going.
        assert_eq!(Message::frame_len(&framed), Some(framed.len()));
    }

    #[test]
    fn test_moderate_request_reason_defaults_to_none() {
        let body = br#"{"cmd":"moderate-request","id":"x","action":"approve"}"#;
        let mut framed = (body.len() as u32).to_be_bytes().to_vec();
        framed.extend_from_slice(body);
        let (decoded, _) = Message::decode(&framed).unwrap();
        match decoded {
            Message::Command(Command::ModerateRequest { id, action, reason }) => {
                assert_eq!(id, "x");
                assert_eq!(action, ModerationAction::Approve);
                assert!(reason.is_none());
            }
            _ => panic!("Wrong message type"),
        }
    }
}
