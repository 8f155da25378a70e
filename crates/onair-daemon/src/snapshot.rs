//! Restart-recovery snapshot of the scheduler state.
//!
//! The snapshot is a dedicated serializable type, decoupled from the live
//! structures: the scheduler captures into it and restores from it, so
//! persisted and live state never alias.  A single JSON file is overwritten
//! wholesale on every state-changing operation.  There is no schema
//! versioning: a file that fails to parse in full is discarded and the
//! daemon starts empty.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use onair_proto::model::{Genre, NowPlaying, Platform, QueueEntry, Request};

/// Captured queue and now-playing slot of one (genre, platform) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationSnapshot {
    pub genre: Genre,
    pub platform: Platform,
    pub queue: Vec<QueueEntry>,
    pub now_playing: Option<NowPlaying>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub stations: Vec<StationSnapshot>,
    pub selections: HashMap<Genre, Platform>,
    pub pending: Vec<Request>,
}

pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn save(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(snapshot)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    pub fn load(&self) -> Option<Snapshot> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<Snapshot>(&content) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("Discarding unreadable snapshot {:?}: {}", self.path, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use onair_proto::model::RequestStatus;

    fn sample() -> Snapshot {
        let request = Request {
            id: "r1".into(),
            genre: Genre::Rock,
            platform: Platform::Youtube,
            track: "https://www.youtube.com/watch?v=abc".into(),
            username: "ada".into(),
            message: String::new(),
            title: "Track".into(),
            user_id: "u1".into(),
            status: RequestStatus::Approved,
            timestamp: Utc::now(),
        };
        Snapshot {
            stations: vec![StationSnapshot {
                genre: Genre::Rock,
                platform: Platform::Youtube,
                queue: vec![QueueEntry {
                    request: request.clone(),
                    duration_secs: 120,
                }],
                now_playing: None,
            }],
            selections: HashMap::from([(Genre::Rock, Platform::Youtube)]),
            pending: vec![Request {
                status: RequestStatus::Sent,
                ..request
            }],
        }
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("snapshot.json"));

        store.save(&sample()).unwrap();
        let loaded = store.load().expect("snapshot should load");

        assert_eq!(loaded.stations.len(), 1);
        assert_eq!(loaded.stations[0].queue[0].duration_secs, 120);
        assert_eq!(loaded.selections[&Genre::Rock], Platform::Youtube);
        assert_eq!(loaded.pending[0].status, RequestStatus::Sent);
    }

    #[test]
    fn test_missing_file_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("nope.json"));
        assert!(store.load().is_none());
    }

    #[test]
    fn test_corrupt_file_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = SnapshotStore::new(path);
        assert!(store.load().is_none());
    }

    #[test]
    fn test_partial_snapshot_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        // Missing `pending`: stale layouts are rebuilt empty, not guessed at.
        std::fs::write(&path, r#"{"stations": [], "selections": {}}"#).unwrap();
        let store = SnapshotStore::new(path);
        assert!(store.load().is_none());
    }
}
