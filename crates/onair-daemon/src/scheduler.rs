//! The playback scheduling engine: per-(genre, platform) FIFO queues, the
//! now-playing slots, and the one-shot expiry timers that drive automatic
//! succession.
//!
//! One `Scheduler` instance owns all mutable playback state.  Each pair has
//! its own mutex so a slow operation on one station never stalls another;
//! the map of pairs itself is built once and never changes.  Timers are
//! re-derivable: the armed sleep is only a wake-up call, the authoritative
//! expiry is always `started_at + duration_secs` in the stored state.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use onair_proto::model::{
    FullState, Genre, Notification, NowPlaying, Platform, QueueEntry, Request, StationView,
};

use crate::events::{BroadcastMessage, EventSender};
use crate::snapshot::{Snapshot, SnapshotStore, StationSnapshot};

/// Queue and playback state of one (genre, platform) pair.
struct StationState {
    queue: VecDeque<QueueEntry>,
    now_playing: Option<NowPlaying>,
    /// Armed expiry timer, at most one per pair.
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever the timer is armed or cancelled.  A fire whose
    /// generation no longer matches the stored value is stale and ignored.
    timer_gen: u64,
}

impl StationState {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            now_playing: None,
            timer: None,
            timer_gen: 0,
        }
    }
}

/// What changed when a pair advanced; broadcast after the pair lock drops.
struct Advanced {
    entries: Vec<QueueEntry>,
    current: Option<NowPlaying>,
}

pub struct Scheduler {
    me: Weak<Scheduler>,
    stations: HashMap<(Genre, Platform), Arc<Mutex<StationState>>>,
    selections: RwLock<HashMap<Genre, Platform>>,
    /// In-memory mirror of the ledger's `sent` rows.  The ledger stays
    /// authoritative; this copy feeds the connect-time bootstrap and the
    /// snapshot.
    pending: RwLock<Vec<Request>>,
    notifications: RwLock<Vec<Notification>>,
    events: EventSender,
    store: SnapshotStore,
    /// Monotonic revision counter, bumped on every broadcast.  Clients use
    /// it to detect missed updates and request a resync.
    rev: AtomicU64,
}

impl Scheduler {
    pub fn new(events: EventSender, store: SnapshotStore) -> Arc<Self> {
        let mut stations = HashMap::new();
        let mut selections = HashMap::new();
        for genre in Genre::ALL {
            selections.insert(genre, Platform::Youtube);
            for platform in Platform::ALL {
                stations.insert((genre, platform), Arc::new(Mutex::new(StationState::new())));
            }
        }

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            stations,
            selections: RwLock::new(selections),
            pending: RwLock::new(Vec::new()),
            notifications: RwLock::new(Vec::new()),
            events,
            store,
            rev: AtomicU64::new(0),
        })
    }

    fn station(&self, genre: Genre, platform: Platform) -> Arc<Mutex<StationState>> {
        Arc::clone(
            self.stations
                .get(&(genre, platform))
                .expect("all genre/platform pairs are built at construction"),
        )
    }

    pub fn rev(&self) -> u64 {
        self.rev.load(Ordering::Relaxed)
    }

    pub(crate) fn broadcast(&self, message: BroadcastMessage) {
        self.rev.fetch_add(1, Ordering::Relaxed);
        // SendError only means there are zero receivers right now.
        let _ = self.events.send(message);
    }

    /// Append an approved, duration-resolved entry to its pair's queue.
    /// Starts playback when the pair is idle.
    pub async fn enqueue(&self, entry: QueueEntry) {
        if entry.duration_secs == 0 {
            warn!(id = %entry.request.id, "Dropping queue entry without a duration");
            return;
        }

        let genre = entry.request.genre;
        let platform = entry.request.platform;
        let station = self.station(genre, platform);
        let mut state = station.lock().await;

        state.queue.push_back(entry);
        self.broadcast(BroadcastMessage::Queue {
            genre,
            platform,
            entries: state.queue.iter().cloned().collect(),
        });

        let idle = state.now_playing.is_none() && state.timer.is_none();
        let advanced = idle.then(|| self.advance_locked(&mut state, genre, platform));
        drop(state);

        if let Some(advanced) = advanced {
            self.publish_advanced(genre, platform, advanced);
        }
        self.persist().await;
    }

    /// Start the next track for a pair (or clear the slot when the queue is
    /// empty).  This is the sole path that ever starts a track.
    pub async fn advance(&self, genre: Genre, platform: Platform) {
        let station = self.station(genre, platform);
        let mut state = station.lock().await;
        let advanced = self.advance_locked(&mut state, genre, platform);
        drop(state);

        self.publish_advanced(genre, platform, advanced);
        self.persist().await;
    }

    /// Pop-and-start under the pair lock.  Always disarms any pending timer
    /// first, so re-invocation while armed can never leave two expiries
    /// outstanding for the same pair.
    fn advance_locked(
        &self,
        state: &mut StationState,
        genre: Genre,
        platform: Platform,
    ) -> Advanced {
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.timer_gen = state.timer_gen.wrapping_add(1);

        let Some(next) = state.queue.pop_front() else {
            state.now_playing = None;
            return Advanced {
                entries: Vec::new(),
                current: None,
            };
        };

        let current = NowPlaying {
            entry: next,
            started_at: Utc::now(),
        };
        info!(
            %genre, %platform,
            id = %current.entry.request.id,
            duration_secs = current.entry.duration_secs,
            "Starting track"
        );
        state.now_playing = Some(current.clone());
        self.arm_timer(state, genre, platform, u64::from(current.entry.duration_secs));

        Advanced {
            entries: state.queue.iter().cloned().collect(),
            current: Some(current),
        }
    }

    fn arm_timer(&self, state: &mut StationState, genre: Genre, platform: Platform, secs: u64) {
        let gen = state.timer_gen;
        let Some(scheduler) = self.me.upgrade() else {
            return;
        };
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            scheduler.expire(genre, platform, gen).await;
        }));
    }

    /// Timer callback.  The generation check makes cancellation best-effort
    /// safe: a fire that raced a re-arm is a no-op.
    async fn expire(&self, genre: Genre, platform: Platform, gen: u64) {
        let station = self.station(genre, platform);
        let mut state = station.lock().await;
        if state.timer_gen != gen {
            debug!(%genre, %platform, "Ignoring stale expiry timer");
            return;
        }
        // This task *is* the stored timer; dropping the handle instead of
        // aborting it lets the rest of this call run to completion.
        state.timer = None;
        debug!(%genre, %platform, "Track expired");

        let advanced = self.advance_locked(&mut state, genre, platform);
        drop(state);

        self.publish_advanced(genre, platform, advanced);
        self.persist().await;
    }

    fn publish_advanced(&self, genre: Genre, platform: Platform, advanced: Advanced) {
        if advanced.current.is_some() {
            self.broadcast(BroadcastMessage::Queue {
                genre,
                platform,
                entries: advanced.entries,
            });
        }
        self.broadcast(BroadcastMessage::NowPlaying {
            genre,
            platform,
            current: advanced.current,
        });
    }

    /// Current queue and now-playing entry for a pair.  Self-healing: a
    /// stale slot (e.g. a timer lost to a crash) with queued entries
    /// triggers an advance instead of reporting the dead track.
    pub async fn query_sync(
        &self,
        genre: Genre,
        platform: Platform,
    ) -> (Vec<QueueEntry>, Option<NowPlaying>) {
        let station = self.station(genre, platform);
        let mut state = station.lock().await;
        let now = Utc::now();

        let playing = state
            .now_playing
            .as_ref()
            .is_some_and(|current| current.is_playing(now));
        if playing {
            return (
                state.queue.iter().cloned().collect(),
                state.now_playing.clone(),
            );
        }

        if !state.queue.is_empty() {
            let advanced = self.advance_locked(&mut state, genre, platform);
            let result = (advanced.entries.clone(), advanced.current.clone());
            drop(state);
            self.publish_advanced(genre, platform, advanced);
            self.persist().await;
            return result;
        }

        let was_stale = state.now_playing.take().is_some();
        drop(state);
        if was_stale {
            self.broadcast(BroadcastMessage::NowPlaying {
                genre,
                platform,
                current: None,
            });
            self.persist().await;
        }
        (Vec::new(), None)
    }

    /// Change which platform a genre's listeners are steered to.  The other
    /// platform's queue and timer are untouched; a live track on the target
    /// pair keeps its timeline, with the timer re-derived from the stored
    /// start instant rather than reset to the full duration.
    pub async fn switch_platform(&self, genre: Genre, platform: Platform) {
        self.selections.write().await.insert(genre, platform);
        info!(%genre, %platform, "Platform selection changed");

        let station = self.station(genre, platform);
        let mut state = station.lock().await;
        let now = Utc::now();

        let live = state
            .now_playing
            .as_ref()
            .filter(|current| current.is_playing(now))
            .cloned();
        if let Some(current) = live {
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.timer_gen = state.timer_gen.wrapping_add(1);
            let remaining = current.remaining_secs(now).max(1) as u64;
            self.arm_timer(&mut state, genre, platform, remaining);
            drop(state);
            self.persist().await;
            return;
        }

        if state.now_playing.is_some() || !state.queue.is_empty() {
            let advanced = self.advance_locked(&mut state, genre, platform);
            drop(state);
            self.publish_advanced(genre, platform, advanced);
        } else {
            drop(state);
        }
        self.persist().await;
    }

    pub async fn selection(&self, genre: Genre) -> Platform {
        self.selections
            .read()
            .await
            .get(&genre)
            .copied()
            .unwrap_or(Platform::Youtube)
    }

    /// Read-only view of one pair, without the self-healing side effect.
    pub async fn station_view(&self, genre: Genre, platform: Platform) -> StationView {
        let station = self.station(genre, platform);
        let state = station.lock().await;
        StationView {
            genre,
            platform,
            queue: state.queue.iter().cloned().collect(),
            now_playing: state.now_playing.clone(),
        }
    }

    pub async fn full_state(&self) -> FullState {
        let mut stations = Vec::new();
        for genre in Genre::ALL {
            for platform in Platform::ALL {
                stations.push(self.station_view(genre, platform).await);
            }
        }
        FullState {
            stations,
            selections: self.selections.read().await.clone(),
            moderation_queue: self.pending.read().await.clone(),
        }
    }

    // ── Pending moderation mirror ─────────────────────────────────────────

    pub async fn set_pending(&self, requests: Vec<Request>) {
        *self.pending.write().await = requests;
        self.persist().await;
    }

    pub async fn push_pending(&self, request: Request) {
        self.pending.write().await.push(request);
        self.persist().await;
    }

    /// At-most-once removal: the first decision on an id takes it, any later
    /// one sees `None`.
    pub async fn take_pending(&self, id: &str) -> Option<Request> {
        let mut pending = self.pending.write().await;
        let index = pending.iter().position(|request| request.id == id)?;
        Some(pending.remove(index))
    }

    /// Put a request back after a failed ledger write, keeping submission
    /// order.
    pub async fn restore_pending(&self, request: Request) {
        let mut pending = self.pending.write().await;
        pending.push(request);
        pending.sort_by_key(|request| request.timestamp);
    }

    pub async fn pending(&self) -> Vec<Request> {
        self.pending.read().await.clone()
    }

    // ── User notifications ────────────────────────────────────────────────

    pub async fn push_notification(&self, notification: Notification) {
        self.notifications.write().await.push(notification);
    }

    pub async fn notifications_for(&self, user_id: &str) -> Vec<Notification> {
        self.notifications
            .read()
            .await
            .iter()
            .filter(|notification| notification.user_id == user_id)
            .cloned()
            .collect()
    }

    // ── Snapshot persistence ──────────────────────────────────────────────

    async fn capture(&self) -> Snapshot {
        let mut stations = Vec::new();
        for genre in Genre::ALL {
            for platform in Platform::ALL {
                let station = self.station(genre, platform);
                let state = station.lock().await;
                stations.push(StationSnapshot {
                    genre,
                    platform,
                    queue: state.queue.iter().cloned().collect(),
                    now_playing: state.now_playing.clone(),
                });
            }
        }
        Snapshot {
            stations,
            selections: self.selections.read().await.clone(),
            pending: self.pending.read().await.clone(),
        }
    }

    /// Write the current state to the snapshot store.  Failures are logged,
    /// never fatal: the radio keeps playing without durability.
    pub async fn persist(&self) {
        let snapshot = self.capture().await;
        if let Err(e) = self.store.save(&snapshot) {
            warn!("Failed to persist snapshot: {:#}", e);
        }
    }

    /// Rebuild state from the last snapshot, resuming every still-live track
    /// from its original start instant.  Expired slots roll forward so a
    /// track that should have finished never blocks its queue.
    pub async fn restore(&self) {
        let Some(snapshot) = self.store.load() else {
            info!("No snapshot found, starting with empty state");
            return;
        };

        *self.selections.write().await = snapshot.selections;
        *self.pending.write().await = snapshot.pending;

        let now = Utc::now();
        for captured in snapshot.stations {
            let genre = captured.genre;
            let platform = captured.platform;
            let station = self.station(genre, platform);
            let mut state = station.lock().await;
            state.queue = captured.queue.into();

            match captured.now_playing {
                Some(current) if current.is_playing(now) => {
                    let remaining = current.remaining_secs(now).max(1) as u64;
                    info!(
                        %genre, %platform,
                        id = %current.entry.request.id,
                        remaining_secs = remaining,
                        "Resuming track from snapshot"
                    );
                    state.now_playing = Some(current);
                    state.timer_gen = state.timer_gen.wrapping_add(1);
                    self.arm_timer(&mut state, genre, platform, remaining);
                }
                Some(expired) => {
                    info!(
                        %genre, %platform,
                        id = %expired.entry.request.id,
                        "Snapshot track already expired, rolling forward"
                    );
                    let advanced = self.advance_locked(&mut state, genre, platform);
                    drop(state);
                    self.publish_advanced(genre, platform, advanced);
                }
                None => {
                    if !state.queue.is_empty() {
                        let advanced = self.advance_locked(&mut state, genre, platform);
                        drop(state);
                        self.publish_advanced(genre, platform, advanced);
                    }
                }
            }
        }

        self.persist().await;
    }

    /// Place a pair into a known state without arming a timer.  Exists so
    /// tests can model a daemon that lost its timers.
    #[cfg(test)]
    async fn inject(
        &self,
        genre: Genre,
        platform: Platform,
        queue: Vec<QueueEntry>,
        now_playing: Option<NowPlaying>,
    ) {
        let station = self.station(genre, platform);
        let mut state = station.lock().await;
        state.queue = queue.into();
        state.now_playing = now_playing;
    }
}
