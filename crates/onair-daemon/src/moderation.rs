//! Moderation workflow: the single place a request moves from `sent` to a
//! terminal state.
//!
//! Ordering on approval is ledger-first: the `approved` row is committed
//! before the entry reaches the queue, so a queue entry without a durable
//! record can never exist.  The inverse window (row committed, process dies
//! before the enqueue) loses only the queue entry, never the audit trail.

use std::sync::Arc;

use anyhow::Context;
use chrono::{Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use onair_proto::model::{
    Genre, Notification, NotificationKind, Platform, QueueEntry, Request, RequestStatus,
};
use onair_proto::protocol::{ModerationAction, RequestDraft};

use crate::events::BroadcastMessage;
use crate::ledger::Ledger;
use crate::resolver::DurationResolver;
use crate::scheduler::Scheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecideOutcome {
    Approved,
    Rejected,
    /// The id matched no pending request: already decided or never existed.
    NotFound,
}

pub struct Moderation {
    ledger: Arc<Ledger>,
    resolver: Arc<DurationResolver>,
    scheduler: Arc<Scheduler>,
    cooldown_secs: i64,
}

impl Moderation {
    pub fn new(
        ledger: Arc<Ledger>,
        resolver: Arc<DurationResolver>,
        scheduler: Arc<Scheduler>,
        cooldown_secs: u64,
    ) -> Self {
        Self {
            ledger,
            resolver,
            scheduler,
            cooldown_secs: cooldown_secs as i64,
        }
    }

    /// Rebuild the pending set on startup.  The ledger's `sent` rows are
    /// authoritative; the snapshot copy already restored into the scheduler
    /// only survives when the ledger cannot be read.
    pub async fn init_pending(&self) {
        match self.ledger.select_pending().await {
            Ok(requests) => {
                info!(count = requests.len(), "Loaded pending requests from ledger");
                self.scheduler.set_pending(requests).await;
            }
            Err(e) => {
                warn!("Could not read pending requests from ledger, keeping snapshot copy: {}", e);
            }
        }
    }

    /// Record a new listener request and surface it to moderators.
    pub async fn submit(
        &self,
        genre: Genre,
        platform: Platform,
        draft: RequestDraft,
    ) -> anyhow::Result<Request> {
        let request = Request {
            id: Uuid::new_v4().to_string(),
            genre,
            platform,
            track: draft.track,
            username: draft.username,
            message: draft.message,
            title: draft.title,
            user_id: draft.user_id,
            status: RequestStatus::Sent,
            timestamp: Utc::now(),
        };

        self.ledger
            .insert_request(&request)
            .await
            .context("failed to record request")?;
        info!(id = %request.id, %genre, %platform, user = %request.user_id, "Request submitted");

        self.scheduler.push_pending(request.clone()).await;
        self.broadcast_pending().await;
        self.scheduler.broadcast(BroadcastMessage::Cooldown {
            genre,
            user_id: request.user_id.clone(),
            until: Utc::now() + Duration::seconds(self.cooldown_secs),
        });

        Ok(request)
    }

    /// Apply a moderation decision.  At most once per id: a second call
    /// reports `NotFound` and changes nothing.
    pub async fn decide(
        &self,
        id: &str,
        action: ModerationAction,
        reason: Option<String>,
    ) -> anyhow::Result<DecideOutcome> {
        let Some(request) = self.scheduler.take_pending(id).await else {
            return Ok(DecideOutcome::NotFound);
        };

        match action {
            ModerationAction::Approve => self.approve(request).await,
            ModerationAction::Reject => self.reject(request, reason).await,
        }
    }

    async fn approve(&self, request: Request) -> anyhow::Result<DecideOutcome> {
        // External lookup runs before any pair lock is taken; a slow
        // metadata source delays this one decision, nothing else.
        let duration_secs = self
            .resolver
            .resolve(request.platform, &request.track)
            .await;

        if let Err(e) = self
            .ledger
            .mark_approved(&request.id, duration_secs, Utc::now())
            .await
        {
            self.scheduler.restore_pending(request).await;
            return Err(e).context("failed to record approval");
        }

        info!(id = %request.id, duration_secs, "Request approved");
        let mut approved = request.clone();
        approved.status = RequestStatus::Approved;
        self.scheduler
            .enqueue(QueueEntry {
                request: approved,
                duration_secs,
            })
            .await;

        self.notify(
            &request.user_id,
            format!("Your request \"{}\" was approved", request.title),
            NotificationKind::Success,
        )
        .await;
        self.broadcast_pending().await;
        Ok(DecideOutcome::Approved)
    }

    async fn reject(
        &self,
        request: Request,
        reason: Option<String>,
    ) -> anyhow::Result<DecideOutcome> {
        if let Err(e) = self.ledger.mark_rejected(&request.id).await {
            self.scheduler.restore_pending(request).await;
            return Err(e).context("failed to record rejection");
        }

        let reason = reason.unwrap_or_else(|| "no reason given".to_string());
        info!(id = %request.id, %reason, "Request rejected");
        self.notify(
            &request.user_id,
            format!("Your request \"{}\" was rejected: {}", request.title, reason),
            NotificationKind::Error,
        )
        .await;
        self.broadcast_pending().await;
        Ok(DecideOutcome::Rejected)
    }

    async fn notify(&self, user_id: &str, message: String, kind: NotificationKind) {
        let notification = Notification {
            user_id: user_id.to_string(),
            message,
            kind,
            read: false,
        };
        self.scheduler.push_notification(notification.clone()).await;
        self.scheduler
            .broadcast(BroadcastMessage::Notification { notification });
    }

    /// Current pending set, re-read from the ledger so concurrent moderators
    /// converge on the same view.  Falls back to the in-memory mirror when
    /// the ledger is unreachable.
    pub async fn pending(&self) -> Vec<Request> {
        match self.ledger.select_pending().await {
            Ok(requests) => {
                self.scheduler.set_pending(requests.clone()).await;
                requests
            }
            Err(e) => {
                warn!("Could not read pending requests from ledger, serving mirror: {}", e);
                self.scheduler.pending().await
            }
        }
    }

    async fn broadcast_pending(&self) {
        let requests = self.pending().await;
        self.scheduler
            .broadcast(BroadcastMessage::ModerationQueue { requests });
    }
}
