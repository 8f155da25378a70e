pub mod events;
pub mod http;
pub mod ledger;
pub mod moderation;
pub mod resolver;
pub mod scheduler;
pub mod snapshot;
pub mod socket;

use std::sync::Arc;

use crate::events::EventSender;
use crate::ledger::Ledger;
use crate::moderation::Moderation;
use crate::resolver::SearchService;
use crate::scheduler::Scheduler;

/// Shared handles passed to the socket server and the HTTP API.
#[derive(Clone)]
pub struct DaemonContext {
    pub scheduler: Arc<Scheduler>,
    pub moderation: Arc<Moderation>,
    pub ledger: Arc<Ledger>,
    pub search: Arc<SearchService>,
    pub events: EventSender,
}
