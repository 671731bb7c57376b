//! Ticket domain used by the engine's unit tests.

use std::sync::Arc;

use eventide_core::document::DocumentStore;
use eventide_core::event::{Event, EventBody, PendingEvent};
use eventide_core::projection::{ApplyContext, Projection};
use eventide_core::registry::EventTypeRegistry;
use eventide_test_support::{InMemoryDocumentStore, ManualClock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event_log::EventLog;
use crate::snapshot_store::SnapshotStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct TicketOpened {
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct TicketRetitled {
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct TicketClosed {}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TicketEvent {
    Opened(TicketOpened),
    Retitled(TicketRetitled),
    Closed(TicketClosed),
    /// Never registered; exercises the registry check on append.
    Unregistered,
}

impl From<TicketOpened> for TicketEvent {
    fn from(e: TicketOpened) -> Self {
        Self::Opened(e)
    }
}

impl From<TicketRetitled> for TicketEvent {
    fn from(e: TicketRetitled) -> Self {
        Self::Retitled(e)
    }
}

impl From<TicketClosed> for TicketEvent {
    fn from(e: TicketClosed) -> Self {
        Self::Closed(e)
    }
}

impl EventBody for TicketEvent {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Opened(_) => "ticket.opened",
            Self::Retitled(_) => "ticket.retitled",
            Self::Closed(_) => "ticket.closed",
            Self::Unregistered => "ticket.unregistered",
        }
    }

    fn to_payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Opened(e) => serde_json::to_value(e),
            Self::Retitled(e) => serde_json::to_value(e),
            Self::Closed(e) => serde_json::to_value(e),
            Self::Unregistered => Ok(Value::Null),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Ticket {
    pub title: String,
    pub titles_seen: Vec<String>,
}

impl Projection for Ticket {
    type Event = TicketEvent;

    fn partition_key(_stream_id: &str) -> String {
        "tickets".to_owned()
    }

    fn apply(&mut self, event: &TicketEvent, _context: &ApplyContext<'_>) {
        match event {
            TicketEvent::Opened(TicketOpened { title })
            | TicketEvent::Retitled(TicketRetitled { title }) => {
                self.title.clone_from(title);
                self.titles_seen.push(title.clone());
            }
            TicketEvent::Closed(_) | TicketEvent::Unregistered => {}
        }
    }

    fn is_deletion(event: &TicketEvent) -> bool {
        matches!(event, TicketEvent::Closed(_))
    }
}

pub(crate) fn registry() -> Arc<EventTypeRegistry<TicketEvent>> {
    Arc::new(
        EventTypeRegistry::new()
            .register::<TicketOpened>("ticket.opened")
            .and_then(|r| r.register::<TicketRetitled>("ticket.retitled"))
            .and_then(|r| r.register::<TicketClosed>("ticket.closed"))
            .unwrap(),
    )
}

pub(crate) fn opened(stream_id: &str, title: &str) -> PendingEvent<TicketEvent> {
    PendingEvent::new(
        stream_id,
        TicketEvent::Opened(TicketOpened {
            title: title.to_owned(),
        }),
    )
}

pub(crate) fn retitled(stream_id: &str, title: &str) -> PendingEvent<TicketEvent> {
    PendingEvent::new(
        stream_id,
        TicketEvent::Retitled(TicketRetitled {
            title: title.to_owned(),
        }),
    )
}

pub(crate) fn closed(stream_id: &str) -> PendingEvent<TicketEvent> {
    PendingEvent::new(stream_id, TicketEvent::Closed(TicketClosed {}))
}

/// In-memory event and snapshot containers sharing a manual clock.
pub(crate) struct Harness {
    pub events: InMemoryDocumentStore,
    pub snapshots: InMemoryDocumentStore,
    pub clock: Arc<ManualClock>,
    pub log: EventLog<TicketEvent>,
    pub snapshot_store: SnapshotStore<Ticket>,
}

impl Harness {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::fixed());
        let snapshots = InMemoryDocumentStore::with_clock(clock.clone());
        Self::with_snapshot_backend(clock, snapshots.clone(), Arc::new(snapshots))
    }

    /// Routes snapshot writes through `backend`, which should wrap
    /// `snapshots`.
    pub fn with_snapshot_backend(
        clock: Arc<ManualClock>,
        snapshots: InMemoryDocumentStore,
        backend: Arc<dyn DocumentStore>,
    ) -> Self {
        let events = InMemoryDocumentStore::with_clock(clock.clone());
        let log = EventLog::new(Arc::new(events.clone()), registry(), clock.clone());
        Self {
            events,
            snapshots,
            clock,
            log,
            snapshot_store: SnapshotStore::new(backend),
        }
    }

    /// Opens `stream_id` with the first title, then retitles it with the
    /// rest. Returns every appended event.
    pub async fn seed(&self, stream_id: &str, titles: &[&str]) -> Vec<Event<TicketEvent>> {
        let revision = self.log.revision(stream_id).await.unwrap();
        let pending = titles
            .iter()
            .enumerate()
            .map(|(i, title)| {
                if revision == 0 && i == 0 {
                    opened(stream_id, title)
                } else {
                    retitled(stream_id, title)
                }
            })
            .collect();
        self.log.append(stream_id, revision, pending).await.unwrap()
    }
}
