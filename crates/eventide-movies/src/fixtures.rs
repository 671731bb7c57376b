//! In-memory catalogue wiring shared by the handler tests.

use std::sync::Arc;

use eventide_core::event::Event;
use eventide_engine::event_log::EventLog;
use eventide_engine::hybrid::HybridReader;
use eventide_engine::reconciler::SnapshotReconciler;
use eventide_engine::repository::EventRepository;
use eventide_engine::snapshot_store::SnapshotStore;
use eventide_test_support::{InMemoryDocumentStore, ManualClock};
use tokio_util::sync::CancellationToken;

use crate::domain::events::{MovieEvent, registry};
use crate::domain::projections::MovieProjection;

pub(crate) struct Catalogue {
    pub clock: Arc<ManualClock>,
    pub log: EventLog<MovieEvent>,
    pub repo: EventRepository<MovieProjection>,
    pub snapshots: SnapshotStore<MovieProjection>,
    pub reader: HybridReader<MovieProjection>,
    pub reconciler: SnapshotReconciler<MovieProjection>,
}

impl Catalogue {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::fixed());
        let events = InMemoryDocumentStore::with_clock(clock.clone());
        let snapshot_docs = InMemoryDocumentStore::with_clock(clock.clone());
        let log = EventLog::new(Arc::new(events), registry().unwrap(), clock.clone());
        let snapshots = SnapshotStore::new(Arc::new(snapshot_docs));
        Self {
            clock,
            repo: EventRepository::new(log.clone()),
            reader: HybridReader::new(snapshots.clone(), log.clone()),
            reconciler: SnapshotReconciler::new(snapshots.clone(), log.clone()),
            snapshots,
            log,
        }
    }

    pub async fn events_of(&self, movie_id: &str) -> Vec<Event<MovieEvent>> {
        self.log
            .read_forward(movie_id, 0, None, &CancellationToken::new())
            .await
            .unwrap()
    }

    /// Feeds every event of `movie_id` to the reconciler.
    pub async fn project(&self, movie_id: &str) {
        let events = self.events_of(movie_id).await;
        self.reconciler.reconcile(events).await.unwrap();
    }
}
