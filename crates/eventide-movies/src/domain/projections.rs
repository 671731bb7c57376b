//! Read model of a movie.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use eventide_core::projection::{ApplyContext, Projection};
use serde::{Deserialize, Serialize};

use crate::domain::events::{MovieCreated, MovieEvent, MovieNameChanged, MovieRated, MovieTitled};

/// Partition holding every movie snapshot.
pub const MOVIES_PARTITION: &str = "movies";

/// State of one movie folded from its stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovieProjection {
    /// Current name.
    pub name: String,
    /// Year of first release; unknown for movies created by the first
    /// catalogue version.
    pub release_year: Option<u16>,
    /// Number of ratings received.
    pub rating_count: u32,
    /// Sum of all stars received.
    pub rating_total: u32,
    /// Commit time of the stream's first event.
    pub first_seen_at: Option<DateTime<Utc>>,
    /// Every name the movie has carried, keyed by the revision that set it.
    pub name_history: BTreeMap<u64, String>,
}

impl MovieProjection {
    /// Mean of the ratings, or `None` if the movie has not been rated.
    #[must_use]
    pub fn average_rating(&self) -> Option<f64> {
        (self.rating_count > 0)
            .then(|| f64::from(self.rating_total) / f64::from(self.rating_count))
    }

    fn rename(&mut self, name: &str, revision: u64) {
        self.name = name.to_owned();
        self.name_history.insert(revision, name.to_owned());
    }
}

impl Projection for MovieProjection {
    type Event = MovieEvent;

    fn partition_key(_stream_id: &str) -> String {
        MOVIES_PARTITION.to_owned()
    }

    fn apply(&mut self, event: &MovieEvent, context: &ApplyContext<'_>) {
        if self.first_seen_at.is_none() {
            self.first_seen_at = Some(context.timestamp);
        }
        match event {
            MovieEvent::Created(MovieCreated { name, release_year }) => {
                self.rename(name, context.event_number);
                self.release_year = Some(*release_year);
            }
            MovieEvent::Titled(MovieTitled { title: name })
            | MovieEvent::NameChanged(MovieNameChanged { name }) => {
                self.rename(name, context.event_number);
            }
            MovieEvent::Rated(MovieRated { stars }) => {
                self.rating_count += 1;
                self.rating_total += u32::from(*stars);
            }
            MovieEvent::Deleted(_) => {}
        }
    }

    fn is_deletion(event: &MovieEvent) -> bool {
        matches!(event, MovieEvent::Deleted(_))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use eventide_core::event::{Event, EventMetadata};
    use eventide_core::projection::Snapshot;
    use uuid::Uuid;

    use super::*;
    use crate::domain::events::MovieDeleted;

    fn event(number: u64, body: MovieEvent) -> Event<MovieEvent> {
        let start = Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap();
        Event {
            event_id: Uuid::new_v4(),
            stream_id: "movie-1".to_owned(),
            event_number: number,
            body,
            timestamp: start + Duration::minutes(i64::try_from(number).unwrap()),
            metadata: EventMetadata::new(),
            expires_at: None,
        }
    }

    #[test]
    fn test_fold_tracks_names_ratings_and_first_seen() {
        // Arrange
        let mut snapshot = Snapshot::<MovieProjection>::for_stream("movie-1");
        let events = vec![
            event(
                1,
                MovieEvent::Created(MovieCreated {
                    name: "Alien".to_owned(),
                    release_year: 1979,
                }),
            ),
            event(2, MovieEvent::Rated(MovieRated { stars: 5 })),
            event(
                3,
                MovieEvent::NameChanged(MovieNameChanged {
                    name: "Alien (Director's Cut)".to_owned(),
                }),
            ),
            event(4, MovieEvent::Rated(MovieRated { stars: 4 })),
        ];

        // Act
        snapshot.catch_up(&events).unwrap();

        // Assert
        let state = &snapshot.state;
        assert_eq!(snapshot.revision, 4);
        assert_eq!(state.name, "Alien (Director's Cut)");
        assert_eq!(state.release_year, Some(1979));
        assert_eq!(state.average_rating(), Some(4.5));
        assert_eq!(state.first_seen_at, Some(events[0].timestamp));
        assert_eq!(
            state.name_history.values().collect::<Vec<_>>(),
            vec!["Alien", "Alien (Director's Cut)"]
        );
        assert_eq!(state.name_history.keys().copied().collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_retired_titled_event_leaves_release_year_unknown() {
        let mut snapshot = Snapshot::<MovieProjection>::for_stream("movie-1");

        snapshot
            .fold(&event(
                1,
                MovieEvent::Titled(MovieTitled {
                    title: "Heat".to_owned(),
                }),
            ))
            .unwrap();

        assert_eq!(snapshot.state.name, "Heat");
        assert_eq!(snapshot.state.release_year, None);
        assert_eq!(snapshot.state.average_rating(), None);
    }

    #[test]
    fn test_deleted_event_marks_snapshot_deleted() {
        let mut snapshot = Snapshot::<MovieProjection>::for_stream("movie-1");
        let events = vec![
            event(
                1,
                MovieEvent::Created(MovieCreated {
                    name: "Alien".to_owned(),
                    release_year: 1979,
                }),
            ),
            event(2, MovieEvent::Deleted(MovieDeleted {})),
        ];

        snapshot.catch_up(&events).unwrap();

        assert_eq!(snapshot.deleted_at, Some(events[1].timestamp));
        assert_eq!(snapshot.state.name, "Alien");
    }

    #[test]
    fn test_snapshot_document_round_trips_name_history() {
        let mut snapshot = Snapshot::<MovieProjection>::for_stream("movie-1");
        snapshot
            .fold(&event(
                1,
                MovieEvent::Created(MovieCreated {
                    name: "Alien".to_owned(),
                    release_year: 1979,
                }),
            ))
            .unwrap();

        let document = snapshot.to_document().unwrap();
        let restored = Snapshot::<MovieProjection>::from_document(&document).unwrap();

        assert_eq!(document.partition_key, MOVIES_PARTITION);
        assert_eq!(document.body["state"]["nameHistory"]["1"], "Alien");
        assert_eq!(restored, snapshot);
    }
}
