//! Query handlers for the Movie catalogue context.
//!
//! Three read paths are offered. `get_movie` replays the stream and is always
//! current. `get_movie_snapshot` reads the stored snapshot, which may lag
//! behind the log. `get_movie_with_catchup` and `list_movies` start from
//! snapshots and fold whatever the projector has not applied yet.

use chrono::{DateTime, Utc};
use eventide_core::document::{FilterOp, SortDirection};
use eventide_core::error::DomainError;
use eventide_core::projection::Snapshot;
use eventide_engine::hybrid::HybridReader;
use eventide_engine::repository::EventRepository;
use eventide_engine::snapshot_store::{SnapshotQuery, SnapshotStore};
use futures::TryStreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::domain::projections::{MOVIES_PARTITION, MovieProjection};

/// Read-only view of a movie.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MovieView {
    /// The movie's stream id.
    pub movie_id: String,
    /// Current name.
    pub name: String,
    /// Year of first release, if known.
    pub release_year: Option<u16>,
    /// Mean rating, if rated.
    pub average_rating: Option<f64>,
    /// Number of ratings.
    pub rating_count: u32,
    /// When the movie was first recorded.
    pub first_seen_at: Option<DateTime<Utc>>,
    /// Revision the view was folded through.
    pub revision: u64,
    /// Set when the movie was deleted.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl From<Snapshot<MovieProjection>> for MovieView {
    fn from(snapshot: Snapshot<MovieProjection>) -> Self {
        Self {
            average_rating: snapshot.state.average_rating(),
            movie_id: snapshot.id,
            name: snapshot.state.name,
            release_year: snapshot.state.release_year,
            rating_count: snapshot.state.rating_count,
            first_seen_at: snapshot.state.first_seen_at,
            revision: snapshot.revision,
            deleted_at: snapshot.deleted_at,
        }
    }
}

fn found(
    movie_id: &str,
    snapshot: Option<Snapshot<MovieProjection>>,
) -> Result<MovieView, DomainError> {
    snapshot
        .map(MovieView::from)
        .ok_or_else(|| DomainError::NotFound(movie_id.to_owned()))
}

/// Replays a movie from its stream.
///
/// # Errors
///
/// Returns `DomainError::NotFound` if the movie has no events, or is deleted
/// and `include_deleted` is false.
pub async fn get_movie(
    movie_id: &str,
    include_deleted: bool,
    repo: &EventRepository<MovieProjection>,
    cancel: &CancellationToken,
) -> Result<MovieView, DomainError> {
    let snapshot = repo.get(movie_id, None, include_deleted, cancel).await?;
    found(movie_id, snapshot)
}

/// Reads a movie's stored snapshot as is.
///
/// # Errors
///
/// Returns `DomainError::NotFound` if no snapshot exists yet, or it is
/// deleted and `include_deleted` is false.
pub async fn get_movie_snapshot(
    movie_id: &str,
    include_deleted: bool,
    snapshots: &SnapshotStore<MovieProjection>,
) -> Result<MovieView, DomainError> {
    let snapshot = snapshots
        .get_snapshot(movie_id, MOVIES_PARTITION, include_deleted)
        .await?
        .map(|versioned| versioned.value);
    found(movie_id, snapshot)
}

/// Reads a movie's snapshot and folds the events it is missing.
///
/// # Errors
///
/// Returns `DomainError::NotFound` under the same conditions as
/// [`get_movie`].
pub async fn get_movie_with_catchup(
    movie_id: &str,
    include_deleted: bool,
    reader: &HybridReader<MovieProjection>,
    cancel: &CancellationToken,
) -> Result<MovieView, DomainError> {
    let snapshot = reader
        .get_with_catchup(movie_id, MOVIES_PARTITION, include_deleted, cancel)
        .await?;
    found(movie_id, snapshot)
}

/// Lists live movies by name, optionally only those released in or after
/// `released_from`.
///
/// The year filter applies to the stored snapshots; movies are caught up
/// after they match.
///
/// # Errors
///
/// Returns `DomainError::Cancelled` if `cancel` fires while paging, or any
/// error reading snapshots or streams.
pub async fn list_movies(
    released_from: Option<u16>,
    reader: &HybridReader<MovieProjection>,
    cancel: CancellationToken,
) -> Result<Vec<MovieView>, DomainError> {
    let mut query = SnapshotQuery::new().order_by("name", SortDirection::Ascending);
    if let Some(year) = released_from {
        query = query.filter("releaseYear", FilterOp::Gte, year);
    }
    reader
        .query_with_catchup(Some(MOVIES_PARTITION), &query, false, cancel)
        .map_ok(MovieView::from)
        .try_collect()
        .await
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use eventide_core::clock::Clock;
    use eventide_core::error::DomainError;
    use uuid::Uuid;

    use super::*;
    use crate::application::command_handlers::{
        handle_create_movie, handle_delete_movie, handle_rename_movie,
    };
    use crate::domain::commands::{CreateMovie, DeleteMovie, RenameMovie};
    use crate::fixtures::Catalogue;

    async fn create(catalogue: &Catalogue, movie_id: &str, name: &str, release_year: u16) {
        handle_create_movie(
            &CreateMovie {
                correlation_id: Uuid::new_v4(),
                movie_id: movie_id.to_owned(),
                name: name.to_owned(),
                release_year,
            },
            &catalogue.repo,
        )
        .await
        .unwrap();
    }

    async fn rename(catalogue: &Catalogue, movie_id: &str, expected_revision: u64, name: &str) {
        handle_rename_movie(
            &RenameMovie {
                correlation_id: Uuid::new_v4(),
                movie_id: movie_id.to_owned(),
                expected_revision,
                name: name.to_owned(),
            },
            &catalogue.repo,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_get_movie_returns_replayed_view() {
        // Arrange
        let catalogue = Catalogue::new();
        let created_at = catalogue.clock.now();
        create(&catalogue, "movie-1", "Alien", 1979).await;
        catalogue.clock.advance(Duration::hours(1));
        rename(&catalogue, "movie-1", 1, "Aliens").await;

        // Act
        let view = get_movie("movie-1", false, &catalogue.repo, &CancellationToken::new())
            .await
            .unwrap();

        // Assert
        assert_eq!(view.name, "Aliens");
        assert_eq!(view.revision, 2);
        assert_eq!(view.release_year, Some(1979));
        assert_eq!(view.first_seen_at, Some(created_at));
        assert_eq!(view.average_rating, None);
    }

    #[tokio::test]
    async fn test_get_movie_returns_not_found_when_no_events() {
        // Arrange
        let catalogue = Catalogue::new();

        // Act
        let result = get_movie("movie-1", false, &catalogue.repo, &CancellationToken::new()).await;

        // Assert
        match result.unwrap_err() {
            DomainError::NotFound(id) => assert_eq!(id, "movie-1"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deleted_movie_is_hidden_unless_requested() {
        // Arrange
        let catalogue = Catalogue::new();
        create(&catalogue, "movie-1", "Alien", 1979).await;
        handle_delete_movie(
            &DeleteMovie {
                correlation_id: Uuid::new_v4(),
                movie_id: "movie-1".to_owned(),
                expected_revision: 1,
            },
            &catalogue.repo,
        )
        .await
        .unwrap();
        catalogue.project("movie-1").await;
        let cancel = CancellationToken::new();

        // Act
        let hidden = get_movie("movie-1", false, &catalogue.repo, &cancel).await;
        let shown = get_movie("movie-1", true, &catalogue.repo, &cancel)
            .await
            .unwrap();
        let snapshot_hidden = get_movie_snapshot("movie-1", false, &catalogue.snapshots).await;

        // Assert
        assert!(matches!(hidden, Err(DomainError::NotFound(_))));
        assert!(shown.deleted_at.is_some());
        assert_eq!(shown.name, "Alien");
        assert!(matches!(snapshot_hidden, Err(DomainError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_snapshot_lags_until_projected_but_catchup_does_not() {
        // Arrange
        let catalogue = Catalogue::new();
        create(&catalogue, "movie-1", "Alien", 1979).await;
        catalogue.project("movie-1").await;
        rename(&catalogue, "movie-1", 1, "Hot Fuzz").await;
        let cancel = CancellationToken::new();

        // Act
        let stale = get_movie_snapshot("movie-1", false, &catalogue.snapshots)
            .await
            .unwrap();
        let current = get_movie_with_catchup("movie-1", false, &catalogue.reader, &cancel)
            .await
            .unwrap();

        // Assert
        assert_eq!((stale.name.as_str(), stale.revision), ("Alien", 1));
        assert_eq!((current.name.as_str(), current.revision), ("Hot Fuzz", 2));
    }

    #[tokio::test]
    async fn test_list_movies_orders_by_name_and_filters_by_year() {
        // Arrange
        let catalogue = Catalogue::new();
        for (id, name, year) in [
            ("movie-1", "Heat", 1995),
            ("movie-2", "Alien", 1979),
            ("movie-3", "Brazil", 1985),
            ("movie-4", "Arrival", 2016),
        ] {
            create(&catalogue, id, name, year).await;
            catalogue.project(id).await;
        }
        handle_delete_movie(
            &DeleteMovie {
                correlation_id: Uuid::new_v4(),
                movie_id: "movie-1".to_owned(),
                expected_revision: 1,
            },
            &catalogue.repo,
        )
        .await
        .unwrap();
        catalogue.project("movie-1").await;

        // Act
        let all = list_movies(None, &catalogue.reader, CancellationToken::new())
            .await
            .unwrap();
        let recent = list_movies(Some(1985), &catalogue.reader, CancellationToken::new())
            .await
            .unwrap();

        // Assert
        let names = |views: &[MovieView]| views.iter().map(|v| v.name.clone()).collect::<Vec<_>>();
        assert_eq!(names(&all), vec!["Alien", "Arrival", "Brazil"]);
        assert_eq!(names(&recent), vec!["Arrival", "Brazil"]);
    }

    #[tokio::test]
    async fn test_list_movies_stops_when_cancelled() {
        let catalogue = Catalogue::new();
        create(&catalogue, "movie-1", "Alien", 1979).await;
        catalogue.project("movie-1").await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = list_movies(None, &catalogue.reader, cancel).await;

        assert!(matches!(result, Err(DomainError::Cancelled)));
    }
}
