//! Command handlers for the Movie catalogue context.
//!
//! Each handler validates its command, checks the movie against the state
//! replayed from its stream, and appends the resulting event at the
//! revision the caller last read.

use eventide_core::error::DomainError;
use eventide_core::event::PendingEvent;
use eventide_core::projection::Snapshot;
use eventide_engine::repository::EventRepository;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::domain::commands::{CreateMovie, DeleteMovie, RateMovie, RenameMovie};
use crate::domain::events::{MovieCreated, MovieDeleted, MovieEvent, MovieNameChanged, MovieRated};
use crate::domain::projections::MovieProjection;

/// Metadata key carrying the command's correlation id.
pub const CORRELATION_ID: &str = "correlationId";

const MAX_NAME_LEN: usize = 200;
const FIRST_RELEASE_YEAR: u16 = 1888;

fn pending(movie_id: &str, correlation_id: Uuid, body: MovieEvent) -> PendingEvent<MovieEvent> {
    PendingEvent::new(movie_id, body).with_metadata(CORRELATION_ID, correlation_id.to_string())
}

fn validate_name(name: &str) -> Result<(), DomainError> {
    if name.trim().is_empty() {
        return Err(DomainError::Validation("movie name must not be empty".into()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(DomainError::Validation(format!(
            "movie name must not exceed {MAX_NAME_LEN} characters"
        )));
    }
    Ok(())
}

/// Replays `movie_id` through `expected_revision` and fails unless a live
/// movie is found there.
async fn load_live(
    movie_id: &str,
    expected_revision: u64,
    repo: &EventRepository<MovieProjection>,
) -> Result<Snapshot<MovieProjection>, DomainError> {
    repo.get(
        movie_id,
        Some(expected_revision),
        false,
        &CancellationToken::new(),
    )
    .await?
    .ok_or_else(|| DomainError::NotFound(movie_id.to_owned()))
}

/// Handles the `CreateMovie` command: appends the creation event to a new
/// stream.
///
/// # Errors
///
/// Returns `DomainError::Validation` for a blank or over-long name, a release
/// year before the first film, or a malformed id, and
/// `DomainError::ConcurrencyConflict` if the movie already exists.
#[instrument(skip(command, repo), fields(movie_id = %command.movie_id, correlation_id = %command.correlation_id))]
pub async fn handle_create_movie(
    command: &CreateMovie,
    repo: &EventRepository<MovieProjection>,
) -> Result<Snapshot<MovieProjection>, DomainError> {
    validate_name(&command.name)?;
    if command.release_year < FIRST_RELEASE_YEAR {
        return Err(DomainError::Validation(format!(
            "release year {} predates {FIRST_RELEASE_YEAR}",
            command.release_year
        )));
    }

    let event = MovieEvent::Created(MovieCreated {
        name: command.name.trim().to_owned(),
        release_year: command.release_year,
    });
    let snapshot = repo
        .apply_events(
            &command.movie_id,
            0,
            vec![pending(&command.movie_id, command.correlation_id, event)],
        )
        .await?;
    info!(revision = snapshot.revision, "movie created");
    Ok(snapshot)
}

/// Handles the `RenameMovie` command.
///
/// # Errors
///
/// Returns `DomainError::Validation` for a blank, over-long or unchanged
/// name, `DomainError::NotFound` if the movie does not exist or is deleted,
/// and `DomainError::ConcurrencyConflict` if the movie moved past
/// `expected_revision`.
#[instrument(skip(command, repo), fields(movie_id = %command.movie_id, expected_revision = command.expected_revision))]
pub async fn handle_rename_movie(
    command: &RenameMovie,
    repo: &EventRepository<MovieProjection>,
) -> Result<Snapshot<MovieProjection>, DomainError> {
    validate_name(&command.name)?;
    let name = command.name.trim();
    let current = load_live(&command.movie_id, command.expected_revision, repo).await?;
    if current.state.name == name {
        return Err(DomainError::Validation(format!(
            "movie {} is already named {name:?}",
            command.movie_id
        )));
    }

    let event = MovieEvent::NameChanged(MovieNameChanged {
        name: name.to_owned(),
    });
    repo.apply_events(
        &command.movie_id,
        command.expected_revision,
        vec![pending(&command.movie_id, command.correlation_id, event)],
    )
    .await
}

/// Handles the `RateMovie` command.
///
/// # Errors
///
/// Returns `DomainError::Validation` if `stars` is outside 1..=5,
/// `DomainError::NotFound` if the movie does not exist or is deleted, and
/// `DomainError::ConcurrencyConflict` on a stale revision.
#[instrument(skip(command, repo), fields(movie_id = %command.movie_id, expected_revision = command.expected_revision))]
pub async fn handle_rate_movie(
    command: &RateMovie,
    repo: &EventRepository<MovieProjection>,
) -> Result<Snapshot<MovieProjection>, DomainError> {
    if !(1..=5).contains(&command.stars) {
        return Err(DomainError::Validation(format!(
            "rating must be between 1 and 5 stars, got {}",
            command.stars
        )));
    }
    load_live(&command.movie_id, command.expected_revision, repo).await?;

    let event = MovieEvent::Rated(MovieRated {
        stars: command.stars,
    });
    repo.apply_events(
        &command.movie_id,
        command.expected_revision,
        vec![pending(&command.movie_id, command.correlation_id, event)],
    )
    .await
}

/// Handles the `DeleteMovie` command. The stream is kept; the movie is
/// soft-deleted.
///
/// # Errors
///
/// Returns `DomainError::NotFound` if the movie does not exist or is already
/// deleted, and `DomainError::ConcurrencyConflict` on a stale revision.
#[instrument(skip(command, repo), fields(movie_id = %command.movie_id, expected_revision = command.expected_revision))]
pub async fn handle_delete_movie(
    command: &DeleteMovie,
    repo: &EventRepository<MovieProjection>,
) -> Result<Snapshot<MovieProjection>, DomainError> {
    load_live(&command.movie_id, command.expected_revision, repo).await?;

    let snapshot = repo
        .apply_events(
            &command.movie_id,
            command.expected_revision,
            vec![pending(
                &command.movie_id,
                command.correlation_id,
                MovieEvent::Deleted(MovieDeleted {}),
            )],
        )
        .await?;
    info!(revision = snapshot.revision, "movie deleted");
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use eventide_core::error::DomainError;
    use uuid::Uuid;

    use super::*;
    use crate::fixtures::Catalogue;

    fn create(movie_id: &str, name: &str) -> CreateMovie {
        CreateMovie {
            correlation_id: Uuid::new_v4(),
            movie_id: movie_id.to_owned(),
            name: name.to_owned(),
            release_year: 1979,
        }
    }

    #[tokio::test]
    async fn test_handle_create_movie_starts_stream_at_revision_one() {
        // Arrange
        let catalogue = Catalogue::new();
        let command = create("movie-1", "Alien");

        // Act
        let snapshot = handle_create_movie(&command, &catalogue.repo).await.unwrap();

        // Assert
        assert_eq!(snapshot.revision, 1);
        assert_eq!(snapshot.state.name, "Alien");
        let events = catalogue.events_of("movie-1").await;
        assert_eq!(
            events[0].metadata.get(CORRELATION_ID),
            Some(&command.correlation_id.to_string())
        );
    }

    #[tokio::test]
    async fn test_handle_create_movie_rejects_existing_movie() {
        // Arrange
        let catalogue = Catalogue::new();
        handle_create_movie(&create("movie-1", "Alien"), &catalogue.repo)
            .await
            .unwrap();

        // Act
        let result = handle_create_movie(&create("movie-1", "Hot Fuzz"), &catalogue.repo).await;

        // Assert
        match result.unwrap_err() {
            DomainError::ConcurrencyConflict { actual, .. } => assert_eq!(actual, 1),
            other => panic!("expected ConcurrencyConflict, got {other:?}"),
        }
        assert_eq!(catalogue.events_of("movie-1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_handle_create_movie_validates_name_and_year() {
        let catalogue = Catalogue::new();
        let mut blank = create("movie-1", "   ");
        let mut ancient = create("movie-2", "Roundhay Garden Scene");
        ancient.release_year = 1887;
        blank.release_year = 2000;

        let blank = handle_create_movie(&blank, &catalogue.repo).await;
        let ancient = handle_create_movie(&ancient, &catalogue.repo).await;

        assert!(matches!(blank, Err(DomainError::Validation(_))));
        assert!(matches!(ancient, Err(DomainError::Validation(_))));
        assert!(catalogue.events_of("movie-1").await.is_empty());
    }

    #[tokio::test]
    async fn test_handle_rename_movie_with_stale_revision_conflicts() {
        // Arrange
        let catalogue = Catalogue::new();
        handle_create_movie(&create("movie-1", "Alien"), &catalogue.repo)
            .await
            .unwrap();
        let rename = |expected_revision, name: &str| RenameMovie {
            correlation_id: Uuid::new_v4(),
            movie_id: "movie-1".to_owned(),
            expected_revision,
            name: name.to_owned(),
        };
        handle_rename_movie(&rename(1, "Aliens"), &catalogue.repo)
            .await
            .unwrap();

        // Act
        let result = handle_rename_movie(&rename(1, "Hot Fuzz"), &catalogue.repo).await;

        // Assert
        assert!(matches!(
            result,
            Err(DomainError::ConcurrencyConflict { expected: 1, actual: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_handle_rename_movie_rejects_unchanged_name() {
        let catalogue = Catalogue::new();
        handle_create_movie(&create("movie-1", "Alien"), &catalogue.repo)
            .await
            .unwrap();

        let result = handle_rename_movie(
            &RenameMovie {
                correlation_id: Uuid::new_v4(),
                movie_id: "movie-1".to_owned(),
                expected_revision: 1,
                name: " Alien ".to_owned(),
            },
            &catalogue.repo,
        )
        .await;

        assert!(matches!(result, Err(DomainError::Validation(_))));
    }

    #[tokio::test]
    async fn test_handle_rate_movie_rejects_out_of_range_and_unknown() {
        // Arrange
        let catalogue = Catalogue::new();
        let rate = |movie_id: &str, stars| RateMovie {
            correlation_id: Uuid::new_v4(),
            movie_id: movie_id.to_owned(),
            expected_revision: 0,
            stars,
        };

        // Act
        let zero = handle_rate_movie(&rate("movie-1", 0), &catalogue.repo).await;
        let unknown = handle_rate_movie(&rate("movie-9", 3), &catalogue.repo).await;

        // Assert
        assert!(matches!(zero, Err(DomainError::Validation(_))));
        match unknown.unwrap_err() {
            DomainError::NotFound(id) => assert_eq!(id, "movie-9"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handle_rate_movie_accumulates_ratings() {
        let catalogue = Catalogue::new();
        handle_create_movie(&create("movie-1", "Alien"), &catalogue.repo)
            .await
            .unwrap();

        for (expected_revision, stars) in [(1, 5), (2, 2)] {
            handle_rate_movie(
                &RateMovie {
                    correlation_id: Uuid::new_v4(),
                    movie_id: "movie-1".to_owned(),
                    expected_revision,
                    stars,
                },
                &catalogue.repo,
            )
            .await
            .unwrap();
        }

        let snapshot = catalogue
            .repo
            .get("movie-1", None, false, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.revision, 3);
        assert_eq!(snapshot.state.rating_count, 2);
        assert_eq!(snapshot.state.average_rating(), Some(3.5));
    }

    #[tokio::test]
    async fn test_handle_delete_movie_soft_deletes_once() {
        // Arrange
        let catalogue = Catalogue::new();
        handle_create_movie(&create("movie-1", "Alien"), &catalogue.repo)
            .await
            .unwrap();
        let delete = |expected_revision| DeleteMovie {
            correlation_id: Uuid::new_v4(),
            movie_id: "movie-1".to_owned(),
            expected_revision,
        };

        // Act
        let deleted = handle_delete_movie(&delete(1), &catalogue.repo).await.unwrap();
        let again = handle_delete_movie(&delete(2), &catalogue.repo).await;

        // Assert
        assert_eq!(deleted.revision, 2);
        assert!(deleted.is_deleted());
        assert!(matches!(again, Err(DomainError::NotFound(_))));
        assert_eq!(catalogue.events_of("movie-1").await.len(), 2);
    }
}
