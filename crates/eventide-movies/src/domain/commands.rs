//! Commands for the Movie catalogue context.

use uuid::Uuid;

/// Command to add a movie to the catalogue.
#[derive(Debug, Clone)]
pub struct CreateMovie {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The movie's stream id.
    pub movie_id: String,
    /// The movie's name.
    pub name: String,
    /// Year of first release.
    pub release_year: u16,
}

/// Command to rename a movie.
#[derive(Debug, Clone)]
pub struct RenameMovie {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The movie's stream id.
    pub movie_id: String,
    /// Revision the caller last read.
    pub expected_revision: u64,
    /// The new name.
    pub name: String,
}

/// Command to rate a movie.
#[derive(Debug, Clone)]
pub struct RateMovie {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The movie's stream id.
    pub movie_id: String,
    /// Revision the caller last read.
    pub expected_revision: u64,
    /// Rating from 1 to 5.
    pub stars: u8,
}

/// Command to remove a movie from the catalogue.
#[derive(Debug, Clone)]
pub struct DeleteMovie {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The movie's stream id.
    pub movie_id: String,
    /// Revision the caller last read.
    pub expected_revision: u64,
}
