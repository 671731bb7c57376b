//! Domain events for the Movie catalogue context.

use std::sync::Arc;

use eventide_core::error::DomainError;
use eventide_core::event::EventBody;
use eventide_core::registry::EventTypeRegistry;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Persisted type names of the movie events.
pub mod type_names {
    /// [`super::MovieCreated`]
    pub const CREATED: &str = "movie.created";
    /// [`super::MovieNameChanged`]
    pub const NAME_CHANGED: &str = "movie.name_changed";
    /// [`super::MovieRated`]
    pub const RATED: &str = "movie.rated";
    /// [`super::MovieDeleted`]
    pub const DELETED: &str = "movie.deleted";
    /// [`super::MovieTitled`]
    pub const TITLED: &str = "movie.titled";
}

/// Emitted when a movie is added to the catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovieCreated {
    /// The movie's name.
    pub name: String,
    /// Year of first release.
    pub release_year: u16,
}

/// Emitted when a movie is renamed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovieNameChanged {
    /// The new name.
    pub name: String,
}

/// Emitted when a viewer rates a movie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovieRated {
    /// Rating from 1 to 5.
    pub stars: u8,
}

/// Emitted when a movie is removed from the catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovieDeleted {}

/// Creation event of the first catalogue version, which carried no release
/// year. No longer emitted, but old streams still start with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovieTitled {
    /// The movie's name.
    pub title: String,
}

/// Event payload variants for the Movie catalogue context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MovieEvent {
    /// A movie has been created.
    Created(MovieCreated),
    /// A movie has been renamed.
    NameChanged(MovieNameChanged),
    /// A movie has been rated.
    Rated(MovieRated),
    /// A movie has been deleted.
    Deleted(MovieDeleted),
    /// A movie has been created by the first catalogue version.
    Titled(MovieTitled),
}

impl From<MovieCreated> for MovieEvent {
    fn from(e: MovieCreated) -> Self {
        Self::Created(e)
    }
}

impl From<MovieNameChanged> for MovieEvent {
    fn from(e: MovieNameChanged) -> Self {
        Self::NameChanged(e)
    }
}

impl From<MovieRated> for MovieEvent {
    fn from(e: MovieRated) -> Self {
        Self::Rated(e)
    }
}

impl From<MovieDeleted> for MovieEvent {
    fn from(e: MovieDeleted) -> Self {
        Self::Deleted(e)
    }
}

impl From<MovieTitled> for MovieEvent {
    fn from(e: MovieTitled) -> Self {
        Self::Titled(e)
    }
}

impl EventBody for MovieEvent {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Created(_) => type_names::CREATED,
            Self::NameChanged(_) => type_names::NAME_CHANGED,
            Self::Rated(_) => type_names::RATED,
            Self::Deleted(_) => type_names::DELETED,
            Self::Titled(_) => type_names::TITLED,
        }
    }

    fn to_payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Created(e) => serde_json::to_value(e),
            Self::NameChanged(e) => serde_json::to_value(e),
            Self::Rated(e) => serde_json::to_value(e),
            Self::Deleted(e) => serde_json::to_value(e),
            Self::Titled(e) => serde_json::to_value(e),
        }
    }
}

/// Builds the registry of every movie event type ever persisted.
///
/// # Errors
///
/// Returns `DomainError::Validation` if a type name is registered twice.
pub fn registry() -> Result<Arc<EventTypeRegistry<MovieEvent>>, DomainError> {
    let registry = EventTypeRegistry::new()
        .register::<MovieCreated>(type_names::CREATED)?
        .register::<MovieNameChanged>(type_names::NAME_CHANGED)?
        .register::<MovieRated>(type_names::RATED)?
        .register::<MovieDeleted>(type_names::DELETED)?
        .register::<MovieTitled>(type_names::TITLED)?;
    Ok(Arc::new(registry))
}
