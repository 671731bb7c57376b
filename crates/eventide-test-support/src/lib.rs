//! In-memory collaborators and test doubles for the Eventide engine.

mod change_feed;
mod clock;
mod faults;
mod store;

pub use change_feed::InMemoryChangeFeed;
pub use clock::ManualClock;
pub use faults::{FailingDocumentStore, FlakyDocumentStore, RacingDocumentStore};
pub use store::InMemoryDocumentStore;
