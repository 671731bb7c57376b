//! Event-type registry.
//!
//! Maps the stable type name persisted with every event to the concrete event
//! struct it deserializes into. The body sum type supplies the other
//! direction through [`EventBody::type_name`]. Every type that was ever
//! appended must stay registered, including types that are no longer
//! produced, or old streams become unreadable.

use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::document::Document;
use crate::error::DomainError;
use crate::event::{Event, EventBody, EventRecord};

type Decoder<E> = Box<dyn Fn(Value) -> Result<E, serde_json::Error> + Send + Sync>;

/// Bidirectional map between persisted type names and event types.
pub struct EventTypeRegistry<E> {
    decoders: HashMap<&'static str, Decoder<E>>,
}

impl<E> fmt::Debug for EventTypeRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.decoders.keys().collect();
        names.sort();
        f.debug_struct("EventTypeRegistry")
            .field("types", &names)
            .finish()
    }
}

impl<E: EventBody> Default for EventTypeRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: EventBody> EventTypeRegistry<E> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Registers concrete event type `T` under `type_name`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the name is already taken.
    pub fn register<T>(mut self, type_name: &'static str) -> Result<Self, DomainError>
    where
        T: DeserializeOwned + Into<E> + 'static,
    {
        if self.decoders.contains_key(type_name) {
            return Err(DomainError::Validation(format!(
                "event type {type_name} is registered twice"
            )));
        }
        self.decoders.insert(
            type_name,
            Box::new(|payload: Value| serde_json::from_value::<T>(payload).map(Into::into)),
        );
        Ok(self)
    }

    /// Returns `true` if `type_name` is registered.
    #[must_use]
    pub fn contains(&self, type_name: &str) -> bool {
        self.decoders.contains_key(type_name)
    }

    /// Registered type names, sorted.
    #[must_use]
    pub fn type_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.decoders.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Serializes a body into its type name and payload.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the body's type is not
    /// registered, since it could never be read back.
    pub fn encode(&self, body: &E) -> Result<(&'static str, Value), DomainError> {
        let type_name = body.type_name();
        if !self.contains(type_name) {
            return Err(DomainError::Validation(format!(
                "event type {type_name} is not registered"
            )));
        }
        Ok((type_name, body.to_payload()?))
    }

    /// Deserializes a payload of the given type.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for an unregistered type name and
    /// `DomainError::Infrastructure` if the payload does not match its type.
    pub fn decode(&self, type_name: &str, payload: Value) -> Result<E, DomainError> {
        let decoder = self.decoders.get(type_name).ok_or_else(|| {
            DomainError::Validation(format!("event type {type_name} is not registered"))
        })?;
        decoder(payload).map_err(|e| {
            DomainError::Infrastructure(format!("failed to decode {type_name} payload: {e}"))
        })
    }

    /// Converts a raw event document into a typed event.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the document is not an event
    /// record, plus any error from [`Self::decode`].
    pub fn decode_document(&self, document: &Document) -> Result<Event<E>, DomainError> {
        let record = EventRecord::from_document(document).map_err(|e| {
            DomainError::Infrastructure(format!(
                "document {}/{} is not an event record: {e}",
                document.partition_key, document.id
            ))
        })?;
        let body = self.decode(&record.body_type, record.body)?;
        Ok(Event {
            event_id: record.event_id,
            stream_id: record.stream_id,
            event_number: record.event_number,
            body,
            timestamp: record.timestamp,
            metadata: record.metadata,
            expires_at: document.expires_at,
        })
    }

    /// Converts a typed event into its document.
    ///
    /// # Errors
    ///
    /// Returns any error from [`Self::encode`].
    pub fn encode_event(&self, event: &Event<E>) -> Result<Document, DomainError> {
        let (type_name, payload) = self.encode(&event.body)?;
        let record = EventRecord {
            event_id: event.event_id,
            stream_id: event.stream_id.clone(),
            event_number: event.event_number,
            body_type: type_name.to_owned(),
            body: payload,
            timestamp: event.timestamp,
            metadata: event.metadata.clone(),
        };
        Ok(record.into_document(event.expires_at)?)
    }
}
