//! Events, commands and payload decoding.
//!
//! A [`Command`] is the intent to append one event; a [`StorageEvent`] is the
//! durable, immutable result. Payloads travel as opaque JSON bytes ([`Payload`])
//! and are decoded only by consumers that recognize the event type.
//!
//! # Event type naming
//!
//! Event types are dotted strings whose first segment is the aggregate type:
//! `"org.added"`, `"user.token.added"`, `"org.policy.domain.added"`. Reducer
//! dispatch and type checks rely on this convention.
//!
//! # Two phase decoding
//!
//! ```
//! use eventstore_core::event::{EventPayload, Payload};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize, PartialEq)]
//! struct OrgAdded {
//!     name: String,
//! }
//!
//! impl EventPayload for OrgAdded {
//!     const EVENT_TYPE: &'static str = "org.added";
//! }
//!
//! let payload = Payload::encode(&OrgAdded { name: "Acme".to_string() }).unwrap();
//! let decoded: OrgAdded = payload.unmarshal().unwrap();
//! assert_eq!(decoded.name, "Acme");
//! ```

use crate::aggregate::Aggregate;
use crate::error::{EventStoreError, Result, codes};
use crate::position::GlobalPosition;
use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::fmt;

/// Returns the aggregate type segment of a dotted event type.
///
/// ```
/// use eventstore_core::event::aggregate_type_of;
///
/// assert_eq!(aggregate_type_of("org.policy.domain.added"), "org");
/// assert_eq!(aggregate_type_of("user.token.added"), "user");
/// ```
#[must_use]
pub fn aggregate_type_of(event_type: &str) -> &str {
    event_type
        .split_once('.')
        .map_or(event_type, |(aggregate_type, _)| aggregate_type)
}

/// Check that `event_type` is `"<aggregate_type>.<action>"`.
///
/// # Errors
///
/// Returns [`EventStoreError::InvalidArgument`] if the prefix is missing or the
/// action segment is empty.
pub fn validate_event_type(aggregate_type: &str, event_type: &str) -> Result<()> {
    let valid = event_type
        .strip_prefix(aggregate_type)
        .and_then(|rest| rest.strip_prefix('.'))
        .is_some_and(|action| !action.is_empty() && !action.starts_with('.'));

    if valid {
        Ok(())
    } else {
        Err(EventStoreError::invalid_argument(
            codes::EVENT_TYPE_INVALID,
            format!("event type {event_type:?} is not of the form \"{aggregate_type}.<action>\""),
        ))
    }
}

/// Strongly typed payload of one event type.
///
/// `EVENT_TYPE` binds the payload to exactly one event type string, which is what
/// lets [`StorageEvent::decode`] reject payload/type mismatches.
pub trait EventPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The dotted event type this payload belongs to.
    const EVENT_TYPE: &'static str;

    /// Payload revision, bumped on backward compatible schema changes.
    const REVISION: u16 = 1;
}

/// Opaque, lazily decodable event payload (JSON bytes).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Payload(Vec<u8>);

impl Payload {
    /// A payload without content; decodes as JSON `null`.
    #[must_use]
    pub const fn empty() -> Self {
        Self(Vec::new())
    }

    /// Wrap raw JSON bytes as read from storage.
    #[must_use]
    pub const fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Encode a value as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::SerializationError`] if the value cannot be serialized.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        serde_json::to_vec(value)
            .map(Self)
            .map_err(|e| EventStoreError::SerializationError(e.to_string()))
    }

    /// Decode the payload into `T` without any event type check.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::SerializationError`] if the bytes are not a valid `T`.
    pub fn unmarshal<T: DeserializeOwned>(&self) -> Result<T> {
        let bytes: &[u8] = if self.0.is_empty() { b"null" } else { &self.0 };
        serde_json::from_slice(bytes).map_err(|e| EventStoreError::SerializationError(e.to_string()))
    }

    /// Raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns `true` if the payload carries no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Intent to append one event to an aggregate.
///
/// Becomes a [`StorageEvent`] only after a successful push.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    /// Identity of the user or system that caused the event.
    pub creator: String,
    /// Dotted event type.
    pub event_type: String,
    /// Payload revision.
    pub revision: u16,
    /// Encoded payload.
    pub payload: Payload,
}

impl Command {
    /// Create a command from a typed payload.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::SerializationError`] if the payload cannot be encoded.
    pub fn new<P: EventPayload>(creator: impl Into<String>, payload: &P) -> Result<Self> {
        Ok(Self {
            creator: creator.into(),
            event_type: P::EVENT_TYPE.to_string(),
            revision: P::REVISION,
            payload: Payload::encode(payload)?,
        })
    }

    /// Create a command from already encoded parts.
    #[must_use]
    pub fn raw(
        creator: impl Into<String>,
        event_type: impl Into<String>,
        revision: u16,
        payload: Payload,
    ) -> Self {
        Self {
            creator: creator.into(),
            event_type: event_type.into(),
            revision,
            payload,
        }
    }
}

/// One immutable, durable event.
#[derive(Clone, Debug, PartialEq)]
pub struct StorageEvent {
    /// Identity that caused the event.
    pub creator: String,
    /// Dotted event type.
    pub event_type: String,
    /// Payload revision.
    pub revision: u16,
    /// Encoded payload.
    pub payload: Payload,
    /// Stream the event belongs to.
    pub aggregate: Aggregate,
    /// Commit time.
    pub created_at: DateTime<Utc>,
    /// Log-wide position.
    pub position: GlobalPosition,
    /// Aggregate-local sequence, starting at 1.
    pub sequence: u32,
}

impl StorageEvent {
    /// Returns `true` if the event carries the payload type `P`.
    #[must_use]
    pub fn is<P: EventPayload>(&self) -> bool {
        self.event_type == P::EVENT_TYPE
    }

    /// Decode the payload into `P` after checking the event type.
    ///
    /// # Errors
    ///
    /// - [`EventStoreError::InvalidArgument`] with [`codes::EVENT_TYPE_MISMATCH`] if
    ///   `P` belongs to another event type
    /// - [`EventStoreError::SerializationError`] if the bytes are not a valid `P`
    pub fn payload<P: EventPayload>(&self) -> Result<P> {
        if !self.is::<P>() {
            return Err(EventStoreError::invalid_argument(
                codes::EVENT_TYPE_MISMATCH,
                format!(
                    "cannot decode {} event at {} as {}",
                    self.event_type,
                    self.aggregate,
                    P::EVENT_TYPE
                ),
            ));
        }
        self.payload.unmarshal()
    }

    /// Decode into a typed envelope.
    ///
    /// # Errors
    ///
    /// See [`StorageEvent::payload`].
    pub fn decode<P: EventPayload>(&self) -> Result<Event<P>> {
        Ok(Event {
            payload: self.payload::<P>()?,
            storage: self.clone(),
        })
    }
}

impl fmt::Display for StorageEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StorageEvent {{ type: {}, aggregate: {}, sequence: {}, position: {} }}",
            self.event_type, self.aggregate, self.sequence, self.position
        )
    }
}

/// Typed envelope: a stored event plus its decoded payload.
#[derive(Clone, Debug)]
pub struct Event<P> {
    /// The stored event the payload was decoded from.
    pub storage: StorageEvent,
    /// Decoded payload.
    pub payload: P,
}

type DecodeFn<E> = Box<dyn Fn(&StorageEvent) -> Result<E> + Send + Sync>;

/// Registry of decode functions keyed by event type.
///
/// Produces a caller defined tagged union `E` from stored events. Event types
/// without a registered decoder decode to `None`, so consumers ignore them
/// instead of failing the batch.
///
/// # Example
///
/// ```
/// use eventstore_core::event::{EventDecoders, EventPayload};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct OrgAdded { name: String }
/// impl EventPayload for OrgAdded { const EVENT_TYPE: &'static str = "org.added"; }
///
/// enum OrgEvent { Added(String) }
///
/// let decoders = EventDecoders::new()
///     .register::<OrgAdded>(|event| OrgEvent::Added(event.payload.name));
/// assert!(decoders.knows("org.added"));
/// assert!(!decoders.knows("org.removed"));
/// ```
pub struct EventDecoders<E> {
    decoders: HashMap<&'static str, DecodeFn<E>>,
}

impl<E: 'static> EventDecoders<E> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register the decoder for `P::EVENT_TYPE`, replacing any earlier one.
    #[must_use]
    pub fn register<P: EventPayload>(
        mut self,
        map: impl Fn(Event<P>) -> E + Send + Sync + 'static,
    ) -> Self {
        self.decoders.insert(
            P::EVENT_TYPE,
            Box::new(move |event: &StorageEvent| event.decode::<P>().map(&map)),
        );
        self
    }

    /// Returns `true` if a decoder is registered for `event_type`.
    #[must_use]
    pub fn knows(&self, event_type: &str) -> bool {
        self.decoders.contains_key(event_type)
    }

    /// The registered event types.
    pub fn event_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.decoders.keys().copied()
    }

    /// Decode one event.
    ///
    /// Returns `Ok(None)` for event types without a decoder.
    ///
    /// # Errors
    ///
    /// Propagates the registered decoder's error.
    pub fn decode(&self, event: &StorageEvent) -> Result<Option<E>> {
        self.decoders
            .get(event.event_type.as_str())
            .map(|decode| decode(event))
            .transpose()
    }
}

impl<E: 'static> Default for EventDecoders<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrgAdded {
        name: String,
    }

    impl EventPayload for OrgAdded {
        const EVENT_TYPE: &'static str = "org.added";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrgChanged {
        name: String,
    }

    impl EventPayload for OrgChanged {
        const EVENT_TYPE: &'static str = "org.changed";
        const REVISION: u16 = 2;
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrgDeactivated;

    impl EventPayload for OrgDeactivated {
        const EVENT_TYPE: &'static str = "org.deactivated";
    }

    fn stored(command: Command) -> StorageEvent {
        StorageEvent {
            creator: command.creator,
            event_type: command.event_type,
            revision: command.revision,
            payload: command.payload,
            aggregate: Aggregate::new("inst-1", "org", "org-1"),
            created_at: Utc::now(),
            position: GlobalPosition::new(1.0, 0),
            sequence: 1,
        }
    }

    #[test]
    fn aggregate_type_is_first_segment() {
        assert_eq!(aggregate_type_of("org.added"), "org");
        assert_eq!(aggregate_type_of("org"), "org");
        assert_eq!(aggregate_type_of(""), "");
    }

    #[test]
    fn event_type_must_be_prefixed() {
        assert!(validate_event_type("org", "org.added").is_ok());
        assert!(validate_event_type("org", "org.policy.domain.added").is_ok());
        assert!(validate_event_type("org", "user.added").is_err());
        assert!(validate_event_type("org", "organization.added").is_err());
        assert!(validate_event_type("org", "org.").is_err());
        assert!(validate_event_type("org", "org").is_err());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn command_carries_type_and_revision() {
        let command = Command::new("user-1", &OrgChanged { name: "Acme".into() }).unwrap();
        assert_eq!(command.event_type, "org.changed");
        assert_eq!(command.revision, 2);
        assert_eq!(command.creator, "user-1");
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn decode_checks_event_type() {
        let event = stored(Command::new("user-1", &OrgAdded { name: "Acme".into() }).unwrap());

        let typed = event.decode::<OrgAdded>().unwrap();
        assert_eq!(typed.payload.name, "Acme");
        assert_eq!(typed.storage.sequence, 1);

        // Same JSON shape, wrong event type.
        let err = event.decode::<OrgChanged>().err().unwrap();
        assert_eq!(err.code(), codes::EVENT_TYPE_MISMATCH);
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn empty_payload_decodes_as_unit() {
        let command = Command::raw("user-1", "org.deactivated", 1, Payload::empty());
        let event = stored(command);
        assert_eq!(event.payload::<OrgDeactivated>().unwrap(), OrgDeactivated);
    }

    #[test]
    fn corrupt_payload_is_internal() {
        let command = Command::raw("user-1", "org.added", 1, Payload::from_bytes(b"{".to_vec()));
        let err = stored(command).payload::<OrgAdded>().err();
        assert!(matches!(err, Some(EventStoreError::SerializationError(_))));
    }

    #[derive(Debug, PartialEq)]
    enum OrgEvent {
        Added(String),
        Changed(String),
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn decoders_ignore_unknown_types() {
        let decoders = EventDecoders::new()
            .register::<OrgAdded>(|e| OrgEvent::Added(e.payload.name))
            .register::<OrgChanged>(|e| OrgEvent::Changed(e.payload.name));

        let added = stored(Command::new("u", &OrgAdded { name: "Acme".into() }).unwrap());
        assert_eq!(
            decoders.decode(&added).unwrap(),
            Some(OrgEvent::Added("Acme".into()))
        );

        let unknown = stored(Command::raw("u", "org.removed", 1, Payload::empty()));
        assert_eq!(decoders.decode(&unknown).unwrap(), None);

        let mut types: Vec<_> = decoders.event_types().collect();
        types.sort_unstable();
        assert_eq!(types, vec!["org.added", "org.changed"]);
    }
}
