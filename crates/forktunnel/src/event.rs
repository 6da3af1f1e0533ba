//! Payload serialization capability.
//!
//! The tunnel treats event payloads as opaque bytes; the host supplies the
//! codec that turns an application event into bytes and back. Decoding is
//! schema-driven by event name: a payload that does not resolve to a
//! recognizable event decodes to `None` and the relay discards the envelope
//! without dispatching.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::BoxError;

/// Serializes and restores application events.
///
/// `decode` returning `None` is the discard marker: the envelope arrived
/// intact but its payload is not an event this side recognizes. That is not
/// an error — unknown events are dropped silently.
pub trait EventCodec<E> {
    fn encode(&self, event_name: &str, event: &E) -> Result<Bytes, BoxError>;

    fn decode(&self, event_name: &str, payload: &[u8]) -> Option<E>;
}

/// JSON payload codec for any serde event type.
///
/// The event name is not consulted: use an internally tagged enum as the
/// event type when one tunnel carries several event shapes, and the tag does
/// the per-name schema selection. A payload that does not deserialize into
/// `E` decodes to `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEventCodec;

impl<E> EventCodec<E> for JsonEventCodec
where
    E: Serialize + DeserializeOwned,
{
    fn encode(&self, _event_name: &str, event: &E) -> Result<Bytes, BoxError> {
        let raw = serde_json::to_vec(event)?;
        Ok(Bytes::from(raw))
    }

    fn decode(&self, _event_name: &str, payload: &[u8]) -> Option<E> {
        serde_json::from_slice(payload).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "event", rename_all = "snake_case")]
    enum TestEvent {
        Ping { n: u32 },
        Pong { n: u32 },
    }

    #[test]
    fn json_roundtrip() {
        let codec = JsonEventCodec;
        let event = TestEvent::Ping { n: 7 };

        let payload = codec.encode("ping", &event).unwrap();
        let restored: TestEvent = codec.decode("ping", &payload).unwrap();

        assert_eq!(restored, event);
    }

    #[test]
    fn unrecognizable_payload_decodes_to_none() {
        let codec = JsonEventCodec;

        let decoded: Option<TestEvent> = codec.decode("ping", b"not json at all");
        assert!(decoded.is_none());

        let decoded: Option<TestEvent> = codec.decode("ping", br#"{"event":"warp","n":1}"#);
        assert!(decoded.is_none());
    }
}
