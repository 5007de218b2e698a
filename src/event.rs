// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Pipeline Event
//!
//! The immutable domain value a handler receives for each delivery.

use crate::{channel::WireDelivery, errors::AmqpError};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::borrow::Cow;
use tracing::error;

/// Delivery tag of an event that did not come from the broker.
pub const LOCAL_DELIVERY_TAG: u64 = 0;

/// A message received from a pipeline queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    payload: Vec<u8>,
    delivery_tag: u64,
    created_at: DateTime<Utc>,
    redelivered: bool,
    routing_key: String,
    channel_generation: u64,
}

impl Event {
    /// Builds an event that was not delivered by the broker and therefore
    /// cannot be acknowledged.
    pub fn local(payload: impl Into<Vec<u8>>) -> Event {
        Event {
            payload: payload.into(),
            delivery_tag: LOCAL_DELIVERY_TAG,
            created_at: Utc::now(),
            redelivered: false,
            routing_key: String::new(),
            channel_generation: 0,
        }
    }

    /// `created_at` is the publish timestamp when present, otherwise the
    /// reception time.
    pub(crate) fn from_delivery(delivery: WireDelivery, channel_generation: u64) -> Event {
        let created_at = delivery
            .timestamp
            .and_then(|ms| i64::try_from(ms).ok())
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_else(Utc::now);

        Event {
            payload: delivery.payload,
            delivery_tag: delivery.delivery_tag,
            created_at,
            redelivered: delivery.redelivered,
            routing_key: delivery.routing_key,
            channel_generation,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The payload decoded as UTF-8, invalid sequences replaced.
    pub fn message(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Deserializes a JSON payload.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.payload).map_err(|err| {
            error!(error = err.to_string(), "failure to parse payload");
            AmqpError::ParsePayloadError
        })
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Whether the broker can be told about the outcome of this event.
    pub fn is_ackable(&self) -> bool {
        self.delivery_tag != LOCAL_DELIVERY_TAG
    }

    pub(crate) fn channel_generation(&self) -> u64 {
        self.channel_generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Headers;
    use serde::Deserialize;

    fn delivery(timestamp: Option<u64>) -> WireDelivery {
        WireDelivery {
            delivery_tag: 7,
            exchange: "PipelineExchange".to_owned(),
            routing_key: "Worker1".to_owned(),
            redelivered: true,
            timestamp,
            headers: Headers::new(),
            payload: br#"{"step":3}"#.to_vec(),
        }
    }

    #[test]
    fn test_local_event_is_not_ackable() {
        let event = Event::local("Worker1");

        assert_eq!(event.delivery_tag(), LOCAL_DELIVERY_TAG);
        assert!(!event.is_ackable());
        assert_eq!(event.message(), "Worker1");
    }

    #[test]
    fn test_event_from_delivery_keeps_publish_timestamp() {
        let event = Event::from_delivery(delivery(Some(1_700_000_000_123)), 3);

        assert_eq!(event.delivery_tag(), 7);
        assert!(event.is_ackable());
        assert!(event.redelivered());
        assert_eq!(event.routing_key(), "Worker1");
        assert_eq!(event.channel_generation(), 3);
        assert_eq!(event.created_at().timestamp_millis(), 1_700_000_000_123);
    }

    #[test]
    fn test_event_without_timestamp_uses_reception_time() {
        let before = Utc::now();
        let event = Event::from_delivery(delivery(None), 1);

        assert!(event.created_at() >= before);
    }

    #[test]
    fn test_json_payload() {
        #[derive(Deserialize)]
        struct Step {
            step: u32,
        }

        let event = Event::from_delivery(delivery(None), 1);
        assert_eq!(event.json::<Step>().unwrap().step, 3);

        let broken = Event::local("not json");
        assert_eq!(
            broken.json::<Step>().err(),
            Some(AmqpError::ParsePayloadError)
        );
    }
}
