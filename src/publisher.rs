// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Publisher
//!
//! Publishes persistent, timestamped messages to the pipeline exchange. Every
//! publish is `mandatory` by default so the broker hands back messages it
//! cannot route instead of dropping them silently; such returns are reported
//! to the caller and logged with a rate-limited escalation per routing key.

use crate::{
    channel::{
        ChannelFactory, ChannelRole, Headers, PublishOutcome, PublishRequest, ReturnedMessage,
        PERSISTENT_DELIVERY_MODE,
    },
    errors::AmqpError,
    exchange::ExchangeDefinition,
    otel,
    resilient::ResilientChannel,
};
use chrono::Utc;
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::{error, info, trace, warn};
use uuid::Uuid;

/// Default content type for raw string messages
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Minimum time between two ERROR logs for returns of the same routing key.
pub const RETURN_ESCALATION_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Decides which returned messages deserve an ERROR log.
///
/// The first return of a routing key only records the instant; the key is
/// escalated once that instant is at least one window old, and the instant is
/// then refreshed.
#[derive(Debug)]
pub(crate) struct ReturnAlerts {
    window: Duration,
    last_escalation: HashMap<String, Instant>,
}

impl ReturnAlerts {
    pub(crate) fn new(window: Duration) -> Self {
        ReturnAlerts {
            window,
            last_escalation: HashMap::default(),
        }
    }

    pub(crate) fn should_escalate(&mut self, routing_key: &str, now: Instant) -> bool {
        let last = *self
            .last_escalation
            .entry(routing_key.to_owned())
            .or_insert(now);

        let escalate = now.saturating_duration_since(last) >= self.window;
        if escalate {
            self.last_escalation.insert(routing_key.to_owned(), now);
        }

        escalate
    }
}

/// Publishes messages over a lazily (re)created, confirm-enabled channel.
pub struct Publisher {
    channel: ResilientChannel,
    alerts: Mutex<ReturnAlerts>,
}

impl Publisher {
    /// Creates the publisher and declares the pipeline exchange.
    ///
    /// # Parameters
    /// * `factory` - Usually the publisher's own [`crate::connection::BrokerConnection`]
    pub async fn new(factory: Arc<dyn ChannelFactory>) -> Result<Publisher, AmqpError> {
        let publisher = Publisher {
            channel: ResilientChannel::new(factory, ChannelRole::Publish),
            alerts: Mutex::new(ReturnAlerts::new(RETURN_ESCALATION_WINDOW)),
        };

        publisher
            .channel
            .get_channel()
            .await?
            .declare_exchange(&ExchangeDefinition::pipeline())
            .await?;

        Ok(publisher)
    }

    /// Publishes a string message.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange, usually [`crate::exchange::PIPELINE_EXCHANGE`]
    /// * `message` - Message body, sent as UTF-8
    /// * `routing_key` - Routing key of the consuming stage
    /// * `mandatory` - Ask the broker to return the message when it is unroutable
    ///
    /// # Returns
    /// The broker verdict; unroutable mandatory messages come back as
    /// [`PublishOutcome::Returned`].
    pub async fn publish_event(
        &self,
        exchange: &str,
        message: &str,
        routing_key: &str,
        mandatory: bool,
    ) -> Result<PublishOutcome, AmqpError> {
        let outcome = self
            .publish(
                exchange,
                message.as_bytes(),
                TEXT_CONTENT_TYPE,
                routing_key,
                mandatory,
            )
            .await?;

        info!(exchange, message, "message is sent");
        Ok(outcome)
    }

    /// Serializes `message` as JSON and publishes it.
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        message: &T,
        routing_key: &str,
        mandatory: bool,
    ) -> Result<PublishOutcome, AmqpError> {
        let payload = serde_json::to_vec(message).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::SerializePayloadError
        })?;

        let outcome = self
            .publish(exchange, &payload, JSON_CONTENT_TYPE, routing_key, mandatory)
            .await?;

        info!(exchange, routing_key, "json message is sent");
        Ok(outcome)
    }

    /// Disposes the publishing channel.
    pub async fn close(&self) {
        self.channel.close().await;
    }

    async fn publish(
        &self,
        exchange: &str,
        payload: &[u8],
        content_type: &str,
        routing_key: &str,
        mandatory: bool,
    ) -> Result<PublishOutcome, AmqpError> {
        if routing_key.is_empty() {
            warn!("the routing key is empty, maybe an error in the configuration of the component");
        }

        let mut headers = Headers::new();
        otel::inject_current_context(&mut headers);

        let channel = self.channel.get_channel().await?;
        let outcome = channel
            .publish(PublishRequest {
                exchange,
                routing_key,
                mandatory,
                payload,
                content_type,
                message_id: Uuid::new_v4().to_string(),
                timestamp: Utc::now().timestamp_millis().max(0) as u64,
                delivery_mode: PERSISTENT_DELIVERY_MODE,
                headers,
            })
            .await?;

        match &outcome {
            PublishOutcome::Returned(returned) => self.on_returned(returned).await,
            PublishOutcome::Nacked => warn!(exchange, routing_key, "message was nacked by the broker"),
            PublishOutcome::Routed => {}
        }

        Ok(outcome)
    }

    async fn on_returned(&self, returned: &ReturnedMessage) {
        let escalate = self
            .alerts
            .lock()
            .await
            .should_escalate(&returned.routing_key, Instant::now());

        if escalate {
            error!(
                message = %returned.message(),
                exchange = returned.exchange.as_str(),
                routing_key = returned.routing_key.as_str(),
                reply_code = returned.reply_code,
                "published message cannot be routed to any queue, check that next service in the pipeline is listening"
            );
        } else {
            trace!(
                message = %returned.message(),
                exchange = returned.exchange.as_str(),
                routing_key = returned.routing_key.as_str(),
                reply_code = returned.reply_code,
                "published message cannot be routed to any queue, check that next service in the pipeline is listening"
            );
        }
    }
}
