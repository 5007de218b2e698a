// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Abstraction
//!
//! The pipeline talks to the broker exclusively through the [`BrokerChannel`]
//! and [`ChannelFactory`] traits. The production implementation wraps `lapin`
//! (see [`crate::amqp`] and [`crate::connection`]); keeping the seam here lets
//! the resilient channel, the consumer and the publisher run unchanged against
//! any transport that honours the same wire contract.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, sync::Arc};

/// String-valued message headers (trace context and application headers).
pub type Headers = BTreeMap<String, String>;

/// Stream of deliveries for one consumer tag. Ends when the consumer is
/// cancelled or its channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<WireDelivery, AmqpError>>;

/// Delivery mode marking a message as persistent.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// What a channel is used for. Decides the flow-control applied on creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// Publisher confirms are enabled so unroutable messages can be reported.
    Publish,
    /// At most `prefetch` unacknowledged deliveries per consumer.
    Consume { prefetch: u16 },
}

impl ChannelRole {
    /// Consuming role with one unacknowledged message at a time.
    pub fn consume() -> Self {
        ChannelRole::Consume { prefetch: 1 }
    }
}

/// A message received from the broker, before it becomes an [`crate::event::Event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    /// Publish time in milliseconds since the epoch, when the publisher set it.
    pub timestamp: Option<u64>,
    pub headers: Headers,
    pub payload: Vec<u8>,
}

/// Everything needed to send one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest<'a> {
    pub exchange: &'a str,
    pub routing_key: &'a str,
    pub mandatory: bool,
    pub payload: &'a [u8],
    pub content_type: &'a str,
    pub message_id: String,
    pub timestamp: u64,
    pub delivery_mode: u8,
    pub headers: Headers,
}

/// A mandatory message the broker could not route to any queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub reply_code: u16,
    pub reply_text: String,
    pub payload: Vec<u8>,
}

impl ReturnedMessage {
    pub fn message(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Broker verdict on a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Routed to at least one queue (or confirms are not in use).
    Routed,
    /// Returned as unroutable.
    Returned(ReturnedMessage),
    /// Negatively confirmed by the broker.
    Nacked,
}

/// One live broker channel.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding<'_>) -> Result<(), AmqpError>;

    /// Limits unacknowledged deliveries per consumer on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError>;

    async fn enable_confirms(&self) -> Result<(), AmqpError>;

    async fn publish(&self, request: PublishRequest<'_>) -> Result<PublishOutcome, AmqpError>;

    /// Registers a manual-ack consumer under `consumer_tag`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Positive acknowledgment of exactly one delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Negative acknowledgment of exactly one delivery, always requeued.
    async fn reject(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Source of fresh channels, usually a broker connection.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// Human readable name of the connection owner.
    fn identity(&self) -> &str;

    /// How many deliveries may be handed to callbacks at the same time.
    fn dispatch_concurrency(&self) -> usize;

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;
}
