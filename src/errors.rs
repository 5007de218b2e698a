// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Pipeline
//!
//! This module provides the error types used across the pipeline. `AmqpError`
//! covers every broker-facing failure (connection, channel, declarations,
//! publishing, acknowledgments). `HandlerError` is what application handlers
//! return to the retry policy, and `ConfigError` covers configuration loading.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Transport-level variants (`ConnectionError`, `ChannelError`) are recovered
/// transparently by re-creating the channel on next access; the remaining
/// variants are surfaced to the caller of the failing operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error serializing a message payload
    #[error("failure to serialize payload")]
    SerializePayloadError,

    /// Error parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// The delivery tag was not issued by the live channel, or was already settled
    #[error("unknown delivery tag `{0}`")]
    UnknownDeliveryTag(u64),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

/// Outcome of a failed handler attempt.
///
/// The retry policy decides the disposition of the message from the variant:
/// `Retryable` is retried with backoff, `Fatal` is rejected immediately and
/// `Cancelled` short-circuits without consuming retry budget.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("retryable failure: {0}")]
    Retryable(String),

    #[error("unrecoverable failure: {0}")]
    Fatal(String),

    #[error("handler execution was cancelled")]
    Cancelled,
}

impl HandlerError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        HandlerError::Retryable(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        HandlerError::Fatal(msg.into())
    }
}

/// Configuration error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
