// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! The pipeline routes every message through a single direct exchange.

use lapin::ExchangeKind;

/// Name of the exchange shared by every pipeline stage.
pub const PIPELINE_EXCHANGE: &str = "PipelineExchange";

/// Definition of a RabbitMQ exchange with its configuration parameters.
///
/// Only direct exchanges are declared: routing keys name worker stages and
/// each stage queue is bound under exactly its own key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
}

impl ExchangeDefinition {
    /// The direct exchange all pipeline stages publish to and consume from.
    ///
    /// Non-durable and never auto-deleted, the way every component declares it.
    pub fn pipeline() -> ExchangeDefinition {
        ExchangeDefinition {
            name: PIPELINE_EXCHANGE.to_owned(),
            durable: false,
            delete: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn kind(&self) -> ExchangeKind {
        ExchangeKind::Direct
    }
}
