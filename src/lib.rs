// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod amqp;
mod otel;

#[cfg(test)]
pub(crate) mod testing;

pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod event;
pub mod exchange;
pub mod logging;
pub mod policy;
pub mod publisher;
pub mod queue;
pub mod resilient;
