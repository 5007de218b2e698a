// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resilient Channel
//!
//! Holds at most one live channel for a logical role (publishing or
//! consuming) and transparently replaces it once it has been closed by the
//! broker or by a connection loss. Every caller re-fetches the channel through
//! [`ResilientChannel::get_channel`] instead of keeping a reference across
//! suspension points, which is what makes the rest of the pipeline survive
//! transient channel loss without its own reconnection logic.
//!
//! ```text
//!  ┌────────┐  get_channel   ┌──────┐  broker/connection  ┌────────┐
//!  │ Absent │ ─────────────> │ Open │ ──────────────────> │ Closed │
//!  └────────┘                └──────┘      shutdown       └────────┘
//!      ^                        ^                              │
//!      │ close                  └───────── get_channel ────────┘
//!      └──────────────────── (old channel disposed first)
//! ```

use crate::{
    channel::{BrokerChannel, ChannelFactory, ChannelRole},
    errors::AmqpError,
};
use std::{ops::Deref, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Lifecycle of the channel held by a [`ResilientChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Absent,
    Open,
    Closed,
}

/// A channel together with the generation it was created in.
///
/// Delivery tags are only meaningful for the generation that issued them.
#[derive(Clone)]
pub struct ChannelHandle {
    channel: Arc<dyn BrokerChannel>,
    generation: u64,
}

impl ChannelHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Deref for ChannelHandle {
    type Target = dyn BrokerChannel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref()
    }
}

struct Slot {
    channel: Option<Arc<dyn BrokerChannel>>,
    generation: u64,
}

/// Lazily (re)created channel for one role.
pub struct ResilientChannel {
    factory: Arc<dyn ChannelFactory>,
    role: ChannelRole,
    slot: Mutex<Slot>,
}

impl ResilientChannel {
    pub fn new(factory: Arc<dyn ChannelFactory>, role: ChannelRole) -> ResilientChannel {
        ResilientChannel {
            factory,
            role,
            slot: Mutex::new(Slot {
                channel: None,
                generation: 0,
            }),
        }
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn identity(&self) -> &str {
        self.factory.identity()
    }

    pub fn dispatch_concurrency(&self) -> usize {
        self.factory.dispatch_concurrency()
    }

    /// Returns the open channel, creating it when there is none or when the
    /// cached one has been closed.
    ///
    /// Creation is serialized by the slot lock, so concurrent callers never
    /// end up with two live channels.
    pub async fn get_channel(&self) -> Result<ChannelHandle, AmqpError> {
        let mut slot = self.slot.lock().await;

        if let Some(channel) = &slot.channel {
            if channel.is_open() {
                return Ok(ChannelHandle {
                    channel: channel.clone(),
                    generation: slot.generation,
                });
            }

            warn!(
                identity = self.identity(),
                channel_id = channel.id(),
                "channel found in a closed state and will be re-opened"
            );
        }

        if let Some(stale) = slot.channel.take() {
            dispose(stale.as_ref()).await;
        }

        let channel = self.create().await?;
        slot.generation += 1;
        slot.channel = Some(channel.clone());

        info!(
            identity = self.identity(),
            channel_id = channel.id(),
            generation = slot.generation,
            "the channel was created"
        );

        Ok(ChannelHandle {
            channel,
            generation: slot.generation,
        })
    }

    /// Returns the cached channel only while it is open, never creating one.
    pub async fn current(&self) -> Option<ChannelHandle> {
        let slot = self.slot.lock().await;

        slot.channel
            .as_ref()
            .filter(|channel| channel.is_open())
            .map(|channel| ChannelHandle {
                channel: channel.clone(),
                generation: slot.generation,
            })
    }

    pub async fn state(&self) -> ChannelState {
        match &self.slot.lock().await.channel {
            None => ChannelState::Absent,
            Some(channel) if channel.is_open() => ChannelState::Open,
            Some(_) => ChannelState::Closed,
        }
    }

    /// Generation of the most recently created channel, 0 before the first.
    pub async fn generation(&self) -> u64 {
        self.slot.lock().await.generation
    }

    /// Disposes the live channel. The next [`ResilientChannel::get_channel`]
    /// creates a new one.
    pub async fn close(&self) {
        let mut slot = self.slot.lock().await;

        if let Some(channel) = slot.channel.take() {
            dispose(channel.as_ref()).await;
        }
    }

    async fn create(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let channel = self.factory.create_channel().await?;

        let configured = match self.role {
            ChannelRole::Publish => channel.enable_confirms().await,
            ChannelRole::Consume { prefetch } => channel.set_prefetch(prefetch).await,
        };

        if let Err(err) = configured {
            dispose(channel.as_ref()).await;
            return Err(err);
        }

        Ok(channel)
    }
}

async fn dispose(channel: &dyn BrokerChannel) {
    if !channel.is_open() {
        debug!(channel_id = channel.id(), "disposing a closed channel");
        return;
    }

    match channel.close().await {
        Ok(()) => info!(
            channel_id = channel.id(),
            "channel shutdown event raised, closed by application"
        ),
        Err(err) => debug!(
            channel_id = channel.id(),
            error = err.to_string(),
            "failure to dispose the channel"
        ),
    }
}
