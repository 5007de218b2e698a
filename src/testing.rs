// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests. It follows the AMQP rules the
//! pipeline relies on: direct routing, mandatory returns, per-consumer
//! prefetch, channel-scoped delivery tags and requeue on reject or channel
//! loss.

use crate::{
    channel::{
        BrokerChannel, ChannelFactory, DeliveryStream, Headers, PublishOutcome, PublishRequest,
        ReturnedMessage, WireDelivery,
    },
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

pub(crate) const NO_ROUTE: u16 = 312;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StoredMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub content_type: String,
    pub message_id: String,
    pub timestamp: u64,
    pub delivery_mode: u8,
    pub headers: Headers,
    pub redelivered: bool,
}

struct Subscriber {
    channel_id: u16,
    tag: String,
    queue: String,
    tx: UnboundedSender<Result<WireDelivery, AmqpError>>,
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    message: StoredMessage,
}

#[derive(Default)]
struct ChannelEntry {
    open: bool,
    prefetch: u16,
    next_tag: u64,
    unacked: HashMap<u64, Unacked>,
}

impl ChannelEntry {
    fn unacked_by(&self, consumer_tag: &str) -> usize {
        self.unacked
            .values()
            .filter(|u| u.consumer_tag == consumer_tag)
            .count()
    }
}

struct BrokerState {
    reachable: bool,
    dispatch_concurrency: usize,
    exchanges: HashSet<String>,
    bindings: Vec<(String, String, String)>,
    queues: HashMap<String, VecDeque<StoredMessage>>,
    subscribers: Vec<Subscriber>,
    channels: HashMap<u16, ChannelEntry>,
    next_channel_id: u16,
    channels_created: usize,
    acks: Vec<u64>,
    rejects: Vec<u64>,
    max_unacked: usize,
}

impl BrokerState {
    fn channel_mut(&mut self, id: u16) -> Result<&mut ChannelEntry, AmqpError> {
        match self.channels.get_mut(&id) {
            Some(entry) if entry.open => Ok(entry),
            _ => Err(AmqpError::ChannelError),
        }
    }

    fn route(&mut self, exchange: &str, routing_key: &str, message: &StoredMessage) -> bool {
        let targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|(ex, rk, _)| ex == exchange && rk == routing_key)
            .map(|(_, _, queue)| queue.clone())
            .collect();

        for queue in &targets {
            self.queues
                .entry(queue.clone())
                .or_default()
                .push_back(message.clone());
        }

        !targets.is_empty()
    }

    /// Hands queued messages to consumers that still have prefetch room.
    fn pump(&mut self) {
        let mut index = 0;
        while index < self.subscribers.len() {
            let (channel_id, tag, queue) = {
                let sub = &self.subscribers[index];
                (sub.channel_id, sub.tag.clone(), sub.queue.clone())
            };

            let delivered = self.deliver_one(index, channel_id, &tag, &queue);
            match delivered {
                Delivered::One => index = 0,
                Delivered::Nothing => index += 1,
                Delivered::Gone => {
                    self.subscribers.remove(index);
                }
            }
        }
    }

    fn deliver_one(&mut self, index: usize, channel_id: u16, tag: &str, queue: &str) -> Delivered {
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return Delivered::Gone;
        };
        if !channel.open {
            return Delivered::Gone;
        }

        let in_flight = channel.unacked_by(tag);
        if channel.prefetch != 0 && in_flight >= channel.prefetch as usize {
            return Delivered::Nothing;
        }

        let Some(message) = self.queues.get_mut(queue).and_then(VecDeque::pop_front) else {
            return Delivered::Nothing;
        };

        channel.next_tag += 1;
        let delivery_tag = channel.next_tag;
        let wire = WireDelivery {
            delivery_tag,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            redelivered: message.redelivered,
            timestamp: Some(message.timestamp),
            headers: message.headers.clone(),
            payload: message.payload.clone(),
        };

        if self.subscribers[index].tx.send(Ok(wire)).is_err() {
            if let Some(q) = self.queues.get_mut(queue) {
                q.push_front(message);
            }
            channel.next_tag -= 1;
            return Delivered::Gone;
        }

        channel.unacked.insert(
            delivery_tag,
            Unacked {
                queue: queue.to_owned(),
                consumer_tag: tag.to_owned(),
                message,
            },
        );
        self.max_unacked = self.max_unacked.max(in_flight + 1);

        Delivered::One
    }

    fn requeue(&mut self, unacked: Unacked, front: bool) {
        let mut message = unacked.message;
        message.redelivered = true;

        let queue = self.queues.entry(unacked.queue).or_default();
        if front {
            queue.push_front(message);
        } else {
            queue.push_back(message);
        }
    }

    fn close_channel(&mut self, id: u16) {
        let Some(entry) = self.channels.get_mut(&id) else {
            return;
        };
        entry.open = false;

        let mut pending: Vec<(u64, Unacked)> = entry.unacked.drain().collect();
        pending.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        for (_, unacked) in pending {
            self.requeue(unacked, true);
        }

        self.subscribers.retain(|sub| sub.channel_id != id);
        self.pump();
    }
}

enum Delivered {
    One,
    Nothing,
    Gone,
}

/// Shared handle on the in-memory broker state.
#[derive(Clone)]
pub(crate) struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> InMemoryBroker {
        InMemoryBroker {
            state: Arc::new(Mutex::new(BrokerState {
                reachable: true,
                dispatch_concurrency: 2,
                exchanges: HashSet::default(),
                bindings: vec![],
                queues: HashMap::default(),
                subscribers: vec![],
                channels: HashMap::default(),
                next_channel_id: 0,
                channels_created: 0,
                acks: vec![],
                rejects: vec![],
                max_unacked: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().expect("in-memory broker state poisoned")
    }

    pub fn factory(&self) -> Arc<dyn ChannelFactory> {
        Arc::new(self.clone())
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    pub fn channels_created(&self) -> usize {
        self.lock().channels_created
    }

    pub fn open_channels(&self) -> usize {
        self.lock().channels.values().filter(|c| c.open).count()
    }

    pub fn prefetch_of(&self, id: u16) -> u16 {
        self.lock().channels.get(&id).map_or(0, |c| c.prefetch)
    }

    /// Closes the channel as the broker would on an error or connection loss.
    pub fn shutdown_channel(&self, id: u16) {
        self.lock().close_channel(id);
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains(name)
    }

    pub fn has_binding(&self, exchange: &str, routing_key: &str, queue: &str) -> bool {
        self.lock()
            .bindings
            .iter()
            .any(|(ex, rk, q)| ex == exchange && rk == routing_key && q == queue)
    }

    /// Declares and binds a queue without going through a channel.
    pub async fn declare(&self, queue: &QueueDefinition, binding: &QueueBinding<'_>) {
        let mut state = self.lock();
        state.queues.entry(queue.name.clone()).or_default();
        state.bindings.push((
            binding.exchange_name.to_owned(),
            binding.routing_key.to_owned(),
            binding.queue_name.to_owned(),
        ));
    }

    /// Publishes as a third party would, with a fixed publish timestamp.
    pub fn inject(&self, exchange: &str, routing_key: &str, payload: &[u8], timestamp: u64) {
        let mut state = self.lock();
        let message = StoredMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload: payload.to_vec(),
            content_type: "text/plain".to_owned(),
            message_id: String::new(),
            timestamp,
            delivery_mode: 2,
            headers: Headers::new(),
            redelivered: false,
        };
        state.route(exchange, routing_key, &message);
        state.pump();
    }

    pub fn queued(&self, queue: &str) -> Vec<StoredMessage> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn consumers_on(&self, queue: &str) -> usize {
        self.lock()
            .subscribers
            .iter()
            .filter(|sub| sub.queue == queue)
            .count()
    }

    /// Deliveries currently pushed to a consumer and not yet settled.
    pub fn unacked(&self) -> usize {
        self.lock().channels.values().map(|c| c.unacked.len()).sum()
    }

    /// Highest number of unacknowledged deliveries any consumer ever held.
    pub fn max_unacked(&self) -> usize {
        self.lock().max_unacked
    }

    pub fn acks(&self) -> Vec<u64> {
        self.lock().acks.clone()
    }

    pub fn rejects(&self) -> Vec<u64> {
        self.lock().rejects.clone()
    }
}

#[async_trait]
impl ChannelFactory for InMemoryBroker {
    fn identity(&self) -> &str {
        "TestApp:InMemory"
    }

    fn dispatch_concurrency(&self) -> usize {
        self.lock().dispatch_concurrency
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut state = self.lock();
        if !state.reachable {
            return Err(AmqpError::ConnectionError);
        }

        state.next_channel_id += 1;
        state.channels_created += 1;
        let id = state.next_channel_id;
        state.channels.insert(
            id,
            ChannelEntry {
                open: true,
                ..ChannelEntry::default()
            },
        );

        Ok(Arc::new(MemoryChannel {
            id,
            broker: self.clone(),
        }))
    }
}

struct MemoryChannel {
    id: u16,
    broker: InMemoryBroker,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn id(&self) -> u16 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.broker
            .lock()
            .channels
            .get(&self.id)
            .is_some_and(|c| c.open)
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.channel_mut(self.id)?;
        state.exchanges.insert(def.name.clone());
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.channel_mut(self.id)?;
        state.queues.entry(def.name.clone()).or_default();
        Ok(())
    }

    async fn bind_queue(&self, binding: &QueueBinding<'_>) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.channel_mut(self.id)?;

        if !state.queues.contains_key(binding.queue_name)
            || !state.exchanges.contains(binding.exchange_name)
        {
            state.close_channel(self.id);
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.to_owned(),
                binding.queue_name.to_owned(),
            ));
        }

        let entry = (
            binding.exchange_name.to_owned(),
            binding.routing_key.to_owned(),
            binding.queue_name.to_owned(),
        );
        if !state.bindings.contains(&entry) {
            state.bindings.push(entry);
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.channel_mut(self.id)?.prefetch = count;
        Ok(())
    }

    async fn enable_confirms(&self) -> Result<(), AmqpError> {
        self.broker.lock().channel_mut(self.id).map(|_| ())
    }

    async fn publish(&self, request: PublishRequest<'_>) -> Result<PublishOutcome, AmqpError> {
        let mut state = self.broker.lock();
        state.channel_mut(self.id)?;

        if !state.exchanges.contains(request.exchange) {
            state.close_channel(self.id);
            return Err(AmqpError::PublishingError);
        }

        let message = StoredMessage {
            exchange: request.exchange.to_owned(),
            routing_key: request.routing_key.to_owned(),
            payload: request.payload.to_vec(),
            content_type: request.content_type.to_owned(),
            message_id: request.message_id,
            timestamp: request.timestamp,
            delivery_mode: request.delivery_mode,
            headers: request.headers,
            redelivered: false,
        };

        let routed = state.route(request.exchange, request.routing_key, &message);
        state.pump();

        if !routed && request.mandatory {
            return Ok(PublishOutcome::Returned(ReturnedMessage {
                exchange: message.exchange,
                routing_key: message.routing_key,
                reply_code: NO_ROUTE,
                reply_text: "NO_ROUTE".to_owned(),
                payload: message.payload,
            }));
        }

        Ok(PublishOutcome::Routed)
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.broker.lock();
        state.channel_mut(self.id)?;

        if !state.queues.contains_key(queue) {
            state.close_channel(self.id);
            return Err(AmqpError::BindingConsumerError(consumer_tag.to_owned()));
        }

        let (tx, rx) = unbounded_channel();
        state.subscribers.push(Subscriber {
            channel_id: self.id,
            tag: consumer_tag.to_owned(),
            queue: queue.to_owned(),
            tx,
        });
        state.pump();

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.channel_mut(self.id)?;
        let id = self.id;
        state
            .subscribers
            .retain(|sub| !(sub.channel_id == id && sub.tag == consumer_tag));
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        let channel = state
            .channel_mut(self.id)
            .map_err(|_| AmqpError::AckMessageError)?;

        if channel.unacked.remove(&delivery_tag).is_none() {
            state.close_channel(self.id);
            return Err(AmqpError::AckMessageError);
        }

        state.acks.push(delivery_tag);
        state.pump();
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        let channel = state
            .channel_mut(self.id)
            .map_err(|_| AmqpError::NackMessageError)?;

        let Some(unacked) = channel.unacked.remove(&delivery_tag) else {
            state.close_channel(self.id);
            return Err(AmqpError::NackMessageError);
        };

        state.requeue(unacked, false);
        state.rejects.push(delivery_tag);
        state.pump();
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.channel_mut(self.id)?;
        state.close_channel(self.id);
        Ok(())
    }
}
