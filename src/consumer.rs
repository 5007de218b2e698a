// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Receiver
//!
//! Subscribes worker queues on a prefetch-limited, manual-ack channel and
//! turns every wire delivery into an [`Event`] handed to a callback. Each
//! registration runs its own delivery loop; callbacks run on their own tasks,
//! bounded by a semaphore shared by every registration of the consumer.
//!
//! A delivery tag is only acknowledged or rejected on the channel that issued
//! it. Tags from a channel that has since been replaced, already settled tags
//! and local tags are refused with [`AmqpError::UnknownDeliveryTag`].

use crate::{
    channel::{ChannelFactory, ChannelRole, DeliveryStream},
    errors::AmqpError,
    event::Event,
    exchange::{ExchangeDefinition, PIPELINE_EXCHANGE},
    otel,
    policy::Acknowledger,
    queue::{QueueBinding, QueueDefinition},
    resilient::ResilientChannel,
};
use async_trait::async_trait;
use futures_util::{future::BoxFuture, FutureExt, StreamExt};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, Semaphore},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// First delay before re-subscribing a registration whose stream ended.
pub const RESUBSCRIBE_MIN_DELAY: Duration = Duration::from_secs(1);
/// Upper bound of the re-subscribe delay.
pub const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(30);

/// Asynchronous delivery callback.
pub type DeliveryCallback = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// An active subscription of a worker queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRegistration {
    pub queue_name: String,
    pub routing_key: String,
    pub consumer_tag: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack,
    Reject,
}

struct Registration {
    info: ConsumerRegistration,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct ConsumerInner {
    channel: ResilientChannel,
    exchange: ExchangeDefinition,
    dispatch: Arc<Semaphore>,
    registrations: Mutex<Vec<Registration>>,
    inflight: Mutex<HashSet<(u64, u64)>>,
}

/// Receives pipeline events. Cheap to clone; clones share the channel and
/// the registrations.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl Consumer {
    /// Creates the consumer and declares the pipeline exchange.
    pub async fn new(factory: Arc<dyn ChannelFactory>) -> Result<Consumer, AmqpError> {
        let permits = factory.dispatch_concurrency().max(1);
        let inner = ConsumerInner {
            channel: ResilientChannel::new(factory, ChannelRole::consume()),
            exchange: ExchangeDefinition::pipeline(),
            dispatch: Arc::new(Semaphore::new(permits)),
            registrations: Mutex::new(vec![]),
            inflight: Mutex::new(HashSet::default()),
        };

        inner
            .channel
            .get_channel()
            .await?
            .declare_exchange(&inner.exchange)
            .await?;

        Ok(Consumer {
            inner: Arc::new(inner),
        })
    }

    /// Declares `queue_name`, binds it to the pipeline exchange under
    /// `routing_key` and starts handing its deliveries to `callback`.
    ///
    /// # Parameters
    /// * `queue_name` - Usually [`crate::queue::pipeline_queue_name`] of the routing key
    /// * `routing_key` - Binding key of the worker stage
    /// * `callback` - Invoked once per delivery, on its own task
    ///
    /// # Returns
    /// The registration, whose `consumer_tag` can be passed to
    /// [`Consumer::unsubscribe`].
    pub async fn subscribe_queue(
        &self,
        queue_name: &str,
        routing_key: &str,
        callback: DeliveryCallback,
    ) -> Result<ConsumerRegistration, AmqpError> {
        let info = ConsumerRegistration {
            queue_name: queue_name.to_owned(),
            routing_key: routing_key.to_owned(),
            consumer_tag: format!("ctag-{}", Uuid::new_v4()),
        };

        let (stream, generation) = self.inner.attach(&info).await?;
        let cancel = CancellationToken::new();

        let mut registrations = self.inner.registrations.lock().await;
        let task = tokio::spawn(run_registration(
            self.inner.clone(),
            info.clone(),
            stream,
            generation,
            callback,
            cancel.clone(),
        ));
        registrations.push(Registration {
            info: info.clone(),
            cancel,
            task,
        });
        drop(registrations);

        info!(
            queue = queue_name,
            routing_key,
            consumer_tag = info.consumer_tag.as_str(),
            "consumer subscribed"
        );

        Ok(info)
    }

    /// Active registrations.
    pub async fn registrations(&self) -> Vec<ConsumerRegistration> {
        self.inner
            .registrations
            .lock()
            .await
            .iter()
            .map(|r| r.info.clone())
            .collect()
    }

    /// Cancels one consumer tag. Returns false when the tag is not registered.
    pub async fn unsubscribe(&self, consumer_tag: &str) -> bool {
        let registration = {
            let mut registrations = self.inner.registrations.lock().await;
            let Some(index) = registrations
                .iter()
                .position(|r| r.info.consumer_tag == consumer_tag)
            else {
                return false;
            };
            registrations.remove(index)
        };

        self.inner.cancel_registrations(vec![registration]).await;
        true
    }

    /// Cancels every consumer tag and clears the registration set.
    pub async fn unsubscribe_messages_from_queue(&self) {
        let registrations: Vec<Registration> =
            self.inner.registrations.lock().await.drain(..).collect();

        if registrations.is_empty() {
            debug!("no consumer to unsubscribe");
            return;
        }

        self.inner.cancel_registrations(registrations).await;
    }

    /// Positive acknowledgment of one delivery of the live channel.
    pub async fn acknowledge(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let generation = self.inner.channel.generation().await;
        self.inner
            .settle(generation, delivery_tag, Settlement::Ack)
            .await
    }

    /// Negative acknowledgment of one delivery of the live channel; the
    /// message is requeued.
    pub async fn reject(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let generation = self.inner.channel.generation().await;
        self.inner
            .settle(generation, delivery_tag, Settlement::Reject)
            .await
    }

    /// Unsubscribes everything, then closes the channel.
    pub async fn dispose(&self) {
        self.unsubscribe_messages_from_queue().await;
        self.inner.inflight.lock().await.clear();
        self.inner.channel.close().await;
    }
}

#[async_trait]
impl Acknowledger for Consumer {
    async fn acknowledge(&self, event: &Event) -> Result<(), AmqpError> {
        self.inner
            .settle(event.channel_generation(), event.delivery_tag(), Settlement::Ack)
            .await
    }

    async fn reject(&self, event: &Event) -> Result<(), AmqpError> {
        self.inner
            .settle(
                event.channel_generation(),
                event.delivery_tag(),
                Settlement::Reject,
            )
            .await
    }
}

impl ConsumerInner {
    /// Declares, binds and consumes the registration's queue on the live
    /// channel.
    async fn attach(
        &self,
        info: &ConsumerRegistration,
    ) -> Result<(DeliveryStream, u64), AmqpError> {
        let channel = self.channel.get_channel().await?;

        channel
            .declare_queue(&QueueDefinition::worker(&info.queue_name))
            .await?;
        channel
            .bind_queue(
                &QueueBinding::new(&info.queue_name)
                    .exchange(PIPELINE_EXCHANGE)
                    .routing_key(&info.routing_key),
            )
            .await?;

        let stream = channel
            .consume(&info.queue_name, &info.consumer_tag)
            .await?;

        let generation = channel.generation();
        self.inflight
            .lock()
            .await
            .retain(|(issued_by, _)| *issued_by >= generation);

        Ok((stream, generation))
    }

    /// Whether the channel of `generation` is still the open one.
    async fn is_live(&self, generation: u64) -> bool {
        self.channel
            .current()
            .await
            .is_some_and(|c| c.generation() == generation)
    }

    async fn is_registered(&self, consumer_tag: &str) -> bool {
        self.registrations
            .lock()
            .await
            .iter()
            .any(|r| r.info.consumer_tag == consumer_tag)
    }

    /// The broker stops pushing to a tag before its delivery loop is told to
    /// stop, so every delivery already pulled is either dispatched or
    /// requeued by the loop.
    async fn cancel_registrations(&self, registrations: Vec<Registration>) {
        let channel = self.channel.current().await;
        for registration in &registrations {
            let tag = registration.info.consumer_tag.as_str();

            if let Some(channel) = &channel {
                if let Err(err) = channel.cancel(tag).await {
                    warn!(
                        consumer_tag = tag,
                        error = err.to_string(),
                        "failure to cancel consumer on the broker"
                    );
                }
            }

            registration.cancel.cancel();
        }

        for registration in registrations {
            let tag = registration.info.consumer_tag.as_str();

            if let Err(err) = registration.task.await {
                error!(
                    consumer_tag = tag,
                    error = err.to_string(),
                    "delivery loop ended abnormally"
                );
            }

            info!(consumer_tag = tag, "consumer unsubscribed");
        }
    }

    async fn settle(
        &self,
        generation: u64,
        delivery_tag: u64,
        settlement: Settlement,
    ) -> Result<(), AmqpError> {
        if !self.inflight.lock().await.remove(&(generation, delivery_tag)) {
            warn!(
                delivery_tag,
                generation, "delivery tag is unknown or was already settled"
            );
            return Err(AmqpError::UnknownDeliveryTag(delivery_tag));
        }

        let channel = self
            .channel
            .current()
            .await
            .filter(|c| c.generation() == generation);

        let Some(channel) = channel else {
            warn!(
                delivery_tag,
                generation, "delivery was issued by a channel that is no longer open"
            );
            return Err(AmqpError::UnknownDeliveryTag(delivery_tag));
        };

        match settlement {
            Settlement::Ack => {
                channel.ack(delivery_tag).await?;
                debug!(delivery_tag, "message acknowledged");
            }
            Settlement::Reject => {
                channel.reject(delivery_tag).await?;
                debug!(delivery_tag, "message rejected and requeued");
            }
        }

        Ok(())
    }
}

/// Delivery loop of one registration. Re-attaches when the stream ends while
/// the registration is still active.
async fn run_registration(
    inner: Arc<ConsumerInner>,
    info: ConsumerRegistration,
    mut stream: DeliveryStream,
    mut generation: u64,
    callback: DeliveryCallback,
    cancel: CancellationToken,
) {
    loop {
        dispatch(&inner, &info, stream, generation, &callback, &cancel).await;

        if cancel.is_cancelled() || !inner.is_registered(&info.consumer_tag).await {
            debug!(
                consumer_tag = info.consumer_tag.as_str(),
                "delivery loop stopped"
            );
            return;
        }

        warn!(
            consumer_tag = info.consumer_tag.as_str(),
            queue = info.queue_name.as_str(),
            "delivery stream ended, re-subscribing"
        );

        let mut delay = RESUBSCRIBE_MIN_DELAY;
        loop {
            match inner.attach(&info).await {
                Ok((next, next_generation)) => {
                    info!(
                        consumer_tag = info.consumer_tag.as_str(),
                        generation = next_generation,
                        "consumer re-subscribed"
                    );
                    stream = next;
                    generation = next_generation;
                    break;
                }
                Err(err) => {
                    warn!(
                        consumer_tag = info.consumer_tag.as_str(),
                        error = err.to_string(),
                        retry_in_ms = delay.as_millis() as u64,
                        "failure to re-subscribe"
                    );
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(RESUBSCRIBE_MAX_DELAY);
        }
    }
}

async fn dispatch(
    inner: &Arc<ConsumerInner>,
    info: &ConsumerRegistration,
    mut stream: DeliveryStream,
    generation: u64,
    callback: &DeliveryCallback,
    cancel: &CancellationToken,
) {
    let tracer = global::tracer(otel::CONSUMER_TRACER);

    loop {
        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                requeue_buffered(inner, &mut stream, generation).await;
                return;
            }
            next = stream.next() => match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(err)) => {
                    error!(
                        consumer_tag = info.consumer_tag.as_str(),
                        error = err.to_string(),
                        "failure to receive delivery"
                    );
                    return;
                }
                None => return,
            },
        };

        let delivery_tag = delivery.delivery_tag;
        debug!(
            delivery_tag,
            redelivered = delivery.redelivered,
            consumer_tag = info.consumer_tag.as_str(),
            "message received"
        );

        if !inner.is_live(generation).await {
            debug!(delivery_tag, "channel is closed, dropping the delivery");
            continue;
        }

        if cancel.is_cancelled() {
            requeue_undispatched(inner, generation, delivery_tag).await;
            requeue_buffered(inner, &mut stream, generation).await;
            return;
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                requeue_undispatched(inner, generation, delivery_tag).await;
                requeue_buffered(inner, &mut stream, generation).await;
                return;
            }
            permit = inner.dispatch.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let (_ctx, mut span) = otel::new_span(
            &delivery.headers,
            &tracer,
            &info.queue_name,
            delivery_tag,
        );

        let event = Event::from_delivery(delivery, generation);
        inner.inflight.lock().await.insert((generation, delivery_tag));

        let inner = inner.clone();
        let callback = callback.clone();
        tokio::spawn(async move {
            let _permit = permit;

            match tokio::spawn(callback(event)).await {
                Ok(()) => span.set_status(Status::Ok),
                Err(err) => {
                    warn!(
                        delivery_tag,
                        error = err.to_string(),
                        "delivery callback failed, rejecting the delivery"
                    );
                    span.set_status(Status::error("delivery callback failed"));

                    if let Err(err) = inner
                        .settle(generation, delivery_tag, Settlement::Reject)
                        .await
                    {
                        debug!(delivery_tag, error = err.to_string(), "failure to reject");
                    }
                }
            }

            span.end();
        });
    }
}

/// Rejects (requeues) a delivery that was pulled from the stream but will
/// never reach the callback. Deliveries of a closed channel are left to the
/// broker, which requeues them itself.
async fn requeue_undispatched(inner: &ConsumerInner, generation: u64, delivery_tag: u64) {
    if !inner.is_live(generation).await {
        return;
    }

    inner.inflight.lock().await.insert((generation, delivery_tag));
    match inner
        .settle(generation, delivery_tag, Settlement::Reject)
        .await
    {
        Ok(()) => debug!(delivery_tag, "registration cancelled, delivery requeued"),
        Err(err) => warn!(
            delivery_tag,
            error = err.to_string(),
            "failure to requeue undispatched delivery"
        ),
    }
}

async fn requeue_buffered(inner: &ConsumerInner, stream: &mut DeliveryStream, generation: u64) {
    while let Some(Some(Ok(delivery))) = stream.next().now_or_never() {
        requeue_undispatched(inner, generation, delivery.delivery_tag).await;
    }
}
