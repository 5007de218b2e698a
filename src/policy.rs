// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry and Timeout Policy
//!
//! Every event consumed by a worker ends with exactly one acknowledgment or
//! one reject, within a bounded time:
//!
//! * the whole attempt sequence runs under a single deadline; on expiry the
//!   attempt's cancellation token is signalled and the event is rejected,
//! * a [`HandlerError::Retryable`] failure is retried with a growing delay
//!   until the attempt budget is spent, then the event is rejected,
//! * a [`HandlerError::Fatal`] failure is rejected right away,
//! * a shutdown of the worker rejects the event without consuming further
//!   budget. Nothing is ever acknowledged once shutdown has been observed.
//!
//! Rejected events are always requeued.

use crate::{
    config::RetryPolicyConfig,
    consumer::{Consumer, ConsumerRegistration, DeliveryCallback},
    errors::{AmqpError, ConfigError, HandlerError},
    event::Event,
    queue::pipeline_queue_name,
};
use async_trait::async_trait;
use futures_util::FutureExt;
use std::{future::Future, sync::Arc};
use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Settles events on the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn acknowledge(&self, event: &Event) -> Result<(), AmqpError>;

    async fn reject(&self, event: &Event) -> Result<(), AmqpError>;
}

/// Application logic of a worker stage.
///
/// Handlers may be invoked several times for the same event and must be safe
/// to re-run. Long running handlers should watch `cancel`.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event, cancel: CancellationToken) -> Result<(), HandlerError>;
}

/// [`EventHandler`] backed by a closure, see [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Wraps an async closure as an [`EventHandler`].
///
/// # Example
/// ```ignore
/// let handler = handler_fn(|event: Event, _cancel| async move {
///     tracing::info!(message = %event.message(), "processing");
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Event, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, event: &Event, cancel: CancellationToken) -> Result<(), HandlerError> {
        (self.f)(event.clone(), cancel).await
    }
}

/// Why an event was handed back to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: u32 },
    /// The handler reported an unrecoverable error.
    Fatal,
    /// The deadline elapsed before the handler succeeded.
    TimedOut,
    /// The worker is shutting down.
    Cancelled,
}

/// Final outcome of one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acknowledged { attempts: u32 },
    Rejected(RejectReason),
}

/// One failed handler attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub attempt: u32,
    pub error: HandlerError,
}

/// Timeout envelope around bounded retries of an [`EventHandler`].
#[derive(Debug, Clone)]
pub struct RetryTimeoutPolicy {
    name: String,
    config: RetryPolicyConfig,
}

impl RetryTimeoutPolicy {
    pub fn new(name: &str, config: RetryPolicyConfig) -> Result<RetryTimeoutPolicy, ConfigError> {
        config.validate()?;

        Ok(RetryTimeoutPolicy {
            name: name.to_owned(),
            config,
        })
    }

    pub fn config(&self) -> &RetryPolicyConfig {
        &self.config
    }

    /// Runs `handler` on `event` and settles the event through `acks`.
    ///
    /// # Parameters
    /// * `handler` - Worker logic, re-invoked from scratch on each attempt
    /// * `event` - The delivery being processed
    /// * `acks` - Where the acknowledgment or reject is sent
    /// * `shutdown` - Worker shutdown token; the handler receives a child of it
    ///
    /// # Returns
    /// The disposition that was sent. Failures to reach the broker while
    /// settling are logged and do not change the disposition.
    pub async fn execute(
        &self,
        handler: &dyn EventHandler,
        event: &Event,
        acks: &dyn Acknowledger,
        shutdown: &CancellationToken,
    ) -> Disposition {
        let attempt_token = shutdown.child_token();
        let deadline = Instant::now().checked_add(self.config.timeout);
        let mut history = vec![];

        let outcome = {
            let attempts = self.attempts(handler, event, &attempt_token, shutdown, &mut history);
            tokio::pin!(attempts);

            tokio::select! {
                outcome = &mut attempts => outcome,
                _ = expire(deadline) => {
                    attempt_token.cancel();
                    if shutdown.is_cancelled() {
                        Disposition::Rejected(RejectReason::Cancelled)
                    } else {
                        Disposition::Rejected(RejectReason::TimedOut)
                    }
                }
            }
        };

        self.report(event, outcome, &history);
        self.settle(event, outcome, acks).await;

        outcome
    }

    async fn attempts(
        &self,
        handler: &dyn EventHandler,
        event: &Event,
        attempt_token: &CancellationToken,
        shutdown: &CancellationToken,
        history: &mut Vec<AttemptFailure>,
    ) -> Disposition {
        let max_attempts = self.config.max_attempts;

        for attempt in 1..=max_attempts {
            if shutdown.is_cancelled() {
                return Disposition::Rejected(RejectReason::Cancelled);
            }

            let result = handler.handle(event, attempt_token.clone()).await;

            if shutdown.is_cancelled() {
                return Disposition::Rejected(RejectReason::Cancelled);
            }

            let err = match result {
                Ok(()) => return Disposition::Acknowledged { attempts: attempt },
                Err(HandlerError::Cancelled) => {
                    return Disposition::Rejected(RejectReason::Cancelled)
                }
                Err(err @ HandlerError::Fatal(_)) => {
                    history.push(AttemptFailure {
                        attempt,
                        error: err,
                    });
                    return Disposition::Rejected(RejectReason::Fatal);
                }
                Err(err) => err,
            };

            if attempt == max_attempts {
                warn!(
                    worker = self.name.as_str(),
                    delivery_tag = event.delivery_tag(),
                    attempt,
                    max_attempts,
                    error = err.to_string(),
                    "last handler attempt failed"
                );
                history.push(AttemptFailure {
                    attempt,
                    error: err,
                });
                break;
            }

            let delay = self.config.backoff.delay(attempt);
            info!(
                worker = self.name.as_str(),
                delivery_tag = event.delivery_tag(),
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = err.to_string(),
                "handler attempt failed, retrying"
            );
            history.push(AttemptFailure {
                attempt,
                error: err,
            });

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Disposition::Rejected(RejectReason::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        Disposition::Rejected(RejectReason::Exhausted {
            attempts: max_attempts,
        })
    }

    fn report(&self, event: &Event, outcome: Disposition, history: &[AttemptFailure]) {
        let worker = self.name.as_str();
        let delivery_tag = event.delivery_tag();

        match outcome {
            Disposition::Acknowledged { attempts } => {
                debug!(worker, delivery_tag, attempts, "event processed");
            }
            Disposition::Rejected(RejectReason::Exhausted { attempts }) => error!(
                worker,
                delivery_tag,
                attempts,
                message = %event.message(),
                created_at = %event.created_at(),
                history = ?history,
                "event could not be processed, it is requeued"
            ),
            Disposition::Rejected(RejectReason::Fatal) => error!(
                worker,
                delivery_tag,
                message = %event.message(),
                created_at = %event.created_at(),
                history = ?history,
                "unrecoverable failure processing the event, it is requeued"
            ),
            Disposition::Rejected(RejectReason::TimedOut) => warn!(
                worker,
                delivery_tag,
                timeout_ms = self.config.timeout.as_millis() as u64,
                message = %event.message(),
                attempts = history.len(),
                "event was not processed before the timeout, it is requeued"
            ),
            Disposition::Rejected(RejectReason::Cancelled) => info!(
                worker,
                delivery_tag,
                "processing cancelled by shutdown, the event is requeued"
            ),
        }
    }

    async fn settle(&self, event: &Event, outcome: Disposition, acks: &dyn Acknowledger) {
        if !event.is_ackable() {
            debug!(worker = self.name.as_str(), "local event, nothing to settle");
            return;
        }

        let settled = match outcome {
            Disposition::Acknowledged { .. } => acks.acknowledge(event).await,
            Disposition::Rejected(_) => acks.reject(event).await,
        };

        if let Err(err) = settled {
            error!(
                worker = self.name.as_str(),
                delivery_tag = event.delivery_tag(),
                error = err.to_string(),
                "failure to settle the event"
            );
        }
    }
}

/// Resolves at `deadline`; a timeout too large to be represented never
/// expires.
async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// A pipeline stage: one routing key, one handler, one policy.
pub struct Worker {
    name: String,
    routing_key: String,
    consumer: Consumer,
    handler: Arc<dyn EventHandler>,
    policy: Arc<RetryTimeoutPolicy>,
    shutdown: CancellationToken,
    registration: Mutex<Option<ConsumerRegistration>>,
}

impl Worker {
    pub fn new(
        name: &str,
        routing_key: &str,
        consumer: Consumer,
        handler: Arc<dyn EventHandler>,
        config: RetryPolicyConfig,
    ) -> Result<Worker, ConfigError> {
        Ok(Worker {
            name: name.to_owned(),
            routing_key: routing_key.to_owned(),
            consumer,
            handler,
            policy: Arc::new(RetryTimeoutPolicy::new(name, config)?),
            shutdown: CancellationToken::new(),
            registration: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn queue_name(&self) -> String {
        pipeline_queue_name(&self.routing_key)
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Subscribes the worker queue. Calling it again returns the existing
    /// registration.
    pub async fn start(&self) -> Result<ConsumerRegistration, AmqpError> {
        let mut registration = self.registration.lock().await;
        if let Some(existing) = registration.as_ref() {
            return Ok(existing.clone());
        }

        let policy = self.policy.clone();
        let handler = self.handler.clone();
        let consumer = self.consumer.clone();
        let shutdown = self.shutdown.clone();

        let callback: DeliveryCallback = Arc::new(move |event: Event| {
            let policy = policy.clone();
            let handler = handler.clone();
            let consumer = consumer.clone();
            let shutdown = shutdown.clone();

            async move {
                policy
                    .execute(handler.as_ref(), &event, &consumer, &shutdown)
                    .await;
            }
            .boxed()
        });

        let subscribed = self
            .consumer
            .subscribe_queue(&self.queue_name(), &self.routing_key, callback)
            .await?;

        info!(
            worker = self.name.as_str(),
            queue = subscribed.queue_name.as_str(),
            "worker started"
        );

        *registration = Some(subscribed.clone());
        Ok(subscribed)
    }

    /// Runs one event through the policy outside of the broker subscription.
    pub async fn process(&self, event: &Event) -> Disposition {
        self.policy
            .execute(self.handler.as_ref(), event, &self.consumer, &self.shutdown)
            .await
    }

    /// Stops receiving, then signals in-flight handlers to give up.
    ///
    /// The subscription is cancelled first, so no delivery reaches the
    /// worker once its handlers observe the shutdown. A handler that
    /// finishes while the unsubscribe is still in progress is acknowledged
    /// as usual; everything still running afterwards is rejected.
    pub async fn stop(&self) {
        if let Some(registration) = self.registration.lock().await.take() {
            self.consumer.unsubscribe(&registration.consumer_tag).await;
        }

        self.shutdown.cancel();
        info!(worker = self.name.as_str(), "cancellation token is cancelled");
    }
}
