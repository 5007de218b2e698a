// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Channel Adapter
//!
//! Implements [`BrokerChannel`] on top of a `lapin` channel. Every lapin error
//! is logged where it happens and mapped to an [`AmqpError`] variant.

use crate::{
    channel::{
        BrokerChannel, DeliveryStream, Headers, PublishOutcome, PublishRequest, ReturnedMessage,
        WireDelivery,
    },
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel,
};
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

/// AMQP reply code of a normal channel close.
pub const REPLY_SUCCESS: u16 = 200;

/// A `lapin` channel with its shutdown hook attached.
pub struct AmqpChannel {
    channel: Channel,
}

impl AmqpChannel {
    /// Wraps `channel` and installs the shutdown hook.
    ///
    /// The hook only logs: recovery happens on the next access through
    /// [`crate::resilient::ResilientChannel`].
    pub fn new(channel: Channel, identity: &str) -> AmqpChannel {
        let channel_id = channel.id();
        let identity = identity.to_owned();

        channel.on_error(move |err| {
            warn!(
                identity = identity.as_str(),
                channel_id,
                error = err.to_string(),
                "channel shutdown event raised"
            );
        });

        AmqpChannel { channel }
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to declare queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding<'_>) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .channel
            .queue_bind(
                binding.queue_name,
                binding.exchange_name,
                binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.to_owned(),
                    binding.queue_name.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn enable_confirms(&self) -> Result<(), AmqpError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to enable publisher confirms");
                AmqpError::ChannelError
            })
    }

    async fn publish(&self, request: PublishRequest<'_>) -> Result<PublishOutcome, AmqpError> {
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(request.content_type))
            .with_message_id(ShortString::from(request.message_id))
            .with_delivery_mode(request.delivery_mode)
            .with_timestamp(request.timestamp)
            .with_headers(to_field_table(request.headers));

        let confirm = self
            .channel
            .basic_publish(
                request.exchange,
                request.routing_key,
                BasicPublishOptions {
                    mandatory: request.mandatory,
                    immediate: false,
                },
                request.payload,
                properties,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishingError
            })?;

        let confirmation = confirm.await.map_err(|err| {
            error!(error = err.to_string(), "error waiting for publisher confirm");
            AmqpError::PublishingError
        })?;

        let nacked = confirmation.is_nack();
        if let Some(mut returned) = confirmation.take_message() {
            return Ok(PublishOutcome::Returned(ReturnedMessage {
                exchange: returned.delivery.exchange.to_string(),
                routing_key: returned.delivery.routing_key.to_string(),
                reply_code: returned.reply_code,
                reply_text: returned.reply_text.to_string(),
                payload: std::mem::take(&mut returned.delivery.data),
            }));
        }

        if nacked {
            info!(
                channel_id = self.channel.id(),
                "signalled when a basic.nack command arrives from the broker"
            );
            return Ok(PublishOutcome::Nacked);
        }

        debug!(
            channel_id = self.channel.id(),
            "signalled when a basic.ack command arrives from the broker"
        );
        Ok(PublishOutcome::Routed)
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(consumer_tag.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(to_wire_delivery(delivery)),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), consumer_tag, "failure to cancel consumer");
                AmqpError::CancelConsumerError(consumer_tag.to_owned())
            })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn reject(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue: true,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| {
                debug!(error = err.to_string(), "failure to close the channel");
                AmqpError::ChannelError
            })
    }
}

fn to_field_table(headers: Headers) -> FieldTable {
    let btree: BTreeMap<ShortString, AMQPValue> = headers
        .into_iter()
        .map(|(key, value)| {
            (
                ShortString::from(key),
                AMQPValue::LongString(LongString::from(value)),
            )
        })
        .collect();

    FieldTable::from(btree)
}

/// Keeps the string-valued headers; other AMQP value types are not used by
/// the pipeline.
fn to_headers(props: &AMQPProperties) -> Headers {
    let Some(table) = props.headers() else {
        return Headers::new();
    };

    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()?
                    .to_owned(),
                AMQPValue::ShortString(v) => v.as_str().to_owned(),
                _ => return None,
            };
            Some((key.as_str().to_owned(), value))
        })
        .collect()
}

fn to_wire_delivery(mut delivery: Delivery) -> WireDelivery {
    WireDelivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        timestamp: *delivery.properties.timestamp(),
        headers: to_headers(&delivery.properties),
        payload: std::mem::take(&mut delivery.data),
    }
}
