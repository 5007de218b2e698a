// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection
//!
//! One long-lived `lapin` connection per component, labelled with the
//! component identity so it can be told apart on the broker management UI.
//! Channels are created from it on demand; when the connection itself has
//! been lost it is re-established before the next channel is created.

use crate::{
    amqp::{AmqpChannel, REPLY_SUCCESS},
    channel::{BrokerChannel, ChannelFactory},
    config::RabbitMQConfigs,
    errors::AmqpError,
};
use async_trait::async_trait;
use lapin::{types::LongString, Connection, ConnectionProperties};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// A named connection to RabbitMQ.
pub struct BrokerConnection {
    identity: String,
    cfg: RabbitMQConfigs,
    connection: Mutex<Arc<Connection>>,
}

impl BrokerConnection {
    /// Connects to RabbitMQ.
    ///
    /// # Parameters
    /// * `identity` - Connection name shown by the broker (e.g. the component name)
    /// * `cfg` - Host, credentials, heartbeat and dispatch settings
    ///
    /// # Returns
    /// * `Result<Arc<BrokerConnection>, AmqpError>` - `ConnectionError` when the
    ///   broker is unreachable or rejects the credentials.
    ///
    /// # Example
    /// ```ignore
    /// let conn = BrokerConnection::connect("TestApp:EventReceiver", &cfg).await?;
    /// ```
    pub async fn connect(
        identity: &str,
        cfg: &RabbitMQConfigs,
    ) -> Result<Arc<BrokerConnection>, AmqpError> {
        let connection = Self::open(identity, cfg).await?;

        Ok(Arc::new(BrokerConnection {
            identity: identity.to_owned(),
            cfg: cfg.clone(),
            connection: Mutex::new(Arc::new(connection)),
        }))
    }

    async fn open(identity: &str, cfg: &RabbitMQConfigs) -> Result<Connection, AmqpError> {
        debug!(
            identity,
            uri = cfg.redacted_uri(),
            "creating a connection to RabbitMQ server"
        );

        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(identity.to_owned()));

        let conn = match Connection::connect(&cfg.uri(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), identity, "failure to connect");
                Err(AmqpError::ConnectionError)
            }
        }?;

        let owner = identity.to_owned();
        conn.on_error(move |err| {
            warn!(
                identity = owner.as_str(),
                error = err.to_string(),
                "lost connection to broker"
            );
        });

        info!(identity, "amqp connected");
        Ok(conn)
    }

    /// Returns the live connection, reconnecting first when the current one
    /// is no longer usable.
    async fn live_connection(&self) -> Result<Arc<Connection>, AmqpError> {
        let mut current = self.connection.lock().await;

        if !current.status().connected() {
            warn!(
                identity = self.identity.as_str(),
                "connection found in a closed state and will be re-opened"
            );
            *current = Arc::new(Self::open(&self.identity, &self.cfg).await?);
        }

        Ok(current.clone())
    }

    /// Closes the connection and every channel created from it.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let current = self.connection.lock().await;
        if !current.status().connected() {
            return Ok(());
        }

        current.close(REPLY_SUCCESS, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "failure to close the connection");
            AmqpError::ConnectionError
        })?;

        info!(identity = self.identity.as_str(), "amqp connection closed");
        Ok(())
    }
}

#[async_trait]
impl ChannelFactory for BrokerConnection {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn dispatch_concurrency(&self) -> usize {
        self.cfg.dispatch_concurrency
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let conn = self.live_connection().await?;

        debug!("creating amqp channel...");
        match conn.create_channel().await {
            Ok(c) => {
                debug!(channel_id = c.id(), "channel created");
                Ok(Arc::new(AmqpChannel::new(c, &self.identity)))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }
}
