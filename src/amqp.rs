// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Transport
//!
//! This module implements the transport traits on top of `lapin`. It
//! establishes connections, creates channels, and maps lapin's error hooks
//! onto [`LinkState`] watch channels so the connection and channel managers
//! learn when a link goes away.
//!
//! Each registered consumer gets a task draining lapin's consumer stream and
//! handing every delivery to the provider's delivery handler, one at a time.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition, QueueInfo},
    transport::{
        BrokerChannel, BrokerConnection, DeliveryHandler, Envelope, LinkState, RawMessage,
        Transport, JSON_CONTENT_TYPE,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicNackOptions, BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Delivery mode flag marking a message as persistent.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Opens lapin connections.
pub struct AmqpTransport {
    connection_name: String,
}

impl AmqpTransport {
    /// Creates a transport whose connections carry `connection_name`, shown in
    /// the broker's management UI.
    pub fn new(connection_name: &str) -> Arc<AmqpTransport> {
        Arc::new(AmqpTransport {
            connection_name: connection_name.to_owned(),
        })
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(url, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError {})
            }
        }?;
        debug!("amqp connected");

        let (state, _) = watch::channel(LinkState::Open);
        let state = Arc::new(state);

        let notifier = state.clone();
        conn.on_error(move |err| {
            warn!(error = err.to_string(), "amqp connection closed");
            notifier.send_replace(LinkState::Closed(err.to_string()));
        });

        Ok(Arc::new(AmqpConnection { inner: conn, state }))
    }
}

/// A lapin connection and its lifecycle.
pub struct AmqpConnection {
    inner: Connection,
    state: Arc<watch::Sender<LinkState>>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        let channel = match self.inner.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError {})
            }
        }?;

        let (state, _) = watch::channel(LinkState::Open);
        let state = Arc::new(state);

        let notifier = state.clone();
        channel.on_error(move |err| {
            warn!(error = err.to_string(), "amqp channel closed");
            notifier.send_replace(LinkState::Closed(err.to_string()));
        });

        // a channel never outlives its connection
        let mut parent = self.state.subscribe();
        let notifier = state.clone();
        tokio::spawn(async move {
            let reason = match parent.wait_for(LinkState::is_closed).await {
                Ok(closed) => closed.clone(),
                Err(_) => LinkState::Closed("connection dropped".to_owned()),
            };
            notifier.send_if_modified(|current| {
                if current.is_closed() {
                    return false;
                }
                *current = reason;
                true
            });
        });

        debug!("channel created");
        Ok(Arc::new(AmqpChannel {
            inner: channel,
            state,
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let result = self.inner.close(200, "OK").await;
        self.state
            .send_replace(LinkState::Closed("closed by client".to_owned()));

        result.map_err(|err| {
            error!(error = err.to_string(), "failure to close the connection");
            AmqpError::ConnectionError
        })
    }

    fn link_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }
}

/// A lapin channel and its lifecycle.
pub struct AmqpChannel {
    inner: Channel,
    state: Arc<watch::Sender<LinkState>>,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueInfo, AmqpError> {
        debug!("declaring queue: {}", def.name);

        match self
            .inner
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
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
                error!(error = err.to_string(), name = def.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Ok(queue) => Ok(QueueInfo {
                queue: queue.name().as_str().to_owned(),
                message_count: queue.message_count(),
                consumer_count: queue.consumer_count(),
            }),
        }
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("declaring exchange: {}", def.name);

        match self
            .inner
            .exchange_declare(
                &def.name,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: false,
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
                    name = def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {}",
            binding.queue_name, binding.exchange_name
        );

        match self
            .inner
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                "",
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.inner
            .basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), AmqpError> {
        let headers = envelope
            .headers
            .into_iter()
            .map(|(key, value)| {
                (
                    ShortString::from(key),
                    AMQPValue::LongString(LongString::from(value)),
                )
            })
            .collect::<BTreeMap<_, _>>();

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_message_id(ShortString::from(envelope.message_id))
            .with_headers(FieldTable::from(headers));
        if envelope.persistent {
            properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        match self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &envelope.payload,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
        handler: DeliveryHandler,
    ) -> Result<(), AmqpError> {
        let mut consumer = match self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let tag = consumer_tag.to_owned();
        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => handler(raw_message(&delivery)).await,
                    Err(err) => error!(error = err.to_string(), "errors consume msg"),
                }
            }
            debug!(consumer = tag, "consumer stream ended");
        });

        Ok(())
    }

    async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<RawMessage>, AmqpError> {
        match self
            .inner
            .basic_get(queue, BasicGetOptions { no_ack })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to get message");
                Err(AmqpError::GetMessageError(queue.to_owned()))
            }
            Ok(message) => Ok(message.map(|m| raw_message(&m.delivery))),
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.inner
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to cancel the consumer");
                AmqpError::CancelConsumerError(consumer_tag.to_owned())
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let result = self.inner.close(200, "OK").await;
        self.state
            .send_replace(LinkState::Closed("closed by client".to_owned()));

        result.map_err(|err| {
            error!(error = err.to_string(), "failure to close the channel");
            AmqpError::ChannelError
        })
    }

    fn link_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }
}

fn raw_message(delivery: &Delivery) -> RawMessage {
    RawMessage {
        delivery_tag: delivery.delivery_tag,
        data: delivery.data.clone(),
        redelivered: delivery.redelivered,
        message_id: delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.to_string()),
        headers: extract_headers(&delivery.properties),
    }
}

/// Keeps the string-valued headers of a delivery.
fn extract_headers(props: &AMQPProperties) -> BTreeMap<String, String> {
    let Some(table) = props.headers() else {
        return BTreeMap::default();
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
                AMQPValue::ShortString(v) => v.to_string(),
                _ => return None,
            };
            Some((key.to_string(), value))
        })
        .collect()
}
