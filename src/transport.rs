// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport
//!
//! The provider never talks to a broker library directly. It goes through the
//! three traits defined here: a [`Transport`] opens connections, a
//! [`BrokerConnection`] opens channels, and a [`BrokerChannel`] issues the
//! protocol operations (declare, publish, consume, get, ack, nack, cancel).
//!
//! Connections and channels report their lifecycle through a
//! `tokio::sync::watch` receiver of [`LinkState`], so the managers owning them
//! can await the close of a link instead of registering ad hoc listeners.
//!
//! The lapin-backed implementation lives in [`crate::amqp`]; an in-memory
//! broker used by tests lives in `crate::memory`.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition, QueueInfo},
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::{collections::BTreeMap, fmt, sync::Arc};
use tokio::sync::watch;

/// Content type set on every message the provider publishes.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Lifecycle of a connection or a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Open,
    Closed(String),
}

impl LinkState {
    pub fn is_closed(&self) -> bool {
        matches!(self, LinkState::Closed(_))
    }
}

/// A message as delivered by the broker, before decoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMessage {
    pub delivery_tag: u64,
    pub data: Vec<u8>,
    pub redelivered: bool,
    pub message_id: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// A message ready to be published.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub payload: Vec<u8>,
    pub message_id: String,
    pub headers: BTreeMap<String, String>,
    pub persistent: bool,
}

/// Handler invoked for every message delivered to a consumer.
///
/// Deliveries of one consumer are handed over one at a time, in broker order.
pub type DeliveryHandler = Arc<dyn Fn(RawMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Opens broker connections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// A live broker session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;

    fn link_state(&self) -> watch::Receiver<LinkState>;
}

/// A logical channel multiplexed over a connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares a queue and reports its metadata. Passive definitions only query it.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueInfo, AmqpError>;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Limits the number of unacknowledged deliveries per consumer.
    async fn prefetch(&self, count: u16) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), AmqpError>;

    /// Registers a consumer under `consumer_tag`. With `no_ack` the broker
    /// considers every delivery acknowledged as soon as it is sent.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
        handler: DeliveryHandler,
    ) -> Result<(), AmqpError>;

    /// Pulls a single message, `None` when the queue is empty.
    async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<RawMessage>, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;

    fn link_state(&self) -> watch::Receiver<LinkState>;
}

/// Opaque handle to a delivered message, bound to the channel that delivered it.
#[derive(Clone)]
pub struct DeliveryHandle {
    delivery_tag: u64,
    channel: Arc<dyn BrokerChannel>,
}

impl DeliveryHandle {
    pub fn new(delivery_tag: u64, channel: Arc<dyn BrokerChannel>) -> Self {
        DeliveryHandle {
            delivery_tag,
            channel,
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.channel.ack(self.delivery_tag).await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.channel.nack(self.delivery_tag, requeue).await
    }
}

impl fmt::Debug for DeliveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryHandle")
            .field("delivery_tag", &self.delivery_tag)
            .finish_non_exhaustive()
    }
}

/// Whether two trait objects point at the same link.
pub(crate) fn same_link<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
