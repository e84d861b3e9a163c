// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A broker living inside the process, implementing the transport traits. It
//! models what the provider relies on: durable and exclusive queues, fanout
//! exchanges, per-consumer prefetch, unacknowledged deliveries requeued with
//! the `redelivered` flag when their channel goes away, and round-robin
//! dispatch between competing consumers.
//!
//! Fault injection (`set_available`, `refuse_channels`, `sever_connections`,
//! `close_channels`, `delay_settlements`) drives the reconnect and recreate
//! paths from tests.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition, QueueInfo},
    transport::{
        BrokerChannel, BrokerConnection, DeliveryHandler, Envelope, LinkState, RawMessage,
        Transport,
    },
};
use async_trait::async_trait;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

#[derive(Clone)]
struct Stored {
    payload: Vec<u8>,
    message_id: Option<String>,
    headers: BTreeMap<String, String>,
    redelivered: bool,
}

impl Stored {
    fn to_raw(&self, delivery_tag: u64) -> RawMessage {
        RawMessage {
            delivery_tag,
            data: self.payload.clone(),
            redelivered: self.redelivered,
            message_id: self.message_id.clone(),
            headers: self.headers.clone(),
        }
    }
}

struct Unacked {
    queue: String,
    message: Stored,
    consumer: Option<String>,
}

struct MemoryConsumer {
    tag: String,
    channel: u64,
    no_ack: bool,
    sender: mpsc::UnboundedSender<RawMessage>,
}

#[derive(Default)]
struct MemoryQueue {
    ready: VecDeque<Stored>,
    consumers: Vec<MemoryConsumer>,
    owner: Option<u64>,
}

struct ChannelSlot {
    connection: u64,
    state: Arc<watch::Sender<LinkState>>,
    next_tag: u64,
    prefetch: u16,
    unacked: BTreeMap<u64, Unacked>,
}

impl ChannelSlot {
    fn has_capacity(&self, consumer: &str) -> bool {
        self.prefetch == 0
            || self
                .unacked
                .values()
                .filter(|u| u.consumer.as_deref() == Some(consumer))
                .count()
                < self.prefetch as usize
    }

    fn next_delivery_tag(&mut self) -> u64 {
        self.next_tag += 1;
        self.next_tag
    }
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, MemoryQueue>,
    exchanges: HashMap<String, Vec<String>>,
    connections: HashMap<u64, Arc<watch::Sender<LinkState>>>,
    channels: HashMap<u64, ChannelSlot>,
}

impl BrokerState {
    fn open_channel(&mut self, id: u64) -> Result<&mut ChannelSlot, AmqpError> {
        self.channels.get_mut(&id).ok_or(AmqpError::ChannelError)
    }

    /// Hands ready messages to consumers with spare capacity.
    fn pump(&mut self, queue: &str) {
        let BrokerState {
            queues, channels, ..
        } = self;
        let Some(q) = queues.get_mut(queue) else {
            return;
        };
        q.consumers.retain(|c| !c.sender.is_closed());

        while !q.ready.is_empty() {
            let Some(index) = q.consumers.iter().position(|c| {
                c.no_ack
                    || channels
                        .get(&c.channel)
                        .is_some_and(|ch| ch.has_capacity(&c.tag))
            }) else {
                return;
            };
            let Some(channel) = channels.get_mut(&q.consumers[index].channel) else {
                return;
            };
            let Some(message) = q.ready.pop_front() else {
                return;
            };

            let consumer = q.consumers.remove(index);
            let tag = channel.next_delivery_tag();
            let raw = message.to_raw(tag);
            if !consumer.no_ack {
                channel.unacked.insert(
                    tag,
                    Unacked {
                        queue: queue.to_owned(),
                        message,
                        consumer: Some(consumer.tag.clone()),
                    },
                );
            }
            let _ = consumer.sender.send(raw);
            q.consumers.push(consumer);
        }
    }

    fn close_channel(&mut self, id: u64, reason: &str) {
        let Some(slot) = self.channels.remove(&id) else {
            return;
        };

        let mut touched = vec![];
        for (_, unacked) in slot.unacked.into_iter().rev() {
            if let Some(q) = self.queues.get_mut(&unacked.queue) {
                let mut message = unacked.message;
                message.redelivered = true;
                q.ready.push_front(message);
                touched.push(unacked.queue);
            }
        }
        for (name, q) in self.queues.iter_mut() {
            let before = q.consumers.len();
            q.consumers.retain(|c| c.channel != id);
            if before != q.consumers.len() {
                touched.push(name.clone());
            }
        }

        slot.state
            .send_replace(LinkState::Closed(reason.to_owned()));

        touched.sort();
        touched.dedup();
        for queue in touched {
            self.pump(&queue);
        }
    }

    fn close_connection(&mut self, id: u64, reason: &str) {
        let channels = self
            .channels
            .iter()
            .filter(|(_, slot)| slot.connection == id)
            .map(|(channel, _)| *channel)
            .collect::<Vec<_>>();
        for channel in channels {
            self.close_channel(channel, reason);
        }

        let owned = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(id))
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();
        for name in owned {
            self.queues.remove(&name);
            for bound in self.exchanges.values_mut() {
                bound.retain(|q| q != &name);
            }
        }

        if let Some(state) = self.connections.remove(&id) {
            state.send_replace(LinkState::Closed(reason.to_owned()));
        }
    }
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    available: AtomicBool,
    refuse_channels: AtomicBool,
    settle_delay_ms: AtomicU64,
    connect_attempts: AtomicUsize,
    ids: AtomicU64,
}

/// In-process broker. Clones share the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        MemoryBroker::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        MemoryBroker {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                available: AtomicBool::new(true),
                refuse_channels: AtomicBool::new(false),
                settle_delay_ms: AtomicU64::new(0),
                connect_attempts: AtomicUsize::new(0),
                ids: AtomicU64::new(0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(&self) -> u64 {
        self.inner.ids.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Makes subsequent connection attempts succeed or fail.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Makes subsequent channel creations fail while connections stay up.
    pub fn refuse_channels(&self, refuse: bool) {
        self.inner.refuse_channels.store(refuse, Ordering::SeqCst);
    }

    /// Makes every ack and nack wait `delay` before reaching the broker.
    pub fn delay_settlements(&self, delay: Duration) {
        self.inner
            .settle_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn settle_delay(&self) {
        let delay = self.inner.settle_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    /// Number of connection attempts seen so far, failed ones included.
    pub fn connect_attempts(&self) -> usize {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Drops every open connection, as a broker restart or network loss would.
    pub fn sever_connections(&self) {
        let mut state = self.lock();
        let ids = state.connections.keys().copied().collect::<Vec<_>>();
        for id in ids {
            state.close_connection(id, "connection severed");
        }
    }

    /// Closes every open channel while keeping the connections up.
    pub fn close_channels(&self) {
        let mut state = self.lock();
        let ids = state.channels.keys().copied().collect::<Vec<_>>();
        for id in ids {
            state.close_channel(id, "channel closed by broker");
        }
    }

    /// Puts a message straight into a queue, creating the queue if needed.
    pub fn enqueue(&self, queue: &str, payload: &[u8], message_id: Option<&str>) {
        let mut state = self.lock();
        state
            .queues
            .entry(queue.to_owned())
            .or_default()
            .ready
            .push_back(Stored {
                payload: payload.to_vec(),
                message_id: message_id.map(str::to_owned),
                headers: BTreeMap::default(),
                redelivered: false,
            });
        state.pump(queue);
    }

    /// Ready messages of a queue, `None` when the queue does not exist.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|q| q.ready.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or_default()
    }

    /// Deliveries waiting for an ack or nack, across all channels.
    pub fn unacked_count(&self) -> usize {
        self.lock().channels.values().map(|c| c.unacked.len()).sum()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn open_channels(&self) -> usize {
        self.lock().channels.len()
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.inner.available.load(Ordering::SeqCst) {
            debug!(url, "memory broker unavailable");
            return Err(AmqpError::ConnectionError);
        }

        let id = self.next_id();
        let (state, _) = watch::channel(LinkState::Open);
        let state = Arc::new(state);
        self.lock().connections.insert(id, state.clone());

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
            state,
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    state: Arc<watch::Sender<LinkState>>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if self.broker.inner.refuse_channels.load(Ordering::SeqCst) {
            debug!("memory broker refused a channel");
            return Err(AmqpError::ChannelError);
        }
        let mut state = self.broker.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(AmqpError::ChannelError);
        }

        let id = self.broker.next_id();
        let (link, _) = watch::channel(LinkState::Open);
        let link = Arc::new(link);
        state.channels.insert(
            id,
            ChannelSlot {
                connection: self.id,
                state: link.clone(),
                next_tag: 0,
                prefetch: 0,
                unacked: BTreeMap::default(),
            },
        );

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
            connection: self.id,
            state: link,
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker
            .lock()
            .close_connection(self.id, "closed by client");
        Ok(())
    }

    fn link_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    connection: u64,
    state: Arc<watch::Sender<LinkState>>,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueInfo, AmqpError> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;

        if def.passive {
            return match state.queues.get(&def.name) {
                Some(q) => Ok(QueueInfo {
                    queue: def.name.clone(),
                    message_count: q.ready.len() as u32,
                    consumer_count: q.consumers.len() as u32,
                }),
                None => Err(AmqpError::DeclareQueueError(def.name.clone())),
            };
        }

        let name = if def.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            def.name.clone()
        };
        let queue = state.queues.entry(name.clone()).or_default();
        if def.exclusive {
            queue.owner = Some(self.connection);
        }

        Ok(QueueInfo {
            queue: name,
            message_count: queue.ready.len() as u32,
            consumer_count: queue.consumers.len() as u32,
        })
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        state.exchanges.entry(def.name.clone()).or_default();
        Ok(())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;

        if !state.queues.contains_key(&binding.queue_name) {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }
        let Some(bound) = state.exchanges.get_mut(&binding.exchange_name) else {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        };
        if !bound.contains(&binding.queue_name) {
            bound.push(binding.queue_name.clone());
        }
        Ok(())
    }

    async fn prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.broker.lock().open_channel(self.id)?.prefetch = count;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;

        let targets = if exchange.is_empty() {
            vec![routing_key.to_owned()]
        } else {
            state
                .exchanges
                .get(exchange)
                .cloned()
                .ok_or(AmqpError::PublishingError)?
        };

        let message = Stored {
            payload: envelope.payload,
            message_id: Some(envelope.message_id),
            headers: envelope.headers,
            redelivered: false,
        };
        for target in targets {
            // unroutable messages are dropped, as on a real broker
            if let Some(q) = state.queues.get_mut(&target) {
                q.ready.push_back(message.clone());
                state.pump(&target);
            }
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
        handler: DeliveryHandler,
    ) -> Result<(), AmqpError> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<RawMessage>();
        {
            let mut state = self.broker.lock();
            state.open_channel(self.id)?;
            let Some(q) = state.queues.get_mut(queue) else {
                return Err(AmqpError::BindingConsumerError(queue.to_owned()));
            };
            q.consumers.push(MemoryConsumer {
                tag: consumer_tag.to_owned(),
                channel: self.id,
                no_ack,
                sender,
            });
        }

        let link = self.state.subscribe();
        tokio::spawn(async move {
            while let Some(raw) = receiver.recv().await {
                // deliveries of a dead channel were requeued by the broker
                let closed = link.borrow().is_closed();
                if closed {
                    break;
                }
                handler(raw).await;
            }
        });

        self.broker.lock().pump(queue);
        Ok(())
    }

    async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<RawMessage>, AmqpError> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;

        let Some(message) = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| AmqpError::GetMessageError(queue.to_owned()))?
            .ready
            .pop_front()
        else {
            return Ok(None);
        };

        let channel = state.open_channel(self.id)?;
        let tag = channel.next_delivery_tag();
        let raw = message.to_raw(tag);
        if !no_ack {
            channel.unacked.insert(
                tag,
                Unacked {
                    queue: queue.to_owned(),
                    message,
                    consumer: None,
                },
            );
        }
        Ok(Some(raw))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.broker.settle_delay().await;
        let mut state = self.broker.lock();
        let unacked = state
            .open_channel(self.id)
            .map_err(|_| AmqpError::AckMessageError)?
            .unacked
            .remove(&delivery_tag)
            .ok_or(AmqpError::AckMessageError)?;
        state.pump(&unacked.queue);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.broker.settle_delay().await;
        let mut state = self.broker.lock();
        let unacked = state
            .open_channel(self.id)
            .map_err(|_| AmqpError::NackMessageError)?
            .unacked
            .remove(&delivery_tag)
            .ok_or(AmqpError::NackMessageError)?;

        if requeue {
            if let Some(q) = state.queues.get_mut(&unacked.queue) {
                let mut message = unacked.message;
                message.redelivered = true;
                q.ready.push_front(message);
            }
        }
        state.pump(&unacked.queue);
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;

        for q in state.queues.values_mut() {
            if let Some(index) = q
                .consumers
                .iter()
                .position(|c| c.tag == consumer_tag && c.channel == self.id)
            {
                q.consumers.remove(index);
                return Ok(());
            }
        }
        Err(AmqpError::CancelConsumerError(consumer_tag.to_owned()))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.lock().close_channel(self.id, "closed by client");
        Ok(())
    }

    fn link_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }
}
