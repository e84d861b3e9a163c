// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Provider
//!
//! [`Provider`] is the public face of the crate. It exposes the messaging
//! verbs over one broker connection:
//!
//! - `produce`/`consume`: competing consumers on a durable queue
//! - `publish`/`subscribe`: broadcast through a fanout exchange, every
//!   subscriber gets its own server-named queue
//! - `get`: single-shot pull
//! - `ack`/`nack`: settle deliveries consumed in manual ack mode, by id
//! - `info`, `cancel`, `health_check`
//!
//! Each verb validates its parameters before touching the broker and resolves
//! to an [`Outcome`] carrying the result and the validated parameters.
//!
//! The provider survives broker outages: the connection and channel managers
//! retry on their own, and once the connection or a lost channel is restored
//! every registered consumer is replayed with the parameters and callback it
//! was registered with.
//!
//! ```no_run
//! use rabbitmq_provider::{
//!     config::Config,
//!     provider::{callback, Provider, QueueMessage, Subscription},
//! };
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), rabbitmq_provider::errors::AmqpError> {
//! let provider = Provider::amqp(Config::default());
//!
//! provider
//!     .consume(
//!         Subscription::new("orders"),
//!         callback(|message| async move {
//!             println!("{}", message.json);
//!             Ok(())
//!         }),
//!     )
//!     .await?;
//! provider
//!     .produce(QueueMessage::new("orders").json(json!({"sku": "A-1"})))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    amqp::AmqpTransport,
    channel::{ChannelEvent, ChannelManager, ChannelState},
    config::Config,
    connection::{ConnectionManager, ConnectionState, LifecycleEvent},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    executor::OperationExecutor,
    otel,
    processor::{AckMode, Message, MessageProcessor, ID_FIELD},
    queue::{QueueBinding, QueueDefinition, QueueInfo},
    registry::{ConsumerRegistry, Operation, Registration},
    tracker::{spawn_housekeeping, MessageTracker},
    transport::{
        BrokerChannel, DeliveryHandle, DeliveryHandler, Envelope, RawMessage, Transport,
    },
    validation::{Field, Kind, Params, Pattern},
};
use async_trait::async_trait;
use futures_util::{future::BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    collections::BTreeMap,
    error::Error,
    future::Future,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    runtime::Handle,
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
    time::{sleep, Instant},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use crate::executor::Outcome;

/// Name shown for the provider's connections in the broker management UI.
pub const CONNECTION_NAME: &str = "rabbitmq-provider";

/// Unacknowledged deliveries a consumer may hold at once.
const CONSUMER_PREFETCH: u16 = 1;

pub type BoxError = Box<dyn Error + Send + Sync>;

/// Consumer callback. An `Err` is logged and leaves the delivery unsettled.
pub type Callback = Arc<dyn Fn(Message) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Wraps an async closure into a [`Callback`].
pub fn callback<F, Fut>(f: F) -> Callback
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move |message| f(message).boxed())
}

/// Parameters of `produce` and `publish`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Queue for `produce`, fanout exchange for `publish`
    pub queue: String,
    pub json: Value,
}

impl QueueMessage {
    pub fn new(queue: &str) -> Self {
        QueueMessage {
            queue: queue.to_owned(),
            json: Value::Null,
        }
    }

    pub fn json(mut self, json: Value) -> Self {
        self.json = json;
        self
    }
}

impl Params for QueueMessage {
    fn pattern() -> Pattern {
        Pattern::new()
            .field(Field::required("queue", Kind::String))
            .field(Field::required("json", Kind::Object))
    }
}

/// Parameters of `consume` and `subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Queue for `consume`, fanout exchange for `subscribe`
    pub queue: String,
    #[serde(default)]
    pub ack: AckMode,
}

impl Subscription {
    pub fn new(queue: &str) -> Self {
        Subscription {
            queue: queue.to_owned(),
            ack: AckMode::default(),
        }
    }

    pub fn ack(mut self, mode: AckMode) -> Self {
        self.ack = mode;
        self
    }
}

impl Params for Subscription {
    fn pattern() -> Pattern {
        Pattern::new()
            .field(Field::required("queue", Kind::String))
            .field(Field::optional("ack", Kind::String).default_to(json!("auto")))
    }
}

/// Parameters of `get`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pull {
    pub queue: String,
    #[serde(default)]
    pub ack: AckMode,
}

impl Pull {
    pub fn new(queue: &str) -> Self {
        Pull {
            queue: queue.to_owned(),
            ack: AckMode::default(),
        }
    }

    pub fn ack(mut self, mode: AckMode) -> Self {
        self.ack = mode;
        self
    }
}

impl Params for Pull {
    fn pattern() -> Pattern {
        Pattern::new()
            .field(Field::required("queue", Kind::String))
            .field(Field::optional("ack", Kind::String).default_to(json!("auto")))
    }
}

/// Result of `get`: the decoded message, `None` when the queue was empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pulled {
    pub json: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckParams {
    pub id: String,
}

impl AckParams {
    pub fn new(id: &str) -> Self {
        AckParams { id: id.to_owned() }
    }
}

impl Params for AckParams {
    fn pattern() -> Pattern {
        Pattern::new().field(Field::required("id", Kind::String))
    }
}

fn requeue_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NackParams {
    pub id: String,
    #[serde(default = "requeue_by_default")]
    pub requeue: bool,
}

impl NackParams {
    pub fn new(id: &str) -> Self {
        NackParams {
            id: id.to_owned(),
            requeue: requeue_by_default(),
        }
    }

    pub fn requeue(mut self, requeue: bool) -> Self {
        self.requeue = requeue;
        self
    }
}

impl Params for NackParams {
    fn pattern() -> Pattern {
        Pattern::new()
            .field(Field::required("id", Kind::String))
            .field(Field::optional("requeue", Kind::Bool).default_to(json!(true)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueName {
    pub queue: String,
}

impl QueueName {
    pub fn new(queue: &str) -> Self {
        QueueName {
            queue: queue.to_owned(),
        }
    }
}

impl Params for QueueName {
    fn pattern() -> Pattern {
        Pattern::new().field(Field::required("queue", Kind::String))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelParams {
    pub consumer_tag: String,
}

impl CancelParams {
    pub fn new(consumer_tag: &str) -> Self {
        CancelParams {
            consumer_tag: consumer_tag.to_owned(),
        }
    }
}

impl Params for CancelParams {
    fn pattern() -> Pattern {
        Pattern::new().field(Field::required("consumerTag", Kind::String))
    }
}

/// Takes over messages `produce` or `publish` could not hand to the broker,
/// e.g. to persist them for a later retry.
#[async_trait]
pub trait Recovery: Send + Sync {
    async fn recover(&self, verb: &'static str, message: &QueueMessage) -> Result<(), BoxError>;
}

struct Shared {
    config: Config,
    connection: Arc<ConnectionManager>,
    channel: Arc<ChannelManager>,
    tracker: Arc<MessageTracker>,
    registry: ConsumerRegistry,
    processor: MessageProcessor,
    executor: OperationExecutor,
    recovery: Option<Arc<dyn Recovery>>,
}

/// A messaging provider bound to one broker.
///
/// Must be created inside a Tokio runtime: construction spawns the
/// housekeeping and supervisor tasks. Nothing connects until the first verb.
pub struct Provider {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl Provider {
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Provider {
        Self::build(config, transport, None)
    }

    /// Like [`Provider::new`], handing failed `produce`/`publish` messages to `recovery`.
    pub fn with_recovery(
        config: Config,
        transport: Arc<dyn Transport>,
        recovery: Arc<dyn Recovery>,
    ) -> Provider {
        Self::build(config, transport, Some(recovery))
    }

    /// A provider talking AMQP 0.9.1 to `config.url`.
    pub fn amqp(config: Config) -> Provider {
        Self::new(config, AmqpTransport::new(CONNECTION_NAME))
    }

    fn build(
        config: Config,
        transport: Arc<dyn Transport>,
        recovery: Option<Arc<dyn Recovery>>,
    ) -> Provider {
        let connection = ConnectionManager::new(&config.url, config.reconnect_after, transport);
        let channel = ChannelManager::new(connection.clone(), config.re_channel_after);
        let tracker = Arc::new(MessageTracker::new());

        let shared = Arc::new(Shared {
            processor: MessageProcessor::new(tracker.clone()),
            executor: OperationExecutor::new(connection.clone(), channel.clone()),
            registry: ConsumerRegistry::new(),
            connection,
            channel,
            tracker,
            recovery,
            config,
        });

        let housekeeping = spawn_housekeeping(
            shared.tracker.clone(),
            shared.config.clear_interval,
            shared.config.clear_offset,
        );
        let supervisor = spawn_supervisor(
            Arc::downgrade(&shared),
            shared.connection.subscribe(),
            shared.channel.subscribe(),
            shared.config.re_channel_after,
        );

        Provider {
            shared,
            tasks: vec![housekeeping, supervisor],
        }
    }

    #[cfg(test)]
    pub(crate) fn tracker(&self) -> &MessageTracker {
        &self.shared.tracker
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &ConsumerRegistry {
        &self.shared.registry
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Whether a broker connection currently exists. Never performs I/O.
    pub fn health_check(&self) -> bool {
        self.shared.connection.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.connection.state()
    }

    pub fn channel_state(&self) -> ChannelState {
        self.shared.channel.state()
    }

    /// Connection lifecycle notifications.
    pub fn lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.shared.connection.subscribe()
    }

    /// Sends a persistent message to a durable queue, declaring it first.
    ///
    /// # Returns
    /// The queue metadata reported by the declaration.
    pub async fn produce(
        &self,
        params: QueueMessage,
    ) -> Result<Outcome<QueueMessage, QueueInfo>, AmqpError> {
        let outcome = self
            .shared
            .executor
            .exec("produce", params.clone(), |channel, params| async move {
                let info = channel
                    .declare_queue(&QueueDefinition::new(&params.queue).durable())
                    .await?;
                channel
                    .publish("", &params.queue, envelope(&params.json)?)
                    .await?;
                Ok(info)
            })
            .await;

        self.shared.recover("produce", &params, outcome).await
    }

    /// Broadcasts a persistent message through a durable fanout exchange
    /// named `params.queue`.
    pub async fn publish(
        &self,
        params: QueueMessage,
    ) -> Result<Outcome<QueueMessage, ()>, AmqpError> {
        let outcome = self
            .shared
            .executor
            .exec("publish", params.clone(), |channel, params| async move {
                channel
                    .declare_exchange(&ExchangeDefinition::new(&params.queue).durable())
                    .await?;
                channel
                    .publish(&params.queue, "", envelope(&params.json)?)
                    .await
            })
            .await;

        self.shared.recover("publish", &params, outcome).await
    }

    /// Registers a competing consumer on a durable queue.
    ///
    /// Deliveries are handed to `cb` one at a time. With
    /// `AckMode::ResolveOnCallback` a delivery is acked once `cb` returns
    /// `Ok`; with `AckMode::Manual` it waits for [`Provider::ack`] or
    /// [`Provider::nack`]. A failing callback is logged and its delivery left
    /// unsettled.
    ///
    /// # Returns
    /// The consumer tag, needed by [`Provider::cancel`].
    pub async fn consume(
        &self,
        params: Subscription,
        cb: Callback,
    ) -> Result<Outcome<Subscription, String>, AmqpError> {
        self.shared.register(Operation::Consume, params, cb).await
    }

    /// Subscribes to the fanout exchange named `params.queue` through an
    /// exclusive server-named queue. Acknowledgment works as for `consume`.
    pub async fn subscribe(
        &self,
        params: Subscription,
        cb: Callback,
    ) -> Result<Outcome<Subscription, String>, AmqpError> {
        self.shared.register(Operation::Subscribe, params, cb).await
    }

    /// Pulls a single message without waiting, declaring the queue first.
    ///
    /// Manual ack mode tracks the message for [`Provider::ack`];
    /// `AckMode::ResolveOnCallback` acks it right away. Malformed and
    /// duplicate messages are dropped and reported as an empty pull.
    pub async fn get(&self, params: Pull) -> Result<Outcome<Pull, Pulled>, AmqpError> {
        let shared = &self.shared;
        shared
            .executor
            .exec("get", params, |channel, params| async move {
                channel
                    .declare_queue(&QueueDefinition::new(&params.queue).durable())
                    .await?;
                let Some(raw) = channel.get(&params.queue, params.ack.no_ack()).await? else {
                    return Ok(Pulled { json: None });
                };
                let Some(message) = shared
                    .processor
                    .process(&params.queue, raw, channel, params.ack)
                    .await
                else {
                    return Ok(Pulled { json: None });
                };

                if params.ack == AckMode::ResolveOnCallback {
                    if let Some(handle) = message.handle() {
                        handle.ack().await?;
                        shared.tracker.mark_acked(&message.id);
                    }
                }
                Ok(Pulled {
                    json: Some(message.json),
                })
            })
            .await
    }

    /// Acknowledges a tracked delivery.
    ///
    /// The entry is claimed before the broker is told, so of two concurrent
    /// settlements of the same id only one reaches the broker.
    ///
    /// # Returns
    /// `AmqpError::UnknownMessage` when `id` is not tracked: never delivered
    /// in manual mode, already settled, or swept by housekeeping.
    pub async fn ack(&self, params: AckParams) -> Result<Outcome<AckParams, ()>, AmqpError> {
        let tracker = &self.shared.tracker;
        self.shared
            .executor
            .exec("ack", params, |_, params| async move {
                let Some(tracked) = tracker.untrack(&params.id) else {
                    return Err(AmqpError::UnknownMessage(params.id));
                };
                if let Err(err) = tracked.handle.ack().await {
                    tracker.reinstate(tracked);
                    return Err(err);
                }
                tracker.mark_acked(&params.id);
                Ok(())
            })
            .await
    }

    /// Negatively acknowledges a tracked delivery, requeueing it unless
    /// `params.requeue` is false.
    pub async fn nack(&self, params: NackParams) -> Result<Outcome<NackParams, ()>, AmqpError> {
        let tracker = &self.shared.tracker;
        self.shared
            .executor
            .exec("nack", params, |_, params| async move {
                let Some(tracked) = tracker.untrack(&params.id) else {
                    return Err(AmqpError::UnknownMessage(params.id));
                };
                if let Err(err) = tracked.handle.nack(params.requeue).await {
                    tracker.reinstate(tracked);
                    return Err(err);
                }
                Ok(())
            })
            .await
    }

    /// Negatively acknowledges a delivery through its handle, tracked or not.
    pub async fn nack_delivery(
        &self,
        handle: &DeliveryHandle,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        handle.nack(requeue).await.map_err(|err| {
            error!(
                delivery_tag = handle.delivery_tag(),
                error = err.to_string(),
                "failure to nack delivery"
            );
            err
        })
    }

    /// Queries queue metadata without declaring anything.
    pub async fn info(&self, params: QueueName) -> Result<Outcome<QueueName, QueueInfo>, AmqpError> {
        self.shared
            .executor
            .exec("info", params, |channel, params| async move {
                channel
                    .declare_queue(&QueueDefinition::new(&params.queue).passive())
                    .await
                    .map_err(|_| AmqpError::QueueInfoError(params.queue.clone()))
            })
            .await
    }

    /// Stops future deliveries to a consumer.
    ///
    /// The registration is kept: a cancelled consumer is registered again
    /// the next time consumers are replayed after a loss.
    pub async fn cancel(
        &self,
        params: CancelParams,
    ) -> Result<Outcome<CancelParams, ()>, AmqpError> {
        self.shared
            .executor
            .exec("cancel", params, |channel, params| async move {
                channel.cancel(&params.consumer_tag).await
            })
            .await
    }

    /// Stops the background tasks and retry loops, then closes the channel
    /// and the connection.
    pub async fn close(&self) -> Result<(), AmqpError> {
        for task in &self.tasks {
            task.abort();
        }

        let channel = self.shared.channel.close().await;
        let connection = self.shared.connection.close().await;
        debug!("provider closed");
        channel.and(connection)
    }
}

impl Drop for Provider {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        let channel = self.shared.channel.shutdown();
        let connection = self.shared.connection.shutdown();

        // without a runtime the links close when the broker drops them
        if let Ok(runtime) = Handle::try_current() {
            runtime.spawn(async move {
                if let Some(channel) = channel {
                    let _ = channel.close().await;
                }
                if let Some(connection) = connection {
                    let _ = connection.close().await;
                }
                debug!("provider dropped, links closed");
            });
        }
    }
}

impl Shared {
    async fn register(
        &self,
        operation: Operation,
        params: Subscription,
        cb: Callback,
    ) -> Result<Outcome<Subscription, String>, AmqpError> {
        let verb = match operation {
            Operation::Consume => "consume",
            Operation::Subscribe => "subscribe",
        };

        let outcome = self
            .executor
            .exec(verb, params, |channel, params| {
                let handler_callback = cb.clone();
                async move {
                    let source = match operation {
                        Operation::Consume => {
                            channel
                                .declare_queue(&QueueDefinition::new(&params.queue).durable())
                                .await?
                                .queue
                        }
                        Operation::Subscribe => {
                            channel
                                .declare_exchange(
                                    &ExchangeDefinition::new(&params.queue).durable(),
                                )
                                .await?;
                            let own = channel
                                .declare_queue(&QueueDefinition::new("").exclusive().delete())
                                .await?;
                            channel
                                .bind_queue(&QueueBinding::new(&own.queue).exchange(&params.queue))
                                .await?;
                            own.queue
                        }
                    };

                    channel.prefetch(CONSUMER_PREFETCH).await?;

                    let consumer_tag = Uuid::new_v4().to_string();
                    let handler = delivery_handler(
                        self.processor.clone(),
                        self.tracker.clone(),
                        params.queue.clone(),
                        params.ack,
                        channel.clone(),
                        handler_callback,
                    );
                    channel
                        .consume(&source, &consumer_tag, params.ack.no_ack(), handler)
                        .await?;

                    debug!(verb, queue = params.queue, consumer_tag, "consumer registered");
                    Ok((consumer_tag, Arc::downgrade(&channel)))
                }
            })
            .await?;

        let (consumer_tag, channel) = outcome.result;
        self.registry.register(
            &consumer_tag,
            Registration {
                operation,
                params: outcome.params.clone(),
                callback: cb,
                channel,
            },
        );
        Ok(Outcome {
            result: consumer_tag,
            params: outcome.params,
        })
    }

    /// Replays every registered consumer that is not live on the current
    /// channel, on a fresh channel for [`Restore::Channel`]. A registration
    /// is dropped only once its replay succeeded.
    ///
    /// # Returns
    /// What is left to restore when a step failed.
    async fn restore(&self, restore: Restore) -> Option<Restore> {
        let current = match self
            .channel
            .channel(matches!(restore, Restore::Channel))
            .await
        {
            Ok(current) => current,
            Err(err) => {
                warn!(error = err.to_string(), "failure to get a channel to replay consumers on");
                return Some(restore);
            }
        };

        let mut pending = None;
        for (consumer_tag, registration) in self.registry.snapshot() {
            if registration.is_live_on(&current) {
                continue;
            }
            match self
                .register(
                    registration.operation,
                    registration.params.clone(),
                    registration.callback.clone(),
                )
                .await
            {
                Ok(outcome) => {
                    self.registry.remove(&consumer_tag);
                    info!(
                        queue = registration.params.queue,
                        previous = consumer_tag,
                        consumer_tag = outcome.result,
                        "consumer replayed"
                    );
                }
                Err(err) => {
                    warn!(
                        queue = registration.params.queue,
                        consumer_tag,
                        error = err.to_string(),
                        "failure to replay consumer"
                    );
                    pending = Some(Restore::Consumers);
                }
            }
        }
        pending
    }

    async fn recover<R>(
        &self,
        verb: &'static str,
        message: &QueueMessage,
        outcome: Result<Outcome<QueueMessage, R>, AmqpError>,
    ) -> Result<Outcome<QueueMessage, R>, AmqpError> {
        let err = match outcome {
            Ok(outcome) => return Ok(outcome),
            Err(err @ AmqpError::Validation(_)) => return Err(err),
            Err(err) => err,
        };
        let Some(recovery) = &self.recovery else {
            return Err(err);
        };

        match recovery.recover(verb, message).await {
            Ok(()) => {
                warn!(verb, queue = message.queue, "message handed over to recovery");
                Err(err)
            }
            Err(recovery_err) => {
                error!(
                    verb,
                    queue = message.queue,
                    error = recovery_err.to_string(),
                    "failure to recover message"
                );
                Err(AmqpError::Recovery(vec![
                    err.to_string(),
                    recovery_err.to_string(),
                ]))
            }
        }
    }
}

/// What the supervisor rebuilds after a loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Restore {
    /// New connection: force a fresh channel, then replay every consumer
    Channel,
    /// Replay every consumer not live on the current channel
    Consumers,
}

/// Rebuilds consumers after a loss. A restore that did not complete is
/// retried every `retry_after` until it does, or until the connection drops
/// and a reconnection starts over.
fn spawn_supervisor(
    shared: Weak<Shared>,
    mut connection_events: broadcast::Receiver<LifecycleEvent>,
    mut channel_events: broadcast::Receiver<ChannelEvent>,
    retry_after: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let retry = sleep(retry_after);
        tokio::pin!(retry);
        let mut pending: Option<Restore> = None;

        loop {
            let restore = tokio::select! {
                event = connection_events.recv() => match event {
                    Ok(LifecycleEvent::Reconnected) => Restore::Channel,
                    Ok(LifecycleEvent::Disconnected(_)) => {
                        pending = None;
                        continue;
                    }
                    Ok(LifecycleEvent::Connected) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "connection events lagged");
                        Restore::Channel
                    }
                    Err(RecvError::Closed) => break,
                },
                event = channel_events.recv() => match event {
                    Ok(ChannelEvent::Recreated) => Restore::Consumers,
                    Ok(ChannelEvent::Closed(_)) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "channel events lagged");
                        Restore::Channel
                    }
                    Err(RecvError::Closed) => break,
                },
                () = &mut retry, if pending.is_some() => Restore::Consumers,
            };
            let restore = match pending.take() {
                Some(Restore::Channel) => Restore::Channel,
                _ => restore,
            };

            let Some(shared) = shared.upgrade() else {
                break;
            };
            if !shared.connection.is_connected() {
                continue;
            }
            pending = shared.restore(restore).await;
            if let Some(left) = pending {
                debug!(?left, retry_ms = retry_after.as_millis() as u64, "consumer replay incomplete");
                retry.as_mut().reset(Instant::now() + retry_after);
            }
        }
    })
}

fn delivery_handler(
    processor: MessageProcessor,
    tracker: Arc<MessageTracker>,
    source: String,
    mode: AckMode,
    channel: Arc<dyn BrokerChannel>,
    callback: Callback,
) -> DeliveryHandler {
    Arc::new(move |raw: RawMessage| {
        let processor = processor.clone();
        let tracker = tracker.clone();
        let source = source.clone();
        let channel = channel.clone();
        let callback = callback.clone();

        async move {
            let Some(message) = processor.process(&source, raw, channel, mode).await else {
                return;
            };
            let id = message.id.clone();
            let handle = message.handle().cloned();

            if let Err(err) = callback(message).await {
                warn!(
                    source,
                    id,
                    error = err.to_string(),
                    "consumer callback failed, message left unacknowledged"
                );
                return;
            }

            if mode == AckMode::ResolveOnCallback {
                if let Some(handle) = handle {
                    match handle.ack().await {
                        Ok(()) => tracker.mark_acked(&id),
                        Err(err) => error!(source, id, error = err.to_string(), "failure to ack"),
                    }
                }
            }
        }
        .boxed()
    })
}

/// Encodes a payload, its `id` doubling as the AMQP `message_id`.
fn envelope(json: &Value) -> Result<Envelope, AmqpError> {
    let payload = serde_json::to_vec(json).map_err(|err| {
        error!(error = err.to_string(), "failure to encode payload");
        AmqpError::PublishingError
    })?;

    let message_id = match json.get(ID_FIELD) {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => Uuid::new_v4().to_string(),
    };

    let mut headers = BTreeMap::new();
    otel::inject_current(&mut headers);

    Ok(Envelope {
        payload,
        message_id,
        headers,
        persistent: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ValidationError;
    use crate::validation::check;

    #[test]
    fn omitted_options_take_their_defaults() {
        let sub: Subscription = serde_json::from_value(json!({"queue": "q1"})).unwrap();
        assert_eq!(sub.ack, AckMode::Auto);

        let nack: NackParams = serde_json::from_value(json!({"id": "m-1"})).unwrap();
        assert!(nack.requeue);

        let cancel: CancelParams =
            serde_json::from_value(json!({"consumerTag": "ctag-1"})).unwrap();
        assert_eq!(cancel.consumer_tag, "ctag-1");
    }

    #[test]
    fn payload_must_be_an_object() {
        let err = check(QueueMessage::new("q1").json(json!([1, 2]))).unwrap_err();
        assert_eq!(
            err,
            ValidationError::TypeMismatch {
                field: "json".to_owned(),
                expected: "object".to_owned()
            }
        );
    }

    #[test]
    fn envelope_reuses_the_payload_id() {
        let with_id = envelope(&json!({"id": "m-1", "x": 1})).unwrap();
        assert_eq!(with_id.message_id, "m-1");
        assert!(with_id.persistent);

        let without_id = envelope(&json!({"x": 1})).unwrap();
        assert!(Uuid::parse_str(&without_id.message_id).is_ok());
    }
}
