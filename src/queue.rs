// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Declarations
//!
//! Builder types describing how a queue is declared and bound. The provider
//! declares durable queues for `produce`/`consume`/`get`, server-named
//! exclusive queues for `subscribe`, and passive declarations for `info`.

/// Definition of a queue with its declaration flags.
///
/// This struct implements the builder pattern. An empty name asks the broker
/// to generate one (used for the private queue of a fanout subscriber).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is non-durable, non-exclusive and not auto-deleted.
    ///
    /// # Parameters
    /// * `name` - The name of the queue
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when its last consumer goes away.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Only checks that the queue exists, without creating or changing it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// The exchange name starts empty and is set with
    /// [`QueueBinding::exchange`]. Bindings carry no routing key: the
    /// provider only binds to fanout exchanges.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            ..Default::default()
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }
}

/// Queue metadata reported by the broker on declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueInfo {
    pub queue: String,
    pub message_count: u32,
    pub consumer_count: u32,
}
