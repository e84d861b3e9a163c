// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Declarations
//!
//! Exchanges route published messages to queues. The provider uses the default
//! exchange for queue semantics (`produce`/`consume`) and declares a fanout
//! exchange per topic for broadcast semantics (`publish`/`subscribe`): every
//! bound queue gets every message, regardless of routing keys.

/// Definition of a fanout exchange with its declaration flags.
///
/// This struct implements the builder pattern to create and configure exchange definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
}

impl ExchangeDefinition {
    /// Creates a new exchange definition with the given name.
    ///
    /// By default, the exchange is not durable.
    ///
    /// # Parameters
    /// * `name` - The name of the exchange
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
