// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod amqp;
pub mod channel;
pub mod config;
pub mod connection;
pub mod errors;
pub mod exchange;
pub mod executor;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod processor;
pub mod provider;
pub mod queue;
pub mod registry;
pub mod tracker;
pub mod transport;
pub mod validation;

#[cfg(test)]
mod tests;
