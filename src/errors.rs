// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Messaging Provider
//!
//! This module provides the error types surfaced by every provider verb.
//! `AmqpError` covers broker-side failures (connection, channel, declarations,
//! publishing, acknowledgments) as well as caller-side failures such as
//! invalid parameters or acknowledging a message that is not tracked.

use thiserror::Error;

/// Represents errors that can occur while talking to the broker through the provider.
///
/// Broker-library errors are logged where they happen and converted into one of
/// these variants, so callers only ever match on this enum.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the broker
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel, or no live connection to create it on
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error pulling a single message from a queue
    #[error("failure to get message from `{0}`")]
    GetMessageError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// The id passed to ack/nack is not tracked (never delivered, already settled or swept)
    #[error("message `{0}` not found")]
    UnknownMessage(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error querying queue metadata
    #[error("failure to query queue `{0}`")]
    QueueInfoError(String),

    /// Parameters rejected before any broker call
    #[error("invalid parameters: {0}")]
    Validation(#[from] ValidationError),

    /// Accumulated errors from a failed operation and its recovery attempt
    #[error("failure to recover: {}", .0.join("; "))]
    Recovery(Vec<String>),

    /// The provider was closed
    #[error("provider closed")]
    Closed,
}

/// Errors raised by the parameter validator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(String),

    #[error("field `{field}` must be of type {expected}")]
    TypeMismatch { field: String, expected: String },

    #[error("parameters must be an object")]
    NotAnObject,
}
