// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Processing
//!
//! Every delivery goes through the [`MessageProcessor`] before a consumer
//! callback sees it:
//! 1. Opens a consumer span from the trace context carried in the headers
//! 2. Decodes the JSON payload; malformed payloads are logged and dropped
//! 3. Resolves the message id (payload `id`, then the `message_id` property,
//!    then a fresh UUID) and writes it into the payload
//! 4. Drops deliveries whose id was already acknowledged, nacking them
//!    without requeue
//! 5. Tracks the delivery when its ack mode settles it manually

use crate::{
    errors::AmqpError,
    otel,
    tracker::MessageTracker,
    transport::{BrokerChannel, DeliveryHandle, RawMessage},
};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

/// Field of the payload holding the message id.
pub const ID_FIELD: &str = "id";

/// How deliveries of a consumer are acknowledged.
///
/// Parsed from `"auto"`, `"resolve"` or anything else (manual).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AckMode {
    /// The broker considers a delivery acknowledged as soon as it is sent.
    #[default]
    Auto,
    /// Acknowledged once the consumer callback completes successfully.
    ResolveOnCallback,
    /// Acknowledged by the caller through `ack`/`nack`.
    Manual,
}

impl AckMode {
    pub fn no_ack(&self) -> bool {
        matches!(self, AckMode::Auto)
    }

    pub fn save_for_ack(&self) -> bool {
        matches!(self, AckMode::Manual)
    }
}

impl From<String> for AckMode {
    fn from(value: String) -> Self {
        match value.as_str() {
            "auto" => AckMode::Auto,
            "resolve" => AckMode::ResolveOnCallback,
            _ => AckMode::Manual,
        }
    }
}

impl From<AckMode> for String {
    fn from(mode: AckMode) -> Self {
        match mode {
            AckMode::Auto => "auto",
            AckMode::ResolveOnCallback => "resolve",
            AckMode::Manual => "manual",
        }
        .to_owned()
    }
}

/// A decoded message handed to consumers.
#[derive(Debug, Clone)]
pub struct Message {
    /// Never empty
    pub id: String,
    /// The decoded payload, `id` field included
    pub json: Value,
    pub redelivered: bool,
    handle: Option<DeliveryHandle>,
}

impl Message {
    /// Handle to settle the delivery directly. `None` for auto-acked deliveries.
    pub fn handle(&self) -> Option<&DeliveryHandle> {
        self.handle.as_ref()
    }
}

#[derive(Clone)]
pub struct MessageProcessor {
    tracker: Arc<MessageTracker>,
}

impl MessageProcessor {
    pub fn new(tracker: Arc<MessageTracker>) -> Self {
        MessageProcessor { tracker }
    }

    /// Turns a delivery into a [`Message`], or `None` when it must not reach
    /// the consumer (malformed payload or duplicate).
    ///
    /// # Parameters
    /// * `source` - Queue or exchange the delivery came from, used as span name
    /// * `raw` - The delivery
    /// * `channel` - Channel that delivered it, where it gets settled
    /// * `mode` - Ack mode of the consumer
    pub async fn process(
        &self,
        source: &str,
        raw: RawMessage,
        channel: Arc<dyn BrokerChannel>,
        mode: AckMode,
    ) -> Option<Message> {
        let tracer = global::tracer("amqp consumer");
        let (_ctx, mut span) = otel::new_span(&raw.headers, &tracer, source);
        let handle = DeliveryHandle::new(raw.delivery_tag, channel);

        let mut fields = match decode(&raw.data) {
            Ok(fields) => fields,
            Err(err) => {
                error!(source, "removing message from queue - reason: malformed payload");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("failure to parse payload"),
                });
                if !mode.no_ack() {
                    if let Err(e) = handle.nack(false).await {
                        error!(error = e.to_string(), "error whiling nack msg");
                    }
                }
                span.end();
                return None;
            }
        };

        let id = resolve_id(&mut fields, raw.message_id.as_deref());

        if self.tracker.is_acked(&id) {
            debug!(id, "duplicate delivery of an acknowledged message, dropping");
            span.set_status(Status::Error {
                description: Cow::from("duplicate delivery"),
            });
            if !mode.no_ack() {
                if let Err(e) = handle.nack(false).await {
                    error!(error = e.to_string(), "error whiling nack duplicate msg");
                }
            }
            span.end();
            return None;
        }

        if mode.save_for_ack() {
            self.tracker.track(&id, handle.clone());
        }

        span.set_status(Status::Ok);
        span.end();

        Some(Message {
            id,
            json: Value::Object(fields),
            redelivered: raw.redelivered,
            handle: (!mode.no_ack()).then_some(handle),
        })
    }
}

fn decode(data: &[u8]) -> Result<Map<String, Value>, AmqpError> {
    match serde_json::from_slice::<Value>(data) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(_) => Err(AmqpError::ParsePayloadError),
        Err(err) => {
            error!(error = err.to_string(), "failure to parse payload");
            Err(AmqpError::ParsePayloadError)
        }
    }
}

fn resolve_id(fields: &mut Map<String, Value>, message_id: Option<&str>) -> String {
    match fields.get(ID_FIELD) {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => {
            let id = message_id
                .filter(|id| !id.is_empty())
                .map(str::to_owned)
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            fields.insert(ID_FIELD.to_owned(), Value::String(id.clone()));
            id
        }
    }
}
