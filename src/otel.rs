// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels with every message as plain string headers. Producers
//! inject the current context before publishing; the message processor
//! extracts it on delivery and opens a consumer span under it.

use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};

/// An adapter for injecting and extracting OpenTelemetry context from message headers.
pub(crate) struct HeaderPropagator<'a> {
    headers: &'a mut BTreeMap<String, String>,
}

impl<'a> HeaderPropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderPropagator<'_> {
    /// Sets a trace context key-value pair in the message headers.
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

impl Extractor for HeaderPropagator<'_> {
    /// Gets a trace context value from the message headers.
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Gets all keys in the message headers.
    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Injects the current trace context into outgoing headers.
pub(crate) fn inject_current(headers: &mut BTreeMap<String, String>) {
    let ctx = Context::current();
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&ctx, &mut HeaderPropagator::new(headers))
    });
}

/// Creates a new consumer span for a delivered message.
///
/// The trace context is extracted from the message headers, so the span is a
/// child of the producer's span when the producer propagated one.
///
/// # Parameters
/// * `headers` - Headers of the delivered message
/// * `tracer` - OpenTelemetry tracer
/// * `name` - Name for the new span (typically the queue or exchange)
pub(crate) fn new_span(
    headers: &BTreeMap<String, String>,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let mut headers = headers.clone();
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderPropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn propagator_lowercases_injected_keys() {
        let mut headers = BTreeMap::new();
        HeaderPropagator::new(&mut headers).set("TraceParent", "00-abc".to_owned());

        let propagator = HeaderPropagator::new(&mut headers);
        assert_eq!(propagator.get("traceparent"), Some("00-abc"));
        assert_eq!(propagator.keys(), vec!["traceparent"]);
    }
}
