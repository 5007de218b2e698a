// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels with every message as string headers: it is injected
//! when publishing and extracted when a delivery is received, so the span
//! covering a handler is a child of the span that published the message.

use crate::channel::Headers;
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context, KeyValue,
};
use std::borrow::Cow;

/// Name of the tracer used for consumer spans.
pub(crate) const CONSUMER_TRACER: &str = "amqp consumer";

/// An adapter for injecting and extracting OpenTelemetry context from message
/// headers.
pub(crate) struct HeadersPropagator<'a> {
    headers: &'a mut Headers,
}

impl<'a> HeadersPropagator<'a> {
    pub(crate) fn new(headers: &'a mut Headers) -> Self {
        Self { headers }
    }
}

impl Injector for HeadersPropagator<'_> {
    /// Sets a trace context key-value pair in the message headers.
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

impl Extractor for HeadersPropagator<'_> {
    /// Gets a trace context value from the message headers.
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Injects the current trace context into `headers`.
pub(crate) fn inject_current_context(headers: &mut Headers) {
    let ctx = Context::current();
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&ctx, &mut HeadersPropagator::new(headers))
    });
}

/// Creates a new consumer span for a delivery.
///
/// # Parameters
/// * `headers` - Headers of the delivery, carrying the publisher's context
/// * `tracer` - OpenTelemetry tracer
/// * `name` - Name for the new span (typically the queue name)
/// * `delivery_tag` - Recorded as a span attribute
///
/// # Returns
/// A tuple containing the extracted context and the new span
pub(crate) fn new_span(
    headers: &Headers,
    tracer: &BoxedTracer,
    name: &str,
    delivery_tag: u64,
) -> (Context, BoxedSpan) {
    let mut headers = headers.clone();
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeadersPropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .with_attributes(vec![KeyValue::new(
            "messaging.rabbitmq.delivery_tag",
            delivery_tag as i64,
        )])
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
