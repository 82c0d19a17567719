// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Propagation
//!
//! Carries trace context through AMQP message headers: the producer injects
//! the current context, the dispatcher extracts it and opens a consumer span
//! per delivery.

use lapin::{
    types::{AMQPValue, ShortString},
    BasicProperties,
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// Tracer name used for consumer spans
pub(crate) const CONSUMER_TRACER: &str = "amqp consumer";

/// Reads and writes trace context keys in AMQP headers.
///
/// Injected keys are lowercased; only long string values are extracted.
pub(crate) struct AmqpHeaderPropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> AmqpHeaderPropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for AmqpHeaderPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for AmqpHeaderPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Writes the trace context of `ctx` into `headers`.
///
/// # Parameters
/// * `ctx` - Context whose span is propagated
/// * `headers` - Outgoing message headers
pub(crate) fn inject(ctx: &Context, headers: &mut BTreeMap<ShortString, AMQPValue>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut AmqpHeaderPropagator::new(headers))
    });
}

/// Opens a consumer span named `name`, child of the context found in `props`.
///
/// # Parameters
/// * `props` - Properties of the delivered message
/// * `tracer` - Tracer used to start the span
/// * `name` - Span name, the consumer name
///
/// # Returns
/// The extracted parent context and the started span
pub(crate) fn new_span(
    props: &BasicProperties,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let mut headers = props.headers().clone().unwrap_or_default().inner().clone();
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&AmqpHeaderPropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
