// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels in the AMQP headers of requests and replies. The
//! transport flattens string-valued AMQP headers into a plain map, so the
//! propagator here works on that map rather than on lapin's field tables.

use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};

/// Injects into and extracts from a delivery's header map.
pub(crate) struct HeaderPropagator<'a> {
    headers: &'a mut BTreeMap<String, String>,
}

impl<'a> HeaderPropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

impl Extractor for HeaderPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Starts a consumer span for a delivery, parented to the context found in
/// its headers.
///
/// # Returns
/// The extracted context and the new span
pub(crate) fn new_span(
    headers: &BTreeMap<String, String>,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let mut headers = headers.clone();
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderPropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

/// Writes `ctx` into an outgoing header map.
pub(crate) fn inject_context(ctx: &Context, headers: &mut BTreeMap<String, String>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderPropagator::new(headers))
    });
}
