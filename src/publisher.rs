// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reply Publisher
//!
//! Replies go to the default exchange with the caller's reply queue as the
//! routing key, carrying the request's correlation id and the trace context.

use crate::{errors::AmqpError, transport::Reply};
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel,
};
use std::collections::BTreeMap;
use tracing::{debug, error};
use uuid::Uuid;

/// Content type of every reply.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Name of the default exchange.
const DEFAULT_EXCHANGE: &str = "";

pub(crate) async fn publish_reply(channel: &Channel, reply: Reply) -> Result<(), AmqpError> {
    let properties = reply_properties(&reply);

    debug!(
        routing_key = reply.routing_key,
        correlation_id = reply.correlation_id.as_deref().unwrap_or_default(),
        "publishing reply"
    );

    match channel
        .basic_publish(
            DEFAULT_EXCHANGE,
            &reply.routing_key,
            BasicPublishOptions {
                immediate: false,
                mandatory: false,
            },
            &reply.body,
            properties,
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "error publishing message");
            Err(AmqpError::PublishingError(reply.routing_key))
        }
        _ => Ok(()),
    }
}

fn reply_properties(reply: &Reply) -> BasicProperties {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
    for (key, value) in &reply.headers {
        btree.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }

    let properties = BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_headers(FieldTable::from(btree));

    match &reply.correlation_id {
        Some(correlation_id) => {
            properties.with_correlation_id(ShortString::from(correlation_id.clone()))
        }
        None => properties,
    }
}
