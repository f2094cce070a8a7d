// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Seam
//!
//! The connection driver talks to the broker only through the traits in this
//! module, so the state machine and the dispatcher can be exercised without a
//! running broker. `LapinTransport` in the `channel` module is the production
//! implementation.

use crate::errors::AmqpError;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// A message handed to the consumer by the broker.
///
/// Lives for a single dispatch cycle and must be acknowledged or rejected
/// exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub payload: Vec<u8>,
}

/// A reply published to the default exchange, routed straight to the
/// caller's reply queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub routing_key: String,
    pub correlation_id: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

/// Asynchronous notifications raised by the broker while consuming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Delivery(InboundDelivery),
    /// The channel was closed by the broker.
    ChannelClosed(String),
    /// The broker cancelled the consumer registration.
    ConsumerCancelled,
    /// The underlying session is gone.
    ConnectionClosed(String),
}

/// Per-delivery operations the dispatcher needs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryChannel: Send {
    /// Acknowledges a delivery.
    async fn ack(&mut self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Rejects a delivery without requeueing it.
    async fn reject(&mut self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Publishes a reply to the default exchange.
    async fn publish_reply(&mut self, reply: Reply) -> Result<(), AmqpError>;
}

/// Every broker operation the connection state machine issues.
///
/// Each method resolves once the broker acknowledged the operation, which is
/// the signal the state machine waits for before issuing the next step.
#[async_trait]
pub trait BrokerTransport: DeliveryChannel {
    async fn connect(&mut self, address: &str, connection_name: &str) -> Result<(), AmqpError>;

    async fn open_channel(&mut self) -> Result<(), AmqpError>;

    async fn declare_exchange(&mut self, exchange: &str) -> Result<(), AmqpError>;

    async fn declare_queue(&mut self, queue: &str) -> Result<(), AmqpError>;

    async fn bind_queue(&mut self, queue: &str, exchange: &str) -> Result<(), AmqpError>;

    async fn set_qos(&mut self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn start_consuming(&mut self, queue: &str, consumer_tag: &str)
        -> Result<(), AmqpError>;

    /// Waits for the next broker notification. Only called while consuming.
    async fn next_event(&mut self) -> TransportEvent;

    async fn delete_queue(&mut self, queue: &str) -> Result<(), AmqpError>;

    async fn cancel_consumer(&mut self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn close_channel(&mut self) -> Result<(), AmqpError>;

    async fn close_connection(&mut self) -> Result<(), AmqpError>;
}

/// Produces a fresh transport for every connection attempt; connections are
/// never reused across restarts.
pub trait TransportFactory: Send + Sync {
    type Transport: BrokerTransport;

    fn create(&self) -> Self::Transport;
}

impl<T, F> TransportFactory for F
where
    T: BrokerTransport,
    F: Fn() -> T + Send + Sync,
{
    type Transport = T;

    fn create(&self) -> T {
        self()
    }
}
