// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Topology
//!
//! The topology of a forecast consumer is fixed: one fan-out exchange shared by
//! every running instance and one exclusive queue per instance, bound to the
//! exchange without a routing key. `TopologyDescriptor` carries the few values
//! that vary between deployments and is immutable once a consumer is built.

use lapin::options::{ExchangeDeclareOptions, QueueDeclareOptions};
use uuid::Uuid;

/// Exchange kinds this crate knows how to declare.
///
/// The consumer only ever declares `Fanout`; `Direct` is the kind of the
/// default exchange the replies are published to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Fanout,
    Direct,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        }
    }
}

/// Immutable description of where a consumer attaches itself on the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyDescriptor {
    broker_address: String,
    exchange_name: String,
    queue_name: String,
    prefetch_count: u16,
}

impl TopologyDescriptor {
    /// Creates a descriptor with an unlimited prefetch count.
    ///
    /// # Parameters
    /// * `broker_address` - AMQP URI of the broker
    /// * `exchange_name` - Name of the fan-out exchange to bind to
    /// * `queue_name` - Name of the queue owned by this instance
    pub fn new(
        broker_address: impl Into<String>,
        exchange_name: impl Into<String>,
        queue_name: impl Into<String>,
    ) -> TopologyDescriptor {
        TopologyDescriptor {
            broker_address: broker_address.into(),
            exchange_name: exchange_name.into(),
            queue_name: queue_name.into(),
            prefetch_count: 0,
        }
    }

    /// Sets the QoS prefetch count. Zero means unlimited.
    pub fn with_prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn broker_address(&self) -> &str {
        &self.broker_address
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn prefetch_count(&self) -> u16 {
        self.prefetch_count
    }

    /// Kind of the exchange the consumer binds to.
    pub fn exchange_kind(&self) -> ExchangeKind {
        ExchangeKind::Fanout
    }

    /// Declaration flags for the shared exchange: non-durable and kept
    /// after the last queue is unbound.
    pub(crate) fn exchange_options(&self) -> ExchangeDeclareOptions {
        ExchangeDeclareOptions {
            passive: false,
            durable: false,
            auto_delete: false,
            internal: false,
            nowait: false,
        }
    }

    /// Declaration flags for the per-instance queue: exclusive to the
    /// connection that declared it.
    pub(crate) fn queue_options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: false,
            durable: false,
            exclusive: true,
            auto_delete: false,
            nowait: false,
        }
    }
}

/// Builds the default queue name `<service-name>#<random hex>`, unique across
/// concurrently running instances of the same service.
pub fn default_queue_name(service_name: &str) -> String {
    format!("{}#{}", service_name, Uuid::new_v4().simple())
}
