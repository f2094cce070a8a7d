// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the driver and supervisor tests.

use crate::{
    errors::AmqpError,
    shutdown::ShutdownHandle,
    transport::{BrokerTransport, DeliveryChannel, Reply, TransportEvent},
};
use async_trait::async_trait;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

/// Records every broker call and plays back a fixed list of events.
///
/// Once the events are drained, `next_event` never resolves, which leaves the
/// connection consuming until a stop is requested.
#[derive(Debug, Default)]
pub(crate) struct ScriptedTransport {
    pub(crate) calls: Arc<Mutex<Vec<String>>>,
    pub(crate) replies: Arc<Mutex<Vec<Reply>>>,
    events: VecDeque<TransportEvent>,
    fail_on: Option<&'static str>,
    stop_on_event: Option<ShutdownHandle>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> ScriptedTransport {
        ScriptedTransport::default()
    }

    /// A broker that refuses the connection.
    pub(crate) fn unreachable() -> ScriptedTransport {
        ScriptedTransport::new().failing_on("connect")
    }

    /// Makes the named call fail.
    pub(crate) fn failing_on(mut self, call: &'static str) -> Self {
        self.fail_on = Some(call);
        self
    }

    pub(crate) fn with_events(mut self, events: impl IntoIterator<Item = TransportEvent>) -> Self {
        self.events.extend(events);
        self
    }

    /// Requests a stop right before handing out each scripted event, so the
    /// stop and the event reach the connection in the same turn.
    pub(crate) fn stopping_with_events(mut self, shutdown: ShutdownHandle) -> Self {
        self.stop_on_event = Some(shutdown);
        self
    }

    /// Shares the call log with the test.
    pub(crate) fn recording_into(mut self, calls: Arc<Mutex<Vec<String>>>) -> Self {
        self.calls = calls;
        self
    }

    pub(crate) fn calls(&self) -> Arc<Mutex<Vec<String>>> {
        self.calls.clone()
    }

    fn record(&mut self, call: &'static str, detail: String) -> Result<(), AmqpError> {
        let entry = if detail.is_empty() {
            call.to_owned()
        } else {
            format!("{call}:{detail}")
        };
        self.calls.lock().unwrap().push(entry);

        if self.fail_on == Some(call) {
            return Err(AmqpError::ConnectionError(format!("{call} refused")));
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryChannel for ScriptedTransport {
    async fn ack(&mut self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.record("ack", delivery_tag.to_string())
    }

    async fn reject(&mut self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.record("reject", delivery_tag.to_string())
    }

    async fn publish_reply(&mut self, reply: Reply) -> Result<(), AmqpError> {
        self.record("publish", reply.routing_key.clone())?;
        self.replies.lock().unwrap().push(reply);
        Ok(())
    }
}

#[async_trait]
impl BrokerTransport for ScriptedTransport {
    async fn connect(&mut self, address: &str, _connection_name: &str) -> Result<(), AmqpError> {
        self.record("connect", address.to_owned())
    }

    async fn open_channel(&mut self) -> Result<(), AmqpError> {
        self.record("open_channel", String::new())
    }

    async fn declare_exchange(&mut self, exchange: &str) -> Result<(), AmqpError> {
        self.record("declare_exchange", exchange.to_owned())
    }

    async fn declare_queue(&mut self, queue: &str) -> Result<(), AmqpError> {
        self.record("declare_queue", queue.to_owned())
    }

    async fn bind_queue(&mut self, queue: &str, exchange: &str) -> Result<(), AmqpError> {
        self.record("bind_queue", format!("{queue}->{exchange}"))
    }

    async fn set_qos(&mut self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.record("set_qos", prefetch_count.to_string())
    }

    async fn start_consuming(&mut self, queue: &str, _consumer_tag: &str) -> Result<(), AmqpError> {
        self.record("start_consuming", queue.to_owned())
    }

    async fn next_event(&mut self) -> TransportEvent {
        match self.events.pop_front() {
            Some(event) => {
                if let Some(shutdown) = &self.stop_on_event {
                    shutdown.request_stop();
                }
                event
            }
            None => std::future::pending().await,
        }
    }

    async fn delete_queue(&mut self, queue: &str) -> Result<(), AmqpError> {
        self.record("delete_queue", queue.to_owned())
    }

    async fn cancel_consumer(&mut self, _consumer_tag: &str) -> Result<(), AmqpError> {
        self.record("cancel_consumer", String::new())
    }

    async fn close_channel(&mut self) -> Result<(), AmqpError> {
        self.record("close_channel", String::new())
    }

    async fn close_connection(&mut self) -> Result<(), AmqpError> {
        self.record("close_connection", String::new())
    }
}
