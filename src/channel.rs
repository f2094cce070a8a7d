// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! `LapinTransport` is the `BrokerTransport` backed by a real RabbitMQ
//! connection. It owns one connection, one channel on that connection and,
//! once consuming, the consumer stream. Broker-side failures of the
//! connection are forwarded from lapin's error callback into `next_event`.

use crate::{
    errors::AmqpError,
    publisher,
    topology::{ExchangeKind, TopologyDescriptor},
    transport::{BrokerTransport, DeliveryChannel, InboundDelivery, Reply, TransportEvent},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicQosOptions,
        BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
        QueueDeleteOptions,
    },
    types::{AMQPValue, FieldTable, LongString},
    Channel, Connection, ConnectionProperties, Consumer,
};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;
const CLOSED_BY_CLIENT: &str = "closed by client";

/// RabbitMQ transport of one connection attempt.
///
/// Holds at most one connection, one channel and one consumer; the
/// supervisor creates a new transport for every reconnection.
pub struct LapinTransport {
    exchange_kind: ExchangeKind,
    exchange_options: ExchangeDeclareOptions,
    queue_options: QueueDeclareOptions,
    connection: Option<Connection>,
    channel: Option<Channel>,
    consumer: Option<Consumer>,
    error_sender: mpsc::UnboundedSender<String>,
    errors: mpsc::UnboundedReceiver<String>,
}

impl LapinTransport {
    /// Creates an unconnected transport.
    ///
    /// # Parameters
    /// * `topology` - Provides the exchange kind and the declaration flags
    ///   of the exchange and the queue
    ///
    /// # Returns
    /// A transport that connects on the first `connect` call
    pub fn new(topology: &TopologyDescriptor) -> LapinTransport {
        let (error_sender, errors) = mpsc::unbounded_channel();
        LapinTransport {
            exchange_kind: topology.exchange_kind(),
            exchange_options: topology.exchange_options(),
            queue_options: topology.queue_options(),
            connection: None,
            channel: None,
            consumer: None,
            error_sender,
            errors,
        }
    }

    fn channel(&self) -> Result<&Channel, AmqpError> {
        self.channel
            .as_ref()
            .ok_or_else(|| AmqpError::ChannelError("channel is not open".to_owned()))
    }
}

#[async_trait]
impl DeliveryChannel for LapinTransport {
    async fn ack(&mut self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel()?
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error to ack msg");
                AmqpError::AckMessageError(delivery_tag)
            })
    }

    async fn reject(&mut self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel()?
            .basic_reject(delivery_tag, BasicRejectOptions { requeue: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error to reject msg");
                AmqpError::RejectMessageError(delivery_tag)
            })
    }

    async fn publish_reply(&mut self, reply: Reply) -> Result<(), AmqpError> {
        publisher::publish_reply(self.channel()?, reply).await
    }
}

#[async_trait]
impl BrokerTransport for LapinTransport {
    /// Opens the connection and forwards its errors to `next_event`.
    ///
    /// # Parameters
    /// * `address` - AMQP URI of the broker
    /// * `connection_name` - Name shown in the broker's management views
    async fn connect(&mut self, address: &str, connection_name: &str) -> Result<(), AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(connection_name.to_owned()));

        let connection = Connection::connect(address, options).await.map_err(|err| {
            error!(error = err.to_string(), "failure to connect");
            AmqpError::ConnectionError(err.to_string())
        })?;

        let sender = self.error_sender.clone();
        connection.on_error(move |err| {
            // the receiver is gone once the transport is dropped
            let _ = sender.send(err.to_string());
        });

        debug!("amqp connected");
        self.connection = Some(connection);
        Ok(())
    }

    async fn open_channel(&mut self) -> Result<(), AmqpError> {
        let connection = self
            .connection
            .as_ref()
            .ok_or_else(|| AmqpError::ConnectionError("not connected".to_owned()))?;

        debug!("creating amqp channel...");
        let channel = connection.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            AmqpError::ChannelError(err.to_string())
        })?;

        debug!(channel_id = channel.id(), "channel created");
        self.channel = Some(channel);
        Ok(())
    }

    async fn declare_exchange(&mut self, exchange: &str) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", exchange);
        self.channel()?
            .exchange_declare(
                exchange,
                self.exchange_kind.into(),
                self.exchange_options,
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name = exchange, "error to declare the exchange");
                AmqpError::DeclareExchangeError(err.to_string())
            })
    }

    async fn declare_queue(&mut self, queue: &str) -> Result<(), AmqpError> {
        debug!("creating queue: {}", queue);
        self.channel()?
            .queue_declare(queue, self.queue_options, FieldTable::default())
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), name = queue, "error to declare the queue");
                AmqpError::DeclareQueueError(err.to_string())
            })
    }

    async fn bind_queue(&mut self, queue: &str, exchange: &str) -> Result<(), AmqpError> {
        debug!("binding queue: {} to the exchange: {}", queue, exchange);
        self.channel()?
            .queue_bind(
                queue,
                exchange,
                "",
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn set_qos(&mut self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel()?
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), prefetch_count, "error to set the qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn start_consuming(&mut self, queue: &str, consumer_tag: &str) -> Result<(), AmqpError> {
        let consumer = self
            .channel()?
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::ConsumerDeclarationError(err.to_string())
            })?;

        self.consumer = Some(consumer);
        Ok(())
    }

    /// Waits for the next delivery or broker notification.
    ///
    /// # Returns
    /// * `Delivery` for every message of the consumer stream
    /// * `ChannelClosed` when the stream reports an error
    /// * `ConsumerCancelled` when the broker ended the stream
    /// * `ConnectionClosed` when the connection reported an error
    async fn next_event(&mut self) -> TransportEvent {
        let Some(consumer) = self.consumer.as_mut() else {
            return match self.errors.recv().await {
                Some(reason) => TransportEvent::ConnectionClosed(reason),
                None => TransportEvent::ConnectionClosed("connection dropped".to_owned()),
            };
        };

        tokio::select! {
            Some(reason) = self.errors.recv() => TransportEvent::ConnectionClosed(reason),
            next = consumer.next() => match next {
                Some(Ok(delivery)) => TransportEvent::Delivery(inbound(delivery)),
                Some(Err(err)) => {
                    error!(error = err.to_string(), "errors consume msg");
                    TransportEvent::ChannelClosed(err.to_string())
                }
                None => TransportEvent::ConsumerCancelled,
            },
        }
    }

    async fn delete_queue(&mut self, queue: &str) -> Result<(), AmqpError> {
        self.channel()?
            .queue_delete(
                queue,
                QueueDeleteOptions {
                    if_unused: false,
                    if_empty: false,
                    nowait: false,
                },
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), name = queue, "error to delete the queue");
                AmqpError::DeleteQueueError(err.to_string())
            })
    }

    async fn cancel_consumer(&mut self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel()?
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to cancel the consumer");
                AmqpError::CancelConsumerError(err.to_string())
            })
    }

    async fn close_channel(&mut self) -> Result<(), AmqpError> {
        self.consumer = None;
        let Some(channel) = self.channel.take() else {
            return Ok(());
        };

        channel
            .close(REPLY_SUCCESS, CLOSED_BY_CLIENT)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to close the channel");
                AmqpError::CloseError(err.to_string())
            })
    }

    /// Closes the connection and drops the channel and consumer with it.
    ///
    /// # Returns
    /// `Ok(())` when there was nothing to close
    async fn close_connection(&mut self) -> Result<(), AmqpError> {
        self.consumer = None;
        self.channel = None;
        let Some(connection) = self.connection.take() else {
            return Ok(());
        };

        connection
            .close(REPLY_SUCCESS, CLOSED_BY_CLIENT)
            .await
            .map_err(|err| {
                debug!(error = err.to_string(), "connection was already closed");
                AmqpError::CloseError(err.to_string())
            })
    }
}

/// Copies the parts of a lapin delivery the dispatcher needs.
fn inbound(delivery: Delivery) -> InboundDelivery {
    let properties = &delivery.properties;
    let reply_to = properties
        .reply_to()
        .as_ref()
        .map(|reply_to| reply_to.as_str().to_owned());
    let correlation_id = properties
        .correlation_id()
        .as_ref()
        .map(|id| id.as_str().to_owned());
    let headers = string_headers(properties.headers().as_ref());

    InboundDelivery {
        delivery_tag: delivery.delivery_tag,
        reply_to,
        correlation_id,
        headers,
        payload: delivery.data,
    }
}

/// Keeps the string-valued headers; trace context only uses strings.
fn string_headers(table: Option<&FieldTable>) -> BTreeMap<String, String> {
    let Some(table) = table else {
        return BTreeMap::new();
    };

    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes()).ok()?,
                AMQPValue::ShortString(value) => value.as_str(),
                _ => return None,
            };
            Some((key.as_str().to_owned(), value.to_owned()))
        })
        .collect()
}
