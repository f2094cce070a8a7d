// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Forecast Consumer
//!
//! `AmqpError` covers every broker step the connection state machine drives
//! (connect, channel, exchange, queue, bind, qos, consume, teardown) plus the
//! two conditions owned by the state machine and the reconnection supervisor.
//! `ExecutorError` is what the forecast collaborator reports back; its text
//! becomes the `error` field of the reply.

use thiserror::Error;

/// Represents errors that can occur while driving the broker connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error registering the consumer on the queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error acknowledging a delivery
    #[error("failure to ack message `{0}`")]
    AckMessageError(u64),

    /// Error rejecting a delivery
    #[error("failure to reject message `{0}`")]
    RejectMessageError(u64),

    /// Error publishing a reply
    #[error("failure to publish to `{0}`")]
    PublishingError(String),

    /// Error deleting the consumer queue during teardown
    #[error("failure to delete queue `{0}`")]
    DeleteQueueError(String),

    /// Error cancelling the consumer registration
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error closing the channel or the connection
    #[error("failure to close: {0}")]
    CloseError(String),

    /// The state machine received an event it does not accept in its current state
    #[error("invalid transition: event `{event}` in state `{state}`")]
    InvalidTransition { state: String, event: String },

    /// The supervisor ran out of reconnection attempts
    #[error("reconnection attempts exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

/// Errors reported by the request executor.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutorError {
    /// The request did not pass validation
    #[error("{0}")]
    InvalidRequest(String),

    /// The request was valid but the result could not be computed
    #[error("{0}")]
    Computation(String),

    /// The executor panicked while handling the request
    #[error("executor panicked: {0}")]
    Panicked(String),
}

/// Errors in the process configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `AMQP_DSN` is not a valid AMQP URI
    #[error("invalid broker address `{address}`: {reason}")]
    InvalidBrokerAddress { address: String, reason: String },
}
