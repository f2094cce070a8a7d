// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection State Machine
//!
//! A broker connection goes through a fixed handshake before it can consume:
//!
//! ```text
//! Disconnected -> Connecting -> ChannelOpening -> ExchangeDeclaring -> QueueDeclaring
//!     -> QueueBinding -> QosSetting -> Consuming
//! ```
//!
//! and an orderly teardown when a stop is requested:
//!
//! ```text
//! Consuming -> Cancelling -> ChannelClosing -> ConnectionClosing -> Closed
//! ```
//!
//! `ConnectionStateMachine` holds no I/O. The event loop feeds it one
//! `BrokerEvent` at a time through `step` and executes the `Command` it gets
//! back; the acknowledgement of that command is the next event. Since at most
//! one command is outstanding, no broker step can be issued out of order.

use crate::{errors::AmqpError, transport::InboundDelivery, transport::TransportEvent};
use std::{fmt, time::Duration};
use tracing::{debug, info, warn};

/// Delay before a failed connection attempt is reported as terminated.
pub const CONNECT_FAILURE_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    ChannelOpening,
    ExchangeDeclaring,
    QueueDeclaring,
    QueueBinding,
    QosSetting,
    Consuming,
    Cancelling,
    ChannelClosing,
    ConnectionClosing,
    Closed,
    Errored,
}

impl ConnectionState {
    /// `Closed` and `Errored` end the lifetime of a connection.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Errored)
    }

    /// States in which a stop request can be acted upon right away.
    ///
    /// `Connecting` waits for the handshake outcome first; teardown states
    /// already are on their way out.
    pub fn accepts_stop(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected
                | ConnectionState::ChannelOpening
                | ConnectionState::ExchangeDeclaring
                | ConnectionState::QueueDeclaring
                | ConnectionState::QueueBinding
                | ConnectionState::QosSetting
                | ConnectionState::Consuming
        )
    }

    fn is_setup(&self) -> bool {
        matches!(
            self,
            ConnectionState::ChannelOpening
                | ConnectionState::ExchangeDeclaring
                | ConnectionState::QueueDeclaring
                | ConnectionState::QueueBinding
                | ConnectionState::QosSetting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Inputs of the state machine: broker acknowledgements, broker-initiated
/// notifications and the stop request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Start,
    ConnectionOpened,
    ConnectionFailed(String),
    ChannelOpened,
    ExchangeDeclared,
    QueueDeclared,
    QueueBound,
    QosSet,
    ConsumerStarted,
    Delivery(InboundDelivery),
    StopRequested,
    QueueDeleted,
    ConsumerCancelled,
    ChannelClosed(String),
    ConsumerCancelledByBroker,
    StepFailed(String),
    ConnectionClosed(String),
}

impl BrokerEvent {
    fn name(&self) -> &'static str {
        match self {
            BrokerEvent::Start => "start",
            BrokerEvent::ConnectionOpened => "connection-opened",
            BrokerEvent::ConnectionFailed(_) => "connection-failed",
            BrokerEvent::ChannelOpened => "channel-opened",
            BrokerEvent::ExchangeDeclared => "exchange-declared",
            BrokerEvent::QueueDeclared => "queue-declared",
            BrokerEvent::QueueBound => "queue-bound",
            BrokerEvent::QosSet => "qos-set",
            BrokerEvent::ConsumerStarted => "consumer-started",
            BrokerEvent::Delivery(_) => "delivery",
            BrokerEvent::StopRequested => "stop-requested",
            BrokerEvent::QueueDeleted => "queue-deleted",
            BrokerEvent::ConsumerCancelled => "consumer-cancelled",
            BrokerEvent::ChannelClosed(_) => "channel-closed",
            BrokerEvent::ConsumerCancelledByBroker => "consumer-cancelled-by-broker",
            BrokerEvent::StepFailed(_) => "step-failed",
            BrokerEvent::ConnectionClosed(_) => "connection-closed",
        }
    }
}

impl From<TransportEvent> for BrokerEvent {
    fn from(event: TransportEvent) -> BrokerEvent {
        match event {
            TransportEvent::Delivery(delivery) => BrokerEvent::Delivery(delivery),
            TransportEvent::ChannelClosed(reason) => BrokerEvent::ChannelClosed(reason),
            TransportEvent::ConsumerCancelled => BrokerEvent::ConsumerCancelledByBroker,
            TransportEvent::ConnectionClosed(reason) => BrokerEvent::ConnectionClosed(reason),
        }
    }
}

/// The broker operation to issue next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    OpenConnection,
    OpenChannel,
    DeclareExchange,
    DeclareQueue,
    BindQueue,
    SetQos,
    StartConsuming,
    Dispatch(InboundDelivery),
    DeleteQueue,
    CancelConsumer,
    CloseChannel,
    CloseConnection,
    /// Wait, then end the run without touching the broker again.
    Terminate { after: Duration },
}

/// Transition table of one broker connection.
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    history: Vec<ConnectionState>,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    pub fn new() -> ConnectionStateMachine {
        ConnectionStateMachine {
            state: ConnectionState::Disconnected,
            history: vec![ConnectionState::Disconnected],
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Every state visited so far, in order, starting with `Disconnected`.
    pub fn history(&self) -> &[ConnectionState] {
        &self.history
    }

    /// Applies one event and returns the command to issue next, if any.
    ///
    /// # Returns
    /// `AmqpError::InvalidTransition` when the event is not accepted in the
    /// current state; the state is left untouched in that case.
    pub fn step(&mut self, event: BrokerEvent) -> Result<Option<Command>, AmqpError> {
        use BrokerEvent as E;
        use ConnectionState as S;

        let (next, command) = match (self.state, event) {
            (S::Disconnected, E::Start) => (S::Connecting, Some(Command::OpenConnection)),
            (S::Disconnected, E::StopRequested) => (S::Closed, None),

            (S::Connecting, E::ConnectionOpened) => (S::ChannelOpening, Some(Command::OpenChannel)),
            (S::Connecting, E::ConnectionFailed(reason)) => {
                warn!(reason = %reason, "connection attempt failed");
                (
                    S::Errored,
                    Some(Command::Terminate {
                        after: CONNECT_FAILURE_DELAY,
                    }),
                )
            }

            (S::ChannelOpening, E::ChannelOpened) => {
                (S::ExchangeDeclaring, Some(Command::DeclareExchange))
            }
            (S::ExchangeDeclaring, E::ExchangeDeclared) => {
                (S::QueueDeclaring, Some(Command::DeclareQueue))
            }
            (S::QueueDeclaring, E::QueueDeclared) => (S::QueueBinding, Some(Command::BindQueue)),
            (S::QueueBinding, E::QueueBound) => (S::QosSetting, Some(Command::SetQos)),
            (S::QosSetting, E::QosSet) => (S::Consuming, Some(Command::StartConsuming)),

            (S::Consuming, E::ConsumerStarted) => (S::Consuming, None),
            (S::Consuming, E::Delivery(delivery)) => {
                (S::Consuming, Some(Command::Dispatch(delivery)))
            }
            (S::Consuming, E::ChannelClosed(reason)) => {
                warn!(reason = %reason, "channel was closed unexpectedly");
                (S::ConnectionClosing, Some(Command::CloseConnection))
            }
            (S::Consuming, E::ConsumerCancelledByBroker) => {
                warn!("consumer was cancelled by the broker, shutting down");
                (S::ChannelClosing, Some(Command::CloseChannel))
            }
            (S::Consuming, E::StopRequested) => (S::Cancelling, Some(Command::DeleteQueue)),

            (state, E::StopRequested) if state.is_setup() => {
                (S::ConnectionClosing, Some(Command::CloseConnection))
            }

            (S::Cancelling, E::QueueDeleted) => (S::ChannelClosing, Some(Command::CancelConsumer)),
            (S::ChannelClosing, E::ConsumerCancelled) => {
                (S::ChannelClosing, Some(Command::CloseChannel))
            }
            (S::ChannelClosing, E::ChannelClosed(_)) => {
                (S::ConnectionClosing, Some(Command::CloseConnection))
            }
            (S::ConnectionClosing, E::ConnectionClosed(_)) => (S::Closed, None),

            (S::Cancelling | S::ChannelClosing | S::ConnectionClosing, E::StopRequested) => {
                debug!(state = %self.state, "stop already in progress");
                (self.state, None)
            }

            (state, E::ChannelClosed(reason) | E::StepFailed(reason))
                if state.is_setup()
                    || matches!(state, S::Consuming | S::Cancelling | S::ChannelClosing) =>
            {
                warn!(reason = %reason, state = %state, "broker step failed, closing the connection");
                (S::ConnectionClosing, Some(Command::CloseConnection))
            }

            (state, E::ConnectionClosed(reason)) if !state.is_terminal() && state != S::Disconnected => {
                warn!(reason = %reason, state = %state, "connection was closed unexpectedly");
                (S::Closed, None)
            }

            (state, event) => {
                return Err(AmqpError::InvalidTransition {
                    state: state.to_string(),
                    event: event.name().to_owned(),
                })
            }
        };

        if next != self.state {
            info!(from = %self.state, to = %next, "connection state changed");
            self.state = next;
            self.history.push(next);
        }

        Ok(command)
    }
}
