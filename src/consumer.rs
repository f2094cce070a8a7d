// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Driver
//!
//! Runs the event loop of a single broker connection: executes the command
//! the state machine asks for, turns the broker's answer into the next event
//! and, once consuming, waits for deliveries or broker notifications. Every
//! handler runs sequentially on this one task, so a delivery is fully
//! dispatched before the next one is read.

use crate::{
    dispatcher::Dispatcher,
    errors::AmqpError,
    shutdown::ShutdownHandle,
    state::{BrokerEvent, Command, ConnectionState, ConnectionStateMachine},
    status::{ServiceStatus, StatusReporter},
    topology::TopologyDescriptor,
    transport::BrokerTransport,
};
use tracing::{debug, error, info};
use uuid::Uuid;

const CLOSED_BY_CLIENT: &str = "closed by client";

/// How a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub final_state: ConnectionState,
    /// The consumer was registered on the queue.
    pub reached_consuming: bool,
    pub history: Vec<ConnectionState>,
}

/// Drives one connection from `Disconnected` to `Closed` or `Errored`.
pub struct ConnectionDriver<'a, T> {
    transport: T,
    machine: ConnectionStateMachine,
    topology: &'a TopologyDescriptor,
    dispatcher: &'a Dispatcher,
    shutdown: ShutdownHandle,
    status: StatusReporter,
    connection_name: String,
    consumer_tag: String,
    consumer_started: bool,
}

impl<'a, T> ConnectionDriver<'a, T>
where
    T: BrokerTransport,
{
    /// Creates a driver for one connection attempt.
    ///
    /// The connection name (`<service-name>#<uuid>`) and the consumer tag
    /// (`<queue>#ctag-<uuid>`) are drawn here, so every attempt shows up
    /// separately in the broker's management views.
    ///
    /// # Parameters
    /// * `transport` - A fresh, unconnected transport
    /// * `topology` - Exchange, queue and QoS to set up
    /// * `dispatcher` - Handles every delivery of the connection
    /// * `service_name` - Prefix of the connection name
    /// * `shutdown` - Stop signal shared with the supervisor
    /// * `status` - Receives `Up` once the consumer is registered
    pub fn new(
        transport: T,
        topology: &'a TopologyDescriptor,
        dispatcher: &'a Dispatcher,
        service_name: &str,
        shutdown: ShutdownHandle,
        status: StatusReporter,
    ) -> ConnectionDriver<'a, T> {
        ConnectionDriver {
            transport,
            machine: ConnectionStateMachine::new(),
            topology,
            dispatcher,
            shutdown,
            status,
            connection_name: format!("{}#{}", service_name, Uuid::new_v4()),
            consumer_tag: format!(
                "{}#ctag-{}",
                topology.queue_name(),
                Uuid::new_v4().simple()
            ),
            consumer_started: false,
        }
    }

    /// Runs the connection until it reaches a terminal state.
    ///
    /// A stop request is handled between two broker steps. A delivery that
    /// was already received is dispatched first, then the consumer is torn
    /// down in order.
    ///
    /// # Returns
    /// The final state, whether the consumer was registered, and the visited states
    pub async fn run(mut self) -> RunOutcome {
        let mut stop_delivered = self.shutdown.is_stop_requested();
        let mut pending = if stop_delivered {
            self.advance(BrokerEvent::StopRequested)
        } else {
            self.advance(BrokerEvent::Start)
        };

        loop {
            // a received delivery is settled before the stop is handled
            let dispatch_pending = matches!(pending, Some(Command::Dispatch(_)));
            if !stop_delivered
                && !dispatch_pending
                && self.shutdown.is_stop_requested()
                && self.machine.state().accepts_stop()
            {
                stop_delivered = true;
                // the pending handshake step was not issued yet
                pending = self.advance(BrokerEvent::StopRequested);
            }

            let event = match pending.take() {
                Some(command) => match self.execute(command).await {
                    Some(event) => event,
                    None => continue,
                },
                None if self.machine.state() == ConnectionState::Consuming => {
                    tokio::select! {
                        event = self.transport.next_event() => BrokerEvent::from(event),
                        _ = self.shutdown.stopped() => continue,
                    }
                }
                None => break,
            };

            pending = self.advance(event);
        }

        RunOutcome {
            final_state: self.machine.state(),
            reached_consuming: self.consumer_started,
            history: self.machine.history().to_vec(),
        }
    }

    fn advance(&mut self, event: BrokerEvent) -> Option<Command> {
        match self.machine.step(event) {
            Ok(command) => command,
            Err(err) => {
                error!(error = err.to_string(), "unexpected broker event");
                let state = self.machine.state();
                if state.is_terminal() || state == ConnectionState::Disconnected {
                    None
                } else {
                    Some(Command::CloseConnection)
                }
            }
        }
    }

    /// Issues one command and waits for the broker's answer.
    async fn execute(&mut self, command: Command) -> Option<BrokerEvent> {
        let topology = self.topology;

        match command {
            Command::OpenConnection => {
                info!(
                    address = topology.broker_address(),
                    connection_name = self.connection_name,
                    "connecting to the message broker"
                );
                match self
                    .transport
                    .connect(topology.broker_address(), &self.connection_name)
                    .await
                {
                    Ok(()) => Some(BrokerEvent::ConnectionOpened),
                    Err(err) => Some(BrokerEvent::ConnectionFailed(err.to_string())),
                }
            }
            Command::OpenChannel => {
                let result = self.transport.open_channel().await;
                acknowledged(result, BrokerEvent::ChannelOpened)
            }
            Command::DeclareExchange => {
                let result = self
                    .transport
                    .declare_exchange(topology.exchange_name())
                    .await;
                acknowledged(result, BrokerEvent::ExchangeDeclared)
            }
            Command::DeclareQueue => {
                let result = self.transport.declare_queue(topology.queue_name()).await;
                acknowledged(result, BrokerEvent::QueueDeclared)
            }
            Command::BindQueue => {
                let result = self
                    .transport
                    .bind_queue(topology.queue_name(), topology.exchange_name())
                    .await;
                acknowledged(result, BrokerEvent::QueueBound)
            }
            Command::SetQos => {
                let result = self.transport.set_qos(topology.prefetch_count()).await;
                acknowledged(result, BrokerEvent::QosSet)
            }
            Command::StartConsuming => {
                let result = self
                    .transport
                    .start_consuming(topology.queue_name(), &self.consumer_tag)
                    .await;
                if result.is_ok() {
                    info!(
                        exchange = topology.exchange_name(),
                        queue = topology.queue_name(),
                        "consuming messages"
                    );
                    self.consumer_started = true;
                    self.status.report(ServiceStatus::Up);
                }
                acknowledged(result, BrokerEvent::ConsumerStarted)
            }
            Command::Dispatch(delivery) => {
                let delivery_tag = delivery.delivery_tag;
                match self.dispatcher.dispatch(&mut self.transport, delivery).await {
                    Ok(outcome) => debug!(delivery_tag, ?outcome, "message dispatched"),
                    Err(err) => error!(error = err.to_string(), delivery_tag, "error consume msg"),
                }
                None
            }
            Command::DeleteQueue => {
                let result = self.transport.delete_queue(topology.queue_name()).await;
                acknowledged(result, BrokerEvent::QueueDeleted)
            }
            Command::CancelConsumer => {
                let result = self.transport.cancel_consumer(&self.consumer_tag).await;
                acknowledged(result, BrokerEvent::ConsumerCancelled)
            }
            Command::CloseChannel => {
                let result = self.transport.close_channel().await;
                acknowledged(result, BrokerEvent::ChannelClosed(CLOSED_BY_CLIENT.to_owned()))
            }
            Command::CloseConnection => match self.transport.close_connection().await {
                Ok(()) => Some(BrokerEvent::ConnectionClosed(CLOSED_BY_CLIENT.to_owned())),
                // the session is unusable either way
                Err(err) => Some(BrokerEvent::ConnectionClosed(err.to_string())),
            },
            Command::Terminate { after } => {
                debug!(delay = ?after, "waiting before reporting the failed connection");
                tokio::select! {
                    _ = tokio::time::sleep(after) => {}
                    _ = self.shutdown.stopped() => {}
                }
                None
            }
        }
    }
}

fn acknowledged(result: Result<(), AmqpError>, event: BrokerEvent) -> Option<BrokerEvent> {
    Some(match result {
        Ok(()) => event,
        Err(err) => {
            error!(error = err.to_string(), "broker step failed");
            BrokerEvent::StepFailed(err.to_string())
        }
    })
}
