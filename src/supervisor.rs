// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnection Supervisor
//!
//! Owns the connection lifecycle across reconnects. Every run gets a fresh
//! transport and state machine. A run that ends without a stop request is an
//! unexpected termination: the supervisor waits `retry_delay` and starts a
//! new run, up to `max_attempts` reconnections. The counter starts over once
//! a connection has reached the consuming state again.

use crate::{
    consumer::ConnectionDriver,
    dispatcher::Dispatcher,
    errors::AmqpError,
    shutdown::ShutdownHandle,
    status::{ServiceStatus, StatusReporter},
    topology::TopologyDescriptor,
    transport::TransportFactory,
};
use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};
use tracing::{error, info, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// How often and how fast a lost connection is re-established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

pub struct Supervisor<F> {
    factory: F,
    topology: TopologyDescriptor,
    dispatcher: Dispatcher,
    policy: ReconnectPolicy,
    service_name: String,
    shutdown: ShutdownHandle,
    status: StatusReporter,
    attempts: AtomicU32,
}

impl<F> Supervisor<F>
where
    F: TransportFactory,
{
    /// Creates a supervisor that has not connected yet.
    ///
    /// # Parameters
    /// * `factory` - Builds one transport per connection attempt
    /// * `topology` - Exchange, queue and QoS every connection sets up
    /// * `dispatcher` - Handles the deliveries of every connection
    /// * `policy` - Reconnection budget and delay
    /// * `service_name` - Prefix of the broker connection names
    /// * `shutdown` - Ends the supervisor and the running connection
    /// * `status` - Receives the status transitions
    pub fn new(
        factory: F,
        topology: TopologyDescriptor,
        dispatcher: Dispatcher,
        policy: ReconnectPolicy,
        service_name: impl Into<String>,
        shutdown: ShutdownHandle,
        status: StatusReporter,
    ) -> Supervisor<F> {
        Supervisor {
            factory,
            topology,
            dispatcher,
            policy,
            service_name: service_name.into(),
            shutdown,
            status,
            attempts: AtomicU32::new(0),
        }
    }

    /// Reconnections made since the last connection that reached consuming.
    pub fn attempt_count(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// Keeps a connection alive until a stop is requested.
    ///
    /// Broker cancels, channel or connection losses and failed setup steps
    /// all count as unexpected terminations.
    ///
    /// # Returns
    /// `Ok(())` after a requested stop, or `AmqpError::RetriesExhausted`
    /// once the policy gives up
    pub async fn run(&self) -> Result<(), AmqpError> {
        while !self.shutdown.is_stop_requested() {
            let outcome = ConnectionDriver::new(
                self.factory.create(),
                &self.topology,
                &self.dispatcher,
                &self.service_name,
                self.shutdown.clone(),
                self.status.clone(),
            )
            .run()
            .await;

            self.status.report(ServiceStatus::OutOfService);

            if self.shutdown.is_stop_requested() {
                info!(final_state = %outcome.final_state, "connection closed on request");
                break;
            }

            if outcome.reached_consuming {
                self.attempts.store(0, Ordering::SeqCst);
            }

            let attempts = self.attempts.load(Ordering::SeqCst);
            if attempts >= self.policy.max_attempts {
                error!(
                    attempts,
                    final_state = %outcome.final_state,
                    "reconnection attempts exhausted"
                );
                self.status.report(ServiceStatus::Down);
                return Err(AmqpError::RetriesExhausted { attempts });
            }

            let attempt = attempts + 1;
            self.attempts.store(attempt, Ordering::SeqCst);
            warn!(
                attempt,
                max_attempts = self.policy.max_attempts,
                delay = ?self.policy.retry_delay,
                final_state = %outcome.final_state,
                "connection terminated unexpectedly, reconnecting"
            );

            tokio::select! {
                _ = tokio::time::sleep(self.policy.retry_delay) => {}
                _ = self.shutdown.stopped() => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        executor::MockExecutor, testing::ScriptedTransport, transport::TransportEvent,
    };
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
    };

    fn supervisor<F: TransportFactory>(
        factory: F,
        policy: ReconnectPolicy,
        shutdown: ShutdownHandle,
        status: StatusReporter,
    ) -> Supervisor<F> {
        let topology = TopologyDescriptor::new("amqp://localhost", "forecasts", "forecasts#q");
        let dispatcher = Dispatcher::new(Arc::new(MockExecutor::new()));
        Supervisor::new(factory, topology, dispatcher, policy, "forecasts", shutdown, status)
    }

    fn policy(max_attempts: u32, retry_delay: Duration) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            retry_delay,
        }
    }

    #[test]
    fn default_policy() {
        let policy = ReconnectPolicy::default();

        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.retry_delay, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_configured_reconnections() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let status = StatusReporter::new();
        let supervisor = supervisor(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                ScriptedTransport::unreachable()
            },
            policy(3, Duration::from_secs(1)),
            ShutdownHandle::new(),
            status.clone(),
        );

        let err = supervisor.run().await.unwrap_err();

        assert_eq!(err, AmqpError::RetriesExhausted { attempts: 3 });
        assert_eq!(runs.load(Ordering::SeqCst), 4);
        assert_eq!(supervisor.attempt_count(), 3);
        assert_eq!(status.current(), ServiceStatus::Down);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_the_retry_delay_ends_cleanly() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let (shutdown, status) = (ShutdownHandle::new(), StatusReporter::new());
        let mut observer = status.subscribe();
        let supervisor = supervisor(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                ScriptedTransport::unreachable()
            },
            policy(3, Duration::from_secs(60)),
            shutdown.clone(),
            status.clone(),
        );

        let (result, _) = tokio::join!(supervisor.run(), async {
            observer
                .wait_for(|status| *status == ServiceStatus::OutOfService)
                .await
                .unwrap();
            shutdown.request_stop();
        });

        assert_eq!(result, Ok(()));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(status.current(), ServiceStatus::OutOfService);
    }

    #[tokio::test(start_paused = true)]
    async fn consuming_again_resets_the_attempt_counter() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let scripts = Arc::new(Mutex::new(VecDeque::from([
            ScriptedTransport::unreachable(),
            ScriptedTransport::unreachable(),
            ScriptedTransport::new()
                .with_events([TransportEvent::ConnectionClosed("heartbeat missed".to_owned())])
                .recording_into(calls.clone()),
        ])));
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let supervisor = supervisor(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                scripts
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(ScriptedTransport::unreachable)
            },
            policy(2, Duration::from_secs(1)),
            ShutdownHandle::new(),
            StatusReporter::new(),
        );

        let err = supervisor.run().await.unwrap_err();

        assert_eq!(err, AmqpError::RetriesExhausted { attempts: 2 });
        // two failures, one consuming run that resets, then two more failures
        assert_eq!(runs.load(Ordering::SeqCst), 5);
        assert!(calls
            .lock()
            .unwrap()
            .contains(&"start_consuming:forecasts#q".to_owned()));
    }

    #[tokio::test(start_paused = true)]
    async fn broker_cancel_and_channel_loss_trigger_a_reconnect() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let scripts = Arc::new(Mutex::new(VecDeque::from([
            ScriptedTransport::new().with_events([TransportEvent::ConsumerCancelled]),
            ScriptedTransport::new()
                .with_events([TransportEvent::ChannelClosed("320 CONNECTION_FORCED".to_owned())])
                .recording_into(calls.clone()),
        ])));
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let (shutdown, status) = (ShutdownHandle::new(), StatusReporter::new());
        let mut observer = status.subscribe();
        // a single attempt only suffices when consuming resets the counter
        let supervisor = supervisor(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                scripts
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(ScriptedTransport::new)
            },
            policy(1, Duration::from_secs(1)),
            shutdown.clone(),
            status.clone(),
        );

        let (result, _) = tokio::join!(supervisor.run(), async {
            loop {
                observer.changed().await.unwrap();
                let current = *observer.borrow_and_update();
                if runs.load(Ordering::SeqCst) == 3 && current == ServiceStatus::Up {
                    break;
                }
            }
            shutdown.request_stop();
        });

        assert_eq!(result, Ok(()));
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(supervisor.attempt_count(), 1);
        assert_eq!(status.current(), ServiceStatus::OutOfService);
        assert_eq!(
            calls.lock().unwrap().last().map(String::as_str),
            Some("close_connection")
        );
    }

    #[tokio::test]
    async fn stop_while_consuming_does_not_reconnect() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let (shutdown, status) = (ShutdownHandle::new(), StatusReporter::new());
        let mut observer = status.subscribe();
        let supervisor = supervisor(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                ScriptedTransport::new()
            },
            ReconnectPolicy::default(),
            shutdown.clone(),
            status.clone(),
        );

        let (result, _) = tokio::join!(supervisor.run(), async {
            observer
                .wait_for(|status| *status == ServiceStatus::Up)
                .await
                .unwrap();
            shutdown.request_stop();
        });

        assert_eq!(result, Ok(()));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.attempt_count(), 0);
        assert_eq!(status.current(), ServiceStatus::OutOfService);
    }
}
