// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Forecast Service
//!
//! The process-facing handle of the consumer: it wires the dispatcher, the
//! supervisor, the stop signal and the status channel together.

use crate::{
    channel::LapinTransport,
    config::Config,
    dispatcher::Dispatcher,
    errors::{AmqpError, ConfigError},
    executor::Executor,
    shutdown::ShutdownHandle,
    status::{ServiceStatus, StatusReporter},
    supervisor::{ReconnectPolicy, Supervisor},
    topology::TopologyDescriptor,
    transport::TransportFactory,
};
use std::sync::Arc;
use tokio::sync::watch;

pub struct ForecastService<F> {
    supervisor: Supervisor<F>,
    shutdown: ShutdownHandle,
    status: StatusReporter,
}

impl<F> ForecastService<F>
where
    F: TransportFactory,
{
    pub fn new(
        topology: TopologyDescriptor,
        policy: ReconnectPolicy,
        service_name: impl Into<String>,
        executor: Arc<dyn Executor>,
        factory: F,
    ) -> ForecastService<F> {
        let shutdown = ShutdownHandle::new();
        let status = StatusReporter::new();
        let supervisor = Supervisor::new(
            factory,
            topology,
            Dispatcher::new(executor),
            policy,
            service_name,
            shutdown.clone(),
            status.clone(),
        );

        ForecastService {
            supervisor,
            shutdown,
            status,
        }
    }

    /// Consumes until stopped or until the reconnection attempts run out.
    pub async fn run(&self) -> Result<(), AmqpError> {
        self.supervisor.run().await
    }

    /// Requests an orderly shutdown; safe to call any number of times.
    pub fn stop(&self) {
        self.shutdown.request_stop();
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ServiceStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> ServiceStatus {
        self.status.current()
    }

    pub fn attempt_count(&self) -> u32 {
        self.supervisor.attempt_count()
    }
}

/// Builds a service talking to RabbitMQ through lapin.
pub fn lapin_service(
    config: &Config,
    executor: Arc<dyn Executor>,
) -> Result<ForecastService<impl Fn() -> LapinTransport + Send + Sync>, ConfigError> {
    let topology = config.topology()?;
    let transport_topology = topology.clone();

    Ok(ForecastService::new(
        topology,
        config.reconnect_policy(),
        config.service_name.clone(),
        executor,
        move || LapinTransport::new(&transport_topology),
    ))
}
