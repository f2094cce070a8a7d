// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use clap::Parser;
use forecast_consumer::{
    config::Config,
    errors::AmqpError,
    forecast::ForecastExecutor,
    logging,
    probe::{self, ProbeSettings},
    service,
    status::ServiceStatus,
};
use std::{process::ExitCode, sync::Arc};
use tokio::sync::watch;
use tracing::{error, info};

const EXIT_CONFIG: u8 = 1;
const EXIT_RETRIES_EXHAUSTED: u8 = 2;
const EXIT_BROKER_UNREACHABLE: u8 = 5;

#[tokio::main]
async fn main() -> ExitCode {
    // a missing .env file is fine, the environment may carry everything
    let _ = dotenvy::dotenv();

    let config = match Config::try_parse() {
        Ok(config) => config,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::from(EXIT_CONFIG)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    logging::init_logging(&config.service_log_level);

    let endpoint = match config.broker_endpoint() {
        Ok(endpoint) => endpoint,
        Err(err) => {
            error!(error = err.to_string(), "invalid configuration");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    info!(host = %endpoint.host, port = endpoint.port, "checking the message broker");
    if !probe::is_host_available(&endpoint.host, endpoint.port, ProbeSettings::default()).await {
        error!(
            host = %endpoint.host,
            port = endpoint.port,
            "message broker is not reachable"
        );
        return ExitCode::from(EXIT_BROKER_UNREACHABLE);
    }

    let service = match service::lapin_service(&config, Arc::new(ForecastExecutor::default())) {
        Ok(service) => Arc::new(service),
        Err(err) => {
            error!(error = err.to_string(), "invalid configuration");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    tokio::spawn(log_status(service.subscribe_status()));

    let consumer = tokio::spawn({
        let service = service.clone();
        async move { service.run().await }
    });

    let shutdown = service.shutdown_handle();
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.request_stop();
    });

    match consumer.await {
        Ok(Ok(())) => {
            info!("forecast consumer stopped");
            ExitCode::SUCCESS
        }
        Ok(Err(AmqpError::RetriesExhausted { attempts })) => {
            error!(attempts, "giving up on the message broker");
            ExitCode::from(EXIT_RETRIES_EXHAUSTED)
        }
        Ok(Err(err)) => {
            error!(error = err.to_string(), "forecast consumer failed");
            ExitCode::FAILURE
        }
        Err(err) => {
            error!(error = err.to_string(), "forecast consumer task failed");
            ExitCode::FAILURE
        }
    }
}

/// Logs every status transition until the service is dropped.
async fn log_status(mut status: watch::Receiver<ServiceStatus>) {
    while status.changed().await.is_ok() {
        let current = *status.borrow_and_update();
        info!(status = %current, "service status changed");
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            error!(error = err.to_string(), "failure to listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = terminate.recv() => info!("received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("received ctrl-c");
    }
}
