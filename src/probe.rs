// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Startup reachability check of the broker host.

use std::time::Duration;
use tokio::{
    net::TcpStream,
    time::{self, Instant},
};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    /// Total time the host may take to become reachable.
    pub window: Duration,
    pub attempt_timeout: Duration,
    /// Pause after a failed attempt.
    pub pause: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        ProbeSettings {
            window: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(5),
            pause: Duration::from_secs(5),
        }
    }
}

/// Tries to open a TCP connection to `host:port` until one succeeds or the
/// window has passed.
pub async fn is_host_available(host: &str, port: u16, settings: ProbeSettings) -> bool {
    let deadline = Instant::now() + settings.window;

    while Instant::now() < deadline {
        match time::timeout(settings.attempt_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => {
                debug!(host, port, "broker host is reachable");
                return true;
            }
            Ok(Err(err)) => warn!(error = err.to_string(), host, port, "broker host refused"),
            Err(_) => warn!(host, port, "broker host did not answer in time"),
        }
        time::sleep(settings.pause).await;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn quick() -> ProbeSettings {
        ProbeSettings {
            window: Duration::from_millis(200),
            attempt_timeout: Duration::from_millis(100),
            pause: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn listening_host_is_available() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(is_host_available("127.0.0.1", port, quick()).await);
    }

    #[tokio::test]
    async fn closed_port_is_not_available() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(!is_host_available("127.0.0.1", port, quick()).await);
    }

    #[tokio::test]
    async fn empty_window_never_probes() {
        let settings = ProbeSettings {
            window: Duration::ZERO,
            ..quick()
        };

        assert!(!is_host_available("127.0.0.1", 1, settings).await);
    }
}
