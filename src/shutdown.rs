// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Shutdown Coordination
//!
//! A single stop signal shared by the supervisor loop, the running connection
//! and whoever asks the service to stop (typically a signal handler).

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    pub fn new() -> ShutdownHandle {
        ShutdownHandle {
            token: CancellationToken::new(),
        }
    }

    /// Asks the consumer to stop. Calls after the first one have no effect.
    ///
    /// The supervisor starts no further connection, and the running
    /// connection (if any) begins its orderly teardown.
    pub fn request_stop(&self) {
        if self.token.is_cancelled() {
            debug!("stop was already requested");
            return;
        }
        info!("stop requested, shutting down the consumer");
        self.token.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once a stop was requested.
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }
}
