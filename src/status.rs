// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Service Status
//!
//! The externally observable health of the consumer, in the vocabulary of the
//! service registry the embedder forwards it to.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    #[default]
    Starting,
    Up,
    OutOfService,
    Down,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            ServiceStatus::Starting => "STARTING",
            ServiceStatus::Up => "UP",
            ServiceStatus::OutOfService => "OUT_OF_SERVICE",
            ServiceStatus::Down => "DOWN",
        };
        f.write_str(status)
    }
}

/// Publishes status transitions to any number of observers.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    sender: std::sync::Arc<watch::Sender<ServiceStatus>>,
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusReporter {
    pub fn new() -> StatusReporter {
        let (sender, _) = watch::channel(ServiceStatus::Starting);
        StatusReporter {
            sender: std::sync::Arc::new(sender),
        }
    }

    /// Records a new status; observers are only woken on actual changes.
    pub fn report(&self, status: ServiceStatus) {
        let changed = self.sender.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });

        if changed {
            debug!(status = %status, "service status changed");
        }
    }

    pub fn current(&self) -> ServiceStatus {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServiceStatus> {
        self.sender.subscribe()
    }
}
