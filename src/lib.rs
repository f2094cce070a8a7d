// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;
#[cfg(test)]
mod testing;

pub mod channel;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod executor;
pub mod forecast;
pub mod logging;
pub mod probe;
pub mod publisher;
pub mod service;
pub mod shutdown;
pub mod state;
pub mod status;
pub mod supervisor;
pub mod topology;
pub mod transport;
