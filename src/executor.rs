// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Request Executor
//!
//! The dispatcher hands every decoded request to an `Executor`. Validation of
//! the request schema and the computation itself belong to the executor; the
//! dispatcher only sees a JSON result or an `ExecutorError`.

use crate::errors::ExecutorError;
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};

#[cfg_attr(test, mockall::automock)]
pub trait Executor: Send + Sync {
    /// Validates and executes one request.
    fn execute(&self, request: Value) -> Result<Value, ExecutorError>;
}

/// Runs the executor, turning a panic into `ExecutorError::Panicked` so a
/// faulty request cannot take the connection down with it.
pub(crate) fn execute_guarded(executor: &dyn Executor, request: Value) -> Result<Value, ExecutorError> {
    match panic::catch_unwind(AssertUnwindSafe(|| executor.execute(request))) {
        Ok(result) => result,
        Err(payload) => {
            let message = if let Some(message) = payload.downcast_ref::<&str>() {
                (*message).to_owned()
            } else if let Some(message) = payload.downcast_ref::<String>() {
                message.clone()
            } else {
                "unknown panic".to_owned()
            };
            Err(ExecutorError::Panicked(message))
        }
    }
}
