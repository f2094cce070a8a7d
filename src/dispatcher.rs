// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! Handles one delivery at a time, inline in the connection event loop:
//!
//! 1. Decodes the payload as JSON
//! 2. Rejects undecodable payloads (no requeue) and answers with a
//!    `json_parse_error` reply when a reply address exists
//! 3. Acknowledges decodable payloads before running the executor
//! 4. Publishes the executor result, or `{"error": ...}` when it failed,
//!    to the reply address with the request's correlation id
//!
//! Acknowledging before execution means a crash during execution loses the
//! reply; the broker does not redeliver an acknowledged message.

use crate::{
    errors::AmqpError,
    executor::{execute_guarded, Executor},
    otel,
    transport::{DeliveryChannel, InboundDelivery, Reply},
};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use serde_json::{json, Value};
use std::{borrow::Cow, collections::BTreeMap, sync::Arc};
use tracing::{debug, error, warn};

/// Error code of the reply sent for undecodable payloads.
pub const JSON_PARSE_ERROR: &str = "json_parse_error";

/// What happened to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Acknowledged and handed to the executor.
    Processed { replied: bool },
    /// Rejected without requeue because the payload was not JSON.
    Rejected { replied: bool },
}

/// Routes deliveries to the executor and replies to the caller.
pub struct Dispatcher {
    executor: Arc<dyn Executor>,
    tracer: BoxedTracer,
}

impl Dispatcher {
    pub fn new(executor: Arc<dyn Executor>) -> Dispatcher {
        Dispatcher {
            executor,
            tracer: global::tracer("forecast consumer"),
        }
    }

    /// Processes one delivery.
    ///
    /// The delivery is acknowledged or rejected exactly once. Errors are
    /// only returned for broker operations (ack, reject, publish); executor
    /// failures are answered and reported as `Processed`.
    pub async fn dispatch<C>(
        &self,
        channel: &mut C,
        delivery: InboundDelivery,
    ) -> Result<DispatchOutcome, AmqpError>
    where
        C: DeliveryChannel + ?Sized,
    {
        let (ctx, mut span) = otel::new_span(&delivery.headers, &self.tracer, "forecast request");

        debug!(
            delivery_tag = delivery.delivery_tag,
            reply_to = delivery.reply_to.as_deref().unwrap_or_default(),
            "received message"
        );

        let request = match serde_json::from_slice::<Value>(&delivery.payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = err.to_string(), "message could not be parsed as json");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("json parse error"),
                });

                channel.reject(delivery.delivery_tag).await?;

                let body = json!({
                    "error": JSON_PARSE_ERROR,
                    "error_description": format!(
                        "The message could not be parsed as json. The parser reported the following issue: {}",
                        err
                    ),
                });
                let replied = self.reply(channel, &ctx, &delivery, &body).await?;
                return Ok(DispatchOutcome::Rejected { replied });
            }
        };

        if let Err(err) = channel.ack(delivery.delivery_tag).await {
            error!(error = err.to_string(), "error to ack msg");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to ack msg"),
            });
            return Err(err);
        }

        let body = match execute_guarded(self.executor.as_ref(), request) {
            Ok(result) => {
                span.set_status(Status::Ok);
                result
            }
            Err(err) => {
                warn!(error = err.to_string(), "executor failed to handle the request");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("executor failure"),
                });
                json!({ "error": err.to_string() })
            }
        };

        let replied = self.reply(channel, &ctx, &delivery, &body).await?;
        Ok(DispatchOutcome::Processed { replied })
    }

    /// Publishes `body` to the delivery's reply address, if it has one.
    async fn reply<C>(
        &self,
        channel: &mut C,
        ctx: &opentelemetry::Context,
        delivery: &InboundDelivery,
        body: &Value,
    ) -> Result<bool, AmqpError>
    where
        C: DeliveryChannel + ?Sized,
    {
        let Some(reply_to) = delivery.reply_to.as_deref().filter(|r| !r.is_empty()) else {
            debug!("message has no reply address, skipping the reply");
            return Ok(false);
        };

        let mut headers = BTreeMap::new();
        otel::inject_context(ctx, &mut headers);

        let body = serde_json::to_vec(body).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize reply");
            AmqpError::PublishingError(reply_to.to_owned())
        })?;

        channel
            .publish_reply(Reply {
                routing_key: reply_to.to_owned(),
                correlation_id: delivery.correlation_id.clone(),
                headers,
                body,
            })
            .await?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::ExecutorError, executor::MockExecutor, forecast::ForecastExecutor,
        transport::MockDeliveryChannel,
    };
    use mockall::{predicate::eq, Sequence};

    fn delivery(payload: &str, reply_to: Option<&str>) -> InboundDelivery {
        InboundDelivery {
            delivery_tag: 42,
            reply_to: reply_to.map(str::to_owned),
            correlation_id: Some("abc".to_owned()),
            headers: BTreeMap::new(),
            payload: payload.as_bytes().to_vec(),
        }
    }

    fn body(reply: &Reply) -> Value {
        serde_json::from_slice(&reply.body).unwrap()
    }

    #[tokio::test]
    async fn malformed_payload_is_rejected_and_answered() {
        let mut executor = MockExecutor::new();
        executor.expect_execute().never();
        let mut channel = MockDeliveryChannel::new();
        channel.expect_ack().never();
        channel
            .expect_reject()
            .with(eq(42))
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_publish_reply()
            .withf(|reply| {
                let body = body(reply);
                reply.routing_key == "R"
                    && reply.correlation_id.as_deref() == Some("abc")
                    && body["error"] == JSON_PARSE_ERROR
                    && body["error_description"]
                        .as_str()
                        .is_some_and(|d| d.starts_with("The message could not be parsed as json"))
            })
            .times(1)
            .returning(|_| Ok(()));

        let outcome = Dispatcher::new(Arc::new(executor))
            .dispatch(&mut channel, delivery("{not json", Some("R")))
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Rejected { replied: true });
    }

    #[tokio::test]
    async fn malformed_payload_without_reply_address_is_only_rejected() {
        let mut executor = MockExecutor::new();
        executor.expect_execute().never();
        let mut channel = MockDeliveryChannel::new();
        channel.expect_reject().times(1).returning(|_| Ok(()));
        channel.expect_publish_reply().never();

        let outcome = Dispatcher::new(Arc::new(executor))
            .dispatch(&mut channel, delivery("", None))
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Rejected { replied: false });
    }

    #[tokio::test]
    async fn result_is_published_after_the_ack() {
        let mut seq = Sequence::new();
        let mut executor = MockExecutor::new();
        executor
            .expect_execute()
            .with(eq(json!({ "forecastType": "linear" })))
            .times(1)
            .returning(|_| Ok(json!({ "forecastEquation": "y = 1 * x + 0" })));
        let mut channel = MockDeliveryChannel::new();
        channel
            .expect_ack()
            .with(eq(42))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_publish_reply()
            .withf(|reply| {
                reply.routing_key == "R"
                    && reply.correlation_id.as_deref() == Some("abc")
                    && body(reply) == json!({ "forecastEquation": "y = 1 * x + 0" })
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel.expect_reject().never();

        let outcome = Dispatcher::new(Arc::new(executor))
            .dispatch(
                &mut channel,
                delivery(r#"{"forecastType":"linear"}"#, Some("R")),
            )
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Processed { replied: true });
    }

    #[tokio::test]
    async fn executor_failure_is_answered_with_its_message() {
        let mut executor = MockExecutor::new();
        executor
            .expect_execute()
            .returning(|_| Err(ExecutorError::InvalidRequest("bad usage data".to_owned())));
        let mut channel = MockDeliveryChannel::new();
        channel.expect_ack().times(1).returning(|_| Ok(()));
        channel
            .expect_publish_reply()
            .withf(|reply| {
                reply.correlation_id.as_deref() == Some("abc")
                    && body(reply) == json!({ "error": "bad usage data" })
            })
            .times(1)
            .returning(|_| Ok(()));

        let outcome = Dispatcher::new(Arc::new(executor))
            .dispatch(&mut channel, delivery("{}", Some("R")))
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Processed { replied: true });
    }

    #[tokio::test]
    async fn missing_reply_address_still_runs_the_executor() {
        let mut executor = MockExecutor::new();
        executor.expect_execute().times(1).returning(|_| Ok(json!({})));
        let mut channel = MockDeliveryChannel::new();
        channel.expect_ack().times(1).returning(|_| Ok(()));
        channel.expect_publish_reply().never();

        let outcome = Dispatcher::new(Arc::new(executor))
            .dispatch(&mut channel, delivery("{}", None))
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Processed { replied: false });
    }

    #[tokio::test]
    async fn failed_ack_skips_the_executor() {
        let mut executor = MockExecutor::new();
        executor.expect_execute().never();
        let mut channel = MockDeliveryChannel::new();
        channel
            .expect_ack()
            .returning(|tag| Err(AmqpError::AckMessageError(tag)));
        channel.expect_publish_reply().never();

        let err = Dispatcher::new(Arc::new(executor))
            .dispatch(&mut channel, delivery("{}", Some("R")))
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::AckMessageError(42));
    }

    #[tokio::test]
    async fn linear_forecast_request_is_answered_with_an_equation() {
        let mut channel = MockDeliveryChannel::new();
        channel.expect_ack().times(1).returning(|_| Ok(()));
        channel
            .expect_publish_reply()
            .withf(|reply| {
                let body = body(reply);
                reply.routing_key == "R"
                    && reply.correlation_id.as_deref() == Some("abc")
                    && body["forecastType"] == "linear"
                    && body["forecastEquation"].is_string()
            })
            .times(1)
            .returning(|_| Ok(()));

        let payload = r#"{
            "forecastType": "linear",
            "usageData": {"startYear": 2010, "endYear": 2014, "usageAmounts": [1.0, 2.0, 3.0, 4.0, 5.0]}
        }"#;
        let outcome = Dispatcher::new(Arc::new(ForecastExecutor::default()))
            .dispatch(&mut channel, delivery(payload, Some("R")))
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Processed { replied: true });
    }
}
