//! Message broker client over the broker's HTTP management API.
//!
//! Publishes to an exchange with a routing key and polls the queue's own
//! inbox one message at a time (acked on delivery). The wire protocol
//! proper stays the broker's business.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use alq_config::BusConfig;
use alq_queue::clients::{ClientError, MessageBus};
use alq_schemas::PushJob;

use crate::{expect_success, transport};

/// Default vhost, URL-encoded.
const VHOST: &str = "%2f";

pub struct HttpBus {
    http: reqwest::Client,
    api_url: String,
    exchange: String,
    queue: String,
}

impl HttpBus {
    pub fn new(cfg: &BusConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            http,
            api_url: cfg.api_url.trim_end_matches('/').to_string(),
            exchange: cfg.exchange.clone(),
            queue: cfg.queue.clone(),
        }
    }

    async fn queue_depth(&self) -> Result<u64, ClientError> {
        let resp = self
            .http
            .get(format!("{}/queues/{VHOST}/{}", self.api_url, self.queue))
            .send()
            .await
            .map_err(transport)?;
        let v: Value = expect_success(resp)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        Ok(v.get("messages").and_then(Value::as_u64).unwrap_or(0))
    }
}

#[async_trait]
impl MessageBus for HttpBus {
    async fn publish(&self, routing_key: &str, job: &PushJob) -> Result<(), ClientError> {
        let payload =
            serde_json::to_string(job).map_err(|e| ClientError::Decode(e.to_string()))?;
        let resp = self
            .http
            .post(format!(
                "{}/exchanges/{VHOST}/{}/publish",
                self.api_url, self.exchange
            ))
            .json(&json!({
                "routing_key": routing_key,
                "payload": payload,
                "payload_encoding": "string",
                "properties": { "message_id": job.message_id.to_string() },
            }))
            .send()
            .await
            .map_err(transport)?;
        let v: Value = expect_success(resp)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        if v.get("routed").and_then(Value::as_bool) == Some(true) {
            Ok(())
        } else {
            Err(ClientError::Api(format!(
                "message was not routed to any queue (routing_key={routing_key})"
            )))
        }
    }

    async fn poll(&self) -> Result<Option<Value>, ClientError> {
        let resp = self
            .http
            .post(format!(
                "{}/queues/{VHOST}/{}/get",
                self.api_url, self.queue
            ))
            .json(&json!({
                "count": 1,
                "ackmode": "ack_requeue_false",
                "encoding": "auto",
            }))
            .send()
            .await
            .map_err(transport)?;
        let v: Value = expect_success(resp)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        let Some(first) = v.as_array().and_then(|a| a.first()) else {
            return Ok(None);
        };
        let payload = first
            .get("payload")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::Decode("message without payload".to_string()))?;
        let parsed: Value = serde_json::from_str(payload)
            .map_err(|e| ClientError::Decode(format!("non-JSON payload: {e}")))?;
        debug!("pulled one message off {}", self.queue);
        Ok(Some(parsed))
    }

    async fn purge(&self) -> Result<u64, ClientError> {
        let depth = self.queue_depth().await?;
        let resp = self
            .http
            .delete(format!(
                "{}/queues/{VHOST}/{}/contents",
                self.api_url, self.queue
            ))
            .send()
            .await
            .map_err(transport)?;
        expect_success(resp).await?;
        Ok(depth)
    }
}
