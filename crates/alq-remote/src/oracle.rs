//! Group-membership oracle over its HTTP lookup endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use alq_config::OracleConfig;
use alq_queue::clients::{ClientError, PermissionOracle};

use crate::{expect_success, transport};

pub struct HttpOracle {
    http: reqwest::Client,
    url: String,
}

impl HttpOracle {
    pub fn new(cfg: &OracleConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            http,
            url: cfg.url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PermissionOracle for HttpOracle {
    async fn is_member(&self, email: &str, group: &str) -> Result<bool, ClientError> {
        let resp = self
            .http
            .get(format!("{}/group/{group}/member", self.url))
            .query(&[("email", email)])
            .send()
            .await
            .map_err(transport)?;
        let v: Value = expect_success(resp)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        v.get("member")
            .and_then(Value::as_bool)
            .ok_or_else(|| ClientError::Decode("membership response missing 'member'".to_string()))
    }
}
