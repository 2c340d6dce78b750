//! Bugzilla REST client implementing the [`Tracker`] contract.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use alq_config::TrackerConfig;
use alq_queue::clients::{Attachment, AttachmentFlag, BugHit, ClientError, Tracker};
use alq_schemas::UserRecord;

use crate::{expect_success, transport};

/// Attempts `notify_bug` makes before reporting failure to the outbox layer.
const NOTIFY_RETRIES: u32 = 3;
const NOTIFY_BACKOFF: Duration = Duration::from_secs(2);

pub struct BugzillaTracker {
    http: reqwest::Client,
    api_url: String,
    username: String,
    password: String,
}

impl BugzillaTracker {
    pub fn new(cfg: &TrackerConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            http,
            api_url: cfg.api_url.trim_end_matches('/').to_string(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
        }
    }

    fn auth(&self) -> [(&'static str, &str); 2] {
        [
            ("Bugzilla_login", self.username.as_str()),
            ("Bugzilla_password", self.password.as_str()),
        ]
    }

    async fn get_json(&self, path: &str, query: &[(&str, &str)]) -> Result<Value, ClientError> {
        let resp = self
            .http
            .get(format!("{}/{path}", self.api_url))
            .query(&self.auth())
            .query(query)
            .send()
            .await
            .map_err(transport)?;
        expect_success(resp)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))
    }

    async fn whiteboard_of(&self, bug_id: i64) -> Result<String, ClientError> {
        let v = self
            .get_json(&format!("bug/{bug_id}"), &[("include_fields", "whiteboard")])
            .await?;
        v.pointer("/bugs/0/whiteboard")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ClientError::Decode("bug response missing whiteboard".to_string()))
    }

    async fn set_whiteboard(&self, bug_id: i64, whiteboard: &str) -> Result<(), ClientError> {
        let resp = self
            .http
            .put(format!("{}/bug/{bug_id}", self.api_url))
            .query(&self.auth())
            .json(&json!({ "whiteboard": whiteboard }))
            .send()
            .await
            .map_err(transport)?;
        expect_success(resp).await.map(|_| ())
    }
}

#[derive(Deserialize)]
struct WireFlag {
    name: String,
    #[serde(default)]
    setter: String,
    status: String,
}

#[derive(Deserialize)]
struct WireAttachment {
    id: i64,
    #[serde(default)]
    attacher: String,
    #[serde(default)]
    is_patch: u8,
    #[serde(default)]
    is_obsolete: u8,
    #[serde(default)]
    flags: Vec<WireFlag>,
}

impl From<WireAttachment> for Attachment {
    fn from(w: WireAttachment) -> Self {
        Attachment {
            id: w.id,
            attacher: w.attacher,
            is_patch: w.is_patch != 0,
            is_obsolete: w.is_obsolete != 0,
            flags: w
                .flags
                .into_iter()
                .map(|f| AttachmentFlag {
                    name: f.name,
                    setter: f.setter,
                    status: f.status,
                })
                .collect(),
        }
    }
}

#[async_trait]
impl Tracker for BugzillaTracker {
    async fn search_whiteboard(&self, pattern: &str) -> Result<Vec<BugHit>, ClientError> {
        let v = self
            .get_json(
                "bug",
                &[
                    ("whiteboard", pattern),
                    ("whiteboard_type", "regexp"),
                    ("include_fields", "id,whiteboard"),
                ],
            )
            .await?;
        let bugs = v
            .get("bugs")
            .and_then(Value::as_array)
            .ok_or_else(|| ClientError::Decode("search response missing bugs".to_string()))?;
        Ok(bugs
            .iter()
            .filter_map(|b| {
                Some(BugHit {
                    bug_id: b.get("id")?.as_i64()?,
                    whiteboard: b.get("whiteboard")?.as_str()?.to_string(),
                })
            })
            .collect())
    }

    async fn bug_attachments(&self, bug_id: i64) -> Result<Vec<Attachment>, ClientError> {
        let v = self
            .get_json(
                &format!("bug/{bug_id}/attachment"),
                &[("exclude_fields", "data")],
            )
            .await?;
        let list = v
            .pointer(&format!("/bugs/{bug_id}"))
            .cloned()
            .unwrap_or_else(|| Value::Array(vec![]));
        let wire: Vec<WireAttachment> =
            serde_json::from_value(list).map_err(|e| ClientError::Decode(e.to_string()))?;
        Ok(wire.into_iter().map(Attachment::from).collect())
    }

    async fn user_info(&self, login: &str) -> Result<UserRecord, ClientError> {
        let v = self
            .get_json(
                &format!("user/{login}"),
                &[("include_fields", "real_name,email")],
            )
            .await?;
        let user = v
            .pointer("/users/0")
            .ok_or_else(|| ClientError::Decode(format!("no user record for {login}")))?;
        Ok(UserRecord {
            name: user
                .get("real_name")
                .and_then(Value::as_str)
                .unwrap_or(login)
                .to_string(),
            email: user
                .get("email")
                .and_then(Value::as_str)
                .unwrap_or(login)
                .to_string(),
        })
    }

    async fn notify_bug(&self, bug_id: i64, comment: &str) -> Result<(), ClientError> {
        let mut last_err = None;
        for attempt in 1..=NOTIFY_RETRIES {
            let result = self
                .http
                .post(format!("{}/bug/{bug_id}/comment", self.api_url))
                .query(&self.auth())
                .json(&json!({ "comment": comment }))
                .send()
                .await
                .map_err(transport);
            match result {
                Ok(resp) => match expect_success(resp).await {
                    Ok(_) => return Ok(()),
                    Err(e) => last_err = Some(e),
                },
                Err(e) => last_err = Some(e),
            }
            if attempt < NOTIFY_RETRIES {
                warn!(bug = bug_id, attempt, "comment post failed, retrying");
                tokio::time::sleep(NOTIFY_BACKOFF).await;
            }
        }
        Err(last_err.expect("at least one attempt was made"))
    }

    async fn remove_whiteboard_tag(&self, pattern: &str, bug_id: i64) -> Result<(), ClientError> {
        let re = regex_for(pattern)?;
        let wb = self.whiteboard_of(bug_id).await?;
        let stripped = re.replace_all(&wb, "").trim().to_string();
        if stripped != wb {
            self.set_whiteboard(bug_id, &stripped).await?;
        }
        Ok(())
    }

    async fn replace_whiteboard_tag(
        &self,
        pattern: &str,
        replacement: &str,
        bug_id: i64,
    ) -> Result<(), ClientError> {
        let re = regex_for(pattern)?;
        let wb = self.whiteboard_of(bug_id).await?;
        let rewritten = re.replace(&wb, replacement).to_string();
        if rewritten != wb {
            self.set_whiteboard(bug_id, &rewritten).await?;
        }
        Ok(())
    }
}

fn regex_for(pattern: &str) -> Result<regex::Regex, ClientError> {
    regex::Regex::new(pattern).map_err(|e| ClientError::Api(format!("bad tag pattern: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
