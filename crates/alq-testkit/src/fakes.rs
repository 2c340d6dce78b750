//! Scripted in-process stand-ins for the tracker, the permission oracle,
//! and the message broker.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use alq_queue::clients::{
    Attachment, BugHit, ClientError, MessageBus, PermissionOracle, Tracker,
};
use alq_schemas::{PushJob, UserRecord};

// ---------------------------------------------------------------------------
// FakeTracker
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TrackerState {
    whiteboards: HashMap<i64, String>,
    attachments: HashMap<i64, Vec<Attachment>>,
    users: HashMap<String, UserRecord>,
    posted: Vec<(i64, String)>,
    /// Fail this many upcoming notify calls.
    notify_failures: u32,
}

pub struct FakeTracker {
    state: Mutex<TrackerState>,
}

impl FakeTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn set_whiteboard(&self, bug_id: i64, whiteboard: &str) {
        self.state
            .lock()
            .unwrap()
            .whiteboards
            .insert(bug_id, whiteboard.to_string());
    }

    pub fn whiteboard(&self, bug_id: i64) -> Option<String> {
        self.state.lock().unwrap().whiteboards.get(&bug_id).cloned()
    }

    pub fn add_attachment(&self, bug_id: i64, attachment: Attachment) {
        self.state
            .lock()
            .unwrap()
            .attachments
            .entry(bug_id)
            .or_default()
            .push(attachment);
    }

    pub fn add_user(&self, login: &str, name: &str, email: &str) {
        self.state.lock().unwrap().users.insert(
            login.to_string(),
            UserRecord {
                name: name.to_string(),
                email: email.to_string(),
            },
        );
    }

    /// Make the next `n` notify calls fail (then succeed again).
    pub fn fail_next_notifies(&self, n: u32) {
        self.state.lock().unwrap().notify_failures = n;
    }

    /// Comments successfully delivered, in order.
    pub fn posted(&self) -> Vec<(i64, String)> {
        self.state.lock().unwrap().posted.clone()
    }
}

impl Default for FakeTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tracker for FakeTracker {
    async fn search_whiteboard(&self, pattern: &str) -> Result<Vec<BugHit>, ClientError> {
        let re = Regex::new(pattern).map_err(|e| ClientError::Api(e.to_string()))?;
        let state = self.state.lock().unwrap();
        let mut hits: Vec<BugHit> = state
            .whiteboards
            .iter()
            .filter(|(_, wb)| re.is_match(wb))
            .map(|(&bug_id, wb)| BugHit {
                bug_id,
                whiteboard: wb.clone(),
            })
            .collect();
        hits.sort_by_key(|h| h.bug_id);
        Ok(hits)
    }

    async fn bug_attachments(&self, bug_id: i64) -> Result<Vec<Attachment>, ClientError> {
        let state = self.state.lock().unwrap();
        Ok(state.attachments.get(&bug_id).cloned().unwrap_or_default())
    }

    async fn user_info(&self, login: &str) -> Result<UserRecord, ClientError> {
        let state = self.state.lock().unwrap();
        Ok(state.users.get(login).cloned().unwrap_or_else(|| UserRecord {
            name: login.to_string(),
            email: login.to_string(),
        }))
    }

    async fn notify_bug(&self, bug_id: i64, comment: &str) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        if state.notify_failures > 0 {
            state.notify_failures -= 1;
            return Err(ClientError::Transport("tracker unreachable".to_string()));
        }
        state.posted.push((bug_id, comment.to_string()));
        Ok(())
    }

    async fn remove_whiteboard_tag(&self, pattern: &str, bug_id: i64) -> Result<(), ClientError> {
        let re = Regex::new(pattern).map_err(|e| ClientError::Api(e.to_string()))?;
        let mut state = self.state.lock().unwrap();
        if let Some(wb) = state.whiteboards.get_mut(&bug_id) {
            *wb = re.replace_all(wb, "").trim().to_string();
        }
        Ok(())
    }

    async fn replace_whiteboard_tag(
        &self,
        pattern: &str,
        replacement: &str,
        bug_id: i64,
    ) -> Result<(), ClientError> {
        let re = Regex::new(pattern).map_err(|e| ClientError::Api(e.to_string()))?;
        let mut state = self.state.lock().unwrap();
        if let Some(wb) = state.whiteboards.get_mut(&bug_id) {
            *wb = re.replace(wb, replacement).to_string();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeOracle
// ---------------------------------------------------------------------------

pub struct FakeOracle {
    members: Mutex<HashSet<(String, String)>>,
}

impl FakeOracle {
    pub fn new() -> Self {
        Self {
            members: Mutex::new(HashSet::new()),
        }
    }

    pub fn add_member(&self, group: &str, email: &str) {
        self.members
            .lock()
            .unwrap()
            .insert((group.to_string(), email.to_string()));
    }
}

impl Default for FakeOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PermissionOracle for FakeOracle {
    async fn is_member(&self, email: &str, group: &str) -> Result<bool, ClientError> {
        Ok(self
            .members
            .lock()
            .unwrap()
            .contains(&(group.to_string(), email.to_string())))
    }
}

// ---------------------------------------------------------------------------
// FakeBus
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BusState {
    inbound: VecDeque<Value>,
    published: Vec<(String, PushJob)>,
}

pub struct FakeBus {
    state: Mutex<BusState>,
}

impl FakeBus {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BusState::default()),
        }
    }

    /// Queue a payload for the daemon to consume.
    pub fn push_inbound(&self, payload: Value) {
        self.state.lock().unwrap().inbound.push_back(payload);
    }

    /// Jobs the daemon published, with their routing keys.
    pub fn published(&self) -> Vec<(String, PushJob)> {
        self.state.lock().unwrap().published.clone()
    }
}

impl Default for FakeBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for FakeBus {
    async fn publish(&self, routing_key: &str, job: &PushJob) -> Result<(), ClientError> {
        self.state
            .lock()
            .unwrap()
            .published
            .push((routing_key.to_string(), job.clone()));
        Ok(())
    }

    async fn poll(&self) -> Result<Option<Value>, ClientError> {
        Ok(self.state.lock().unwrap().inbound.pop_front())
    }

    async fn purge(&self) -> Result<u64, ClientError> {
        let mut state = self.state.lock().unwrap();
        let n = state.inbound.len() as u64;
        state.inbound.clear();
        Ok(n)
    }
}
