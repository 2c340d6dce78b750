//! Layered YAML configuration for the queue daemon.
//!
//! Files merge in order (later overrides earlier via deep-merge), the merged
//! tree is canonicalized and hashed for the startup log, and the typed
//! [`QueueConfig`] is extracted from it. String values of the form
//! `env:NAME` resolve from the environment at load time so credentials stay
//! out of the files themselves.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

// ---------------------------------------------------------------------------
// Typed config
// ---------------------------------------------------------------------------

fn default_poll_interval() -> u64 {
    60
}

fn default_pump_interval() -> u64 {
    5
}

fn default_timeout() -> u64 {
    30
}

fn default_dead_letter_path() -> String {
    "failed_comments.log".to_string()
}

fn default_routing_key() -> String {
    "hgpusher".to_string()
}

/// Bug tracker endpoint and credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    pub api_url: String,
    pub attachment_url: String,
    pub username: String,
    pub password: String,
    /// Seconds between whiteboard scans.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Group-membership oracle endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
    pub url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Message broker HTTP API endpoint plus exchange/queue names.
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    pub api_url: String,
    pub exchange: String,
    pub queue: String,
    #[serde(default = "default_routing_key")]
    pub routing_key: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub database_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_pump_interval")]
    pub pump_interval_secs: u64,
    #[serde(default = "default_dead_letter_path")]
    pub dead_letter_path: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pump_interval_secs: default_pump_interval(),
            dead_letter_path: default_dead_letter_path(),
        }
    }
}

/// The full typed configuration for one daemon instance.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub tracker: TrackerConfig,
    pub oracle: OracleConfig,
    pub bus: BusConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl QueueConfig {
    /// Extract the typed config from an already-merged tree.
    pub fn from_value(merged: &Value) -> Result<Self> {
        let resolved = resolve_secrets(merged)?;
        let cfg: QueueConfig =
            serde_json::from_value(resolved).context("config does not match expected shape")?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.tracker.poll_interval_secs == 0 {
            bail!("tracker.poll_interval_secs must be > 0");
        }
        if self.daemon.pump_interval_secs == 0 {
            bail!("daemon.pump_interval_secs must be > 0");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Layered load + hash
// ---------------------------------------------------------------------------

/// The merged tree plus its canonical hash (logged at startup; secrets are
/// resolved only into the typed view, never into the hashed tree).
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: QueueConfig,
    pub config_hash: String,
}

/// Load + merge YAML files in order; missing optional layers are skipped.
/// The first path is required.
pub fn load_layered(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());
    let mut seen_any = false;

    for (i, p) in paths.iter().enumerate() {
        let s = match fs::read_to_string(p) {
            Ok(s) => s,
            Err(e) if i > 0 && e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).with_context(|| format!("read config: {p}")),
        };
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {p}"))?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
        seen_any = true;
    }

    if !seen_any {
        bail!("no config file found (looked for: {})", paths.join(", "));
    }

    let canonical = canonicalize_json(&merged);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Ok(LoadedConfig {
        config: QueueConfig::from_value(&merged)?,
        config_hash: hash,
    })
}

/// Deep-merge: objects merge recursively; arrays replaced; scalars overwritten.
fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

/// Canonicalize JSON by sorting all object keys recursively and emitting
/// compact JSON, so the hash is stable across layer orderings that produce
/// the same tree.
fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

// ---------------------------------------------------------------------------
// Secrets
// ---------------------------------------------------------------------------

/// Replace every string leaf of the form `env:NAME` with the value of the
/// `NAME` environment variable. Fails loudly when the variable is unset.
fn resolve_secrets(v: &Value) -> Result<Value> {
    Ok(match v {
        Value::String(s) => match s.strip_prefix("env:") {
            Some(var) => Value::String(
                std::env::var(var).with_context(|| format!("secret env var {var} is unset"))?,
            ),
            None => v.clone(),
        },
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, val) in map {
                out.insert(k.clone(), resolve_secrets(val)?);
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(resolve_secrets).collect::<Result<_>>()?),
        _ => v.clone(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn base_tree() -> Value {
        json!({
            "tracker": {
                "api_url": "https://bugs.example.org/rest",
                "attachment_url": "https://bugs.example.org/attachment.cgi",
                "username": "autoland@example.org",
                "password": "hunter2"
            },
            "oracle": { "url": "https://groups.example.org" },
            "bus": {
                "api_url": "http://mq.example.org:15672/api",
                "exchange": "autoland",
                "queue": "autoland-queue"
            },
            "store": { "database_url": "postgres://localhost/autoland" }
        })
    }

    #[test]
    fn typed_config_applies_defaults() {
        let cfg = QueueConfig::from_value(&base_tree()).unwrap();
        assert_eq!(cfg.tracker.poll_interval_secs, 60);
        assert_eq!(cfg.daemon.pump_interval_secs, 5);
        assert_eq!(cfg.daemon.dead_letter_path, "failed_comments.log");
        assert_eq!(cfg.bus.routing_key, "hgpusher");
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let mut tree = base_tree();
        tree["tracker"]["poll_interval_secs"] = json!(0);
        assert!(QueueConfig::from_value(&tree).is_err());
    }

    #[test]
    fn env_indirection_resolves() {
        std::env::set_var("ALQ_TEST_TRACKER_PW", "s3cret");
        let mut tree = base_tree();
        tree["tracker"]["password"] = json!("env:ALQ_TEST_TRACKER_PW");
        let cfg = QueueConfig::from_value(&tree).unwrap();
        assert_eq!(cfg.tracker.password, "s3cret");
    }

    #[test]
    fn unset_env_indirection_fails() {
        let mut tree = base_tree();
        tree["tracker"]["password"] = json!("env:ALQ_TEST_DEFINITELY_UNSET");
        assert!(QueueConfig::from_value(&tree).is_err());
    }

    #[test]
    fn later_layers_override_earlier() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("config.yaml");
        let local = dir.path().join("config.local.yaml");

        let mut f = fs::File::create(&base).unwrap();
        write!(
            f,
            "tracker:\n  api_url: https://bugs.example.org/rest\n  attachment_url: https://bugs.example.org/attachment.cgi\n  username: autoland@example.org\n  password: hunter2\noracle:\n  url: https://groups.example.org\nbus:\n  api_url: http://mq.example.org:15672/api\n  exchange: autoland\n  queue: autoland-queue\nstore:\n  database_url: postgres://localhost/autoland\n"
        )
        .unwrap();

        let mut f = fs::File::create(&local).unwrap();
        write!(f, "tracker:\n  poll_interval_secs: 10\n").unwrap();

        let loaded = load_layered(&[
            base.to_str().unwrap(),
            local.to_str().unwrap(),
            dir.path().join("missing.yaml").to_str().unwrap(),
        ])
        .unwrap();
        assert_eq!(loaded.config.tracker.poll_interval_secs, 10);
        assert_eq!(loaded.config.tracker.username, "autoland@example.org");
        assert_eq!(loaded.config_hash.len(), 64);
    }

    #[test]
    fn hash_is_stable_for_identical_trees() {
        let a = canonicalize_json(&base_tree());
        let b = canonicalize_json(&base_tree());
        assert_eq!(a, b);
    }
}
