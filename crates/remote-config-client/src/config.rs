//! Poller configuration and its environment bindings.
//!
//! [`PollerConfig::from_os_env`] reads the `DD_*` variables a tracer exposes
//! for remote configuration; [`PollerConfig::from_env_iter`] does the same from
//! an explicit iterator so tests never touch the process environment.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use tracing::warn;

const ENV_ENABLED: &str = "DD_REMOTE_CONFIGURATION_ENABLED";
const ENV_INTEGRITY_CHECK_ENABLED: &str = "DD_REMOTE_CONFIG_INTEGRITY_CHECK_ENABLED";
const ENV_URL: &str = "DD_REMOTE_CONFIG_URL";
const ENV_AGENT_URL: &str = "DD_TRACE_AGENT_URL";
const ENV_POLL_INTERVAL: &str = "DD_REMOTE_CONFIG_POLL_INTERVAL_SECONDS";
/// Response size cap, in KiB.
const ENV_MAX_PAYLOAD_SIZE: &str = "DD_REMOTE_CONFIG_MAX_PAYLOAD_SIZE";
const ENV_TARGETS_KEY_ID: &str = "DD_RC_TARGETS_KEY_ID";
const ENV_TARGETS_KEY: &str = "DD_RC_TARGETS_KEY";
const ENV_SERVICE: &str = "DD_SERVICE";
const ENV_ENV: &str = "DD_ENV";
const ENV_VERSION: &str = "DD_VERSION";
const ENV_TAGS: &str = "DD_TAGS";

pub const DEFAULT_AGENT_URL: &str = "http://localhost:8126";
pub const CONFIG_ENDPOINT_PATH: &str = "/v0.7/config";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 5120 * 1024;
/// Key id of the production targets signing key.
pub const DEFAULT_TARGETS_KEY_ID: &str =
    "ed7672c9a24abda78872ee32ee71c7cb1d5235e8db4ecbf1ca28b9c50eb75d9e";
/// Hex Ed25519 public key matching [`DEFAULT_TARGETS_KEY_ID`].
pub const DEFAULT_TARGETS_KEY: &str =
    "e3f1f98c9da02a93bb547f448b472d727e14b22455235796fe49863856252508";
pub const DEFAULT_LANGUAGE: &str = "rust";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerConfig {
    /// When false, starting the poller is a no-op.
    pub enabled: bool,
    /// Verify the targets signature and file presence on every response.
    pub integrity_check_enabled: bool,
    /// Explicit endpoint URL; takes precedence over `agent_url`.
    pub url: Option<String>,
    pub agent_url: String,
    pub poll_interval: Duration,
    /// Maximum accepted response (and config file) size in bytes.
    pub max_payload_size: usize,
    pub targets_key_id: String,
    pub targets_key: String,
    pub runtime_id: String,
    pub language: String,
    pub tracer_version: String,
    pub service: String,
    pub env: String,
    pub app_version: String,
    pub tags: Vec<String>,
    pub container_id: Option<String>,
    pub entity_id: Option<String>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            integrity_check_enabled: true,
            url: None,
            agent_url: DEFAULT_AGENT_URL.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            targets_key_id: DEFAULT_TARGETS_KEY_ID.to_string(),
            targets_key: DEFAULT_TARGETS_KEY.to_string(),
            runtime_id: uuid::Uuid::new_v4().to_string(),
            language: DEFAULT_LANGUAGE.to_string(),
            tracer_version: env!("CARGO_PKG_VERSION").to_string(),
            service: String::new(),
            env: String::new(),
            app_version: String::new(),
            tags: Vec::new(),
            container_id: None,
            entity_id: None,
        }
    }
}

impl PollerConfig {
    pub fn from_os_env() -> Self {
        Self::from_env_iter(env::vars())
    }

    /// Builds a configuration from key/value pairs, falling back to defaults
    /// for anything absent or unparsable.
    pub fn from_env_iter<I, K, V>(iter: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let get = |name: &str| map.get(name).and_then(|value| sanitize_non_empty(value));
        let defaults = Self::default();

        let poll_interval = match get(ENV_POLL_INTERVAL) {
            Some(raw) => parse_seconds(&raw).unwrap_or_else(|| {
                warn!("remote-config: ignoring invalid {ENV_POLL_INTERVAL} value '{raw}'");
                defaults.poll_interval
            }),
            None => defaults.poll_interval,
        };
        let max_payload_size = match get(ENV_MAX_PAYLOAD_SIZE) {
            Some(raw) => raw
                .parse::<usize>()
                .ok()
                .and_then(|kib| kib.checked_mul(1024))
                .unwrap_or_else(|| {
                    warn!("remote-config: ignoring invalid {ENV_MAX_PAYLOAD_SIZE} value '{raw}'");
                    defaults.max_payload_size
                }),
            None => defaults.max_payload_size,
        };

        Self {
            enabled: parse_bool(map.get(ENV_ENABLED).map(String::as_str), defaults.enabled),
            integrity_check_enabled: parse_bool(
                map.get(ENV_INTEGRITY_CHECK_ENABLED).map(String::as_str),
                defaults.integrity_check_enabled,
            ),
            url: get(ENV_URL),
            agent_url: get(ENV_AGENT_URL).unwrap_or(defaults.agent_url),
            poll_interval,
            max_payload_size,
            targets_key_id: get(ENV_TARGETS_KEY_ID).unwrap_or(defaults.targets_key_id),
            targets_key: get(ENV_TARGETS_KEY).unwrap_or(defaults.targets_key),
            service: get(ENV_SERVICE).unwrap_or_default(),
            env: get(ENV_ENV).unwrap_or_default(),
            app_version: get(ENV_VERSION).unwrap_or_default(),
            tags: get(ENV_TAGS).map(|raw| parse_tags(&raw)).unwrap_or_default(),
            ..defaults
        }
        .sanitise()
    }

    /// Clamps out-of-range values, logging each correction.
    pub fn sanitise(mut self) -> Self {
        if self.poll_interval < MIN_POLL_INTERVAL {
            warn!(
                "remote-config: poll interval {:?} is below the minimum {:?}; using the minimum",
                self.poll_interval, MIN_POLL_INTERVAL
            );
            self.poll_interval = MIN_POLL_INTERVAL;
        } else if self.poll_interval > MAX_POLL_INTERVAL {
            warn!(
                "remote-config: poll interval {:?} exceeds the maximum {:?}; using the maximum",
                self.poll_interval, MAX_POLL_INTERVAL
            );
            self.poll_interval = MAX_POLL_INTERVAL;
        }
        if self.max_payload_size == 0 {
            warn!(
                "remote-config: max payload size must be positive; using {} bytes",
                DEFAULT_MAX_PAYLOAD_SIZE
            );
            self.max_payload_size = DEFAULT_MAX_PAYLOAD_SIZE;
        }
        self
    }

    /// URL polled for configurations.
    pub fn endpoint(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!(
                "{}{CONFIG_ENDPOINT_PATH}",
                self.agent_url.trim_end_matches('/')
            ),
        }
    }
}

fn sanitize_non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_bool(value: Option<&str>, default: bool) -> bool {
    match value.map(|s| s.trim().to_ascii_lowercase()) {
        Some(ref v) if ["1", "true", "t", "yes", "y"].contains(&v.as_str()) => true,
        Some(ref v) if ["0", "false", "f", "no", "n"].contains(&v.as_str()) => false,
        _ => default,
    }
}

fn parse_seconds(raw: &str) -> Option<Duration> {
    let seconds: f64 = raw.parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(seconds))
}

/// Splits `DD_TAGS` on commas and whitespace.
fn parse_tags(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}
