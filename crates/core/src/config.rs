use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_usize(profile: &str, key: &str, default: usize) -> usize {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    match profiled_env_opt(profile, key) {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Active profile name (empty = default).
    pub profile: String,
    pub collector: CollectorConfig,
    pub dispatch: DispatchConfig,
    pub scan: ScanConfig,
    pub lifecycle: LifecycleConfig,
}

impl RelayConfig {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `RELAY_PROFILE`. When set (e.g. `PROD`), every key
    /// is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("RELAY_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            collector: CollectorConfig::from_env_profiled(p),
            dispatch: DispatchConfig::from_env_profiled(p),
            scan: ScanConfig::from_env_profiled(p),
            lifecycle: LifecycleConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dispatch.validate()?;
        if self.lifecycle.dedup_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "DEDUP_CAPACITY",
                reason: "must be at least 1".into(),
            });
        }
        if self.scan.interval_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "SCAN_INTERVAL_SECS",
                reason: "must be at least 1".into(),
            });
        }
        if !self.collector.url.starts_with("http://") && !self.collector.url.starts_with("https://") {
            return Err(ConfigError::Invalid {
                key: "COLLECTOR_URL",
                reason: format!("expected an http(s) URL, got '{}'", self.collector.url),
            });
        }
        Ok(())
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  collector:   url={}, token={}, timeout_ms={}",
            self.collector.url,
            if self.collector.token.is_some() { "(set)" } else { "(none)" },
            self.collector.timeout_ms
        );
        tracing::info!(
            "  dispatch:    max_attempts={}, backoff={}..{}ms, concurrency={}",
            self.dispatch.max_attempts,
            self.dispatch.base_backoff_ms,
            self.dispatch.max_backoff_ms,
            self.dispatch.max_concurrent_sends
        );
        tracing::info!(
            "  scan:        interval={}s, initial_delay={}s",
            self.scan.interval_secs,
            self.scan.initial_delay_secs
        );
        tracing::info!(
            "  lifecycle:   dedup_capacity={}, stop_on_suspend={}",
            self.lifecycle.dedup_capacity,
            self.lifecycle.stop_on_suspend
        );
    }
}

// ── Collector ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Base URL; records are posted to `{url}/events`.
    pub url: String,
    pub token: Option<String>,
    pub timeout_ms: u64,
}

impl CollectorConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            url: profiled_env_or(p, "COLLECTOR_URL", "http://127.0.0.1:8080"),
            token: profiled_env_opt(p, "COLLECTOR_TOKEN"),
            timeout_ms: profiled_env_u64(p, "COLLECTOR_TIMEOUT_MS", 15_000),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ── Dispatch ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Total send attempts per record, the first one included.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_concurrent_sends: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            max_concurrent_sends: 4,
        }
    }
}

impl DispatchConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            max_attempts: profiled_env_u32(p, "DISPATCH_MAX_ATTEMPTS", d.max_attempts),
            base_backoff_ms: profiled_env_u64(p, "DISPATCH_BASE_BACKOFF_MS", d.base_backoff_ms),
            max_backoff_ms: profiled_env_u64(p, "DISPATCH_MAX_BACKOFF_MS", d.max_backoff_ms),
            max_concurrent_sends: profiled_env_usize(
                p,
                "DISPATCH_MAX_CONCURRENT_SENDS",
                d.max_concurrent_sends,
            ),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "DISPATCH_MAX_ATTEMPTS",
                reason: "must be at least 1".into(),
            });
        }
        if self.max_concurrent_sends == 0 {
            return Err(ConfigError::Invalid {
                key: "DISPATCH_MAX_CONCURRENT_SENDS",
                reason: "must be at least 1".into(),
            });
        }
        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::Invalid {
                key: "DISPATCH_BASE_BACKOFF_MS",
                reason: format!(
                    "base backoff {}ms exceeds cap {}ms",
                    self.base_backoff_ms, self.max_backoff_ms
                ),
            });
        }
        Ok(())
    }
}

// ── Scheduled scan ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConfig {
    pub interval_secs: u64,
    pub initial_delay_secs: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            initial_delay_secs: 5,
        }
    }
}

impl ScanConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            interval_secs: profiled_env_u64(p, "SCAN_INTERVAL_SECS", d.interval_secs),
            initial_delay_secs: profiled_env_u64(p, "SCAN_INITIAL_DELAY_SECS", d.initial_delay_secs),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }
}

// ── Lifecycle ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    pub dedup_capacity: usize,
    /// Stop the sources when the host is suspended. Off by default.
    pub stop_on_suspend: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: 1024,
            stop_on_suspend: false,
        }
    }
}

impl LifecycleConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            dedup_capacity: profiled_env_usize(p, "DEDUP_CAPACITY", d.dedup_capacity),
            stop_on_suspend: profiled_env_bool(p, "STOP_ON_SUSPEND", d.stop_on_suspend),
        }
    }
}
