// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime configuration.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, RuntimeError};

/// Variable holding the control-plane `host:port`.
pub const RUNTIME_API_ENV: &str = "AWS_LAMBDA_RUNTIME_API";

/// Port of the local substitute server used when no control plane is configured.
pub const DEFAULT_LOCAL_PORT: u16 = 7000;

/// Developer endpoint of the local substitute server.
pub const DEFAULT_LOCAL_INVOKE_PATH: &str = "/invoke";

/// Where the runtime client sends its requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPlane {
    /// Real control plane at `host:port`
    Remote(String),
    /// Local substitute server bound to `127.0.0.1:port` (port 0 picks a free one)
    Local {
        port: u16,
        invoke_path: String,
    },
}

/// Backoff applied between failed polls.
///
/// Delay before retry `n` (1-indexed) is `base_delay_ms * 2^(n-1)`, capped at
/// `max_delay_ms`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRetryPolicy {
    /// Consecutive transient poll failures tolerated before the loop stops
    pub max_retries: u32,
    /// Base delay between retries in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound for a single delay in milliseconds
    pub max_delay_ms: u64,
}

impl PollRetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Delay before the given retry attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 2u64.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

impl Default for PollRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Control plane selection
    pub control_plane: ControlPlane,
    /// Poll retry behaviour for transport failures
    pub poll_retry: PollRetryPolicy,
}

impl RuntimeConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    /// - `AWS_LAMBDA_RUNTIME_API` - control-plane `host:port`; when unset the
    ///   local substitute server is used
    /// - `LAMBDALOOP_LOCAL_PORT` - local server port (default: 7000)
    /// - `LAMBDALOOP_LOCAL_INVOKE_PATH` - local invoke endpoint (default: "/invoke")
    /// - `LAMBDALOOP_POLL_MAX_RETRIES` - tolerated transient poll failures (default: 5)
    /// - `LAMBDALOOP_POLL_RETRY_DELAY_MS` - base backoff (default: 100)
    /// - `LAMBDALOOP_POLL_RETRY_MAX_DELAY_MS` - backoff cap (default: 5000)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let control_plane = match lookup(RUNTIME_API_ENV).filter(|v| !v.trim().is_empty()) {
            Some(addr) => ControlPlane::Remote(parse_runtime_api(&addr)?),
            None => {
                let port = parse_var(&lookup, "LAMBDALOOP_LOCAL_PORT", DEFAULT_LOCAL_PORT)?;
                let invoke_path = lookup("LAMBDALOOP_LOCAL_INVOKE_PATH")
                    .unwrap_or_else(|| DEFAULT_LOCAL_INVOKE_PATH.to_string());
                if !invoke_path.starts_with('/') {
                    return Err(RuntimeError::Config(format!(
                        "LAMBDALOOP_LOCAL_INVOKE_PATH must start with '/': {}",
                        invoke_path
                    )));
                }
                ControlPlane::Local { port, invoke_path }
            }
        };

        let defaults = PollRetryPolicy::default();
        let poll_retry = PollRetryPolicy {
            max_retries: parse_var(&lookup, "LAMBDALOOP_POLL_MAX_RETRIES", defaults.max_retries)?,
            base_delay_ms: parse_var(
                &lookup,
                "LAMBDALOOP_POLL_RETRY_DELAY_MS",
                defaults.base_delay_ms,
            )?,
            max_delay_ms: parse_var(
                &lookup,
                "LAMBDALOOP_POLL_RETRY_MAX_DELAY_MS",
                defaults.max_delay_ms,
            )?,
        };

        Ok(Self {
            control_plane,
            poll_retry,
        })
    }

    /// Configuration pointing at a real control plane.
    pub fn remote(runtime_api: impl Into<String>) -> Self {
        Self {
            control_plane: ControlPlane::Remote(runtime_api.into()),
            poll_retry: PollRetryPolicy::default(),
        }
    }

    /// Configuration for local development against the substitute server.
    pub fn local() -> Self {
        Self {
            control_plane: ControlPlane::Local {
                port: DEFAULT_LOCAL_PORT,
                invoke_path: DEFAULT_LOCAL_INVOKE_PATH.to_string(),
            },
            poll_retry: PollRetryPolicy::default(),
        }
    }

    /// Set the local server port. Has no effect on a remote configuration.
    pub fn with_local_port(mut self, new_port: u16) -> Self {
        if let ControlPlane::Local { port, .. } = &mut self.control_plane {
            *port = new_port;
        }
        self
    }

    /// Set the poll retry policy.
    pub fn with_poll_retry(mut self, policy: PollRetryPolicy) -> Self {
        self.poll_retry = policy;
        self
    }

    /// Whether the local substitute server backs this configuration.
    pub fn is_local(&self) -> bool {
        matches!(self.control_plane, ControlPlane::Local { .. })
    }
}

/// `default` when `key` is unset, a `Config` error when it does not parse.
fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|e| RuntimeError::Config(format!("invalid {}: {}", key, e))),
        None => Ok(default),
    }
}

/// Accepts `host:port`, tolerating a leading `http://` and trailing slash.
fn parse_runtime_api(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let addr = trimmed
        .strip_prefix("http://")
        .unwrap_or(trimmed)
        .trim_end_matches('/');

    let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
        RuntimeError::Config(format!("{} must be host:port, got {}", RUNTIME_API_ENV, raw))
    })?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(RuntimeError::Config(format!(
            "invalid {}: {}",
            RUNTIME_API_ENV, raw
        )));
    }
    Ok(addr.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_remote_from_lookup() {
        let config = RuntimeConfig::from_lookup(lookup(&[(RUNTIME_API_ENV, "127.0.0.1:9001")]))
            .unwrap();
        assert_eq!(
            config.control_plane,
            ControlPlane::Remote("127.0.0.1:9001".into())
        );
        assert!(!config.is_local());
    }

    #[test]
    fn test_local_when_runtime_api_absent() {
        let config = RuntimeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(
            config.control_plane,
            ControlPlane::Local {
                port: DEFAULT_LOCAL_PORT,
                invoke_path: "/invoke".into()
            }
        );
    }

    #[test]
    fn test_blank_runtime_api_means_local() {
        let config = RuntimeConfig::from_lookup(lookup(&[(RUNTIME_API_ENV, "  ")])).unwrap();
        assert!(config.is_local());
    }

    #[test]
    fn test_runtime_api_with_scheme() {
        let config =
            RuntimeConfig::from_lookup(lookup(&[(RUNTIME_API_ENV, "http://localhost:9001/")]))
                .unwrap();
        assert_eq!(
            config.control_plane,
            ControlPlane::Remote("localhost:9001".into())
        );
    }

    #[test]
    fn test_invalid_runtime_api() {
        let err = RuntimeConfig::from_lookup(lookup(&[(RUNTIME_API_ENV, "no-port")])).unwrap_err();
        assert!(matches!(err, RuntimeError::Config(_)));
    }

    #[test]
    fn test_invalid_local_port() {
        let err = RuntimeConfig::from_lookup(lookup(&[("LAMBDALOOP_LOCAL_PORT", "seventy")]))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Config(_)));
    }

    #[test]
    fn test_invalid_poll_retry_setting() {
        for key in [
            "LAMBDALOOP_POLL_MAX_RETRIES",
            "LAMBDALOOP_POLL_RETRY_DELAY_MS",
            "LAMBDALOOP_POLL_RETRY_MAX_DELAY_MS",
        ] {
            let err = RuntimeConfig::from_lookup(lookup(&[(key, "5s")])).unwrap_err();
            match err {
                RuntimeError::Config(msg) => assert!(msg.contains(key), "{msg}"),
                other => panic!("expected config error for {key}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_poll_retry_overrides() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("LAMBDALOOP_POLL_MAX_RETRIES", "2"),
            ("LAMBDALOOP_POLL_RETRY_DELAY_MS", "10"),
        ]))
        .unwrap();
        assert_eq!(config.poll_retry.max_retries, 2);
        assert_eq!(config.poll_retry.base_delay_ms, 10);
        assert_eq!(config.poll_retry.max_delay_ms, 5_000);
    }

    #[test]
    fn test_retry_delay_backoff_and_cap() {
        let policy = PollRetryPolicy::new(5, 100, 350);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }
}
