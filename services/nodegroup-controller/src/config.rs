//! Configuration for the node-group controller.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use groupscale_naming::GroupName;
use groupscale_reconcile::{RetryPolicy, DEFAULT_MAX_RETRIES, DEFAULT_WORKERS};
use groupscale_workqueue::{
    BucketRateLimiter, ItemExponentialFailureRateLimiter, Key, MaxOfRateLimiter,
};

use crate::controller::{ControllerSettings, DEFAULT_GROUP_LABEL, DEFAULT_NAMESPACE};

/// Node-group controller configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Namespace holding backing controllers.
    pub namespace: String,

    /// Label that assigns members to groups.
    pub group_label: String,

    /// Workers per queue.
    pub workers: usize,

    /// Seconds between resyncs of every known group.
    pub resync_interval_secs: u64,

    /// Base per-key backoff in milliseconds.
    pub backoff_base_ms: u64,

    /// Maximum per-key backoff in seconds.
    pub backoff_max_secs: u64,

    /// Overall requeue rate.
    pub qps: f64,

    /// Overall requeue burst.
    pub burst: u32,

    /// Attempts per create or delete call.
    pub max_retries: u32,

    /// Group of the members started with the in-memory cluster.
    pub seed_group: String,

    /// Number of members started with the in-memory cluster.
    pub seed_members: usize,

    /// Target sizes requested at startup.
    pub targets: Vec<(String, usize)>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            group_label: DEFAULT_GROUP_LABEL.to_string(),
            workers: DEFAULT_WORKERS,
            resync_interval_secs: 30,
            backoff_base_ms: 5,
            backoff_max_secs: 1000,
            qps: 10.0,
            burst: 100,
            max_retries: DEFAULT_MAX_RETRIES,
            seed_group: "default-pool".to_string(),
            seed_members: 1,
            targets: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from `lookup`, falling back to defaults for
    /// missing keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            namespace: lookup("GROUPSCALE_NAMESPACE").unwrap_or(defaults.namespace),
            group_label: lookup("GROUPSCALE_GROUP_LABEL").unwrap_or(defaults.group_label),
            workers: parse_or(lookup("GROUPSCALE_WORKERS"), "GROUPSCALE_WORKERS", defaults.workers)?,
            resync_interval_secs: parse_or(
                lookup("GROUPSCALE_RESYNC_INTERVAL"),
                "GROUPSCALE_RESYNC_INTERVAL",
                defaults.resync_interval_secs,
            )?,
            backoff_base_ms: parse_or(
                lookup("GROUPSCALE_BACKOFF_BASE_MS"),
                "GROUPSCALE_BACKOFF_BASE_MS",
                defaults.backoff_base_ms,
            )?,
            backoff_max_secs: parse_or(
                lookup("GROUPSCALE_BACKOFF_MAX_SECS"),
                "GROUPSCALE_BACKOFF_MAX_SECS",
                defaults.backoff_max_secs,
            )?,
            qps: parse_or(lookup("GROUPSCALE_QPS"), "GROUPSCALE_QPS", defaults.qps)?,
            burst: parse_or(lookup("GROUPSCALE_BURST"), "GROUPSCALE_BURST", defaults.burst)?,
            max_retries: parse_or(
                lookup("GROUPSCALE_MAX_RETRIES"),
                "GROUPSCALE_MAX_RETRIES",
                defaults.max_retries,
            )?,
            seed_group: lookup("GROUPSCALE_SEED_GROUP").unwrap_or(defaults.seed_group),
            seed_members: parse_or(
                lookup("GROUPSCALE_SEED_MEMBERS"),
                "GROUPSCALE_SEED_MEMBERS",
                defaults.seed_members,
            )?,
            targets: match lookup("GROUPSCALE_TARGETS") {
                Some(raw) => parse_targets(&raw).context("invalid GROUPSCALE_TARGETS")?,
                None => defaults.targets,
            },
            log_level: lookup("GROUPSCALE_LOG_LEVEL").unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.resync_interval_secs == 0 {
            bail!("GROUPSCALE_RESYNC_INTERVAL must be at least 1 second");
        }
        if self.backoff_base_ms > self.backoff_max_secs.saturating_mul(1000) {
            bail!("GROUPSCALE_BACKOFF_BASE_MS exceeds GROUPSCALE_BACKOFF_MAX_SECS");
        }
        if !self.qps.is_finite() || self.qps <= 0.0 {
            bail!("GROUPSCALE_QPS must be a positive number");
        }
        GroupName::parse(&self.seed_group).context("invalid GROUPSCALE_SEED_GROUP")?;
        Ok(())
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    /// Settings for [`crate::NodeGroupController`].
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            namespace: self.namespace.clone(),
            group_label: self.group_label.clone(),
            retry: RetryPolicy::new(self.max_retries),
        }
    }

    /// Per-key exponential backoff combined with an overall token bucket.
    pub fn rate_limiter<K: Key>(&self) -> MaxOfRateLimiter<K> {
        MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(
                Duration::from_millis(self.backoff_base_ms),
                Duration::from_secs(self.backoff_max_secs),
            )),
            Box::new(BucketRateLimiter::new(self.qps, self.burst)),
        ])
    }
}

fn parse_or<T>(raw: Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {key}: {raw:?}")),
        None => Ok(default),
    }
}

/// Parse `group=size` pairs separated by commas, e.g. `pool-a=3,pool-b=2`.
pub fn parse_targets(raw: &str) -> Result<Vec<(String, usize)>> {
    let mut targets = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((group, size)) = entry.split_once('=') else {
            bail!("expected group=size, got {entry:?}");
        };
        let group = GroupName::parse(group.trim())
            .with_context(|| format!("invalid group in {entry:?}"))?;
        let size = size
            .trim()
            .parse()
            .with_context(|| format!("invalid size in {entry:?}"))?;
        targets.push((group.into_string(), size));
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.namespace, "kubemark");
        assert_eq!(config.group_label, "autoscaling.k8s.io/nodegroup");
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.resync_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("GROUPSCALE_NAMESPACE", "hollow"),
            ("GROUPSCALE_WORKERS", "4"),
            ("GROUPSCALE_QPS", "2.5"),
            ("GROUPSCALE_TARGETS", "pool-a=3, pool-b=0"),
        ]))
        .unwrap();

        assert_eq!(config.namespace, "hollow");
        assert_eq!(config.workers, 4);
        assert_eq!(config.qps, 2.5);
        assert_eq!(
            config.targets,
            vec![("pool-a".to_string(), 3), ("pool-b".to_string(), 0)]
        );
        assert_eq!(config.controller_settings().namespace, "hollow");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Config::from_lookup(lookup(&[("GROUPSCALE_WORKERS", "many")])).is_err());
        assert!(Config::from_lookup(lookup(&[("GROUPSCALE_RESYNC_INTERVAL", "0")])).is_err());
        assert!(Config::from_lookup(lookup(&[("GROUPSCALE_QPS", "-1")])).is_err());
        assert!(Config::from_lookup(lookup(&[("GROUPSCALE_SEED_GROUP", "-bad")])).is_err());
    }

    #[test]
    fn test_parse_targets() {
        assert!(parse_targets("").unwrap().is_empty());
        assert_eq!(
            parse_targets("a=1,b=22,").unwrap(),
            vec![("a".to_string(), 1), ("b".to_string(), 22)]
        );
        assert!(parse_targets("a").is_err());
        assert!(parse_targets("a=x").is_err());
        assert!(parse_targets("Bad Name=1").is_err());
    }
}
