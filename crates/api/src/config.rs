use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use gantry_access::DEFAULT_TTL;
use gantry_schema::DEFAULT_VIEW_CACHE;
use gantry_summary::SummaryConfig;

/// Kinds the summary cache follows unless `GANTRY_TRACK` says otherwise.
pub const DEFAULT_TRACK: &[&str] = &[
    "v1/Pod",
    "v1/Service",
    "v1/ConfigMap",
    "v1/Secret",
    "v1/PersistentVolumeClaim",
    "apps/v1/Deployment",
    "apps/v1/ReplicaSet",
    "apps/v1/StatefulSet",
    "apps/v1/DaemonSet",
    "batch/v1/Job",
    "batch/v1/CronJob",
];

/// Runtime knobs of a [`crate::Gateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// How long a computed access set is trusted without an invalidation.
    pub access_ttl: Duration,
    /// Period of the discovery refresh loop.
    pub refresh_interval: Duration,
    pub watch_backoff_max: Duration,
    pub queue_cap: usize,
    pub view_cache: usize,
    /// GVK keys (`apps/v1/Deployment`) or type names (`apps.deployment`) the summary
    /// cache tracks. Empty disables tracking.
    pub track: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            access_ttl: DEFAULT_TTL,
            refresh_interval: Duration::from_secs(60),
            watch_backoff_max: Duration::from_secs(30),
            queue_cap: 2048,
            view_cache: DEFAULT_VIEW_CACHE,
            track: DEFAULT_TRACK.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl GatewayConfig {
    /// Defaults overridden by `GANTRY_*` environment variables.
    pub fn from_env() -> Result<Self> { Self::from_vars(|name| std::env::var(name).ok()) }

    /// Same as [`GatewayConfig::from_env`] with an explicit variable source.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(secs) = parse::<u64>(&var, "GANTRY_ACCESS_TTL_SECS")? {
            cfg.access_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&var, "GANTRY_REFRESH_SECS")? {
            cfg.refresh_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse::<u64>(&var, "GANTRY_WATCH_BACKOFF_MAX_SECS")? {
            cfg.watch_backoff_max = Duration::from_secs(secs.max(1));
        }
        if let Some(cap) = parse::<usize>(&var, "GANTRY_QUEUE_CAP")? {
            cfg.queue_cap = cap.max(1);
        }
        if let Some(track) = var("GANTRY_TRACK") {
            cfg.track = track.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect();
        }
        Ok(cfg)
    }

    pub fn summary(&self) -> SummaryConfig {
        SummaryConfig { queue_cap: self.queue_cap, backoff_max: self.watch_backoff_max, ..SummaryConfig::default() }
    }

    /// Whether a kind is configured for tracking, by GVK key or type name.
    pub fn tracks(&self, gvk_key: &str, type_name: &str) -> bool {
        self.track.iter().any(|t| t == gvk_key || t.eq_ignore_ascii_case(type_name))
    }
}

fn parse<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        Some(raw) if !raw.trim().is_empty() => {
            let v = raw.trim().parse::<T>().with_context(|| format!("parsing {}={}", name, raw))?;
            Ok(Some(v))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn env_overrides_defaults() {
        let cfg = GatewayConfig::from_vars(vars(&[
            ("GANTRY_ACCESS_TTL_SECS", "5"),
            ("GANTRY_QUEUE_CAP", "16"),
            ("GANTRY_TRACK", "v1/Pod, apps.deployment ,"),
        ]))
        .unwrap();
        assert_eq!(cfg.access_ttl, Duration::from_secs(5));
        assert_eq!(cfg.queue_cap, 16);
        assert_eq!(cfg.refresh_interval, GatewayConfig::default().refresh_interval);
        assert_eq!(cfg.track, vec!["v1/Pod", "apps.deployment"]);
        assert!(cfg.tracks("apps/v1/Deployment", "apps.deployment"));
        assert!(!cfg.tracks("v1/Secret", "secret"));
        assert_eq!(cfg.summary().queue_cap, 16);
    }

    #[test]
    fn malformed_numbers_are_errors() {
        let err = GatewayConfig::from_vars(vars(&[("GANTRY_REFRESH_SECS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("GANTRY_REFRESH_SECS"));
        assert!(GatewayConfig::from_vars(vars(&[("GANTRY_TRACK", "")])).unwrap().track.is_empty());
    }
}
