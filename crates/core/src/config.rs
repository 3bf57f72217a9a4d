//! Engine configuration, read from `RANKD_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cooldown::CooldownPolicy;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    /// Idle sleep of the worker loop.
    pub polling_interval: Duration,
    pub cooldown: CooldownPolicy,
    /// Tickets older than this are treated as abandoned. `None` disables reclaiming.
    pub ticket_ttl: Option<Duration>,
    pub busy_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            polling_interval: Duration::from_millis(500),
            cooldown: CooldownPolicy::default(),
            ticket_ttl: Some(Duration::from_secs(3600)),
            busy_timeout: Duration::from_millis(5000),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> EngineResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source; unset variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> EngineResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(p) = lookup("RANKD_DB_PATH").filter(|s| !s.is_empty()) {
            cfg.db_path = PathBuf::from(p);
        }
        if let Some(d) = secs(&lookup, "RANKD_POLLING_INTERVAL_SECS")? {
            cfg.polling_interval = d;
        }
        if let Some(d) = secs(&lookup, "RANKD_MIN_COOLDOWN_SECS")? {
            cfg.cooldown.min = d;
        }
        if let Some(d) = secs(&lookup, "RANKD_MAX_COOLDOWN_SECS")? {
            cfg.cooldown.max = d;
        }
        if let Some(raw) = lookup("RANKD_COOLDOWN_FACTOR") {
            cfg.cooldown.factor = raw
                .trim()
                .parse::<f64>()
                .map_err(|_| EngineError::Config(format!("RANKD_COOLDOWN_FACTOR: not a number: {raw}")))?;
        }
        if let Some(d) = secs(&lookup, "RANKD_TICKET_TTL_SECS")? {
            cfg.ticket_ttl = if d.is_zero() { None } else { Some(d) };
        }
        if let Some(raw) = lookup("RANKD_BUSY_TIMEOUT_MS") {
            let ms = raw
                .trim()
                .parse::<u64>()
                .map_err(|_| EngineError::Config(format!("RANKD_BUSY_TIMEOUT_MS: not an integer: {raw}")))?;
            cfg.busy_timeout = Duration::from_millis(ms);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> EngineResult<()> {
        self.cooldown.validate()?;
        if self.polling_interval.is_zero() {
            return Err(EngineError::Config("polling interval must be positive".into()));
        }
        Ok(())
    }
}

fn secs<F>(lookup: &F, name: &str) -> EngineResult<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else { return Ok(None) };
    parse_secs(&raw)
        .map(Some)
        .ok_or_else(|| EngineError::Config(format!("{name}: expected non-negative seconds, got {raw:?}")))
}

/// Parse fractional seconds ("0.5", "60").
pub fn parse_secs(raw: &str) -> Option<Duration> {
    let v: f64 = raw.trim().parse().ok()?;
    Duration::try_from_secs_f64(v).ok()
}

fn default_db_path() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = PathBuf::from(home);
        p.push(".rankd");
        p.push("rankd.db");
        return p;
    }
    PathBuf::from("rankd.db")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cfg(vars: &[(&str, &str)]) -> EngineResult<EngineConfig> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        EngineConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let c = cfg(&[]).unwrap();
        assert_eq!(c.polling_interval, Duration::from_millis(500));
        assert_eq!(c.cooldown, CooldownPolicy::default());
        assert_eq!(c.ticket_ttl, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn reads_overrides() {
        let c = cfg(&[
            ("RANKD_DB_PATH", "/tmp/r.db"),
            ("RANKD_POLLING_INTERVAL_SECS", "0.25"),
            ("RANKD_MIN_COOLDOWN_SECS", "5"),
            ("RANKD_MAX_COOLDOWN_SECS", "60"),
            ("RANKD_COOLDOWN_FACTOR", "3"),
            ("RANKD_TICKET_TTL_SECS", "0"),
            ("RANKD_BUSY_TIMEOUT_MS", "100"),
        ])
        .unwrap();
        assert_eq!(c.db_path, PathBuf::from("/tmp/r.db"));
        assert_eq!(c.polling_interval, Duration::from_millis(250));
        assert_eq!(c.cooldown.max, Duration::from_secs(60));
        assert_eq!(c.cooldown.factor, 3.0);
        assert_eq!(c.ticket_ttl, None);
        assert_eq!(c.busy_timeout, Duration::from_millis(100));
    }

    #[test]
    fn rejects_garbage() {
        assert!(cfg(&[("RANKD_COOLDOWN_FACTOR", "fast")]).is_err());
        assert!(cfg(&[("RANKD_COOLDOWN_FACTOR", "0.5")]).is_err());
        assert!(cfg(&[("RANKD_MIN_COOLDOWN_SECS", "-1")]).is_err());
        assert!(cfg(&[("RANKD_MIN_COOLDOWN_SECS", "500"), ("RANKD_MAX_COOLDOWN_SECS", "10")]).is_err());
        assert!(cfg(&[("RANKD_POLLING_INTERVAL_SECS", "0")]).is_err());
    }
}
