//! Adaptive cooldown: expensive rankings rest proportionally longer.
//!
//! After a recalculation that took `d`, the ranking is not recalculated again
//! before `clamp(min, d * factor, max)` has passed, however many invalidations
//! arrive in between. Example with `factor = 2`:
//!
//! ```text
//! 00:01  invalidated
//! 00:02  recalculation starts, takes 10s
//! 01:00  invalidated again
//! 01:01  recalculation starts; cooldown 20s, until 01:21
//! 01:03  invalidated (ranking stays stale)
//! 01:08  recalculation ends after 7s
//! 01:21  cooldown over; recalculated again with a 14s cooldown
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CooldownPolicy {
    pub min: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self { min: Duration::from_secs(5), max: Duration::from_secs(100), factor: 2.0 }
    }
}

impl CooldownPolicy {
    pub fn new(min: Duration, max: Duration, factor: f64) -> EngineResult<Self> {
        let p = Self { min, max, factor };
        p.validate()?;
        Ok(p)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(EngineError::Config(format!("cooldown factor must be a finite number >= 1, got {}", self.factor)));
        }
        if self.min > self.max {
            return Err(EngineError::Config(format!(
                "min cooldown ({:?}) exceeds max cooldown ({:?})",
                self.min, self.max
            )));
        }
        Ok(())
    }

    /// `clamp(min, last * factor, max)`
    pub fn cooldown(&self, last: Duration) -> Duration {
        let scaled = Duration::try_from_secs_f64(last.as_secs_f64() * self.factor).unwrap_or(self.max);
        scaled.min(self.max).max(self.min)
    }

    pub fn cooldown_until(&self, now: DateTime<Utc>, last: Duration) -> DateTime<Utc> {
        crate::clock::add(now, self.cooldown(last))
    }

    /// Deadline after a failed build: retried as soon as the minimum allows.
    pub fn retry_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        crate::clock::add(now, self.min)
    }
}
