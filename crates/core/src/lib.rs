//! rankd core types: ranking records, tickets, the derived record state and
//! the seams (builder, clock) the engine is wired through.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod builder;
pub mod clock;
pub mod config;
pub mod cooldown;
pub mod error;

pub use builder::{BuiltRanking, RankingBuilder};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use cooldown::CooldownPolicy;
pub use error::{BuilderError, EngineError, EngineResult};

/// Key of the contest-wide ranking.
pub const CONTEST_RANKING_KEY: &str = "c";

/// Opaque contest identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContestId(pub String);

/// Opaque identifier of one ranking within a contest (contest-wide, a round, a division).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RankingKey(pub String);

macro_rules! string_id {
    ($t:ty) => {
        impl $t {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }
        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(&self.0)
            }
        }
        impl From<&str> for $t {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
        impl From<String> for $t {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(ContestId);
string_id!(RankingKey);

/// Storage-assigned row id of a ranking record.
pub type RankingId = i64;

/// Identity of one in-flight recalculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(pub Uuid);

impl TicketId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TicketId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Proof that the holder owns the recalculation of one ranking record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecalculationTicket {
    pub id: TicketId,
    pub ranking_id: RankingId,
    pub contest_id: ContestId,
    pub key: RankingKey,
    pub issued_at: DateTime<Utc>,
}

/// Control state and cached output of a single ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingRecord {
    pub id: RankingId,
    pub contest_id: ContestId,
    pub key: RankingKey,
    pub needs_recalculation: bool,
    /// Advisory.
    pub invalidation_timestamp: DateTime<Utc>,
    pub cooldown_until: DateTime<Utc>,
    pub last_recalculation_started: Option<DateTime<Utc>>,
    pub last_recalculation_duration: Duration,
    pub recalc_ticket: Option<TicketId>,
    /// Opaque payload produced by the builder.
    #[serde(skip)]
    pub serialized_snapshot: Option<Vec<u8>>,
    pub page_count: usize,
}

impl RankingRecord {
    /// True when the cached snapshot reflects everything invalidated so far.
    pub fn is_up_to_date(&self) -> bool {
        !self.needs_recalculation && self.recalc_ticket.is_none()
    }

    pub fn state(&self, now: DateTime<Utc>) -> RecordState {
        if self.recalc_ticket.is_some() {
            RecordState::Recalculating
        } else if !self.needs_recalculation {
            RecordState::Fresh
        } else if self.cooldown_until >= now {
            RecordState::StaleCooling
        } else {
            RecordState::StaleEligible
        }
    }
}

/// Derived lifecycle state of a record; never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordState {
    Fresh,
    StaleCooling,
    StaleEligible,
    Recalculating,
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecordState::Fresh => "fresh",
            RecordState::StaleCooling => "stale-cooling",
            RecordState::StaleEligible => "stale-eligible",
            RecordState::Recalculating => "recalculating",
        };
        f.pad(s)
    }
}

/// What readers get: the last good output plus whether it is current.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingView {
    pub up_to_date: bool,
    #[serde(skip)]
    pub snapshot: Option<Vec<u8>>,
    pub pages: Vec<String>,
}

/// Result of handing a ticket back to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// No record holds the ticket any more (deleted, or reclaimed after the TTL).
    Lost,
}

pub mod prelude {
    pub use super::{
        BuiltRanking, Clock, CommitOutcome, ContestId, CooldownPolicy, EngineConfig, EngineError, EngineResult,
        RankingBuilder, RankingId, RankingKey, RankingRecord, RankingView, RecalculationTicket, RecordState, TicketId,
    };
}
