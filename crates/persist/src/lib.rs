//! rankd persistence: SQLite store holding ranking records, their pages and
//! recalculation tickets.
//!
//! Every mutation runs in a `BEGIN IMMEDIATE` transaction, so the write lock is
//! held from the moment a candidate is selected until it is claimed. That is
//! what keeps two pickers (threads or processes sharing the file) from ever
//! claiming the same ranking.

#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use rankd_core::clock::{self, Clock, SystemClock};
use rankd_core::{
    BuiltRanking, CommitOutcome, ContestId, CooldownPolicy, EngineConfig, EngineError, EngineResult, RankingKey,
    RankingRecord, RankingView, RecalculationTicket, TicketId,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Storage contract of the engine. All methods are safe to call concurrently
/// from several handles on the same database.
pub trait RankingStore: Send + Sync {
    /// Mark one ranking stale, creating it if unknown.
    fn invalidate(&self, contest: &ContestId, key: &RankingKey) -> EngineResult<()> {
        self.invalidate_keys(contest, std::slice::from_ref(key)).map(|_| ())
    }

    /// Mark the given rankings of a contest stale in one transaction.
    fn invalidate_keys(&self, contest: &ContestId, keys: &[RankingKey]) -> EngineResult<usize>;

    /// Mark every known ranking of a contest stale.
    fn invalidate_all(&self, contest: &ContestId) -> EngineResult<usize>;

    /// Mark every ranking in storage stale.
    fn invalidate_all_everywhere(&self) -> EngineResult<usize>;

    /// Claim the most starved eligible ranking, if any.
    fn pick_one(&self) -> EngineResult<Option<RecalculationTicket>>;

    /// Publish a build result and release the ticket.
    fn commit(
        &self,
        ticket: &RecalculationTicket,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        built: &BuiltRanking,
    ) -> EngineResult<CommitOutcome>;

    /// Release the ticket after a failed build, leaving the ranking stale.
    fn abandon(
        &self,
        ticket: &RecalculationTicket,
        started_at: DateTime<Utc>,
        failed_at: DateTime<Utc>,
    ) -> EngineResult<CommitOutcome>;

    /// Last published output; never blocks on a recalculation.
    fn get(&self, contest: &ContestId, key: &RankingKey) -> EngineResult<RankingView>;

    /// One page (numbered from 1) of the last published output.
    fn page(&self, contest: &ContestId, key: &RankingKey, nr: usize) -> EngineResult<Option<String>>;

    fn record(&self, contest: &ContestId, key: &RankingKey) -> EngineResult<Option<RankingRecord>>;

    fn list(&self, contest: Option<&ContestId>) -> EngineResult<Vec<RankingRecord>>;

    /// Drop a contest's rankings, pages and tickets.
    fn delete_contest(&self, contest: &ContestId) -> EngineResult<usize>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS ranking_recalc (
    id         TEXT PRIMARY KEY,
    issued_ms  INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS ranking (
    id                       INTEGER PRIMARY KEY AUTOINCREMENT,
    contest_id               TEXT NOT NULL,
    key                      TEXT NOT NULL,
    needs_recalculation      INTEGER NOT NULL DEFAULT 1,
    invalidation_ms          INTEGER NOT NULL,
    cooldown_until_ms        INTEGER NOT NULL DEFAULT 0,
    last_recalc_started_ms   INTEGER,
    last_recalc_duration_ms  INTEGER NOT NULL DEFAULT 0,
    recalc_ticket            TEXT REFERENCES ranking_recalc(id) ON DELETE SET NULL,
    serialized               BLOB,
    serialized_codec         INTEGER NOT NULL DEFAULT 0,
    UNIQUE (contest_id, key)
);
CREATE TABLE IF NOT EXISTS ranking_page (
    ranking_id  INTEGER NOT NULL REFERENCES ranking(id) ON DELETE CASCADE,
    nr          INTEGER NOT NULL,
    data        TEXT NOT NULL,
    PRIMARY KEY (ranking_id, nr)
);
CREATE INDEX IF NOT EXISTS idx_ranking_pick ON ranking(needs_recalculation, cooldown_until_ms);
CREATE INDEX IF NOT EXISTS idx_ranking_ticket ON ranking(recalc_ticket);
";

const RECORD_COLUMNS: &str = "r.id, r.contest_id, r.key, r.needs_recalculation, r.invalidation_ms, r.cooldown_until_ms,
     r.last_recalc_started_ms, r.last_recalc_duration_ms, r.recalc_ticket, r.serialized, r.serialized_codec,
     (SELECT COUNT(*) FROM ranking_page p WHERE p.ranking_id = r.id)";

/// SQLite-backed store. Synchronous; one connection per handle. Open one
/// handle per worker process (or thread) to get real concurrency.
pub struct SqliteStore {
    db: Mutex<Connection>,
    cooldown: CooldownPolicy,
    ticket_ttl: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    pub fn open_default() -> EngineResult<Self> {
        let cfg = EngineConfig::from_env()?;
        Self::open(&cfg.db_path, &cfg)
    }

    pub fn open(path: &Path, cfg: &EngineConfig) -> EngineResult<Self> {
        Self::open_with_clock(path, cfg, Arc::new(SystemClock))
    }

    pub fn open_with_clock(path: &Path, cfg: &EngineConfig, clock: Arc<dyn Clock>) -> EngineResult<Self> {
        cfg.validate()?;
        let started = Instant::now();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|e| EngineError::Storage(format!("creating db directory {}: {}", dir.display(), e)))?;
        }
        let db = Connection::open(path)
            .map_err(|e| EngineError::Storage(format!("opening sqlite db at {}: {}", path.display(), e)))?;
        db.busy_timeout(cfg.busy_timeout).map_err(db_err)?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.pragma_update(None, "foreign_keys", "ON").map_err(db_err)?;
        db.execute_batch(SCHEMA).map_err(db_err)?;
        migrate(&db).map_err(db_err)?;
        let me = Self {
            db: Mutex::new(db),
            cooldown: cfg.cooldown,
            ticket_ttl: cfg.ticket_ttl,
            clock,
        };
        histogram!("ranking_store_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path = %path.display(), "ranking store opened");
        Ok(me)
    }

    pub fn cooldown_policy(&self) -> CooldownPolicy {
        self.cooldown
    }

    fn conn(&self) -> EngineResult<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| EngineError::Storage("connection mutex poisoned".into()))
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }
}

impl RankingStore for SqliteStore {
    fn invalidate_keys(&self, contest: &ContestId, keys: &[RankingKey]) -> EngineResult<usize> {
        let now = self.now_ms();
        let mut db = self.conn()?;
        let n = (|| -> rusqlite::Result<usize> {
            let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO ranking(contest_id, key, needs_recalculation, invalidation_ms, cooldown_until_ms)
                     VALUES (?1, ?2, 1, ?3, 0)
                     ON CONFLICT(contest_id, key) DO UPDATE
                     SET needs_recalculation = 1, invalidation_ms = excluded.invalidation_ms",
                )?;
                for key in keys {
                    stmt.execute(params![contest.as_str(), key.as_str(), now])?;
                }
            }
            tx.commit()?;
            Ok(keys.len())
        })()
        .map_err(db_err)?;
        counter!("ranking_invalidate_total", n as u64);
        debug!(contest = %contest, keys = n, "rankings invalidated");
        Ok(n)
    }

    fn invalidate_all(&self, contest: &ContestId) -> EngineResult<usize> {
        let now = self.now_ms();
        let db = self.conn()?;
        let n = db
            .execute(
                "UPDATE ranking SET needs_recalculation = 1, invalidation_ms = ?2 WHERE contest_id = ?1",
                params![contest.as_str(), now],
            )
            .map_err(db_err)?;
        counter!("ranking_invalidate_total", n as u64);
        info!(contest = %contest, rankings = n, "contest rankings invalidated");
        Ok(n)
    }

    fn invalidate_all_everywhere(&self) -> EngineResult<usize> {
        let now = self.now_ms();
        let db = self.conn()?;
        let n = db
            .execute("UPDATE ranking SET needs_recalculation = 1, invalidation_ms = ?1", params![now])
            .map_err(db_err)?;
        counter!("ranking_invalidate_total", n as u64);
        info!(rankings = n, "all rankings invalidated");
        Ok(n)
    }

    fn pick_one(&self) -> EngineResult<Option<RecalculationTicket>> {
        let started = Instant::now();
        let now = self.clock.now();
        let mut db = self.conn()?;
        let picked = pick_tx(&mut db, now, &self.cooldown, self.ticket_ttl).map_err(db_err)?;
        histogram!("ranking_pick_ms", started.elapsed().as_secs_f64() * 1000.0);
        if let Some(t) = &picked {
            counter!("ranking_pick_total", 1u64);
            debug!(contest = %t.contest_id, key = %t.key, ticket = %t.id, "ranking claimed");
        }
        Ok(picked)
    }

    fn commit(
        &self,
        ticket: &RecalculationTicket,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        built: &BuiltRanking,
    ) -> EngineResult<CommitOutcome> {
        let started = Instant::now();
        let duration = clock::elapsed(started_at, finished_at);
        let mut db = self.conn()?;
        let outcome = (|| -> rusqlite::Result<CommitOutcome> {
            let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(ranking_id) = owner_of(&tx, ticket.id)? else {
                return Ok(CommitOutcome::Lost);
            };
            tx.execute("DELETE FROM ranking_page WHERE ranking_id = ?1", [ranking_id])?;
            {
                let mut ins = tx.prepare_cached("INSERT INTO ranking_page(ranking_id, nr, data) VALUES (?1, ?2, ?3)")?;
                for (nr, data) in built.pages.iter().enumerate() {
                    ins.execute(params![ranking_id, nr as i64 + 1, data])?;
                }
            }
            // Clock read inside the lock: the cooldown starts when the result is visible.
            let cooldown_until = self.cooldown.cooldown_until(self.clock.now(), duration);
            let (blob, codec) = maybe_compress(&built.snapshot);
            tx.execute(
                "UPDATE ranking
                 SET serialized = ?2, serialized_codec = ?6, last_recalc_started_ms = ?3,
                     last_recalc_duration_ms = ?4, recalc_ticket = NULL, cooldown_until_ms = ?5
                 WHERE id = ?1",
                params![
                    ranking_id,
                    blob,
                    started_at.timestamp_millis(),
                    duration_ms(duration),
                    cooldown_until.timestamp_millis(),
                    codec,
                ],
            )?;
            tx.execute("DELETE FROM ranking_recalc WHERE id = ?1", [ticket.id.to_string()])?;
            tx.commit()?;
            Ok(CommitOutcome::Committed)
        })()
        .map_err(db_err)?;
        match outcome {
            CommitOutcome::Committed => {
                histogram!("ranking_commit_ms", started.elapsed().as_secs_f64() * 1000.0);
                histogram!("ranking_build_seconds", duration.as_secs_f64());
                counter!("ranking_commit_total", 1u64);
                info!(
                    contest = %ticket.contest_id,
                    key = %ticket.key,
                    pages = built.pages.len(),
                    duration_ms = duration_ms(duration),
                    "ranking committed"
                );
            }
            CommitOutcome::Lost => {
                counter!("ranking_ticket_lost_total", 1u64);
                warn!(contest = %ticket.contest_id, key = %ticket.key, ticket = %ticket.id, "{}", EngineError::InconsistentTicket(ticket.id));
            }
        }
        Ok(outcome)
    }

    fn abandon(
        &self,
        ticket: &RecalculationTicket,
        started_at: DateTime<Utc>,
        failed_at: DateTime<Utc>,
    ) -> EngineResult<CommitOutcome> {
        let duration = clock::elapsed(started_at, failed_at);
        let mut db = self.conn()?;
        let outcome = (|| -> rusqlite::Result<CommitOutcome> {
            let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(ranking_id) = owner_of(&tx, ticket.id)? else {
                return Ok(CommitOutcome::Lost);
            };
            let retry_until = self.cooldown.retry_until(self.clock.now());
            tx.execute(
                "UPDATE ranking
                 SET needs_recalculation = 1, recalc_ticket = NULL, last_recalc_started_ms = ?2,
                     last_recalc_duration_ms = ?3, cooldown_until_ms = ?4
                 WHERE id = ?1",
                params![ranking_id, started_at.timestamp_millis(), duration_ms(duration), retry_until.timestamp_millis()],
            )?;
            tx.execute("DELETE FROM ranking_recalc WHERE id = ?1", [ticket.id.to_string()])?;
            tx.commit()?;
            Ok(CommitOutcome::Committed)
        })()
        .map_err(db_err)?;
        match outcome {
            CommitOutcome::Committed => {
                counter!("ranking_abandon_total", 1u64);
                info!(contest = %ticket.contest_id, key = %ticket.key, "ranking left stale after failed build");
            }
            CommitOutcome::Lost => {
                counter!("ranking_ticket_lost_total", 1u64);
                warn!(contest = %ticket.contest_id, key = %ticket.key, ticket = %ticket.id, "{}", EngineError::InconsistentTicket(ticket.id));
            }
        }
        Ok(outcome)
    }

    fn get(&self, contest: &ContestId, key: &RankingKey) -> EngineResult<RankingView> {
        let started = Instant::now();
        let mut db = self.conn()?;
        let view = (|| -> rusqlite::Result<RankingView> {
            // Deferred read transaction: snapshot and pages come from one database state.
            let tx = db.transaction()?;
            let head = tx
                .query_row(
                    "SELECT id, needs_recalculation, recalc_ticket, serialized, serialized_codec FROM ranking
                     WHERE contest_id = ?1 AND key = ?2",
                    params![contest.as_str(), key.as_str()],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, bool>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, Option<Vec<u8>>>(3)?,
                            row.get::<_, i64>(4)?,
                        ))
                    },
                )
                .optional()?;
            let Some((id, needs, ticket, blob, codec)) = head else {
                return Ok(RankingView::default());
            };
            let mut stmt = tx.prepare_cached("SELECT data FROM ranking_page WHERE ranking_id = ?1 ORDER BY nr")?;
            let pages = stmt.query_map([id], |row| row.get::<_, String>(0))?.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(RankingView {
                up_to_date: !needs && ticket.is_none(),
                snapshot: blob.map(|b| decode_column(&b, codec, 3)).transpose()?,
                pages,
            })
        })()
        .map_err(db_err)?;
        histogram!("ranking_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(view)
    }

    fn page(&self, contest: &ContestId, key: &RankingKey, nr: usize) -> EngineResult<Option<String>> {
        let db = self.conn()?;
        db.query_row(
            "SELECT p.data FROM ranking_page p JOIN ranking r ON r.id = p.ranking_id
             WHERE r.contest_id = ?1 AND r.key = ?2 AND p.nr = ?3",
            params![contest.as_str(), key.as_str(), nr as i64],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }

    fn record(&self, contest: &ContestId, key: &RankingKey) -> EngineResult<Option<RankingRecord>> {
        let db = self.conn()?;
        db.query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM ranking r WHERE r.contest_id = ?1 AND r.key = ?2"),
            params![contest.as_str(), key.as_str()],
            record_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    fn list(&self, contest: Option<&ContestId>) -> EngineResult<Vec<RankingRecord>> {
        let db = self.conn()?;
        (|| -> rusqlite::Result<Vec<RankingRecord>> {
            let mut stmt = db.prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM ranking r
                 WHERE ?1 IS NULL OR r.contest_id = ?1
                 ORDER BY r.contest_id, r.key"
            ))?;
            let rows = stmt.query_map([contest.map(|c| c.as_str())], record_from_row)?;
            rows.collect()
        })()
        .map_err(db_err)
    }

    fn delete_contest(&self, contest: &ContestId) -> EngineResult<usize> {
        let mut db = self.conn()?;
        let n = (|| -> rusqlite::Result<usize> {
            let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "DELETE FROM ranking_recalc WHERE id IN
                 (SELECT recalc_ticket FROM ranking WHERE contest_id = ?1 AND recalc_ticket IS NOT NULL)",
                [contest.as_str()],
            )?;
            let n = tx.execute("DELETE FROM ranking WHERE contest_id = ?1", [contest.as_str()])?;
            tx.commit()?;
            Ok(n)
        })()
        .map_err(db_err)?;
        info!(contest = %contest, rankings = n, "contest rankings deleted");
        Ok(n)
    }
}

/// Select-and-claim under the write lock.
fn pick_tx(
    db: &mut Connection,
    now: DateTime<Utc>,
    cooldown: &CooldownPolicy,
    ticket_ttl: Option<Duration>,
) -> rusqlite::Result<Option<RecalculationTicket>> {
    let now_ms = now.timestamp_millis();
    let expired_before = ticket_ttl.map(|ttl| now_ms.saturating_sub(duration_ms(ttl))).unwrap_or(i64::MIN);
    let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let candidate = tx
        .query_row(
            "SELECT r.id, r.contest_id, r.key, r.last_recalc_duration_ms, r.recalc_ticket
             FROM ranking r LEFT JOIN ranking_recalc t ON t.id = r.recalc_ticket
             WHERE (r.recalc_ticket IS NULL AND r.needs_recalculation = 1 AND r.cooldown_until_ms < ?1)
                OR (?2 AND t.issued_ms <= ?3)
             ORDER BY r.last_recalc_started_ms IS NOT NULL, r.last_recalc_started_ms, r.id
             LIMIT 1",
            params![now_ms, ticket_ttl.is_some(), expired_before],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            },
        )
        .optional()?;
    let Some((ranking_id, contest_id, key, last_ms, stale_ticket)) = candidate else {
        return Ok(None);
    };
    if let Some(old) = stale_ticket {
        counter!("ranking_ticket_reclaimed_total", 1u64);
        warn!(contest = %contest_id, key = %key, ticket = %old, "reclaiming ranking from expired ticket");
        tx.execute("DELETE FROM ranking_recalc WHERE id = ?1", [&old])?;
    }
    let id = TicketId::new();
    let provisional = cooldown.cooldown_until(now, Duration::from_millis(last_ms.max(0) as u64));
    tx.execute(
        "INSERT INTO ranking_recalc(id, issued_ms) VALUES (?1, ?2)",
        params![id.to_string(), now_ms],
    )?;
    tx.execute(
        "UPDATE ranking SET recalc_ticket = ?2, needs_recalculation = 0, cooldown_until_ms = ?3 WHERE id = ?1",
        params![ranking_id, id.to_string(), provisional.timestamp_millis()],
    )?;
    tx.commit()?;
    Ok(Some(RecalculationTicket {
        id,
        ranking_id,
        contest_id: ContestId(contest_id),
        key: RankingKey(key),
        issued_at: now,
    }))
}

/// Bring databases created by older builds up to the current schema.
fn migrate(db: &Connection) -> rusqlite::Result<()> {
    let has_codec =
        db.prepare("SELECT 1 FROM pragma_table_info('ranking') WHERE name = 'serialized_codec'")?.exists([])?;
    if !has_codec {
        // Existing blobs predate compression and are raw.
        db.execute_batch("ALTER TABLE ranking ADD COLUMN serialized_codec INTEGER NOT NULL DEFAULT 0")?;
        info!("ranking table migrated: added serialized_codec");
    }
    Ok(())
}

fn owner_of(tx: &Transaction<'_>, ticket: TicketId) -> rusqlite::Result<Option<i64>> {
    tx.query_row("SELECT id FROM ranking WHERE recalc_ticket = ?1", [ticket.to_string()], |row| row.get(0))
        .optional()
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RankingRecord> {
    let ticket: Option<String> = row.get(8)?;
    let blob: Option<Vec<u8>> = row.get(9)?;
    let codec: i64 = row.get(10)?;
    Ok(RankingRecord {
        id: row.get(0)?,
        contest_id: ContestId(row.get(1)?),
        key: RankingKey(row.get(2)?),
        needs_recalculation: row.get(3)?,
        invalidation_timestamp: from_ms(row.get(4)?),
        cooldown_until: from_ms(row.get(5)?),
        last_recalculation_started: row.get::<_, Option<i64>>(6)?.map(from_ms),
        last_recalculation_duration: Duration::from_millis(row.get::<_, i64>(7)?.max(0) as u64),
        recalc_ticket: ticket.and_then(|s| Uuid::parse_str(&s).ok()).map(TicketId),
        serialized_snapshot: blob.map(|b| decode_column(&b, codec, 9)).transpose()?,
        page_count: row.get::<_, i64>(11)?.max(0) as usize,
    })
}

fn db_err(e: rusqlite::Error) -> EngineError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => EngineError::TransientStorage(e.to_string()),
        _ => EngineError::Storage(e.to_string()),
    }
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Snapshot stored as given.
pub const CODEC_RAW: i64 = 0;
/// Snapshot stored as a zstd frame.
pub const CODEC_ZSTD: i64 = 1;

/// Encode a snapshot for storage, returning the blob and the codec it was written with.
pub fn maybe_compress(snapshot: &[u8]) -> (Vec<u8>, i64) {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("RANKD_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        if let Ok(enc) = zstd::encode_all(snapshot, lvl) {
            return (enc, CODEC_ZSTD);
        }
    }
    (snapshot.to_vec(), CODEC_RAW)
}

/// Decode a stored blob according to its codec tag. Raw blobs are returned
/// untouched whatever their content.
pub fn maybe_decompress(blob: &[u8], codec: i64) -> Result<Vec<u8>, String> {
    match codec {
        CODEC_RAW => Ok(blob.to_vec()),
        #[cfg(feature = "zstd")]
        CODEC_ZSTD => zstd::decode_all(std::io::Cursor::new(blob)).map_err(|e| format!("corrupt zstd snapshot: {e}")),
        other => Err(format!("snapshot codec {other} is not supported by this build")),
    }
}

fn decode_column(blob: &[u8], codec: i64, col: usize) -> rusqlite::Result<Vec<u8>> {
    maybe_decompress(blob, codec)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Blob, e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rankd_core::ManualClock;

    fn temp_db() -> std::path::PathBuf {
        let dir = std::env::temp_dir();
        let f = format!("rankd-unit-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        dir.join(f)
    }

    fn store() -> (SqliteStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        let cfg = EngineConfig {
            cooldown: CooldownPolicy::new(Duration::from_secs(5), Duration::from_secs(60), 2.0).unwrap(),
            ..EngineConfig::default()
        };
        let s = SqliteStore::open_with_clock(&temp_db(), &cfg, clock.clone()).unwrap();
        (s, clock)
    }

    #[test]
    fn invalidate_creates_stale_record() {
        let (s, _clock) = store();
        let c = ContestId::from("demo");
        let k = RankingKey::from("c");
        assert!(s.record(&c, &k).unwrap().is_none());
        s.invalidate(&c, &k).unwrap();
        let r = s.record(&c, &k).unwrap().unwrap();
        assert!(r.needs_recalculation);
        assert!(r.recalc_ticket.is_none());
        assert!(r.serialized_snapshot.is_none());
        assert_eq!(r.last_recalculation_started, None);
        assert_eq!(r.last_recalculation_duration, Duration::ZERO);
        assert_eq!(r.cooldown_until.timestamp_millis(), 0);
    }

    #[test]
    fn pages_replaced_wholesale() {
        let (s, clock) = store();
        let c = ContestId::from("demo");
        let k = RankingKey::from("c");
        s.invalidate(&c, &k).unwrap();

        let t = s.pick_one().unwrap().unwrap();
        let built = BuiltRanking { snapshot: b"v1".to_vec(), pages: vec!["a".into(), "b".into(), "c".into()] };
        assert_eq!(s.commit(&t, clock.now(), clock.now(), &built).unwrap(), CommitOutcome::Committed);
        assert_eq!(s.page(&c, &k, 3).unwrap().as_deref(), Some("c"));

        clock.advance(Duration::from_secs(10));
        s.invalidate(&c, &k).unwrap();
        let t = s.pick_one().unwrap().unwrap();
        let built = BuiltRanking { snapshot: b"v2".to_vec(), pages: vec!["z".into()] };
        s.commit(&t, clock.now(), clock.now(), &built).unwrap();

        let view = s.get(&c, &k).unwrap();
        assert!(view.up_to_date);
        assert_eq!(view.snapshot.as_deref(), Some(&b"v2"[..]));
        assert_eq!(view.pages, vec!["z".to_string()]);
        assert_eq!(s.page(&c, &k, 1).unwrap().as_deref(), Some("z"));
        assert_eq!(s.page(&c, &k, 2).unwrap(), None);
    }

    #[test]
    fn delete_contest_drops_everything() {
        let (s, clock) = store();
        let c = ContestId::from("gone");
        s.invalidate_keys(&c, &["c".into(), "b".into()]).unwrap();
        s.invalidate(&"kept".into(), &"c".into()).unwrap();
        let t = s.pick_one().unwrap().unwrap();
        assert_eq!(s.delete_contest(&c).unwrap(), 2);
        assert_eq!(s.list(None).unwrap().len(), 1);
        if t.contest_id == c {
            let out = s.commit(&t, clock.now(), clock.now(), &BuiltRanking::default()).unwrap();
            assert_eq!(out, CommitOutcome::Lost);
        }
    }

    #[test]
    fn unusable_db_directory_is_reported() {
        let blocker = temp_db();
        std::fs::write(&blocker, b"not a directory").unwrap();
        let err = match SqliteStore::open(&blocker.join("rankd.db"), &EngineConfig::default()) {
            Err(e) => e,
            Ok(_) => panic!("opened a db below a regular file"),
        };
        assert!(matches!(&err, EngineError::Storage(m) if m.contains("creating db directory")), "{err}");
    }

    #[test]
    fn legacy_database_gets_codec_column() {
        let path = temp_db();
        {
            let db = Connection::open(&path).unwrap();
            db.execute_batch(
                "CREATE TABLE ranking_recalc (id TEXT PRIMARY KEY, issued_ms INTEGER NOT NULL);
                 CREATE TABLE ranking (
                     id INTEGER PRIMARY KEY AUTOINCREMENT, contest_id TEXT NOT NULL, key TEXT NOT NULL,
                     needs_recalculation INTEGER NOT NULL DEFAULT 1, invalidation_ms INTEGER NOT NULL,
                     cooldown_until_ms INTEGER NOT NULL DEFAULT 0, last_recalc_started_ms INTEGER,
                     last_recalc_duration_ms INTEGER NOT NULL DEFAULT 0,
                     recalc_ticket TEXT REFERENCES ranking_recalc(id) ON DELETE SET NULL,
                     serialized BLOB, UNIQUE (contest_id, key));
                 INSERT INTO ranking(contest_id, key, needs_recalculation, invalidation_ms, serialized)
                 VALUES ('old', 'c', 0, 0, X'00ff');",
            )
            .unwrap();
        }
        let s = SqliteStore::open(&path, &EngineConfig::default()).unwrap();
        let view = s.get(&"old".into(), &"c".into()).unwrap();
        assert!(view.up_to_date);
        assert_eq!(view.snapshot.as_deref(), Some(&[0x00, 0xff][..]));
        // Reopening an already migrated file is a no-op.
        drop(s);
        SqliteStore::open(&path, &EngineConfig::default()).unwrap();
    }

    #[test]
    fn raw_snapshot_is_never_reinterpreted() {
        let (s, _clock) = store();
        let (c, k) = (ContestId::from("demo"), RankingKey::from("c"));
        s.invalidate(&c, &k).unwrap();
        // Starts with the zstd frame magic but was stored raw.
        let looks_compressed: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd, 0x20, 0x02, 0x11, 0x00, 0x00, 0x68, 0x69];
        s.conn()
            .unwrap()
            .execute(
                "UPDATE ranking SET serialized = ?1, serialized_codec = ?2 WHERE contest_id = 'demo'",
                params![looks_compressed, CODEC_RAW],
            )
            .unwrap();
        assert_eq!(s.get(&c, &k).unwrap().snapshot.as_deref(), Some(looks_compressed));
        let r = s.record(&c, &k).unwrap().unwrap();
        assert_eq!(r.serialized_snapshot.as_deref(), Some(looks_compressed));
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn compressed_snapshot_round_trips() {
        let (s, clock) = store();
        let (c, k) = (ContestId::from("demo"), RankingKey::from("c"));
        s.invalidate(&c, &k).unwrap();
        let t = s.pick_one().unwrap().unwrap();
        let snapshot = b"{\"rows\":[1,2,3]}".repeat(64);
        let built = BuiltRanking { snapshot: snapshot.clone(), pages: vec!["p".into()] };
        s.commit(&t, clock.now(), clock.now(), &built).unwrap();

        let (stored, codec): (Vec<u8>, i64) = s
            .conn()
            .unwrap()
            .query_row("SELECT serialized, serialized_codec FROM ranking WHERE contest_id = 'demo'", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(codec, CODEC_ZSTD);
        assert!(stored.len() < snapshot.len());
        assert_eq!(s.get(&c, &k).unwrap().snapshot, Some(snapshot));
    }

    #[cfg(not(feature = "zstd"))]
    #[test]
    fn compressed_snapshot_needs_the_feature() {
        let (s, _clock) = store();
        let (c, k) = (ContestId::from("demo"), RankingKey::from("c"));
        s.invalidate(&c, &k).unwrap();
        s.conn()
            .unwrap()
            .execute("UPDATE ranking SET serialized = X'00', serialized_codec = ?1", [CODEC_ZSTD])
            .unwrap();
        let err = s.get(&c, &k).unwrap_err();
        assert!(err.to_string().contains("not supported"), "{err}");
    }
}
