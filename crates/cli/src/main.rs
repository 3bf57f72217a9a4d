use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use rankd_core::config::parse_secs;
use rankd_core::{Clock, ContestId, EngineConfig, RankingKey, RankingRecord, RankingView, SystemClock};
use rankd_persist::{RankingStore, SqliteStore};
use rankd_worker::{spawn_worker, CommandBuilder, Tick, Worker};
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "rankd", version, about = "Ranking recalculation daemon")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// SQLite database (default: RANKD_DB_PATH or ~/.rankd/rankd.db)
    #[arg(long = "db", global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the recalculation loop
    Daemon {
        /// Run a single iteration and exit
        #[arg(long = "once", action = ArgAction::SetTrue)]
        once: bool,
        /// Idle sleep between polls, in seconds
        #[arg(long = "polling-interval", value_parser = secs)]
        polling_interval: Option<Duration>,
        #[arg(long = "min-cooldown", value_parser = secs)]
        min_cooldown: Option<Duration>,
        #[arg(long = "max-cooldown", value_parser = secs)]
        max_cooldown: Option<Duration>,
        #[arg(long = "cooldown-factor")]
        cooldown_factor: Option<f64>,
        /// Reclaim rankings whose ticket is older than this many seconds (0 = never)
        #[arg(long = "ticket-ttl", value_parser = secs)]
        ticket_ttl: Option<Duration>,
        /// Builder command line as one string, split on whitespace; used when no PROG is given
        #[arg(long = "builder-cmd", env = "RANKD_BUILDER_CMD")]
        builder_cmd: Option<String>,
        /// Builder program and its arguments, passed through verbatim; contest and key are appended
        #[arg(value_name = "PROG", num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
        builder: Vec<String>,
    },
    /// Mark rankings stale
    Invalidate {
        contest: String,
        /// Ranking keys, e.g. "c" for the contest-wide ranking
        #[arg(num_args = 1.., required = true)]
        keys: Vec<String>,
    },
    /// Mark every ranking of a contest stale
    InvalidateContest { contest: String },
    /// Mark every ranking in the database stale
    InvalidateEverywhere,
    /// Print the last published ranking
    Show {
        contest: String,
        key: String,
        /// Only this page (numbered from 1)
        #[arg(long = "page")]
        page: Option<usize>,
    },
    /// List rankings and their recalculation state
    Status {
        #[arg(long = "contest")]
        contest: Option<String>,
    },
}

fn secs(s: &str) -> Result<Duration, String> {
    parse_secs(s).ok_or_else(|| format!("expected non-negative seconds, got {s:?}"))
}

fn init_tracing() {
    let env = std::env::var("RANKD_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("RANKD_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid RANKD_METRICS_ADDR; expected host:port");
        }
    }
}

#[derive(Serialize)]
struct RecordRow<'a> {
    #[serde(flatten)]
    record: &'a RankingRecord,
    state: String,
    up_to_date: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let mut cfg = EngineConfig::from_env().context("reading RANKD_* configuration")?;
    if let Some(db) = cli.db.clone() {
        cfg.db_path = db;
    }

    match cli.command {
        Commands::Daemon {
            once,
            polling_interval,
            min_cooldown,
            max_cooldown,
            cooldown_factor,
            ticket_ttl,
            builder_cmd,
            builder,
        } => {
            if let Some(d) = polling_interval { cfg.polling_interval = d; }
            if let Some(d) = min_cooldown { cfg.cooldown.min = d; }
            if let Some(d) = max_cooldown { cfg.cooldown.max = d; }
            if let Some(f) = cooldown_factor { cfg.cooldown.factor = f; }
            if let Some(d) = ticket_ttl { cfg.ticket_ttl = if d.is_zero() { None } else { Some(d) }; }
            cfg.validate().context("invalid daemon configuration")?;

            let argv = builder_argv(builder, builder_cmd.as_deref())?;
            let (program, args) = argv.split_first().context("empty builder command")?;
            let builder = CommandBuilder::new(program).args(args);
            let store = Arc::new(SqliteStore::open(&cfg.db_path, &cfg)?);
            let worker = Worker::new(store, Arc::new(builder), &cfg);
            info!(
                db = %cfg.db_path.display(),
                polling_ms = cfg.polling_interval.as_millis() as u64,
                min_cooldown_ms = cfg.cooldown.min.as_millis() as u64,
                max_cooldown_ms = cfg.cooldown.max.as_millis() as u64,
                factor = cfg.cooldown.factor,
                "daemon configured"
            );

            if once {
                let tick = tokio::task::spawn_blocking(move || worker.tick()).await??;
                print_tick(&tick, cli.output)?;
                return Ok(());
            }

            let (stop, handle) = spawn_worker(worker);
            signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("Ctrl-C received; stopping after the current recalculation");
            let _ = stop.send(true);
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task ended abnormally");
            }
        }
        Commands::Invalidate { contest, keys } => {
            let store = SqliteStore::open(&cfg.db_path, &cfg)?;
            let keys: Vec<RankingKey> = keys.into_iter().map(RankingKey::from).collect();
            let n = store.invalidate_keys(&ContestId::from(contest), &keys)?;
            report(cli.output, n)?;
        }
        Commands::InvalidateContest { contest } => {
            let store = SqliteStore::open(&cfg.db_path, &cfg)?;
            let n = store.invalidate_all(&ContestId::from(contest))?;
            report(cli.output, n)?;
        }
        Commands::InvalidateEverywhere => {
            let store = SqliteStore::open(&cfg.db_path, &cfg)?;
            let n = store.invalidate_all_everywhere()?;
            report(cli.output, n)?;
        }
        Commands::Show { contest, key, page } => {
            let store = SqliteStore::open(&cfg.db_path, &cfg)?;
            let (contest, key) = (ContestId::from(contest), RankingKey::from(key));
            let view = store.get(&contest, &key)?;
            let pages: Vec<String> = match page {
                Some(nr) => store.page(&contest, &key, nr)?.into_iter().collect(),
                None => view.pages.clone(),
            };
            match cli.output {
                Output::Human => {
                    if view.snapshot.is_none() && view.pages.is_empty() {
                        eprintln!("{}/{}: not computed yet", contest, key);
                        return Ok(());
                    }
                    if !view.up_to_date {
                        eprintln!("{}/{}: being recalculated; showing last result", contest, key);
                    }
                    for p in pages {
                        println!("{}", p);
                    }
                }
                Output::Json => println!("{}", show_json(&view, pages)?),
            }
        }
        Commands::Status { contest } => {
            let store = SqliteStore::open(&cfg.db_path, &cfg)?;
            let contest = contest.map(ContestId::from);
            let records = store.list(contest.as_ref())?;
            let now = SystemClock.now();
            match cli.output {
                Output::Human => print!("{}", status_table(&records, now)),
                Output::Json => println!("{}", status_json(&records, now)?),
            }
        }
    }

    Ok(())
}

/// Positional PROG ARGS.. win; otherwise the single-string form is split on whitespace.
fn builder_argv(builder: Vec<String>, builder_cmd: Option<&str>) -> Result<Vec<String>> {
    if !builder.is_empty() {
        return Ok(builder);
    }
    let argv: Vec<String> = builder_cmd.unwrap_or_default().split_whitespace().map(str::to_string).collect();
    if argv.is_empty() {
        bail!("no builder command given (pass PROG [ARGS..], --builder-cmd or RANKD_BUILDER_CMD)");
    }
    Ok(argv)
}

fn show_json(view: &RankingView, pages: Vec<String>) -> Result<String> {
    #[derive(Serialize)]
    struct Shown {
        up_to_date: bool,
        snapshot: Option<String>,
        pages: Vec<String>,
    }
    let shown = Shown {
        up_to_date: view.up_to_date,
        snapshot: view.snapshot.as_deref().map(|b| String::from_utf8_lossy(b).into_owned()),
        pages,
    };
    Ok(serde_json::to_string_pretty(&shown)?)
}

fn status_table(records: &[RankingRecord], now: DateTime<Utc>) -> String {
    let mut out = format!("{:<16} {:<10} {:<15} {:>5} {:>10} {}\n", "CONTEST", "KEY", "STATE", "PAGES", "LAST", "COOLDOWN");
    for r in records {
        let last = if r.last_recalculation_started.is_some() {
            format!("{:.1}s", r.last_recalculation_duration.as_secs_f64())
        } else {
            "-".to_string()
        };
        out.push_str(&format!(
            "{:<16} {:<10} {:<15} {:>5} {:>10} {}\n",
            r.contest_id,
            r.key,
            r.state(now),
            r.page_count,
            last,
            render_cooldown(r, now)
        ));
    }
    out
}

fn status_json(records: &[RankingRecord], now: DateTime<Utc>) -> Result<String> {
    let rows: Vec<_> = records
        .iter()
        .map(|r| RecordRow { record: r, state: r.state(now).to_string(), up_to_date: r.is_up_to_date() })
        .collect();
    Ok(serde_json::to_string_pretty(&rows)?)
}

fn report(output: Output, n: usize) -> Result<()> {
    match output {
        Output::Human => println!("invalidated {} ranking(s)", n),
        Output::Json => println!("{}", serde_json::json!({ "invalidated": n })),
    }
    Ok(())
}

fn print_tick(tick: &Tick, output: Output) -> Result<()> {
    let (outcome, detail) = match tick {
        Tick::Idle => ("idle", String::new()),
        Tick::Committed { contest_id, key, pages, duration } => {
            ("committed", format!("{}/{} pages={} took={:.3}s", contest_id, key, pages, duration.as_secs_f64()))
        }
        Tick::Failed { contest_id, key, error } => ("failed", format!("{}/{}: {}", contest_id, key, error)),
        Tick::Lost { contest_id, key } => ("lost", format!("{}/{}", contest_id, key)),
    };
    match output {
        Output::Human => println!("{} {}", outcome, detail),
        Output::Json => println!("{}", serde_json::json!({ "outcome": outcome, "detail": detail })),
    }
    Ok(())
}

fn render_cooldown(r: &RankingRecord, now: DateTime<Utc>) -> String {
    if r.cooldown_until <= now {
        return "-".to_string();
    }
    let secs = (r.cooldown_until - now).num_milliseconds() as f64 / 1000.0;
    format!("{:.1}s", secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rankd_core::TicketId;

    fn daemon(argv: &[&str]) -> (Option<String>, Vec<String>) {
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Daemon { builder_cmd, builder, .. } => (builder_cmd, builder),
            other => panic!("parsed as {other:?}"),
        }
    }

    #[test]
    fn builder_arguments_keep_their_spaces() {
        let (_, builder) = daemon(&["rankd", "daemon", "--once", "sh", "-c", "printf '{}' $0 $1"]);
        assert_eq!(builder, vec!["sh", "-c", "printf '{}' $0 $1"]);
        assert_eq!(builder_argv(builder, Some("ignored cmd")).unwrap(), vec!["sh", "-c", "printf '{}' $0 $1"]);
    }

    #[test]
    fn builder_cmd_string_is_split() {
        let (cmd, builder) = daemon(&["rankd", "daemon", "--builder-cmd", "python3 build.py --fast"]);
        assert!(builder.is_empty());
        assert_eq!(builder_argv(builder, cmd.as_deref()).unwrap(), vec!["python3", "build.py", "--fast"]);
        assert!(builder_argv(Vec::new(), Some("   ")).is_err());
    }

    #[test]
    fn daemon_flags_parse_seconds() {
        let cli = Cli::try_parse_from(["rankd", "-o", "json", "daemon", "--min-cooldown", "0.5", "--ticket-ttl", "0", "b"])
            .unwrap();
        assert_eq!(cli.output, Output::Json);
        match cli.command {
            Commands::Daemon { min_cooldown, ticket_ttl, .. } => {
                assert_eq!(min_cooldown, Some(Duration::from_millis(500)));
                assert_eq!(ticket_ttl, Some(Duration::ZERO));
            }
            other => panic!("parsed as {other:?}"),
        }
        assert!(Cli::try_parse_from(["rankd", "daemon", "--min-cooldown", "-1", "b"]).is_err());
    }

    #[test]
    fn invalidate_requires_a_key() {
        assert!(Cli::try_parse_from(["rankd", "invalidate", "demo"]).is_err());
        let cli = Cli::try_parse_from(["rankd", "invalidate", "demo", "c", "r1"]).unwrap();
        assert!(matches!(cli.command, Commands::Invalidate { keys, .. } if keys == ["c", "r1"]));
    }

    fn record(now: DateTime<Utc>) -> RankingRecord {
        RankingRecord {
            id: 1,
            contest_id: "demo".into(),
            key: "c".into(),
            needs_recalculation: true,
            invalidation_timestamp: now,
            cooldown_until: now + chrono::TimeDelta::seconds(4),
            last_recalculation_started: Some(now - chrono::TimeDelta::seconds(10)),
            last_recalculation_duration: Duration::from_millis(2500),
            recalc_ticket: None,
            serialized_snapshot: Some(b"{}".to_vec()),
            page_count: 2,
        }
    }

    #[test]
    fn status_table_shows_state_and_cooldown() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let table = status_table(&[record(now)], now);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("CONTEST"));
        let cols: Vec<&str> = lines[1].split_whitespace().collect();
        assert_eq!(cols, vec!["demo", "c", "stale-cooling", "2", "2.5s", "4.0s"]);
    }

    #[test]
    fn status_json_flattens_records() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut r = record(now);
        r.recalc_ticket = Some(TicketId::new());
        let rows: serde_json::Value = serde_json::from_str(&status_json(&[r], now).unwrap()).unwrap();
        assert_eq!(rows[0]["contest_id"], "demo");
        assert_eq!(rows[0]["state"], "recalculating");
        assert_eq!(rows[0]["up_to_date"], false);
        assert!(rows[0].get("serialized_snapshot").is_none());
    }

    #[test]
    fn show_json_renders_snapshot_text() {
        let view = RankingView { up_to_date: true, snapshot: Some(b"{\"n\":1}".to_vec()), pages: vec!["p1".into()] };
        let shown: serde_json::Value = serde_json::from_str(&show_json(&view, view.pages.clone()).unwrap()).unwrap();
        assert_eq!(shown["up_to_date"], true);
        assert_eq!(shown["snapshot"], "{\"n\":1}");
        assert_eq!(shown["pages"][0], "p1");
    }
}
