//! Embedded command surface for the GritLedger reward system.
//!
//! Host binaries can embed this in three layers:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_reward`] / [`run_jobs`] for execution against open handles.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use grit_ledger_core::{now_utc, parse_rfc3339_utc, ActivitySource, AwardRequest, Tier, UserId};
use grit_ledger_dispatch::{EnqueueOptions, Job, JobError, JobHandler, SqliteJobQueue, WorkerPool};
use grit_ledger_store_sqlite::SqliteRewardStore;
use serde_json::Value;
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "grit")]
#[command(about = "GritLedger XP reward CLI")]
pub struct Cli {
    #[arg(long, default_value = "./grit_ledger.sqlite3")]
    pub db: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
    Activity {
        #[command(subcommand)]
        command: ActivityCommand,
    },
    Xp {
        #[command(subcommand)]
        command: XpCommand,
    },
    Streak {
        #[command(subcommand)]
        command: StreakCommand,
    },
    Leaderboard {
        #[command(subcommand)]
        command: LeaderboardCommand,
    },
    Country {
        #[command(subcommand)]
        command: CountryCommand,
    },
    Season {
        #[command(subcommand)]
        command: SeasonCommand,
    },
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum UserCommand {
    Create(UserCreateArgs),
    Show(UserShowArgs),
}

#[derive(Debug, Args)]
pub struct UserCreateArgs {
    #[arg(long)]
    pub display_name: String,
    #[arg(long)]
    pub country: String,
    #[arg(long, value_enum, default_value_t = TierArg::Fan)]
    pub tier: TierArg,
}

#[derive(Debug, Args)]
pub struct UserShowArgs {
    #[arg(long)]
    pub user_id: String,
}

#[derive(Debug, Subcommand)]
pub enum ActivityCommand {
    Log(ActivityLogArgs),
}

#[derive(Debug, Args)]
pub struct ActivityLogArgs {
    #[arg(long)]
    pub user_id: String,
    #[arg(long, value_enum)]
    pub source: SourceArg,
    #[arg(long)]
    pub occurred_at: Option<String>,
    #[arg(long, default_value = "{}")]
    pub metadata_json: String,
}

#[derive(Debug, Subcommand)]
pub enum XpCommand {
    Award(XpAwardArgs),
    Actions(XpActionsArgs),
    History(XpHistoryArgs),
}

#[derive(Debug, Args)]
pub struct XpAwardArgs {
    #[arg(long)]
    pub user_id: String,
    #[arg(long)]
    pub action: String,
    #[arg(long)]
    pub idempotency_key: Option<String>,
    #[arg(long, default_value = "{}")]
    pub metadata_json: String,
}

#[derive(Debug, Args)]
pub struct XpActionsArgs {
    /// Include disabled actions in the listing.
    #[arg(long)]
    pub all: bool,
}

#[derive(Debug, Args)]
pub struct XpHistoryArgs {
    #[arg(long)]
    pub user_id: String,
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
    #[arg(long, default_value_t = 0)]
    pub offset: usize,
}

#[derive(Debug, Subcommand)]
pub enum StreakCommand {
    Show(StreakArgs),
    Refresh(StreakArgs),
}

#[derive(Debug, Args)]
pub struct StreakArgs {
    #[arg(long)]
    pub user_id: String,
}

#[derive(Debug, Subcommand)]
pub enum LeaderboardCommand {
    Show(LeaderboardShowArgs),
}

#[derive(Debug, Args)]
pub struct LeaderboardShowArgs {
    #[arg(long)]
    pub season: Option<u32>,
    #[arg(long)]
    pub country: Option<String>,
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Debug, Subcommand)]
pub enum CountryCommand {
    Stats(CountryStatsArgs),
    SetBuffer(CountrySetBufferArgs),
    ClearBuffer(CountryClearBufferArgs),
    SetGlobalBuffer(GlobalBufferArgs),
    RefreshActive(RefreshActiveArgs),
}

#[derive(Debug, Args)]
pub struct CountryStatsArgs {
    #[arg(long)]
    pub country: String,
    #[arg(long)]
    pub season: Option<u32>,
}

#[derive(Debug, Args)]
pub struct CountrySetBufferArgs {
    #[arg(long)]
    pub country: String,
    #[arg(long)]
    pub value: f64,
}

#[derive(Debug, Args)]
pub struct CountryClearBufferArgs {
    #[arg(long)]
    pub country: String,
}

#[derive(Debug, Args)]
pub struct GlobalBufferArgs {
    #[arg(long)]
    pub value: f64,
}

#[derive(Debug, Args)]
pub struct RefreshActiveArgs {
    #[arg(long, default_value_t = 30)]
    pub window_days: u32,
}

#[derive(Debug, Subcommand)]
pub enum SeasonCommand {
    Show,
    Start,
}

#[derive(Debug, Subcommand)]
pub enum JobsCommand {
    Enqueue(JobsEnqueueArgs),
    Depths,
    Dead(JobsDeadArgs),
    Replay(JobsJobIdArgs),
    Cancel(JobsJobIdArgs),
    Sweep,
}

#[derive(Debug, Args)]
pub struct JobsEnqueueArgs {
    #[arg(long)]
    pub queue: String,
    #[arg(long)]
    pub job_type: String,
    #[arg(long, default_value = "{}")]
    pub payload_json: String,
    #[arg(long, default_value_t = 0)]
    pub priority: i64,
    #[arg(long)]
    pub dedupe_key: Option<String>,
    #[arg(long)]
    pub max_attempts: Option<u32>,
    #[arg(long, default_value_t = 0)]
    pub delay_ms: i64,
}

#[derive(Debug, Args)]
pub struct JobsDeadArgs {
    #[arg(long)]
    pub queue: Option<String>,
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Debug, Args)]
pub struct JobsJobIdArgs {
    #[arg(long)]
    pub job_id: String,
}

#[derive(Debug, Subcommand)]
pub enum WorkerCommand {
    Run(WorkerRunArgs),
}

#[derive(Debug, Args)]
pub struct WorkerRunArgs {
    /// Queues to drain; repeat the flag for several.
    #[arg(long = "queue")]
    pub queues: Vec<String>,
    #[arg(long, default_value_t = 200)]
    pub poll_ms: u64,
    /// Stop after this many seconds; runs until killed when absent.
    #[arg(long)]
    pub duration_sec: Option<u64>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TierArg {
    Fan,
    Player,
    Pro,
    Founder,
}

impl TierArg {
    fn into_tier(self) -> Tier {
        match self {
            Self::Fan => Tier::Fan,
            Self::Player => Tier::Player,
            Self::Pro => Tier::Pro,
            Self::Founder => Tier::Founder,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SourceArg {
    Workout,
    Meal,
    Warmup,
    ProofSubmission,
}

impl SourceArg {
    fn into_source(self) -> ActivitySource {
        match self {
            Self::Workout => ActivitySource::Workout,
            Self::Meal => ActivitySource::Meal,
            Self::Warmup => ActivitySource::Warmup,
            Self::ProofSubmission => ActivitySource::ProofSubmission,
        }
    }
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open/migrate or command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_command_with_db(&cli.db, cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path. Reward
/// commands and job commands share one database file.
///
/// # Errors
/// Returns an error when open/migrate fails or the requested command fails.
pub fn run_command_with_db(db_path: &Path, command: Command) -> Result<()> {
    match command {
        Command::Jobs { command } => {
            let queue = open_queue(db_path)?;
            run_jobs(command, &queue)
        }
        Command::Worker { command } => {
            let queue = open_queue(db_path)?;
            run_worker(command, &queue)
        }
        reward_command => {
            let mut store = SqliteRewardStore::open(db_path)?;
            store.migrate()?;
            run_reward(reward_command, &mut store)
        }
    }
}

fn open_queue(db_path: &Path) -> Result<SqliteJobQueue> {
    let path = db_path
        .to_str()
        .ok_or_else(|| anyhow!("database path must be valid UTF-8"))?;
    let queue = SqliteJobQueue::open(path)?;
    queue.migrate()?;
    Ok(queue)
}

/// Executes a reward-side command against an open store handle.
///
/// # Errors
/// Returns an error on validation or persistence failure.
pub fn run_reward(command: Command, store: &mut SqliteRewardStore) -> Result<()> {
    match command {
        Command::User { command } => run_user(command, store),
        Command::Activity { command } => run_activity(command, store),
        Command::Xp { command } => run_xp(command, store),
        Command::Streak { command } => run_streak(command, store),
        Command::Leaderboard { command } => run_leaderboard(command, store),
        Command::Country { command } => run_country(command, store),
        Command::Season { command } => run_season(command, store),
        Command::Jobs { .. } | Command::Worker { .. } => Err(anyhow!(
            "internal dispatch error: job commands are routed before store initialization"
        )),
    }
}

fn run_user(command: UserCommand, store: &mut SqliteRewardStore) -> Result<()> {
    match command {
        UserCommand::Create(args) => {
            let user = store.create_user(
                &args.display_name,
                &args.country,
                args.tier.into_tier(),
                now_utc(),
            )?;
            println!("{}", serde_json::to_string_pretty(&user)?);
            Ok(())
        }
        UserCommand::Show(args) => {
            let user_id = parse_user_id(&args.user_id)?;
            let user = store
                .get_user(user_id)?
                .ok_or_else(|| anyhow!("unknown user {user_id}"))?;
            println!("{}", serde_json::to_string_pretty(&user)?);
            Ok(())
        }
    }
}

fn run_activity(command: ActivityCommand, store: &mut SqliteRewardStore) -> Result<()> {
    match command {
        ActivityCommand::Log(args) => {
            let user_id = parse_user_id(&args.user_id)?;
            let metadata = parse_payload_json(&args.metadata_json)?;
            let occurred_at = parse_optional_utc(args.occurred_at.as_deref())?;
            let log_id = store.log_activity(
                user_id,
                args.source.into_source(),
                occurred_at,
                &metadata,
            )?;
            println!("logged {log_id}");
            Ok(())
        }
    }
}

fn run_xp(command: XpCommand, store: &mut SqliteRewardStore) -> Result<()> {
    match command {
        XpCommand::Award(args) => {
            let request = AwardRequest {
                user_id: parse_user_id(&args.user_id)?,
                action_key: args.action,
                idempotency_key: args.idempotency_key,
                metadata: parse_payload_json(&args.metadata_json)?,
            };
            let outcome = store.award_xp(&request, now_utc())?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        XpCommand::Actions(args) => {
            let actions = store.list_action_configs(args.all)?;
            println!(
                "{:<20} {:>8} {:>12} {:>10} {:>8} {:>8}",
                "action", "xp", "cooldown_s", "daily_cap", "max_mul", "enabled"
            );
            for action in actions {
                println!(
                    "{:<20} {:>8} {:>12} {:>10} {:>8.2} {:>8}",
                    action.action_key,
                    action.xp_value,
                    action.cooldown_sec,
                    action.daily_cap,
                    action.multiplier_cap,
                    action.enabled,
                );
            }
            Ok(())
        }
        XpCommand::History(args) => {
            let user_id = parse_user_id(&args.user_id)?;
            let events = store.xp_history(user_id, args.limit, args.offset)?;
            println!(
                "{:<6} {:<20} {:>6} {:>6} {:>6} {:<22}",
                "seq", "action", "base", "mul", "final", "at"
            );
            for event in events {
                println!(
                    "{:<6} {:<20} {:>6} {:>6.2} {:>6} {:<22}",
                    event.event_seq,
                    event.action_key,
                    event.xp_base,
                    event.xp_multiplier,
                    event.xp_final,
                    grit_ledger_core::format_rfc3339(event.created_at)
                        .map_err(|err| anyhow!(err.to_string()))?,
                );
            }
            Ok(())
        }
    }
}

fn run_streak(command: StreakCommand, store: &mut SqliteRewardStore) -> Result<()> {
    match command {
        StreakCommand::Show(args) => {
            let user_id = parse_user_id(&args.user_id)?;
            let summary = store.streak_summary(user_id, now_utc())?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        StreakCommand::Refresh(args) => {
            let user_id = parse_user_id(&args.user_id)?;
            let summary = store.refresh_streak(user_id, now_utc())?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
    }
}

fn run_leaderboard(command: LeaderboardCommand, store: &mut SqliteRewardStore) -> Result<()> {
    match command {
        LeaderboardCommand::Show(args) => {
            let entries = store.leaderboard(args.season, args.country.as_deref(), args.limit)?;
            println!(
                "{:<6} {:<8} {:>14} {:>10} {:>8}",
                "rank", "country", "score", "total_xp", "active"
            );
            for entry in entries {
                println!(
                    "{:<6} {:<8} {:>14.2} {:>10} {:>8}",
                    entry.rank,
                    entry.country_code,
                    entry.country_score,
                    entry.total_xp,
                    entry.active_users,
                );
            }
            Ok(())
        }
    }
}

fn run_country(command: CountryCommand, store: &mut SqliteRewardStore) -> Result<()> {
    match command {
        CountryCommand::Stats(args) => {
            let stats = store
                .country_stats(&args.country, args.season)?
                .ok_or_else(|| anyhow!("no stats for country {}", args.country))?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        CountryCommand::SetBuffer(args) => {
            store.set_country_buffer_factor(&args.country, args.value)?;
            println!("buffer factor for {} set to {}", args.country, args.value);
            Ok(())
        }
        CountryCommand::ClearBuffer(args) => {
            store.clear_country_buffer_factor(&args.country)?;
            println!("buffer factor for {} cleared", args.country);
            Ok(())
        }
        CountryCommand::SetGlobalBuffer(args) => {
            store.set_global_buffer_factor(args.value)?;
            println!("global buffer factor set to {}", args.value);
            Ok(())
        }
        CountryCommand::RefreshActive(args) => {
            let refreshed = store.refresh_active_users(args.window_days, now_utc())?;
            println!("refreshed {refreshed} countries");
            Ok(())
        }
    }
}

fn run_season(command: SeasonCommand, store: &mut SqliteRewardStore) -> Result<()> {
    match command {
        SeasonCommand::Show => {
            println!("season {}", store.current_season()?);
            Ok(())
        }
        SeasonCommand::Start => {
            println!("season {} started", store.start_season()?);
            Ok(())
        }
    }
}

/// Executes a job-queue command against an open queue handle.
///
/// # Errors
/// Returns an error on validation or persistence failure.
pub fn run_jobs(command: JobsCommand, queue: &SqliteJobQueue) -> Result<()> {
    match command {
        JobsCommand::Enqueue(args) => {
            let payload = parse_payload_json(&args.payload_json)?;
            let options = EnqueueOptions {
                priority: args.priority,
                dedupe_key: args.dedupe_key,
                max_attempts: args.max_attempts,
                delay_ms: args.delay_ms,
            };
            let job = queue.enqueue(&args.queue, &args.job_type, &payload, &options, now_utc())?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
        JobsCommand::Depths => {
            let depths = queue.depths()?;
            println!(
                "{:<16} {:>8} {:>8} {:>8}",
                "queue", "waiting", "active", "dead"
            );
            for row in depths {
                println!(
                    "{:<16} {:>8} {:>8} {:>8}",
                    row.queue_name, row.waiting, row.active, row.dead
                );
            }
            Ok(())
        }
        JobsCommand::Dead(args) => {
            let dead = queue.list_dead(args.queue.as_deref(), args.limit)?;
            println!("{}", serde_json::to_string_pretty(&dead)?);
            Ok(())
        }
        JobsCommand::Replay(args) => {
            let job = queue.replay_dead(parse_job_id(&args.job_id)?, now_utc())?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
        JobsCommand::Cancel(args) => {
            let cancelled = queue.cancel(parse_job_id(&args.job_id)?, now_utc())?;
            if cancelled {
                println!("cancelled");
            } else {
                println!("not cancellable (missing or already running)");
            }
            Ok(())
        }
        JobsCommand::Sweep => {
            let swept = queue.sweep_retention(now_utc())?;
            println!("swept {swept} jobs");
            Ok(())
        }
    }
}

fn run_worker(command: WorkerCommand, queue: &SqliteJobQueue) -> Result<()> {
    match command {
        WorkerCommand::Run(args) => {
            if args.queues.is_empty() {
                return Err(anyhow!("at least one --queue is required"));
            }

            let handlers: Vec<Arc<dyn JobHandler>> = args
                .queues
                .iter()
                .map(|name| Arc::new(EchoHandler { queue: name.clone() }) as Arc<dyn JobHandler>)
                .collect();

            let pool = WorkerPool::start(queue, handlers, Duration::from_millis(args.poll_ms))?;
            match args.duration_sec {
                Some(seconds) => std::thread::sleep(Duration::from_secs(seconds)),
                None => loop {
                    std::thread::sleep(Duration::from_secs(60));
                },
            }
            pool.shutdown();
            Ok(())
        }
    }
}

/// Stand-in delivery handler for local operation: emits the payload to the
/// log and acks. Production deployments swap in real transport handlers.
struct EchoHandler {
    pub queue: String,
}

impl JobHandler for EchoHandler {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    fn handle(&self, job: &Job) -> Result<(), JobError> {
        let payload = serde_json::to_string(&job.payload)
            .map_err(|err| JobError::Permanent(format!("unserializable payload: {err}")))?;
        tracing::info!(queue = %self.queue, job = %job.job_id, %payload, "delivered");
        Ok(())
    }
}

fn parse_user_id(raw: &str) -> Result<UserId> {
    let parsed =
        Ulid::from_string(raw.trim()).with_context(|| format!("invalid ULID user_id: {raw}"))?;
    Ok(UserId(parsed))
}

fn parse_job_id(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw.trim()).with_context(|| format!("invalid ULID job_id: {raw}"))
}

fn parse_payload_json(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("invalid JSON payload: {raw}"))
}

fn parse_optional_utc(raw: Option<&str>) -> Result<time::OffsetDateTime> {
    match raw {
        Some(value) => parse_rfc3339_utc(value).map_err(|err| anyhow!(err.to_string())),
        None => Ok(now_utc()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn parse_payload_accepts_valid_json() {
        let value = must(parse_payload_json(r#"{"key":"value"}"#));
        assert_eq!(value["key"], json!("value"));
    }

    #[test]
    fn parse_payload_rejects_invalid_json() {
        assert!(parse_payload_json("{").is_err());
    }

    #[test]
    fn parse_optional_utc_rejects_non_utc() {
        assert!(parse_optional_utc(Some("2026-08-29T12:00:00+02:00")).is_err());
    }

    #[test]
    fn parse_user_id_rejects_garbage() {
        assert!(parse_user_id("not-a-ulid").is_err());
    }

    #[test]
    fn cli_parses_award_command() {
        let cli = match Cli::try_parse_from([
            "grit",
            "xp",
            "award",
            "--user-id",
            "01J0SQQP7M70P6Y3R4T8D8G8M2",
            "--action",
            "workout_complete",
            "--idempotency-key",
            "req-1",
        ]) {
            Ok(value) => value,
            Err(err) => panic!("failed to parse cli args: {err}"),
        };

        match cli.command {
            Command::Xp {
                command: XpCommand::Award(args),
            } => {
                assert_eq!(args.action, "workout_complete");
                assert_eq!(args.idempotency_key.as_deref(), Some("req-1"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cli_parses_worker_run_with_repeated_queues() {
        let cli = match Cli::try_parse_from([
            "grit",
            "worker",
            "run",
            "--queue",
            "email",
            "--queue",
            "webhook",
            "--duration-sec",
            "1",
        ]) {
            Ok(value) => value,
            Err(err) => panic!("failed to parse cli args: {err}"),
        };

        match cli.command {
            Command::Worker {
                command: WorkerCommand::Run(args),
            } => {
                assert_eq!(args.queues, vec!["email", "webhook"]);
                assert_eq!(args.duration_sec, Some(1));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
