#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use grit_ledger_core::{
    apply_multiplier, compute_streak, cooldown_remaining_sec, country_score, days_between,
    default_action_catalog, format_date, format_rfc3339, normalize_country_code, now_utc,
    parse_date, parse_rfc3339_utc, start_of_utc_day, utc_day, weighted_contribution, ActionConfig,
    ActivitySource, AwardDenial, AwardOutcome, AwardRequest, CountryStats, LeaderboardEntry,
    RewardRuleset, StreakSummary, Tier, User, UserId, XpEvent,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

const REWARD_MIGRATION_VERSION: i64 = 1;

const SETTING_CURRENT_SEASON: &str = "current_season";
const SETTING_GLOBAL_BUFFER_FACTOR: &str = "global_buffer_factor";

const SCHEMA_REWARD_V1: &str = r"
CREATE TABLE IF NOT EXISTS reward_rulesets (
  ruleset_version INTEGER PRIMARY KEY,
  ruleset_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS settings (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
  user_id TEXT PRIMARY KEY,
  display_name TEXT NOT NULL,
  xp_points INTEGER NOT NULL DEFAULT 0 CHECK (xp_points >= 0),
  current_streak INTEGER NOT NULL DEFAULT 0 CHECK (current_streak >= 0),
  longest_streak INTEGER NOT NULL DEFAULT 0 CHECK (longest_streak >= 0),
  country_code TEXT NOT NULL CHECK (length(country_code) = 2),
  tier TEXT NOT NULL CHECK (tier IN ('fan', 'player', 'pro', 'founder')),
  joined_at TEXT NOT NULL,
  last_activity_date TEXT
);

CREATE TABLE IF NOT EXISTS action_configs (
  action_key TEXT PRIMARY KEY,
  xp_value INTEGER NOT NULL CHECK (xp_value >= 0),
  cooldown_sec INTEGER NOT NULL CHECK (cooldown_sec >= 0),
  daily_cap INTEGER NOT NULL CHECK (daily_cap >= 0),
  multiplier_cap REAL NOT NULL CHECK (multiplier_cap >= 1.0),
  enabled INTEGER NOT NULL DEFAULT 1 CHECK (enabled IN (0, 1))
);

CREATE TABLE IF NOT EXISTS xp_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  user_id TEXT NOT NULL,
  action_key TEXT NOT NULL,
  xp_base INTEGER NOT NULL CHECK (xp_base >= 0),
  xp_multiplier REAL NOT NULL CHECK (xp_multiplier >= 0.0),
  xp_final INTEGER NOT NULL CHECK (xp_final >= 0),
  streak_days_at_award INTEGER NOT NULL CHECK (streak_days_at_award >= 0),
  idempotency_key TEXT UNIQUE,
  metadata_json TEXT NOT NULL DEFAULT '{}',
  created_at TEXT NOT NULL,
  FOREIGN KEY (user_id) REFERENCES users(user_id)
);

CREATE TRIGGER IF NOT EXISTS trg_xp_events_no_update
BEFORE UPDATE ON xp_events
BEGIN
  SELECT RAISE(FAIL, 'xp_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_xp_events_no_delete
BEFORE DELETE ON xp_events
BEGIN
  SELECT RAISE(FAIL, 'xp_events is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_xp_events_user_seq
  ON xp_events(user_id, event_seq DESC);
CREATE INDEX IF NOT EXISTS idx_xp_events_user_action_created
  ON xp_events(user_id, action_key, created_at);

CREATE TABLE IF NOT EXISTS workout_logs (
  log_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  occurred_at TEXT NOT NULL,
  metadata_json TEXT NOT NULL DEFAULT '{}',
  FOREIGN KEY (user_id) REFERENCES users(user_id)
);
CREATE INDEX IF NOT EXISTS idx_workout_logs_user_occurred
  ON workout_logs(user_id, occurred_at);

CREATE TABLE IF NOT EXISTS meal_logs (
  log_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  occurred_at TEXT NOT NULL,
  metadata_json TEXT NOT NULL DEFAULT '{}',
  FOREIGN KEY (user_id) REFERENCES users(user_id)
);
CREATE INDEX IF NOT EXISTS idx_meal_logs_user_occurred
  ON meal_logs(user_id, occurred_at);

CREATE TABLE IF NOT EXISTS warmup_logs (
  log_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  occurred_at TEXT NOT NULL,
  metadata_json TEXT NOT NULL DEFAULT '{}',
  FOREIGN KEY (user_id) REFERENCES users(user_id)
);
CREATE INDEX IF NOT EXISTS idx_warmup_logs_user_occurred
  ON warmup_logs(user_id, occurred_at);

CREATE TABLE IF NOT EXISTS proof_submissions (
  log_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  occurred_at TEXT NOT NULL,
  metadata_json TEXT NOT NULL DEFAULT '{}',
  FOREIGN KEY (user_id) REFERENCES users(user_id)
);
CREATE INDEX IF NOT EXISTS idx_proof_submissions_user_occurred
  ON proof_submissions(user_id, occurred_at);

CREATE TABLE IF NOT EXISTS country_stats (
  country_code TEXT NOT NULL CHECK (length(country_code) = 2),
  season INTEGER NOT NULL CHECK (season >= 1),
  total_xp INTEGER NOT NULL DEFAULT 0 CHECK (total_xp >= 0),
  active_users INTEGER NOT NULL DEFAULT 0 CHECK (active_users >= 0),
  buffer_factor REAL CHECK (buffer_factor >= 0.0 OR buffer_factor IS NULL),
  country_score REAL NOT NULL DEFAULT 0.0,
  last_updated TEXT NOT NULL,
  PRIMARY KEY (country_code, season)
);

CREATE INDEX IF NOT EXISTS idx_country_stats_season_score
  ON country_stats(season, country_score DESC);

CREATE TABLE IF NOT EXISTS country_contributions (
  user_id TEXT NOT NULL,
  contribution_date TEXT NOT NULL,
  country_code TEXT NOT NULL CHECK (length(country_code) = 2),
  season INTEGER NOT NULL CHECK (season >= 1),
  xp_contributed INTEGER NOT NULL DEFAULT 0 CHECK (xp_contributed >= 0),
  PRIMARY KEY (user_id, contribution_date),
  FOREIGN KEY (user_id) REFERENCES users(user_id)
);

CREATE INDEX IF NOT EXISTS idx_country_contributions_country_season
  ON country_contributions(country_code, season, contribution_date);
";

pub struct SqliteRewardStore {
    conn: Connection,
}

impl SqliteRewardStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_REWARD_V1)
            .context("failed to apply reward schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![REWARD_MIGRATION_VERSION, now],
            )
            .context("failed to register reward schema migration")?;

        self.upsert_ruleset(&RewardRuleset::v1())?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO settings(key, value) VALUES (?1, '1')",
                params![SETTING_CURRENT_SEASON],
            )
            .context("failed to initialize current season")?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO settings(key, value) VALUES (?1, ?2)",
                params![
                    SETTING_GLOBAL_BUFFER_FACTOR,
                    RewardRuleset::v1().default_buffer_factor.to_string()
                ],
            )
            .context("failed to initialize global buffer factor")?;

        for action in default_action_catalog() {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO action_configs(
                        action_key, xp_value, cooldown_sec, daily_cap, multiplier_cap, enabled
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        action.action_key,
                        action.xp_value,
                        action.cooldown_sec,
                        i64::from(action.daily_cap),
                        action.multiplier_cap,
                        bool_to_sql(action.enabled),
                    ],
                )
                .with_context(|| format!("failed to seed action {}", action.action_key))?;
        }

        Ok(())
    }

    pub fn upsert_ruleset(&self, ruleset: &RewardRuleset) -> Result<()> {
        ruleset
            .validate()
            .map_err(|err| anyhow!("invalid ruleset configuration: {err}"))?;

        let payload = serde_json::to_string(ruleset).context("failed to serialize ruleset")?;
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        self.conn
            .execute(
                "INSERT INTO reward_rulesets(ruleset_version, ruleset_json, created_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(ruleset_version) DO UPDATE SET
                   ruleset_json = excluded.ruleset_json,
                   created_at = excluded.created_at",
                params![i64::from(ruleset.ruleset_version), payload, now],
            )
            .context("failed to upsert ruleset")?;

        Ok(())
    }

    pub fn active_ruleset(&self) -> Result<RewardRuleset> {
        let json: String = self
            .conn
            .query_row(
                "SELECT ruleset_json FROM reward_rulesets ORDER BY ruleset_version DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .context("no ruleset installed; run migrate first")?;

        let value: Value = serde_json::from_str(&json).context("invalid stored ruleset JSON")?;
        RewardRuleset::from_json(&value).map_err(|err| anyhow!("failed to parse ruleset: {err}"))
    }

    pub fn create_user(
        &self,
        display_name: &str,
        country_code: &str,
        tier: Tier,
        now: OffsetDateTime,
    ) -> Result<User> {
        if display_name.trim().is_empty() {
            return Err(anyhow!("display_name MUST NOT be empty"));
        }
        let country = normalize_country_code(country_code).map_err(|err| anyhow!("{err}"))?;

        let user = User {
            user_id: UserId(Ulid::new()),
            display_name: display_name.trim().to_string(),
            xp_points: 0,
            current_streak: 0,
            longest_streak: 0,
            country_code: country,
            tier,
            joined_at: now,
            last_activity_date: None,
        };

        self.conn
            .execute(
                "INSERT INTO users(
                    user_id, display_name, xp_points, current_streak, longest_streak,
                    country_code, tier, joined_at, last_activity_date
                 ) VALUES (?1, ?2, 0, 0, 0, ?3, ?4, ?5, NULL)",
                params![
                    user.user_id.to_string(),
                    user.display_name,
                    user.country_code,
                    user.tier.as_str(),
                    format_rfc3339(user.joined_at).map_err(|err| anyhow!(err.to_string()))?,
                ],
            )
            .context("failed to insert user")?;

        Ok(user)
    }

    pub fn get_user(&self, user_id: UserId) -> Result<Option<User>> {
        self.conn
            .query_row(
                "SELECT user_id, display_name, xp_points, current_streak, longest_streak,
                        country_code, tier, joined_at, last_activity_date
                 FROM users WHERE user_id = ?1",
                params![user_id.to_string()],
                parse_user_row,
            )
            .optional()
            .context("failed to load user")
    }

    pub fn upsert_action_config(&self, action: &ActionConfig) -> Result<()> {
        action
            .validate()
            .map_err(|err| anyhow!("invalid action configuration: {err}"))?;

        self.conn
            .execute(
                "INSERT INTO action_configs(
                    action_key, xp_value, cooldown_sec, daily_cap, multiplier_cap, enabled
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(action_key) DO UPDATE SET
                   xp_value = excluded.xp_value,
                   cooldown_sec = excluded.cooldown_sec,
                   daily_cap = excluded.daily_cap,
                   multiplier_cap = excluded.multiplier_cap,
                   enabled = excluded.enabled",
                params![
                    action.action_key,
                    action.xp_value,
                    action.cooldown_sec,
                    i64::from(action.daily_cap),
                    action.multiplier_cap,
                    bool_to_sql(action.enabled),
                ],
            )
            .context("failed to upsert action config")?;

        Ok(())
    }

    pub fn get_action_config(&self, action_key: &str) -> Result<Option<ActionConfig>> {
        self.conn
            .query_row(
                "SELECT action_key, xp_value, cooldown_sec, daily_cap, multiplier_cap, enabled
                 FROM action_configs WHERE action_key = ?1",
                params![action_key],
                parse_action_row,
            )
            .optional()
            .context("failed to load action config")
    }

    pub fn list_action_configs(&self, include_disabled: bool) -> Result<Vec<ActionConfig>> {
        let query = if include_disabled {
            "SELECT action_key, xp_value, cooldown_sec, daily_cap, multiplier_cap, enabled
             FROM action_configs ORDER BY action_key ASC"
        } else {
            "SELECT action_key, xp_value, cooldown_sec, daily_cap, multiplier_cap, enabled
             FROM action_configs WHERE enabled = 1 ORDER BY action_key ASC"
        };

        let mut stmt = self.conn.prepare(query)?;
        let rows = stmt.query_map([], parse_action_row)?;
        collect_rows(rows)
    }

    /// Records a raw activity entry in the source's collaborator table.
    /// Activity logging never grants XP by itself; the award pipeline and
    /// the streak calculator both read these tables.
    pub fn log_activity(
        &self,
        user_id: UserId,
        source: ActivitySource,
        occurred_at: OffsetDateTime,
        metadata: &Value,
    ) -> Result<Ulid> {
        if self.get_user(user_id)?.is_none() {
            return Err(anyhow!("unknown user {user_id}"));
        }

        let log_id = Ulid::new();
        let query = format!(
            "INSERT INTO {}(log_id, user_id, occurred_at, metadata_json) VALUES (?1, ?2, ?3, ?4)",
            source.table_name()
        );
        self.conn
            .execute(
                &query,
                params![
                    log_id.to_string(),
                    user_id.to_string(),
                    format_rfc3339(occurred_at).map_err(|err| anyhow!(err.to_string()))?,
                    serde_json::to_string(metadata).context("failed to serialize metadata")?,
                ],
            )
            .with_context(|| format!("failed to insert {} row", source.table_name()))?;

        Ok(log_id)
    }

    /// Runs the full award pipeline in one transaction: idempotency replay,
    /// action lookup, cooldown and daily-cap checks, multiplier composition,
    /// ledger append, balance update, and country aggregation.
    ///
    /// Business-rule rejections come back inside the outcome; only storage
    /// trouble surfaces as an error.
    pub fn award_xp(&mut self, request: &AwardRequest, now: OffsetDateTime) -> Result<AwardOutcome> {
        request
            .validate()
            .map_err(|err| anyhow!("award validation failed: {err}"))?;

        let ruleset = self.active_ruleset()?;
        let season = self.current_season()?;
        let global_buffer = self.global_buffer_factor()?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start award transaction")?;

        if let Some(key) = &request.idempotency_key {
            if let Some(outcome) = replay_outcome(&tx, request.user_id, key)? {
                tx.commit().context("failed to commit award transaction")?;
                return Ok(outcome);
            }
        }

        let Some(user) = load_user(&tx, request.user_id)? else {
            return Ok(AwardOutcome::denied(AwardDenial::UserNotFound));
        };

        let Some(action) = load_action(&tx, &request.action_key)? else {
            return Ok(AwardOutcome::denied(AwardDenial::ActionNotFound));
        };
        if !action.enabled {
            return Ok(AwardOutcome::denied(AwardDenial::ActionDisabled));
        }

        if action.cooldown_sec > 0 {
            if let Some(last) = last_award_at(&tx, user.user_id, &action.action_key)? {
                let remaining = cooldown_remaining_sec(last, now, action.cooldown_sec);
                if remaining > 0 {
                    return Ok(AwardOutcome::denied(AwardDenial::CooldownActive {
                        retry_in_sec: remaining,
                    }));
                }
            }
        }

        if action.daily_cap > 0 {
            let today_count = awards_since(&tx, user.user_id, &action.action_key, start_of_utc_day(now))?;
            if today_count >= i64::from(action.daily_cap) {
                return Ok(AwardOutcome::denied(AwardDenial::DailyCapReached {
                    cap: action.daily_cap,
                }));
            }
        }

        let streak = streak_from_activity(&tx, user.user_id, utc_day(now))?;
        let tenure = days_between(user.joined_at, now);
        let streak_multiplier = ruleset.streak_multiplier(streak.current_streak);
        let multiplier =
            ruleset.total_multiplier(streak.current_streak, user.tier, tenure, action.multiplier_cap);
        let xp_final = apply_multiplier(action.xp_value, multiplier);

        let event_id = Ulid::new();
        let created_at = format_rfc3339(now).map_err(|err| anyhow!(err.to_string()))?;
        let insert_result = tx.execute(
            "INSERT INTO xp_events(
                event_id, user_id, action_key, xp_base, xp_multiplier, xp_final,
                streak_days_at_award, idempotency_key, metadata_json, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                event_id.to_string(),
                user.user_id.to_string(),
                action.action_key,
                action.xp_value,
                multiplier,
                xp_final,
                i64::from(streak.current_streak),
                request.idempotency_key,
                serde_json::to_string(&request.metadata)
                    .context("failed to serialize award metadata")?,
                created_at,
            ],
        );

        match insert_result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(code, _))
                if code.code == rusqlite::ErrorCode::ConstraintViolation
                    && request.idempotency_key.is_some() =>
            {
                // Lost a race on the idempotency key; serve the winner's record.
                if let Some(key) = &request.idempotency_key {
                    if let Some(outcome) = replay_outcome(&tx, request.user_id, key)? {
                        tx.commit().context("failed to commit award transaction")?;
                        return Ok(outcome);
                    }
                }
                return Err(anyhow!(
                    "constraint violation on xp_events without a matching idempotency record"
                ));
            }
            Err(err) => return Err(err).context("failed to append xp event"),
        }

        tx.execute(
            "UPDATE users SET
                xp_points = xp_points + ?2,
                current_streak = ?3,
                longest_streak = MAX(longest_streak, ?4),
                last_activity_date = ?5
             WHERE user_id = ?1",
            params![
                user.user_id.to_string(),
                xp_final,
                i64::from(streak.current_streak),
                i64::from(streak.longest_streak),
                match streak.last_activity_date {
                    Some(date) => Some(format_date(date).map_err(|err| anyhow!(err.to_string()))?),
                    None => None,
                },
            ],
        )
        .context("failed to update user balance")?;

        let new_total = user.xp_points + xp_final;

        aggregate_country(
            &tx,
            &user,
            season,
            xp_final,
            streak_multiplier,
            global_buffer,
            now,
        )?;

        tx.commit().context("failed to commit award transaction")?;

        Ok(AwardOutcome::granted(
            xp_final,
            action.xp_value,
            multiplier,
            streak.current_streak,
            new_total,
        ))
    }

    /// Recomputes the streak from all activity sources and persists it.
    /// `longest_streak` only ever ratchets upward.
    pub fn refresh_streak(&mut self, user_id: UserId, now: OffsetDateTime) -> Result<StreakSummary> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start streak transaction")?;

        if load_user(&tx, user_id)?.is_none() {
            return Err(anyhow!("unknown user {user_id}"));
        }

        let streak = streak_from_activity(&tx, user_id, utc_day(now))?;
        tx.execute(
            "UPDATE users SET
                current_streak = ?2,
                longest_streak = MAX(longest_streak, ?3),
                last_activity_date = ?4
             WHERE user_id = ?1",
            params![
                user_id.to_string(),
                i64::from(streak.current_streak),
                i64::from(streak.longest_streak),
                match streak.last_activity_date {
                    Some(date) => Some(format_date(date).map_err(|err| anyhow!(err.to_string()))?),
                    None => None,
                },
            ],
        )
        .context("failed to persist streak")?;

        let persisted = load_user(&tx, user_id)?
            .ok_or_else(|| anyhow!("user disappeared during streak refresh"))?;
        tx.commit().context("failed to commit streak transaction")?;

        Ok(StreakSummary {
            current_streak: persisted.current_streak,
            longest_streak: persisted.longest_streak,
            last_activity_date: persisted.last_activity_date,
        })
    }

    /// Read-only streak derivation, without touching persisted counters.
    pub fn streak_summary(&self, user_id: UserId, now: OffsetDateTime) -> Result<StreakSummary> {
        if self.get_user(user_id)?.is_none() {
            return Err(anyhow!("unknown user {user_id}"));
        }
        streak_from_activity(&self.conn, user_id, utc_day(now))
    }

    pub fn xp_history(
        &self,
        user_id: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<XpEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_seq, event_id, user_id, action_key, xp_base, xp_multiplier, xp_final,
                    streak_days_at_award, idempotency_key, metadata_json, created_at
             FROM xp_events
             WHERE user_id = ?1
             ORDER BY event_seq DESC
             LIMIT ?2 OFFSET ?3",
        )?;

        let rows = stmt.query_map(
            params![
                user_id.to_string(),
                i64::try_from(limit).unwrap_or(i64::MAX),
                i64::try_from(offset).unwrap_or(i64::MAX),
            ],
            parse_event_row,
        )?;
        collect_rows(rows)
    }

    pub fn country_stats(&self, country_code: &str, season: Option<u32>) -> Result<Option<CountryStats>> {
        let country = normalize_country_code(country_code).map_err(|err| anyhow!("{err}"))?;
        let season = match season {
            Some(value) => value,
            None => self.current_season()?,
        };

        self.conn
            .query_row(
                "SELECT country_code, season, total_xp, active_users, buffer_factor,
                        country_score, last_updated
                 FROM country_stats WHERE country_code = ?1 AND season = ?2",
                params![country, i64::from(season)],
                parse_stats_row,
            )
            .optional()
            .context("failed to load country stats")
    }

    /// Ranked season leaderboard, densely numbered from 1. Ties on score
    /// break by country code so ordering stays deterministic.
    pub fn leaderboard(
        &self,
        season: Option<u32>,
        country_filter: Option<&str>,
        limit: usize,
    ) -> Result<Vec<LeaderboardEntry>> {
        let season = match season {
            Some(value) => value,
            None => self.current_season()?,
        };

        let country = match country_filter {
            Some(raw) => Some(normalize_country_code(raw).map_err(|err| anyhow!("{err}"))?),
            None => None,
        };

        let mut stmt = self.conn.prepare(
            "SELECT country_code, total_xp, active_users, country_score
             FROM country_stats
             WHERE season = ?1
             ORDER BY country_score DESC, country_code ASC",
        )?;

        let rows = stmt.query_map(params![i64::from(season)], |row| {
            let country_code: String = row.get(0)?;
            let total_xp: i64 = row.get(1)?;
            let active_users: i64 = row.get(2)?;
            let score: f64 = row.get(3)?;
            Ok((country_code, total_xp, active_users, score))
        })?;

        let mut entries = Vec::new();
        for (rank, row) in collect_rows(rows)?.into_iter().enumerate() {
            let (country_code, total_xp, active_users, score) = row;
            let entry = LeaderboardEntry {
                rank: u32::try_from(rank + 1).context("leaderboard rank overflow")?,
                country_code,
                country_score: score,
                total_xp,
                active_users: u32::try_from(active_users)
                    .context("invalid active_users value")?,
            };

            match &country {
                Some(filter) if &entry.country_code != filter => {}
                _ => entries.push(entry),
            }

            if entries.len() >= limit {
                break;
            }
        }

        Ok(entries)
    }

    /// Sets a per-country damping override and recomputes that country's
    /// score for the current season.
    pub fn set_country_buffer_factor(&mut self, country_code: &str, buffer_factor: f64) -> Result<()> {
        if buffer_factor < 0.0 {
            return Err(anyhow!("buffer_factor MUST be >= 0.0"));
        }
        let country = normalize_country_code(country_code).map_err(|err| anyhow!("{err}"))?;
        let season = self.current_season()?;
        let global = self.global_buffer_factor()?;
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start buffer-factor transaction")?;

        tx.execute(
            "INSERT INTO country_stats(country_code, season, total_xp, active_users, buffer_factor, country_score, last_updated)
             VALUES (?1, ?2, 0, 0, ?3, 0.0, ?4)
             ON CONFLICT(country_code, season) DO UPDATE SET
               buffer_factor = excluded.buffer_factor,
               last_updated = excluded.last_updated",
            params![country, i64::from(season), buffer_factor, now],
        )
        .context("failed to set country buffer factor")?;

        recompute_country_score(&tx, &country, season, global, &now)?;
        tx.commit().context("failed to commit buffer-factor transaction")?;
        Ok(())
    }

    /// Clears the override so the country inherits the global default again.
    pub fn clear_country_buffer_factor(&mut self, country_code: &str) -> Result<()> {
        let country = normalize_country_code(country_code).map_err(|err| anyhow!("{err}"))?;
        let season = self.current_season()?;
        let global = self.global_buffer_factor()?;
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start buffer-factor transaction")?;

        tx.execute(
            "UPDATE country_stats SET buffer_factor = NULL, last_updated = ?3
             WHERE country_code = ?1 AND season = ?2",
            params![country, i64::from(season), now],
        )
        .context("failed to clear country buffer factor")?;

        recompute_country_score(&tx, &country, season, global, &now)?;
        tx.commit().context("failed to commit buffer-factor transaction")?;
        Ok(())
    }

    pub fn global_buffer_factor(&self) -> Result<f64> {
        let raw: String = self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![SETTING_GLOBAL_BUFFER_FACTOR],
                |row| row.get(0),
            )
            .context("global buffer factor missing; run migrate first")?;
        raw.parse()
            .with_context(|| format!("invalid global buffer factor value: {raw}"))
    }

    /// Replaces the global default and recomputes every current-season score
    /// that has no per-country override.
    pub fn set_global_buffer_factor(&mut self, buffer_factor: f64) -> Result<()> {
        if buffer_factor < 0.0 {
            return Err(anyhow!("buffer_factor MUST be >= 0.0"));
        }
        let season = self.current_season()?;
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start buffer-factor transaction")?;

        tx.execute(
            "INSERT INTO settings(key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![SETTING_GLOBAL_BUFFER_FACTOR, buffer_factor.to_string()],
        )
        .context("failed to store global buffer factor")?;

        let countries: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT country_code FROM country_stats WHERE season = ?1 AND buffer_factor IS NULL",
            )?;
            let rows = stmt.query_map(params![i64::from(season)], |row| row.get(0))?;
            collect_rows(rows)?
        };

        for country in countries {
            recompute_country_score(&tx, &country, season, buffer_factor, &now)?;
        }

        tx.commit().context("failed to commit buffer-factor transaction")?;
        Ok(())
    }

    /// Re-derives `active_users` for every current-season country from
    /// contribution recency, then recomputes scores. `window_days = 0`
    /// counts every contributor in the season.
    pub fn refresh_active_users(&mut self, window_days: u32, now: OffsetDateTime) -> Result<usize> {
        let season = self.current_season()?;
        let global = self.global_buffer_factor()?;
        let now_text = format_rfc3339(now).map_err(|err| anyhow!(err.to_string()))?;
        let cutoff = if window_days == 0 {
            None
        } else {
            let date = utc_day(now - time::Duration::days(i64::from(window_days) - 1));
            Some(format_date(date).map_err(|err| anyhow!(err.to_string()))?)
        };

        let tx = self
            .conn
            .transaction()
            .context("failed to start active-users transaction")?;

        let countries: Vec<String> = {
            let mut stmt = tx.prepare("SELECT country_code FROM country_stats WHERE season = ?1")?;
            let rows = stmt.query_map(params![i64::from(season)], |row| row.get(0))?;
            collect_rows(rows)?
        };

        for country in &countries {
            let active: i64 = match &cutoff {
                Some(date) => tx.query_row(
                    "SELECT COUNT(DISTINCT user_id) FROM country_contributions
                     WHERE country_code = ?1 AND season = ?2 AND contribution_date >= ?3",
                    params![country, i64::from(season), date],
                    |row| row.get(0),
                )?,
                None => tx.query_row(
                    "SELECT COUNT(DISTINCT user_id) FROM country_contributions
                     WHERE country_code = ?1 AND season = ?2",
                    params![country, i64::from(season)],
                    |row| row.get(0),
                )?,
            };

            tx.execute(
                "UPDATE country_stats SET active_users = ?3, last_updated = ?4
                 WHERE country_code = ?1 AND season = ?2",
                params![country, i64::from(season), active, now_text],
            )
            .context("failed to update active_users")?;

            recompute_country_score(&tx, country, season, global, &now_text)?;
        }

        let refreshed = countries.len();
        tx.commit().context("failed to commit active-users transaction")?;
        Ok(refreshed)
    }

    pub fn today_contribution(&self, user_id: UserId, date: time::Date) -> Result<i64> {
        let date_text = format_date(date).map_err(|err| anyhow!(err.to_string()))?;
        let total: Option<i64> = self
            .conn
            .query_row(
                "SELECT xp_contributed FROM country_contributions
                 WHERE user_id = ?1 AND contribution_date = ?2",
                params![user_id.to_string(), date_text],
                |row| row.get(0),
            )
            .optional()
            .context("failed to load contribution")?;
        Ok(total.unwrap_or(0))
    }

    pub fn current_season(&self) -> Result<u32> {
        let raw: String = self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![SETTING_CURRENT_SEASON],
                |row| row.get(0),
            )
            .context("current season missing; run migrate first")?;
        raw.parse()
            .with_context(|| format!("invalid current season value: {raw}"))
    }

    /// Starts a new season. Prior season rows are kept as history; per-country
    /// buffer overrides carry into the new season lazily on first contribution.
    pub fn start_season(&mut self) -> Result<u32> {
        let next = self.current_season()? + 1;
        self.conn
            .execute(
                "UPDATE settings SET value = ?2 WHERE key = ?1",
                params![SETTING_CURRENT_SEASON, next.to_string()],
            )
            .context("failed to advance season")?;
        Ok(next)
    }
}

fn load_user(conn: &Connection, user_id: UserId) -> Result<Option<User>> {
    conn.query_row(
        "SELECT user_id, display_name, xp_points, current_streak, longest_streak,
                country_code, tier, joined_at, last_activity_date
         FROM users WHERE user_id = ?1",
        params![user_id.to_string()],
        parse_user_row,
    )
    .optional()
    .context("failed to load user")
}

fn load_action(conn: &Connection, action_key: &str) -> Result<Option<ActionConfig>> {
    conn.query_row(
        "SELECT action_key, xp_value, cooldown_sec, daily_cap, multiplier_cap, enabled
         FROM action_configs WHERE action_key = ?1",
        params![action_key],
        parse_action_row,
    )
    .optional()
    .context("failed to load action config")
}

fn last_award_at(
    conn: &Connection,
    user_id: UserId,
    action_key: &str,
) -> Result<Option<OffsetDateTime>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT MAX(created_at) FROM xp_events WHERE user_id = ?1 AND action_key = ?2",
            params![user_id.to_string(), action_key],
            |row| row.get(0),
        )
        .context("failed to query last award time")?;

    match raw {
        Some(text) => Ok(Some(
            parse_rfc3339_utc(&text).map_err(|err| anyhow!("corrupt created_at column: {err}"))?,
        )),
        None => Ok(None),
    }
}

fn awards_since(
    conn: &Connection,
    user_id: UserId,
    action_key: &str,
    since: OffsetDateTime,
) -> Result<i64> {
    // Persisted timestamps are whole-second RFC3339 UTC, so TEXT comparison
    // follows time order.
    let since_text = format_rfc3339(since).map_err(|err| anyhow!(err.to_string()))?;
    conn.query_row(
        "SELECT COUNT(*) FROM xp_events
         WHERE user_id = ?1 AND action_key = ?2 AND created_at >= ?3",
        params![user_id.to_string(), action_key, since_text],
        |row| row.get(0),
    )
    .context("failed to count daily awards")
}

fn replay_outcome(conn: &Connection, user_id: UserId, key: &str) -> Result<Option<AwardOutcome>> {
    let existing = conn
        .query_row(
            "SELECT xp_base, xp_multiplier, xp_final, streak_days_at_award
             FROM xp_events WHERE idempotency_key = ?1",
            params![key],
            |row| {
                let xp_base: i64 = row.get(0)?;
                let multiplier: f64 = row.get(1)?;
                let xp_final: i64 = row.get(2)?;
                let streak: i64 = row.get(3)?;
                Ok((xp_base, multiplier, xp_final, streak))
            },
        )
        .optional()
        .context("failed to look up idempotency key")?;

    let Some((xp_base, multiplier, xp_final, streak)) = existing else {
        return Ok(None);
    };

    let current_total = load_user(conn, user_id)?.map_or(0, |user| user.xp_points);
    Ok(Some(AwardOutcome::replayed(
        xp_final,
        xp_base,
        multiplier,
        u32::try_from(streak).context("invalid streak_days_at_award value")?,
        current_total,
    )))
}

fn streak_from_activity(
    conn: &Connection,
    user_id: UserId,
    today: time::Date,
) -> Result<StreakSummary> {
    let mut timestamps = Vec::new();
    for source in ActivitySource::ALL {
        let query = format!(
            "SELECT occurred_at FROM {} WHERE user_id = ?1",
            source.table_name()
        );
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params![user_id.to_string()], |row| {
            let raw: String = row.get(0)?;
            parse_rfc3339_utc(&raw).map_err(|err| to_sql_error(0, &err))
        })?;
        timestamps.extend(collect_rows(rows)?);
    }

    Ok(compute_streak(&timestamps, today))
}

/// Folds one award into the country tables: the per-user daily contribution
/// accumulates the raw `xp_final`, while the country total takes the
/// streak-weighted value. `active_users` is only seeded here; recounting is
/// the batch refresh's job.
fn aggregate_country(
    tx: &Transaction<'_>,
    user: &User,
    season: u32,
    xp_final: i64,
    streak_multiplier: f64,
    global_buffer: f64,
    now: OffsetDateTime,
) -> Result<()> {
    let weighted_xp = weighted_contribution(xp_final, streak_multiplier);
    let date_text = format_date(utc_day(now)).map_err(|err| anyhow!(err.to_string()))?;
    let now_text = format_rfc3339(now).map_err(|err| anyhow!(err.to_string()))?;

    tx.execute(
        "INSERT INTO country_contributions(user_id, contribution_date, country_code, season, xp_contributed)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(user_id, contribution_date) DO UPDATE SET
           xp_contributed = xp_contributed + excluded.xp_contributed",
        params![
            user.user_id.to_string(),
            date_text,
            user.country_code,
            i64::from(season),
            xp_final,
        ],
    )
    .context("failed to upsert country contribution")?;

    // A fresh season row inherits the most recent buffer override so admin
    // tuning survives rollover.
    let inherited: Option<f64> = tx
        .query_row(
            "SELECT buffer_factor FROM country_stats
             WHERE country_code = ?1 ORDER BY season DESC LIMIT 1",
            params![user.country_code],
            |row| row.get(0),
        )
        .optional()
        .context("failed to look up inherited buffer factor")?
        .flatten();

    tx.execute(
        "INSERT INTO country_stats(country_code, season, total_xp, active_users, buffer_factor, country_score, last_updated)
         VALUES (?1, ?2, ?3, 1, ?4, 0.0, ?5)
         ON CONFLICT(country_code, season) DO UPDATE SET
           total_xp = total_xp + excluded.total_xp,
           active_users = MAX(active_users, 1),
           last_updated = excluded.last_updated",
        params![
            user.country_code,
            i64::from(season),
            weighted_xp,
            inherited,
            now_text,
        ],
    )
    .context("failed to upsert country stats")?;

    recompute_country_score(tx, &user.country_code, season, global_buffer, &now_text)
}

fn recompute_country_score(
    conn: &Connection,
    country_code: &str,
    season: u32,
    global_buffer: f64,
    now_text: &str,
) -> Result<()> {
    let row: Option<(i64, i64, Option<f64>)> = conn
        .query_row(
            "SELECT total_xp, active_users, buffer_factor FROM country_stats
             WHERE country_code = ?1 AND season = ?2",
            params![country_code, i64::from(season)],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .context("failed to load country stats for recompute")?;

    let Some((total_xp, active_users, buffer_override)) = row else {
        return Ok(());
    };

    let buffer = buffer_override.unwrap_or(global_buffer);
    let score = country_score(
        total_xp,
        u32::try_from(active_users).context("invalid active_users value")?,
        buffer,
    );

    conn.execute(
        "UPDATE country_stats SET country_score = ?3, last_updated = ?4
         WHERE country_code = ?1 AND season = ?2",
        params![country_code, i64::from(season), score, now_text],
    )
    .context("failed to store recomputed country score")?;

    Ok(())
}

fn parse_user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let user_id_raw: String = row.get(0)?;
    let user_id = Ulid::from_string(&user_id_raw).map_err(|err| to_sql_error(0, &err))?;
    let tier_raw: String = row.get(6)?;
    let tier = Tier::parse(&tier_raw)
        .ok_or_else(|| to_sql_error(6, &format!("unknown tier: {tier_raw}")))?;
    let joined_raw: String = row.get(7)?;
    let joined_at = parse_rfc3339_utc(&joined_raw).map_err(|err| to_sql_error(7, &err))?;
    let last_activity_raw: Option<String> = row.get(8)?;
    let last_activity_date = match last_activity_raw {
        Some(text) => Some(parse_date(&text).map_err(|err| to_sql_error(8, &err))?),
        None => None,
    };

    let current_streak: i64 = row.get(3)?;
    let longest_streak: i64 = row.get(4)?;

    Ok(User {
        user_id: UserId(user_id),
        display_name: row.get(1)?,
        xp_points: row.get(2)?,
        current_streak: u32::try_from(current_streak).map_err(|err| to_sql_error(3, &err))?,
        longest_streak: u32::try_from(longest_streak).map_err(|err| to_sql_error(4, &err))?,
        country_code: row.get(5)?,
        tier,
        joined_at,
        last_activity_date,
    })
}

fn parse_action_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActionConfig> {
    let daily_cap: i64 = row.get(3)?;
    let enabled: i64 = row.get(5)?;

    Ok(ActionConfig {
        action_key: row.get(0)?,
        xp_value: row.get(1)?,
        cooldown_sec: row.get(2)?,
        daily_cap: u32::try_from(daily_cap).map_err(|err| to_sql_error(3, &err))?,
        multiplier_cap: row.get(4)?,
        enabled: enabled != 0,
    })
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<XpEvent> {
    let event_id_raw: String = row.get(1)?;
    let event_id = Ulid::from_string(&event_id_raw).map_err(|err| to_sql_error(1, &err))?;
    let user_id_raw: String = row.get(2)?;
    let user_id = Ulid::from_string(&user_id_raw).map_err(|err| to_sql_error(2, &err))?;
    let streak: i64 = row.get(7)?;
    let metadata_raw: String = row.get(9)?;
    let metadata: Value =
        serde_json::from_str(&metadata_raw).map_err(|err| to_sql_error(9, &err))?;
    let created_raw: String = row.get(10)?;
    let created_at = parse_rfc3339_utc(&created_raw).map_err(|err| to_sql_error(10, &err))?;

    Ok(XpEvent {
        event_seq: row.get(0)?,
        event_id,
        user_id: UserId(user_id),
        action_key: row.get(3)?,
        xp_base: row.get(4)?,
        xp_multiplier: row.get(5)?,
        xp_final: row.get(6)?,
        streak_days_at_award: u32::try_from(streak).map_err(|err| to_sql_error(7, &err))?,
        idempotency_key: row.get(8)?,
        metadata,
        created_at,
    })
}

fn parse_stats_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CountryStats> {
    let season: i64 = row.get(1)?;
    let active_users: i64 = row.get(3)?;
    let updated_raw: String = row.get(6)?;
    let last_updated = parse_rfc3339_utc(&updated_raw).map_err(|err| to_sql_error(6, &err))?;

    Ok(CountryStats {
        country_code: row.get(0)?,
        season: u32::try_from(season).map_err(|err| to_sql_error(1, &err))?,
        total_xp: row.get(2)?,
        active_users: u32::try_from(active_users).map_err(|err| to_sql_error(3, &err))?,
        buffer_factor: row.get(4)?,
        country_score: row.get(5)?,
        last_updated,
    })
}

fn to_sql_error(idx: usize, err: &impl ToString) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp, clippy::too_many_lines)]

    use super::*;
    use serde_json::json;
    use time::Duration;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn must_utc(raw: &str) -> OffsetDateTime {
        match parse_rfc3339_utc(raw) {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture timestamp: {err}"),
        }
    }

    fn fixture_store() -> SqliteRewardStore {
        let store = must(SqliteRewardStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn fixture_user(store: &SqliteRewardStore, tier: Tier, joined_at: OffsetDateTime) -> User {
        must(store.create_user("tester", "DE", tier, joined_at))
    }

    fn request_for(user: &User, action_key: &str, idempotency_key: Option<&str>) -> AwardRequest {
        AwardRequest {
            user_id: user.user_id,
            action_key: action_key.to_string(),
            idempotency_key: idempotency_key.map(ToString::to_string),
            metadata: json!({}),
        }
    }

    fn seed_daily_workouts(store: &SqliteRewardStore, user: &User, ending: OffsetDateTime, days: i64) {
        for offset in 0..days {
            must(store.log_activity(
                user.user_id,
                ActivitySource::Workout,
                ending - Duration::days(offset),
                &json!({}),
            ));
        }
    }

    #[test]
    fn migrate_is_idempotent_and_seeds_catalog() {
        let store = fixture_store();
        must(store.migrate());

        let actions = must(store.list_action_configs(true));
        assert_eq!(actions.len(), 5);
        assert!(actions.iter().any(|a| a.action_key == "workout_complete"));
        assert_eq!(must(store.current_season()), 1);
        assert_eq!(must(store.global_buffer_factor()), 5.0);
    }

    #[test]
    fn award_appends_ledger_and_updates_balance() {
        let mut store = fixture_store();
        let now = must_utc("2026-08-29T12:00:00Z");
        let user = fixture_user(&store, Tier::Fan, now);

        let outcome = must(store.award_xp(&request_for(&user, "workout_complete", None), now));
        assert!(outcome.success);
        assert!(!outcome.already_processed);
        assert_eq!(outcome.xp_base, 20);
        assert_eq!(outcome.xp_earned, 20);
        assert_eq!(outcome.new_total, 20);

        let reloaded = match must(store.get_user(user.user_id)) {
            Some(value) => value,
            None => panic!("user missing after award"),
        };
        assert_eq!(reloaded.xp_points, 20);

        let history = must(store.xp_history(user.user_id, 10, 0));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action_key, "workout_complete");
        assert_eq!(history[0].xp_final, 20);
    }

    #[test]
    fn duplicate_idempotency_key_replays_without_double_grant() {
        let mut store = fixture_store();
        let now = must_utc("2026-08-29T12:00:00Z");
        let user = fixture_user(&store, Tier::Fan, now);

        let first = must(store.award_xp(&request_for(&user, "workout_complete", Some("req-1")), now));
        assert!(first.success);
        assert!(!first.already_processed);

        let later = now + Duration::hours(2);
        let second = must(store.award_xp(&request_for(&user, "workout_complete", Some("req-1")), later));
        assert!(second.success);
        assert!(second.already_processed);
        assert_eq!(second.xp_earned, first.xp_earned);
        assert_eq!(second.new_total, first.new_total);

        let history = must(store.xp_history(user.user_id, 10, 0));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn cooldown_denial_reports_remaining_seconds() {
        let mut store = fixture_store();
        must(store.upsert_action_config(&ActionConfig {
            action_key: "sprint".to_string(),
            xp_value: 10,
            cooldown_sec: 60,
            daily_cap: 0,
            multiplier_cap: 2.0,
            enabled: true,
        }));

        let now = must_utc("2026-08-29T12:00:00Z");
        let user = fixture_user(&store, Tier::Fan, now);

        must(store.award_xp(&request_for(&user, "sprint", None), now));
        let retry = must(store.award_xp(
            &request_for(&user, "sprint", None),
            now + Duration::seconds(10),
        ));

        assert!(!retry.success);
        assert_eq!(
            retry.denial,
            Some(AwardDenial::CooldownActive { retry_in_sec: 50 })
        );

        let cleared = must(store.award_xp(
            &request_for(&user, "sprint", None),
            now + Duration::seconds(60),
        ));
        assert!(cleared.success);
    }

    #[test]
    fn daily_cap_denies_fourth_award_and_resets_at_utc_midnight() {
        let mut store = fixture_store();
        let now = must_utc("2026-08-29T06:00:00Z");
        let user = fixture_user(&store, Tier::Fan, now);

        // workout_complete has daily_cap 3 and cooldown 3600s.
        for hour in 0..3 {
            let at = now + Duration::hours(hour);
            let outcome = must(store.award_xp(&request_for(&user, "workout_complete", None), at));
            assert!(outcome.success, "award {hour} should succeed");
        }

        let fourth = must(store.award_xp(
            &request_for(&user, "workout_complete", None),
            now + Duration::hours(3),
        ));
        assert_eq!(fourth.denial, Some(AwardDenial::DailyCapReached { cap: 3 }));

        let next_day = must_utc("2026-08-30T00:00:01Z");
        let fresh = must(store.award_xp(&request_for(&user, "workout_complete", None), next_day));
        assert!(fresh.success);
    }

    #[test]
    fn committed_tier_with_two_week_streak_earns_composed_multiplier() {
        let mut store = fixture_store();
        let now = must_utc("2026-08-29T12:00:00Z");
        let user = fixture_user(&store, Tier::Player, now);
        seed_daily_workouts(&store, &user, now, 14);

        let outcome = must(store.award_xp(&request_for(&user, "workout_complete", None), now));
        assert!(outcome.success);
        assert_eq!(outcome.streak_days, 14);
        assert!((outcome.multiplier - 1.56).abs() < 1e-9);
        assert_eq!(outcome.xp_earned, 31);
    }

    #[test]
    fn warmup_grants_base_xp_then_hits_cap_of_one() {
        let mut store = fixture_store();
        let now = must_utc("2026-08-29T07:00:00Z");
        let user = fixture_user(&store, Tier::Fan, now);

        let first = must(store.award_xp(&request_for(&user, "warmup_session", None), now));
        assert!(first.success);
        assert_eq!(first.xp_earned, 5);

        let second = must(store.award_xp(
            &request_for(&user, "warmup_session", None),
            now + Duration::hours(1),
        ));
        assert_eq!(second.denial, Some(AwardDenial::DailyCapReached { cap: 1 }));
    }

    #[test]
    fn unknown_action_disabled_action_and_unknown_user_are_denied() {
        let mut store = fixture_store();
        let now = must_utc("2026-08-29T12:00:00Z");
        let user = fixture_user(&store, Tier::Fan, now);

        let missing = must(store.award_xp(&request_for(&user, "no_such_action", None), now));
        assert_eq!(missing.denial, Some(AwardDenial::ActionNotFound));

        must(store.upsert_action_config(&ActionConfig {
            action_key: "paused".to_string(),
            xp_value: 10,
            cooldown_sec: 0,
            daily_cap: 0,
            multiplier_cap: 2.0,
            enabled: false,
        }));
        let disabled = must(store.award_xp(&request_for(&user, "paused", None), now));
        assert_eq!(disabled.denial, Some(AwardDenial::ActionDisabled));

        let ghost = AwardRequest {
            user_id: UserId(Ulid::new()),
            action_key: "workout_complete".to_string(),
            idempotency_key: None,
            metadata: json!({}),
        };
        let unknown = must(store.award_xp(&ghost, now));
        assert_eq!(unknown.denial, Some(AwardDenial::UserNotFound));
    }

    #[test]
    fn award_aggregates_weighted_contribution_into_country_stats() {
        let mut store = fixture_store();
        let now = must_utc("2026-08-29T12:00:00Z");
        let user = fixture_user(&store, Tier::Fan, now);

        must(store.award_xp(&request_for(&user, "workout_complete", None), now));

        let stats = match must(store.country_stats("DE", None)) {
            Some(value) => value,
            None => panic!("missing country stats after award"),
        };
        assert_eq!(stats.total_xp, 20);
        assert_eq!(stats.active_users, 1);
        assert_eq!(stats.buffer_factor, None);
        // 20 / sqrt(1 + 5.0)
        assert!((stats.country_score - 20.0 / 6.0_f64.sqrt()).abs() < 1e-9);

        let contributed = must(store.today_contribution(user.user_id, utc_day(now)));
        assert_eq!(contributed, 20);
    }

    #[test]
    fn contribution_stays_raw_while_country_total_is_streak_weighted() {
        let mut store = fixture_store();
        let now = must_utc("2026-08-29T12:00:00Z");
        let user = fixture_user(&store, Tier::Player, now);
        seed_daily_workouts(&store, &user, now, 14);

        must(store.award_xp(&request_for(&user, "workout_complete", None), now));

        // xp_final is 31. The daily contribution accumulates it as-is; only
        // the country total carries the 1.04 streak weight: floor(32.24) = 32.
        let contributed = must(store.today_contribution(user.user_id, utc_day(now)));
        assert_eq!(contributed, 31);

        let stats = match must(store.country_stats("DE", None)) {
            Some(value) => value,
            None => panic!("missing country stats"),
        };
        assert_eq!(stats.total_xp, 32);
    }

    #[test]
    fn buffer_factor_override_and_global_default_recompute_scores() {
        let mut store = fixture_store();
        let now = must_utc("2026-08-29T12:00:00Z");
        let user = fixture_user(&store, Tier::Fan, now);
        must(store.award_xp(&request_for(&user, "workout_complete", None), now));

        must(store.set_country_buffer_factor("DE", 15.0));
        let stats = must(store.country_stats("DE", None));
        let stats = match stats {
            Some(value) => value,
            None => panic!("missing country stats"),
        };
        assert_eq!(stats.buffer_factor, Some(15.0));
        assert!((stats.country_score - 20.0 / 16.0_f64.sqrt()).abs() < 1e-9);

        // Global changes do not touch overridden countries.
        must(store.set_global_buffer_factor(1.0));
        let stats = match must(store.country_stats("DE", None)) {
            Some(value) => value,
            None => panic!("missing country stats"),
        };
        assert!((stats.country_score - 20.0 / 16.0_f64.sqrt()).abs() < 1e-9);

        must(store.clear_country_buffer_factor("DE"));
        let stats = match must(store.country_stats("DE", None)) {
            Some(value) => value,
            None => panic!("missing country stats"),
        };
        assert_eq!(stats.buffer_factor, None);
        assert!((stats.country_score - 20.0 / 2.0_f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn leaderboard_orders_by_score_and_supports_country_filter() {
        let mut store = fixture_store();
        let now = must_utc("2026-08-29T12:00:00Z");

        let german = must(store.create_user("gm", "DE", Tier::Fan, now));
        let french = must(store.create_user("fr", "FR", Tier::Fan, now));

        must(store.award_xp(&request_for(&german, "workout_complete", None), now));
        must(store.award_xp(&request_for(&french, "warmup_session", None), now));

        let board = must(store.leaderboard(None, None, 10));
        assert_eq!(board.len(), 2);
        assert_eq!(board[0].country_code, "DE");
        assert_eq!(board[0].rank, 1);
        assert_eq!(board[1].country_code, "FR");
        assert_eq!(board[1].rank, 2);

        let filtered = must(store.leaderboard(None, Some("fr"), 10));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].country_code, "FR");
        assert_eq!(filtered[0].rank, 2);
    }

    #[test]
    fn refresh_streak_persists_and_longest_only_ratchets_up() {
        let mut store = fixture_store();
        let now = must_utc("2026-08-29T12:00:00Z");
        let user = fixture_user(&store, Tier::Fan, now);
        seed_daily_workouts(&store, &user, now, 5);

        let summary = must(store.refresh_streak(user.user_id, now));
        assert_eq!(summary.current_streak, 5);
        assert_eq!(summary.longest_streak, 5);

        // A week later with no activity the current streak drops, but the
        // longest record stays.
        let later = now + Duration::days(7);
        let summary = must(store.refresh_streak(user.user_id, later));
        assert_eq!(summary.current_streak, 0);
        assert_eq!(summary.longest_streak, 5);
    }

    #[test]
    fn streak_summary_leaves_persisted_counters_untouched() {
        let store = fixture_store();
        let now = must_utc("2026-08-29T12:00:00Z");
        let user = fixture_user(&store, Tier::Fan, now);
        seed_daily_workouts(&store, &user, now, 3);

        let summary = must(store.streak_summary(user.user_id, now));
        assert_eq!(summary.current_streak, 3);

        // Reads never write: the user row still carries the pre-refresh
        // counters.
        let reloaded = match must(store.get_user(user.user_id)) {
            Some(value) => value,
            None => panic!("user missing"),
        };
        assert_eq!(reloaded.current_streak, 0);
        assert_eq!(reloaded.longest_streak, 0);
        assert_eq!(reloaded.last_activity_date, None);
    }

    #[test]
    fn streak_merges_all_activity_sources() {
        let mut store = fixture_store();
        let now = must_utc("2026-08-29T12:00:00Z");
        let user = fixture_user(&store, Tier::Fan, now);

        must(store.log_activity(user.user_id, ActivitySource::Workout, now, &json!({})));
        must(store.log_activity(
            user.user_id,
            ActivitySource::Meal,
            now - Duration::days(1),
            &json!({}),
        ));
        must(store.log_activity(
            user.user_id,
            ActivitySource::Warmup,
            now - Duration::days(2),
            &json!({}),
        ));
        must(store.log_activity(
            user.user_id,
            ActivitySource::ProofSubmission,
            now - Duration::days(3),
            &json!({}),
        ));

        let summary = must(store.streak_summary(user.user_id, now));
        assert_eq!(summary.current_streak, 4);
    }

    #[test]
    fn xp_history_pages_newest_first() {
        let mut store = fixture_store();
        must(store.upsert_action_config(&ActionConfig {
            action_key: "tap".to_string(),
            xp_value: 1,
            cooldown_sec: 0,
            daily_cap: 0,
            multiplier_cap: 2.0,
            enabled: true,
        }));

        let now = must_utc("2026-08-29T12:00:00Z");
        let user = fixture_user(&store, Tier::Fan, now);
        for minute in 0..5 {
            must(store.award_xp(
                &request_for(&user, "tap", None),
                now + Duration::minutes(minute),
            ));
        }

        let page1 = must(store.xp_history(user.user_id, 2, 0));
        let page2 = must(store.xp_history(user.user_id, 2, 2));
        assert_eq!(page1.len(), 2);
        assert_eq!(page2.len(), 2);
        assert!(page1[0].event_seq > page1[1].event_seq);
        assert!(page1[1].event_seq > page2[0].event_seq);
    }

    #[test]
    fn ledger_is_append_only() {
        let mut store = fixture_store();
        let now = must_utc("2026-08-29T12:00:00Z");
        let user = fixture_user(&store, Tier::Fan, now);
        must(store.award_xp(&request_for(&user, "workout_complete", None), now));

        let update = store.connection().execute(
            "UPDATE xp_events SET xp_final = 9999 WHERE user_id = ?1",
            params![user.user_id.to_string()],
        );
        assert!(update.is_err());

        let delete = store
            .connection()
            .execute("DELETE FROM xp_events", []);
        assert!(delete.is_err());
    }

    #[test]
    fn season_rollover_starts_fresh_totals_and_keeps_overrides() {
        let mut store = fixture_store();
        let now = must_utc("2026-08-29T12:00:00Z");
        let user = fixture_user(&store, Tier::Fan, now);

        must(store.award_xp(&request_for(&user, "workout_complete", None), now));
        must(store.set_country_buffer_factor("DE", 10.0));

        let next = must(store.start_season());
        assert_eq!(next, 2);
        assert!(must(store.country_stats("DE", None)).is_none());

        let next_day = now + Duration::days(1);
        must(store.award_xp(&request_for(&user, "workout_complete", None), next_day));

        let stats = match must(store.country_stats("DE", None)) {
            Some(value) => value,
            None => panic!("missing season-2 stats"),
        };
        assert_eq!(stats.season, 2);
        assert_eq!(stats.total_xp, 20);
        assert_eq!(stats.buffer_factor, Some(10.0));

        // Season-1 history is untouched.
        let archived = match must(store.country_stats("DE", Some(1))) {
            Some(value) => value,
            None => panic!("missing season-1 stats"),
        };
        assert_eq!(archived.total_xp, 20);
    }

    #[test]
    fn refresh_active_users_applies_recency_window() {
        let mut store = fixture_store();
        let now = must_utc("2026-08-29T12:00:00Z");
        let recent = must(store.create_user("recent", "DE", Tier::Fan, now));
        let stale = must(store.create_user("stale", "DE", Tier::Fan, now));

        must(store.award_xp(&request_for(&recent, "workout_complete", None), now));
        must(store.award_xp(
            &request_for(&stale, "workout_complete", None),
            now - Duration::days(40),
        ));

        // The award path only seeds the counter; it never recounts.
        let stats = match must(store.country_stats("DE", None)) {
            Some(value) => value,
            None => panic!("missing country stats"),
        };
        assert_eq!(stats.active_users, 1);

        must(store.refresh_active_users(0, now));
        let stats = match must(store.country_stats("DE", None)) {
            Some(value) => value,
            None => panic!("missing country stats"),
        };
        assert_eq!(stats.active_users, 2);

        must(store.refresh_active_users(30, now));
        let stats = match must(store.country_stats("DE", None)) {
            Some(value) => value,
            None => panic!("missing country stats"),
        };
        assert_eq!(stats.active_users, 1);
        assert_eq!(stats.total_xp, 40);
        assert!((stats.country_score - 40.0 / 6.0_f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn awards_keep_batch_refreshed_active_users() {
        let mut store = fixture_store();
        let now = must_utc("2026-08-29T12:00:00Z");
        let recent = must(store.create_user("recent", "DE", Tier::Fan, now));
        let stale = must(store.create_user("stale", "DE", Tier::Fan, now));

        must(store.award_xp(&request_for(&recent, "workout_complete", None), now));
        must(store.award_xp(
            &request_for(&stale, "workout_complete", None),
            now - Duration::days(40),
        ));
        must(store.refresh_active_users(0, now));
        must(store.refresh_active_users(30, now));

        // A fresh award must not replace the windowed count with a
        // season-wide one.
        must(store.award_xp(&request_for(&recent, "warmup_session", None), now));
        let stats = match must(store.country_stats("DE", None)) {
            Some(value) => value,
            None => panic!("missing country stats"),
        };
        assert_eq!(stats.active_users, 1);
        assert_eq!(stats.total_xp, 45);
    }
}
