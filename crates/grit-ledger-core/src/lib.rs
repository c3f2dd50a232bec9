use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RewardError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct UserId(pub Ulid);

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Fan,
    Player,
    Pro,
    Founder,
}

impl Tier {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fan => "fan",
            Self::Player => "player",
            Self::Pro => "pro",
            Self::Founder => "founder",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "fan" => Some(Self::Fan),
            "player" => Some(Self::Player),
            "pro" => Some(Self::Pro),
            "founder" => Some(Self::Founder),
            _ => None,
        }
    }

    /// Paid and founder-equivalent tiers qualify for the committed
    /// milestone multiplier.
    #[must_use]
    pub fn is_committed(self) -> bool {
        !matches!(self, Self::Fan)
    }
}

/// Streak-qualifying activity-log sources. Each maps to a distinct
/// collaborator table; the streak calculator merges all of them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivitySource {
    Workout,
    Meal,
    Warmup,
    ProofSubmission,
}

impl ActivitySource {
    pub const ALL: [Self; 4] = [Self::Workout, Self::Meal, Self::Warmup, Self::ProofSubmission];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Workout => "workout",
            Self::Meal => "meal",
            Self::Warmup => "warmup",
            Self::ProofSubmission => "proof_submission",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "workout" => Some(Self::Workout),
            "meal" => Some(Self::Meal),
            "warmup" => Some(Self::Warmup),
            "proof_submission" => Some(Self::ProofSubmission),
            _ => None,
        }
    }

    #[must_use]
    pub fn table_name(self) -> &'static str {
        match self {
            Self::Workout => "workout_logs",
            Self::Meal => "meal_logs",
            Self::Warmup => "warmup_logs",
            Self::ProofSubmission => "proof_submissions",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub user_id: UserId,
    pub display_name: String,
    pub xp_points: i64,
    pub current_streak: u32,
    pub longest_streak: u32,
    pub country_code: String,
    pub tier: Tier,
    pub joined_at: OffsetDateTime,
    pub last_activity_date: Option<Date>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionConfig {
    pub action_key: String,
    pub xp_value: i64,
    pub cooldown_sec: i64,
    /// 0 means unlimited awards per day.
    pub daily_cap: u32,
    pub multiplier_cap: f64,
    pub enabled: bool,
}

impl ActionConfig {
    /// Validates an action configuration before it is persisted.
    ///
    /// # Errors
    /// Returns [`RewardError::Configuration`] when a field is outside its
    /// allowed bounds.
    pub fn validate(&self) -> Result<(), RewardError> {
        if self.action_key.trim().is_empty() {
            return Err(RewardError::Configuration(
                "action_key MUST NOT be empty".to_string(),
            ));
        }

        if self.xp_value < 0 {
            return Err(RewardError::Configuration(
                "xp_value MUST be >= 0".to_string(),
            ));
        }

        if self.cooldown_sec < 0 {
            return Err(RewardError::Configuration(
                "cooldown_sec MUST be >= 0".to_string(),
            ));
        }

        if self.multiplier_cap < 1.0 {
            return Err(RewardError::Configuration(
                "multiplier_cap MUST be >= 1.0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Built-in action catalog used to seed a fresh store. All entries are
/// admin-editable afterwards.
#[must_use]
pub fn default_action_catalog() -> Vec<ActionConfig> {
    vec![
        ActionConfig {
            action_key: "warmup_session".to_string(),
            xp_value: 5,
            cooldown_sec: 0,
            daily_cap: 1,
            multiplier_cap: 2.0,
            enabled: true,
        },
        ActionConfig {
            action_key: "workout_complete".to_string(),
            xp_value: 20,
            cooldown_sec: 3_600,
            daily_cap: 3,
            multiplier_cap: 2.0,
            enabled: true,
        },
        ActionConfig {
            action_key: "meal_logged".to_string(),
            xp_value: 10,
            cooldown_sec: 1_800,
            daily_cap: 5,
            multiplier_cap: 2.0,
            enabled: true,
        },
        ActionConfig {
            action_key: "proof_submitted".to_string(),
            xp_value: 30,
            cooldown_sec: 0,
            daily_cap: 2,
            multiplier_cap: 2.0,
            enabled: true,
        },
        ActionConfig {
            action_key: "referral_joined".to_string(),
            xp_value: 50,
            cooldown_sec: 0,
            daily_cap: 0,
            multiplier_cap: 1.5,
            enabled: true,
        },
    ]
}

/// Versioned reward constants: streak bonus curve, milestone multipliers,
/// and the global country-score damping default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RewardRuleset {
    pub ruleset_version: u32,
    pub streak_weekly_bonus: f64,
    pub streak_bonus_cap: f64,
    pub committed_multiplier: f64,
    pub tenure_multiplier: f64,
    pub tenure_days: i64,
    pub default_buffer_factor: f64,
}

impl RewardRuleset {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            ruleset_version: 1,
            streak_weekly_bonus: 0.02,
            streak_bonus_cap: 0.10,
            committed_multiplier: 1.5,
            tenure_multiplier: 1.25,
            tenure_days: 45,
            default_buffer_factor: 5.0,
        }
    }

    /// Validates ruleset numeric bounds.
    ///
    /// # Errors
    /// Returns [`RewardError::Configuration`] when one or more fields are
    /// outside allowed bounds.
    pub fn validate(&self) -> Result<(), RewardError> {
        if self.ruleset_version == 0 {
            return Err(RewardError::Configuration(
                "ruleset_version MUST be >= 1".to_string(),
            ));
        }

        for (name, value) in [
            ("streak_weekly_bonus", self.streak_weekly_bonus),
            ("streak_bonus_cap", self.streak_bonus_cap),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(RewardError::Configuration(format!(
                    "{name} MUST be in [0.0, 1.0]"
                )));
            }
        }

        for (name, value) in [
            ("committed_multiplier", self.committed_multiplier),
            ("tenure_multiplier", self.tenure_multiplier),
        ] {
            if value < 1.0 {
                return Err(RewardError::Configuration(format!(
                    "{name} MUST be >= 1.0"
                )));
            }
        }

        if self.tenure_days < 0 {
            return Err(RewardError::Configuration(
                "tenure_days MUST be >= 0".to_string(),
            ));
        }

        if self.default_buffer_factor < 0.0 {
            return Err(RewardError::Configuration(
                "default_buffer_factor MUST be >= 0.0".to_string(),
            ));
        }

        Ok(())
    }

    /// Capped 2%-per-week streak bonus, maxing at +10% under v1 constants.
    #[must_use]
    pub fn streak_multiplier(&self, streak_days: u32) -> f64 {
        let weeks = f64::from(streak_days / 7);
        1.0 + (weeks * self.streak_weekly_bonus).min(self.streak_bonus_cap)
    }

    #[must_use]
    pub fn milestone_multiplier(&self, tier: Tier, days_since_join: i64) -> f64 {
        if tier.is_committed() {
            self.committed_multiplier
        } else if days_since_join >= self.tenure_days {
            self.tenure_multiplier
        } else {
            1.0
        }
    }

    /// Composes the total multiplier, clamped to the action's ceiling.
    #[must_use]
    pub fn total_multiplier(
        &self,
        streak_days: u32,
        tier: Tier,
        days_since_join: i64,
        multiplier_cap: f64,
    ) -> f64 {
        let total = self.streak_multiplier(streak_days) * self.milestone_multiplier(tier, days_since_join);
        total.min(multiplier_cap)
    }

    /// Decodes and validates a ruleset from JSON.
    ///
    /// # Errors
    /// Returns [`RewardError::Configuration`] when JSON decoding fails or
    /// decoded values violate ruleset constraints.
    pub fn from_json(value: &Value) -> Result<Self, RewardError> {
        let ruleset: Self = serde_json::from_value(value.clone()).map_err(|err| {
            RewardError::Configuration(format!("invalid ruleset JSON payload: {err}"))
        })?;
        ruleset.validate()?;
        Ok(ruleset)
    }
}

/// `floor(xp_base × multiplier)`, saturating at zero for empty awards.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn apply_multiplier(xp_base: i64, multiplier: f64) -> i64 {
    if xp_base <= 0 {
        return 0;
    }
    ((xp_base as f64) * multiplier).floor() as i64
}

/// Streak-weighted country contribution: `floor(xp_final × streak_multiplier)`.
#[must_use]
pub fn weighted_contribution(xp_final: i64, streak_multiplier: f64) -> i64 {
    apply_multiplier(xp_final, streak_multiplier)
}

/// Damped competitive score: `total_xp / sqrt(active_users + buffer_factor)`.
/// A larger buffer factor suppresses volatility for small populations.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn country_score(total_xp: i64, active_users: u32, buffer_factor: f64) -> f64 {
    let denominator = (f64::from(active_users) + buffer_factor).sqrt();
    if denominator <= 0.0 {
        return 0.0;
    }
    (total_xp as f64) / denominator
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AwardRequest {
    pub user_id: UserId,
    pub action_key: String,
    pub idempotency_key: Option<String>,
    pub metadata: Value,
}

impl AwardRequest {
    /// Validates an award request before the pipeline runs.
    ///
    /// # Errors
    /// Returns [`RewardError::Validation`] when required fields are missing
    /// or malformed.
    pub fn validate(&self) -> Result<(), RewardError> {
        if self.action_key.trim().is_empty() {
            return Err(RewardError::Validation(
                "action_key MUST NOT be empty".to_string(),
            ));
        }

        if let Some(key) = &self.idempotency_key {
            if key.trim().is_empty() {
                return Err(RewardError::Validation(
                    "idempotency_key MUST NOT be blank when present".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Expected business-rule denials. Returned inside [`AwardOutcome`], never
/// raised as errors: the award operation only fails hard on storage trouble.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum AwardDenial {
    ActionNotFound,
    ActionDisabled,
    CooldownActive { retry_in_sec: i64 },
    DailyCapReached { cap: u32 },
    UserNotFound,
}

impl AwardDenial {
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::ActionNotFound => "action not found".to_string(),
            Self::ActionDisabled => "action is disabled".to_string(),
            Self::CooldownActive { retry_in_sec } => {
                format!("cooldown active, retry in {retry_in_sec}s")
            }
            Self::DailyCapReached { cap } => {
                format!("daily cap of {cap} reached, resets at midnight UTC")
            }
            Self::UserNotFound => "user not found".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AwardOutcome {
    pub success: bool,
    pub already_processed: bool,
    pub xp_earned: i64,
    pub xp_base: i64,
    pub multiplier: f64,
    pub streak_days: u32,
    pub new_total: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denial: Option<AwardDenial>,
    pub message: String,
}

impl AwardOutcome {
    #[must_use]
    pub fn granted(
        xp_earned: i64,
        xp_base: i64,
        multiplier: f64,
        streak_days: u32,
        new_total: i64,
    ) -> Self {
        Self {
            success: true,
            already_processed: false,
            xp_earned,
            xp_base,
            multiplier,
            streak_days,
            new_total,
            denial: None,
            message: format!("+{xp_earned} XP"),
        }
    }

    /// Outcome for an idempotent replay: the recorded numbers are returned
    /// again and no mutation happens.
    #[must_use]
    pub fn replayed(
        xp_earned: i64,
        xp_base: i64,
        multiplier: f64,
        streak_days: u32,
        current_total: i64,
    ) -> Self {
        Self {
            success: true,
            already_processed: true,
            xp_earned,
            xp_base,
            multiplier,
            streak_days,
            new_total: current_total,
            denial: None,
            message: format!("+{xp_earned} XP (already processed)"),
        }
    }

    #[must_use]
    pub fn denied(denial: AwardDenial) -> Self {
        let message = denial.message();
        Self {
            success: false,
            already_processed: false,
            xp_earned: 0,
            xp_base: 0,
            multiplier: 0.0,
            streak_days: 0,
            new_total: 0,
            denial: Some(denial),
            message,
        }
    }
}

/// Append-only ledger record: the only source of truth for how much XP was
/// ever granted and why.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct XpEvent {
    pub event_seq: i64,
    pub event_id: Ulid,
    pub user_id: UserId,
    pub action_key: String,
    pub xp_base: i64,
    pub xp_multiplier: f64,
    pub xp_final: i64,
    pub streak_days_at_award: u32,
    pub idempotency_key: Option<String>,
    pub metadata: Value,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreakSummary {
    pub current_streak: u32,
    pub longest_streak: u32,
    pub last_activity_date: Option<Date>,
}

/// Derives current/longest streak from raw activity timestamps.
///
/// Timestamps are truncated to UTC calendar days and deduplicated; the
/// current streak is the contiguous run whose head is today or yesterday,
/// and the longest streak is the maximum contiguous run anywhere in
/// history. Pure and idempotent: repeated calls over the same data always
/// agree, which matters because read endpoints and post-award refreshes
/// both invoke it.
#[must_use]
pub fn compute_streak(timestamps: &[OffsetDateTime], today: Date) -> StreakSummary {
    let days: BTreeSet<i64> = timestamps
        .iter()
        .map(|ts| i64::from(ts.to_offset(UtcOffset::UTC).date().to_julian_day()))
        .collect();

    if days.is_empty() {
        return StreakSummary {
            current_streak: 0,
            longest_streak: 0,
            last_activity_date: None,
        };
    }

    let today_julian = i64::from(today.to_julian_day());
    let mut current_streak = 0_u32;
    let mut cursor: Option<i64> = None;

    for day in days.iter().rev() {
        match cursor {
            None => {
                if today_julian - day > 1 {
                    break;
                }
                current_streak = 1;
                cursor = Some(*day);
            }
            Some(previous) => {
                if previous - day == 1 {
                    current_streak += 1;
                    cursor = Some(*day);
                } else {
                    break;
                }
            }
        }
    }

    let mut longest_streak = 0_u32;
    let mut run = 0_u32;
    let mut last: Option<i64> = None;
    for day in &days {
        run = match last {
            Some(previous) if day - previous == 1 => run + 1,
            _ => 1,
        };
        longest_streak = longest_streak.max(run);
        last = Some(*day);
    }

    let last_activity_date = days
        .iter()
        .next_back()
        .and_then(|day| i32::try_from(*day).ok())
        .and_then(|day| Date::from_julian_day(day).ok());

    StreakSummary {
        current_streak,
        longest_streak,
        last_activity_date,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CountryStats {
    pub country_code: String,
    pub total_xp: i64,
    pub active_users: u32,
    /// NULL inherits the global default from the ruleset/settings.
    pub buffer_factor: Option<f64>,
    pub country_score: f64,
    pub season: u32,
    pub last_updated: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CountryContribution {
    pub user_id: UserId,
    pub contribution_date: Date,
    pub xp_contributed: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaderboardEntry {
    pub rank: u32,
    pub country_code: String,
    pub country_score: f64,
    pub total_xp: i64,
    pub active_users: u32,
}

/// Normalizes and validates an ISO-3166 alpha-2 country code.
///
/// # Errors
/// Returns [`RewardError::Validation`] when the input is not two ASCII
/// letters.
pub fn normalize_country_code(raw: &str) -> Result<String, RewardError> {
    let trimmed = raw.trim();
    if trimmed.len() != 2 || !trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(RewardError::Validation(format!(
            "country_code MUST be two ASCII letters, got {raw:?}"
        )));
    }
    Ok(trimmed.to_ascii_uppercase())
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`RewardError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, RewardError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| RewardError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(RewardError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC and truncating
/// to whole seconds. Keeping the fractional part out of persisted values
/// means stored timestamps always compare lexicographically in the same
/// order as the instants they name.
///
/// # Errors
/// Returns [`RewardError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, RewardError> {
    value
        .to_offset(UtcOffset::UTC)
        .replace_nanosecond(0)
        .map_err(|err| {
            RewardError::Validation(format!("failed to truncate timestamp: {err}"))
        })?
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            RewardError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

/// Parses a `YYYY-MM-DD` calendar date.
///
/// # Errors
/// Returns [`RewardError::Validation`] when parsing fails.
pub fn parse_date(value: &str) -> Result<Date, RewardError> {
    Date::parse(value, format_description!("[year]-[month]-[day]"))
        .map_err(|err| RewardError::Validation(format!("invalid date {value:?}: {err}")))
}

/// Formats a calendar date as `YYYY-MM-DD`.
///
/// # Errors
/// Returns [`RewardError::Validation`] when formatting fails.
pub fn format_date(value: Date) -> Result<String, RewardError> {
    value
        .format(format_description!("[year]-[month]-[day]"))
        .map_err(|err| RewardError::Validation(format!("failed to format date: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// The UTC calendar day a timestamp falls on. All cap/cooldown/streak day
/// windows use UTC uniformly.
#[must_use]
pub fn utc_day(value: OffsetDateTime) -> Date {
    value.to_offset(UtcOffset::UTC).date()
}

/// Start of the UTC calendar day containing `value`.
#[must_use]
pub fn start_of_utc_day(value: OffsetDateTime) -> OffsetDateTime {
    utc_day(value).midnight().assume_utc()
}

/// Whole days between two instants, clamped at zero.
#[must_use]
pub fn days_between(earlier: OffsetDateTime, later: OffsetDateTime) -> i64 {
    if later <= earlier {
        return 0;
    }
    (later - earlier).whole_days()
}

/// Remaining cooldown in whole seconds, rounded up.
#[must_use]
pub fn cooldown_remaining_sec(
    last_award: OffsetDateTime,
    now: OffsetDateTime,
    cooldown_sec: i64,
) -> i64 {
    let elapsed = now - last_award;
    let remaining = Duration::seconds(cooldown_sec) - elapsed;
    if remaining <= Duration::ZERO {
        return 0;
    }
    let whole = remaining.whole_seconds();
    if remaining - Duration::seconds(whole) > Duration::ZERO {
        whole + 1
    } else {
        whole
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_utc(value: &str) -> OffsetDateTime {
        must_ok(parse_rfc3339_utc(value))
    }

    fn must_date(value: &str) -> Date {
        must_ok(parse_date(value))
    }

    #[test]
    fn streak_multiplier_follows_weekly_curve() {
        let ruleset = RewardRuleset::v1();
        assert!((ruleset.streak_multiplier(0) - 1.0).abs() < 1e-9);
        assert!((ruleset.streak_multiplier(6) - 1.0).abs() < 1e-9);
        assert!((ruleset.streak_multiplier(7) - 1.02).abs() < 1e-9);
        assert!((ruleset.streak_multiplier(14) - 1.04).abs() < 1e-9);
        assert!((ruleset.streak_multiplier(70) - 1.10).abs() < 1e-9);
        assert!((ruleset.streak_multiplier(700) - 1.10).abs() < 1e-9);
    }

    #[test]
    fn milestone_prefers_committed_tier_over_tenure() {
        let ruleset = RewardRuleset::v1();
        assert!((ruleset.milestone_multiplier(Tier::Player, 0) - 1.5).abs() < 1e-9);
        assert!((ruleset.milestone_multiplier(Tier::Founder, 100) - 1.5).abs() < 1e-9);
        assert!((ruleset.milestone_multiplier(Tier::Fan, 44) - 1.0).abs() < 1e-9);
        assert!((ruleset.milestone_multiplier(Tier::Fan, 45) - 1.25).abs() < 1e-9);
    }

    #[test]
    fn worked_example_player_streak_14_yields_31() {
        let ruleset = RewardRuleset::v1();
        let total = ruleset.total_multiplier(14, Tier::Player, 0, 2.0);
        assert!((total - 1.56).abs() < 1e-9);
        assert_eq!(apply_multiplier(20, total), 31);
    }

    #[test]
    fn total_multiplier_respects_action_ceiling() {
        let ruleset = RewardRuleset::v1();
        let total = ruleset.total_multiplier(70, Tier::Founder, 365, 1.5);
        assert!((total - 1.5).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn total_multiplier_never_exceeds_cap(
            streak_days in 0_u32..5_000,
            tier_index in 0_usize..4,
            days_since_join in 0_i64..5_000,
            cap in 1.0_f64..4.0,
        ) {
            let tier = [Tier::Fan, Tier::Player, Tier::Pro, Tier::Founder][tier_index];
            let total = RewardRuleset::v1()
                .total_multiplier(streak_days, tier, days_since_join, cap);
            prop_assert!(total <= cap + 1e-12);
            prop_assert!(total >= 1.0);
        }

        #[test]
        fn compute_streak_is_idempotent(offsets in proptest::collection::vec(0_i64..400, 0..40)) {
            let base = match parse_rfc3339_utc("2026-08-01T09:00:00Z") {
                Ok(value) => value,
                Err(err) => panic!("fixture timestamp: {err}"),
            };
            let timestamps: Vec<OffsetDateTime> =
                offsets.iter().map(|d| base - Duration::days(*d)).collect();
            let today = utc_day(base);
            let first = compute_streak(&timestamps, today);
            let second = compute_streak(&timestamps, today);
            prop_assert_eq!(first, second);
        }
    }

    #[test]
    fn current_streak_counts_contiguous_days_ending_today() {
        let timestamps = vec![
            must_utc("2026-08-29T07:00:00Z"),
            must_utc("2026-08-28T21:30:00Z"),
            must_utc("2026-08-27T12:00:00Z"),
        ];
        let summary = compute_streak(&timestamps, must_date("2026-08-29"));
        assert_eq!(summary.current_streak, 3);
        assert_eq!(summary.longest_streak, 3);
        assert_eq!(summary.last_activity_date, Some(must_date("2026-08-29")));
    }

    #[test]
    fn streak_head_may_be_yesterday() {
        let timestamps = vec![
            must_utc("2026-08-28T07:00:00Z"),
            must_utc("2026-08-27T07:00:00Z"),
        ];
        let summary = compute_streak(&timestamps, must_date("2026-08-29"));
        assert_eq!(summary.current_streak, 2);
    }

    #[test]
    fn stale_head_resets_current_streak() {
        let timestamps = vec![
            must_utc("2026-08-26T07:00:00Z"),
            must_utc("2026-08-25T07:00:00Z"),
        ];
        let summary = compute_streak(&timestamps, must_date("2026-08-29"));
        assert_eq!(summary.current_streak, 0);
        assert_eq!(summary.longest_streak, 2);
    }

    #[test]
    fn longest_streak_may_exceed_current() {
        // 5-day historical run, 2-day gap, then today+yesterday.
        let timestamps = vec![
            must_utc("2026-08-29T07:00:00Z"),
            must_utc("2026-08-28T07:00:00Z"),
            must_utc("2026-08-25T07:00:00Z"),
            must_utc("2026-08-24T07:00:00Z"),
            must_utc("2026-08-23T07:00:00Z"),
            must_utc("2026-08-22T07:00:00Z"),
            must_utc("2026-08-21T07:00:00Z"),
        ];
        let summary = compute_streak(&timestamps, must_date("2026-08-29"));
        assert_eq!(summary.current_streak, 2);
        assert_eq!(summary.longest_streak, 5);
    }

    #[test]
    fn same_day_duplicates_collapse() {
        let timestamps = vec![
            must_utc("2026-08-29T07:00:00Z"),
            must_utc("2026-08-29T20:00:00Z"),
            must_utc("2026-08-28T07:00:00Z"),
        ];
        let summary = compute_streak(&timestamps, must_date("2026-08-29"));
        assert_eq!(summary.current_streak, 2);
        assert_eq!(summary.longest_streak, 2);
    }

    #[test]
    fn empty_history_yields_zeroes() {
        let summary = compute_streak(&[], must_date("2026-08-29"));
        assert_eq!(summary.current_streak, 0);
        assert_eq!(summary.longest_streak, 0);
        assert_eq!(summary.last_activity_date, None);
    }

    #[test]
    fn country_score_matches_reference_value() {
        let score = country_score(1_000, 15, 5.0);
        assert!((score - 223.606_797_749_978_97).abs() < 1e-6);
    }

    #[test]
    fn country_score_with_zero_denominator_is_zero() {
        assert!((country_score(1_000, 0, 0.0) - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn cooldown_remaining_rounds_up() {
        let first = must_utc("2026-08-29T12:00:00Z");
        let retry = must_utc("2026-08-29T12:00:10Z");
        assert_eq!(cooldown_remaining_sec(first, retry, 60), 50);

        let mid_second = retry + Duration::milliseconds(500);
        assert_eq!(cooldown_remaining_sec(first, mid_second, 60), 50);

        let elapsed = must_utc("2026-08-29T12:01:00Z");
        assert_eq!(cooldown_remaining_sec(first, elapsed, 60), 0);
    }

    #[test]
    fn denial_messages_carry_rule_data() {
        let denial = AwardDenial::CooldownActive { retry_in_sec: 42 };
        assert_eq!(denial.message(), "cooldown active, retry in 42s");

        let outcome = AwardOutcome::denied(AwardDenial::DailyCapReached { cap: 3 });
        assert!(!outcome.success);
        assert_eq!(outcome.xp_earned, 0);
        assert!(outcome.message.contains('3'));
    }

    #[test]
    fn denial_json_uses_snake_case_codes() {
        let value = must_ok(serde_json::to_value(AwardDenial::CooldownActive {
            retry_in_sec: 50,
        }));
        assert_eq!(value["code"], "cooldown_active");
        assert_eq!(value["retry_in_sec"], 50);
    }

    #[test]
    fn action_catalog_entries_validate() {
        for action in default_action_catalog() {
            must_ok(action.validate());
        }
    }

    #[test]
    fn ruleset_rejects_out_of_bounds_values() {
        let mut ruleset = RewardRuleset::v1();
        ruleset.streak_bonus_cap = 1.5;
        assert!(ruleset.validate().is_err());

        let mut ruleset = RewardRuleset::v1();
        ruleset.committed_multiplier = 0.5;
        assert!(ruleset.validate().is_err());
    }

    #[test]
    fn ruleset_round_trips_through_json() {
        let ruleset = RewardRuleset::v1();
        let value = must_ok(serde_json::to_value(&ruleset));
        let decoded = must_ok(RewardRuleset::from_json(&value));
        assert_eq!(ruleset, decoded);
    }

    #[test]
    fn country_code_normalization() {
        assert_eq!(must_ok(normalize_country_code(" de ")), "DE");
        assert!(normalize_country_code("DEU").is_err());
        assert!(normalize_country_code("d1").is_err());
    }

    #[test]
    fn non_utc_timestamps_are_rejected() {
        assert!(parse_rfc3339_utc("2026-08-29T12:00:00+02:00").is_err());
        assert!(parse_rfc3339_utc("not-a-timestamp").is_err());
    }

    #[test]
    fn format_rfc3339_truncates_subseconds_so_text_order_matches_time_order() {
        let base = must_utc("2026-08-29T12:00:00Z");
        let fractional = must_ok(base.replace_nanosecond(500_000_000));

        let formatted = must_ok(format_rfc3339(fractional));
        assert_eq!(formatted, "2026-08-29T12:00:00Z");

        // Without truncation "..:00.5Z" would sort before "..:00Z".
        let next_second = must_ok(format_rfc3339(base + time::Duration::seconds(1)));
        assert!(formatted < next_second);
    }
}
