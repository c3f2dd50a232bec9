use std::fs;

use anyhow::Result;
use grit_ledger_cli::{
    run_command_with_db, ActivityCommand, ActivityLogArgs, Command, JobsCommand, JobsEnqueueArgs,
    LeaderboardCommand, LeaderboardShowArgs, SourceArg, XpAwardArgs, XpCommand,
};
use grit_ledger_core::{now_utc, Tier};
use grit_ledger_store_sqlite::SqliteRewardStore;
use ulid::Ulid;

fn must<T>(result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err}"),
    }
}

#[test]
fn award_flow_drives_ledger_history_and_leaderboard() {
    let db_path = std::env::temp_dir().join(format!("grit-cli-e2e-{}.sqlite3", Ulid::new()));

    let store = must(SqliteRewardStore::open(&db_path));
    must(store.migrate());
    let user = must(store.create_user("cli tester", "DE", Tier::Player, now_utc()));
    drop(store);

    must(run_command_with_db(
        &db_path,
        Command::Activity {
            command: ActivityCommand::Log(ActivityLogArgs {
                user_id: user.user_id.to_string(),
                source: SourceArg::Workout,
                occurred_at: None,
                metadata_json: "{}".to_string(),
            }),
        },
    ));

    for _ in 0..2 {
        must(run_command_with_db(
            &db_path,
            Command::Xp {
                command: XpCommand::Award(XpAwardArgs {
                    user_id: user.user_id.to_string(),
                    action: "workout_complete".to_string(),
                    idempotency_key: Some("cli-req-1".to_string()),
                    metadata_json: "{}".to_string(),
                }),
            },
        ));
    }

    must(run_command_with_db(
        &db_path,
        Command::Leaderboard {
            command: LeaderboardCommand::Show(LeaderboardShowArgs {
                season: None,
                country: Some("DE".to_string()),
                limit: 10,
            }),
        },
    ));

    let store = must(SqliteRewardStore::open(&db_path));
    let history = must(store.xp_history(user.user_id, 10, 0));
    assert_eq!(history.len(), 1, "idempotent replay must not duplicate");
    assert_eq!(history[0].idempotency_key.as_deref(), Some("cli-req-1"));

    let stats = match must(store.country_stats("DE", None)) {
        Some(value) => value,
        None => panic!("missing country stats after award"),
    };
    assert!(stats.total_xp > 0);
    drop(store);

    let _ = fs::remove_file(&db_path);
}

#[test]
fn jobs_surface_enqueues_and_reports_depths() {
    let db_path = std::env::temp_dir().join(format!("grit-cli-jobs-{}.sqlite3", Ulid::new()));

    must(run_command_with_db(
        &db_path,
        Command::Jobs {
            command: JobsCommand::Enqueue(JobsEnqueueArgs {
                queue: "email".to_string(),
                job_type: "send_welcome".to_string(),
                payload_json: r#"{"to":"a@b.c"}"#.to_string(),
                priority: 0,
                dedupe_key: Some("welcome-1".to_string()),
                max_attempts: None,
                delay_ms: 0,
            }),
        },
    ));

    // Same dedupe key: must not produce a second job.
    must(run_command_with_db(
        &db_path,
        Command::Jobs {
            command: JobsCommand::Enqueue(JobsEnqueueArgs {
                queue: "email".to_string(),
                job_type: "send_welcome".to_string(),
                payload_json: r#"{"to":"a@b.c"}"#.to_string(),
                priority: 0,
                dedupe_key: Some("welcome-1".to_string()),
                max_attempts: None,
                delay_ms: 0,
            }),
        },
    ));

    must(run_command_with_db(&db_path, Command::Jobs {
        command: JobsCommand::Depths,
    }));

    let queue = must(grit_ledger_dispatch::SqliteJobQueue::open(
        match db_path.to_str() {
            Some(value) => value,
            None => panic!("temp db path must be valid UTF-8"),
        },
    ));
    let depths = must(queue.depths());
    let email = depths
        .iter()
        .find(|d| d.queue_name == "email")
        .map_or(0, |d| d.waiting);
    assert_eq!(email, 1);

    let _ = fs::remove_file(&db_path);
}
