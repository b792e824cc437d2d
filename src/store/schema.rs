// src/store/schema.rs — Schema + migrations

use rusqlite::{params, Connection};
use tracing::info;

/// A database migration with version, name, and SQL statements.
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub up: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "runs_and_steps",
        up: "
            CREATE TABLE runs (
                id TEXT PRIMARY KEY,
                goal TEXT NOT NULL,
                stack TEXT NOT NULL,
                status TEXT NOT NULL,
                current_step INTEGER NOT NULL DEFAULT 0,
                cost_used REAL NOT NULL DEFAULT 0,
                daily_budget REAL NOT NULL,
                plan_revision_count INTEGER NOT NULL DEFAULT 0,
                plan_text TEXT,
                workspace TEXT,
                failure_reason TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT
            );
            CREATE INDEX idx_runs_started ON runs(started_at);

            CREATE TABLE steps (
                run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                step_number INTEGER NOT NULL,
                description TEXT NOT NULL,
                action TEXT NOT NULL,
                files TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL,
                retries INTEGER NOT NULL DEFAULT 0,
                model_used TEXT,
                patch TEXT,
                test_result TEXT,
                review_feedback TEXT,
                failure_reason TEXT,
                cost REAL NOT NULL DEFAULT 0,
                tokens_in INTEGER NOT NULL DEFAULT 0,
                tokens_out INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (run_id, step_number)
            );
        ",
    },
    Migration {
        version: 2,
        name: "conversation_log",
        up: "
            CREATE TABLE agent_conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                step_number INTEGER,
                agent TEXT NOT NULL,
                direction TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX idx_conversations_run ON agent_conversations(run_id, id);
        ",
    },
    Migration {
        version: 3,
        name: "prompt_cache",
        up: "
            CREATE TABLE cache_entries (
                key TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_used TEXT NOT NULL,
                ttl_secs INTEGER NOT NULL,
                usage_count INTEGER NOT NULL DEFAULT 1
            );
        ",
    },
    Migration {
        version: 4,
        name: "conversation_attempts",
        up: "
            ALTER TABLE agent_conversations ADD COLUMN attempt INTEGER;
            ALTER TABLE agent_conversations ADD COLUMN tier TEXT;
        ",
    },
];

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current_version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current_version) {
        info!(
            "Applying migration {}: {}",
            migration.version, migration.name
        );

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.up)?;
        tx.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            params![migration.version, migration.name],
        )?;
        tx.commit()?;
    }

    Ok(())
}
