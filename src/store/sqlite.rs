// src/store/sqlite.rs — SQLite-backed run store

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::schema;
use super::{RunListing, RunStore};
use crate::core::cache::CacheEntry;
use crate::core::types::{
    ActionType, AgentConversation, AgentRole, Direction, Run, RunStatus, Step, StepStatus,
};
use crate::infra::errors::ForgeError;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> Result<Self, ForgeError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        schema::run_migrations(&conn)?;
        Ok(Self::from_conn(conn))
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, ForgeError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        schema::run_migrations(&conn)?;
        Ok(Self::from_conn(conn))
    }

    fn from_conn(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn load_steps(conn: &Connection, run_id: &str) -> Result<Vec<Step>, ForgeError> {
        let mut stmt = conn.prepare(
            "SELECT step_number, description, action, files, status, retries, model_used,
                    patch, test_result, review_feedback, failure_reason, cost, tokens_in, tokens_out
             FROM steps WHERE run_id = ?1 ORDER BY step_number",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(Step {
                step_number: row.get(0)?,
                description: row.get(1)?,
                action: ActionType::parse(&row.get::<_, String>(2)?),
                files: from_json(row, 3)?,
                status: StepStatus::parse(&row.get::<_, String>(4)?).unwrap_or(StepStatus::Pending),
                retries: row.get(5)?,
                model_used: row.get(6)?,
                patch: row.get(7)?,
                test_result: match row.get::<_, Option<String>>(8)? {
                    Some(_) => Some(from_json(row, 8)?),
                    None => None,
                },
                review_feedback: row.get(9)?,
                failure_reason: row.get(10)?,
                cost: row.get(11)?,
                tokens_in: row.get(12)?,
                tokens_out: row.get(13)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn write_step(conn: &Connection, run_id: &str, step: &Step) -> Result<(), ForgeError> {
    let test_result = step.test_result.as_ref().map(to_json).transpose()?;
    conn.execute(
        "INSERT OR REPLACE INTO steps (run_id, step_number, description, action, files, status,
            retries, model_used, patch, test_result, review_feedback, failure_reason, cost,
            tokens_in, tokens_out)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            run_id,
            step.step_number,
            step.description,
            step.action.as_str(),
            to_json(&step.files)?,
            step.status.as_str(),
            step.retries,
            step.model_used,
            step.patch,
            test_result,
            step.review_feedback,
            step.failure_reason,
            step.cost,
            step.tokens_in,
            step.tokens_out,
        ],
    )?;
    Ok(())
}

impl RunStore for SqliteStore {
    fn save_run(&self, run: &Run) -> Result<(), ForgeError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO runs (id, goal, stack, status, current_step, cost_used, daily_budget,
                plan_revision_count, plan_text, workspace, failure_reason, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                current_step = excluded.current_step,
                cost_used = excluded.cost_used,
                plan_revision_count = excluded.plan_revision_count,
                plan_text = excluded.plan_text,
                workspace = excluded.workspace,
                failure_reason = excluded.failure_reason,
                finished_at = excluded.finished_at",
            params![
                run.id,
                run.goal,
                run.stack,
                run.status.as_str(),
                run.current_step as i64,
                run.cost_used,
                run.daily_budget,
                run.plan_revision_count,
                run.plan_text,
                run.workspace.as_ref().map(|p| p.to_string_lossy().into_owned()),
                run.failure_reason,
                run.started_at.to_rfc3339(),
                run.finished_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        // Replanning replaces the step list wholesale.
        tx.execute("DELETE FROM steps WHERE run_id = ?1", params![run.id])?;
        for step in &run.steps {
            write_step(&tx, &run.id, step)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn save_step(&self, run_id: &str, step: &Step) -> Result<(), ForgeError> {
        write_step(&self.conn(), run_id, step)
    }

    fn load_run(&self, id: &str) -> Result<Option<Run>, ForgeError> {
        let conn = self.conn();
        let run = conn
            .query_row(
                "SELECT id, goal, stack, status, current_step, cost_used, daily_budget,
                        plan_revision_count, plan_text, workspace, failure_reason,
                        started_at, finished_at
                 FROM runs WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Run {
                        id: row.get(0)?,
                        goal: row.get(1)?,
                        stack: row.get(2)?,
                        status: parse_status(row, 3)?,
                        current_step: row.get::<_, i64>(4)? as usize,
                        cost_used: row.get(5)?,
                        daily_budget: row.get(6)?,
                        steps: Vec::new(),
                        plan_revision_count: row.get(7)?,
                        plan_text: row.get(8)?,
                        workspace: row.get::<_, Option<String>>(9)?.map(PathBuf::from),
                        failure_reason: row.get(10)?,
                        started_at: parse_ts(row, 11)?,
                        finished_at: match row.get::<_, Option<String>>(12)? {
                            Some(_) => Some(parse_ts(row, 12)?),
                            None => None,
                        },
                    })
                },
            )
            .optional()?;

        match run {
            Some(mut run) => {
                run.steps = Self::load_steps(&conn, &run.id)?;
                Ok(Some(run))
            }
            None => Ok(None),
        }
    }

    fn list_runs(&self, limit: usize) -> Result<Vec<RunListing>, ForgeError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT r.id, r.goal, r.stack, r.status, r.cost_used, r.failure_reason,
                    r.started_at, r.finished_at,
                    (SELECT COUNT(*) FROM steps s WHERE s.run_id = r.id)
             FROM runs r ORDER BY r.started_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(RunListing {
                id: row.get(0)?,
                goal: row.get(1)?,
                stack: row.get(2)?,
                status: parse_status(row, 3)?,
                cost_used: row.get(4)?,
                failure_reason: row.get(5)?,
                started_at: parse_ts(row, 6)?,
                finished_at: match row.get::<_, Option<String>>(7)? {
                    Some(_) => Some(parse_ts(row, 7)?),
                    None => None,
                },
                step_count: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn append_conversation(&self, entry: &AgentConversation) -> Result<(), ForgeError> {
        self.conn().execute(
            "INSERT INTO agent_conversations
                (run_id, step_number, agent, direction, payload, attempt, tier, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.run_id,
                entry.step_number,
                entry.agent.as_str(),
                entry.direction.as_str(),
                entry.payload,
                entry.attempt,
                entry.tier,
                entry.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn conversations(&self, run_id: &str) -> Result<Vec<AgentConversation>, ForgeError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT run_id, step_number, agent, direction, payload, attempt, tier, created_at
             FROM agent_conversations WHERE run_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            let agent: String = row.get(2)?;
            let direction: String = row.get(3)?;
            Ok(AgentConversation {
                run_id: row.get(0)?,
                step_number: row.get(1)?,
                agent: AgentRole::parse(&agent).ok_or_else(|| bad_text(2, &agent))?,
                direction: Direction::parse(&direction).ok_or_else(|| bad_text(3, &direction))?,
                payload: row.get(4)?,
                attempt: row.get(5)?,
                tier: row.get(6)?,
                created_at: parse_ts(row, 7)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn spent_today(&self) -> Result<f64, ForgeError> {
        let midnight = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc().to_rfc3339())
            .unwrap_or_default();
        let spent: f64 = self.conn().query_row(
            "SELECT COALESCE(SUM(cost_used), 0) FROM runs WHERE started_at >= ?1",
            params![midnight],
            |r| r.get(0),
        )?;
        Ok(spent)
    }

    fn save_cache_entries(&self, entries: &[CacheEntry]) -> Result<(), ForgeError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM cache_entries", [])?;
        for e in entries {
            tx.execute(
                "INSERT INTO cache_entries (key, content, created_at, last_used, ttl_secs, usage_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    e.key,
                    e.content,
                    e.created_at.to_rfc3339(),
                    e.last_used.to_rfc3339(),
                    e.ttl_secs as i64,
                    e.usage_count,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn load_cache_entries(&self) -> Result<Vec<CacheEntry>, ForgeError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT key, content, created_at, last_used, ttl_secs, usage_count
             FROM cache_entries ORDER BY last_used",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(CacheEntry {
                key: row.get(0)?,
                content: row.get(1)?,
                created_at: parse_ts(row, 2)?,
                last_used: parse_ts(row, 3)?,
                ttl_secs: row.get::<_, i64>(4)?.max(0) as u64,
                usage_count: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn clear_cache_entries(&self) -> Result<usize, ForgeError> {
        Ok(self.conn().execute("DELETE FROM cache_entries", [])?)
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, ForgeError> {
    serde_json::to_string(value).map_err(|e| ForgeError::Other(e.into()))
}

fn from_json<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_status(row: &Row<'_>, idx: usize) -> rusqlite::Result<RunStatus> {
    let text: String = row.get(idx)?;
    RunStatus::parse(&text).ok_or_else(|| bad_text(idx, &text))
}

fn bad_text(idx: usize, text: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unrecognized value '{text}'").into(),
    )
}
