use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use trellis_core::{Result, TrellisError};

/// Lifecycle of one artifact row in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            "skipped" => Some(ExecutionStatus::Skipped),
            _ => None,
        }
    }
}

/// One cached artifact execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub artifact_id: String,
    pub input_hash: String,
    pub status: ExecutionStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub executed_at: String,
    pub execution_time_ms: i64,
    pub skip_count: i64,
}

/// Counters for one execution run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub total_artifacts: i64,
    pub executed: i64,
    pub skipped: i64,
    pub failed: i64,
    pub status: String,
}

/// Aggregate view of the cache, for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub by_status: BTreeMap<String, i64>,
    pub total_skips: i64,
    pub avg_execution_time_ms: f64,
    pub estimated_time_saved_ms: f64,
    pub hit_rate: f64,
}

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS artifacts (
    id                TEXT PRIMARY KEY,
    input_hash        TEXT NOT NULL,
    status            TEXT NOT NULL
        CHECK (status IN ('pending', 'running', 'completed', 'failed', 'skipped')),
    result            TEXT,
    error             TEXT,
    executed_at       TEXT NOT NULL,
    execution_time_ms INTEGER NOT NULL DEFAULT 0,
    skip_count        INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS provenance (
    dependent_id  TEXT NOT NULL,
    dependency_id TEXT NOT NULL,
    relation      TEXT NOT NULL DEFAULT 'requires',
    PRIMARY KEY (dependent_id, dependency_id)
);
CREATE INDEX IF NOT EXISTS idx_provenance_dependency ON provenance(dependency_id);

CREATE TABLE IF NOT EXISTS execution_runs (
    run_id          TEXT PRIMARY KEY,
    started_at      TEXT NOT NULL,
    finished_at     TEXT,
    total_artifacts INTEGER NOT NULL,
    executed        INTEGER NOT NULL DEFAULT 0,
    skipped         INTEGER NOT NULL DEFAULT 0,
    failed          INTEGER NOT NULL DEFAULT 0,
    status          TEXT NOT NULL DEFAULT 'in_progress'
);

CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// Content-addressed execution cache backed by SQLite.
///
/// Rows outlive individual runs: a later run with the same input hashes
/// skips work recorded here. The provenance table mirrors the executed
/// dependency edges so invalidation can walk the real graph, not the
/// planned one.
pub struct ExecutionCache {
    conn: Mutex<Connection>,
}

impl ExecutionCache {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(|e| TrellisError::Database(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        Self::init(conn)
    }

    /// In-memory cache for tests.
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| TrellisError::Database(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        conn.execute(
            "INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', ?1)",
            params![SCHEMA_VERSION.to_string()],
        )
        .map_err(|e| TrellisError::Database(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| TrellisError::Database("connection lock poisoned".to_string()))
    }

    /// Load a cache entry. A row with an unreadable status or result is
    /// logged and treated as a miss; the cache never fails a run.
    pub fn get(&self, artifact_id: &str) -> Result<Option<CacheEntry>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, input_hash, status, result, error, executed_at,
                        execution_time_ms, skip_count
                 FROM artifacts WHERE id = ?1",
                params![artifact_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        let Some((id, input_hash, status, result, error, executed_at, time_ms, skips)) = row
        else {
            return Ok(None);
        };

        let Some(status) = ExecutionStatus::parse(&status) else {
            warn!(artifact_id = %id, status = %status, "unknown status in cache row, treating as miss");
            return Ok(None);
        };
        let result = match result {
            Some(text) => match serde_json::from_str(&text) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(artifact_id = %id, error = %e, "malformed result JSON in cache row, treating as miss");
                    return Ok(None);
                }
            },
            None => None,
        };

        Ok(Some(CacheEntry {
            artifact_id: id,
            input_hash,
            status,
            result,
            error,
            executed_at,
            execution_time_ms: time_ms,
            skip_count: skips,
        }))
    }

    /// Entry only if its stored input hash matches. This is the skip probe
    /// the executor uses.
    pub fn get_by_hash(&self, artifact_id: &str, input_hash: &str) -> Result<Option<CacheEntry>> {
        Ok(self
            .get(artifact_id)?
            .filter(|entry| entry.input_hash == input_hash))
    }

    /// Upsert an execution outcome. Skip counts survive the update.
    pub fn set(
        &self,
        artifact_id: &str,
        input_hash: &str,
        status: ExecutionStatus,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
        execution_time_ms: i64,
    ) -> Result<()> {
        let result_text = match result {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        };
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO artifacts (id, input_hash, status, result, error, executed_at, execution_time_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                 input_hash = excluded.input_hash,
                 status = excluded.status,
                 result = excluded.result,
                 error = excluded.error,
                 executed_at = excluded.executed_at,
                 execution_time_ms = excluded.execution_time_ms",
            params![
                artifact_id,
                input_hash,
                status.as_str(),
                result_text,
                error,
                Utc::now().to_rfc3339(),
                execution_time_ms,
            ],
        )
        .map_err(|e| TrellisError::Database(e.to_string()))?;
        Ok(())
    }

    /// Count one avoided execution. The row keeps its status and result.
    pub fn record_skip(&self, artifact_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE artifacts SET skip_count = skip_count + 1 WHERE id = ?1",
            params![artifact_id],
        )
        .map_err(|e| TrellisError::Database(e.to_string()))?;
        Ok(())
    }

    /// Remove an artifact row and every provenance edge touching it.
    pub fn delete(&self, artifact_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM artifacts WHERE id = ?1", params![artifact_id])
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        conn.execute(
            "DELETE FROM provenance WHERE dependent_id = ?1 OR dependency_id = ?1",
            params![artifact_id],
        )
        .map_err(|e| TrellisError::Database(e.to_string()))?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<CacheEntry>> {
        let ids: Vec<String> = {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare("SELECT id FROM artifacts ORDER BY id")
                .map_err(|e| TrellisError::Database(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| row.get(0))
                .map_err(|e| TrellisError::Database(e.to_string()))?;
            rows.collect::<std::result::Result<_, _>>()
                .map_err(|e| TrellisError::Database(e.to_string()))?
        };
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = self.get(&id)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub fn clear(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "DELETE FROM artifacts; DELETE FROM provenance; DELETE FROM execution_runs;",
        )
        .map_err(|e| TrellisError::Database(e.to_string()))?;
        Ok(())
    }

    /// Record one executed dependency edge: `dependent` consumed the
    /// output of `dependency`.
    pub fn add_provenance(&self, dependent: &str, dependency: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO provenance (dependent_id, dependency_id) VALUES (?1, ?2)",
            params![dependent, dependency],
        )
        .map_err(|e| TrellisError::Database(e.to_string()))?;
        Ok(())
    }

    pub fn direct_dependencies(&self, artifact_id: &str) -> Result<Vec<String>> {
        self.id_query(
            "SELECT dependency_id FROM provenance WHERE dependent_id = ?1 ORDER BY dependency_id",
            artifact_id,
        )
    }

    pub fn direct_dependents(&self, artifact_id: &str) -> Result<Vec<String>> {
        self.id_query(
            "SELECT dependent_id FROM provenance WHERE dependency_id = ?1 ORDER BY dependent_id",
            artifact_id,
        )
    }

    /// Everything `artifact_id` transitively depends on, closest first.
    pub fn upstream(&self, artifact_id: &str, max_depth: u32) -> Result<Vec<String>> {
        self.walk(
            "WITH RECURSIVE walk(id, depth) AS (
                 SELECT dependency_id, 1 FROM provenance WHERE dependent_id = ?1
                 UNION
                 SELECT p.dependency_id, w.depth + 1
                 FROM provenance p JOIN walk w ON p.dependent_id = w.id
                 WHERE w.depth < ?2
             )
             SELECT id, MIN(depth) AS d FROM walk GROUP BY id ORDER BY d, id",
            artifact_id,
            max_depth,
        )
    }

    /// Everything that transitively depends on `artifact_id`, closest first.
    pub fn downstream(&self, artifact_id: &str, max_depth: u32) -> Result<Vec<String>> {
        self.walk(
            "WITH RECURSIVE walk(id, depth) AS (
                 SELECT dependent_id, 1 FROM provenance WHERE dependency_id = ?1
                 UNION
                 SELECT p.dependent_id, w.depth + 1
                 FROM provenance p JOIN walk w ON p.dependency_id = w.id
                 WHERE w.depth < ?2
             )
             SELECT id, MIN(depth) AS d FROM walk GROUP BY id ORDER BY d, id",
            artifact_id,
            max_depth,
        )
    }

    /// Mark exactly the transitive dependents of `artifact_id` as pending
    /// and return the ids whose rows were actually updated. Unrelated rows
    /// are untouched; the artifact itself is only included when the edges
    /// loop back to it.
    pub fn invalidate_downstream(&self, artifact_id: &str) -> Result<Vec<String>> {
        let downstream = self.downstream(artifact_id, u32::MAX)?;
        let conn = self.lock()?;
        let mut invalidated = Vec::new();
        for id in downstream {
            let changed = conn
                .execute(
                    "UPDATE artifacts SET status = 'pending' WHERE id = ?1",
                    params![id],
                )
                .map_err(|e| TrellisError::Database(e.to_string()))?;
            if changed > 0 {
                invalidated.push(id);
            }
        }
        debug!(artifact_id = %artifact_id, count = invalidated.len(), "invalidated downstream");
        Ok(invalidated)
    }

    pub fn start_run(&self, run_id: &str, total_artifacts: usize) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO execution_runs (run_id, started_at, total_artifacts)
             VALUES (?1, ?2, ?3)",
            params![run_id, Utc::now().to_rfc3339(), total_artifacts as i64],
        )
        .map_err(|e| TrellisError::Database(e.to_string()))?;
        Ok(())
    }

    pub fn finish_run(
        &self,
        run_id: &str,
        executed: usize,
        skipped: usize,
        failed: usize,
        status: &str,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE execution_runs
             SET finished_at = ?2, executed = ?3, skipped = ?4, failed = ?5, status = ?6
             WHERE run_id = ?1",
            params![
                run_id,
                Utc::now().to_rfc3339(),
                executed as i64,
                skipped as i64,
                failed as i64,
                status,
            ],
        )
        .map_err(|e| TrellisError::Database(e.to_string()))?;
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT run_id, started_at, finished_at, total_artifacts, executed,
                    skipped, failed, status
             FROM execution_runs WHERE run_id = ?1",
            params![run_id],
            |row| {
                Ok(RunRecord {
                    run_id: row.get(0)?,
                    started_at: row.get(1)?,
                    finished_at: row.get(2)?,
                    total_artifacts: row.get(3)?,
                    executed: row.get(4)?,
                    skipped: row.get(5)?,
                    failed: row.get(6)?,
                    status: row.get(7)?,
                })
            },
        )
        .optional()
        .map_err(|e| TrellisError::Database(e.to_string()))
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let conn = self.lock()?;

        let mut by_status = BTreeMap::new();
        {
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM artifacts GROUP BY status")
                .map_err(|e| TrellisError::Database(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(|e| TrellisError::Database(e.to_string()))?;
            for row in rows {
                let (status, count) = row.map_err(|e| TrellisError::Database(e.to_string()))?;
                by_status.insert(status, count);
            }
        }

        let (total_skips, avg_time): (i64, f64) = conn
            .query_row(
                "SELECT COALESCE(SUM(skip_count), 0),
                        COALESCE(AVG(CASE WHEN status = 'completed' THEN execution_time_ms END), 0.0)
                 FROM artifacts",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        let completed = by_status.get("completed").copied().unwrap_or(0);
        let hit_rate = if completed + total_skips > 0 {
            total_skips as f64 / (completed + total_skips) as f64
        } else {
            0.0
        };

        Ok(CacheStats {
            by_status,
            total_skips,
            avg_execution_time_ms: avg_time,
            estimated_time_saved_ms: total_skips as f64 * avg_time,
            hit_rate,
        })
    }

    fn id_query(&self, sql: &str, param: &str) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params![param], |row| row.get(0))
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        rows.collect::<std::result::Result<_, _>>()
            .map_err(|e| TrellisError::Database(e.to_string()))
    }

    fn walk(&self, sql: &str, param: &str, max_depth: u32) -> Result<Vec<String>> {
        let conn = self.lock()?;
        // The CTE deduplicates on (id, depth), so the depth bound is what
        // terminates a cyclic provenance table. No simple path is longer
        // than the distinct-id count, so cap the bound there.
        let node_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM (SELECT dependent_id AS id FROM provenance
                 UNION SELECT dependency_id FROM provenance)",
                [],
                |row| row.get(0),
            )
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let bound = (max_depth as i64).min(node_count);
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params![param, bound], |row| row.get(0))
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        rows.collect::<std::result::Result<_, _>>()
            .map_err(|e| TrellisError::Database(e.to_string()))
    }
}
