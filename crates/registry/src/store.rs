//! SQLite storage for tenants, API keys, tests, runs and dispatch logs.
//!
//! Single-writer discipline: every multi-statement write runs inside an
//! explicit `BEGIN IMMEDIATE` transaction so a concurrent claim and
//! complete can never interleave. WAL keeps readers unblocked.

use std::path::Path;
use std::str::FromStr;

use rand::Rng;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use vigil_core::debounce::{DebounceConfig, StreakState, apply_observation};
use vigil_core::time::now_ts;

use crate::error::RegistryError;

pub const SCHEMA_VERSION: i64 = 3;

/// Tenant identity resolved from an API-key hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthedTenant {
    pub tenant_id: String,
    pub api_key_id: String,
}

/// Parameters for creating a test.
#[derive(Debug, Clone)]
pub struct NewTest {
    pub tenant_id: String,
    pub name: String,
    pub base_url: String,
    pub test_kind: String,
    pub definition: serde_json::Value,
    pub source_relpath: Option<String>,
    pub source_filename: Option<String>,
    pub source_sha256: Option<String>,
    pub interval_seconds: i64,
    pub timeout_seconds: i64,
    pub jitter_seconds: i64,
    pub down_after_failures: i64,
    pub up_after_successes: i64,
    pub notify_on_recovery: bool,
    pub dispatch_on_failure: bool,
}

impl NewTest {
    #[must_use]
    pub fn stepflow(tenant_id: &str, name: &str, base_url: &str, definition: serde_json::Value) -> Self {
        Self {
            tenant_id: tenant_id.to_owned(),
            name: name.to_owned(),
            base_url: base_url.to_owned(),
            test_kind: "stepflow".to_owned(),
            definition,
            source_relpath: None,
            source_filename: None,
            source_sha256: None,
            interval_seconds: 300,
            timeout_seconds: 45,
            jitter_seconds: 30,
            down_after_failures: 2,
            up_after_successes: 2,
            notify_on_recovery: false,
            dispatch_on_failure: false,
        }
    }
}

/// Partial update; only present fields change.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct TestPatch {
    pub name: Option<String>,
    pub base_url: Option<String>,
    pub definition: Option<serde_json::Value>,
    pub interval_seconds: Option<i64>,
    pub timeout_seconds: Option<i64>,
    pub jitter_seconds: Option<i64>,
    pub down_after_failures: Option<i64>,
    pub up_after_successes: Option<i64>,
    pub notify_on_recovery: Option<bool>,
    pub dispatch_on_failure: Option<bool>,
}

/// One leased run handed to a runner.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ClaimedRun {
    pub run_id: String,
    pub test_id: String,
    pub tenant_id: String,
    pub test_name: String,
    pub base_url: String,
    pub timeout_seconds: i64,
    pub test_kind: String,
    pub definition: serde_json::Value,
    pub source_relpath: Option<String>,
    pub source_filename: Option<String>,
    pub source_sha256: Option<String>,
}

/// Final outcome reported by a runner.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RunCompletion {
    pub status: String,
    #[serde(default)]
    pub elapsed_ms: Option<f64>,
    #[serde(default)]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub final_url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub artifacts: serde_json::Value,
    #[serde(default)]
    pub started_at_ts: Option<f64>,
    #[serde(default)]
    pub finished_at_ts: Option<f64>,
}

/// What `complete_run` changed, for the post-commit alert path.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CompletionOutcome {
    pub updated: bool,
    pub alerted_down: bool,
    pub recovered_up: bool,
    pub effective_ok: Option<bool>,
    pub fail_streak: Option<i64>,
    pub success_streak: Option<i64>,
    pub tenant_id: Option<String>,
    pub test_id: Option<String>,
    pub test_name: Option<String>,
    pub run_id: Option<String>,
}

fn uuid() -> String {
    Uuid::new_v4().to_string()
}

fn jitter_delay(jitter_seconds: i64) -> f64 {
    if jitter_seconds <= 0 {
        0.0
    } else {
        #[allow(clippy::cast_precision_loss)]
        let j = rand::thread_rng().gen_range(0..=jitter_seconds) as f64;
        j
    }
}

fn json_dumps(value: &serde_json::Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_owned())
}

fn json_loads(raw: Option<String>) -> serde_json::Value {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(serde_json::Value::Null)
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the database and apply migrations.
    pub async fn connect(db_path: &str) -> Result<Self, RegistryError> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{db_path}"))
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    // ---- schema -----------------------------------------------------------

    async fn ensure_schema(&self) -> Result<(), RegistryError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("CREATE TABLE IF NOT EXISTS schema_meta (k TEXT PRIMARY KEY, v TEXT NOT NULL)")
            .execute(&mut *conn)
            .await?;
        let current: i64 = sqlx::query("SELECT v FROM schema_meta WHERE k='version'")
            .fetch_optional(&mut *conn)
            .await?
            .and_then(|row| row.get::<String, _>("v").parse().ok())
            .unwrap_or(0);
        if current >= SCHEMA_VERSION {
            return Ok(());
        }
        if current < 1 {
            apply_v1(&mut conn).await?;
        }
        if current < 2 {
            apply_v2(&mut conn).await?;
        }
        if current < 3 {
            apply_v3(&mut conn).await?;
        }
        sqlx::query("INSERT OR REPLACE INTO schema_meta (k, v) VALUES ('version', ?1)")
            .bind(SCHEMA_VERSION.to_string())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    // ---- tenants & keys ---------------------------------------------------

    pub async fn create_tenant(&self, name: &str) -> Result<serde_json::Value, RegistryError> {
        let id = uuid();
        let now = now_ts();
        sqlx::query("INSERT INTO tenants (id, name, created_at_ts, updated_at_ts) VALUES (?1, ?2, ?3, ?3)")
            .bind(&id)
            .bind(name.trim())
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(serde_json::json!({ "id": id, "name": name.trim(), "created_at_ts": now }))
    }

    pub async fn create_api_key(
        &self,
        tenant_id: &str,
        name: &str,
        token_hash: &str,
    ) -> Result<serde_json::Value, RegistryError> {
        let id = uuid();
        let now = now_ts();
        sqlx::query(
            "INSERT INTO api_keys (id, tenant_id, name, token_hash, created_at_ts) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&id)
        .bind(tenant_id)
        .bind(name.trim())
        .bind(token_hash)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(serde_json::json!({
            "id": id, "tenant_id": tenant_id, "name": name.trim(), "created_at_ts": now,
        }))
    }

    pub async fn tenant_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<AuthedTenant>, RegistryError> {
        let row = sqlx::query(
            "SELECT id, tenant_id FROM api_keys WHERE token_hash=?1 AND revoked_at_ts IS NULL",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| AuthedTenant {
            tenant_id: row.get("tenant_id"),
            api_key_id: row.get("id"),
        }))
    }

    // ---- tests ------------------------------------------------------------

    pub async fn insert_test(&self, new: &NewTest) -> Result<serde_json::Value, RegistryError> {
        let test_id = uuid();
        let now = now_ts();
        let next_due = now + jitter_delay(new.jitter_seconds);

        let mut conn = self.pool.acquire().await?;
        begin_immediate(&mut conn).await?;
        let result = async {
            sqlx::query(
                "INSERT INTO tests (
                   id, tenant_id, name, base_url, enabled, interval_seconds, timeout_seconds,
                   jitter_seconds, down_after_failures, up_after_successes, notify_on_recovery,
                   dispatch_on_failure, test_kind, definition_json, source_relpath,
                   source_filename, source_sha256, created_at_ts, updated_at_ts
                 ) VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?17)",
            )
            .bind(&test_id)
            .bind(&new.tenant_id)
            .bind(new.name.trim())
            .bind(new.base_url.trim())
            .bind(new.interval_seconds)
            .bind(new.timeout_seconds)
            .bind(new.jitter_seconds)
            .bind(new.down_after_failures)
            .bind(new.up_after_successes)
            .bind(i64::from(new.notify_on_recovery))
            .bind(i64::from(new.dispatch_on_failure))
            .bind(new.test_kind.trim().to_lowercase())
            .bind(json_dumps(&new.definition))
            .bind(new.source_relpath.as_deref())
            .bind(new.source_filename.as_deref())
            .bind(new.source_sha256.as_deref())
            .bind(now)
            .execute(&mut *conn)
            .await?;

            sqlx::query(
                "INSERT INTO test_state (
                   test_id, effective_ok, fail_streak, success_streak, next_due_ts
                 ) VALUES (?1, 1, 0, 0, ?2)",
            )
            .bind(&test_id)
            .bind(next_due)
            .execute(&mut *conn)
            .await?;
            Ok::<(), sqlx::Error>(())
        }
        .await;
        finish(&mut conn, result).await?;

        Ok(serde_json::json!({
            "id": test_id,
            "tenant_id": new.tenant_id,
            "name": new.name.trim(),
            "base_url": new.base_url.trim(),
            "test_kind": new.test_kind,
            "next_due_ts": next_due,
        }))
    }

    pub async fn update_test_source(
        &self,
        tenant_id: &str,
        test_id: &str,
        source_relpath: &str,
        source_filename: &str,
        source_sha256: Option<&str>,
    ) -> Result<bool, RegistryError> {
        let result = sqlx::query(
            "UPDATE tests
             SET source_relpath=?1, source_filename=?2, source_sha256=?3, updated_at_ts=?4
             WHERE id=?5 AND tenant_id=?6",
        )
        .bind(source_relpath)
        .bind(source_filename)
        .bind(source_sha256)
        .bind(now_ts())
        .bind(test_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_tests(&self, tenant_id: &str) -> Result<Vec<serde_json::Value>, RegistryError> {
        let rows = sqlx::query(
            "SELECT t.*, s.effective_ok, s.fail_streak, s.success_streak, s.last_ok_ts,
                    s.last_fail_ts, s.last_infra_ts, s.next_due_ts
             FROM tests t
             LEFT JOIN test_state s ON s.test_id = t.id
             WHERE t.tenant_id = ?1
             ORDER BY t.created_at_ts DESC",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(test_row_to_json).collect())
    }

    pub async fn get_test(
        &self,
        tenant_id: &str,
        test_id: &str,
    ) -> Result<Option<serde_json::Value>, RegistryError> {
        let row = sqlx::query(
            "SELECT t.*, s.effective_ok, s.fail_streak, s.success_streak, s.last_ok_ts,
                    s.last_fail_ts, s.last_infra_ts, s.next_due_ts
             FROM tests t
             LEFT JOIN test_state s ON s.test_id = t.id
             WHERE t.id = ?1 AND t.tenant_id = ?2",
        )
        .bind(test_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(test_row_to_json))
    }

    /// Internal lookup for the alert path (not tenant-scoped).
    pub async fn get_test_internal(
        &self,
        test_id: &str,
    ) -> Result<Option<serde_json::Value>, RegistryError> {
        let row = sqlx::query("SELECT t.* FROM tests t WHERE t.id = ?1")
            .bind(test_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(test_row_to_json))
    }

    pub async fn patch_test(
        &self,
        tenant_id: &str,
        test_id: &str,
        patch: &TestPatch,
    ) -> Result<bool, RegistryError> {
        let mut changes: Vec<(&str, Bind)> = Vec::new();

        if let Some(name) = &patch.name {
            changes.push(("name", Bind::Text(name.trim().to_owned())));
        }
        if let Some(base_url) = &patch.base_url {
            changes.push(("base_url", Bind::Text(base_url.trim().to_owned())));
        }
        if let Some(definition) = &patch.definition {
            changes.push(("definition_json", Bind::Text(json_dumps(definition))));
        }
        for (column, value) in [
            ("interval_seconds", patch.interval_seconds),
            ("timeout_seconds", patch.timeout_seconds),
            ("jitter_seconds", patch.jitter_seconds),
            ("down_after_failures", patch.down_after_failures),
            ("up_after_successes", patch.up_after_successes),
        ] {
            if let Some(value) = value {
                changes.push((column, Bind::Int(value)));
            }
        }
        for (column, value) in [
            ("notify_on_recovery", patch.notify_on_recovery),
            ("dispatch_on_failure", patch.dispatch_on_failure),
        ] {
            if let Some(value) = value {
                changes.push((column, Bind::Int(i64::from(value))));
            }
        }

        if changes.is_empty() {
            return Ok(false);
        }

        let sets: Vec<String> = changes
            .iter()
            .enumerate()
            .map(|(i, (column, _))| format!("{column}=?{}", i + 1))
            .collect();
        let n = changes.len();
        let sql = format!(
            "UPDATE tests SET {}, updated_at_ts=?{} WHERE id=?{} AND tenant_id=?{}",
            sets.join(", "),
            n + 1,
            n + 2,
            n + 3,
        );

        let mut query = sqlx::query(&sql);
        for (_, value) in changes {
            query = match value {
                Bind::Text(s) => query.bind(s),
                Bind::Int(v) => query.bind(v),
            };
        }
        let result = query
            .bind(now_ts())
            .bind(test_id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Disable semantics: a future `until` keeps the test enabled but the
    /// claim query skips it until then; otherwise it is hard-disabled.
    pub async fn set_test_disabled(
        &self,
        tenant_id: &str,
        test_id: &str,
        disabled: bool,
        reason: Option<&str>,
        until_ts: Option<f64>,
    ) -> Result<bool, RegistryError> {
        let now = now_ts();
        let (enabled, reason, until) = if disabled {
            match until_ts {
                Some(until) if until > now => (1_i64, reason, Some(until)),
                _ => (0, reason, None),
            }
        } else {
            (1, None, None)
        };
        let result = sqlx::query(
            "UPDATE tests
             SET enabled=?1, disabled_reason=?2, disabled_until_ts=?3, updated_at_ts=?4
             WHERE id=?5 AND tenant_id=?6",
        )
        .bind(enabled)
        .bind(reason.map(str::trim))
        .bind(until)
        .bind(now)
        .bind(test_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn trigger_run_now(&self, tenant_id: &str, test_id: &str) -> Result<bool, RegistryError> {
        let result = sqlx::query(
            "UPDATE test_state SET next_due_ts=?1
             WHERE test_id IN (SELECT id FROM tests WHERE id=?2 AND tenant_id=?3)",
        )
        .bind(now_ts())
        .bind(test_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ---- runs -------------------------------------------------------------

    pub async fn list_runs(
        &self,
        tenant_id: &str,
        test_id: &str,
        limit: i64,
    ) -> Result<Vec<serde_json::Value>, RegistryError> {
        let rows = sqlx::query(
            "SELECT r.* FROM runs r
             JOIN tests t ON t.id = r.test_id
             WHERE r.test_id = ?1 AND t.tenant_id = ?2
             ORDER BY r.scheduled_for_ts DESC
             LIMIT ?3",
        )
        .bind(test_id)
        .bind(tenant_id)
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(run_row_to_json).collect())
    }

    pub async fn get_run(
        &self,
        tenant_id: &str,
        run_id: &str,
    ) -> Result<Option<serde_json::Value>, RegistryError> {
        let row = sqlx::query(
            "SELECT r.*, t.tenant_id, t.name AS test_name, t.base_url AS test_base_url
             FROM runs r
             JOIN tests t ON t.id = r.test_id
             WHERE r.id = ?1 AND t.tenant_id = ?2",
        )
        .bind(run_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(|row| {
            let mut value = run_row_to_json(row);
            value["tenant_id"] = row.get::<String, _>("tenant_id").into();
            value["test_name"] = row.get::<String, _>("test_name").into();
            value["test_base_url"] = row.get::<String, _>("test_base_url").into();
            value
        }))
    }

    // ---- runner protocol --------------------------------------------------

    /// Claim up to `max_runs` due tests: set the lock, create a pending
    /// run row, all in one immediate transaction.
    pub async fn claim_due_runs(
        &self,
        max_runs: i64,
        lock_timeout_seconds: u64,
    ) -> Result<Vec<ClaimedRun>, RegistryError> {
        let max_runs = max_runs.clamp(0, 50);
        if max_runs == 0 {
            return Ok(Vec::new());
        }
        let now = now_ts();
        #[allow(clippy::cast_precision_loss)]
        let lock_cutoff = now - (lock_timeout_seconds.max(10) as f64);

        let mut conn = self.pool.acquire().await?;
        begin_immediate(&mut conn).await?;
        let result = async {
            let rows = sqlx::query(
                "SELECT t.id AS test_id, t.tenant_id, t.name AS test_name, t.base_url,
                        t.timeout_seconds, t.test_kind, t.definition_json,
                        t.source_relpath, t.source_filename, t.source_sha256
                 FROM tests t
                 JOIN test_state s ON s.test_id = t.id
                 WHERE t.enabled = 1
                   AND (t.disabled_until_ts IS NULL OR t.disabled_until_ts <= ?1)
                   AND (s.next_due_ts IS NULL OR s.next_due_ts <= ?1)
                   AND (s.running_lock_id IS NULL
                        OR s.running_locked_at_ts IS NULL
                        OR s.running_locked_at_ts < ?2)
                 ORDER BY COALESCE(s.next_due_ts, 0) ASC, t.created_at_ts ASC
                 LIMIT ?3",
            )
            .bind(now)
            .bind(lock_cutoff)
            .bind(max_runs)
            .fetch_all(&mut *conn)
            .await?;

            let mut claimed = Vec::with_capacity(rows.len());
            for row in rows {
                let run_id = uuid();
                let test_id: String = row.get("test_id");
                sqlx::query(
                    "UPDATE test_state SET running_lock_id=?1, running_locked_at_ts=?2 WHERE test_id=?3",
                )
                .bind(&run_id)
                .bind(now)
                .bind(&test_id)
                .execute(&mut *conn)
                .await?;
                sqlx::query(
                    "INSERT INTO runs (id, test_id, scheduled_for_ts, status, error_kind, artifacts_json)
                     VALUES (?1, ?2, ?3, 'infra_degraded', 'pending', '{}')",
                )
                .bind(&run_id)
                .bind(&test_id)
                .bind(now)
                .execute(&mut *conn)
                .await?;

                claimed.push(ClaimedRun {
                    run_id,
                    test_id,
                    tenant_id: row.get("tenant_id"),
                    test_name: row.get("test_name"),
                    base_url: row.get("base_url"),
                    timeout_seconds: row.get::<Option<i64>, _>("timeout_seconds").unwrap_or(45),
                    test_kind: row
                        .get::<Option<String>, _>("test_kind")
                        .map(|k| k.trim().to_lowercase())
                        .filter(|k| !k.is_empty())
                        .unwrap_or_else(|| "stepflow".to_owned()),
                    definition: json_loads(row.get("definition_json")),
                    source_relpath: row.get("source_relpath"),
                    source_filename: row.get("source_filename"),
                    source_sha256: row.get("source_sha256"),
                });
            }
            Ok::<Vec<ClaimedRun>, sqlx::Error>(claimed)
        }
        .await;
        finish(&mut conn, result).await
    }

    /// Complete a run: overwrite the run row, clear the lock, reschedule,
    /// and update the debounced effective state. A missing run is a benign
    /// no-op; infra-degraded outcomes touch `last_infra_ts` only.
    pub async fn complete_run(
        &self,
        run_id: &str,
        completion: &RunCompletion,
    ) -> Result<CompletionOutcome, RegistryError> {
        let run_id = run_id.trim();
        if run_id.is_empty() {
            return Ok(CompletionOutcome::default());
        }
        let now = now_ts();

        let mut conn = self.pool.acquire().await?;
        begin_immediate(&mut conn).await?;
        let result = complete_run_tx(&mut conn, run_id, completion, now).await;
        finish(&mut conn, result).await
    }

    // ---- summaries --------------------------------------------------------

    pub async fn status_summary(&self) -> Result<serde_json::Value, RegistryError> {
        let rows = sqlx::query(
            "SELECT t.id AS test_id, t.tenant_id, t.name AS test_name, t.base_url, t.test_kind,
                    t.enabled, s.effective_ok, s.fail_streak, s.success_streak,
                    s.last_ok_ts, s.last_fail_ts, s.last_infra_ts, s.next_due_ts,
                    r.status AS last_status, r.elapsed_ms AS last_elapsed_ms,
                    r.finished_at_ts AS last_finished_at_ts
             FROM tests t
             LEFT JOIN test_state s ON s.test_id = t.id
             LEFT JOIN runs r ON r.id = (
               SELECT r2.id FROM runs r2 WHERE r2.test_id = t.id
               ORDER BY r2.scheduled_for_ts DESC LIMIT 1
             )
             ORDER BY t.created_at_ts DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        let tests: Vec<serde_json::Value> = rows
            .iter()
            .map(|row| {
                serde_json::json!({
                    "test_id": row.get::<String, _>("test_id"),
                    "tenant_id": row.get::<String, _>("tenant_id"),
                    "test_name": row.get::<String, _>("test_name"),
                    "base_url": row.get::<String, _>("base_url"),
                    "test_kind": row.get::<Option<String>, _>("test_kind"),
                    "enabled": row.get::<i64, _>("enabled") != 0,
                    "effective_ok": row.get::<Option<i64>, _>("effective_ok").map(|v| v != 0),
                    "fail_streak": row.get::<Option<i64>, _>("fail_streak"),
                    "success_streak": row.get::<Option<i64>, _>("success_streak"),
                    "last_ok_ts": row.get::<Option<f64>, _>("last_ok_ts"),
                    "last_fail_ts": row.get::<Option<f64>, _>("last_fail_ts"),
                    "last_infra_ts": row.get::<Option<f64>, _>("last_infra_ts"),
                    "next_due_ts": row.get::<Option<f64>, _>("next_due_ts"),
                    "last_status": row.get::<Option<String>, _>("last_status"),
                    "last_elapsed_ms": row.get::<Option<f64>, _>("last_elapsed_ms"),
                    "last_finished_at_ts": row.get::<Option<f64>, _>("last_finished_at_ts"),
                })
            })
            .collect();

        let failing = tests
            .iter()
            .filter(|t| t["effective_ok"] == serde_json::json!(false))
            .count();
        Ok(serde_json::json!({
            "ok": true,
            "total_tests": tests.len(),
            "failing_tests": failing,
            "tests": tests.into_iter().take(200).collect::<Vec<_>>(),
        }))
    }

    // ---- dispatch log -----------------------------------------------------

    pub async fn insert_dispatch_run(
        &self,
        state_key: &str,
        bundle: Option<&str>,
        ui_url: Option<&str>,
        queue_state: Option<&str>,
        agent_message: Option<&str>,
        error_message: Option<&str>,
        context: &serde_json::Value,
    ) -> Result<(), RegistryError> {
        sqlx::query(
            "INSERT INTO dispatch_runs
               (id, created_at_ts, state_key, bundle, ui_url, queue_state, agent_message, error_message, context_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(uuid())
        .bind(now_ts())
        .bind(state_key.trim())
        .bind(bundle)
        .bind(ui_url)
        .bind(queue_state)
        .bind(agent_message.map(|m| m.chars().take(20_000).collect::<String>()))
        .bind(error_message.map(|m| m.chars().take(5_000).collect::<String>()))
        .bind(json_dumps(context))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_dispatch_runs(&self, limit: i64) -> Result<Vec<serde_json::Value>, RegistryError> {
        let rows = sqlx::query(
            "SELECT id, created_at_ts, state_key, bundle, ui_url, queue_state,
                    agent_message, error_message, context_json
             FROM dispatch_runs
             ORDER BY created_at_ts DESC
             LIMIT ?1",
        )
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| {
                serde_json::json!({
                    "id": row.get::<String, _>("id"),
                    "created_at_ts": row.get::<f64, _>("created_at_ts"),
                    "state_key": row.get::<String, _>("state_key"),
                    "bundle": row.get::<Option<String>, _>("bundle"),
                    "ui_url": row.get::<Option<String>, _>("ui_url"),
                    "queue_state": row.get::<Option<String>, _>("queue_state"),
                    "agent_message": row.get::<Option<String>, _>("agent_message"),
                    "error_message": row.get::<Option<String>, _>("error_message"),
                    "context": json_loads(row.get("context_json")),
                })
            })
            .collect())
    }
}

enum Bind {
    Text(String),
    Int(i64),
}

async fn begin_immediate(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(())
}

/// Commit on success, roll back on error.
async fn finish<T>(
    conn: &mut SqliteConnection,
    result: Result<T, sqlx::Error>,
) -> Result<T, RegistryError> {
    match result {
        Ok(value) => {
            sqlx::query("COMMIT").execute(&mut *conn).await?;
            Ok(value)
        }
        Err(e) => {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            Err(e.into())
        }
    }
}

async fn complete_run_tx(
    conn: &mut SqliteConnection,
    run_id: &str,
    completion: &RunCompletion,
    now: f64,
) -> Result<CompletionOutcome, sqlx::Error> {
    let Some(row) = sqlx::query(
        "SELECT r.id AS run_id, r.test_id, r.finished_at_ts AS prev_finished_at_ts,
                r.error_kind AS prev_error_kind,
                t.tenant_id, t.name AS test_name,
                t.interval_seconds, t.jitter_seconds, t.down_after_failures, t.up_after_successes,
                s.effective_ok, s.fail_streak, s.success_streak
         FROM runs r
         JOIN tests t ON t.id = r.test_id
         JOIN test_state s ON s.test_id = t.id
         WHERE r.id = ?1",
    )
    .bind(run_id)
    .fetch_optional(&mut *conn)
    .await?
    else {
        return Ok(CompletionOutcome {
            run_id: Some(run_id.to_owned()),
            ..CompletionOutcome::default()
        });
    };

    let test_id: String = row.get("test_id");
    let tenant_id: String = row.get("tenant_id");
    let test_name: String = row.get("test_name");

    // A run is pending until its first completion; a later re-send with
    // the same run id only overwrites the run row and must not reschedule
    // or feed the debounce machine again.
    let already_completed = row.get::<Option<f64>, _>("prev_finished_at_ts").is_some()
        || row.get::<Option<String>, _>("prev_error_kind").as_deref() != Some("pending");

    // Idempotent overwrite of the run row.
    sqlx::query(
        "UPDATE runs
         SET started_at_ts=?1, finished_at_ts=?2, status=?3, elapsed_ms=?4, error_kind=?5,
             error_message=?6, final_url=?7, title=?8, artifacts_json=?9
         WHERE id=?10",
    )
    .bind(completion.started_at_ts)
    .bind(completion.finished_at_ts)
    .bind(completion.status.trim().to_lowercase())
    .bind(completion.elapsed_ms)
    .bind(completion.error_kind.as_deref())
    .bind(completion.error_message.as_deref())
    .bind(completion.final_url.as_deref())
    .bind(completion.title.as_deref())
    .bind(if completion.artifacts.is_null() {
        "{}".to_owned()
    } else {
        json_dumps(&completion.artifacts)
    })
    .bind(run_id)
    .execute(&mut *conn)
    .await?;

    if already_completed {
        return Ok(CompletionOutcome {
            updated: true,
            effective_ok: Some(row.get::<Option<i64>, _>("effective_ok").unwrap_or(1) != 0),
            fail_streak: Some(row.get::<Option<i64>, _>("fail_streak").unwrap_or(0)),
            success_streak: Some(row.get::<Option<i64>, _>("success_streak").unwrap_or(0)),
            tenant_id: Some(tenant_id),
            test_id: Some(test_id),
            test_name: Some(test_name),
            run_id: Some(run_id.to_owned()),
            ..CompletionOutcome::default()
        });
    }

    sqlx::query("UPDATE test_state SET running_lock_id=NULL, running_locked_at_ts=NULL WHERE test_id=?1")
        .bind(&test_id)
        .execute(&mut *conn)
        .await?;

    let interval = row.get::<Option<i64>, _>("interval_seconds").unwrap_or(300).max(1);
    let jitter = row.get::<Option<i64>, _>("jitter_seconds").unwrap_or(0).max(0);
    #[allow(clippy::cast_precision_loss)]
    let next_due = now + interval as f64 + jitter_delay(jitter);
    sqlx::query("UPDATE test_state SET next_due_ts=?1 WHERE test_id=?2")
        .bind(next_due)
        .bind(&test_id)
        .execute(&mut *conn)
        .await?;

    let prev_effective = row.get::<Option<i64>, _>("effective_ok").unwrap_or(1) != 0;
    let mut outcome = CompletionOutcome {
        updated: true,
        effective_ok: Some(prev_effective),
        fail_streak: Some(row.get::<Option<i64>, _>("fail_streak").unwrap_or(0)),
        success_streak: Some(row.get::<Option<i64>, _>("success_streak").unwrap_or(0)),
        tenant_id: Some(tenant_id),
        test_id: Some(test_id.clone()),
        test_name: Some(test_name),
        run_id: Some(run_id.to_owned()),
        ..CompletionOutcome::default()
    };

    let status = completion.status.trim().to_lowercase();
    if status == "infra_degraded" {
        // Infra-degraded runs never touch the effective state.
        sqlx::query("UPDATE test_state SET last_infra_ts=?1 WHERE test_id=?2")
            .bind(now)
            .bind(&test_id)
            .execute(&mut *conn)
            .await?;
        return Ok(outcome);
    }

    let observed_ok = status == "pass";
    let cfg = DebounceConfig {
        down_after_failures: u32::try_from(
            row.get::<Option<i64>, _>("down_after_failures").unwrap_or(2).max(1),
        )
        .unwrap_or(2),
        up_after_successes: u32::try_from(
            row.get::<Option<i64>, _>("up_after_successes").unwrap_or(2).max(1),
        )
        .unwrap_or(2),
    };
    let mut streaks = StreakState {
        fail_streak: u32::try_from(outcome.fail_streak.unwrap_or(0).max(0)).unwrap_or(0),
        success_streak: u32::try_from(outcome.success_streak.unwrap_or(0).max(0)).unwrap_or(0),
    };
    let transition = apply_observation(prev_effective, observed_ok, &mut streaks, cfg);

    sqlx::query(
        "UPDATE test_state
         SET effective_ok=?1, fail_streak=?2, success_streak=?3, last_ok_ts=?4, last_fail_ts=?5
         WHERE test_id=?6",
    )
    .bind(i64::from(transition.effective_ok))
    .bind(i64::from(streaks.fail_streak))
    .bind(i64::from(streaks.success_streak))
    .bind(observed_ok.then_some(now))
    .bind((!observed_ok).then_some(now))
    .bind(&test_id)
    .execute(&mut *conn)
    .await?;

    outcome.effective_ok = Some(transition.effective_ok);
    outcome.fail_streak = Some(i64::from(streaks.fail_streak));
    outcome.success_streak = Some(i64::from(streaks.success_streak));
    outcome.alerted_down = transition.alerted_down;
    outcome.recovered_up = transition.recovered_up;
    Ok(outcome)
}

fn test_row_to_json(row: &SqliteRow) -> serde_json::Value {
    let mut value = serde_json::json!({
        "id": row.get::<String, _>("id"),
        "tenant_id": row.get::<String, _>("tenant_id"),
        "name": row.get::<String, _>("name"),
        "base_url": row.get::<String, _>("base_url"),
        "enabled": row.get::<i64, _>("enabled") != 0,
        "disabled_reason": row.get::<Option<String>, _>("disabled_reason"),
        "disabled_until_ts": row.get::<Option<f64>, _>("disabled_until_ts"),
        "interval_seconds": row.get::<i64, _>("interval_seconds"),
        "timeout_seconds": row.get::<i64, _>("timeout_seconds"),
        "jitter_seconds": row.get::<i64, _>("jitter_seconds"),
        "down_after_failures": row.get::<i64, _>("down_after_failures"),
        "up_after_successes": row.get::<i64, _>("up_after_successes"),
        "notify_on_recovery": row.get::<i64, _>("notify_on_recovery") != 0,
        "dispatch_on_failure": row.get::<i64, _>("dispatch_on_failure") != 0,
        "test_kind": row.get::<Option<String>, _>("test_kind"),
        "definition": json_loads(row.get("definition_json")),
        "source_relpath": row.get::<Option<String>, _>("source_relpath"),
        "source_filename": row.get::<Option<String>, _>("source_filename"),
        "source_sha256": row.get::<Option<String>, _>("source_sha256"),
        "created_at_ts": row.get::<f64, _>("created_at_ts"),
        "updated_at_ts": row.get::<f64, _>("updated_at_ts"),
    });
    // State columns are present on joined queries only.
    for (key, col) in [
        ("last_ok_ts", "last_ok_ts"),
        ("last_fail_ts", "last_fail_ts"),
        ("last_infra_ts", "last_infra_ts"),
        ("next_due_ts", "next_due_ts"),
    ] {
        if let Ok(v) = row.try_get::<Option<f64>, _>(col) {
            value[key] = serde_json::json!(v);
        }
    }
    for (key, col) in [
        ("effective_ok", "effective_ok"),
        ("fail_streak", "fail_streak"),
        ("success_streak", "success_streak"),
    ] {
        if let Ok(v) = row.try_get::<Option<i64>, _>(col) {
            value[key] = serde_json::json!(v);
        }
    }
    value
}

fn run_row_to_json(row: &SqliteRow) -> serde_json::Value {
    serde_json::json!({
        "id": row.get::<String, _>("id"),
        "test_id": row.get::<String, _>("test_id"),
        "scheduled_for_ts": row.get::<f64, _>("scheduled_for_ts"),
        "started_at_ts": row.get::<Option<f64>, _>("started_at_ts"),
        "finished_at_ts": row.get::<Option<f64>, _>("finished_at_ts"),
        "status": row.get::<String, _>("status"),
        "elapsed_ms": row.get::<Option<f64>, _>("elapsed_ms"),
        "error_kind": row.get::<Option<String>, _>("error_kind"),
        "error_message": row.get::<Option<String>, _>("error_message"),
        "final_url": row.get::<Option<String>, _>("final_url"),
        "title": row.get::<Option<String>, _>("title"),
        "artifacts": json_loads(row.get("artifacts_json")),
    })
}

async fn apply_v1(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS tenants (
           id TEXT PRIMARY KEY,
           name TEXT NOT NULL,
           created_at_ts REAL NOT NULL,
           updated_at_ts REAL NOT NULL
         )",
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS api_keys (
           id TEXT PRIMARY KEY,
           tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
           name TEXT NOT NULL,
           token_hash TEXT NOT NULL,
           created_at_ts REAL NOT NULL,
           revoked_at_ts REAL,
           UNIQUE(token_hash)
         )",
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS tests (
           id TEXT PRIMARY KEY,
           tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
           name TEXT NOT NULL,
           base_url TEXT NOT NULL,
           enabled INTEGER NOT NULL DEFAULT 1,
           disabled_reason TEXT,
           disabled_until_ts REAL,
           interval_seconds INTEGER NOT NULL DEFAULT 300,
           timeout_seconds INTEGER NOT NULL DEFAULT 45,
           jitter_seconds INTEGER NOT NULL DEFAULT 30,
           down_after_failures INTEGER NOT NULL DEFAULT 2,
           up_after_successes INTEGER NOT NULL DEFAULT 2,
           notify_on_recovery INTEGER NOT NULL DEFAULT 0,
           dispatch_on_failure INTEGER NOT NULL DEFAULT 0,
           definition_json TEXT NOT NULL,
           created_at_ts REAL NOT NULL,
           updated_at_ts REAL NOT NULL
         )",
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS test_state (
           test_id TEXT PRIMARY KEY REFERENCES tests(id) ON DELETE CASCADE,
           effective_ok INTEGER NOT NULL DEFAULT 1,
           fail_streak INTEGER NOT NULL DEFAULT 0,
           success_streak INTEGER NOT NULL DEFAULT 0,
           last_ok_ts REAL,
           last_fail_ts REAL,
           last_infra_ts REAL,
           last_alert_ts REAL,
           next_due_ts REAL,
           running_lock_id TEXT,
           running_locked_at_ts REAL
         )",
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS runs (
           id TEXT PRIMARY KEY,
           test_id TEXT NOT NULL REFERENCES tests(id) ON DELETE CASCADE,
           scheduled_for_ts REAL NOT NULL,
           started_at_ts REAL,
           finished_at_ts REAL,
           status TEXT NOT NULL,
           elapsed_ms REAL,
           error_kind TEXT,
           error_message TEXT,
           final_url TEXT,
           title TEXT,
           artifacts_json TEXT NOT NULL DEFAULT '{}'
         )",
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tests_tenant_enabled ON tests(tenant_id, enabled)")
        .execute(&mut *conn)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_test_state_due ON test_state(next_due_ts)")
        .execute(&mut *conn)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_test_started ON runs(test_id, started_at_ts DESC)")
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// v2: uploaded code-based tests in addition to step flows.
async fn apply_v2(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    for (column, ddl) in [
        ("test_kind", "ALTER TABLE tests ADD COLUMN test_kind TEXT NOT NULL DEFAULT 'stepflow'"),
        ("source_relpath", "ALTER TABLE tests ADD COLUMN source_relpath TEXT"),
        ("source_filename", "ALTER TABLE tests ADD COLUMN source_filename TEXT"),
        ("source_sha256", "ALTER TABLE tests ADD COLUMN source_sha256 TEXT"),
    ] {
        if !column_exists(conn, "tests", column).await? {
            sqlx::query(ddl).execute(&mut *conn).await?;
        }
    }
    Ok(())
}

/// v3: dispatcher triage log for the dashboard.
async fn apply_v3(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS dispatch_runs (
           id TEXT PRIMARY KEY,
           created_at_ts REAL NOT NULL,
           state_key TEXT NOT NULL,
           bundle TEXT,
           ui_url TEXT,
           queue_state TEXT,
           agent_message TEXT,
           error_message TEXT,
           context_json TEXT NOT NULL DEFAULT '{}'
         )",
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_dispatch_runs_created_at ON dispatch_runs(created_at_ts DESC)",
    )
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn column_exists(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
) -> Result<bool, sqlx::Error> {
    let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows
        .iter()
        .any(|row| row.get::<String, _>("name") == column))
}

#[cfg(test)]
pub(crate) async fn lock_state(store: &Store) -> std::collections::BTreeMap<String, Option<String>> {
    let rows = sqlx::query("SELECT test_id, running_lock_id FROM test_state")
        .fetch_all(&store.pool)
        .await
        .unwrap();
    rows.iter()
        .map(|r| (r.get("test_id"), r.get("running_lock_id")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");
        let store = Store::connect(path.to_str().unwrap()).await.unwrap();
        (dir, store)
    }

    async fn seed_test(store: &Store, down_after: i64, up_after: i64) -> (String, String) {
        let tenant = store.create_tenant("acme").await.unwrap();
        let tenant_id = tenant["id"].as_str().unwrap().to_owned();
        let mut new = NewTest::stepflow(
            &tenant_id,
            "login smoke",
            "https://app.example.net",
            serde_json::json!({"name": "login", "steps": [{"type": "goto"}]}),
        );
        new.down_after_failures = down_after;
        new.up_after_successes = up_after;
        new.jitter_seconds = 0;
        let test = store.insert_test(&new).await.unwrap();
        (tenant_id, test["id"].as_str().unwrap().to_owned())
    }

    fn completion(status: &str) -> RunCompletion {
        RunCompletion {
            status: status.to_owned(),
            elapsed_ms: Some(1200.0),
            error_kind: (status == "fail").then(|| "assertion_failed".to_owned()),
            error_message: None,
            final_url: None,
            title: None,
            artifacts: serde_json::json!({}),
            started_at_ts: Some(now_ts()),
            finished_at_ts: Some(now_ts()),
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let (_dir, store) = test_store().await;
        store.ensure_schema().await.unwrap();
        store.ensure_schema().await.unwrap();
    }

    #[tokio::test]
    async fn tenant_scoping_hides_foreign_tests() {
        let (_dir, store) = test_store().await;
        let (tenant_a, test_a) = seed_test(&store, 2, 2).await;
        let other = store.create_tenant("other").await.unwrap();
        let other_id = other["id"].as_str().unwrap();

        assert!(store.get_test(&tenant_a, &test_a).await.unwrap().is_some());
        assert!(store.get_test(other_id, &test_a).await.unwrap().is_none());
        assert!(store.list_tests(other_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_sets_lock_and_creates_pending_run() {
        let (_dir, store) = test_store().await;
        let (_tenant, test_id) = seed_test(&store, 2, 2).await;

        let claimed = store.claim_due_runs(5, 600).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].test_id, test_id);

        let locks = lock_state(&store).await;
        assert_eq!(locks.get(&test_id).unwrap().as_deref(), Some(claimed[0].run_id.as_str()));

        // A second claim must not hand out the locked test.
        assert!(store.claim_due_runs(5, 600).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn complete_clears_lock_and_reschedules() {
        let (_dir, store) = test_store().await;
        let (tenant_id, test_id) = seed_test(&store, 2, 2).await;
        let claimed = store.claim_due_runs(1, 600).await.unwrap();
        let run_id = claimed[0].run_id.clone();

        let outcome = store.complete_run(&run_id, &completion("pass")).await.unwrap();
        assert!(outcome.updated);
        assert!(!outcome.alerted_down);

        let locks = lock_state(&store).await;
        assert_eq!(locks.get(&test_id).unwrap(), &None);

        let test = store.get_test(&tenant_id, &test_id).await.unwrap().unwrap();
        let next_due = test["next_due_ts"].as_f64().unwrap();
        assert!(next_due > now_ts() + 200.0);
    }

    #[tokio::test]
    async fn single_failure_with_threshold_one_alerts_down() {
        let (_dir, store) = test_store().await;
        let (_tenant, test_id) = seed_test(&store, 1, 2).await;
        let claimed = store.claim_due_runs(1, 600).await.unwrap();

        let outcome = store
            .complete_run(&claimed[0].run_id, &completion("fail"))
            .await
            .unwrap();
        assert!(outcome.alerted_down);
        assert_eq!(outcome.effective_ok, Some(false));

        // A later infra-degraded run must not flip it back up.
        store.trigger_run_now(&outcome.tenant_id.clone().unwrap(), &test_id).await.unwrap();
        let claimed = store.claim_due_runs(1, 600).await.unwrap();
        let infra = store
            .complete_run(&claimed[0].run_id, &completion("infra_degraded"))
            .await
            .unwrap();
        assert!(!infra.recovered_up);
        assert_eq!(infra.effective_ok, Some(false));
    }

    #[tokio::test]
    async fn debounced_recovery_needs_two_passes() {
        let (_dir, store) = test_store().await;
        let (tenant_id, test_id) = seed_test(&store, 1, 2).await;

        let run = |store: &Store| {
            let store = store.clone();
            let tenant_id = tenant_id.clone();
            let test_id = test_id.clone();
            async move {
                store.trigger_run_now(&tenant_id, &test_id).await.unwrap();
                store.claim_due_runs(1, 600).await.unwrap()[0].run_id.clone()
            }
        };

        let r1 = store.claim_due_runs(1, 600).await.unwrap()[0].run_id.clone();
        assert!(store.complete_run(&r1, &completion("fail")).await.unwrap().alerted_down);

        let r2 = run(&store).await;
        let first_pass = store.complete_run(&r2, &completion("pass")).await.unwrap();
        assert!(!first_pass.recovered_up);
        assert_eq!(first_pass.effective_ok, Some(false));

        let r3 = run(&store).await;
        let second_pass = store.complete_run(&r3, &completion("pass")).await.unwrap();
        assert!(second_pass.recovered_up);
        assert_eq!(second_pass.effective_ok, Some(true));
    }

    #[tokio::test]
    async fn complete_is_idempotent_per_run() {
        let (_dir, store) = test_store().await;
        let (tenant_id, test_id) = seed_test(&store, 1, 2).await;
        let run_id = store.claim_due_runs(1, 600).await.unwrap()[0].run_id.clone();

        let first = store.complete_run(&run_id, &completion("fail")).await.unwrap();
        assert!(first.alerted_down);
        let next_due_1 = store.get_test(&tenant_id, &test_id).await.unwrap().unwrap()["next_due_ts"]
            .as_f64()
            .unwrap();

        // Re-sending the identical payload neither double-schedules nor
        // re-feeds the debounce machine.
        let second = store.complete_run(&run_id, &completion("fail")).await.unwrap();
        assert!(second.updated);
        assert!(!second.alerted_down);
        assert_eq!(second.effective_ok, Some(false));
        assert_eq!(second.fail_streak, first.fail_streak);
        let next_due_2 = store.get_test(&tenant_id, &test_id).await.unwrap().unwrap()["next_due_ts"]
            .as_f64()
            .unwrap();
        assert!((next_due_2 - next_due_1).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn unknown_run_is_benign_noop() {
        let (_dir, store) = test_store().await;
        let outcome = store.complete_run("missing-run", &completion("pass")).await.unwrap();
        assert!(!outcome.updated);
    }

    #[tokio::test]
    async fn stale_locks_are_reclaimable() {
        let (_dir, store) = test_store().await;
        let (_tenant, test_id) = seed_test(&store, 2, 2).await;

        let first = store.claim_due_runs(1, 600).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(store.claim_due_runs(1, 600).await.unwrap().is_empty());

        // Backdate the lock beyond the timeout: the test becomes claimable
        // again and gets a fresh run id.
        sqlx::query("UPDATE test_state SET running_locked_at_ts=?1, next_due_ts=?1 WHERE test_id=?2")
            .bind(now_ts() - 3_600.0)
            .bind(&test_id)
            .execute(&store.pool)
            .await
            .unwrap();
        let reclaimed = store.claim_due_runs(1, 600).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_ne!(reclaimed[0].run_id, first[0].run_id);
    }

    #[tokio::test]
    async fn disable_until_future_keeps_enabled_but_skips_claims() {
        let (_dir, store) = test_store().await;
        let (tenant_id, test_id) = seed_test(&store, 2, 2).await;

        store
            .set_test_disabled(&tenant_id, &test_id, true, Some("maintenance"), Some(now_ts() + 3600.0))
            .await
            .unwrap();
        let test = store.get_test(&tenant_id, &test_id).await.unwrap().unwrap();
        assert_eq!(test["enabled"], serde_json::json!(true));
        assert!(test["disabled_until_ts"].as_f64().unwrap() > now_ts());
        assert!(store.claim_due_runs(5, 600).await.unwrap().is_empty());

        // A past until hard-disables.
        store
            .set_test_disabled(&tenant_id, &test_id, true, Some("gone"), Some(now_ts() - 10.0))
            .await
            .unwrap();
        let test = store.get_test(&tenant_id, &test_id).await.unwrap().unwrap();
        assert_eq!(test["enabled"], serde_json::json!(false));

        store
            .set_test_disabled(&tenant_id, &test_id, false, None, None)
            .await
            .unwrap();
        let test = store.get_test(&tenant_id, &test_id).await.unwrap().unwrap();
        assert_eq!(test["enabled"], serde_json::json!(true));
        assert_eq!(test["disabled_reason"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn patch_updates_only_given_fields() {
        let (_dir, store) = test_store().await;
        let (tenant_id, test_id) = seed_test(&store, 2, 2).await;

        let patch = TestPatch {
            interval_seconds: Some(900),
            notify_on_recovery: Some(true),
            ..TestPatch::default()
        };
        assert!(store.patch_test(&tenant_id, &test_id, &patch).await.unwrap());
        let test = store.get_test(&tenant_id, &test_id).await.unwrap().unwrap();
        assert_eq!(test["interval_seconds"], serde_json::json!(900));
        assert_eq!(test["notify_on_recovery"], serde_json::json!(true));
        assert_eq!(test["name"], serde_json::json!("login smoke"));

        assert!(!store.patch_test(&tenant_id, &test_id, &TestPatch::default()).await.unwrap());
    }

    #[tokio::test]
    async fn status_summary_counts_failing() {
        let (_dir, store) = test_store().await;
        let (_tenant, _test_id) = seed_test(&store, 1, 2).await;
        let run_id = store.claim_due_runs(1, 600).await.unwrap()[0].run_id.clone();
        store.complete_run(&run_id, &completion("fail")).await.unwrap();

        let summary = store.status_summary().await.unwrap();
        assert_eq!(summary["total_tests"], serde_json::json!(1));
        assert_eq!(summary["failing_tests"], serde_json::json!(1));
        assert_eq!(summary["tests"][0]["last_status"], serde_json::json!("fail"));
    }
}
