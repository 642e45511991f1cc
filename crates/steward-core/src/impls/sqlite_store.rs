//! SqliteTaskStore - SQLite を正本にする TaskStore / AuditLog
//!
//! # 設計原則
//! - CAS は `UPDATE ... WHERE status = ? AND attempts = ?` の影響行数で判定する
//! - 状態遷移と task_events の INSERT は同一トランザクション
//! - 一意性はスキーマの制約で守る（アプリ側のチェックに頼らない）
//!   - `UNIQUE(tenant, requester, idempotency_key)`
//!   - `approvals(task_id) WHERE decision = 'PENDING'` の部分一意インデックス
//!
//! # 実装詳細
//! - `Connection` は `Arc<std::sync::Mutex<_>>` で共有し、クエリは `spawn_blocking` 上で実行
//! - 時刻は RFC 3339（ナノ秒固定幅・UTC）の TEXT。文字列比較がそのまま時刻順になる
//! - ID は表示形式（`task-<ulid>` など）の TEXT

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior, params};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::domain::{
    Approval, ApprovalDecision, ApprovalGrant, ApprovalId, AuditLogEntry, GrantId, Resolution,
    RiskTier, Task, TaskEvent, TaskId, TaskStatus, TaskType, TenantId, UserId,
};
use crate::ports::{AuditLog, Claim, Expect, StatusChange, StoreError, TaskStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    tenant TEXT NOT NULL,
    requester TEXT NOT NULL,
    task_type TEXT NOT NULL,
    idempotency_key TEXT,
    status TEXT NOT NULL,
    risk_tier TEXT NOT NULL,
    scope TEXT NOT NULL,
    payload TEXT NOT NULL,
    result TEXT,
    error TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    parent_id TEXT,
    bypass_grant TEXT,
    lease_expires_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (tenant, requester, idempotency_key)
);
CREATE INDEX IF NOT EXISTS idx_tasks_status_updated ON tasks (status, updated_at);
CREATE INDEX IF NOT EXISTS idx_tasks_lease ON tasks (lease_expires_at);
CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks (tenant, parent_id);

CREATE TABLE IF NOT EXISTS task_events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    task_id TEXT NOT NULL REFERENCES tasks (id),
    tenant TEXT NOT NULL,
    from_status TEXT,
    status TEXT NOT NULL,
    reason TEXT NOT NULL,
    details TEXT NOT NULL,
    at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_task_events_task ON task_events (task_id, seq);

CREATE TABLE IF NOT EXISTS approvals (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    task_id TEXT NOT NULL REFERENCES tasks (id),
    tenant TEXT NOT NULL,
    requester TEXT NOT NULL,
    sub_scope TEXT,
    attempt INTEGER NOT NULL DEFAULT 0,
    decision TEXT NOT NULL,
    reason TEXT,
    requested_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    decided_at TEXT,
    decided_by TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS uq_approvals_pending_task
    ON approvals (task_id) WHERE decision = 'PENDING';
CREATE INDEX IF NOT EXISTS idx_approvals_expires ON approvals (decision, expires_at);

CREATE TABLE IF NOT EXISTS grants (
    id TEXT PRIMARY KEY,
    tenant TEXT NOT NULL,
    user_id TEXT NOT NULL,
    scope TEXT NOT NULL,
    issued_by TEXT NOT NULL,
    issued_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    revoked_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_grants_lookup ON grants (tenant, user_id, scope, expires_at);

CREATE TABLE IF NOT EXISTS audit_log (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    tenant TEXT NOT NULL,
    actor TEXT NOT NULL,
    action TEXT NOT NULL,
    task_id TEXT,
    details TEXT NOT NULL,
    at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_tenant ON audit_log (tenant, seq);
CREATE INDEX IF NOT EXISTS idx_audit_task ON audit_log (task_id, seq);
";

const TASK_COLUMNS: &str = "id, tenant, requester, task_type, idempotency_key, status, \
     risk_tier, scope, payload, result, error, attempts, parent_id, bypass_grant, \
     lease_expires_at, created_at, updated_at";

const APPROVAL_COLUMNS: &str = "id, task_id, tenant, requester, sub_scope, attempt, decision, \
     reason, requested_at, expires_at, decided_at, decided_by";

const GRANT_COLUMNS: &str =
    "id, tenant, user_id, scope, issued_by, issued_at, expires_at, revoked_at";

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, msg) if e.code == ErrorCode::ConstraintViolation => {
                StoreError::Conflict(msg.clone().unwrap_or_else(|| err.to_string()))
            }
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("invalid timestamp {raw:?}: {e}")))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.as_deref().map(parse_ts).transpose()
}

fn parse<T>(raw: &str) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| StoreError::Backend(format!("corrupt column value {raw:?}: {e}")))
}

fn parse_json(raw: &str) -> Result<serde_json::Value, StoreError> {
    Ok(serde_json::from_str(raw)?)
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// tasks 行の生データ
///
/// rusqlite の row closure の中ではドメイン型の検証エラーを返せないので、
/// 一度文字列で取り出してから `into_task` で変換する。
struct TaskRow {
    id: String,
    tenant: String,
    requester: String,
    task_type: String,
    idempotency_key: Option<String>,
    status: String,
    risk_tier: String,
    scope: String,
    payload: String,
    result: Option<String>,
    error: Option<String>,
    attempts: u32,
    parent_id: Option<String>,
    bypass_grant: Option<String>,
    lease_expires_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TaskRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tenant: row.get(1)?,
            requester: row.get(2)?,
            task_type: row.get(3)?,
            idempotency_key: row.get(4)?,
            status: row.get(5)?,
            risk_tier: row.get(6)?,
            scope: row.get(7)?,
            payload: row.get(8)?,
            result: row.get(9)?,
            error: row.get(10)?,
            attempts: row.get(11)?,
            parent_id: row.get(12)?,
            bypass_grant: row.get(13)?,
            lease_expires_at: row.get(14)?,
            created_at: row.get(15)?,
            updated_at: row.get(16)?,
        })
    }

    fn into_task(self) -> Result<Task, StoreError> {
        Ok(Task {
            id: parse(&self.id)?,
            tenant: TenantId::new(self.tenant)
                .map_err(|e| StoreError::Backend(e.to_string()))?,
            requester: UserId::new(self.requester)
                .map_err(|e| StoreError::Backend(e.to_string()))?,
            task_type: TaskType::new(self.task_type)
                .map_err(|e| StoreError::Backend(e.to_string()))?,
            idempotency_key: self.idempotency_key,
            status: parse::<TaskStatus>(&self.status)?,
            risk_tier: parse::<RiskTier>(&self.risk_tier)?,
            scope: self.scope,
            payload: parse_json(&self.payload)?,
            result: self.result.as_deref().map(parse_json).transpose()?,
            error: self.error,
            attempts: self.attempts,
            parent_id: self.parent_id.as_deref().map(parse).transpose()?,
            bypass_grant: self.bypass_grant.as_deref().map(parse).transpose()?,
            lease_expires_at: parse_opt_ts(self.lease_expires_at)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

struct ApprovalRow {
    id: String,
    task_id: String,
    tenant: String,
    requester: String,
    sub_scope: Option<String>,
    attempt: u32,
    decision: String,
    reason: Option<String>,
    requested_at: String,
    expires_at: String,
    decided_at: Option<String>,
    decided_by: Option<String>,
}

impl ApprovalRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            tenant: row.get(2)?,
            requester: row.get(3)?,
            sub_scope: row.get(4)?,
            attempt: row.get(5)?,
            decision: row.get(6)?,
            reason: row.get(7)?,
            requested_at: row.get(8)?,
            expires_at: row.get(9)?,
            decided_at: row.get(10)?,
            decided_by: row.get(11)?,
        })
    }

    fn into_approval(self) -> Result<Approval, StoreError> {
        Ok(Approval {
            id: parse(&self.id)?,
            task_id: parse(&self.task_id)?,
            tenant: TenantId::new(self.tenant).map_err(|e| StoreError::Backend(e.to_string()))?,
            requester: UserId::new(self.requester)
                .map_err(|e| StoreError::Backend(e.to_string()))?,
            sub_scope: self.sub_scope,
            attempt: self.attempt,
            decision: parse::<ApprovalDecision>(&self.decision)?,
            reason: self.reason,
            requested_at: parse_ts(&self.requested_at)?,
            expires_at: parse_ts(&self.expires_at)?,
            decided_at: parse_opt_ts(self.decided_at)?,
            decided_by: self.decided_by,
        })
    }
}

struct GrantRow {
    id: String,
    tenant: String,
    user: String,
    scope: String,
    issued_by: String,
    issued_at: String,
    expires_at: String,
    revoked_at: Option<String>,
}

impl GrantRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tenant: row.get(1)?,
            user: row.get(2)?,
            scope: row.get(3)?,
            issued_by: row.get(4)?,
            issued_at: row.get(5)?,
            expires_at: row.get(6)?,
            revoked_at: row.get(7)?,
        })
    }

    fn into_grant(self) -> Result<ApprovalGrant, StoreError> {
        Ok(ApprovalGrant {
            id: parse(&self.id)?,
            tenant: TenantId::new(self.tenant).map_err(|e| StoreError::Backend(e.to_string()))?,
            user: UserId::new(self.user).map_err(|e| StoreError::Backend(e.to_string()))?,
            scope: self.scope,
            issued_by: self.issued_by,
            issued_at: parse_ts(&self.issued_at)?,
            expires_at: parse_ts(&self.expires_at)?,
            revoked_at: parse_opt_ts(self.revoked_at)?,
        })
    }
}

fn query_tasks(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Task>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, TaskRow::read)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(TaskRow::into_task).collect()
}

fn query_approvals(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Approval>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, ApprovalRow::read)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(ApprovalRow::into_approval).collect()
}

fn query_grants(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<ApprovalGrant>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, GrantRow::read)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(GrantRow::into_grant).collect()
}

fn load_task(conn: &Connection, id: &str) -> Result<Option<Task>, StoreError> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
        params![id],
        TaskRow::read,
    )
    .optional()?
    .map(TaskRow::into_task)
    .transpose()
}

fn load_approval(conn: &Connection, id: &str) -> Result<Option<Approval>, StoreError> {
    conn.query_row(
        &format!("SELECT {APPROVAL_COLUMNS} FROM approvals WHERE id = ?1"),
        params![id],
        ApprovalRow::read,
    )
    .optional()?
    .map(ApprovalRow::into_approval)
    .transpose()
}

fn load_grant(conn: &Connection, id: &str) -> Result<Option<ApprovalGrant>, StoreError> {
    conn.query_row(
        &format!("SELECT {GRANT_COLUMNS} FROM grants WHERE id = ?1"),
        params![id],
        GrantRow::read,
    )
    .optional()?
    .map(GrantRow::into_grant)
    .transpose()
}

fn insert_event(conn: &Connection, event: &TaskEvent) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO task_events (id, task_id, tenant, from_status, status, reason, details, at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            event.id.to_string(),
            event.task_id.to_string(),
            event.tenant.as_str(),
            event.from.map(|s| s.as_str()),
            event.status.as_str(),
            event.reason,
            serde_json::to_string(&event.details)?,
            ts(event.at),
        ],
    )?;
    Ok(())
}

/// `Expect` を WHERE 句のパラメータにする（attempts 未指定は NULL で全一致）
fn expect_params(expect: &Expect) -> (&'static str, Option<u32>) {
    (expect.status.as_str(), expect.attempts)
}

/// SqliteTaskStore は TaskStore と AuditLog の両方を実装する
#[derive(Clone)]
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    /// ファイルを開き（なければ作成し）、スキーマを適用する
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 同期クエリを blocking スレッドで実行する
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Backend("sqlite connection mutex poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("sqlite worker join failed: {e}")))?
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert_task(&self, task: Task, created: TaskEvent) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                &format!(
                    "INSERT INTO tasks ({TASK_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
                ),
                params![
                    task.id.to_string(),
                    task.tenant.as_str(),
                    task.requester.as_str(),
                    task.task_type.as_str(),
                    task.idempotency_key,
                    task.status.as_str(),
                    task.risk_tier.as_str(),
                    task.scope,
                    serde_json::to_string(&task.payload)?,
                    task.result.as_ref().map(serde_json::to_string).transpose()?,
                    task.error,
                    task.attempts,
                    task.parent_id.map(|id| id.to_string()),
                    task.bypass_grant.map(|id| id.to_string()),
                    task.lease_expires_at.map(ts),
                    ts(task.created_at),
                    ts(task.updated_at),
                ],
            )?;
            insert_event(&tx, &created)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        self.with_conn(move |conn| load_task(conn, &id.to_string()))
            .await
    }

    async fn find_by_idempotency_key(
        &self,
        tenant: &TenantId,
        requester: &UserId,
        key: &str,
    ) -> Result<Option<Task>, StoreError> {
        let (tenant, requester, key) = (tenant.clone(), requester.clone(), key.to_string());
        self.with_conn(move |conn| {
            let mut tasks = query_tasks(
                conn,
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE tenant = ?1 AND requester = ?2 AND idempotency_key = ?3"
                ),
                params![tenant.as_str(), requester.as_str(), key],
            )?;
            Ok(tasks.pop())
        })
        .await
    }

    async fn apply_transition(
        &self,
        id: TaskId,
        expect: Expect,
        change: StatusChange,
    ) -> Result<Option<Task>, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let (status, attempts) = expect_params(&expect);
            let updated = tx.execute(
                "UPDATE tasks
                 SET status = ?1, result = ?2, error = ?3, lease_expires_at = NULL, updated_at = ?4
                 WHERE id = ?5 AND status = ?6 AND (?7 IS NULL OR attempts = ?7)",
                params![
                    change.to.as_str(),
                    change.result.as_ref().map(serde_json::to_string).transpose()?,
                    change.error,
                    ts(change.event.at),
                    id.to_string(),
                    status,
                    attempts,
                ],
            )?;
            if updated == 0 {
                return Ok(None);
            }
            insert_event(&tx, &change.event)?;
            let task = load_task(&tx, &id.to_string())?;
            tx.commit()?;
            Ok(task)
        })
        .await
    }

    async fn claim(
        &self,
        id: TaskId,
        expect: Expect,
        claim: Claim,
    ) -> Result<Option<Task>, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let (status, attempts) = expect_params(&expect);
            let updated = tx.execute(
                "UPDATE tasks
                 SET status = 'RUNNING', attempts = attempts + 1,
                     lease_expires_at = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = ?4 AND (?5 IS NULL OR attempts = ?5)
                   AND (lease_expires_at IS NULL OR lease_expires_at <= ?2)",
                params![
                    ts(claim.lease_until),
                    ts(claim.now),
                    id.to_string(),
                    status,
                    attempts,
                ],
            )?;
            if updated == 0 {
                return Ok(None);
            }
            if let Some(event) = &claim.event {
                insert_event(&tx, event)?;
            }
            let task = load_task(&tx, &id.to_string())?;
            tx.commit()?;
            Ok(task)
        })
        .await
    }

    async fn release_lease(
        &self,
        id: TaskId,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE tasks SET lease_expires_at = NULL, updated_at = ?1
                 WHERE id = ?2 AND status = 'RUNNING' AND attempts = ?3",
                params![ts(now), id.to_string(), attempts],
            )?;
            Ok(updated == 1)
        })
        .await
    }

    async fn touch(
        &self,
        id: TaskId,
        expect: Expect,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let (status, attempts) = expect_params(&expect);
            let updated = conn.execute(
                "UPDATE tasks SET updated_at = ?1
                 WHERE id = ?2 AND status = ?3 AND (?4 IS NULL OR attempts = ?4)",
                params![ts(now), id.to_string(), status, attempts],
            )?;
            Ok(updated == 1)
        })
        .await
    }

    async fn list_awaiting_delivery(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        self.with_conn(move |conn| {
            query_tasks(
                conn,
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE (status = 'QUEUED'
                            OR (status = 'RUNNING' AND lease_expires_at IS NULL))
                       AND updated_at <= ?1
                     ORDER BY updated_at
                     LIMIT ?2"
                ),
                params![ts(updated_before), limit_param(limit)],
            )
        })
        .await
    }

    async fn list_lapsed_leases(
        &self,
        lapsed_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        self.with_conn(move |conn| {
            query_tasks(
                conn,
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE status = 'RUNNING' AND lease_expires_at IS NOT NULL
                       AND lease_expires_at <= ?1
                     ORDER BY lease_expires_at
                     LIMIT ?2"
                ),
                params![ts(lapsed_before), limit_param(limit)],
            )
        })
        .await
    }

    async fn list_stranded_waiting(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        self.with_conn(move |conn| {
            query_tasks(
                conn,
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks t
                     WHERE t.status = 'WAITING_APPROVAL'
                       AND NOT EXISTS (
                           SELECT 1 FROM approvals a
                           WHERE a.task_id = t.id AND a.decision = 'PENDING'
                       )
                     ORDER BY t.updated_at
                     LIMIT ?1"
                ),
                params![limit_param(limit)],
            )
        })
        .await
    }

    async fn list_children(
        &self,
        tenant: &TenantId,
        parent_id: TaskId,
    ) -> Result<Vec<Task>, StoreError> {
        let tenant = tenant.clone();
        self.with_conn(move |conn| {
            query_tasks(
                conn,
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE tenant = ?1 AND parent_id = ?2
                     ORDER BY id"
                ),
                params![tenant.as_str(), parent_id.to_string()],
            )
        })
        .await
    }

    async fn count_by_status(
        &self,
        tenant: Option<&TenantId>,
    ) -> Result<BTreeMap<TaskStatus, u64>, StoreError> {
        let tenant = tenant.cloned();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*) FROM tasks
                 WHERE (?1 IS NULL OR tenant = ?1)
                 GROUP BY status",
            )?;
            let rows = stmt
                .query_map(params![tenant.as_ref().map(|t| t.as_str())], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            let mut counts = BTreeMap::new();
            for (status, count) in rows {
                counts.insert(parse::<TaskStatus>(&status)?, count.max(0) as u64);
            }
            Ok(counts)
        })
        .await
    }

    async fn events_for(&self, id: TaskId) -> Result<Vec<TaskEvent>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, task_id, tenant, from_status, status, reason, details, at
                 FROM task_events WHERE task_id = ?1 ORDER BY seq",
            )?;
            let rows = stmt
                .query_map(params![id.to_string()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(id, task_id, tenant, from, status, reason, details, at)| {
                    Ok(TaskEvent {
                        id: parse(&id)?,
                        task_id: parse(&task_id)?,
                        tenant: TenantId::new(tenant)
                            .map_err(|e| StoreError::Backend(e.to_string()))?,
                        from: from.as_deref().map(parse::<TaskStatus>).transpose()?,
                        status: parse(&status)?,
                        reason,
                        details: parse_json(&details)?,
                        at: parse_ts(&at)?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn insert_approval(&self, approval: Approval) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO approvals ({APPROVAL_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    approval.id.to_string(),
                    approval.task_id.to_string(),
                    approval.tenant.as_str(),
                    approval.requester.as_str(),
                    approval.sub_scope,
                    approval.attempt,
                    approval.decision.as_str(),
                    approval.reason,
                    ts(approval.requested_at),
                    ts(approval.expires_at),
                    approval.decided_at.map(ts),
                    approval.decided_by,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_approval(&self, id: ApprovalId) -> Result<Option<Approval>, StoreError> {
        self.with_conn(move |conn| load_approval(conn, &id.to_string()))
            .await
    }

    async fn pending_approval_for(&self, task_id: TaskId) -> Result<Option<Approval>, StoreError> {
        self.with_conn(move |conn| {
            let mut found = query_approvals(
                conn,
                &format!(
                    "SELECT {APPROVAL_COLUMNS} FROM approvals
                     WHERE task_id = ?1 AND decision = 'PENDING'"
                ),
                params![task_id.to_string()],
            )?;
            Ok(found.pop())
        })
        .await
    }

    async fn latest_approval_for(&self, task_id: TaskId) -> Result<Option<Approval>, StoreError> {
        self.with_conn(move |conn| {
            let mut found = query_approvals(
                conn,
                &format!(
                    "SELECT {APPROVAL_COLUMNS} FROM approvals
                     WHERE task_id = ?1 ORDER BY seq DESC LIMIT 1"
                ),
                params![task_id.to_string()],
            )?;
            Ok(found.pop())
        })
        .await
    }

    async fn resolve_approval(
        &self,
        id: ApprovalId,
        resolution: Resolution,
    ) -> Result<Option<Approval>, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let updated = tx.execute(
                "UPDATE approvals
                 SET decision = ?1, reason = ?2, decided_at = ?3, decided_by = ?4
                 WHERE id = ?5 AND decision = 'PENDING'",
                params![
                    resolution.decision.as_str(),
                    resolution.reason,
                    ts(resolution.at),
                    resolution.actor,
                    id.to_string(),
                ],
            )?;
            let approval = load_approval(&tx, &id.to_string())?;
            tx.commit()?;
            match (updated, approval) {
                (_, None) => Err(StoreError::NotFound {
                    entity: "approval",
                    id: id.to_string(),
                }),
                (0, Some(_)) => Ok(None),
                (_, Some(approval)) => Ok(Some(approval)),
            }
        })
        .await
    }

    async fn list_pending_approvals(
        &self,
        tenant: &TenantId,
        user: Option<&UserId>,
    ) -> Result<Vec<Approval>, StoreError> {
        let (tenant, user) = (tenant.clone(), user.cloned());
        self.with_conn(move |conn| {
            query_approvals(
                conn,
                &format!(
                    "SELECT {APPROVAL_COLUMNS} FROM approvals
                     WHERE decision = 'PENDING' AND tenant = ?1
                       AND (?2 IS NULL OR requester = ?2)
                     ORDER BY seq"
                ),
                params![tenant.as_str(), user.as_ref().map(|u| u.as_str())],
            )
        })
        .await
    }

    async fn list_expired_approvals(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Approval>, StoreError> {
        self.with_conn(move |conn| {
            query_approvals(
                conn,
                &format!(
                    "SELECT {APPROVAL_COLUMNS} FROM approvals
                     WHERE decision = 'PENDING' AND expires_at <= ?1
                     ORDER BY expires_at
                     LIMIT ?2"
                ),
                params![ts(now), limit_param(limit)],
            )
        })
        .await
    }

    async fn insert_grant(&self, grant: ApprovalGrant) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                &format!("INSERT INTO grants ({GRANT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                params![
                    grant.id.to_string(),
                    grant.tenant.as_str(),
                    grant.user.as_str(),
                    grant.scope,
                    grant.issued_by,
                    ts(grant.issued_at),
                    ts(grant.expires_at),
                    grant.revoked_at.map(ts),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_grant(&self, id: GrantId) -> Result<Option<ApprovalGrant>, StoreError> {
        self.with_conn(move |conn| load_grant(conn, &id.to_string()))
            .await
    }

    async fn find_active_grant(
        &self,
        tenant: &TenantId,
        user: &UserId,
        scope: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ApprovalGrant>, StoreError> {
        let (tenant, user, scope) = (tenant.clone(), user.clone(), scope.to_string());
        self.with_conn(move |conn| {
            let mut found = query_grants(
                conn,
                &format!(
                    "SELECT {GRANT_COLUMNS} FROM grants
                     WHERE tenant = ?1 AND user_id = ?2 AND scope = ?3
                       AND revoked_at IS NULL AND expires_at > ?4
                     ORDER BY expires_at DESC
                     LIMIT 1"
                ),
                params![tenant.as_str(), user.as_str(), scope, ts(now)],
            )?;
            Ok(found.pop())
        })
        .await
    }

    async fn revoke_grant(
        &self,
        id: GrantId,
        now: DateTime<Utc>,
    ) -> Result<Option<ApprovalGrant>, StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE grants SET revoked_at = ?1 WHERE id = ?2 AND revoked_at IS NULL",
                params![ts(now), id.to_string()],
            )?;
            load_grant(conn, &id.to_string())
        })
        .await
    }

    async fn revoke_grants(
        &self,
        tenant: &TenantId,
        user: &UserId,
        scope: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ApprovalGrant>, StoreError> {
        let (tenant, user, scope) = (tenant.clone(), user.clone(), scope.to_string());
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let active = query_grants(
                &tx,
                &format!(
                    "SELECT {GRANT_COLUMNS} FROM grants
                     WHERE tenant = ?1 AND user_id = ?2 AND scope = ?3
                       AND revoked_at IS NULL AND expires_at > ?4"
                ),
                params![tenant.as_str(), user.as_str(), scope, ts(now)],
            )?;
            let mut revoked = Vec::with_capacity(active.len());
            for mut grant in active {
                tx.execute(
                    "UPDATE grants SET revoked_at = ?1 WHERE id = ?2 AND revoked_at IS NULL",
                    params![ts(now), grant.id.to_string()],
                )?;
                grant.revoked_at = Some(now);
                revoked.push(grant);
            }
            tx.commit()?;
            Ok(revoked)
        })
        .await
    }
}

type AuditColumns = (String, String, String, String, Option<String>, String, String);

fn read_audit(row: &Row<'_>) -> rusqlite::Result<AuditColumns> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn query_audit(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<AuditLogEntry>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, read_audit)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter()
        .map(|(id, tenant, actor, action, task_id, details, at)| {
            Ok(AuditLogEntry {
                id: parse(&id)?,
                tenant: TenantId::new(tenant).map_err(|e| StoreError::Backend(e.to_string()))?,
                actor,
                action,
                task_id: task_id.as_deref().map(parse).transpose()?,
                details: parse_json(&details)?,
                at: parse_ts(&at)?,
            })
        })
        .collect()
}

#[async_trait]
impl AuditLog for SqliteTaskStore {
    async fn append(&self, entry: AuditLogEntry) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO audit_log (id, tenant, actor, action, task_id, details, at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.id.to_string(),
                    entry.tenant.as_str(),
                    entry.actor,
                    entry.action,
                    entry.task_id.map(|id| id.to_string()),
                    serde_json::to_string(&entry.details)?,
                    ts(entry.at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn recent(&self, tenant: &TenantId, limit: usize) -> Result<Vec<AuditLogEntry>, StoreError> {
        let tenant = tenant.clone();
        self.with_conn(move |conn| {
            query_audit(
                conn,
                "SELECT id, tenant, actor, action, task_id, details, at FROM audit_log
                 WHERE tenant = ?1 ORDER BY seq DESC LIMIT ?2",
                params![tenant.as_str(), limit_param(limit)],
            )
        })
        .await
    }

    async fn for_task(&self, task_id: TaskId) -> Result<Vec<AuditLogEntry>, StoreError> {
        self.with_conn(move |conn| {
            query_audit(
                conn,
                "SELECT id, tenant, actor, action, task_id, details, at FROM audit_log
                 WHERE task_id = ?1 ORDER BY seq",
                params![task_id.to_string()],
            )
        })
        .await
    }
}
