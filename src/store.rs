//! The tenant-aware storage client.
//!
//! `TenantDb` is the single legitimate path to every table that carries a
//! `tenant_id` column. The discipline, applied at the query layer so no call
//! site can forget it:
//!
//! - **read**: the current scope's tenant predicate is AND-ed into every
//!   query (or stands alone when the caller supplies none);
//! - **insert**: `tenant_id` is overwritten with the current scope on every
//!   row, element-wise for batches, even if the caller supplied a value;
//! - **update / delete**: the caller must supply a predicate and the tenant
//!   predicate is AND-ed in — rows of other tenants come back as zero
//!   affected rows, never as an error that would leak existence.
//!
//! Outside any scope, every operation against a multi-tenant table fails
//! with [`CoreError::TenantScopeMissing`] before any SQL is sent. Tables
//! without a `tenant_id` column (plans) pass through untouched.
//!
//! Filters use unnumbered `?` placeholders; parameters bind in order, with
//! the tenant id appended last by the wrapper.

use std::str::FromStr;

use rusqlite::types::Value as SqlValue;
use serde_json::{Map, Value};

use crate::db::{Db, DbHandle};
use crate::error::CoreError;
use crate::models::{Job, JobTransition, NewRepository, Plan, Repository};
use crate::scope;
use crate::state::{self, JobEvent, JobStatus};

/// A row expressed as column name -> JSON value.
pub type Row = Map<String, Value>;

/// A SQL predicate fragment plus its positional parameters.
#[derive(Debug, Clone)]
pub struct Filter {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Filter {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// Predicate matching a single row by primary key.
    pub fn by_id(id: &str) -> Self {
        Self::new("id = ?", vec![Value::String(id.to_string())])
    }
}

/// Tenant-aware wrapper over the raw client.
#[derive(Clone)]
pub struct TenantDb {
    db: DbHandle,
}

impl TenantDb {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// The underlying un-scoped handle, for lifecycle code and tests.
    pub fn raw(&self) -> &DbHandle {
        &self.db
    }

    /// Defensive check for rows obtained outside the wrapper: the row must
    /// belong to the current tenant.
    pub fn verify_ownership(&self, row_tenant_id: &str, kind: &str) -> Result<(), CoreError> {
        let tenant = scope::current_tenant_id()?;
        if row_tenant_id == tenant {
            Ok(())
        } else {
            Err(CoreError::access_denied(kind))
        }
    }

    // ── Generic operations ────────────────────────────────────────────

    /// Select rows from `table`, auto-filtered to the current tenant when
    /// the table is multi-tenant.
    pub async fn select(&self, table: &str, filter: Option<Filter>) -> Result<Vec<Row>, CoreError> {
        validate_identifier(table)?;
        let table = table.to_string();
        let tenant = scope::current_tenant_id().ok();
        self.db
            .call(move |db| {
                let tenant = required_scope(db, &table, tenant)?;
                let (where_sql, params) = scoped_predicate(filter, tenant.as_deref());
                let sql = format!("SELECT * FROM {}{}", table, where_sql);
                query_rows(db, &sql, &params)
            })
            .await
    }

    /// Insert a single row; `tenant_id` is stamped from the current scope on
    /// multi-tenant tables regardless of what the caller supplied. Returns
    /// the persisted row.
    pub async fn insert(&self, table: &str, row: Row) -> Result<Row, CoreError> {
        let mut rows = self.insert_many(table, vec![row]).await?;
        rows.pop()
            .ok_or_else(|| CoreError::Other(anyhow::anyhow!("insert returned no row")))
    }

    /// Insert a batch of rows, applying the tenant override element-wise.
    pub async fn insert_many(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, CoreError> {
        validate_identifier(table)?;
        let table = table.to_string();
        let tenant = scope::current_tenant_id().ok();
        self.db
            .call(move |db| {
                let tenant = required_scope(db, &table, tenant)?;
                let mut persisted = Vec::with_capacity(rows.len());
                for mut row in rows {
                    if let Some(ref tenant) = tenant {
                        // Safety override, not a convenience: whatever the
                        // caller put in tenant_id is replaced.
                        row.insert("tenant_id".to_string(), Value::String(tenant.clone()));
                    }
                    let columns: Vec<&String> = row.keys().collect();
                    for column in &columns {
                        validate_identifier(column)?;
                    }
                    let placeholders = vec!["?"; columns.len()].join(", ");
                    let sql = format!(
                        "INSERT INTO {} ({}) VALUES ({})",
                        table,
                        columns
                            .iter()
                            .map(|c| c.as_str())
                            .collect::<Vec<_>>()
                            .join(", "),
                        placeholders
                    );
                    let params: Vec<Value> = row.values().cloned().collect();
                    execute(db, &sql, &params)?;
                    let rowid = db.conn().last_insert_rowid();
                    let mut inserted =
                        query_rows(db, &format!("SELECT * FROM {} WHERE rowid = ?", table), &[
                            Value::from(rowid),
                        ])?;
                    persisted.push(inserted.pop().ok_or_else(|| {
                        CoreError::Other(anyhow::anyhow!("inserted row vanished"))
                    })?);
                }
                Ok(persisted)
            })
            .await
    }

    /// Update rows matching `filter`; on multi-tenant tables the tenant
    /// predicate is AND-ed in, so cross-tenant targets affect zero rows.
    /// Returns the affected row count.
    pub async fn update(&self, table: &str, set: Row, filter: Filter) -> Result<usize, CoreError> {
        validate_identifier(table)?;
        let table = table.to_string();
        let tenant = scope::current_tenant_id().ok();
        self.db
            .call(move |db| {
                let tenant = required_scope(db, &table, tenant)?;
                let columns: Vec<&String> = set.keys().collect();
                for column in &columns {
                    validate_identifier(column)?;
                }
                let assignments = columns
                    .iter()
                    .map(|c| format!("{} = ?", c))
                    .collect::<Vec<_>>()
                    .join(", ");
                let (where_sql, filter_params) = scoped_predicate(Some(filter), tenant.as_deref());
                let sql = format!(
                    "UPDATE {} SET {}, updated_at = datetime('now'){}",
                    table, assignments, where_sql
                );
                let mut params: Vec<Value> = set.values().cloned().collect();
                params.extend(filter_params);
                execute(db, &sql, &params)
            })
            .await
    }

    /// Delete rows matching `filter` under the same AND-ing discipline as
    /// update. Returns the affected row count.
    pub async fn delete(&self, table: &str, filter: Filter) -> Result<usize, CoreError> {
        validate_identifier(table)?;
        let table = table.to_string();
        let tenant = scope::current_tenant_id().ok();
        self.db
            .call(move |db| {
                let tenant = required_scope(db, &table, tenant)?;
                let (where_sql, params) = scoped_predicate(Some(filter), tenant.as_deref());
                let sql = format!("DELETE FROM {}{}", table, where_sql);
                execute(db, &sql, &params)
            })
            .await
    }

    // ── Repositories ──────────────────────────────────────────────────

    pub async fn add_repository(&self, new: NewRepository) -> Result<Repository, CoreError> {
        let mut row = Row::new();
        row.insert("id".into(), Value::String(uuid::Uuid::new_v4().to_string()));
        row.insert("github_repo_id".into(), Value::from(new.github_repo_id));
        row.insert("owner".into(), Value::String(new.owner));
        row.insert("name".into(), Value::String(new.name));
        row.insert("full_name".into(), Value::String(new.full_name));
        row.insert("enabled".into(), Value::Bool(new.enabled));
        row.insert("policy_overrides".into(), new.policy_overrides);
        let persisted = self.insert("repositories", row).await?;
        repository_from_row(&persisted)
    }

    pub async fn list_repositories(&self) -> Result<Vec<Repository>, CoreError> {
        let rows = self.select("repositories", None).await?;
        rows.iter().map(repository_from_row).collect()
    }

    pub async fn get_repository(&self, id: &str) -> Result<Option<Repository>, CoreError> {
        let rows = self.select("repositories", Some(Filter::by_id(id))).await?;
        rows.first().map(repository_from_row).transpose()
    }

    pub async fn set_repository_enabled(
        &self,
        id: &str,
        enabled: bool,
    ) -> Result<usize, CoreError> {
        let mut set = Row::new();
        set.insert("enabled".into(), Value::Bool(enabled));
        self.update("repositories", set, Filter::by_id(id)).await
    }

    pub async fn remove_repository(&self, id: &str) -> Result<usize, CoreError> {
        self.delete("repositories", Filter::by_id(id)).await
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    pub async fn insert_job(
        &self,
        id: &str,
        repository_id: &str,
        metadata: Value,
    ) -> Result<Job, CoreError> {
        let mut row = Row::new();
        row.insert("id".into(), Value::String(id.to_string()));
        row.insert(
            "repository_id".into(),
            Value::String(repository_id.to_string()),
        );
        row.insert(
            "status".into(),
            Value::String(JobStatus::Queued.as_str().to_string()),
        );
        row.insert("metadata".into(), metadata);
        let persisted = self.insert("jobs", row).await?;
        job_from_row(&persisted)
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>, CoreError> {
        let rows = self.select("jobs", Some(Filter::by_id(id))).await?;
        rows.first().map(job_from_row).transpose()
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>, CoreError> {
        let rows = self.select("jobs", None).await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Merge one stage's result into the job's metadata under `key`.
    pub async fn record_stage_result(
        &self,
        job_id: &str,
        key: &str,
        value: Value,
    ) -> Result<(), CoreError> {
        let tenant = scope::current_tenant_id()?;
        let job_id = job_id.to_string();
        let key = key.to_string();
        self.db
            .call(move |db| {
                let conn = db.conn();
                let tx = conn
                    .unchecked_transaction()
                    .map_err(CoreError::Database)?;
                let metadata: Option<String> = tx
                    .query_row(
                        "SELECT metadata FROM jobs WHERE id = ?1 AND tenant_id = ?2",
                        rusqlite::params![job_id, tenant],
                        |row| row.get(0),
                    )
                    .map(Some)
                    .or_else(ignore_no_rows)?;
                let Some(metadata) = metadata else {
                    return Err(CoreError::JobNotFound { id: job_id });
                };
                let mut merged: Value =
                    serde_json::from_str(&metadata).unwrap_or_else(|_| Value::Object(Map::new()));
                if !merged.is_object() {
                    merged = Value::Object(Map::new());
                }
                merged[key.as_str()] = value;
                tx.execute(
                    "UPDATE jobs SET metadata = ?1, updated_at = datetime('now')
                     WHERE id = ?2 AND tenant_id = ?3",
                    rusqlite::params![merged.to_string(), job_id, tenant],
                )?;
                tx.commit().map_err(CoreError::Database)?;
                Ok(())
            })
            .await
    }

    /// The transactional transition engine: read the current status, compute
    /// the next via the pure relation, conditionally write it, and append to
    /// the transition history — all inside one transaction, serialized per
    /// job by the conditional `WHERE status = expected` write.
    ///
    /// On failure events, `error_details` and the stage the job failed in
    /// are merged into metadata as `error_details` / `failed_at`.
    pub async fn transition_job(
        &self,
        job_id: &str,
        event: JobEvent,
        error_details: Option<String>,
    ) -> Result<JobStatus, CoreError> {
        let tenant = scope::current_tenant_id()?;
        let job_id = job_id.to_string();
        self.db
            .call(move |db| {
                let conn = db.conn();
                let tx = conn
                    .unchecked_transaction()
                    .map_err(CoreError::Database)?;

                let current: Option<(String, String)> = tx
                    .query_row(
                        "SELECT status, metadata FROM jobs WHERE id = ?1 AND tenant_id = ?2",
                        rusqlite::params![job_id, tenant],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .map(Some)
                    .or_else(ignore_no_rows)?;
                let Some((status_str, metadata_str)) = current else {
                    return Err(CoreError::JobNotFound { id: job_id });
                };

                let from = JobStatus::from_str(&status_str)
                    .map_err(|e| CoreError::Other(anyhow::anyhow!(e)))?;
                let next = match state::next_state(from, event) {
                    Some(next) if state::is_valid_transition(from, next) => next,
                    _ => return Err(CoreError::InvalidTransition { from, event }),
                };

                let mut metadata: Value = serde_json::from_str(&metadata_str)
                    .unwrap_or_else(|_| Value::Object(Map::new()));
                if !metadata.is_object() {
                    metadata = Value::Object(Map::new());
                }
                if let Some(details) = error_details {
                    metadata["error_details"] = Value::String(details);
                    metadata["failed_at"] = Value::String(from.as_str().to_string());
                }

                let affected = tx.execute(
                    "UPDATE jobs SET status = ?1, metadata = ?2, updated_at = datetime('now')
                     WHERE id = ?3 AND status = ?4 AND tenant_id = ?5",
                    rusqlite::params![
                        next.as_str(),
                        metadata.to_string(),
                        job_id,
                        from.as_str(),
                        tenant
                    ],
                )?;
                if affected == 0 {
                    // A concurrent transition won the conditional write.
                    return Err(CoreError::InvalidTransition { from, event });
                }

                tx.execute(
                    "INSERT INTO job_transitions (job_id, from_status, to_status, event)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![job_id, from.as_str(), next.as_str(), event.as_str()],
                )?;
                tx.commit().map_err(CoreError::Database)?;
                Ok(next)
            })
            .await
    }

    /// The recorded transition sequence for a job, oldest first.
    pub async fn job_history(&self, job_id: &str) -> Result<Vec<JobTransition>, CoreError> {
        let tenant = scope::current_tenant_id()?;
        let job_id = job_id.to_string();
        self.db
            .call(move |db| {
                let conn = db.conn();
                let mut stmt = conn.prepare(
                    "SELECT t.id, t.job_id, t.from_status, t.to_status, t.event, t.created_at
                     FROM job_transitions t
                     JOIN jobs j ON j.id = t.job_id
                     WHERE t.job_id = ?1 AND j.tenant_id = ?2
                     ORDER BY t.id",
                )?;
                let rows = stmt.query_map(rusqlite::params![job_id, tenant], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })?;
                let mut history = Vec::new();
                for row in rows {
                    let (id, job_id, from_status, to_status, event, created_at) = row?;
                    history.push(JobTransition {
                        id,
                        job_id,
                        from_status: JobStatus::from_str(&from_status)
                            .map_err(|e| CoreError::Other(anyhow::anyhow!(e)))?,
                        to_status: JobStatus::from_str(&to_status)
                            .map_err(|e| CoreError::Other(anyhow::anyhow!(e)))?,
                        event,
                        created_at,
                    });
                }
                Ok(history)
            })
            .await
    }

    // ── Plans (non-tenant table: transparent pass-through) ────────────

    pub async fn get_plan_by_name(&self, name: &str) -> Result<Option<Plan>, CoreError> {
        let name = name.to_string();
        self.db
            .call(move |db| db.get_plan_by_name(&name).map_err(CoreError::from))
            .await
    }
}

/// Resolve the tenant requirement for `table`: multi-tenant tables need the
/// scope captured before entering the blocking pool; pass-through tables
/// need nothing. Classification is answered from the cache warmed at open
/// time, so an unscoped caller fails here without any SQL being sent.
fn required_scope(
    db: &Db,
    table: &str,
    tenant: Option<String>,
) -> Result<Option<String>, CoreError> {
    if db.is_tenant_scoped(table)? {
        Ok(Some(tenant.ok_or(CoreError::TenantScopeMissing)?))
    } else {
        Ok(None)
    }
}

/// Build the effective WHERE clause: caller predicate AND tenant predicate,
/// either side optional. Returns the clause (with leading " WHERE " or
/// empty) and the bound parameters in order.
fn scoped_predicate(filter: Option<Filter>, tenant: Option<&str>) -> (String, Vec<Value>) {
    let mut clauses = Vec::new();
    let mut params = Vec::new();
    if let Some(filter) = filter {
        clauses.push(format!("({})", filter.sql));
        params.extend(filter.params);
    }
    if let Some(tenant) = tenant {
        clauses.push("tenant_id = ?".to_string());
        params.push(Value::String(tenant.to_string()));
    }
    if clauses.is_empty() {
        (String::new(), params)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), params)
    }
}

fn execute(db: &Db, sql: &str, params: &[Value]) -> Result<usize, CoreError> {
    let bound: Vec<SqlValue> = params.iter().map(json_to_sql).collect();
    db.conn()
        .execute(sql, rusqlite::params_from_iter(bound))
        .map_err(CoreError::Database)
}

fn query_rows(db: &Db, sql: &str, params: &[Value]) -> Result<Vec<Row>, CoreError> {
    let conn = db.conn();
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let bound: Vec<SqlValue> = params.iter().map(json_to_sql).collect();
    let mut rows = stmt.query(rusqlite::params_from_iter(bound))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut map = Row::new();
        for (idx, column) in columns.iter().enumerate() {
            map.insert(column.clone(), sql_to_json(row.get_ref(idx)?));
        }
        out.push(map);
    }
    Ok(out)
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        // JSON columns: arrays and objects are stored serialized.
        other => SqlValue::Text(other.to_string()),
    }
}

fn sql_to_json(value: rusqlite::types::ValueRef<'_>) -> Value {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
    }
}

/// SQL identifiers are interpolated into statements, so only plain
/// lowercase identifiers are accepted.
fn validate_identifier(name: &str) -> Result<(), CoreError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(CoreError::Other(anyhow::anyhow!(
            "invalid identifier: {}",
            name
        )))
    }
}

fn ignore_no_rows<T>(err: rusqlite::Error) -> Result<Option<T>, CoreError> {
    match err {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(CoreError::Database(other)),
    }
}

fn get_str<'a>(row: &'a Row, key: &str) -> Result<&'a str, CoreError> {
    row.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::Other(anyhow::anyhow!("missing column: {}", key)))
}

fn get_i64(row: &Row, key: &str) -> Result<i64, CoreError> {
    row.get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| CoreError::Other(anyhow::anyhow!("missing column: {}", key)))
}

fn get_json(row: &Row, key: &str) -> Value {
    row.get(key)
        .and_then(Value::as_str)
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or(Value::Null)
}

fn repository_from_row(row: &Row) -> Result<Repository, CoreError> {
    Ok(Repository {
        id: get_str(row, "id")?.to_string(),
        tenant_id: get_str(row, "tenant_id")?.to_string(),
        github_repo_id: get_i64(row, "github_repo_id")?,
        owner: get_str(row, "owner")?.to_string(),
        name: get_str(row, "name")?.to_string(),
        full_name: get_str(row, "full_name")?.to_string(),
        enabled: get_i64(row, "enabled")? != 0,
        policy_overrides: get_json(row, "policy_overrides"),
        created_at: get_str(row, "created_at")?.to_string(),
        updated_at: get_str(row, "updated_at")?.to_string(),
    })
}

fn job_from_row(row: &Row) -> Result<Job, CoreError> {
    let status = JobStatus::from_str(get_str(row, "status")?)
        .map_err(|e| CoreError::Other(anyhow::anyhow!(e)))?;
    Ok(Job {
        id: get_str(row, "id")?.to_string(),
        tenant_id: get_str(row, "tenant_id")?.to_string(),
        repository_id: get_str(row, "repository_id")?.to_string(),
        status,
        metadata: get_json(row, "metadata"),
        created_at: get_str(row, "created_at")?.to_string(),
        updated_at: get_str(row, "updated_at")?.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::models::NewTenant;
    use crate::scope::TenantScope;

    async fn test_store() -> (TenantDb, String, String) {
        let db = Db::open_in_memory().unwrap();
        let plan = db.create_plan("test-plan", "Test Plan").unwrap();
        let tenant_a = db
            .create_tenant(&NewTenant {
                github_installation_id: 12345,
                github_account_login: "tenant-a".into(),
                github_account_type: "Organization".into(),
                plan_id: plan.id,
                settings: serde_json::json!({}),
            })
            .unwrap();
        let tenant_b = db
            .create_tenant(&NewTenant {
                github_installation_id: 67890,
                github_account_login: "tenant-b".into(),
                github_account_type: "Organization".into(),
                plan_id: plan.id,
                settings: serde_json::json!({}),
            })
            .unwrap();
        (TenantDb::new(DbHandle::new(db)), tenant_a.id, tenant_b.id)
    }

    fn repo(github_repo_id: i64, name: &str) -> NewRepository {
        NewRepository {
            github_repo_id,
            owner: "acme".into(),
            name: name.into(),
            full_name: format!("acme/{}", name),
            enabled: true,
            policy_overrides: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_reads_are_isolated_per_tenant() {
        let (store, tenant_a, tenant_b) = test_store().await;

        scope::run_with(TenantScope::new(&tenant_a), async {
            store.add_repository(repo(1001, "one")).await.unwrap();
            store.add_repository(repo(1002, "two")).await.unwrap();
            store.add_repository(repo(1003, "three")).await.unwrap();
        })
        .await;
        scope::run_with(TenantScope::new(&tenant_b), async {
            store.add_repository(repo(2001, "other")).await.unwrap();
        })
        .await;

        let seen_by_a = scope::run_with(TenantScope::new(&tenant_a), async {
            store.list_repositories().await.unwrap()
        })
        .await;
        assert_eq!(seen_by_a.len(), 3);
        assert!(seen_by_a.iter().all(|r| r.tenant_id == tenant_a));

        let seen_by_b = scope::run_with(TenantScope::new(&tenant_b), async {
            store.list_repositories().await.unwrap()
        })
        .await;
        assert_eq!(seen_by_b.len(), 1);
        assert_eq!(seen_by_b[0].tenant_id, tenant_b);
        assert_eq!(seen_by_b[0].github_repo_id, 2001);
    }

    #[tokio::test]
    async fn test_insert_overrides_caller_supplied_tenant_id() {
        let (store, tenant_a, tenant_b) = test_store().await;

        let persisted = scope::run_with(TenantScope::new(&tenant_a), async {
            let mut row = Row::new();
            row.insert("id".into(), Value::String("r-spoof".into()));
            // Attempt to write into tenant B's partition.
            row.insert("tenant_id".into(), Value::String(tenant_b.clone()));
            row.insert("github_repo_id".into(), Value::from(3001));
            row.insert("owner".into(), Value::String("acme".into()));
            row.insert("name".into(), Value::String("spoof".into()));
            row.insert("full_name".into(), Value::String("acme/spoof".into()));
            store.insert("repositories", row).await.unwrap()
        })
        .await;

        assert_eq!(persisted["tenant_id"], Value::String(tenant_a));
    }

    #[tokio::test]
    async fn test_cross_tenant_update_affects_zero_rows() {
        let (store, tenant_a, tenant_b) = test_store().await;

        let repo_b = scope::run_with(TenantScope::new(&tenant_b), async {
            store.add_repository(repo(2001, "other")).await.unwrap()
        })
        .await;

        let affected = scope::run_with(TenantScope::new(&tenant_a), async {
            store
                .set_repository_enabled(&repo_b.id, false)
                .await
                .unwrap()
        })
        .await;
        assert_eq!(affected, 0);

        // Raw-client check: tenant B's row is untouched.
        let enabled: i64 = store
            .raw()
            .call({
                let id = repo_b.id.clone();
                move |db| {
                    db.conn()
                        .query_row(
                            "SELECT enabled FROM repositories WHERE id = ?1",
                            rusqlite::params![id],
                            |r| r.get(0),
                        )
                        .map_err(CoreError::Database)
                }
            })
            .await
            .unwrap();
        assert_eq!(enabled, 1);
    }

    #[tokio::test]
    async fn test_cross_tenant_delete_affects_zero_rows() {
        let (store, tenant_a, tenant_b) = test_store().await;

        let repo_b = scope::run_with(TenantScope::new(&tenant_b), async {
            store.add_repository(repo(2001, "other")).await.unwrap()
        })
        .await;

        let affected = scope::run_with(TenantScope::new(&tenant_a), async {
            store.remove_repository(&repo_b.id).await.unwrap()
        })
        .await;
        assert_eq!(affected, 0);

        let still_there = scope::run_with(TenantScope::new(&tenant_b), async {
            store.get_repository(&repo_b.id).await.unwrap()
        })
        .await;
        assert!(still_there.is_some());
    }

    #[tokio::test]
    async fn test_unscoped_access_fails_before_any_sql() {
        let (store, _, _) = test_store().await;

        let err = store.list_repositories().await.unwrap_err();
        assert!(matches!(err, CoreError::TenantScopeMissing));

        let err = store.add_repository(repo(1001, "one")).await.unwrap_err();
        assert!(matches!(err, CoreError::TenantScopeMissing));

        let mut set = Row::new();
        set.insert("enabled".into(), Value::Bool(false));
        let err = store
            .update("repositories", set, Filter::by_id("r1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::TenantScopeMissing));

        let err = store
            .delete("repositories", Filter::by_id("r1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::TenantScopeMissing));

        // Nothing reached the table.
        let count: i64 = store
            .raw()
            .call(|db| {
                db.conn()
                    .query_row("SELECT COUNT(*) FROM repositories", [], |r| r.get(0))
                    .map_err(CoreError::Database)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_plans_pass_through_without_scope() {
        let (store, _, _) = test_store().await;
        let plan = store.get_plan_by_name("test-plan").await.unwrap();
        assert!(plan.is_some());

        let rows = store.select("plans", None).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_insert_then_select_roundtrip() {
        let (store, tenant_a, _) = test_store().await;
        scope::run_with(TenantScope::new(&tenant_a), async {
            let inserted = store
                .add_repository(NewRepository {
                    github_repo_id: 1001,
                    owner: "acme".into(),
                    name: "widgets".into(),
                    full_name: "acme/widgets".into(),
                    enabled: false,
                    policy_overrides: serde_json::json!({"max_files": 10}),
                })
                .await
                .unwrap();
            let fetched = store.get_repository(&inserted.id).await.unwrap().unwrap();
            assert_eq!(fetched.github_repo_id, 1001);
            assert_eq!(fetched.full_name, "acme/widgets");
            assert!(!fetched.enabled);
            assert_eq!(fetched.policy_overrides["max_files"], 10);
        })
        .await;
    }

    #[tokio::test]
    async fn test_verify_ownership() {
        let (store, tenant_a, tenant_b) = test_store().await;
        scope::run_with(TenantScope::new(&tenant_a), async {
            assert!(store.verify_ownership(&tenant_a, "repository").is_ok());
            let err = store.verify_ownership(&tenant_b, "repository").unwrap_err();
            assert!(matches!(err, CoreError::TenantAccessDenied { .. }));
        })
        .await;
        assert!(matches!(
            store.verify_ownership(&tenant_a, "repository"),
            Err(CoreError::TenantScopeMissing)
        ));
    }

    #[tokio::test]
    async fn test_transition_engine_happy_and_invalid() {
        let (store, tenant_a, _) = test_store().await;
        scope::run_with(TenantScope::new(&tenant_a), async {
            let job = store
                .insert_job("job-1", "repo-1", serde_json::json!({}))
                .await
                .unwrap();
            assert_eq!(job.status, JobStatus::Queued);

            let next = store
                .transition_job("job-1", JobEvent::StartPlanning, None)
                .await
                .unwrap();
            assert_eq!(next, JobStatus::Planning);

            // Same event again: no longer applicable.
            let err = store
                .transition_job("job-1", JobEvent::StartPlanning, None)
                .await
                .unwrap_err();
            assert!(matches!(err, CoreError::InvalidTransition { .. }));

            let history = store.job_history("job-1").await.unwrap();
            assert_eq!(history.len(), 1);
            assert_eq!(history[0].from_status, JobStatus::Queued);
            assert_eq!(history[0].to_status, JobStatus::Planning);
        })
        .await;
    }

    #[tokio::test]
    async fn test_transition_failure_merges_error_metadata() {
        let (store, tenant_a, _) = test_store().await;
        scope::run_with(TenantScope::new(&tenant_a), async {
            store
                .insert_job("job-1", "repo-1", serde_json::json!({}))
                .await
                .unwrap();
            store
                .transition_job("job-1", JobEvent::StartPlanning, None)
                .await
                .unwrap();
            store
                .transition_job(
                    "job-1",
                    JobEvent::PlanFailed,
                    Some("model blew up".into()),
                )
                .await
                .unwrap();

            let job = store.get_job("job-1").await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Failed);
            assert_eq!(job.metadata["error_details"], "model blew up");
            assert_eq!(job.metadata["failed_at"], "planning");
        })
        .await;
    }

    #[tokio::test]
    async fn test_transition_unknown_job() {
        let (store, tenant_a, _) = test_store().await;
        scope::run_with(TenantScope::new(&tenant_a), async {
            let err = store
                .transition_job("nope", JobEvent::Cancel, None)
                .await
                .unwrap_err();
            assert!(matches!(err, CoreError::JobNotFound { .. }));
        })
        .await;
    }

    #[tokio::test]
    async fn test_jobs_are_tenant_isolated() {
        let (store, tenant_a, tenant_b) = test_store().await;
        scope::run_with(TenantScope::new(&tenant_a), async {
            store
                .insert_job("job-a", "repo-1", serde_json::json!({}))
                .await
                .unwrap();
        })
        .await;

        scope::run_with(TenantScope::new(&tenant_b), async {
            assert!(store.get_job("job-a").await.unwrap().is_none());
            let err = store
                .transition_job("job-a", JobEvent::Cancel, None)
                .await
                .unwrap_err();
            assert!(matches!(err, CoreError::JobNotFound { .. }));
        })
        .await;
    }

    #[tokio::test]
    async fn test_record_stage_result() {
        let (store, tenant_a, _) = test_store().await;
        scope::run_with(TenantScope::new(&tenant_a), async {
            store
                .insert_job("job-1", "repo-1", serde_json::json!({"issue": {"number": 5}}))
                .await
                .unwrap();
            store
                .record_stage_result("job-1", "plan", serde_json::json!({"summary": "s"}))
                .await
                .unwrap();
            let job = store.get_job("job-1").await.unwrap().unwrap();
            assert_eq!(job.metadata["plan"]["summary"], "s");
            assert_eq!(job.metadata["issue"]["number"], 5);
        })
        .await;
    }

    #[tokio::test]
    async fn test_insert_many_stamps_each_row() {
        let (store, tenant_a, tenant_b) = test_store().await;
        let rows = scope::run_with(TenantScope::new(&tenant_a), async {
            let make = |id: &str, gh: i64, spoof: &str| {
                let mut row = Row::new();
                row.insert("id".into(), Value::String(id.into()));
                row.insert("tenant_id".into(), Value::String(spoof.into()));
                row.insert("github_repo_id".into(), Value::from(gh));
                row.insert("owner".into(), Value::String("acme".into()));
                row.insert("name".into(), Value::String("r".into()));
                row.insert("full_name".into(), Value::String("acme/r".into()));
                row
            };
            store
                .insert_many(
                    "repositories",
                    vec![make("r1", 1, &tenant_b), make("r2", 2, &tenant_b)],
                )
                .await
                .unwrap()
        })
        .await;
        assert_eq!(rows.len(), 2);
        for row in rows {
            assert_eq!(row["tenant_id"], Value::String(tenant_a.clone()));
        }
    }

    #[tokio::test]
    async fn test_identifier_validation_rejects_injection() {
        let (store, tenant_a, _) = test_store().await;
        scope::run_with(TenantScope::new(&tenant_a), async {
            assert!(store.select("repositories; DROP TABLE jobs", None).await.is_err());
        })
        .await;
    }
}
