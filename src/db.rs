//! Raw SQLite access.
//!
//! `Db` is the un-scoped client with full SQL power, reserved for
//! migrations, tenant lifecycle, and tests. Everything that touches
//! multi-tenant tables in normal operation goes through the tenant-aware
//! wrapper in `store`.
//!
//! `DbHandle` wraps `Db` behind `Arc<Mutex>` and runs all access on tokio's
//! blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
//! I/O from tying up async worker threads.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use crate::error::CoreError;
use crate::models::{InstallationStatus, NewTenant, Plan, Tenant};

/// Async-safe handle to the core database.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<Db>>,
}

impl DbHandle {
    pub fn new(db: Db) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R, CoreError>
    where
        F: FnOnce(&Db) -> Result<R, CoreError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| CoreError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| CoreError::Other(anyhow::anyhow!("database task panicked: {}", e)))?
    }

    /// Acquire the database mutex synchronously. For startup initialization
    /// and tests only; must not be called from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, Db>, CoreError> {
        self.inner.lock().map_err(|_| CoreError::LockPoisoned)
    }
}

pub struct Db {
    conn: Connection,
    /// Table name -> whether the table declares a `tenant_id` column.
    tenant_scoped: RefCell<HashMap<String, bool>>,
}

impl Db {
    /// Open (or create) a database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self {
            conn,
            tenant_scoped: RefCell::new(HashMap::new()),
        };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self {
            conn,
            tenant_scoped: RefCell::new(HashMap::new()),
        };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        self.warm_table_classification()
            .context("Failed to classify tables")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS plans (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    display_name TEXT NOT NULL,
                    price_usd REAL NOT NULL DEFAULT 0,
                    billing_interval TEXT NOT NULL DEFAULT 'month',
                    max_repos INTEGER NOT NULL DEFAULT 0,
                    max_prs_per_month INTEGER NOT NULL DEFAULT 0,
                    max_tokens_per_month INTEGER NOT NULL DEFAULT 0,
                    max_llm_calls_per_month INTEGER NOT NULL DEFAULT 0,
                    features TEXT NOT NULL DEFAULT '{}',
                    is_active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS tenants (
                    id TEXT PRIMARY KEY,
                    github_installation_id INTEGER NOT NULL UNIQUE,
                    github_account_login TEXT NOT NULL,
                    github_account_type TEXT NOT NULL DEFAULT 'Organization',
                    installed_at TEXT NOT NULL DEFAULT (datetime('now')),
                    uninstalled_at TEXT,
                    settings TEXT NOT NULL DEFAULT '{}',
                    installation_status TEXT NOT NULL DEFAULT 'pending',
                    plan_id INTEGER NOT NULL REFERENCES plans(id),
                    plan_changed_at TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS repositories (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                    github_repo_id INTEGER NOT NULL UNIQUE,
                    owner TEXT NOT NULL,
                    name TEXT NOT NULL,
                    full_name TEXT NOT NULL,
                    enabled INTEGER NOT NULL DEFAULT 1,
                    policy_overrides TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL REFERENCES tenants(id),
                    repository_id TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'queued',
                    metadata TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS job_transitions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id TEXT NOT NULL REFERENCES jobs(id),
                    from_status TEXT NOT NULL,
                    to_status TEXT NOT NULL,
                    event TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_tenants_status
                    ON tenants(installation_status);
                CREATE INDEX IF NOT EXISTS idx_repositories_tenant
                    ON repositories(tenant_id);
                CREATE INDEX IF NOT EXISTS idx_repositories_github
                    ON repositories(github_repo_id);
                CREATE INDEX IF NOT EXISTS idx_jobs_tenant ON jobs(tenant_id);
                CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
                CREATE INDEX IF NOT EXISTS idx_job_transitions_job
                    ON job_transitions(job_id);
                ",
            )
            .context("Failed to create tables")?;

        Ok(())
    }

    /// Direct connection access. Full SQL power: reserved for tenant
    /// lifecycle, the store's internals, and tests.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Whether `table` declares a `tenant_id` column.
    ///
    /// Classification is read from the live schema once at open time (see
    /// `warm_table_classification`) and answered from the cache here, so
    /// lookups on the query path never touch SQLite. That keeps the tenant
    /// scope check ahead of any SQL for unscoped callers.
    pub fn is_tenant_scoped(&self, table: &str) -> Result<bool, CoreError> {
        self.tenant_scoped
            .borrow()
            .get(table)
            .copied()
            .ok_or_else(|| CoreError::Other(anyhow::anyhow!("unknown table: {}", table)))
    }

    /// Classify every table in the schema by the presence of a `tenant_id`
    /// column. Runs right after migrations, while sending SQL is still
    /// fair game.
    fn warm_table_classification(&self) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            )
            .context("Failed to list tables")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to query table names")?;
        let mut cache = self.tenant_scoped.borrow_mut();
        for name in names {
            let name = name.context("Failed to read table name")?;
            let mut info = self
                .conn
                .prepare(&format!("PRAGMA table_info({})", name))
                .context("Failed to read table info")?;
            let mut has_tenant_id = false;
            let mut rows = info.query([])?;
            while let Some(row) = rows.next()? {
                let column: String = row.get(1)?;
                if column == "tenant_id" {
                    has_tenant_id = true;
                }
            }
            cache.insert(name, has_tenant_id);
        }
        Ok(())
    }

    // ── Plan lifecycle (out-of-band; used by tests and bootstrap) ─────

    pub fn create_plan(&self, name: &str, display_name: &str) -> Result<Plan> {
        self.conn
            .execute(
                "INSERT INTO plans (name, display_name) VALUES (?1, ?2)",
                params![name, display_name],
            )
            .context("Failed to insert plan")?;
        let id = self.conn.last_insert_rowid();
        self.get_plan(id)?.context("Plan not found after insert")
    }

    pub fn get_plan(&self, id: i64) -> Result<Option<Plan>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, display_name, price_usd, billing_interval, max_repos,
                        max_prs_per_month, max_tokens_per_month, max_llm_calls_per_month,
                        features, is_active, created_at, updated_at
                 FROM plans WHERE id = ?1",
            )
            .context("Failed to prepare get_plan")?;
        let mut rows = stmt
            .query_map(params![id], plan_from_row)
            .context("Failed to query plan")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read plan row")?)),
            None => Ok(None),
        }
    }

    pub fn get_plan_by_name(&self, name: &str) -> Result<Option<Plan>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, display_name, price_usd, billing_interval, max_repos,
                        max_prs_per_month, max_tokens_per_month, max_llm_calls_per_month,
                        features, is_active, created_at, updated_at
                 FROM plans WHERE name = ?1",
            )
            .context("Failed to prepare get_plan_by_name")?;
        let mut rows = stmt
            .query_map(params![name], plan_from_row)
            .context("Failed to query plan by name")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read plan row")?)),
            None => Ok(None),
        }
    }

    // ── Tenant lifecycle (install / status change / uninstall) ────────

    pub fn create_tenant(&self, new: &NewTenant) -> Result<Tenant> {
        let id = uuid::Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO tenants (id, github_installation_id, github_account_login,
                                      github_account_type, settings, plan_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    new.github_installation_id,
                    new.github_account_login,
                    new.github_account_type,
                    new.settings.to_string(),
                    new.plan_id,
                ],
            )
            .context("Failed to insert tenant")?;
        self.get_tenant(&id)?.context("Tenant not found after insert")
    }

    pub fn get_tenant(&self, id: &str) -> Result<Option<Tenant>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, github_installation_id, github_account_login, github_account_type,
                        installed_at, uninstalled_at, settings, installation_status, plan_id,
                        plan_changed_at, created_at, updated_at
                 FROM tenants WHERE id = ?1",
            )
            .context("Failed to prepare get_tenant")?;
        let mut rows = stmt
            .query_map(params![id], tenant_from_row)
            .context("Failed to query tenant")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read tenant row")?)),
            None => Ok(None),
        }
    }

    pub fn set_installation_status(
        &self,
        id: &str,
        status: InstallationStatus,
    ) -> Result<Tenant> {
        self.conn
            .execute(
                "UPDATE tenants SET installation_status = ?1, updated_at = datetime('now')
                 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update installation status")?;
        self.get_tenant(id)?
            .context("Tenant not found after status update")
    }

    /// Soft delete on platform uninstall: the row stays for audit.
    pub fn mark_uninstalled(&self, id: &str) -> Result<Tenant> {
        self.conn
            .execute(
                "UPDATE tenants
                 SET uninstalled_at = datetime('now'),
                     installation_status = 'suspended',
                     updated_at = datetime('now')
                 WHERE id = ?1",
                params![id],
            )
            .context("Failed to mark tenant uninstalled")?;
        self.get_tenant(id)?
            .context("Tenant not found after uninstall")
    }

    /// Hard delete; cascades to the tenant's repositories.
    pub fn delete_tenant(&self, id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM tenants WHERE id = ?1", params![id])
            .context("Failed to delete tenant")?;
        Ok(count > 0)
    }
}

fn plan_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Plan> {
    let features: String = row.get(9)?;
    Ok(Plan {
        id: row.get(0)?,
        name: row.get(1)?,
        display_name: row.get(2)?,
        price_usd: row.get(3)?,
        billing_interval: row.get(4)?,
        max_repos: row.get(5)?,
        max_prs_per_month: row.get(6)?,
        max_tokens_per_month: row.get(7)?,
        max_llm_calls_per_month: row.get(8)?,
        features: serde_json::from_str(&features).unwrap_or(serde_json::Value::Null),
        is_active: row.get::<_, i64>(10)? != 0,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn tenant_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tenant> {
    let settings: String = row.get(6)?;
    let status_str: String = row.get(7)?;
    let installation_status = InstallationStatus::from_str(&status_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            7,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })?;
    Ok(Tenant {
        id: row.get(0)?,
        github_installation_id: row.get(1)?,
        github_account_login: row.get(2)?,
        github_account_type: row.get(3)?,
        installed_at: row.get(4)?,
        uninstalled_at: row.get(5)?,
        settings: serde_json::from_str(&settings).unwrap_or(serde_json::Value::Null),
        installation_status,
        plan_id: row.get(8)?,
        plan_changed_at: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}
