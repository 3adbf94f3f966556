//! SurrealDB-backed implementations of the storage traits
//!
//! One `SurrealStore` implements `BuildStore`, `AdvisoryLock` and
//! `TaskLedger`. Rows carry string ids and are converted to the typed
//! records at the boundary.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{debug, info, warn};

use crate::error::{GateError, StorageError};
use crate::gate::{Arch, Gate};
use crate::lock::{AdvisoryLock, LockKey};
use crate::migrations;
use crate::schema::*;
use crate::storage_traits::*;

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde::Serialize::serialize(&SurrealDatetime::from(*date), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(DateTime::from(SurrealDatetime::deserialize(deserializer)?))
    }
}

mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde::Serialize::serialize(&date.map(SurrealDatetime::from), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<SurrealDatetime>::deserialize(deserializer)?.map(DateTime::from))
    }
}

// ---------------------------------------------------------------------------
// Connection config
// ---------------------------------------------------------------------------

/// Remote SurrealDB connection settings.
#[derive(Debug, Clone)]
pub struct SurrealConfig {
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub namespace: String,
    pub database: String,
    /// Root user (true) or database user (false)
    pub is_root: bool,
}

impl SurrealConfig {
    /// Create from environment variables
    ///
    /// Reads:
    /// - SURREALDB_ENDPOINT (required)
    /// - SURREALDB_USERNAME (required)
    /// - SURREALDB_PASSWORD (required)
    /// - SURREALDB_NAMESPACE (optional, default: "library")
    /// - SURREALDB_DATABASE (optional, default: "main")
    /// - SURREALDB_ROOT (optional, default: "false")
    pub fn from_env() -> Result<Self, String> {
        let endpoint =
            std::env::var("SURREALDB_ENDPOINT").map_err(|_| "SURREALDB_ENDPOINT not set")?;
        let username =
            std::env::var("SURREALDB_USERNAME").map_err(|_| "SURREALDB_USERNAME not set")?;
        let password =
            std::env::var("SURREALDB_PASSWORD").map_err(|_| "SURREALDB_PASSWORD not set")?;
        let namespace =
            std::env::var("SURREALDB_NAMESPACE").unwrap_or_else(|_| "library".to_string());
        let database = std::env::var("SURREALDB_DATABASE").unwrap_or_else(|_| "main".to_string());
        let is_root = std::env::var("SURREALDB_ROOT")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);

        Ok(Self {
            endpoint,
            username,
            password,
            namespace,
            database,
            is_root,
        })
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

fn parse_id(raw: &str) -> StorageResult<RecordId> {
    raw.parse()
        .map_err(|e: uuid::Error| StorageError::Serialization(format!("record id {raw}: {e}")))
}

fn parse_ids(raw: &[String]) -> StorageResult<BTreeSet<RecordId>> {
    raw.iter().map(|s| parse_id(s)).collect()
}

fn id_strings(ids: &BTreeSet<RecordId>) -> Vec<String> {
    ids.iter().map(RecordId::to_string).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PackageRow {
    record_id: String,
    name: String,
    token: String,
    repository: String,
}

impl From<&PackageRecord> for PackageRow {
    fn from(p: &PackageRecord) -> Self {
        Self {
            record_id: p.id.to_string(),
            name: p.name.clone(),
            token: p.token.clone(),
            repository: p.repository.clone(),
        }
    }
}

impl TryFrom<PackageRow> for PackageRecord {
    type Error = StorageError;

    fn try_from(row: PackageRow) -> StorageResult<Self> {
        Ok(Self {
            id: parse_id(&row.record_id)?,
            name: row.name,
            token: row.token,
            repository: row.repository,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EpochRow {
    record_id: String,
    name: String,
    is_dev: bool,
    include_in_ci: bool,
}

impl From<&EpochRecord> for EpochRow {
    fn from(e: &EpochRecord) -> Self {
        Self {
            record_id: e.id.to_string(),
            name: e.name.clone(),
            is_dev: e.is_dev,
            include_in_ci: e.include_in_ci,
        }
    }
}

impl TryFrom<EpochRow> for EpochRecord {
    type Error = StorageError;

    fn try_from(row: EpochRow) -> StorageResult<Self> {
        Ok(Self {
            id: parse_id(&row.record_id)?,
            name: row.name,
            is_dev: row.is_dev,
            include_in_ci: row.include_in_ci,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DistroRow {
    record_id: String,
    name: String,
    package_ids: Vec<String>,
    epoch_ids: Vec<String>,
}

impl From<&DistroRecord> for DistroRow {
    fn from(d: &DistroRecord) -> Self {
        Self {
            record_id: d.id.to_string(),
            name: d.name.clone(),
            package_ids: id_strings(&d.package_ids),
            epoch_ids: id_strings(&d.epoch_ids),
        }
    }
}

impl TryFrom<DistroRow> for DistroRecord {
    type Error = StorageError;

    fn try_from(row: DistroRow) -> StorageResult<Self> {
        Ok(Self {
            id: parse_id(&row.record_id)?,
            name: row.name,
            package_ids: parse_ids(&row.package_ids)?,
            epoch_ids: parse_ids(&row.epoch_ids)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PackageBuildRow {
    record_id: String,
    package_id: String,
    epoch_id: String,
    run_id: String,
    version: String,
    build_target: BuildTarget,
    linux_64: bool,
    osx_64: bool,
    #[serde(with = "surreal_datetime")]
    created_at: DateTime<Utc>,
}

impl From<&PackageBuildRecord> for PackageBuildRow {
    fn from(b: &PackageBuildRecord) -> Self {
        Self {
            record_id: b.id.to_string(),
            package_id: b.package_id.to_string(),
            epoch_id: b.epoch_id.to_string(),
            run_id: b.run_id.clone(),
            version: b.version.clone(),
            build_target: b.build_target,
            linux_64: b.linux_64,
            osx_64: b.osx_64,
            created_at: b.created_at,
        }
    }
}

impl TryFrom<PackageBuildRow> for PackageBuildRecord {
    type Error = StorageError;

    fn try_from(row: PackageBuildRow) -> StorageResult<Self> {
        Ok(Self {
            id: parse_id(&row.record_id)?,
            package_id: parse_id(&row.package_id)?,
            epoch_id: parse_id(&row.epoch_id)?,
            run_id: row.run_id,
            version: row.version,
            build_target: row.build_target,
            linux_64: row.linux_64,
            osx_64: row.osx_64,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DistroBuildRow {
    record_id: String,
    distro_id: String,
    distro_name: String,
    epoch_id: String,
    version: String,
    staged_run_id: String,
    staged_linux_64: bool,
    staged_osx_64: bool,
    passed_run_id: String,
    passed_linux_64: bool,
    passed_osx_64: bool,
    pr_url: String,
    package_build_ids: Vec<String>,
    #[serde(with = "surreal_datetime")]
    created_at: DateTime<Utc>,
}

impl From<&DistroBuildRecord> for DistroBuildRow {
    fn from(b: &DistroBuildRecord) -> Self {
        Self {
            record_id: b.id.to_string(),
            distro_id: b.distro_id.to_string(),
            distro_name: b.distro_name.clone(),
            epoch_id: b.epoch_id.to_string(),
            version: b.version.clone(),
            staged_run_id: b.staged_run_id.clone(),
            staged_linux_64: b.staged_linux_64,
            staged_osx_64: b.staged_osx_64,
            passed_run_id: b.passed_run_id.clone(),
            passed_linux_64: b.passed_linux_64,
            passed_osx_64: b.passed_osx_64,
            pr_url: b.pr_url.clone(),
            package_build_ids: id_strings(&b.package_build_ids),
            created_at: b.created_at,
        }
    }
}

impl TryFrom<DistroBuildRow> for DistroBuildRecord {
    type Error = StorageError;

    fn try_from(row: DistroBuildRow) -> StorageResult<Self> {
        Ok(Self {
            id: parse_id(&row.record_id)?,
            distro_id: parse_id(&row.distro_id)?,
            distro_name: row.distro_name,
            epoch_id: parse_id(&row.epoch_id)?,
            version: row.version,
            staged_run_id: row.staged_run_id,
            staged_linux_64: row.staged_linux_64,
            staged_osx_64: row.staged_osx_64,
            passed_run_id: row.passed_run_id,
            passed_linux_64: row.passed_linux_64,
            passed_osx_64: row.passed_osx_64,
            pr_url: row.pr_url,
            package_build_ids: parse_ids(&row.package_build_ids)?,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskRunRow {
    run_id: String,
    chain: String,
    subject: String,
    status: TaskStatus,
    error: Option<String>,
    #[serde(with = "surreal_datetime")]
    created_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    completed_at: Option<DateTime<Utc>>,
}

impl From<TaskRunRow> for TaskRun {
    fn from(row: TaskRunRow) -> Self {
        Self {
            run_id: TaskRunId(row.run_id),
            chain: row.chain,
            subject: row.subject,
            status: row.status,
            error: row.error,
            created_at: row.created_at,
            completed_at: row.completed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskStepRow {
    run_id: String,
    seq: u64,
    step: String,
    outcome: StepOutcome,
    attempts: u32,
    payload: serde_json::Value,
    #[serde(with = "surreal_datetime")]
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
struct LockRow {
    #[serde(default)]
    holder: String,
}

// ---------------------------------------------------------------------------
// SurrealStore
// ---------------------------------------------------------------------------

/// How long a lock row protects its holder. Matches the longest git retry
/// window, so a holder that died mid-write frees the lock after one window.
pub const DEFAULT_LOCK_LEASE: Duration = Duration::from_secs(2 * 60 * 60);

/// SurrealDB-backed implementation of every storage trait.
#[derive(Clone)]
pub struct SurrealStore {
    db: Surreal<Any>,
    /// Written on every lock row this store takes.
    holder: String,
    lock_lease: Duration,
}

impl SurrealStore {
    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> StorageResult<Self> {
        let store = Self::connect_url("mem://", "library", "main").await?;
        info!("SurrealStore connected (in-memory)");
        Ok(store)
    }

    /// Create from environment variables.
    ///
    /// Tries `SurrealConfig::from_env`, then `SURREALDB_URL`, then local
    /// persistence under `.library/db`.
    pub async fn from_env() -> StorageResult<Self> {
        if let Ok(config) = SurrealConfig::from_env() {
            return Self::connect_remote(&config).await;
        }

        if let Ok(url) = std::env::var("SURREALDB_URL") {
            let store = Self::connect_url(&url, "library", "main").await?;
            info!("SurrealStore connected ({})", url);
            return Ok(store);
        }

        let path = ".library/db";
        std::fs::create_dir_all(path).map_err(|e| {
            StorageError::Backend(format!("failed to create database directory {path}: {e}"))
        })?;
        let url = format!("surrealkv://{path}");
        info!("No SurrealDB config found, using local persistence: {}", url);
        Self::connect_url(&url, "library", "main").await
    }

    /// Connect with credentials.
    pub async fn connect_remote(config: &SurrealConfig) -> StorageResult<Self> {
        let db = surrealdb::engine::any::connect(&config.endpoint).await?;

        if config.is_root {
            db.signin(Root {
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| StorageError::Backend(format!("root auth failed: {e}")))?;
        } else {
            db.signin(Database {
                namespace: &config.namespace,
                database: &config.database,
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| StorageError::Backend(format!("database auth failed: {e}")))?;
        }

        db.use_ns(&config.namespace).use_db(&config.database).await?;
        migrations::init_schema(&db).await?;
        info!(endpoint = %config.endpoint, "SurrealStore connected (remote)");
        Ok(Self::with_db(db))
    }

    async fn connect_url(url: &str, ns: &str, database: &str) -> StorageResult<Self> {
        let db = surrealdb::engine::any::connect(url).await?;
        db.use_ns(ns).use_db(database).await?;
        migrations::init_schema(&db).await?;
        Ok(Self::with_db(db))
    }

    fn with_db(db: Surreal<Any>) -> Self {
        Self {
            db,
            holder: uuid::Uuid::new_v4().to_string(),
            lock_lease: DEFAULT_LOCK_LEASE,
        }
    }

    /// Treat lock rows older than `lease` as abandoned.
    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }

    // -- seeding (packages, epochs and distros are created out-of-band) -------

    pub async fn insert_package(&self, package: &PackageRecord) -> StorageResult<()> {
        self.create_row("packages", PackageRow::from(package)).await
    }

    pub async fn insert_epoch(&self, epoch: &EpochRecord) -> StorageResult<()> {
        self.create_row("epochs", EpochRow::from(epoch)).await
    }

    pub async fn insert_distro(&self, distro: &DistroRecord) -> StorageResult<()> {
        self.create_row("distros", DistroRow::from(distro)).await
    }

    // -- private helpers -----------------------------------------------------

    async fn create_row<R>(&self, table: &'static str, row: R) -> StorageResult<()>
    where
        R: Serialize + Send + 'static,
    {
        self.db
            .query("CREATE type::table($tb) CONTENT $row")
            .bind(("tb", table))
            .bind(("row", row))
            .await?
            .check()?;
        Ok(())
    }

    async fn replace_row<R>(&self, table: &'static str, record_id: String, row: R) -> StorageResult<()>
    where
        R: Serialize + Send + 'static,
    {
        self.db
            .query("UPDATE type::table($tb) CONTENT $row WHERE record_id = $rid")
            .bind(("tb", table))
            .bind(("row", row))
            .bind(("rid", record_id))
            .await?
            .check()?;
        Ok(())
    }

    async fn select_where<R>(
        &self,
        sql: &'static str,
        name: &'static str,
        value: String,
    ) -> StorageResult<Vec<R>>
    where
        R: serde::de::DeserializeOwned,
    {
        let mut res = self.db.query(sql).bind((name, value)).await?;
        Ok(res.take(0)?)
    }

    /// Run a field-level `UPDATE ... RETURN AFTER` and collect the rows it touched.
    async fn update_where<R>(
        &self,
        sql: &'static str,
        binds: Vec<(&'static str, serde_json::Value)>,
    ) -> StorageResult<Vec<R>>
    where
        R: serde::de::DeserializeOwned,
    {
        let mut query = self.db.query(sql);
        for bind in binds {
            query = query.bind(bind);
        }
        let mut res = query.await?;
        Ok(res.take(0)?)
    }

    async fn update_distro_build(
        &self,
        id: &RecordId,
        sql: &'static str,
        mut binds: Vec<(&'static str, serde_json::Value)>,
    ) -> StorageResult<DistroBuildRecord> {
        binds.push(("rid", serde_json::Value::String(id.to_string())));
        let rows: Vec<DistroBuildRow> = self.update_where(sql, binds).await?;
        first(rows, "distro build", id)
    }

    async fn fetch_package_build_row(&self, key: &PackageBuildKey) -> StorageResult<Option<PackageBuildRow>> {
        let mut res = self
            .db
            .query(
                "SELECT * FROM package_builds WHERE package_id = $pid AND epoch_id = $eid \
                 AND run_id = $run AND version = $ver AND build_target = $target",
            )
            .bind(("pid", key.package_id.to_string()))
            .bind(("eid", key.epoch_id.to_string()))
            .bind(("run", key.run_id.clone()))
            .bind(("ver", key.version.clone()))
            .bind(("target", key.build_target.as_str()))
            .await?;
        let rows: Vec<PackageBuildRow> = res.take(0)?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_distro_build_row(&self, key: &DistroBuildKey) -> StorageResult<Option<DistroBuildRow>> {
        let mut res = self
            .db
            .query(
                "SELECT * FROM distro_builds WHERE distro_id = $did AND epoch_id = $eid \
                 AND version = $ver",
            )
            .bind(("did", key.distro_id.to_string()))
            .bind(("eid", key.epoch_id.to_string()))
            .bind(("ver", key.version.clone()))
            .await?;
        let rows: Vec<DistroBuildRow> = res.take(0)?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_run(&self, run_id: &TaskRunId) -> StorageResult<TaskRunRow> {
        let rows: Vec<TaskRunRow> = self
            .select_where("SELECT * FROM task_runs WHERE run_id = $rid", "rid", run_id.0.clone())
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })
    }

    async fn fetch_running(&self, run_id: &TaskRunId) -> StorageResult<TaskRunRow> {
        let row = self.fetch_run(run_id).await?;
        if row.status != TaskStatus::Running {
            return Err(StorageError::InvalidRunState {
                run_id: run_id.0.clone(),
                status: row.status.to_string(),
                expected: TaskStatus::Running.to_string(),
            });
        }
        Ok(row)
    }

    async fn finish_run(
        &self,
        run_id: &TaskRunId,
        status: TaskStatus,
        error: Option<String>,
    ) -> StorageResult<()> {
        let mut row = self.fetch_running(run_id).await?;
        row.status = status;
        row.error = error;
        row.completed_at = Some(Utc::now());
        self.db
            .query("UPDATE task_runs CONTENT $row WHERE run_id = $rid")
            .bind(("row", row))
            .bind(("rid", run_id.0.clone()))
            .await?
            .check()?;
        Ok(())
    }

    async fn lock_row_exists(&self, key: LockKey) -> StorageResult<bool> {
        let mut res = self
            .db
            .query("SELECT VALUE lock_id FROM advisory_locks WHERE lock_id = $id")
            .bind(("id", key.0))
            .await?;
        let held: Vec<i64> = res.take(0)?;
        Ok(!held.is_empty())
    }
}

fn collect<R, T>(rows: Vec<R>) -> StorageResult<Vec<T>>
where
    T: TryFrom<R, Error = StorageError>,
{
    rows.into_iter().map(T::try_from).collect()
}

fn first<R, T>(rows: Vec<R>, kind: &'static str, key: impl std::fmt::Display) -> StorageResult<T>
where
    T: TryFrom<R, Error = StorageError>,
{
    rows.into_iter()
        .next()
        .ok_or_else(|| StorageError::not_found(kind, key))
        .and_then(T::try_from)
}

#[async_trait]
impl BuildStore for SurrealStore {
    async fn package_by_token(&self, token: &str) -> StorageResult<PackageRecord> {
        let rows: Vec<PackageRow> = self
            .select_where("SELECT * FROM packages WHERE token = $token", "token", token.to_string())
            .await?;
        rows.into_iter()
            .next()
            .ok_or(StorageError::UnknownPackageToken)
            .and_then(PackageRecord::try_from)
    }

    async fn sync_package(
        &self,
        id: &RecordId,
        name: &str,
        repository: &str,
    ) -> StorageResult<PackageRecord> {
        let rows: Vec<PackageRow> = self
            .select_where("SELECT * FROM packages WHERE record_id = $rid", "rid", id.to_string())
            .await?;
        let mut package: PackageRecord = first(rows, "package", id)?;
        package.name = name.to_string();
        package.repository = repository.to_string();
        self.replace_row("packages", id.to_string(), PackageRow::from(&package))
            .await?;
        Ok(package)
    }

    async fn epoch_by_name(&self, name: &str) -> StorageResult<EpochRecord> {
        let rows: Vec<EpochRow> = self
            .select_where("SELECT * FROM epochs WHERE name = $name", "name", name.to_string())
            .await?;
        first(rows, "epoch", name)
    }

    async fn epochs_by_build_target(&self, target: BuildTarget) -> StorageResult<Vec<EpochRecord>> {
        let mut res = self
            .db
            .query(
                "SELECT * FROM epochs WHERE include_in_ci = true AND is_dev = $is_dev \
                 ORDER BY name ASC",
            )
            .bind(("is_dev", target == BuildTarget::Dev))
            .await?;
        let rows: Vec<EpochRow> = res.take(0)?;
        collect(rows)
    }

    async fn distro_by_name(&self, name: &str) -> StorageResult<DistroRecord> {
        let rows: Vec<DistroRow> = self
            .select_where("SELECT * FROM distros WHERE name = $name", "name", name.to_string())
            .await?;
        first(rows, "distro", name)
    }

    async fn list_distros(&self) -> StorageResult<Vec<DistroRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM distros ORDER BY name ASC")
            .await?;
        let rows: Vec<DistroRow> = res.take(0)?;
        collect(rows)
    }

    async fn distros_in_epoch(&self, epoch_id: &RecordId) -> StorageResult<Vec<DistroRecord>> {
        let rows: Vec<DistroRow> = self
            .select_where(
                "SELECT * FROM distros WHERE epoch_ids CONTAINS $eid ORDER BY name ASC",
                "eid",
                epoch_id.to_string(),
            )
            .await?;
        collect(rows)
    }

    async fn get_or_create_package_build(
        &self,
        key: PackageBuildKey,
    ) -> StorageResult<PackageBuildRecord> {
        if let Some(row) = self.fetch_package_build_row(&key).await? {
            return row.try_into();
        }
        let record = PackageBuildRecord::from_key(key.clone());
        debug!(record_id = %record.id, "creating package build");
        if let Err(e) = self
            .create_row("package_builds", PackageBuildRow::from(&record))
            .await
        {
            // Another chain created the same key between our select and create.
            return match self.fetch_package_build_row(&key).await? {
                Some(row) => {
                    debug!(error = %e, "package build created concurrently, using it");
                    row.try_into()
                }
                None => Err(e),
            };
        }
        Ok(record)
    }

    async fn get_package_build(&self, id: &RecordId) -> StorageResult<PackageBuildRecord> {
        let rows: Vec<PackageBuildRow> = self
            .select_where(
                "SELECT * FROM package_builds WHERE record_id = $rid",
                "rid",
                id.to_string(),
            )
            .await?;
        first(rows, "package build", id)
    }

    async fn save_package_build(&self, record: &PackageBuildRecord) -> StorageResult<()> {
        self.get_package_build(&record.id).await?;
        self.replace_row(
            "package_builds",
            record.id.to_string(),
            PackageBuildRow::from(record),
        )
        .await
    }

    async fn mark_package_architecture(
        &self,
        id: &RecordId,
        arch: Arch,
    ) -> StorageResult<PackageBuildRecord> {
        let sql = match arch {
            Arch::Linux64 => {
                "UPDATE package_builds SET linux_64 = true WHERE record_id = $rid RETURN AFTER"
            }
            Arch::Osx64 => {
                "UPDATE package_builds SET osx_64 = true WHERE record_id = $rid RETURN AFTER"
            }
        };
        let rows: Vec<PackageBuildRow> = self
            .update_where(sql, vec![("rid", serde_json::Value::String(id.to_string()))])
            .await?;
        first(rows, "package build", id)
    }

    async fn ready_for_integration(
        &self,
        epoch_name: &str,
        distro: &DistroRecord,
    ) -> StorageResult<Vec<PackageBuildSummary>> {
        let epoch = self.epoch_by_name(epoch_name).await?;
        let member_ids = id_strings(&distro.package_ids);

        let mut res = self
            .db
            .query(
                "SELECT * FROM package_builds WHERE epoch_id = $eid AND linux_64 = true \
                 AND osx_64 = true AND package_id INSIDE $pids ORDER BY created_at ASC",
            )
            .bind(("eid", epoch.id.to_string()))
            .bind(("pids", member_ids.clone()))
            .await?;
        let builds: Vec<PackageBuildRow> = res.take(0)?;

        let mut res = self
            .db
            .query("SELECT VALUE package_build_ids FROM distro_builds")
            .await?;
        let attached: Vec<Vec<String>> = res.take(0)?;
        let attached: HashSet<String> = attached.into_iter().flatten().collect();

        let mut res = self
            .db
            .query("SELECT * FROM packages WHERE record_id INSIDE $pids")
            .bind(("pids", member_ids))
            .await?;
        let packages: Vec<PackageRow> = res.take(0)?;
        let names: HashMap<String, String> = packages
            .into_iter()
            .map(|p| (p.record_id, p.name))
            .collect();

        builds
            .into_iter()
            .filter(|b| !attached.contains(&b.record_id))
            .filter_map(|b| {
                names.get(&b.package_id).map(|name| {
                    Ok(PackageBuildSummary {
                        id: parse_id(&b.record_id)?,
                        package_name: name.clone(),
                        version: b.version,
                    })
                })
            })
            .collect()
    }

    async fn get_or_create_distro_build(
        &self,
        key: DistroBuildKey,
    ) -> StorageResult<DistroBuildRecord> {
        if let Some(row) = self.fetch_distro_build_row(&key).await? {
            return row.try_into();
        }
        let rows: Vec<DistroRow> = self
            .select_where(
                "SELECT * FROM distros WHERE record_id = $rid",
                "rid",
                key.distro_id.to_string(),
            )
            .await?;
        let distro: DistroRecord = first(rows, "distro", key.distro_id)?;
        let record = DistroBuildRecord::new(&distro, key.epoch_id, key.version.clone());
        debug!(record_id = %record.id, distro = %record.distro_name, "creating distro build");
        if let Err(e) = self
            .create_row("distro_builds", DistroBuildRow::from(&record))
            .await
        {
            return match self.fetch_distro_build_row(&key).await? {
                Some(row) => {
                    debug!(error = %e, "distro build created concurrently, using it");
                    row.try_into()
                }
                None => Err(e),
            };
        }
        Ok(record)
    }

    async fn get_distro_build(&self, id: &RecordId) -> StorageResult<DistroBuildRecord> {
        let rows: Vec<DistroBuildRow> = self
            .select_where(
                "SELECT * FROM distro_builds WHERE record_id = $rid",
                "rid",
                id.to_string(),
            )
            .await?;
        first(rows, "distro build", id)
    }

    async fn save_distro_build(&self, record: &DistroBuildRecord) -> StorageResult<()> {
        self.get_distro_build(&record.id).await?;
        self.replace_row(
            "distro_builds",
            record.id.to_string(),
            DistroBuildRow::from(record),
        )
        .await
    }

    async fn mark_distro_architecture(
        &self,
        id: &RecordId,
        gate: Gate,
        arch: Arch,
    ) -> StorageResult<DistroBuildRecord> {
        let sql = match (gate, arch) {
            (Gate::Staged, Arch::Linux64) => {
                "UPDATE distro_builds SET staged_linux_64 = true WHERE record_id = $rid RETURN AFTER"
            }
            (Gate::Staged, Arch::Osx64) => {
                "UPDATE distro_builds SET staged_osx_64 = true WHERE record_id = $rid RETURN AFTER"
            }
            (Gate::Passed, Arch::Linux64) => {
                "UPDATE distro_builds SET passed_linux_64 = true WHERE record_id = $rid RETURN AFTER"
            }
            (Gate::Passed, Arch::Osx64) => {
                "UPDATE distro_builds SET passed_osx_64 = true WHERE record_id = $rid RETURN AFTER"
            }
            (Gate::Tested, _) => return Err(invalid_distro_gate(gate)),
        };
        self.update_distro_build(id, sql, Vec::new()).await
    }

    async fn stamp_distro_run(
        &self,
        id: &RecordId,
        gate: Gate,
        run_id: &str,
    ) -> StorageResult<DistroBuildRecord> {
        let sql = match gate {
            Gate::Staged => {
                "UPDATE distro_builds SET staged_run_id = $run WHERE record_id = $rid RETURN AFTER"
            }
            Gate::Passed => {
                "UPDATE distro_builds SET passed_run_id = $run WHERE record_id = $rid RETURN AFTER"
            }
            Gate::Tested => return Err(invalid_distro_gate(gate)),
        };
        self.update_distro_build(id, sql, vec![("run", serde_json::Value::String(run_id.to_string()))])
            .await
    }

    async fn attach_package_builds(
        &self,
        id: &RecordId,
        package_build_ids: &[RecordId],
    ) -> StorageResult<DistroBuildRecord> {
        let ids: Vec<serde_json::Value> = package_build_ids
            .iter()
            .map(|id| serde_json::Value::String(id.to_string()))
            .collect();
        self.update_distro_build(
            id,
            "UPDATE distro_builds SET package_build_ids = array::sort(array::union(package_build_ids, $ids)) \
             WHERE record_id = $rid RETURN AFTER",
            vec![("ids", serde_json::Value::Array(ids))],
        )
        .await
    }

    async fn set_distro_pr_url(
        &self,
        id: &RecordId,
        pr_url: &str,
    ) -> StorageResult<DistroBuildRecord> {
        // The empty-url condition makes the write a compare-and-set.
        let rows: Vec<DistroBuildRow> = self
            .update_where(
                "UPDATE distro_builds SET pr_url = $url WHERE record_id = $rid AND pr_url = '' \
                 RETURN AFTER",
                vec![
                    ("url", serde_json::Value::String(pr_url.to_string())),
                    ("rid", serde_json::Value::String(id.to_string())),
                ],
            )
            .await?;
        if let Some(row) = rows.into_iter().next() {
            return row.try_into();
        }
        let existing = self.get_distro_build(id).await?;
        Err(GateError::PrUrlAlreadySet {
            existing: existing.pr_url,
            requested: pr_url.to_string(),
        }
        .into())
    }
}

fn invalid_distro_gate(gate: Gate) -> StorageError {
    GateError::InvalidGate {
        gate: gate.to_string(),
        record: "distro build",
    }
    .into()
}

#[async_trait]
impl AdvisoryLock for SurrealStore {
    async fn try_acquire(&self, key: LockKey) -> StorageResult<bool> {
        // A holder that died without releasing leaves its row behind.
        let reclaimed: Vec<LockRow> = self
            .update_where(
                "DELETE advisory_locks WHERE lock_id = $id \
                 AND acquired_at < time::now() - duration::from::secs($lease) RETURN BEFORE",
                vec![
                    ("id", serde_json::Value::from(key.0)),
                    ("lease", serde_json::Value::from(self.lock_lease.as_secs())),
                ],
            )
            .await?;
        for row in reclaimed {
            warn!(lock = %key, holder = %row.holder, "reclaimed expired advisory lock");
        }

        // The unique index on lock_id rejects a second holder.
        let created = self
            .db
            .query(
                "CREATE advisory_locks SET lock_id = $id, holder = $holder, \
                 acquired_at = time::now()",
            )
            .bind(("id", key.0))
            .bind(("holder", self.holder.clone()))
            .await?
            .check();
        let err = match created {
            Ok(_) => return Ok(true),
            Err(e) => e,
        };
        if self.lock_row_exists(key).await? {
            debug!(lock = %key, error = %err, "advisory lock already held");
            return Ok(false);
        }
        Err(err.into())
    }

    async fn release(&self, key: LockKey) -> StorageResult<()> {
        // Only our own row: after a lease expiry the lock may belong to someone else.
        self.db
            .query("DELETE advisory_locks WHERE lock_id = $id AND holder = $holder")
            .bind(("id", key.0))
            .bind(("holder", self.holder.clone()))
            .await?
            .check()?;
        Ok(())
    }
}

#[async_trait]
impl TaskLedger for SurrealStore {
    async fn create_run(&self, chain: &str, subject: &str) -> StorageResult<TaskRunId> {
        let run_id = TaskRunId::new();
        let row = TaskRunRow {
            run_id: run_id.0.clone(),
            chain: chain.to_string(),
            subject: subject.to_string(),
            status: TaskStatus::Running,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        debug!(run_id = %run_id, chain, "creating task run");
        self.create_row("task_runs", row).await?;
        Ok(run_id)
    }

    async fn append_step(&self, run_id: &TaskRunId, event: StepEvent) -> StorageResult<()> {
        self.fetch_running(run_id).await?;
        let row = TaskStepRow {
            run_id: run_id.0.clone(),
            seq: event.seq,
            step: event.step,
            outcome: event.outcome,
            attempts: event.attempts,
            payload: event.payload,
            timestamp: event.timestamp,
        };
        self.create_row("task_steps", row).await
    }

    async fn complete_run(&self, run_id: &TaskRunId) -> StorageResult<()> {
        self.finish_run(run_id, TaskStatus::Completed, None).await
    }

    async fn fail_run(&self, run_id: &TaskRunId, error: &str) -> StorageResult<()> {
        self.finish_run(run_id, TaskStatus::Failed, Some(error.to_string()))
            .await
    }

    async fn get_run(&self, run_id: &TaskRunId) -> StorageResult<TaskRun> {
        Ok(self.fetch_run(run_id).await?.into())
    }

    async fn get_steps(&self, run_id: &TaskRunId) -> StorageResult<Vec<StepEvent>> {
        self.fetch_run(run_id).await?;
        let rows: Vec<TaskStepRow> = self
            .select_where(
                "SELECT * FROM task_steps WHERE run_id = $rid ORDER BY seq ASC",
                "rid",
                run_id.0.clone(),
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| StepEvent {
                seq: r.seq,
                step: r.step,
                outcome: r.outcome,
                attempts: r.attempts,
                payload: r.payload,
                timestamp: r.timestamp,
            })
            .collect())
    }

    async fn list_runs(&self, status: Option<TaskStatus>) -> StorageResult<Vec<TaskRun>> {
        let rows: Vec<TaskRunRow> = match status {
            Some(status) => {
                let mut res = self
                    .db
                    .query("SELECT * FROM task_runs WHERE status = $status ORDER BY created_at DESC")
                    .bind(("status", status))
                    .await?;
                res.take(0)?
            }
            None => {
                let mut res = self
                    .db
                    .query("SELECT * FROM task_runs ORDER BY created_at DESC")
                    .await?;
                res.take(0)?
            }
        };
        Ok(rows.into_iter().map(TaskRun::from).collect())
    }

    async fn purge_finished(
        &self,
        chains: &[&str],
        cutoff: DateTime<Utc>,
    ) -> StorageResult<usize> {
        let chains: Vec<String> = chains.iter().map(|c| c.to_string()).collect();
        let mut res = self
            .db
            .query(
                "SELECT VALUE run_id FROM task_runs WHERE chain INSIDE $chains \
                 AND completed_at != NONE AND completed_at < $cutoff",
            )
            .bind(("chains", chains))
            .bind(("cutoff", surrealdb::sql::Datetime::from(cutoff)))
            .await?;
        let stale: Vec<String> = res.take(0)?;
        if stale.is_empty() {
            return Ok(0);
        }

        self.db
            .query(
                "DELETE task_steps WHERE run_id INSIDE $ids; \
                 DELETE task_runs WHERE run_id INSIDE $ids;",
            )
            .bind(("ids", stale.clone()))
            .await?
            .check()?;
        info!(purged = stale.len(), "purged finished task runs");
        Ok(stale.len())
    }
}
