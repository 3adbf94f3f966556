//! SurrealDB schema initialization
//!
//! Sets up every table with its uniqueness constraints and lookup indexes.

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::storage_traits::StorageResult;

/// Initialize all library tables.
///
/// Safe to call on every connection.
pub async fn init_schema(db: &Surreal<Any>) -> StorageResult<()> {
    info!("Initializing library SurrealDB schema");

    init_entity_tables(db).await?;
    init_build_tables(db).await?;
    init_lock_table(db).await?;
    init_task_tables(db).await?;

    info!("Library schema initialization complete");
    Ok(())
}

/// `packages`, `epochs`, `distros`: long-lived, created out-of-band.
///
/// Constraints:
/// - `token` is unique per package
/// - epoch and distro names are unique
async fn init_entity_tables(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing entity tables");

    let sql = r#"
        DEFINE TABLE packages SCHEMALESS;
        DEFINE INDEX idx_package_id ON TABLE packages COLUMNS record_id UNIQUE;
        DEFINE INDEX idx_package_token ON TABLE packages COLUMNS token UNIQUE;

        DEFINE TABLE epochs SCHEMALESS;
        DEFINE INDEX idx_epoch_id ON TABLE epochs COLUMNS record_id UNIQUE;
        DEFINE INDEX idx_epoch_name ON TABLE epochs COLUMNS name UNIQUE;

        DEFINE TABLE distros SCHEMALESS;
        DEFINE INDEX idx_distro_id ON TABLE distros COLUMNS record_id UNIQUE;
        DEFINE INDEX idx_distro_name ON TABLE distros COLUMNS name UNIQUE;
    "#;
    db.query(sql).await?.check()?;
    Ok(())
}

/// `package_builds` and `distro_builds`.
///
/// Constraints:
/// - a package build is unique on (package, epoch, run, version, target)
/// - a distro build is unique on (distro, epoch, version)
async fn init_build_tables(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing build tables");

    let sql = r#"
        DEFINE TABLE package_builds SCHEMALESS;
        DEFINE INDEX idx_package_build_id ON TABLE package_builds COLUMNS record_id UNIQUE;
        DEFINE INDEX idx_package_build_key ON TABLE package_builds
            COLUMNS package_id, epoch_id, run_id, version, build_target UNIQUE;
        DEFINE INDEX idx_package_build_epoch ON TABLE package_builds COLUMNS epoch_id;

        DEFINE TABLE distro_builds SCHEMALESS;
        DEFINE INDEX idx_distro_build_id ON TABLE distro_builds COLUMNS record_id UNIQUE;
        DEFINE INDEX idx_distro_build_key ON TABLE distro_builds
            COLUMNS distro_id, epoch_id, version UNIQUE;
    "#;
    db.query(sql).await?.check()?;
    Ok(())
}

/// `advisory_locks`: one row per held lock, keyed by the lock id. Rows carry
/// their holder and `acquired_at` so an abandoned lock expires after a lease.
async fn init_lock_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing advisory lock table");

    let sql = r#"
        DEFINE TABLE advisory_locks SCHEMALESS;
        DEFINE INDEX idx_lock_id ON TABLE advisory_locks COLUMNS lock_id UNIQUE;
    "#;
    db.query(sql).await?.check()?;
    Ok(())
}

/// `task_runs` and `task_steps`.
///
/// - `status` transitions running → completed | failed (enforced in app logic)
/// - steps are ordered by `seq` within a run
async fn init_task_tables(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing task tables");

    let sql = r#"
        DEFINE TABLE task_runs SCHEMALESS;
        DEFINE INDEX idx_task_run_id ON TABLE task_runs COLUMNS run_id UNIQUE;
        DEFINE INDEX idx_task_run_chain ON TABLE task_runs COLUMNS chain;
        DEFINE INDEX idx_task_run_status ON TABLE task_runs COLUMNS status;

        DEFINE TABLE task_steps SCHEMALESS;
        DEFINE INDEX idx_task_step_seq ON TABLE task_steps COLUMNS run_id, seq UNIQUE;
    "#;
    db.query(sql).await?.check()?;
    Ok(())
}
