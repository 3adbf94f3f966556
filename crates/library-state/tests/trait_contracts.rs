//! Trait contract tests for BuildStore, AdvisoryLock and TaskLedger.
//!
//! The same scenarios run against the in-memory fakes and the in-memory
//! SurrealDB backend.

use std::sync::Arc;

use chrono::{Duration, Utc};
use library_state::fakes::{MemoryAdvisoryLock, MemoryBuildStore, MemoryTaskLedger};
use library_state::*;

// ===========================================================================
// Fixtures
// ===========================================================================

struct World {
    package: PackageRecord,
    other: PackageRecord,
    epoch: EpochRecord,
    distro: DistroRecord,
}

fn world() -> World {
    let mut package = PackageRecord::register();
    package.name = "q2-types".to_string();
    let mut other = PackageRecord::register();
    other.name = "q2-feature-table".to_string();
    let epoch = EpochRecord::new("2024.10", true, true);
    let distro = DistroRecord::new("core")
        .with_package(&package)
        .with_package(&other)
        .in_epoch(&epoch);
    World {
        package,
        other,
        epoch,
        distro,
    }
}

fn memory_store(w: &World) -> MemoryBuildStore {
    let store = MemoryBuildStore::new();
    store.insert_package(w.package.clone());
    store.insert_package(w.other.clone());
    store.insert_epoch(w.epoch.clone());
    store.insert_epoch(EpochRecord::new("2024.5", false, true));
    store.insert_distro(w.distro.clone());
    store
}

async fn surreal_store(w: &World) -> SurrealStore {
    let store = SurrealStore::in_memory().await.unwrap();
    store.insert_package(&w.package).await.unwrap();
    store.insert_package(&w.other).await.unwrap();
    store.insert_epoch(&w.epoch).await.unwrap();
    store
        .insert_epoch(&EpochRecord::new("2024.5", false, true))
        .await
        .unwrap();
    store.insert_distro(&w.distro).await.unwrap();
    store
}

fn build_key(package: &PackageRecord, epoch: &EpochRecord, run: &str, version: &str) -> PackageBuildKey {
    PackageBuildKey {
        package_id: package.id,
        epoch_id: epoch.id,
        run_id: run.to_string(),
        version: version.to_string(),
        build_target: BuildTarget::Dev,
    }
}

async fn tested_build(
    store: &dyn BuildStore,
    package: &PackageRecord,
    epoch: &EpochRecord,
    run: &str,
    version: &str,
) -> PackageBuildRecord {
    let mut record = store
        .get_or_create_package_build(build_key(package, epoch, run, version))
        .await
        .unwrap();
    record.mark_architecture("linux-64").unwrap();
    record.mark_architecture("osx-64").unwrap();
    store.save_package_build(&record).await.unwrap();
    record
}

// ===========================================================================
// BuildStore contract
// ===========================================================================

async fn contract_package_build_get_or_create_is_idempotent(store: &dyn BuildStore, w: &World) {
    let key = build_key(&w.package, &w.epoch, "1001", "2024.10.0.dev0");
    let first = store.get_or_create_package_build(key.clone()).await.unwrap();
    let second = store.get_or_create_package_build(key).await.unwrap();
    assert_eq!(first.id, second.id);

    let other_run = build_key(&w.package, &w.epoch, "1002", "2024.10.0.dev0");
    let third = store.get_or_create_package_build(other_run).await.unwrap();
    assert_ne!(first.id, third.id);

    // Per-architecture callbacks for one run create the same key side by side.
    let racing = build_key(&w.package, &w.epoch, "1003", "2024.10.0.dev0");
    let (linux, osx) = tokio::join!(
        store.get_or_create_package_build(racing.clone()),
        store.get_or_create_package_build(racing),
    );
    assert_eq!(linux.unwrap().id, osx.unwrap().id);
}

async fn contract_distro_build_get_or_create_survives_a_race(store: &dyn BuildStore, w: &World) {
    let key = DistroBuildKey {
        distro_id: w.distro.id,
        epoch_id: w.epoch.id,
        version: "2024.10.0.dev9".to_string(),
    };
    let (a, b) = tokio::join!(
        store.get_or_create_distro_build(key.clone()),
        store.get_or_create_distro_build(key),
    );
    assert_eq!(a.unwrap().id, b.unwrap().id);
}

async fn contract_marks_only_touch_their_own_flag(store: &dyn BuildStore, w: &World) {
    let record = store
        .get_or_create_package_build(build_key(&w.package, &w.epoch, "2101", "2024.10.3"))
        .await
        .unwrap();
    let (linux, osx) = tokio::join!(
        store.mark_package_architecture(&record.id, Arch::Linux64),
        store.mark_package_architecture(&record.id, Arch::Osx64),
    );
    linux.unwrap();
    osx.unwrap();
    let marked = store.get_package_build(&record.id).await.unwrap();
    assert!(marked.verify_gate(Gate::Tested).unwrap());

    let distro_build = store
        .get_or_create_distro_build(DistroBuildKey {
            distro_id: w.distro.id,
            epoch_id: w.epoch.id,
            version: "2024.10.3".to_string(),
        })
        .await
        .unwrap();
    store
        .stamp_distro_run(&distro_build.id, Gate::Staged, "4001")
        .await
        .unwrap();
    store
        .mark_distro_architecture(&distro_build.id, Gate::Staged, Arch::Osx64)
        .await
        .unwrap();
    let after = store
        .mark_distro_architecture(&distro_build.id, Gate::Staged, Arch::Linux64)
        .await
        .unwrap();
    assert!(after.verify_gate(Gate::Staged).unwrap());
    assert!(!after.verify_gate(Gate::Passed).unwrap());
    assert_eq!(after.staged_run_id, "4001");
    assert!(matches!(
        store
            .mark_distro_architecture(&distro_build.id, Gate::Tested, Arch::Osx64)
            .await,
        Err(StorageError::Gate(GateError::InvalidGate { .. }))
    ));

    store
        .attach_package_builds(&distro_build.id, &[record.id])
        .await
        .unwrap();
    let url = "https://github.com/qiime2/package-integration/pull/3";
    let with_url = store.set_distro_pr_url(&distro_build.id, url).await.unwrap();
    assert_eq!(with_url.pr_url, url);
    assert!(with_url.package_build_ids.contains(&record.id));
    assert!(with_url.verify_gate(Gate::Staged).unwrap());
    assert!(matches!(
        store.set_distro_pr_url(&distro_build.id, "https://example.com/pull/4").await,
        Err(StorageError::Gate(GateError::PrUrlAlreadySet { .. }))
    ));
}

async fn contract_saved_flags_are_persisted(store: &dyn BuildStore, w: &World) {
    let key = build_key(&w.package, &w.epoch, "2001", "2024.10.1");
    let mut record = store.get_or_create_package_build(key).await.unwrap();
    record.mark_architecture("osx-64").unwrap();
    store.save_package_build(&record).await.unwrap();

    let fetched = store.get_package_build(&record.id).await.unwrap();
    assert!(fetched.osx_64);
    assert!(!fetched.linux_64);
}

async fn contract_ready_for_integration_skips_attached_and_untested(
    store: &dyn BuildStore,
    w: &World,
) {
    let attached = tested_build(store, &w.package, &w.epoch, "3001", "2024.10.0").await;
    let fresh = tested_build(store, &w.other, &w.epoch, "3002", "2024.10.1").await;

    let mut half = store
        .get_or_create_package_build(build_key(&w.package, &w.epoch, "3003", "2024.10.2"))
        .await
        .unwrap();
    half.mark_architecture("linux-64").unwrap();
    store.save_package_build(&half).await.unwrap();

    let mut placeholder = store
        .get_or_create_distro_build(DistroBuildKey {
            distro_id: w.distro.id,
            epoch_id: w.epoch.id,
            version: "2024.10.01.00.00.00".to_string(),
        })
        .await
        .unwrap();
    placeholder.attach_package_builds([attached.id]);
    store.save_distro_build(&placeholder).await.unwrap();

    let ready = store
        .ready_for_integration(&w.epoch.name, &w.distro)
        .await
        .unwrap();
    let ids: Vec<RecordId> = ready.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![fresh.id]);
    assert_eq!(ready[0].package_name, "q2-feature-table");
}

async fn contract_distro_build_get_or_create_is_keyed(store: &dyn BuildStore, w: &World) {
    let key = DistroBuildKey {
        distro_id: w.distro.id,
        epoch_id: w.epoch.id,
        version: "2024.10.0".to_string(),
    };
    let mut first = store.get_or_create_distro_build(key.clone()).await.unwrap();
    first.stamp_run(Gate::Staged, "77").unwrap();
    store.save_distro_build(&first).await.unwrap();

    let second = store.get_or_create_distro_build(key).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(second.staged_run_id, "77");
    assert_eq!(second.distro_name, "core");
}

async fn contract_lookups(store: &dyn BuildStore, w: &World) {
    let found = store.package_by_token(&w.package.token).await.unwrap();
    assert_eq!(found.id, w.package.id);
    assert!(matches!(
        store.package_by_token("not-a-token").await,
        Err(StorageError::UnknownPackageToken)
    ));

    let synced = store
        .sync_package(&w.package.id, "q2-types", "qiime2/q2-types")
        .await
        .unwrap();
    assert_eq!(synced.repository, "qiime2/q2-types");

    let dev = store.epochs_by_build_target(BuildTarget::Dev).await.unwrap();
    assert_eq!(dev.len(), 1);
    assert_eq!(dev[0].name, "2024.10");
    let release = store.epochs_by_build_target(BuildTarget::Release).await.unwrap();
    assert_eq!(release[0].name, "2024.5");

    let distros = store.distros_in_epoch(&w.epoch.id).await.unwrap();
    assert_eq!(distros.len(), 1);
    assert!(matches!(
        store.distro_by_name("missing").await,
        Err(StorageError::NotFound { .. })
    ));
}

#[tokio::test]
async fn memory_build_store_contract() {
    let w = world();
    let store = memory_store(&w);
    contract_package_build_get_or_create_is_idempotent(&store, &w).await;
    contract_distro_build_get_or_create_survives_a_race(&store, &w).await;
    contract_marks_only_touch_their_own_flag(&store, &w).await;
    contract_saved_flags_are_persisted(&store, &w).await;
    contract_ready_for_integration_skips_attached_and_untested(&store, &w).await;
    contract_distro_build_get_or_create_is_keyed(&store, &w).await;
    contract_lookups(&store, &w).await;
}

#[tokio::test]
async fn surreal_build_store_contract() {
    let w = world();
    let store = surreal_store(&w).await;
    contract_package_build_get_or_create_is_idempotent(&store, &w).await;
    contract_distro_build_get_or_create_survives_a_race(&store, &w).await;
    contract_marks_only_touch_their_own_flag(&store, &w).await;
    contract_saved_flags_are_persisted(&store, &w).await;
    contract_ready_for_integration_skips_attached_and_untested(&store, &w).await;
    contract_distro_build_get_or_create_is_keyed(&store, &w).await;
    contract_lookups(&store, &w).await;
}

// ===========================================================================
// AdvisoryLock contract
// ===========================================================================

async fn contract_lock_is_exclusive(lock: &dyn AdvisoryLock) {
    let key = LockKey(42);
    assert!(lock.try_acquire(key).await.unwrap());
    assert!(!lock.try_acquire(key).await.unwrap());
    assert!(lock.try_acquire(LockKey(43)).await.unwrap());

    lock.release(key).await.unwrap();
    assert!(lock.try_acquire(key).await.unwrap());
    lock.release(key).await.unwrap();
    lock.release(LockKey(43)).await.unwrap();
}

#[tokio::test]
async fn memory_lock_contract() {
    contract_lock_is_exclusive(&MemoryAdvisoryLock::new()).await;
}

#[tokio::test]
async fn surreal_lock_contract() {
    let store = SurrealStore::in_memory().await.unwrap();
    contract_lock_is_exclusive(&store).await;
}

#[tokio::test]
async fn surreal_lock_expires_after_its_lease() {
    let store = SurrealStore::in_memory()
        .await
        .unwrap()
        .with_lock_lease(std::time::Duration::from_secs(1));
    let key = LockKey(42);
    assert!(store.try_acquire(key).await.unwrap());
    assert!(!store.try_acquire(key).await.unwrap());

    // The holder never releases, as if its worker died.
    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
    assert!(store.try_acquire(key).await.unwrap());
    store.release(key).await.unwrap();
}

#[derive(Debug, PartialEq)]
enum BodyError {
    Busy,
    Storage(String),
    Body(&'static str),
}

impl From<LockUnavailable> for BodyError {
    fn from(_: LockUnavailable) -> Self {
        BodyError::Busy
    }
}

impl From<StorageError> for BodyError {
    fn from(e: StorageError) -> Self {
        BodyError::Storage(e.to_string())
    }
}

fn shared_lock() -> (Arc<MemoryAdvisoryLock>, Arc<dyn AdvisoryLock>) {
    let fake = Arc::new(MemoryAdvisoryLock::new());
    let lock: Arc<dyn AdvisoryLock> = fake.clone();
    (fake, lock)
}

async fn wait_for_release(fake: &MemoryAdvisoryLock, key: LockKey) {
    for _ in 0..100 {
        if !fake.is_held(key) {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("lock {key} still held");
}

#[tokio::test]
async fn scoped_lock_releases_once_on_success_and_failure() {
    let (fake, lock) = shared_lock();
    let key = LockKey(42);

    let ok: Result<u32, BodyError> = with_advisory_lock(&lock, key, || async { Ok(7) }).await;
    assert_eq!(ok, Ok(7));
    assert_eq!(fake.release_count(), 1);

    let failed: Result<u32, BodyError> =
        with_advisory_lock(&lock, key, || async { Err(BodyError::Body("commit failed")) }).await;
    assert_eq!(failed, Err(BodyError::Body("commit failed")));
    assert_eq!(fake.acquire_count(), 2);
    assert_eq!(fake.release_count(), 2);
    assert!(!fake.is_held(key));
}

#[tokio::test]
async fn scoped_lock_released_when_holder_is_aborted() {
    let (fake, lock) = shared_lock();
    let key = LockKey(42);
    let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();

    let holder = tokio::spawn(async move {
        let res: Result<(), BodyError> = with_advisory_lock(&lock, key, || async move {
            let _ = entered_tx.send(());
            std::future::pending::<()>().await;
            Ok(())
        })
        .await;
        res
    });
    entered_rx.await.unwrap();
    assert!(fake.is_held(key));

    holder.abort();
    assert!(holder.await.unwrap_err().is_cancelled());
    wait_for_release(&fake, key).await;
    assert_eq!(fake.release_count(), 1);
}

#[tokio::test]
async fn scoped_lock_released_when_body_panics() {
    let (fake, lock) = shared_lock();
    let key = LockKey(42);

    let holder = tokio::spawn(async move {
        let res: Result<(), BodyError> =
            with_advisory_lock(&lock, key, || async {
                if key.0 == 42 {
                    panic!("recipe body blew up");
                }
                Ok(())
            })
            .await;
        res
    });
    assert!(holder.await.unwrap_err().is_panic());
    wait_for_release(&fake, key).await;
    assert_eq!(fake.release_count(), 1);
}

#[tokio::test]
async fn scoped_lock_busy_never_runs_body() {
    let (fake, lock) = shared_lock();
    let key = LockKey(42);
    fake.hold(key);

    let mut ran = false;
    let res: Result<(), BodyError> = with_advisory_lock(&lock, key, || {
        ran = true;
        async { Ok(()) }
    })
    .await;

    assert_eq!(res, Err(BodyError::Busy));
    assert!(!ran);
    assert_eq!(fake.release_count(), 0);
    assert!(fake.is_held(key));
}

// ===========================================================================
// TaskLedger contract
// ===========================================================================

fn step(seq: u64, name: &str) -> StepEvent {
    StepEvent {
        seq,
        step: name.to_string(),
        outcome: StepOutcome::Succeeded,
        attempts: 1,
        payload: serde_json::json!({ "seq": seq }),
        timestamp: Utc::now(),
    }
}

async fn contract_run_lifecycle(ledger: &dyn TaskLedger) {
    let run_id = ledger
        .create_run("pipeline.handle_new_package_build", "q2-types")
        .await
        .unwrap();
    ledger.append_step(&run_id, step(2, "b")).await.unwrap();
    ledger.append_step(&run_id, step(1, "a")).await.unwrap();
    ledger.complete_run(&run_id).await.unwrap();

    let run = ledger.get_run(&run_id).await.unwrap();
    assert_eq!(run.status, TaskStatus::Completed);
    assert!(run.completed_at.is_some());

    let steps = ledger.get_steps(&run_id).await.unwrap();
    let seqs: Vec<u64> = steps.iter().map(|s| s.seq).collect();
    assert_eq!(seqs, vec![1, 2]);

    let err = ledger.append_step(&run_id, step(3, "c")).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidRunState { .. }));
    let err = ledger.fail_run(&run_id, "late").await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidRunState { .. }));
}

async fn contract_failed_runs_keep_error(ledger: &dyn TaskLedger) {
    let run_id = ledger.create_run("pipeline.handle_prs", "2024.10").await.unwrap();
    ledger.fail_run(&run_id, "version conflict").await.unwrap();

    let failed = ledger.list_runs(Some(TaskStatus::Failed)).await.unwrap();
    assert!(failed.iter().any(|r| r.run_id == run_id));
    assert_eq!(
        ledger.get_run(&run_id).await.unwrap().error.as_deref(),
        Some("version conflict")
    );

    let missing = TaskRunId::new();
    assert!(matches!(
        ledger.get_run(&missing).await,
        Err(StorageError::RunNotFound { .. })
    ));
}

async fn contract_purge_only_touches_named_finished_chains(ledger: &dyn TaskLedger) {
    let noisy = ledger.create_run("packages.reindex_channel", "2024.10-tested").await.unwrap();
    ledger.complete_run(&noisy).await.unwrap();
    let running = ledger.create_run("packages.reindex_channel", "2024.10-core-staged").await.unwrap();
    let kept = ledger.create_run("pipeline.handle_prs", "2024.10").await.unwrap();
    ledger.complete_run(&kept).await.unwrap();

    let purged = ledger
        .purge_finished(&["packages.reindex_channel"], Utc::now() + Duration::seconds(5))
        .await
        .unwrap();
    assert_eq!(purged, 1);
    assert!(ledger.get_run(&noisy).await.is_err());
    assert!(ledger.get_run(&running).await.is_ok());
    assert!(ledger.get_run(&kept).await.is_ok());
}

#[tokio::test]
async fn memory_task_ledger_contract() {
    let ledger = MemoryTaskLedger::new();
    contract_run_lifecycle(&ledger).await;
    contract_failed_runs_keep_error(&ledger).await;
    contract_purge_only_touches_named_finished_chains(&ledger).await;
}

#[tokio::test]
async fn surreal_task_ledger_contract() {
    let ledger = SurrealStore::in_memory().await.unwrap();
    contract_run_lifecycle(&ledger).await;
    contract_failed_runs_keep_error(&ledger).await;
    contract_purge_only_touches_named_finished_chains(&ledger).await;
}
