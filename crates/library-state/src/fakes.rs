//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryBuildStore`, `MemoryAdvisoryLock`, and `MemoryTaskLedger`
//! that satisfy the trait contracts without any external dependencies.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{GateError, StorageError};
use crate::gate::{Arch, Gate};
use crate::lock::{AdvisoryLock, LockKey};
use crate::schema::*;
use crate::storage_traits::*;

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// MemoryBuildStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Entities {
    packages: HashMap<RecordId, PackageRecord>,
    epochs: HashMap<RecordId, EpochRecord>,
    distros: HashMap<RecordId, DistroRecord>,
    // Vecs keep creation order, which `ready_for_integration` reports in.
    package_builds: Vec<PackageBuildRecord>,
    distro_builds: Vec<DistroBuildRecord>,
}

/// In-memory build store. Packages, epochs and distros are seeded directly,
/// matching their out-of-band lifecycle.
#[derive(Debug, Default)]
pub struct MemoryBuildStore {
    entities: Mutex<Entities>,
    read_delay: Mutex<Duration>,
}

impl MemoryBuildStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a database round trip after every build record read, so chains
    /// running side by side interleave the way they do against a server.
    pub fn set_read_delay(&self, delay: Duration) {
        *guard(&self.read_delay) = delay;
    }

    async fn round_trip(&self) {
        let delay = *guard(&self.read_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn update_package_build(
        &self,
        id: &RecordId,
        apply: impl FnOnce(&mut PackageBuildRecord),
    ) -> StorageResult<PackageBuildRecord> {
        let mut entities = guard(&self.entities);
        let build = entities
            .package_builds
            .iter_mut()
            .find(|b| b.id == *id)
            .ok_or_else(|| StorageError::not_found("package build", id))?;
        apply(build);
        Ok(build.clone())
    }

    fn update_distro_build(
        &self,
        id: &RecordId,
        apply: impl FnOnce(&mut DistroBuildRecord) -> Result<(), GateError>,
    ) -> StorageResult<DistroBuildRecord> {
        let mut entities = guard(&self.entities);
        let build = entities
            .distro_builds
            .iter_mut()
            .find(|b| b.id == *id)
            .ok_or_else(|| StorageError::not_found("distro build", id))?;
        apply(build)?;
        Ok(build.clone())
    }

    pub fn insert_package(&self, package: PackageRecord) {
        guard(&self.entities).packages.insert(package.id, package);
    }

    pub fn insert_epoch(&self, epoch: EpochRecord) {
        guard(&self.entities).epochs.insert(epoch.id, epoch);
    }

    pub fn insert_distro(&self, distro: DistroRecord) {
        guard(&self.entities).distros.insert(distro.id, distro);
    }

    /// Snapshot of every distro build, in creation order.
    pub fn distro_builds(&self) -> Vec<DistroBuildRecord> {
        guard(&self.entities).distro_builds.clone()
    }

    /// Snapshot of every package build, in creation order.
    pub fn package_builds(&self) -> Vec<PackageBuildRecord> {
        guard(&self.entities).package_builds.clone()
    }
}

fn sorted_by_name(mut distros: Vec<DistroRecord>) -> Vec<DistroRecord> {
    distros.sort_by(|a, b| a.name.cmp(&b.name));
    distros
}

#[async_trait]
impl BuildStore for MemoryBuildStore {
    async fn package_by_token(&self, token: &str) -> StorageResult<PackageRecord> {
        guard(&self.entities)
            .packages
            .values()
            .find(|p| p.token == token)
            .cloned()
            .ok_or(StorageError::UnknownPackageToken)
    }

    async fn sync_package(
        &self,
        id: &RecordId,
        name: &str,
        repository: &str,
    ) -> StorageResult<PackageRecord> {
        let mut entities = guard(&self.entities);
        let package = entities
            .packages
            .get_mut(id)
            .ok_or_else(|| StorageError::not_found("package", id))?;
        package.name = name.to_string();
        package.repository = repository.to_string();
        Ok(package.clone())
    }

    async fn epoch_by_name(&self, name: &str) -> StorageResult<EpochRecord> {
        guard(&self.entities)
            .epochs
            .values()
            .find(|e| e.name == name)
            .cloned()
            .ok_or_else(|| StorageError::not_found("epoch", name))
    }

    async fn epochs_by_build_target(&self, target: BuildTarget) -> StorageResult<Vec<EpochRecord>> {
        let mut epochs: Vec<EpochRecord> = guard(&self.entities)
            .epochs
            .values()
            .filter(|e| e.matches_build_target(target))
            .cloned()
            .collect();
        epochs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(epochs)
    }

    async fn distro_by_name(&self, name: &str) -> StorageResult<DistroRecord> {
        guard(&self.entities)
            .distros
            .values()
            .find(|d| d.name == name)
            .cloned()
            .ok_or_else(|| StorageError::not_found("distro", name))
    }

    async fn list_distros(&self) -> StorageResult<Vec<DistroRecord>> {
        let distros = guard(&self.entities).distros.values().cloned().collect();
        Ok(sorted_by_name(distros))
    }

    async fn distros_in_epoch(&self, epoch_id: &RecordId) -> StorageResult<Vec<DistroRecord>> {
        let distros = guard(&self.entities)
            .distros
            .values()
            .filter(|d| d.epoch_ids.contains(epoch_id))
            .cloned()
            .collect();
        Ok(sorted_by_name(distros))
    }

    async fn get_or_create_package_build(
        &self,
        key: PackageBuildKey,
    ) -> StorageResult<PackageBuildRecord> {
        let mut entities = guard(&self.entities);
        if let Some(existing) = entities.package_builds.iter().find(|b| b.key() == key) {
            return Ok(existing.clone());
        }
        let record = PackageBuildRecord::from_key(key);
        entities.package_builds.push(record.clone());
        Ok(record)
    }

    async fn get_package_build(&self, id: &RecordId) -> StorageResult<PackageBuildRecord> {
        let build = guard(&self.entities)
            .package_builds
            .iter()
            .find(|b| b.id == *id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("package build", id));
        self.round_trip().await;
        build
    }

    async fn save_package_build(&self, record: &PackageBuildRecord) -> StorageResult<()> {
        let mut entities = guard(&self.entities);
        let slot = entities
            .package_builds
            .iter_mut()
            .find(|b| b.id == record.id)
            .ok_or_else(|| StorageError::not_found("package build", record.id))?;
        *slot = record.clone();
        Ok(())
    }

    async fn mark_package_architecture(
        &self,
        id: &RecordId,
        arch: Arch,
    ) -> StorageResult<PackageBuildRecord> {
        self.update_package_build(id, |b| b.set_architecture(arch))
    }

    async fn ready_for_integration(
        &self,
        epoch_name: &str,
        distro: &DistroRecord,
    ) -> StorageResult<Vec<PackageBuildSummary>> {
        let entities = guard(&self.entities);
        let epoch = entities
            .epochs
            .values()
            .find(|e| e.name == epoch_name)
            .ok_or_else(|| StorageError::not_found("epoch", epoch_name))?;

        let attached: HashSet<RecordId> = entities
            .distro_builds
            .iter()
            .flat_map(|d| d.package_build_ids.iter().copied())
            .collect();

        let ready = entities
            .package_builds
            .iter()
            .filter(|b| b.epoch_id == epoch.id)
            .filter(|b| b.linux_64 && b.osx_64)
            .filter(|b| distro.package_ids.contains(&b.package_id))
            .filter(|b| !attached.contains(&b.id))
            .filter_map(|b| {
                entities.packages.get(&b.package_id).map(|p| PackageBuildSummary {
                    id: b.id,
                    package_name: p.name.clone(),
                    version: b.version.clone(),
                })
            })
            .collect();
        Ok(ready)
    }

    async fn get_or_create_distro_build(
        &self,
        key: DistroBuildKey,
    ) -> StorageResult<DistroBuildRecord> {
        let mut entities = guard(&self.entities);
        if let Some(existing) = entities.distro_builds.iter().find(|b| b.key() == key) {
            return Ok(existing.clone());
        }
        let distro = entities
            .distros
            .get(&key.distro_id)
            .ok_or_else(|| StorageError::not_found("distro", key.distro_id))?;
        let record = DistroBuildRecord::new(distro, key.epoch_id, key.version);
        entities.distro_builds.push(record.clone());
        Ok(record)
    }

    async fn get_distro_build(&self, id: &RecordId) -> StorageResult<DistroBuildRecord> {
        let build = guard(&self.entities)
            .distro_builds
            .iter()
            .find(|b| b.id == *id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("distro build", id));
        self.round_trip().await;
        build
    }

    async fn save_distro_build(&self, record: &DistroBuildRecord) -> StorageResult<()> {
        let mut entities = guard(&self.entities);
        let slot = entities
            .distro_builds
            .iter_mut()
            .find(|b| b.id == record.id)
            .ok_or_else(|| StorageError::not_found("distro build", record.id))?;
        *slot = record.clone();
        Ok(())
    }

    async fn mark_distro_architecture(
        &self,
        id: &RecordId,
        gate: Gate,
        arch: Arch,
    ) -> StorageResult<DistroBuildRecord> {
        self.update_distro_build(id, |b| b.set_gate_architecture(gate, arch))
    }

    async fn stamp_distro_run(
        &self,
        id: &RecordId,
        gate: Gate,
        run_id: &str,
    ) -> StorageResult<DistroBuildRecord> {
        self.update_distro_build(id, |b| b.stamp_run(gate, run_id))
    }

    async fn attach_package_builds(
        &self,
        id: &RecordId,
        package_build_ids: &[RecordId],
    ) -> StorageResult<DistroBuildRecord> {
        self.update_distro_build(id, |b| {
            b.attach_package_builds(package_build_ids.iter().copied());
            Ok(())
        })
    }

    async fn set_distro_pr_url(
        &self,
        id: &RecordId,
        pr_url: &str,
    ) -> StorageResult<DistroBuildRecord> {
        self.update_distro_build(id, |b| b.set_pr_url(pr_url))
    }
}

// ---------------------------------------------------------------------------
// MemoryAdvisoryLock
// ---------------------------------------------------------------------------

/// In-process advisory lock with acquire/release counters.
#[derive(Debug, Default)]
pub struct MemoryAdvisoryLock {
    held: Mutex<HashSet<LockKey>>,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl MemoryAdvisoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate another worker holding `key`.
    pub fn hold(&self, key: LockKey) {
        guard(&self.held).insert(key);
    }

    pub fn is_held(&self, key: LockKey) -> bool {
        guard(&self.held).contains(&key)
    }

    /// Successful acquisitions so far.
    pub fn acquire_count(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Releases so far.
    pub fn release_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AdvisoryLock for MemoryAdvisoryLock {
    async fn try_acquire(&self, key: LockKey) -> StorageResult<bool> {
        let taken = guard(&self.held).insert(key);
        if taken {
            self.acquired.fetch_add(1, Ordering::SeqCst);
        }
        Ok(taken)
    }

    async fn release(&self, key: LockKey) -> StorageResult<()> {
        guard(&self.held).remove(&key);
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryTaskLedger
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RunState {
    record: TaskRun,
    steps: Vec<StepEvent>,
}

/// In-memory task ledger backed by a `HashMap<TaskRunId, RunState>`.
#[derive(Debug, Default)]
pub struct MemoryTaskLedger {
    runs: Mutex<HashMap<String, RunState>>,
}

impl MemoryTaskLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn finish(
        &self,
        run_id: &TaskRunId,
        status: TaskStatus,
        error: Option<String>,
    ) -> StorageResult<()> {
        let mut runs = guard(&self.runs);
        let state = running(&mut runs, run_id)?;
        state.record.status = status;
        state.record.error = error;
        state.record.completed_at = Some(Utc::now());
        Ok(())
    }
}

fn running<'a>(
    runs: &'a mut HashMap<String, RunState>,
    run_id: &TaskRunId,
) -> StorageResult<&'a mut RunState> {
    let state = runs
        .get_mut(&run_id.0)
        .ok_or_else(|| StorageError::RunNotFound {
            run_id: run_id.0.clone(),
        })?;
    if state.record.status != TaskStatus::Running {
        return Err(StorageError::InvalidRunState {
            run_id: run_id.0.clone(),
            status: state.record.status.to_string(),
            expected: TaskStatus::Running.to_string(),
        });
    }
    Ok(state)
}

#[async_trait]
impl TaskLedger for MemoryTaskLedger {
    async fn create_run(&self, chain: &str, subject: &str) -> StorageResult<TaskRunId> {
        let run_id = TaskRunId::new();
        let record = TaskRun {
            run_id: run_id.clone(),
            chain: chain.to_string(),
            subject: subject.to_string(),
            status: TaskStatus::Running,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        guard(&self.runs).insert(
            run_id.0.clone(),
            RunState {
                record,
                steps: Vec::new(),
            },
        );
        Ok(run_id)
    }

    async fn append_step(&self, run_id: &TaskRunId, event: StepEvent) -> StorageResult<()> {
        let mut runs = guard(&self.runs);
        running(&mut runs, run_id)?.steps.push(event);
        Ok(())
    }

    async fn complete_run(&self, run_id: &TaskRunId) -> StorageResult<()> {
        self.finish(run_id, TaskStatus::Completed, None)
    }

    async fn fail_run(&self, run_id: &TaskRunId, error: &str) -> StorageResult<()> {
        self.finish(run_id, TaskStatus::Failed, Some(error.to_string()))
    }

    async fn get_run(&self, run_id: &TaskRunId) -> StorageResult<TaskRun> {
        guard(&self.runs)
            .get(&run_id.0)
            .map(|s| s.record.clone())
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })
    }

    async fn get_steps(&self, run_id: &TaskRunId) -> StorageResult<Vec<StepEvent>> {
        let runs = guard(&self.runs);
        let state = runs
            .get(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        let mut steps = state.steps.clone();
        steps.sort_by_key(|e| e.seq);
        Ok(steps)
    }

    async fn list_runs(&self, status: Option<TaskStatus>) -> StorageResult<Vec<TaskRun>> {
        let mut records: Vec<TaskRun> = guard(&self.runs)
            .values()
            .map(|s| s.record.clone())
            .filter(|r| status.map_or(true, |s| r.status == s))
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn purge_finished(
        &self,
        chains: &[&str],
        cutoff: DateTime<Utc>,
    ) -> StorageResult<usize> {
        let mut runs = guard(&self.runs);
        let before = runs.len();
        runs.retain(|_, s| {
            let stale = s.record.completed_at.is_some_and(|t| t < cutoff);
            !(stale && chains.contains(&s.record.chain.as_str()))
        });
        Ok(before - runs.len())
    }
}
