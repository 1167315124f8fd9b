//! Migration state machine.
//!
//! Each call to [`Orchestrator::advance`] performs exactly one state
//! transition and persists the job before returning, so a crash between any
//! two steps resumes by replaying `advance` from the stored state. Provider
//! calls carry a `<job-id>:<step>` idempotency token, which makes replaying a
//! half-finished step safe.

use crate::codec::DiskConverter;
use crate::config::MigrationConfig;
use crate::error::ErrorKind;
use crate::job::{
    Disposition, JobOptions, JobState, MigrationJob, ProviderKind, ResourceHandle, ResourceKind,
    ResourceOwner, VmDescriptor,
};
use crate::provider::{ProviderAdapter, ProviderError, StepContext};
use crate::store::JobStore;
use crate::transfer::{CancelFlag, Checkpoint, TransferError, TransferPolicy, transfer, verify_checksum};
use crate::transport::{Transports, file_uri};
use crate::{MigrationError, Result, log_debug, log_error, log_info, log_warn};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Submission request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub source_provider: ProviderKind,
    pub dest_provider: ProviderKind,
    pub vm_identifier: String,
    #[serde(default)]
    pub options: JobOptions,
}

/// Status view of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    #[serde(flatten)]
    pub job: MigrationJob,
    pub progress_percent: f32,
}

impl From<MigrationJob> for JobSnapshot {
    fn from(job: MigrationJob) -> Self {
        let progress_percent = job.progress_percent();
        Self {
            job,
            progress_percent,
        }
    }
}

impl JobSnapshot {
    pub fn state(&self) -> JobState {
        self.job.state
    }

    /// Whether `run` has nothing more to do without operator action.
    pub fn is_settled(&self) -> bool {
        self.job.state.is_terminal() || self.job.state == JobState::Failed
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub staging_dir: PathBuf,
    pub transfer: TransferPolicy,
    pub verify_checksum: bool,
    pub max_integrity_retries: u32,
    /// `retry` calls allowed on one failed step
    pub max_step_retries: u32,
}

impl OrchestratorSettings {
    pub fn from_config(config: &MigrationConfig) -> Result<Self> {
        Ok(Self {
            staging_dir: config.staging_dir.clone(),
            transfer: config.transfer.policy()?,
            verify_checksum: config.transfer.verify_checksum,
            max_integrity_retries: config.retry.max_integrity_retries,
            max_step_retries: config.retry.max_step_retries,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconcileMode {
    /// Keep the destination VM, clean up everything else.
    Complete,
    /// Clean up everything, destination VM included.
    Discard,
}

/// One entry per VM being migrated. `held` mirrors the store; `pending`
/// holds submissions that have not been persisted yet.
#[derive(Default)]
struct LockTable {
    loaded: bool,
    held: HashMap<(String, ProviderKind), Uuid>,
    pending: HashMap<(String, ProviderKind), Uuid>,
}

impl LockTable {
    fn holder(&self, key: &(String, ProviderKind)) -> Option<Uuid> {
        self.pending.get(key).or_else(|| self.held.get(key)).copied()
    }
}

/// Persists the resume offset every time the transfer watermark advances.
struct JobCheckpoint<'a> {
    store: &'a dyn JobStore,
    job: Mutex<MigrationJob>,
}

#[async_trait]
impl Checkpoint for JobCheckpoint<'_> {
    async fn checkpoint(&self, offset: u64) -> std::result::Result<(), TransferError> {
        let mut job = self.job.lock().await;
        job.set_resume_offset(offset);
        self.store
            .save(&job)
            .await
            .map_err(|e| TransferError::Checkpoint(e.to_string()))
    }
}

pub struct Orchestrator {
    adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
    store: Arc<dyn JobStore>,
    transports: Arc<dyn Transports>,
    converter: Arc<dyn DiskConverter>,
    settings: OrchestratorSettings,
    locks: Mutex<LockTable>,
    job_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    cancels: Mutex<HashMap<Uuid, CancelFlag>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        transports: Arc<dyn Transports>,
        converter: Arc<dyn DiskConverter>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            adapters: HashMap::new(),
            store,
            transports,
            converter,
            settings,
            locks: Mutex::new(LockTable::default()),
            job_locks: Mutex::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    fn adapter(&self, kind: ProviderKind) -> Result<&Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(&kind)
            .ok_or(MigrationError::AdapterMissing(kind))
    }

    // ----- public API -------------------------------------------------------

    /// Locate the VM and create a job in `Discovered`.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Uuid> {
        let vm_identifier = request.vm_identifier.trim().to_string();
        if vm_identifier.is_empty() {
            return Err(MigrationError::InvalidIdentifier(
                "VM identifier is empty".to_string(),
            ));
        }
        let source = self.adapter(request.source_provider)?.clone();
        let dest = self.adapter(request.dest_provider)?;
        if let Some(format) = request.options.force_format {
            if !dest.accepts(format) && format.qemu_format().is_none() {
                return Err(MigrationError::ConfigError(format!(
                    "forced format {} can be neither imported by {} nor converted",
                    format, request.dest_provider
                )));
            }
        }

        let key = (vm_identifier.clone(), request.source_provider);
        let reservation = Uuid::new_v4();
        {
            let mut locks = self.locks.lock().await;
            self.ensure_locks_loaded(&mut locks).await?;
            if let Some(holder) = locks.holder(&key) {
                return Err(MigrationError::DuplicateInProgress {
                    vm: vm_identifier,
                    provider: request.source_provider,
                    holder,
                });
            }
            locks.pending.insert(key.clone(), reservation);
        }

        let located = source.locate(&vm_identifier).await;
        let vm = match located {
            Ok(vm) => vm,
            Err(err) => {
                self.locks.lock().await.pending.remove(&key);
                return Err(submission_error(err));
            }
        };

        let mut job = MigrationJob::new(
            request.source_provider,
            request.dest_provider,
            vm_identifier,
            request.options,
            vm,
        );
        job.id = reservation;

        let saved = self.store.save(&job).await;
        {
            let mut locks = self.locks.lock().await;
            locks.pending.remove(&key);
            if let Err(err) = saved {
                return Err(err.into());
            }
            locks.held.insert(key, job.id);
        }

        log_info!(
            job_id = %job.id,
            source = %job.source_provider,
            dest = %job.dest_provider,
            "Migration job submitted for VM '{}'",
            job.vm_identifier
        );
        Ok(job.id)
    }

    pub async fn get_job(&self, id: Uuid) -> Result<JobSnapshot> {
        Ok(self.load(id).await?.into())
    }

    pub async fn list_jobs(&self, include_archived: bool) -> Result<Vec<JobSnapshot>> {
        Ok(self
            .store
            .list(include_archived)
            .await?
            .into_iter()
            .map(JobSnapshot::from)
            .collect())
    }

    /// Execute one transition. A no-op for settled jobs.
    pub async fn advance(&self, id: Uuid) -> Result<JobSnapshot> {
        let job_lock = self.job_lock(id).await;
        let _guard = job_lock.lock().await;

        let mut job = self.load_locked(id).await?;
        if job.state.is_terminal() || job.state == JobState::Failed {
            return Ok(job.into());
        }

        let cancel = self.cancel_flag(id).await;
        if cancel.is_cancelled() {
            log_info!(job_id = %id, "Cancellation requested, abandoning at state boundary");
            self.finish_abandon(&mut job).await?;
            return Ok(job.into());
        }

        let from = job.state;
        match self.step(&mut job, &cancel).await {
            Ok(()) => {
                self.store.save(&job).await?;
                log_info!(job_id = %id, from = %from, to = %job.state, "State transition");
                if job.state == JobState::Completed {
                    self.store.archive(id).await?;
                    self.release(&job).await;
                    log_info!(job_id = %id, "Migration of '{}' completed", job.vm_identifier);
                }
                Ok(job.into())
            }
            Err(err) => self.handle_failure(job, err).await,
        }
    }

    /// Drive `advance` until the job completes, is abandoned or fails.
    pub async fn run(&self, id: Uuid) -> Result<JobSnapshot> {
        loop {
            let snapshot = self.advance(id).await?;
            if snapshot.is_settled() {
                return Ok(snapshot);
            }
        }
    }

    pub fn spawn(self: &Arc<Self>, id: Uuid) -> JoinHandle<Result<JobSnapshot>> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let result = orchestrator.run(id).await;
            if let Err(err) = &result {
                log_error!(job_id = %id, "Migration stopped: {}", err);
            }
            result
        })
    }

    /// Re-drive every persisted job that can make progress after a restart.
    pub async fn resume_all(self: &Arc<Self>) -> Result<Vec<(Uuid, JoinHandle<Result<JobSnapshot>>)>> {
        {
            let mut locks = self.locks.lock().await;
            locks.loaded = false;
            self.ensure_locks_loaded(&mut locks).await?;
        }

        let mut handles = Vec::new();
        for job in self.store.list(false).await? {
            if job.state.is_terminal() || job.state == JobState::Failed {
                continue;
            }
            log_info!(job_id = %job.id, state = %job.state, "Resuming job");
            handles.push((job.id, self.spawn(job.id)));
        }
        Ok(handles)
    }

    /// Re-enter the state a retryable failure interrupted and re-issue its
    /// operation. Once a step has used up `max_step_retries`, the failure
    /// becomes final and the job's resources are reconciled.
    pub async fn retry(&self, id: Uuid) -> Result<JobSnapshot> {
        {
            let job_lock = self.job_lock(id).await;
            let _guard = job_lock.lock().await;
            let mut job = self.load_locked(id).await?;
            let target = match job.resume_from_failure(self.settings.max_step_retries) {
                Ok(target) => target,
                Err(err @ MigrationError::RetriesExhausted { .. }) => {
                    log_error!(job_id = %id, "{}", err);
                    self.reconcile(&mut job, ReconcileMode::Discard).await;
                    job.give_up();
                    self.store.save(&job).await?;
                    return Err(err);
                }
                Err(err) => return Err(err),
            };
            self.store.save(&job).await?;
            log_info!(
                job_id = %id,
                to = %target,
                resume_offset = ?job.resume_offset,
                "Retrying after failure"
            );
        }
        self.advance(id).await
    }

    /// Reconcile every created resource in reverse order and mark the job `Abandoned`.
    pub async fn abandon(&self, id: Uuid) -> Result<JobSnapshot> {
        let job_lock = self.job_lock(id).await;
        let _guard = job_lock.lock().await;

        let mut job = self.load_locked(id).await?;
        match job.state {
            JobState::Abandoned => return Ok(job.into()),
            JobState::Completed => {
                return Err(MigrationError::InvalidState {
                    job_id: id,
                    state: job.state,
                    action: "abandon",
                });
            }
            _ => {}
        }
        self.finish_abandon(&mut job).await?;
        Ok(job.into())
    }

    /// Request cancellation. A running step stops at the next chunk or state
    /// boundary; the job is then abandoned.
    pub async fn cancel(&self, id: Uuid) -> Result<JobSnapshot> {
        let job = self.load(id).await?;
        if job.state == JobState::Completed {
            return Err(MigrationError::InvalidState {
                job_id: id,
                state: job.state,
                action: "cancel",
            });
        }
        self.cancel_flag(id).await.cancel();
        log_info!(job_id = %id, "Cancellation requested");
        self.abandon(id).await
    }

    // ----- state steps ------------------------------------------------------

    async fn step(&self, job: &mut MigrationJob, cancel: &CancelFlag) -> Result<()> {
        let ctx = StepContext::new(job.id);
        match job.state {
            JobState::Discovered => {
                let source = self.adapter(job.source_provider)?;
                let vm = source_vm(job)?;
                let prior = source.power_off(&vm, &ctx).await?;
                log_debug!(job_id = %job.id, ?prior, "Source VM powered off");
                job.transition(JobState::PoweredOff)
            }
            JobState::PoweredOff => {
                let source = self.adapter(job.source_provider)?;
                let vm = source_vm(job)?;
                if let Some(snapshot) = source.snapshot(&vm, &ctx).await? {
                    job.add_resource(snapshot);
                }
                job.transition(JobState::Snapshotted)
            }
            JobState::Snapshotted => self.start_export(job, &ctx).await,
            JobState::Exporting => self.download(job, cancel).await,
            JobState::Exported => {
                let dest = self.adapter(job.dest_provider)?;
                let format = disk_format(job)?;
                if dest.accepts(format) {
                    log_info!(job_id = %job.id, "{} already accepted by {}, skipping conversion", format, job.dest_provider);
                    self.enter_uploading(job, &ctx).await
                } else {
                    job.transition(JobState::Converting)
                }
            }
            JobState::Converting => self.convert(job).await,
            JobState::Converted => self.enter_uploading(job, &ctx).await,
            JobState::Uploading => self.upload_and_import(job, &ctx, cancel).await,
            JobState::Imported => {
                let dest = self.adapter(job.dest_provider)?;
                let vm = source_vm(job)?;
                let image = job
                    .latest_resource(ResourceOwner::Provider(job.dest_provider), ResourceKind::Image)
                    .cloned()
                    .ok_or_else(|| missing(job, "imported image"))?;
                let launched = dest.launch(&image, &vm, &ctx).await?;
                log_info!(job_id = %job.id, "Destination VM {} launched", launched.id);
                job.add_resource(launched);
                job.transition(JobState::Launched)
            }
            JobState::Launched => {
                self.reconcile(job, ReconcileMode::Complete).await;
                let failures = job.unreconciled().count();
                if failures > 0 {
                    return Err(ProviderError::Transient(format!(
                        "{} intermediate resources could not be deleted",
                        failures
                    ))
                    .into());
                }
                job.transition(JobState::Completed)
            }
            JobState::Completed | JobState::Abandoned | JobState::Failed => Ok(()),
        }
    }

    async fn start_export(&self, job: &mut MigrationJob, ctx: &StepContext) -> Result<()> {
        let source = self.adapter(job.source_provider)?;
        let vm = source_vm(job)?;
        let snapshot = job
            .created_resources
            .iter()
            .find(|r| r.handle.owner == ResourceOwner::Provider(job.source_provider))
            .map(|r| r.handle.clone());

        let export = source.export(&vm, snapshot.as_ref(), ctx).await?;
        for resource in export.resources {
            job.add_resource(resource);
        }
        job.access_grant = export.grant;

        let size = match export.size_bytes {
            Some(size) => size,
            None => self
                .transports
                .source(&export.uri)
                .map_err(|e| transport_failure(0, e))?
                .size()
                .await
                .map_err(|e| transport_failure(0, e))?,
        };

        let format = job.options.force_format.unwrap_or(export.format);
        let staging = self
            .settings
            .staging_dir
            .join(job.id.to_string())
            .join(format!("source.{}", format.extension()));

        job.disk.format = Some(format);
        job.disk.size_bytes = size;
        job.disk.checksum = export.checksum;
        job.disk.source_location_uri = Some(export.uri);
        job.disk.staging_local_path = Some(staging.clone());
        job.add_resource(ResourceHandle::local_file(&staging));
        job.transition(JobState::Exporting)
    }

    async fn download(&self, job: &mut MigrationJob, cancel: &CancelFlag) -> Result<()> {
        let uri = job
            .disk
            .source_location_uri
            .clone()
            .ok_or_else(|| missing(job, "export URI"))?;
        let path = staging_path(job)?;
        let size = job.disk.size_bytes;

        self.run_transfer(job, &uri, &file_uri(&path), size, cancel)
            .await?;

        if self.settings.verify_checksum {
            if let Some(expected) = job.disk.checksum.clone() {
                verify_checksum(&path, &expected).await?;
                log_debug!(job_id = %job.id, "Checksum verified");
            }
        }

        if let Some(grant) = job.access_grant.take() {
            let source = self.adapter(job.source_provider)?;
            if let Err(err) = source.revoke_access(&grant).await {
                log_warn!(job_id = %job.id, "Access revocation failed: {}", err);
            }
        }
        job.transition(JobState::Exported)
    }

    async fn convert(&self, job: &mut MigrationJob) -> Result<()> {
        let dest = self.adapter(job.dest_provider)?;
        let input = staging_path(job)?;
        let from = disk_format(job)?;
        let target = dest.preferred_import_format();

        let output = self.converter.convert(&input, from, target).await?;
        let size = tokio::fs::metadata(&output).await?.len();

        job.add_resource(ResourceHandle::local_file(&output));
        job.disk.staging_local_path = Some(output);
        job.disk.format = Some(target);
        job.disk.size_bytes = size;
        job.disk.checksum = None;
        job.transition(JobState::Converted)
    }

    async fn enter_uploading(&self, job: &mut MigrationJob, ctx: &StepContext) -> Result<()> {
        let dest = self.adapter(job.dest_provider)?;
        let format = disk_format(job)?;
        let object_name = format!("{}.{}", ctx.resource_name("disk"), format.extension());
        let staging = dest
            .prepare_staging(&object_name, job.disk.size_bytes, format, ctx)
            .await?;
        job.add_resource(staging.object);
        job.disk.dest_location_uri = Some(staging.upload_uri);
        job.transition(JobState::Uploading)
    }

    async fn upload_and_import(
        &self,
        job: &mut MigrationJob,
        ctx: &StepContext,
        cancel: &CancelFlag,
    ) -> Result<()> {
        let path = staging_path(job)?;
        let target = job
            .disk
            .dest_location_uri
            .clone()
            .ok_or_else(|| missing(job, "staging upload URI"))?;
        let size = job.disk.size_bytes;

        self.run_transfer(job, &file_uri(&path), &target, size, cancel)
            .await?;

        let dest = self.adapter(job.dest_provider)?;
        let vm = source_vm(job)?;
        let format = disk_format(job)?;
        let staging = job
            .latest_resource(ResourceOwner::Provider(job.dest_provider), ResourceKind::StagingObject)
            .cloned()
            .ok_or_else(|| missing(job, "staging object"))?;
        let image = dest.import(&staging, format, &vm, ctx).await?;
        job.add_resource(image);
        job.transition(JobState::Imported)
    }

    async fn run_transfer(
        &self,
        job: &mut MigrationJob,
        source_uri: &str,
        sink_uri: &str,
        size: u64,
        cancel: &CancelFlag,
    ) -> Result<()> {
        let offset = job.resume_offset.unwrap_or(0);
        let source = self
            .transports
            .source(source_uri)
            .map_err(|e| transport_failure(offset, e))?;
        let sink = self
            .transports
            .sink(sink_uri)
            .map_err(|e| transport_failure(offset, e))?;

        let checkpoint = JobCheckpoint {
            store: self.store.as_ref(),
            job: Mutex::new(job.clone()),
        };
        match transfer(
            source,
            sink,
            offset,
            Some(size),
            &self.settings.transfer,
            &checkpoint,
            cancel,
        )
        .await
        {
            Ok(total) => {
                job.set_resume_offset(total);
                Ok(())
            }
            Err(err) => {
                if let Some(done) = err.bytes_completed() {
                    job.set_resume_offset(done);
                }
                Err(err.into())
            }
        }
    }

    // ----- failure handling -------------------------------------------------

    async fn handle_failure(&self, mut job: MigrationJob, err: MigrationError) -> Result<JobSnapshot> {
        let kind = err.kind();
        let message = err.to_string();

        match kind {
            ErrorKind::Cancelled => {
                log_info!(job_id = %job.id, "Transfer stopped for cancellation");
                self.finish_abandon(&mut job).await?;
                return Ok(job.into());
            }
            ErrorKind::TransferFailed if job.state.is_transfer() => {
                // The job stays put; the next advance resumes from the offset.
                log_warn!(
                    job_id = %job.id,
                    resume_offset = ?job.resume_offset,
                    "Transfer interrupted: {}",
                    message
                );
                job.record_error(kind, message, true);
            }
            ErrorKind::IntegrityMismatch
                if job.integrity_failures < self.settings.max_integrity_retries =>
            {
                job.integrity_failures += 1;
                log_warn!(job_id = %job.id, "Integrity check failed, transfer will restart: {}", message);
                job.fail(kind, message, true);
                job.resume_offset = Some(0);
            }
            k if k.is_retryable() && k != ErrorKind::IntegrityMismatch => {
                log_warn!(job_id = %job.id, state = %job.state, "Step failed, retryable: {}", message);
                job.fail(kind, message, true);
            }
            _ => {
                log_error!(job_id = %job.id, state = %job.state, "Step failed permanently: {}", message);
                self.reconcile(&mut job, ReconcileMode::Discard).await;
                let left = job.unreconciled().count();
                if left > 0 {
                    log_warn!(job_id = %job.id, "{} resources left after cleanup", left);
                }
                job.fail(kind, message, false);
            }
        }

        self.store.save(&job).await?;
        Err(err)
    }

    async fn finish_abandon(&self, job: &mut MigrationJob) -> Result<()> {
        self.reconcile(job, ReconcileMode::Discard).await;
        let failures = job.unreconciled().count();
        job.abandon()?;
        self.store.save(job).await?;
        self.store.archive(job.id).await?;
        self.release(job).await;
        log_info!(
            job_id = %job.id,
            cleanup_failures = failures,
            "Migration of '{}' abandoned",
            job.vm_identifier
        );
        Ok(())
    }

    /// Delete (or keep) every unreconciled resource, newest first. A failed
    /// delete stays unreconciled and is recorded as a job warning.
    async fn reconcile(&self, job: &mut MigrationJob, mode: ReconcileMode) {
        if let Some(grant) = job.access_grant.take() {
            if let Ok(adapter) = self.adapter(grant.provider) {
                if let Err(err) = adapter.revoke_access(&grant).await {
                    log_warn!(job_id = %job.id, "Access revocation failed: {}", err);
                }
            }
        }

        let keep_all = job.options.keep_intermediate_resources;
        let dest = job.dest_provider;

        for index in (0..job.created_resources.len()).rev() {
            if job.created_resources[index].is_reconciled() {
                continue;
            }
            let handle = job.created_resources[index].handle.clone();
            let is_result = mode == ReconcileMode::Complete
                && handle.kind == ResourceKind::VirtualMachine
                && handle.owner == ResourceOwner::Provider(dest);

            if keep_all || is_result {
                job.created_resources[index].disposition = Disposition::Kept;
                continue;
            }

            job.created_resources[index].delete_attempts += 1;
            match self.delete(&handle).await {
                Ok(()) => {
                    log_debug!(job_id = %job.id, "Deleted {}", handle);
                    job.created_resources[index].disposition = Disposition::Deleted;
                }
                Err(message) => {
                    log_warn!(job_id = %job.id, "Could not delete {}: {}", handle, message);
                    job.warnings.push(format!("could not delete {}: {}", handle, message));
                    job.created_resources[index].disposition =
                        Disposition::DeleteFailed { message };
                }
            }
        }

        if !keep_all {
            let dir = self.settings.staging_dir.join(job.id.to_string());
            let _ = tokio::fs::remove_dir(&dir).await;
        }
    }

    async fn delete(&self, handle: &ResourceHandle) -> std::result::Result<(), String> {
        match handle.owner {
            ResourceOwner::Local => match tokio::fs::remove_file(&handle.id).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.to_string()),
            },
            ResourceOwner::Provider(kind) => {
                let adapter = self.adapter(kind).map_err(|e| e.to_string())?;
                adapter.delete_resource(handle).await.map_err(|e| e.to_string())
            }
        }
    }

    // ----- bookkeeping ------------------------------------------------------

    async fn load(&self, id: Uuid) -> Result<MigrationJob> {
        self.store
            .load(id)
            .await?
            .ok_or(MigrationError::JobNotFound(id))
    }

    /// Rebuild the persisted holders from the store. In-flight submissions
    /// live in `pending` and survive a reload.
    async fn ensure_locks_loaded(&self, locks: &mut LockTable) -> Result<()> {
        if locks.loaded {
            return Ok(());
        }
        locks.held.clear();
        for job in self.store.list(false).await? {
            if !job.state.is_terminal() {
                locks.held.insert(job.lock_key(), job.id);
            }
        }
        locks.loaded = true;
        Ok(())
    }

    async fn release(&self, job: &MigrationJob) {
        let mut locks = self.locks.lock().await;
        let key = job.lock_key();
        if locks.held.get(&key) == Some(&job.id) {
            locks.held.remove(&key);
        }
        drop(locks);
        self.forget(job.id).await;
    }

    /// Load a job while holding its lock. Unknown and finished jobs have
    /// their per-job entries dropped so repeated calls do not leak them.
    async fn load_locked(&self, id: Uuid) -> Result<MigrationJob> {
        let job = self.load(id).await;
        if !matches!(&job, Ok(job) if !job.state.is_terminal()) {
            self.forget(id).await;
        }
        job
    }

    async fn forget(&self, id: Uuid) {
        self.cancels.lock().await.remove(&id);
        self.job_locks.lock().await.remove(&id);
    }

    async fn job_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.job_locks
            .lock()
            .await
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn cancel_flag(&self, id: Uuid) -> CancelFlag {
        self.cancels.lock().await.entry(id).or_default().clone()
    }
}

fn submission_error(err: ProviderError) -> MigrationError {
    match err.kind() {
        ErrorKind::Transient | ErrorKind::Timeout => MigrationError::ProviderUnreachable(err.to_string()),
        ErrorKind::InvalidIdentifier => MigrationError::InvalidIdentifier(err.to_string()),
        _ => MigrationError::Provider(err),
    }
}

fn transport_failure(offset: u64, source: crate::transport::TransportError) -> MigrationError {
    TransferError::Transport {
        bytes_completed: offset,
        source,
    }
    .into()
}

fn missing(job: &MigrationJob, what: &'static str) -> MigrationError {
    log_error!(job_id = %job.id, state = %job.state, "Job record has no {}", what);
    MigrationError::InvalidState {
        job_id: job.id,
        state: job.state,
        action: what,
    }
}

fn source_vm(job: &MigrationJob) -> Result<VmDescriptor> {
    job.source_vm.clone().ok_or_else(|| missing(job, "source VM"))
}

fn staging_path(job: &MigrationJob) -> Result<PathBuf> {
    job.disk
        .staging_local_path
        .clone()
        .ok_or_else(|| missing(job, "staging path"))
}

fn disk_format(job: &MigrationJob) -> Result<crate::job::DiskFormat> {
    job.disk.format.ok_or_else(|| missing(job, "disk format"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::QemuImg;
    use crate::job::{AttachedDisk, OsHint, PowerState};
    use crate::store::MemoryJobStore;
    use crate::transport::DefaultTransports;
    use std::time::Duration;

    fn orchestrator(store: Arc<dyn JobStore>) -> Orchestrator {
        let settings = OrchestratorSettings {
            staging_dir: std::env::temp_dir().join("cloudhop-orchestrator-tests"),
            transfer: TransferPolicy::default(),
            verify_checksum: true,
            max_integrity_retries: 2,
            max_step_retries: 3,
        };
        Orchestrator::new(
            store,
            Arc::new(DefaultTransports::new()),
            Arc::new(QemuImg::new("qemu-img", Duration::from_secs(5))),
            settings,
        )
    }

    fn job() -> MigrationJob {
        MigrationJob::new(
            ProviderKind::Azure,
            ProviderKind::Gcp,
            "db-01".to_string(),
            JobOptions::default(),
            VmDescriptor {
                id: "vm-7".to_string(),
                name: "db-01".to_string(),
                location: "westeurope".to_string(),
                power_state: PowerState::Stopped,
                os_hint: OsHint::Linux,
                instance_size: None,
                disks: vec![AttachedDisk {
                    id: "disk-7".to_string(),
                    size_bytes: 4096,
                    boot: true,
                }],
            },
        )
    }

    #[tokio::test]
    async fn abandon_drops_per_job_entries() {
        let store = Arc::new(MemoryJobStore::new());
        let orchestrator = orchestrator(store.clone());
        let job = job();
        store.save(&job).await.unwrap();

        // No adapters are registered, so the first step fails for good.
        let err = orchestrator.advance(job.id).await.unwrap_err();
        assert!(!err.kind().is_retryable());
        assert_eq!(orchestrator.job_locks.lock().await.len(), 1);

        let snapshot = orchestrator.abandon(job.id).await.unwrap();
        assert_eq!(snapshot.state(), JobState::Abandoned);
        assert!(orchestrator.job_locks.lock().await.is_empty());
        assert!(orchestrator.cancels.lock().await.is_empty());

        // Touching a finished or unknown job does not bring them back.
        orchestrator.abandon(job.id).await.unwrap();
        orchestrator.advance(job.id).await.unwrap();
        assert!(orchestrator.advance(Uuid::new_v4()).await.is_err());
        assert!(orchestrator.job_locks.lock().await.is_empty());
        assert!(orchestrator.cancels.lock().await.is_empty());
    }
}
