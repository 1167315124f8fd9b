// Shared fixtures for the integration tests: an in-memory cloud behind the
// CloudApi boundary, a copying converter and a transport that faults once.
#![allow(dead_code)]

use async_trait::async_trait;
use cloudhop::codec::{CodecError, DiskConverter, converted_path};
use cloudhop::job::{
    AccessGrant, AttachedDisk, DiskFormat, OsHint, PowerState, ProviderKind, ResourceHandle,
    VmDescriptor,
};
use cloudhop::orchestrator::{Orchestrator, OrchestratorSettings};
use cloudhop::poller::{CallRetryPolicy, OperationStatus, PollPolicy};
use cloudhop::provider::{
    AdapterSettings, CloudApi, OperationHandle, OperationOutput, OperationRequest, ProviderError,
    adapter_for,
};
use cloudhop::store::JobStore;
use cloudhop::transfer::TransferPolicy;
use cloudhop::transport::{
    ChunkSink, ChunkSource, DefaultTransports, TransportError, Transports, file_uri,
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const REGIONS: [&str; 2] = ["region-a", "region-b"];

pub fn fast_poll() -> PollPolicy {
    PollPolicy {
        interval: Duration::from_millis(1),
        max_interval: Duration::from_millis(4),
        multiplier: 2.0,
        timeout: Duration::from_millis(300),
    }
}

pub fn fast_transfer(chunk_size: u64, workers: usize) -> TransferPolicy {
    TransferPolicy {
        chunk_size,
        workers,
        max_retries: 0,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        chunk_timeout: Duration::from_secs(10),
    }
}

pub fn adapter_settings() -> AdapterSettings {
    AdapterSettings {
        regions: REGIONS.iter().map(|r| r.to_string()).collect(),
        target_location: None,
        staging_bucket: Some("staging".to_string()),
        instance_size: Some("medium".to_string()),
        poll: fast_poll(),
        call_retry: CallRetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        },
        grant_duration: Duration::from_secs(600),
    }
}

/// Deterministic disk content so copies can be compared byte for byte.
pub fn disk_bytes(size: u64) -> Vec<u8> {
    (0..size).map(|i| ((i * 31 + 7) % 251) as u8).collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

fn request_kind(request: &OperationRequest) -> &'static str {
    match request {
        OperationRequest::StopVm { .. } => "stop_vm",
        OperationRequest::CreateSnapshot { .. } => "create_snapshot",
        OperationRequest::CreateImage { .. } => "create_image",
        OperationRequest::GrantAccess { .. } => "grant_access",
        OperationRequest::ExportImage { .. } => "export_image",
        OperationRequest::PrepareStaging { .. } => "prepare_staging",
        OperationRequest::ImportImage { .. } => "import_image",
        OperationRequest::CreateVm { .. } => "create_vm",
    }
}

struct SimOperation {
    kind: &'static str,
    polls_left: u32,
    outcome: OperationStatus<OperationOutput>,
}

#[derive(Default)]
struct SimState {
    vms: Vec<VmDescriptor>,
    operations: HashMap<String, SimOperation>,
    tokens: HashMap<String, String>,
    requests: Vec<OperationRequest>,
    delete_calls: Vec<ResourceHandle>,
    revoked: Vec<AccessGrant>,
    imported: Vec<ImportRecord>,
    fail_kind: Option<&'static str>,
    stall_kind: Option<&'static str>,
    fail_deletes: bool,
    flaky_starts: HashMap<&'static str, u32>,
    flaky_describes: u32,
    corrupt_checksums: bool,
    describe_gate: Option<Arc<tokio::sync::Notify>>,
    gated_describes: u32,
    next_id: u32,
}

/// What the destination saw when an image was imported.
#[derive(Debug, Clone)]
pub struct ImportRecord {
    pub object: String,
    pub format: DiskFormat,
    pub size: u64,
    pub sha256: String,
}

/// A cloud that keeps everything in memory and serves exports from a
/// directory. Operations succeed after `pending_polls` status queries.
pub struct SimulatedCloud {
    kind: ProviderKind,
    root: PathBuf,
    disk_size: u64,
    pending_polls: u32,
    state: Mutex<SimState>,
}

impl SimulatedCloud {
    pub fn new(kind: ProviderKind, root: &Path, disk_size: u64) -> Arc<Self> {
        std::fs::create_dir_all(root.join("exports")).unwrap();
        std::fs::create_dir_all(root.join("staging")).unwrap();
        Arc::new(Self {
            kind,
            root: root.to_path_buf(),
            disk_size,
            pending_polls: 2,
            state: Mutex::new(SimState::default()),
        })
    }

    pub fn add_vm(&self, location: &str, id: &str, name: &str) {
        self.state.lock().unwrap().vms.push(VmDescriptor {
            id: id.to_string(),
            name: name.to_string(),
            location: location.to_string(),
            power_state: PowerState::Running,
            os_hint: OsHint::Linux,
            instance_size: Some("medium".to_string()),
            disks: vec![AttachedDisk {
                id: format!("{}-root", id),
                size_bytes: self.disk_size,
                boot: true,
            }],
        });
    }

    /// Operations of this kind finish with a provider-side failure.
    pub fn fail_operations(&self, kind: Option<&'static str>) {
        self.state.lock().unwrap().fail_kind = kind;
    }

    /// Operations of this kind never leave `Pending` while set.
    pub fn stall_operations(&self, kind: Option<&'static str>) {
        self.state.lock().unwrap().stall_kind = kind;
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.state.lock().unwrap().fail_deletes = fail;
    }

    /// The next `times` attempts to start an operation of this kind are
    /// refused with a transient error before reaching the provider.
    pub fn flaky_starts(&self, kind: &'static str, times: u32) {
        self.state.lock().unwrap().flaky_starts.insert(kind, times);
    }

    /// The next `times` VM lookups fail with a transient error.
    pub fn flaky_describes(&self, times: u32) {
        self.state.lock().unwrap().flaky_describes = times;
    }

    /// Exports publish a checksum that does not match their content.
    pub fn corrupt_checksums(&self, corrupt: bool) {
        self.state.lock().unwrap().corrupt_checksums = corrupt;
    }

    /// VM lookups wait on `gate` while it is set.
    pub fn gate_describes(&self, gate: Option<Arc<tokio::sync::Notify>>) {
        self.state.lock().unwrap().describe_gate = gate;
    }

    /// Lookups that have reached the gate.
    pub fn gated_describes(&self) -> u32 {
        self.state.lock().unwrap().gated_describes
    }

    pub fn power_state(&self, id: &str) -> Option<PowerState> {
        let state = self.state.lock().unwrap();
        state.vms.iter().find(|vm| vm.id == id).map(|vm| vm.power_state)
    }

    pub fn requests(&self) -> Vec<OperationRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn requests_of(&self, kind: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.requests.iter().filter(|r| request_kind(r) == kind).count()
    }

    pub fn delete_calls(&self) -> Vec<ResourceHandle> {
        self.state.lock().unwrap().delete_calls.clone()
    }

    pub fn imported(&self) -> Vec<ImportRecord> {
        self.state.lock().unwrap().imported.clone()
    }

    pub fn export_path(&self, image_id: &str, format: DiskFormat) -> PathBuf {
        self.root
            .join("exports")
            .join(format!("{}.{}", image_id, format.extension()))
    }

    fn staging_path(&self, object: &str) -> PathBuf {
        self.root.join("staging").join(object)
    }

    fn next_id(&self, prefix: &str) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        format!("{}-{}", prefix, state.next_id)
    }

    fn execute(&self, request: &OperationRequest) -> OperationStatus<OperationOutput> {
        let output = match request {
            OperationRequest::StopVm { vm_id, .. } => {
                let mut state = self.state.lock().unwrap();
                if let Some(vm) = state.vms.iter_mut().find(|vm| &vm.id == vm_id) {
                    vm.power_state = PowerState::Stopped;
                }
                OperationOutput::default()
            }
            OperationRequest::CreateSnapshot { .. } => OperationOutput {
                resource_id: Some(self.next_id("snap")),
                ..OperationOutput::default()
            },
            OperationRequest::CreateImage { .. } => OperationOutput {
                resource_id: Some(self.next_id("img")),
                ..OperationOutput::default()
            },
            OperationRequest::GrantAccess { disk_id, .. } => {
                let path = self.export_path(disk_id, DiskFormat::Vhd);
                let data = disk_bytes(self.disk_size);
                std::fs::write(&path, &data).unwrap();
                OperationOutput {
                    resource_id: Some(disk_id.clone()),
                    uri: Some(file_uri(&path)),
                    size_bytes: Some(self.disk_size),
                    ..OperationOutput::default()
                }
            }
            OperationRequest::ExportImage {
                image_id, format, ..
            } => {
                let path = self.export_path(image_id, *format);
                let data = disk_bytes(self.disk_size);
                std::fs::write(&path, &data).unwrap();
                let checksum = if self.state.lock().unwrap().corrupt_checksums {
                    sha256_hex(b"some other disk")
                } else {
                    sha256_hex(&data)
                };
                OperationOutput {
                    resource_id: Some(self.next_id("export")),
                    uri: Some(file_uri(&path)),
                    size_bytes: Some(self.disk_size),
                    checksum: Some(checksum),
                    ..OperationOutput::default()
                }
            }
            OperationRequest::PrepareStaging { object_name, .. } => OperationOutput {
                resource_id: Some(object_name.clone()),
                uri: Some(file_uri(&self.staging_path(object_name))),
                ..OperationOutput::default()
            },
            OperationRequest::ImportImage {
                staging_object,
                format,
                ..
            } => {
                let data = match std::fs::read(self.staging_path(staging_object)) {
                    Ok(data) => data,
                    Err(e) => {
                        return OperationStatus::Failed {
                            message: format!("staging object unreadable: {}", e),
                        };
                    }
                };
                self.state.lock().unwrap().imported.push(ImportRecord {
                    object: staging_object.clone(),
                    format: *format,
                    size: data.len() as u64,
                    sha256: sha256_hex(&data),
                });
                OperationOutput {
                    resource_id: Some(self.next_id("imported")),
                    ..OperationOutput::default()
                }
            }
            OperationRequest::CreateVm { .. } => OperationOutput {
                resource_id: Some(self.next_id("vm")),
                ..OperationOutput::default()
            },
        };
        OperationStatus::Succeeded(output)
    }
}

#[async_trait]
impl CloudApi for SimulatedCloud {
    async fn list_locations(&self) -> Result<Vec<String>, ProviderError> {
        Ok(REGIONS.iter().map(|r| r.to_string()).collect())
    }

    async fn describe_vm(
        &self,
        location: &str,
        vm_identifier: &str,
    ) -> Result<Option<VmDescriptor>, ProviderError> {
        let gate = {
            let mut state = self.state.lock().unwrap();
            if state.flaky_describes > 0 {
                state.flaky_describes -= 1;
                return Err(ProviderError::Transient("describe timed out".to_string()));
            }
            if state.describe_gate.is_some() {
                state.gated_describes += 1;
            }
            state.describe_gate.clone()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let state = self.state.lock().unwrap();
        Ok(state
            .vms
            .iter()
            .find(|vm| vm.location == location && (vm.id == vm_identifier || vm.name == vm_identifier))
            .cloned())
    }

    async fn start_operation(
        &self,
        request: &OperationRequest,
        idempotency_token: &str,
    ) -> Result<OperationHandle, ProviderError> {
        let kind = request_kind(request);
        {
            let mut state = self.state.lock().unwrap();
            if let Some(left) = state.flaky_starts.get_mut(kind) {
                if *left > 0 {
                    *left -= 1;
                    return Err(ProviderError::Transient("connection reset by peer".to_string()));
                }
            }
        }

        let existing = self
            .state
            .lock()
            .unwrap()
            .tokens
            .get(idempotency_token)
            .cloned();
        if let Some(id) = existing {
            return Ok(OperationHandle {
                id,
                provider: self.kind,
            });
        }

        let fail = self.state.lock().unwrap().fail_kind == Some(kind);
        let outcome = if fail {
            OperationStatus::Failed {
                message: format!("{} rejected by provider", kind),
            }
        } else {
            self.execute(request)
        };

        let id = self.next_id("op");
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());
        state.tokens.insert(idempotency_token.to_string(), id.clone());
        state.operations.insert(
            id.clone(),
            SimOperation {
                kind,
                polls_left: self.pending_polls,
                outcome,
            },
        );
        Ok(OperationHandle {
            id,
            provider: self.kind,
        })
    }

    async fn operation_status(
        &self,
        handle: &OperationHandle,
    ) -> Result<OperationStatus<OperationOutput>, ProviderError> {
        let mut state = self.state.lock().unwrap();
        let stall = state.stall_kind;
        let operation = state
            .operations
            .get_mut(&handle.id)
            .ok_or_else(|| ProviderError::NotFound(handle.id.clone()))?;
        if stall == Some(operation.kind) {
            return Ok(OperationStatus::Pending { progress: None });
        }
        if operation.polls_left > 0 {
            operation.polls_left -= 1;
            return Ok(OperationStatus::Pending {
                progress: Some(50),
            });
        }
        Ok(operation.outcome.clone())
    }

    async fn delete_resource(&self, resource: &ResourceHandle) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.delete_calls.push(resource.clone());
        if state.fail_deletes {
            return Err(ProviderError::Transient(format!("cannot delete {}", resource.id)));
        }
        Ok(())
    }

    async fn revoke_access(&self, grant: &AccessGrant) -> Result<(), ProviderError> {
        self.state.lock().unwrap().revoked.push(grant.clone());
        Ok(())
    }
}

/// Converter that copies the input to the path `qemu-img` would have written.
#[derive(Default)]
pub struct CopyConverter {
    pub calls: AtomicU32,
}

#[async_trait]
impl DiskConverter for CopyConverter {
    async fn convert(
        &self,
        input: &Path,
        _source_format: DiskFormat,
        target: DiskFormat,
    ) -> Result<PathBuf, CodecError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let output = converted_path(input, target);
        tokio::fs::copy(input, &output).await?;
        Ok(output)
    }
}

/// Source wrapper that delivers bytes up to `fail_at` and then faults, once.
pub struct FaultySource {
    inner: Arc<dyn ChunkSource>,
    fail_at: u64,
    armed: Arc<AtomicBool>,
}

impl FaultySource {
    pub fn new(inner: Arc<dyn ChunkSource>, fail_at: u64, armed: Arc<AtomicBool>) -> Self {
        Self {
            inner,
            fail_at,
            armed,
        }
    }
}

#[async_trait]
impl ChunkSource for FaultySource {
    async fn size(&self) -> Result<u64, TransportError> {
        self.inner.size().await
    }

    async fn read_range(&self, offset: u64, len: u64, buf: &mut Vec<u8>) -> Result<(), TransportError> {
        let hits = offset <= self.fail_at && self.fail_at < offset + len;
        if hits && self.armed.swap(false, Ordering::SeqCst) {
            if self.fail_at > offset {
                self.inner.read_range(offset, self.fail_at - offset, buf).await?;
            }
            return Err(TransportError::Transient(format!(
                "connection reset at byte {}",
                self.fail_at
            )));
        }
        self.inner.read_range(offset, len, buf).await
    }

    fn describe(&self) -> String {
        format!("faulty({})", self.inner.describe())
    }
}

/// Default transports, except the first read crossing `fail_at` faults.
/// With a pattern, only sources whose URI contains it are affected.
pub struct FaultyTransports {
    inner: DefaultTransports,
    fail_at: u64,
    armed: Arc<AtomicBool>,
    pattern: Option<String>,
}

impl FaultyTransports {
    pub fn new(fail_at: u64) -> Self {
        Self {
            inner: DefaultTransports::new(),
            fail_at,
            armed: Arc::new(AtomicBool::new(true)),
            pattern: None,
        }
    }

    pub fn matching(fail_at: u64, pattern: impl Into<String>) -> Self {
        Self {
            pattern: Some(pattern.into()),
            ..Self::new(fail_at)
        }
    }

    pub fn fired(&self) -> bool {
        !self.armed.load(Ordering::SeqCst)
    }
}

impl Transports for FaultyTransports {
    fn source(&self, uri: &str) -> Result<Arc<dyn ChunkSource>, TransportError> {
        let inner = self.inner.source(uri)?;
        if let Some(pattern) = &self.pattern {
            if !uri.contains(pattern.as_str()) {
                return Ok(inner);
            }
        }
        Ok(Arc::new(FaultySource::new(inner, self.fail_at, self.armed.clone())))
    }

    fn sink(&self, uri: &str) -> Result<Arc<dyn ChunkSink>, TransportError> {
        self.inner.sink(uri)
    }
}

/// Two simulated clouds wired into an orchestrator.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub source: Arc<SimulatedCloud>,
    pub dest: Arc<SimulatedCloud>,
    pub converter: Arc<CopyConverter>,
    pub source_kind: ProviderKind,
    pub dest_kind: ProviderKind,
    pub disk_size: u64,
}

impl Harness {
    pub fn new(source_kind: ProviderKind, dest_kind: ProviderKind, disk_size: u64) -> Self {
        let dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let source = SimulatedCloud::new(source_kind, &dir.path().join("source-cloud"), disk_size);
        let dest = SimulatedCloud::new(dest_kind, &dir.path().join("dest-cloud"), disk_size);
        source.add_vm("region-b", "vm-100", "web-01");
        Self {
            dir,
            source,
            dest,
            converter: Arc::new(CopyConverter::default()),
            source_kind,
            dest_kind,
            disk_size,
        }
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.dir.path().join("staging")
    }

    pub fn settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            staging_dir: self.staging_dir(),
            transfer: fast_transfer(64 * 1024, 2),
            verify_checksum: true,
            max_integrity_retries: 2,
            max_step_retries: 3,
        }
    }

    pub fn orchestrator(&self, store: Arc<dyn JobStore>) -> Orchestrator {
        self.orchestrator_with(store, Arc::new(DefaultTransports::new()))
    }

    pub fn orchestrator_with(
        &self,
        store: Arc<dyn JobStore>,
        transports: Arc<dyn Transports>,
    ) -> Orchestrator {
        let converter: Arc<dyn DiskConverter> = self.converter.clone();
        let source_api: Arc<dyn CloudApi> = self.source.clone();
        let dest_api: Arc<dyn CloudApi> = self.dest.clone();
        Orchestrator::new(store, transports, converter, self.settings())
            .with_adapter(adapter_for(self.source_kind, source_api, adapter_settings()))
            .with_adapter(adapter_for(self.dest_kind, dest_api, adapter_settings()))
    }
}
