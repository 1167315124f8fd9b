use crate::error::{ErrorKind, MigrationError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Aws,
    Azure,
    Gcp,
    Huawei,
    OpenStack,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 5] = [
        ProviderKind::Aws,
        ProviderKind::Azure,
        ProviderKind::Gcp,
        ProviderKind::Huawei,
        ProviderKind::OpenStack,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Aws => "aws",
            ProviderKind::Azure => "azure",
            ProviderKind::Gcp => "gcp",
            ProviderKind::Huawei => "huawei",
            ProviderKind::OpenStack => "openstack",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aws" | "amazon" => Ok(ProviderKind::Aws),
            "azure" | "microsoft" => Ok(ProviderKind::Azure),
            "gcp" | "google" => Ok(ProviderKind::Gcp),
            "huawei" => Ok(ProviderKind::Huawei),
            "openstack" | "cyso" => Ok(ProviderKind::OpenStack),
            other => Err(format!("unknown provider '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Qcow2,
    Vmdk,
    Vhd,
    Raw,
    Zvhd,
}

impl DiskFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Vmdk => "vmdk",
            DiskFormat::Vhd => "vhd",
            DiskFormat::Raw => "raw",
            DiskFormat::Zvhd => "zvhd",
        }
    }

    /// Format name understood by `qemu-img`. `None` for vendor-only formats.
    pub fn qemu_format(&self) -> Option<&'static str> {
        match self {
            DiskFormat::Qcow2 => Some("qcow2"),
            DiskFormat::Vmdk => Some("vmdk"),
            DiskFormat::Vhd => Some("vpc"),
            DiskFormat::Raw => Some("raw"),
            DiskFormat::Zvhd => None,
        }
    }

    pub fn from_qemu_format(name: &str) -> Option<Self> {
        match name {
            "qcow2" => Some(DiskFormat::Qcow2),
            "vmdk" => Some(DiskFormat::Vmdk),
            "vpc" => Some(DiskFormat::Vhd),
            "raw" => Some(DiskFormat::Raw),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiskFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "qcow2" => Ok(DiskFormat::Qcow2),
            "vmdk" => Ok(DiskFormat::Vmdk),
            "vhd" | "vpc" => Ok(DiskFormat::Vhd),
            "raw" | "img" => Ok(DiskFormat::Raw),
            "zvhd" => Ok(DiskFormat::Zvhd),
            other => Err(format!("unknown disk format '{}'", other)),
        }
    }
}

/// Lifecycle of a migration job.
///
/// `Launched` means the destination VM exists; `Completed` is entered once the
/// intermediate resources have been reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Discovered,
    PoweredOff,
    Snapshotted,
    Exporting,
    Exported,
    Converting,
    Converted,
    Uploading,
    Imported,
    Launched,
    Completed,
    Failed,
    Abandoned,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Abandoned)
    }

    pub fn is_transfer(&self) -> bool {
        matches!(self, JobState::Exporting | JobState::Uploading)
    }

    /// Forward edges of the state machine. `Failed -> retry target` is not
    /// listed here; it is validated against the recorded retry state.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Discovered, PoweredOff)
            | (PoweredOff, Snapshotted)
            | (Snapshotted, Exporting)
            | (Exporting, Exported)
            | (Exported, Converting)
            | (Exported, Uploading)
            | (Converting, Converted)
            | (Converted, Uploading)
            | (Uploading, Imported)
            | (Imported, Launched)
            | (Launched, Completed) => true,
            (Failed, Abandoned) => true,
            (from, Failed) | (from, Abandoned) => !from.is_terminal() && *from != Failed,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    Running,
    Stopping,
    Stopped,
    Deallocated,
    Unknown,
}

impl PowerState {
    pub fn is_off(&self) -> bool {
        matches!(self, PowerState::Stopped | PowerState::Deallocated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OsHint {
    Linux,
    Windows,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedDisk {
    pub id: String,
    pub size_bytes: u64,
    pub boot: bool,
}

/// What `locate` learned about the source VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmDescriptor {
    pub id: String,
    pub name: String,
    /// Region or zone the VM was found in.
    pub location: String,
    pub power_state: PowerState,
    pub os_hint: OsHint,
    pub instance_size: Option<String>,
    pub disks: Vec<AttachedDisk>,
}

impl VmDescriptor {
    pub fn boot_disk(&self) -> Option<&AttachedDisk> {
        self.disks.iter().find(|d| d.boot).or_else(|| self.disks.first())
    }

    pub fn boot_disk_size(&self) -> u64 {
        self.boot_disk().map(|d| d.size_bytes).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskDescriptor {
    pub format: Option<DiskFormat>,
    pub size_bytes: u64,
    /// Hex SHA-256 when the provider exposes one; size is always checked.
    pub checksum: Option<String>,
    pub source_location_uri: Option<String>,
    pub staging_local_path: Option<PathBuf>,
    pub dest_location_uri: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceOwner {
    Provider(ProviderKind),
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Snapshot,
    Image,
    ExportedObject,
    StagingObject,
    VirtualMachine,
    LocalFile,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceHandle {
    pub owner: ResourceOwner,
    pub kind: ResourceKind,
    pub id: String,
    pub location: Option<String>,
}

impl ResourceHandle {
    pub fn cloud(
        provider: ProviderKind,
        kind: ResourceKind,
        id: impl Into<String>,
        location: Option<String>,
    ) -> Self {
        Self {
            owner: ResourceOwner::Provider(provider),
            kind,
            id: id.into(),
            location,
        }
    }

    pub fn local_file(path: &std::path::Path) -> Self {
        Self {
            owner: ResourceOwner::Local,
            kind: ResourceKind::LocalFile,
            id: path.to_string_lossy().into_owned(),
            location: None,
        }
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let owner = match self.owner {
            ResourceOwner::Provider(p) => p.as_str(),
            ResourceOwner::Local => "local",
        };
        write!(f, "{}:{:?}:{}", owner, self.kind, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Disposition {
    Pending,
    Deleted,
    Kept,
    DeleteFailed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedResource {
    pub handle: ResourceHandle,
    pub created_at: DateTime<Utc>,
    pub disposition: Disposition,
    /// Number of delete calls issued for this resource.
    #[serde(default)]
    pub delete_attempts: u32,
}

impl CreatedResource {
    pub fn is_reconciled(&self) -> bool {
        matches!(self.disposition, Disposition::Deleted | Disposition::Kept)
    }
}

/// Time-boxed read grant handed out by an export (e.g. an Azure SAS URL).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub provider: ProviderKind,
    pub resource_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
    pub retryable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Overrides the format reported by the source export.
    #[serde(default)]
    pub force_format: Option<DiskFormat>,
    /// Skip reconciliation so resources can be inspected.
    #[serde(default)]
    pub keep_intermediate_resources: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTimestamps {
    pub created: DateTime<Utc>,
    pub state_entered: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationJob {
    pub id: Uuid,
    pub source_provider: ProviderKind,
    pub dest_provider: ProviderKind,
    pub vm_identifier: String,
    pub state: JobState,
    #[serde(default)]
    pub options: JobOptions,
    pub source_vm: Option<VmDescriptor>,
    pub disk: DiskDescriptor,
    pub resume_offset: Option<u64>,
    #[serde(default)]
    pub created_resources: Vec<CreatedResource>,
    pub access_grant: Option<AccessGrant>,
    pub last_error: Option<JobError>,
    /// State re-entered by `retry` when the job is `Failed`.
    pub retry_state: Option<JobState>,
    #[serde(default)]
    pub integrity_failures: u32,
    /// `retry` calls spent on the current step; reset on every forward edge.
    #[serde(default)]
    pub retry_attempts: u32,
    /// States visited, in order. Lets operators audit the path a job took.
    #[serde(default)]
    pub history: Vec<JobState>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub timestamps: JobTimestamps,
}

impl MigrationJob {
    pub fn new(
        source_provider: ProviderKind,
        dest_provider: ProviderKind,
        vm_identifier: String,
        options: JobOptions,
        source_vm: VmDescriptor,
    ) -> Self {
        let now = Utc::now();
        let disk = DiskDescriptor {
            size_bytes: source_vm.boot_disk_size(),
            ..DiskDescriptor::default()
        };
        Self {
            id: Uuid::new_v4(),
            source_provider,
            dest_provider,
            vm_identifier,
            state: JobState::Discovered,
            options,
            source_vm: Some(source_vm),
            disk,
            resume_offset: None,
            created_resources: Vec::new(),
            access_grant: None,
            last_error: None,
            retry_state: None,
            integrity_failures: 0,
            retry_attempts: 0,
            history: vec![JobState::Discovered],
            warnings: Vec::new(),
            timestamps: JobTimestamps {
                created: now,
                state_entered: now,
                updated: now,
            },
        }
    }

    pub fn lock_key(&self) -> (String, ProviderKind) {
        (self.vm_identifier.clone(), self.source_provider)
    }

    /// Move along a forward edge. Leaving a transfer state clears the resume offset.
    pub fn transition(&mut self, next: JobState) -> Result<(), MigrationError> {
        if !self.state.can_transition_to(next) {
            return Err(MigrationError::InvalidState {
                job_id: self.id,
                state: self.state,
                action: "transition",
            });
        }
        self.retry_attempts = 0;
        self.enter(next);
        Ok(())
    }

    fn enter(&mut self, next: JobState) {
        if next.is_transfer() {
            self.resume_offset = Some(0);
        } else {
            self.resume_offset = None;
        }
        let now = Utc::now();
        self.state = next;
        self.history.push(next);
        self.timestamps.state_entered = now;
        self.timestamps.updated = now;
    }

    pub fn record_error(&mut self, kind: ErrorKind, message: impl Into<String>, retryable: bool) {
        let now = Utc::now();
        self.last_error = Some(JobError {
            kind,
            message: message.into(),
            at: now,
            retryable,
        });
        self.timestamps.updated = now;
    }

    /// Enter `Failed`, remembering where a retry should resume.
    pub fn fail(&mut self, kind: ErrorKind, message: impl Into<String>, retryable: bool) {
        if self.state.is_terminal() || self.state == JobState::Failed {
            self.record_error(kind, message, retryable);
            return;
        }
        let from = self.state;
        let offset = self.resume_offset;
        self.record_error(kind, message, retryable);
        self.retry_state = if retryable { Some(from) } else { None };
        self.enter(JobState::Failed);
        // Kept so a retried transfer resumes instead of restarting.
        if retryable && from.is_transfer() {
            self.resume_offset = offset;
        }
    }

    /// Take the `Failed -> retry target` edge, at most `max_attempts` times per step.
    pub fn resume_from_failure(&mut self, max_attempts: u32) -> Result<JobState, MigrationError> {
        if self.state != JobState::Failed {
            return Err(MigrationError::InvalidState {
                job_id: self.id,
                state: self.state,
                action: "retry",
            });
        }
        let target = match (&self.last_error, self.retry_state) {
            (Some(err), Some(target)) if err.retryable => target,
            _ => return Err(MigrationError::NotRetryable(self.id)),
        };
        if self.retry_attempts >= max_attempts {
            return Err(MigrationError::RetriesExhausted {
                job_id: self.id,
                state: target,
                attempts: self.retry_attempts,
            });
        }
        self.retry_attempts += 1;
        let offset = self.resume_offset;
        self.enter(target);
        if target.is_transfer() {
            self.resume_offset = Some(offset.unwrap_or(0));
        }
        self.retry_state = None;
        Ok(target)
    }

    /// Turn a retryable failure into a final one.
    pub fn give_up(&mut self) {
        if let Some(error) = &mut self.last_error {
            error.retryable = false;
        }
        self.retry_state = None;
        self.resume_offset = None;
        self.timestamps.updated = Utc::now();
    }

    pub fn abandon(&mut self) -> Result<(), MigrationError> {
        if !self.state.can_transition_to(JobState::Abandoned) {
            return Err(MigrationError::InvalidState {
                job_id: self.id,
                state: self.state,
                action: "abandon",
            });
        }
        self.retry_state = None;
        self.enter(JobState::Abandoned);
        Ok(())
    }

    pub fn set_resume_offset(&mut self, offset: u64) {
        if self.state.is_transfer() {
            self.resume_offset = Some(offset);
            self.timestamps.updated = Utc::now();
        }
    }

    pub fn add_resource(&mut self, handle: ResourceHandle) {
        // Idempotent re-runs of a step must not record the same resource twice.
        if self.created_resources.iter().any(|r| r.handle == handle) {
            return;
        }
        self.created_resources.push(CreatedResource {
            handle,
            created_at: Utc::now(),
            disposition: Disposition::Pending,
            delete_attempts: 0,
        });
        self.timestamps.updated = Utc::now();
    }

    /// Most recently recorded resource of the given kind for an owner.
    pub fn latest_resource(&self, owner: ResourceOwner, kind: ResourceKind) -> Option<&ResourceHandle> {
        self.created_resources
            .iter()
            .rev()
            .map(|r| &r.handle)
            .find(|h| h.owner == owner && h.kind == kind)
    }

    pub fn unreconciled(&self) -> impl Iterator<Item = &CreatedResource> {
        self.created_resources.iter().filter(|r| !r.is_reconciled())
    }

    /// Share of the current transfer that is durable. A failed transfer
    /// keeps reporting the progress a retry resumes from.
    pub fn progress_percent(&self) -> f32 {
        let transferring = match self.state {
            JobState::Completed => return 100.0,
            JobState::Failed => self.retry_state.is_some_and(|s| s.is_transfer()),
            state => state.is_transfer(),
        };
        match (transferring, self.resume_offset, self.disk.size_bytes) {
            (true, Some(offset), size) if size > 0 => {
                ((offset as f64 / size as f64) * 100.0).min(100.0) as f32
            }
            _ => 0.0,
        }
    }
}
