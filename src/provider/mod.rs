//! Provider adapter abstraction.
//!
//! Every cloud implements [`ProviderAdapter`] on top of a [`CloudApi`], the
//! black-box boundary that wraps the vendor SDK. Adapters own the
//! provider-specific sequencing; long-running operations go through the
//! shared poller.

pub mod aws;
pub mod azure;
pub mod gateway;
pub mod gcp;
pub mod huawei;
pub mod openstack;

use crate::error::ErrorKind;
use crate::job::{
    AccessGrant, DiskFormat, OsHint, PowerState, ProviderKind, ResourceHandle, ResourceKind,
    VmDescriptor,
};
use crate::poller::{
    CallRetryPolicy, OperationStatus, PollError, PollPolicy, await_completion, retry_transient,
};
use crate::{log_debug, log_info, log_warn};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub use aws::AwsAdapter;
pub use azure::AzureAdapter;
pub use gateway::GatewayCloudApi;
pub use gcp::GcpAdapter;
pub use huawei::HuaweiAdapter;
pub use openstack::OpenStackAdapter;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transient provider error: {0}")]
    Transient(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    #[error("Provider operation failed: {message}")]
    OperationFailed { message: String },

    #[error("Power-off failed: {0}")]
    PowerOffFailed(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("{provider} does not accept {format} images")]
    UnsupportedFormat {
        provider: ProviderKind,
        format: DiskFormat,
    },

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Unexpected provider response: {0}")]
    Protocol(String),
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::NotFound(_) => ErrorKind::NotFound,
            ProviderError::Transient(_) => ErrorKind::Transient,
            ProviderError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            ProviderError::AuthFailure(_) => ErrorKind::AuthFailure,
            ProviderError::OperationFailed { .. } | ProviderError::PowerOffFailed(_) => {
                ErrorKind::OperationFailed
            }
            ProviderError::InvalidIdentifier(_) => ErrorKind::InvalidIdentifier,
            ProviderError::UnsupportedFormat { .. } => ErrorKind::ConversionFailed,
            ProviderError::Timeout(_) => ErrorKind::Timeout,
            ProviderError::Protocol(_) => ErrorKind::Internal,
        }
    }
}

impl From<PollError> for ProviderError {
    fn from(err: PollError) -> Self {
        match err {
            PollError::Timeout { operation, elapsed } => {
                ProviderError::Timeout(format!("{} after {:?}", operation, elapsed))
            }
            PollError::OperationFailed {
                operation,
                provider_message,
            } => ProviderError::OperationFailed {
                message: format!("{}: {}", operation, provider_message),
            },
            PollError::Provider(err) => err,
        }
    }
}

/// A provider-side asynchronous operation request. Serialized as the body
/// sent to the cloud gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationRequest {
    StopVm {
        location: String,
        vm_id: String,
        /// Release compute allocation as well (Azure deallocate).
        deallocate: bool,
    },
    CreateSnapshot {
        location: String,
        source_id: String,
        name: String,
    },
    CreateImage {
        location: String,
        source_id: String,
        name: String,
    },
    GrantAccess {
        location: String,
        disk_id: String,
        duration_secs: u64,
    },
    ExportImage {
        location: String,
        image_id: String,
        format: DiskFormat,
        bucket: Option<String>,
    },
    PrepareStaging {
        location: String,
        bucket: Option<String>,
        object_name: String,
        size_bytes: u64,
        format: DiskFormat,
    },
    ImportImage {
        location: String,
        staging_object: String,
        format: DiskFormat,
        name: String,
        os_hint: OsHint,
    },
    CreateVm {
        location: String,
        image_id: String,
        name: String,
        instance_size: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationHandle {
    pub id: String,
    pub provider: ProviderKind,
}

/// Payload of a finished operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOutput {
    #[serde(default)]
    pub resource_id: Option<String>,
    /// Readable or writable URI produced by the operation (export, staging, grant).
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    /// Hex SHA-256 of an exported object, when the provider publishes one.
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl OperationOutput {
    fn require_resource(&self, what: &str) -> Result<String, ProviderError> {
        self.resource_id
            .clone()
            .ok_or_else(|| ProviderError::Protocol(format!("{} returned no resource id", what)))
    }

    fn require_uri(&self, what: &str) -> Result<String, ProviderError> {
        self.uri
            .clone()
            .ok_or_else(|| ProviderError::Protocol(format!("{} returned no URI", what)))
    }
}

/// Vendor SDK boundary. Implementations must treat `start_operation` as
/// idempotent on `idempotency_token`: a repeated call returns the handle of
/// the existing operation, finished or not.
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Regions or zones reachable with the configured credentials.
    async fn list_locations(&self) -> Result<Vec<String>, ProviderError>;

    /// Look up a VM by id or name in one location. `None` when absent there.
    async fn describe_vm(
        &self,
        location: &str,
        vm_identifier: &str,
    ) -> Result<Option<VmDescriptor>, ProviderError>;

    /// Start (or re-attach to) an asynchronous operation.
    async fn start_operation(
        &self,
        request: &OperationRequest,
        idempotency_token: &str,
    ) -> Result<OperationHandle, ProviderError>;

    /// Query the current status of an operation.
    async fn operation_status(
        &self,
        handle: &OperationHandle,
    ) -> Result<OperationStatus<OperationOutput>, ProviderError>;

    /// Delete a resource created during a migration.
    async fn delete_resource(&self, resource: &ResourceHandle) -> Result<(), ProviderError>;

    /// End a time-boxed read grant.
    async fn revoke_access(&self, grant: &AccessGrant) -> Result<(), ProviderError>;
}

/// Per-adapter settings, taken from the `[providers.<kind>]` config section.
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    /// Search order for `locate`; empty means ask the provider.
    pub regions: Vec<String>,
    /// Where imports and new VMs are placed. Defaults to the first region.
    pub target_location: Option<String>,
    pub staging_bucket: Option<String>,
    pub instance_size: Option<String>,
    pub poll: PollPolicy,
    /// Re-issue of single calls that fail with `Transient`
    pub call_retry: CallRetryPolicy,
    pub grant_duration: Duration,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            regions: Vec::new(),
            target_location: None,
            staging_bucket: None,
            instance_size: None,
            poll: PollPolicy::default(),
            call_retry: CallRetryPolicy::default(),
            grant_duration: Duration::from_secs(4 * 3600),
        }
    }
}

/// Identity of the job step issuing provider calls.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub job_id: Uuid,
}

impl StepContext {
    pub fn new(job_id: Uuid) -> Self {
        Self { job_id }
    }

    /// Idempotency token for one step of this job.
    pub fn token(&self, step: &str) -> String {
        format!("{}:{}", self.job_id, step)
    }

    /// Name for resources created on behalf of this job.
    pub fn resource_name(&self, suffix: &str) -> String {
        let id = self.job_id.simple().to_string();
        format!("cloudhop-{}-{}", &id[..12], suffix)
    }
}

/// Result of a source-side export: where to read the disk from.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportHandle {
    pub uri: String,
    pub format: DiskFormat,
    pub size_bytes: Option<u64>,
    pub checksum: Option<String>,
    /// Resources created by the export, in creation order.
    pub resources: Vec<ResourceHandle>,
    pub grant: Option<AccessGrant>,
}

/// Destination-side upload target.
#[derive(Debug, Clone, PartialEq)]
pub struct StagingTarget {
    pub upload_uri: String,
    pub object: ResourceHandle,
}

/// Uniform capability set every cloud implements.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Which cloud this adapter talks to
    fn kind(&self) -> ProviderKind;

    /// Format the provider produces when exporting a disk
    fn export_format(&self) -> DiskFormat;

    /// Formats the provider can import, preferred first
    fn accepted_formats(&self) -> &'static [DiskFormat];

    fn accepts(&self, format: DiskFormat) -> bool {
        self.accepted_formats().contains(&format)
    }

    fn preferred_import_format(&self) -> DiskFormat {
        self.accepted_formats()
            .first()
            .copied()
            .unwrap_or_else(|| self.export_format())
    }

    /// Find a VM across every reachable location, first match wins
    async fn locate(&self, vm_identifier: &str) -> Result<VmDescriptor, ProviderError>;

    /// Stop the VM; a VM that is already off is left alone. Returns the prior state.
    async fn power_off(&self, vm: &VmDescriptor, ctx: &StepContext) -> Result<PowerState, ProviderError>;

    /// Snapshot the boot disk. `None` when the provider exports the disk directly.
    async fn snapshot(
        &self,
        vm: &VmDescriptor,
        ctx: &StepContext,
    ) -> Result<Option<ResourceHandle>, ProviderError>;

    /// Turn the snapshot into a portable image readable over a URI
    async fn export(
        &self,
        vm: &VmDescriptor,
        snapshot: Option<&ResourceHandle>,
        ctx: &StepContext,
    ) -> Result<ExportHandle, ProviderError>;

    /// Best-effort end of a temporary read grant
    async fn revoke_access(&self, grant: &AccessGrant) -> Result<(), ProviderError>;

    /// Create the object the disk image is uploaded into
    async fn prepare_staging(
        &self,
        object_name: &str,
        size_bytes: u64,
        format: DiskFormat,
        ctx: &StepContext,
    ) -> Result<StagingTarget, ProviderError>;

    /// Register the uploaded disk as an image
    async fn import(
        &self,
        staging: &ResourceHandle,
        format: DiskFormat,
        source: &VmDescriptor,
        ctx: &StepContext,
    ) -> Result<ResourceHandle, ProviderError>;

    /// Create a VM from an imported image
    async fn launch(
        &self,
        image: &ResourceHandle,
        source: &VmDescriptor,
        ctx: &StepContext,
    ) -> Result<ResourceHandle, ProviderError>;

    /// Delete a resource this adapter created. Already-deleted counts as success.
    async fn delete_resource(&self, resource: &ResourceHandle) -> Result<(), ProviderError>;
}

/// Plumbing shared by every adapter: operation polling, region search,
/// staging, import and launch.
pub struct AdapterCore {
    kind: ProviderKind,
    api: Arc<dyn CloudApi>,
    settings: AdapterSettings,
}

impl AdapterCore {
    pub fn new(kind: ProviderKind, api: Arc<dyn CloudApi>, settings: AdapterSettings) -> Self {
        Self { kind, api, settings }
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn settings(&self) -> &AdapterSettings {
        &self.settings
    }

    pub fn target_location(&self) -> String {
        self.settings
            .target_location
            .clone()
            .or_else(|| self.settings.regions.first().cloned())
            .unwrap_or_else(|| "default".to_string())
    }

    pub fn handle(&self, kind: ResourceKind, id: impl Into<String>, location: &str) -> ResourceHandle {
        ResourceHandle::cloud(self.kind, kind, id, Some(location.to_string()))
    }

    /// Start `request` under the step's idempotency token and wait for it.
    pub async fn run(
        &self,
        step: &str,
        request: OperationRequest,
        ctx: &StepContext,
    ) -> Result<OperationOutput, ProviderError> {
        let api = &self.api;
        let label = format!("{} {}", self.kind, step);
        let token = ctx.token(step);
        let token = token.as_str();
        let request = &request;
        // Re-issuing under the same token re-attaches to an operation the
        // provider already accepted.
        let handle = retry_transient(&label, &self.settings.call_retry, move || {
            api.start_operation(request, token)
        })
        .await?;
        log_debug!(provider = %self.kind, step, operation = %handle.id, "Operation started");

        let handle = &handle;
        let output = await_completion(&label, &self.settings.poll, move || {
            api.operation_status(handle)
        })
        .await?;
        Ok(output)
    }

    async fn describe(&self, location: &str, vm_identifier: &str) -> Result<Option<VmDescriptor>, ProviderError> {
        let api = &self.api;
        let label = format!("{} describe {}", self.kind, vm_identifier);
        retry_transient(&label, &self.settings.call_retry, move || {
            api.describe_vm(location, vm_identifier)
        })
        .await
    }

    /// Describe in one known location.
    pub async fn find_in(&self, location: &str, vm_identifier: &str) -> Result<VmDescriptor, ProviderError> {
        self.describe(location, vm_identifier)
            .await?
            .ok_or_else(|| ProviderError::NotFound(format!("{} in {}", vm_identifier, location)))
    }

    /// Search every configured (or reachable) location in order.
    pub async fn search(&self, vm_identifier: &str) -> Result<VmDescriptor, ProviderError> {
        let locations = if self.settings.regions.is_empty() {
            let api = &self.api;
            let label = format!("{} list locations", self.kind);
            retry_transient(&label, &self.settings.call_retry, move || api.list_locations()).await?
        } else {
            self.settings.regions.clone()
        };

        for location in &locations {
            match self.describe(location, vm_identifier).await {
                Ok(Some(vm)) => {
                    log_info!(
                        "Located {} on {} in {} ({:?})",
                        vm_identifier,
                        self.kind,
                        location,
                        vm.power_state
                    );
                    return Ok(vm);
                }
                Ok(None) | Err(ProviderError::NotFound(_)) => continue,
                // Opt-in regions the account has not enabled.
                Err(ProviderError::PermissionDenied(msg)) => {
                    log_debug!("Skipping {} on {}: {}", location, self.kind, msg);
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        Err(ProviderError::NotFound(format!(
            "{} not found on {} ({} locations searched)",
            vm_identifier,
            self.kind,
            locations.len()
        )))
    }

    /// Stop unless the provider already reports the VM as off.
    pub async fn stop(
        &self,
        vm: &VmDescriptor,
        deallocate: bool,
        ctx: &StepContext,
    ) -> Result<PowerState, ProviderError> {
        let current = self
            .describe(&vm.location, &vm.id)
            .await?
            .map(|d| d.power_state)
            .unwrap_or(vm.power_state);

        if current.is_off() {
            log_info!("{} is already {:?}, skipping power-off", vm.name, current);
            return Ok(current);
        }

        let request = OperationRequest::StopVm {
            location: vm.location.clone(),
            vm_id: vm.id.clone(),
            deallocate,
        };
        self.run("power-off", request, ctx).await.map_err(|err| match err {
            ProviderError::OperationFailed { message } => ProviderError::PowerOffFailed(message),
            other => other,
        })?;
        Ok(current)
    }

    pub async fn create_snapshot(
        &self,
        vm: &VmDescriptor,
        ctx: &StepContext,
    ) -> Result<ResourceHandle, ProviderError> {
        let disk = boot_disk_id(vm)?;
        let request = OperationRequest::CreateSnapshot {
            location: vm.location.clone(),
            source_id: disk,
            name: ctx.resource_name("snap"),
        };
        let output = self.run("snapshot", request, ctx).await?;
        let id = output.require_resource("snapshot")?;
        Ok(self.handle(ResourceKind::Snapshot, id, &vm.location))
    }

    pub async fn create_image(
        &self,
        location: &str,
        source_id: &str,
        ctx: &StepContext,
    ) -> Result<ResourceHandle, ProviderError> {
        let request = OperationRequest::CreateImage {
            location: location.to_string(),
            source_id: source_id.to_string(),
            name: ctx.resource_name("image"),
        };
        let output = self.run("create-image", request, ctx).await?;
        let id = output.require_resource("image")?;
        Ok(self.handle(ResourceKind::Image, id, location))
    }

    /// Export an image to object storage and return a readable handle.
    pub async fn export_image(
        &self,
        image: &ResourceHandle,
        format: DiskFormat,
        ctx: &StepContext,
    ) -> Result<ExportHandle, ProviderError> {
        let location = image.location.clone().unwrap_or_else(|| self.target_location());
        let request = OperationRequest::ExportImage {
            location: location.clone(),
            image_id: image.id.clone(),
            format,
            bucket: self.settings.staging_bucket.clone(),
        };
        let output = self.run("export", request, ctx).await?;
        let uri = output.require_uri("export")?;
        let mut resources = Vec::new();
        if let Some(object) = &output.resource_id {
            resources.push(self.handle(ResourceKind::ExportedObject, object.clone(), &location));
        }
        Ok(ExportHandle {
            uri,
            format,
            size_bytes: output.size_bytes,
            checksum: output.checksum,
            resources,
            grant: None,
        })
    }

    pub async fn prepare_staging(
        &self,
        object_name: &str,
        size_bytes: u64,
        format: DiskFormat,
        ctx: &StepContext,
    ) -> Result<StagingTarget, ProviderError> {
        let location = self.target_location();
        let request = OperationRequest::PrepareStaging {
            location: location.clone(),
            bucket: self.settings.staging_bucket.clone(),
            object_name: object_name.to_string(),
            size_bytes,
            format,
        };
        let output = self.run("prepare-staging", request, ctx).await?;
        let upload_uri = output.require_uri("staging")?;
        let object = output
            .resource_id
            .clone()
            .unwrap_or_else(|| object_name.to_string());
        Ok(StagingTarget {
            upload_uri,
            object: self.handle(ResourceKind::StagingObject, object, &location),
        })
    }

    pub async fn import(
        &self,
        staging: &ResourceHandle,
        format: DiskFormat,
        source: &VmDescriptor,
        ctx: &StepContext,
    ) -> Result<ResourceHandle, ProviderError> {
        let location = staging.location.clone().unwrap_or_else(|| self.target_location());
        let request = OperationRequest::ImportImage {
            location: location.clone(),
            staging_object: staging.id.clone(),
            format,
            name: ctx.resource_name("import"),
            os_hint: source.os_hint,
        };
        let output = self.run("import", request, ctx).await?;
        let id = output.require_resource("import")?;
        Ok(self.handle(ResourceKind::Image, id, &location))
    }

    pub async fn launch(
        &self,
        image: &ResourceHandle,
        source: &VmDescriptor,
        ctx: &StepContext,
    ) -> Result<ResourceHandle, ProviderError> {
        let location = image.location.clone().unwrap_or_else(|| self.target_location());
        let request = OperationRequest::CreateVm {
            location: location.clone(),
            image_id: image.id.clone(),
            name: source.name.clone(),
            instance_size: self.settings.instance_size.clone(),
        };
        let output = self.run("launch", request, ctx).await?;
        let id = output.require_resource("launch")?;
        Ok(self.handle(ResourceKind::VirtualMachine, id, &location))
    }

    pub async fn delete(&self, resource: &ResourceHandle) -> Result<(), ProviderError> {
        let api = &self.api;
        let label = format!("{} delete {}", self.kind, resource.id);
        let deleted = retry_transient(&label, &self.settings.call_retry, move || {
            api.delete_resource(resource)
        })
        .await;
        match deleted {
            Ok(()) | Err(ProviderError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn revoke(&self, grant: &AccessGrant) -> Result<(), ProviderError> {
        if let Err(err) = self.api.revoke_access(grant).await {
            log_warn!("Could not revoke access to {}: {}", grant.resource_id, err);
            return Err(err);
        }
        Ok(())
    }
}

/// Build the adapter variant for `kind`.
pub fn adapter_for(
    kind: ProviderKind,
    api: Arc<dyn CloudApi>,
    settings: AdapterSettings,
) -> Arc<dyn ProviderAdapter> {
    match kind {
        ProviderKind::Aws => Arc::new(AwsAdapter::new(api, settings)),
        ProviderKind::Azure => Arc::new(AzureAdapter::new(api, settings)),
        ProviderKind::Gcp => Arc::new(GcpAdapter::new(api, settings)),
        ProviderKind::Huawei => Arc::new(HuaweiAdapter::new(api, settings)),
        ProviderKind::OpenStack => Arc::new(OpenStackAdapter::new(api, settings)),
    }
}

fn boot_disk_id(vm: &VmDescriptor) -> Result<String, ProviderError> {
    vm.boot_disk()
        .map(|d| d.id.clone())
        .ok_or_else(|| ProviderError::NotFound(format!("{} has no boot disk", vm.name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_stable_per_step() {
        let ctx = StepContext::new(Uuid::nil());
        assert_eq!(ctx.token("snapshot"), ctx.token("snapshot"));
        assert_ne!(ctx.token("snapshot"), ctx.token("export"));
        assert!(ctx.resource_name("snap").starts_with("cloudhop-000000000000-"));
    }

    #[test]
    fn poll_errors_keep_their_kind() {
        let timeout: ProviderError = PollError::Timeout {
            operation: "export".to_string(),
            elapsed: Duration::from_secs(3600),
        }
        .into();
        assert_eq!(timeout.kind(), ErrorKind::Timeout);

        let failed: ProviderError = PollError::OperationFailed {
            operation: "import".to_string(),
            provider_message: "bad image".to_string(),
        }
        .into();
        assert_eq!(failed.kind(), ErrorKind::OperationFailed);
    }

    #[test]
    fn requests_serialize_with_type_tag() {
        let request = OperationRequest::StopVm {
            location: "eu-west-1".to_string(),
            vm_id: "i-1".to_string(),
            deallocate: false,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["type"], "stop_vm");
        assert_eq!(json["vm_id"], "i-1");
    }
}
