use super::{
    AdapterCore, AdapterSettings, CloudApi, ExportHandle, OperationRequest, ProviderAdapter,
    ProviderError, StagingTarget, StepContext,
};
use crate::job::{AccessGrant, DiskFormat, PowerState, ProviderKind, ResourceHandle, VmDescriptor};
use crate::log_info;
use async_trait::async_trait;
use std::sync::Arc;

const ACCEPTED: &[DiskFormat] = &[DiskFormat::Vhd];

/// Azure managed disks.
///
/// The OS disk is exported in place: after deallocation a time-boxed SAS
/// grant makes the disk readable as a fixed VHD, and `endGetAccess` revokes
/// it. Imports go through a page blob in the staging container.
pub struct AzureAdapter {
    core: AdapterCore,
}

impl AzureAdapter {
    pub fn new(api: Arc<dyn CloudApi>, settings: AdapterSettings) -> Self {
        Self {
            core: AdapterCore::new(ProviderKind::Azure, api, settings),
        }
    }
}

/// Resolve an ARM id (`/subscriptions/<s>/resourceGroups/<rg>/providers/
/// Microsoft.Compute/virtualMachines/<name>`) into resource group and name.
pub fn parse_resource_id(identifier: &str) -> Result<Option<(String, String)>, ProviderError> {
    if !identifier.starts_with("/subscriptions/") {
        return Ok(None);
    }
    let segments: Vec<&str> = identifier.trim_matches('/').split('/').collect();
    match segments.as_slice() {
        ["subscriptions", sub, rg_key, rg, "providers", ns, vm_key, name]
            if !sub.is_empty()
                && rg_key.eq_ignore_ascii_case("resourceGroups")
                && ns.eq_ignore_ascii_case("Microsoft.Compute")
                && vm_key.eq_ignore_ascii_case("virtualMachines")
                && !rg.is_empty()
                && !name.is_empty() =>
        {
            Ok(Some((rg.to_string(), name.to_string())))
        }
        _ => Err(ProviderError::InvalidIdentifier(identifier.to_string())),
    }
}

#[async_trait]
impl ProviderAdapter for AzureAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Azure
    }

    fn export_format(&self) -> DiskFormat {
        DiskFormat::Vhd
    }

    fn accepted_formats(&self) -> &'static [DiskFormat] {
        ACCEPTED
    }

    async fn locate(&self, vm_identifier: &str) -> Result<VmDescriptor, ProviderError> {
        match parse_resource_id(vm_identifier)? {
            Some((group, name)) => self.core.find_in(&group, &name).await,
            None => self.core.search(vm_identifier).await,
        }
    }

    async fn power_off(&self, vm: &VmDescriptor, ctx: &StepContext) -> Result<PowerState, ProviderError> {
        // Stopped-but-allocated disks cannot be granted access; deallocate.
        self.core.stop(vm, true, ctx).await
    }

    async fn snapshot(
        &self,
        _vm: &VmDescriptor,
        _ctx: &StepContext,
    ) -> Result<Option<ResourceHandle>, ProviderError> {
        Ok(None)
    }

    async fn export(
        &self,
        vm: &VmDescriptor,
        _snapshot: Option<&ResourceHandle>,
        ctx: &StepContext,
    ) -> Result<ExportHandle, ProviderError> {
        let disk = vm
            .boot_disk()
            .ok_or_else(|| ProviderError::NotFound(format!("{} has no OS disk", vm.name)))?;
        let request = OperationRequest::GrantAccess {
            location: vm.location.clone(),
            disk_id: disk.id.clone(),
            duration_secs: self.core.settings().grant_duration.as_secs(),
        };
        let output = self.core.run("grant-access", request, ctx).await?;
        let uri = output
            .uri
            .clone()
            .ok_or_else(|| ProviderError::Protocol("grant returned no SAS URL".to_string()))?;
        log_info!("SAS grant issued for disk {}", disk.id);

        Ok(ExportHandle {
            uri,
            format: DiskFormat::Vhd,
            size_bytes: output.size_bytes.or(Some(disk.size_bytes)),
            checksum: output.checksum,
            resources: Vec::new(),
            grant: Some(AccessGrant {
                provider: ProviderKind::Azure,
                resource_id: disk.id.clone(),
                expires_at: output.expires_at,
            }),
        })
    }

    async fn revoke_access(&self, grant: &AccessGrant) -> Result<(), ProviderError> {
        self.core.revoke(grant).await
    }

    async fn prepare_staging(
        &self,
        object_name: &str,
        size_bytes: u64,
        format: DiskFormat,
        ctx: &StepContext,
    ) -> Result<StagingTarget, ProviderError> {
        if format != DiskFormat::Vhd {
            return Err(ProviderError::UnsupportedFormat {
                provider: ProviderKind::Azure,
                format,
            });
        }
        self.core.prepare_staging(object_name, size_bytes, format, ctx).await
    }

    async fn import(
        &self,
        staging: &ResourceHandle,
        format: DiskFormat,
        source: &VmDescriptor,
        ctx: &StepContext,
    ) -> Result<ResourceHandle, ProviderError> {
        if format != DiskFormat::Vhd {
            return Err(ProviderError::UnsupportedFormat {
                provider: ProviderKind::Azure,
                format,
            });
        }
        self.core.import(staging, format, source, ctx).await
    }

    async fn launch(
        &self,
        image: &ResourceHandle,
        source: &VmDescriptor,
        ctx: &StepContext,
    ) -> Result<ResourceHandle, ProviderError> {
        self.core.launch(image, source, ctx).await
    }

    async fn delete_resource(&self, resource: &ResourceHandle) -> Result<(), ProviderError> {
        self.core.delete(resource).await
    }
}
