use super::{
    AdapterCore, AdapterSettings, CloudApi, ExportHandle, ProviderAdapter, ProviderError,
    StagingTarget, StepContext,
};
use crate::job::{AccessGrant, DiskFormat, PowerState, ProviderKind, ResourceHandle, VmDescriptor};
use async_trait::async_trait;
use std::sync::Arc;

const ACCEPTED: &[DiskFormat] = &[
    DiskFormat::Qcow2,
    DiskFormat::Vmdk,
    DiskFormat::Vhd,
    DiskFormat::Zvhd,
];

/// Huawei Cloud ECS. The "snapshot" is an IMS private image built from the
/// system disk; exports land in an OBS bucket.
pub struct HuaweiAdapter {
    core: AdapterCore,
}

impl HuaweiAdapter {
    pub fn new(api: Arc<dyn CloudApi>, settings: AdapterSettings) -> Self {
        Self {
            core: AdapterCore::new(ProviderKind::Huawei, api, settings),
        }
    }
}

#[async_trait]
impl ProviderAdapter for HuaweiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Huawei
    }

    fn export_format(&self) -> DiskFormat {
        DiskFormat::Qcow2
    }

    fn accepted_formats(&self) -> &'static [DiskFormat] {
        ACCEPTED
    }

    async fn locate(&self, vm_identifier: &str) -> Result<VmDescriptor, ProviderError> {
        self.core.search(vm_identifier).await
    }

    async fn power_off(&self, vm: &VmDescriptor, ctx: &StepContext) -> Result<PowerState, ProviderError> {
        self.core.stop(vm, false, ctx).await
    }

    async fn snapshot(
        &self,
        vm: &VmDescriptor,
        ctx: &StepContext,
    ) -> Result<Option<ResourceHandle>, ProviderError> {
        let disk = vm
            .boot_disk()
            .ok_or_else(|| ProviderError::NotFound(format!("{} has no system disk", vm.name)))?;
        self.core
            .create_image(&vm.location, &disk.id, ctx)
            .await
            .map(Some)
    }

    async fn export(
        &self,
        _vm: &VmDescriptor,
        snapshot: Option<&ResourceHandle>,
        ctx: &StepContext,
    ) -> Result<ExportHandle, ProviderError> {
        let image = snapshot
            .ok_or_else(|| ProviderError::Protocol("IMS export needs a private image".to_string()))?;
        self.core.export_image(image, DiskFormat::Qcow2, ctx).await
    }

    async fn revoke_access(&self, _grant: &AccessGrant) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn prepare_staging(
        &self,
        object_name: &str,
        size_bytes: u64,
        format: DiskFormat,
        ctx: &StepContext,
    ) -> Result<StagingTarget, ProviderError> {
        self.core.prepare_staging(object_name, size_bytes, format, ctx).await
    }

    async fn import(
        &self,
        staging: &ResourceHandle,
        format: DiskFormat,
        source: &VmDescriptor,
        ctx: &StepContext,
    ) -> Result<ResourceHandle, ProviderError> {
        if !self.accepts(format) {
            return Err(ProviderError::UnsupportedFormat {
                provider: ProviderKind::Huawei,
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
