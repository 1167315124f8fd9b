use super::{
    AdapterCore, AdapterSettings, CloudApi, ExportHandle, OperationRequest, ProviderAdapter,
    ProviderError, StagingTarget, StepContext,
};
use crate::job::{
    AccessGrant, DiskFormat, PowerState, ProviderKind, ResourceHandle, ResourceKind, VmDescriptor,
};
use crate::poller::PollPolicy;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

const ACCEPTED: &[DiskFormat] = &[DiskFormat::Qcow2, DiskFormat::Raw];

/// Glance reports `active` or `error` at a fixed cadence; 30 minutes is the
/// longest an image upload is given.
pub fn glance_poll_policy() -> PollPolicy {
    PollPolicy::fixed(Duration::from_secs(5), Duration::from_secs(30 * 60))
}

/// OpenStack (Nova + Glance). Server snapshots are Glance images, which are
/// downloaded directly; imports create a Glance image and upload into it.
pub struct OpenStackAdapter {
    core: AdapterCore,
}

impl OpenStackAdapter {
    pub fn new(api: Arc<dyn CloudApi>, settings: AdapterSettings) -> Self {
        Self {
            core: AdapterCore::new(ProviderKind::OpenStack, api, settings),
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenStackAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenStack
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
        // createImage on a server yields a Glance image, not a volume snapshot.
        let request = OperationRequest::CreateSnapshot {
            location: vm.location.clone(),
            source_id: vm.id.clone(),
            name: ctx.resource_name("snap"),
        };
        let output = self.core.run("snapshot", request, ctx).await?;
        let id = output
            .resource_id
            .ok_or_else(|| ProviderError::Protocol("server snapshot returned no image id".to_string()))?;
        Ok(Some(self.core.handle(ResourceKind::Image, id, &vm.location)))
    }

    async fn export(
        &self,
        _vm: &VmDescriptor,
        snapshot: Option<&ResourceHandle>,
        ctx: &StepContext,
    ) -> Result<ExportHandle, ProviderError> {
        let image = snapshot
            .ok_or_else(|| ProviderError::Protocol("Glance export needs an image".to_string()))?;
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
        if !self.accepts(format) {
            return Err(ProviderError::UnsupportedFormat {
                provider: ProviderKind::OpenStack,
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
        // The staging object already is the Glance image; importing activates it.
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
