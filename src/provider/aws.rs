use super::{
    AdapterCore, AdapterSettings, CloudApi, ExportHandle, ProviderAdapter, ProviderError,
    StagingTarget, StepContext,
};
use crate::job::{AccessGrant, DiskFormat, PowerState, ProviderKind, ResourceHandle, VmDescriptor};
use async_trait::async_trait;
use std::sync::Arc;

const ACCEPTED: &[DiskFormat] = &[DiskFormat::Vmdk, DiskFormat::Vhd, DiskFormat::Raw];

/// EC2: snapshot the root volume, register an AMI, run an export task to S3.
pub struct AwsAdapter {
    core: AdapterCore,
}

impl AwsAdapter {
    pub fn new(api: Arc<dyn CloudApi>, settings: AdapterSettings) -> Self {
        Self {
            core: AdapterCore::new(ProviderKind::Aws, api, settings),
        }
    }
}

/// Split `arn:aws:ec2:<region>:<account>:instance/<id>` into region and id.
/// Returns `Ok(None)` for plain names and instance ids.
pub fn parse_instance_arn(identifier: &str) -> Result<Option<(String, String)>, ProviderError> {
    if !identifier.starts_with("arn:") {
        return Ok(None);
    }
    let invalid = || ProviderError::InvalidIdentifier(identifier.to_string());
    let parts: Vec<&str> = identifier.splitn(6, ':').collect();
    if parts.len() != 6 || parts[2] != "ec2" || parts[3].is_empty() {
        return Err(invalid());
    }
    let instance = parts[5].strip_prefix("instance/").ok_or_else(invalid)?;
    if instance.is_empty() {
        return Err(invalid());
    }
    Ok(Some((parts[3].to_string(), instance.to_string())))
}

#[async_trait]
impl ProviderAdapter for AwsAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Aws
    }

    fn export_format(&self) -> DiskFormat {
        DiskFormat::Vmdk
    }

    fn accepted_formats(&self) -> &'static [DiskFormat] {
        ACCEPTED
    }

    async fn locate(&self, vm_identifier: &str) -> Result<VmDescriptor, ProviderError> {
        match parse_instance_arn(vm_identifier)? {
            Some((region, instance)) => self.core.find_in(&region, &instance).await,
            None => self.core.search(vm_identifier).await,
        }
    }

    async fn power_off(&self, vm: &VmDescriptor, ctx: &StepContext) -> Result<PowerState, ProviderError> {
        self.core.stop(vm, false, ctx).await
    }

    async fn snapshot(
        &self,
        vm: &VmDescriptor,
        ctx: &StepContext,
    ) -> Result<Option<ResourceHandle>, ProviderError> {
        self.core.create_snapshot(vm, ctx).await.map(Some)
    }

    async fn export(
        &self,
        vm: &VmDescriptor,
        snapshot: Option<&ResourceHandle>,
        ctx: &StepContext,
    ) -> Result<ExportHandle, ProviderError> {
        let snapshot = snapshot
            .ok_or_else(|| ProviderError::Protocol("EC2 export needs a snapshot".to_string()))?;
        let image = self.core.create_image(&vm.location, &snapshot.id, ctx).await?;
        let mut export = self.core.export_image(&image, DiskFormat::Vmdk, ctx).await?;
        export.resources.insert(0, image);
        Ok(export)
    }

    async fn revoke_access(&self, _grant: &AccessGrant) -> Result<(), ProviderError> {
        // Presigned S3 URLs expire on their own.
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
                provider: ProviderKind::Aws,
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
