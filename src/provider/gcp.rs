use super::{
    AdapterCore, AdapterSettings, CloudApi, ExportHandle, ProviderAdapter, ProviderError,
    StagingTarget, StepContext,
};
use crate::job::{AccessGrant, DiskFormat, PowerState, ProviderKind, ResourceHandle, VmDescriptor};
use async_trait::async_trait;
use std::sync::Arc;

const ACCEPTED: &[DiskFormat] = &[DiskFormat::Vmdk, DiskFormat::Vhd];

/// Compute Engine: boot disk snapshot, image, export to GCS.
pub struct GcpAdapter {
    core: AdapterCore,
}

impl GcpAdapter {
    pub fn new(api: Arc<dyn CloudApi>, settings: AdapterSettings) -> Self {
        Self {
            core: AdapterCore::new(ProviderKind::Gcp, api, settings),
        }
    }
}

/// `projects/<p>/zones/<z>/instances/<name>`, optionally behind a
/// `https://www.googleapis.com/compute/v1/` prefix.
pub fn parse_instance_path(identifier: &str) -> Result<Option<(String, String)>, ProviderError> {
    let path = identifier
        .strip_prefix("https://www.googleapis.com/compute/v1/")
        .unwrap_or(identifier);
    if !path.starts_with("projects/") {
        return Ok(None);
    }
    let segments: Vec<&str> = path.split('/').collect();
    match segments.as_slice() {
        ["projects", project, "zones", zone, "instances", name]
            if !project.is_empty() && !zone.is_empty() && !name.is_empty() =>
        {
            Ok(Some((zone.to_string(), name.to_string())))
        }
        _ => Err(ProviderError::InvalidIdentifier(identifier.to_string())),
    }
}

#[async_trait]
impl ProviderAdapter for GcpAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gcp
    }

    fn export_format(&self) -> DiskFormat {
        DiskFormat::Vmdk
    }

    fn accepted_formats(&self) -> &'static [DiskFormat] {
        ACCEPTED
    }

    async fn locate(&self, vm_identifier: &str) -> Result<VmDescriptor, ProviderError> {
        match parse_instance_path(vm_identifier)? {
            Some((zone, name)) => self.core.find_in(&zone, &name).await,
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
        let source = match snapshot {
            Some(snapshot) => snapshot.id.clone(),
            None => vm
                .boot_disk()
                .map(|d| d.id.clone())
                .ok_or_else(|| ProviderError::NotFound(format!("{} has no boot disk", vm.name)))?,
        };
        let image = self.core.create_image(&vm.location, &source, ctx).await?;
        let mut export = self.core.export_image(&image, DiskFormat::Vmdk, ctx).await?;
        export.resources.insert(0, image);
        Ok(export)
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
                provider: ProviderKind::Gcp,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_path_resolves_zone() {
        let parsed = parse_instance_path("projects/acme/zones/europe-west4-a/instances/web-01").unwrap();
        assert_eq!(parsed, Some(("europe-west4-a".to_string(), "web-01".to_string())));

        let self_link =
            "https://www.googleapis.com/compute/v1/projects/acme/zones/us-east1-b/instances/db";
        assert_eq!(
            parse_instance_path(self_link).unwrap(),
            Some(("us-east1-b".to_string(), "db".to_string()))
        );
    }

    #[test]
    fn truncated_path_is_invalid() {
        assert!(matches!(
            parse_instance_path("projects/acme/zones/europe-west4-a"),
            Err(ProviderError::InvalidIdentifier(_))
        ));
    }
}
