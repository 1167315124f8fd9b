//! Local disk image conversion through `qemu-img`.

use crate::job::DiskFormat;
use crate::{log_debug, log_error, log_info};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Conversion failed: {exit_info}")]
    ConversionFailed { exit_info: String },

    #[error("Conversion to {0} is not supported locally")]
    UnsupportedTarget(DiskFormat),

    #[error("Conversion did not finish within {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Rewrites a disk image into another format, producing a new file.
#[async_trait]
pub trait DiskConverter: Send + Sync {
    async fn convert(
        &self,
        input: &Path,
        source_format: DiskFormat,
        target: DiskFormat,
    ) -> Result<PathBuf, CodecError>;
}

/// Output path for a conversion: same directory and stem, target extension.
pub fn converted_path(input: &Path, target: DiskFormat) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "disk".to_string());
    input.with_file_name(format!("{}.{}", stem, target.extension()))
}

/// Extra `-o` options per target format.
fn target_options(target: DiskFormat) -> Option<&'static str> {
    match target {
        DiskFormat::Vmdk => Some("subformat=streamOptimized"),
        // Azure only accepts fixed VHDs whose virtual size is MiB aligned.
        DiskFormat::Vhd => Some("subformat=fixed,force_size"),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct ImageInfo {
    format: String,
    #[serde(rename = "virtual-size")]
    virtual_size: u64,
}

pub struct QemuImg {
    binary: PathBuf,
    timeout: Duration,
}

impl QemuImg {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    fn convert_args(input: &Path, output: &Path, source: &str, target: DiskFormat) -> Result<Vec<String>, CodecError> {
        let qemu_target = target
            .qemu_format()
            .ok_or(CodecError::UnsupportedTarget(target))?;
        let mut args = vec![
            "convert".to_string(),
            "-p".to_string(),
            "-f".to_string(),
            source.to_string(),
            "-O".to_string(),
            qemu_target.to_string(),
        ];
        if let Some(options) = target_options(target) {
            args.push("-o".to_string());
            args.push(options.to_string());
        }
        args.push(input.to_string_lossy().into_owned());
        args.push(output.to_string_lossy().into_owned());
        Ok(args)
    }

    async fn run(&self, args: &[String]) -> Result<std::process::Output, CodecError> {
        log_debug!("Running {} {}", self.binary.display(), args.join(" "));
        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match timeout(self.timeout, child).await {
            Ok(output) => Ok(output?),
            Err(_) => Err(CodecError::Timeout(self.timeout)),
        }
    }

    async fn info(&self, path: &Path) -> Result<ImageInfo, CodecError> {
        let args = vec![
            "info".to_string(),
            "--output=json".to_string(),
            path.to_string_lossy().into_owned(),
        ];
        let output = self.run(&args).await?;
        if !output.status.success() {
            return Err(CodecError::ConversionFailed {
                exit_info: format!(
                    "qemu-img info exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        serde_json::from_slice(&output.stdout).map_err(|e| CodecError::ConversionFailed {
            exit_info: format!("unreadable qemu-img info output: {}", e),
        })
    }
}

#[async_trait]
impl DiskConverter for QemuImg {
    async fn convert(
        &self,
        input: &Path,
        source_format: DiskFormat,
        target: DiskFormat,
    ) -> Result<PathBuf, CodecError> {
        let source = source_format
            .qemu_format()
            .ok_or(CodecError::UnsupportedTarget(source_format))?;
        let output_path = converted_path(input, target);
        if output_path == input {
            return Err(CodecError::ConversionFailed {
                exit_info: format!("refusing to convert {} onto itself", input.display()),
            });
        }

        log_info!(
            "Converting disk: {:?} ({}) -> {:?} ({})",
            input,
            source_format,
            output_path,
            target
        );

        let args = Self::convert_args(input, &output_path, source, target)?;
        let output = match self.run(&args).await {
            Ok(output) => output,
            Err(err) => {
                let _ = tokio::fs::remove_file(&output_path).await;
                return Err(err);
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            log_error!("qemu-img convert failed: {}", stderr.trim());
            let _ = tokio::fs::remove_file(&output_path).await;
            return Err(CodecError::ConversionFailed {
                exit_info: format!("exit {}: {}", output.status, stderr.trim()),
            });
        }

        let info = self.info(&output_path).await?;
        if DiskFormat::from_qemu_format(&info.format) != Some(target) || info.virtual_size == 0 {
            let _ = tokio::fs::remove_file(&output_path).await;
            return Err(CodecError::ConversionFailed {
                exit_info: format!(
                    "output reports format '{}' with {} bytes, expected {}",
                    info.format, info.virtual_size, target
                ),
            });
        }

        log_info!("Disk conversion completed: {:?}", output_path);
        Ok(output_path)
    }
}
