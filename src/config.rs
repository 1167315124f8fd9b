use crate::codec::QemuImg;
use crate::job::ProviderKind;
use crate::poller::{CallRetryPolicy, PollPolicy};
use crate::provider::{AdapterSettings, openstack::glance_poll_policy};
use crate::transfer::TransferPolicy;
use crate::{MigrationError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Job records live here
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Downloaded and converted disk images
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub codec: CodecConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Keyed by provider name (`aws`, `azure`, `gcp`, `huawei`, `openstack`)
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,
    /// Hash downloads when the export publishes a SHA-256
    #[serde(default = "default_true")]
    pub verify_checksum: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_poll_max_interval_secs")]
    pub max_interval_secs: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_poll_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    #[serde(default = "default_qemu_img")]
    pub qemu_img: PathBuf,
    #[serde(default = "default_codec_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Post-transfer integrity failures tolerated before the job fails for good
    #[serde(default = "default_max_integrity_retries")]
    pub max_integrity_retries: u32,
    /// Operator `retry` calls allowed on one failed step before it is given up
    #[serde(default = "default_max_step_retries")]
    pub max_step_retries: u32,
    /// Automatic re-issues of a provider call that failed transiently
    #[serde(default = "default_call_retries")]
    pub call_retries: u32,
    #[serde(default = "default_call_initial_backoff_ms")]
    pub call_initial_backoff_ms: u64,
    #[serde(default = "default_call_max_backoff_ms")]
    pub call_max_backoff_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Gateway service wrapping the vendor SDK
    pub gateway_url: Option<String>,
    /// Opaque credential handle, forwarded as-is
    pub credential_ref: Option<String>,
    /// Regions or zones to search, in order
    #[serde(default)]
    pub regions: Vec<String>,
    pub target_location: Option<String>,
    pub staging_bucket: Option<String>,
    pub instance_size: Option<String>,
    pub grant_duration_secs: Option<u64>,
    pub poll: Option<PollConfig>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            staging_dir: default_staging_dir(),
            transfer: TransferConfig::default(),
            poll: PollConfig::default(),
            codec: CodecConfig::default(),
            retry: RetryConfig::default(),
            providers: BTreeMap::new(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            workers: default_workers(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            chunk_timeout_secs: default_chunk_timeout_secs(),
            verify_checksum: true,
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval_secs(),
            max_interval_secs: default_poll_max_interval_secs(),
            backoff_multiplier: default_backoff_multiplier(),
            timeout_secs: default_poll_timeout_secs(),
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            qemu_img: default_qemu_img(),
            timeout_secs: default_codec_timeout_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_integrity_retries: default_max_integrity_retries(),
            max_step_retries: default_max_step_retries(),
            call_retries: default_call_retries(),
            call_initial_backoff_ms: default_call_initial_backoff_ms(),
            call_max_backoff_ms: default_call_max_backoff_ms(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("cloudhop")
        .join("jobs")
}

fn default_staging_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("cloudhop")
        .join("staging")
}

fn default_chunk_size() -> String {
    "32Mi".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_chunk_timeout_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_poll_max_interval_secs() -> u64 {
    60
}

fn default_backoff_multiplier() -> f64 {
    1.5
}

fn default_poll_timeout_secs() -> u64 {
    3600
}

fn default_qemu_img() -> PathBuf {
    PathBuf::from("qemu-img")
}

fn default_codec_timeout_secs() -> u64 {
    4 * 3600
}

fn default_max_integrity_retries() -> u32 {
    1
}

fn default_max_step_retries() -> u32 {
    3
}

fn default_call_retries() -> u32 {
    4
}

fn default_call_initial_backoff_ms() -> u64 {
    1000
}

fn default_call_max_backoff_ms() -> u64 {
    30_000
}

impl PollConfig {
    pub fn policy(&self) -> Result<PollPolicy> {
        if self.interval_secs == 0 || self.timeout_secs == 0 {
            return Err(MigrationError::ConfigError(
                "poll interval and timeout must be positive".to_string(),
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(MigrationError::ConfigError(
                "poll backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        Ok(PollPolicy {
            interval: Duration::from_secs(self.interval_secs),
            max_interval: Duration::from_secs(self.max_interval_secs.max(self.interval_secs)),
            multiplier: self.backoff_multiplier,
            timeout: Duration::from_secs(self.timeout_secs),
        })
    }
}

impl TransferConfig {
    pub fn policy(&self) -> Result<TransferPolicy> {
        let chunk_size = parse_size(&self.chunk_size)?;
        if chunk_size == 0 || self.workers == 0 {
            return Err(MigrationError::ConfigError(
                "transfer chunk_size and workers must be positive".to_string(),
            ));
        }
        Ok(TransferPolicy {
            chunk_size,
            workers: self.workers,
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms)),
            chunk_timeout: Duration::from_secs(self.chunk_timeout_secs.max(1)),
        })
    }
}

impl RetryConfig {
    pub fn call_policy(&self) -> CallRetryPolicy {
        CallRetryPolicy {
            max_retries: self.call_retries,
            initial_backoff: Duration::from_millis(self.call_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.call_max_backoff_ms.max(self.call_initial_backoff_ms)),
        }
    }
}

impl CodecConfig {
    pub fn converter(&self) -> QemuImg {
        QemuImg::new(&self.qemu_img, Duration::from_secs(self.timeout_secs))
    }
}

impl MigrationConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Self> {
        let config: MigrationConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| MigrationError::ConfigError(e.to_string()))?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.transfer.policy()?;
        self.poll.policy()?;
        for (name, provider) in &self.providers {
            let kind: ProviderKind = name
                .parse()
                .map_err(|e: String| MigrationError::ConfigError(format!("providers.{}: {}", name, e)))?;
            if let Some(poll) = &provider.poll {
                poll.policy().map_err(|e| {
                    MigrationError::ConfigError(format!("providers.{}: {}", kind, e))
                })?;
            }
        }
        Ok(())
    }

    pub fn provider(&self, kind: ProviderKind) -> Option<&ProviderConfig> {
        self.providers.get(kind.as_str())
    }

    /// Settings for one adapter: provider overrides on top of global defaults.
    pub fn adapter_settings(&self, kind: ProviderKind) -> Result<AdapterSettings> {
        let provider = self.provider(kind).cloned().unwrap_or_default();
        let poll = match &provider.poll {
            Some(poll) => poll.policy()?,
            None if kind == ProviderKind::OpenStack && self.poll == PollConfig::default() => {
                glance_poll_policy()
            }
            None => self.poll.policy()?,
        };
        let defaults = AdapterSettings::default();
        Ok(AdapterSettings {
            regions: provider.regions,
            target_location: provider.target_location,
            staging_bucket: provider.staging_bucket,
            instance_size: provider.instance_size,
            poll,
            call_retry: self.retry.call_policy(),
            grant_duration: provider
                .grant_duration_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.grant_duration),
        })
    }
}

/// Parse a size string like "32Mi", "1Gi", "500M" or "4096" into bytes.
pub fn parse_size(size: &str) -> Result<u64> {
    let size = size.trim();
    let invalid = || MigrationError::ConfigError(format!("invalid size '{}'", size));

    if size.is_empty() {
        return Err(invalid());
    }

    let suffixes: [(&str, u64); 7] = [
        ("Ti", 1 << 40),
        ("Gi", 1 << 30),
        ("Mi", 1 << 20),
        ("Ki", 1 << 10),
        ("G", 1_000_000_000),
        ("M", 1_000_000),
        ("K", 1_000),
    ];

    let (number_part, multiplier) = suffixes
        .iter()
        .find_map(|(suffix, mult)| size.strip_suffix(suffix).map(|n| (n, *mult)))
        .unwrap_or((size, 1));

    let number: u64 = number_part.trim().parse().map_err(|_| invalid())?;
    number.checked_mul(multiplier).ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("32Mi").unwrap(), 32 * 1024 * 1024);
        assert_eq!(parse_size("1Gi").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("2G").unwrap(), 2_000_000_000);
        assert_eq!(parse_size("64Ki").unwrap(), 65536);
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert!(parse_size("").is_err());
        assert!(parse_size("lots").is_err());
        assert!(parse_size("99999999999Ti").is_err());
    }

    #[test]
    fn test_config_parsing() {
        let toml_str = r#"
state_dir = "/srv/cloudhop/jobs"
staging_dir = "/srv/cloudhop/staging"

[transfer]
chunk_size = "64Mi"
workers = 8

[poll]
interval_secs = 10
timeout_secs = 7200

[providers.aws]
gateway_url = "http://gateway.internal/aws"
credential_ref = "vault:aws/migration"
regions = ["eu-central-1", "eu-west-1"]
staging_bucket = "migration-staging"

[providers.azure]
gateway_url = "http://gateway.internal/azure"
regions = ["prod-rg"]
grant_duration_secs = 7200

[providers.azure.poll]
interval_secs = 5
timeout_secs = 1800
"#;

        let config = MigrationConfig::from_str(toml_str).unwrap();
        assert_eq!(config.state_dir, PathBuf::from("/srv/cloudhop/jobs"));

        let transfer = config.transfer.policy().unwrap();
        assert_eq!(transfer.chunk_size, 64 * 1024 * 1024);
        assert_eq!(transfer.workers, 8);
        assert_eq!(transfer.max_retries, 5);

        let aws = config.adapter_settings(ProviderKind::Aws).unwrap();
        assert_eq!(aws.regions, vec!["eu-central-1", "eu-west-1"]);
        assert_eq!(aws.poll.interval, Duration::from_secs(10));
        assert_eq!(aws.staging_bucket.as_deref(), Some("migration-staging"));

        assert_eq!(aws.call_retry, CallRetryPolicy::default());

        let azure = config.adapter_settings(ProviderKind::Azure).unwrap();
        assert_eq!(azure.poll.timeout, Duration::from_secs(1800));
        assert_eq!(azure.grant_duration, Duration::from_secs(7200));
    }

    #[test]
    fn test_defaults_when_empty() {
        let config = MigrationConfig::from_str("").unwrap();
        assert_eq!(config.retry.max_integrity_retries, 1);
        assert_eq!(config.retry.max_step_retries, 3);
        assert!(config.transfer.verify_checksum);
        assert_eq!(
            config.transfer.policy().unwrap().chunk_size,
            32 * 1024 * 1024
        );

        let openstack = config.adapter_settings(ProviderKind::OpenStack).unwrap();
        assert_eq!(openstack.poll, glance_poll_policy());
    }

    #[test]
    fn test_call_retry_settings_reach_adapters() {
        let toml_str = r#"
[retry]
max_step_retries = 5
call_retries = 2
call_initial_backoff_ms = 200
call_max_backoff_ms = 100
"#;
        let config = MigrationConfig::from_str(toml_str).unwrap();
        assert_eq!(config.retry.max_step_retries, 5);

        let gcp = config.adapter_settings(ProviderKind::Gcp).unwrap();
        assert_eq!(gcp.call_retry.max_retries, 2);
        assert_eq!(gcp.call_retry.initial_backoff, Duration::from_millis(200));
        assert_eq!(gcp.call_retry.max_backoff, Duration::from_millis(200));
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        let err = MigrationConfig::from_str("[providers.oracle]\nregions = []\n").unwrap_err();
        assert!(matches!(err, MigrationError::ConfigError(_)));
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        let err = MigrationConfig::from_str("[transfer]\nchunk_size = \"0\"\n").unwrap_err();
        assert!(matches!(err, MigrationError::ConfigError(_)));

        let err = MigrationConfig::from_str("[poll]\nbackoff_multiplier = 0.5\n").unwrap_err();
        assert!(matches!(err, MigrationError::ConfigError(_)));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("Cloudhop.toml");
        let mut config = MigrationConfig::default();
        config.providers.insert(
            "gcp".to_string(),
            ProviderConfig {
                gateway_url: Some("http://gw/gcp".to_string()),
                regions: vec!["europe-west4-a".to_string()],
                ..ProviderConfig::default()
            },
        );
        config.save_to_file(&path).unwrap();

        let reloaded = MigrationConfig::from_file(&path).unwrap();
        assert_eq!(
            reloaded.provider(ProviderKind::Gcp).unwrap().regions,
            vec!["europe-west4-a"]
        );
    }
}
