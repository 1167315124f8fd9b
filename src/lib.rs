pub mod codec;
pub mod config;
pub mod error;
pub mod job;
pub mod logger;
pub mod orchestrator;
pub mod poller;
pub mod provider;
pub mod store;
pub mod transfer;
pub mod transport;

pub use error::{ErrorKind, MigrationError};
pub use job::{DiskFormat, JobState, MigrationJob, ProviderKind};
pub use orchestrator::{JobSnapshot, Orchestrator, OrchestratorSettings, SubmitRequest};

pub type Result<T> = std::result::Result<T, MigrationError>;

// Convenience re-exports for embedding the engine
pub use codec::{DiskConverter, QemuImg};
pub use provider::{CloudApi, GatewayCloudApi, ProviderAdapter};
pub use store::{FileJobStore, JobStore, MemoryJobStore};
pub use transport::{DefaultTransports, Transports};
