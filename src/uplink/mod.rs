//! Core modules for the bulk data client.
//! Everything an operation needs flows through here: configuration, the API
//! client and auth session, schema metadata, the change-log, and the
//! dispatch machinery shared by the operation modes.

pub mod api;
pub mod auth;
pub mod config;
pub mod delete;
pub mod directory;
pub mod dispatch;
pub mod fetch;
pub mod hashlog;
pub mod metadata;
pub mod payload;
pub mod report;
pub mod send;
pub mod truncate;
pub mod validate;

// Re-export configuration types
pub use config::{AppConfig, ConfigError, ConfigResult};

// Re-export the API client and auth session
pub use api::{ApiClient, ApiError, ApiResult};
pub use auth::{AuthError, AuthResult, AuthSession};

// Re-export dispatch machinery
pub use dispatch::{
    Engine, ReprocessPolicy, RunCounters, RunError, RunResult, TaskPool,
};

// Re-export payload handling and the change-log
pub use hashlog::{ChangeLog, HashlogError, LogEntry};
pub use payload::{Fingerprint, Payload, PayloadError, PayloadResult};

// Re-export schema metadata
pub use metadata::{MetadataProvider, SchemaError, SchemaResult};

// Re-export the operation modes
pub use delete::Deleter;
pub use fetch::{Counter, Fetcher};
pub use report::{RunReport, RunReporter};
pub use send::Sender;
pub use truncate::Truncator;
pub use validate::Validator;
