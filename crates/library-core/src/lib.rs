//! Library-Core: domain logic of the package library pipeline
//!
//! ## Key Components
//!
//! - `version`: PEP 440 style ordering and release classification
//! - `resolver`: newest-ready-build selection per distro
//! - `build`: immutable build configs and the contexts chains thread through
//! - `channel`: channel directories, package file promotion, reindexing
//! - `settings`: process configuration built once at startup
//! - `error`: per-concern errors and the shared `ErrorClass` taxonomy

pub mod build;
pub mod channel;
pub mod error;
pub mod fakes;
pub mod obs;
pub mod resolver;
pub mod settings;
pub mod telemetry;
pub mod version;

pub use build::{
    BuildConfig, BuildContext, BuildKind, DistroBuildConfig, DistroBuildRequest,
    PackageBuildConfig, PackageBuildRequest, SweepContext,
};
pub use channel::{ChannelIndexer, CommandIndexer};
pub use error::{ChannelError, Classify, ConfigError, ErrorClass, TransientKind, VersionError};
pub use resolver::{resolve, IntegrationPlan, PackageVersions};
pub use settings::{IntegrationRepo, RetryWindow, Settings};
pub use version::{is_older, is_release, Version};
