//! forge-core - shared types and registry logic for FlowForge.
//!
//! The daemon crate (`forged`) builds on these: feature records and status
//! enums, the on-disk registry with its planned-feature cap, project
//! configuration, path translation between device namespaces, and the
//! parsing of assistant completion output.

pub mod completion;
pub mod config;
pub mod paths;
pub mod prompt;
pub mod registry;
pub mod types;

pub use config::{find_project_root, ForgeConfig, ProjectConfig};
pub use paths::PathTranslator;
pub use registry::{
    compute_registry_hash, FeaturePatch, FeatureRegistry, RegistryDocument, RegistryError,
    MAX_PLANNED_FEATURES,
};
pub use types::{
    generate_id, Complexity, Feature, FeatureStatus, MergeQueueItem, MergeQueueStatus,
    OperationKind, OperationStatus, PendingOperation, ProjectSyncState, SyncStatus,
};
