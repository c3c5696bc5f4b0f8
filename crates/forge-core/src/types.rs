//! Core types for the FlowForge orchestrator.
//!
//! Feature records, merge queue items, pending cache operations, and
//! per-project sync state, together with their status enumerations.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Status of a feature in the development lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeatureStatus {
    #[default]
    Planned,
    InProgress,
    Review,
    Completed,
    Blocked,
}

impl FeatureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::InProgress => "in-progress",
            Self::Review => "review",
            Self::Completed => "completed",
            Self::Blocked => "blocked",
        }
    }

    /// Parse a lowercase status string as used in registry files and RPC
    /// arguments.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "planned" => Some(Self::Planned),
            "in-progress" => Some(Self::InProgress),
            "review" => Some(Self::Review),
            "completed" => Some(Self::Completed),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }

    /// All statuses, in lifecycle order.
    pub fn all() -> [Self; 5] {
        [
            Self::Planned,
            Self::InProgress,
            Self::Review,
            Self::Completed,
            Self::Blocked,
        ]
    }
}

/// Estimated complexity of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Small,
    #[default]
    Medium,
    Large,
    Epic,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
            Self::Epic => "epic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "small" => Some(Self::Small),
            "medium" => Some(Self::Medium),
            "large" => Some(Self::Large),
            "epic" => Some(Self::Epic),
            _ => None,
        }
    }
}

/// A feature or sub-feature in the development roadmap.
///
/// Timestamps are RFC 3339 strings so the registry file stays readable and
/// stable across serializers. Unknown optional fields in older registries
/// are tolerated on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Feature {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: FeatureStatus,
    /// 1 = highest, 10 = lowest.
    pub priority: u8,
    pub complexity: Complexity,

    // Hierarchy
    pub parent_id: Option<String>,
    pub children: Vec<String>,

    // Dependencies
    pub depends_on: Vec<String>,
    pub blocked_by: Vec<String>,

    // Git integration
    pub branch: Option<String>,
    pub worktree_path: Option<String>,

    // Timestamps
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,

    // Documentation
    pub spec_path: Option<String>,
    pub prompt_path: Option<String>,
    pub notes: Option<String>,

    // Metadata
    pub tags: Vec<String>,
    /// Coding-assistant session for continuity, if one was recorded.
    pub session_id: Option<String>,
    /// Open extension map for forward compatibility.
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

impl Default for Feature {
    fn default() -> Self {
        let now = now_rfc3339();
        Self {
            id: String::new(),
            title: String::new(),
            description: String::new(),
            status: FeatureStatus::Planned,
            priority: 5,
            complexity: Complexity::Medium,
            parent_id: None,
            children: Vec::new(),
            depends_on: Vec::new(),
            blocked_by: Vec::new(),
            branch: None,
            worktree_path: None,
            created_at: now.clone(),
            updated_at: now,
            completed_at: None,
            spec_path: None,
            prompt_path: None,
            notes: None,
            tags: Vec::new(),
            session_id: None,
            extensions: serde_json::Map::new(),
        }
    }
}

impl Feature {
    /// Create a new planned feature with an id derived from the title.
    pub fn new(title: impl Into<String>) -> Self {
        let title = title.into();
        Self {
            id: generate_id(&title),
            title,
            ..Self::default()
        }
    }

    /// The branch name a feature uses while in progress.
    pub fn branch_name(id: &str) -> String {
        format!("feature/{id}")
    }
}

/// Current timestamp as an RFC 3339 string (UTC, second precision).
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Generate a URL-safe feature identifier from a title.
///
/// Lowercase, strip characters outside `[A-Za-z0-9 _-]`, collapse runs of
/// whitespace/underscore/hyphen to one hyphen, trim hyphens, cap at 50
/// code points. Idempotent: `generate_id(generate_id(t)) == generate_id(t)`.
pub fn generate_id(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut pending_sep = false;
    for c in title.to_lowercase().chars() {
        if c.is_alphanumeric() && c.is_ascii() {
            if pending_sep && !out.is_empty() {
                out.push('-');
            }
            pending_sep = false;
            out.push(c);
        } else if c.is_whitespace() || c == '_' || c == '-' {
            pending_sep = true;
        }
        // Other punctuation is stripped without acting as a separator.
    }
    // Truncation can land on a hyphen; trim again so the result is stable
    // under re-generation.
    let truncated: String = out.chars().take(50).collect();
    truncated.trim_end_matches('-').to_string()
}

/// Status of an item in the merge queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeQueueStatus {
    #[default]
    Pending,
    Validating,
    Ready,
    Conflict,
    Merged,
}

impl MergeQueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Validating => "validating",
            Self::Ready => "ready",
            Self::Conflict => "conflict",
            Self::Merged => "merged",
        }
    }
}

/// An item in the registry's merge queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeQueueItem {
    pub feature_id: String,
    pub queued_at: String,
    pub status: MergeQueueStatus,
    pub validation_status: Option<String>,
    pub conflict_files: Vec<String>,
}

impl Default for MergeQueueItem {
    fn default() -> Self {
        Self {
            feature_id: String::new(),
            queued_at: now_rfc3339(),
            status: MergeQueueStatus::Pending,
            validation_status: None,
            conflict_files: Vec::new(),
        }
    }
}

/// Kind of a mutation queued in the offline cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    AddFeature,
    UpdateFeature,
    DeleteFeature,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddFeature => "add_feature",
            Self::UpdateFeature => "update_feature",
            Self::DeleteFeature => "delete_feature",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "add_feature" => Some(Self::AddFeature),
            "update_feature" => Some(Self::UpdateFeature),
            "delete_feature" => Some(Self::DeleteFeature),
            _ => None,
        }
    }
}

/// Lifecycle status of a pending cache operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    #[default]
    Pending,
    Syncing,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "syncing" => Some(Self::Syncing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A mutation recorded while the workstation was unreachable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: i64,
    pub project_name: String,
    pub operation: OperationKind,
    /// Opaque key/value payload, interpreted by the sync engine.
    pub payload_json: String,
    pub created_at: String,
    pub status: OperationStatus,
    pub error_message: Option<String>,
}

/// Sync status of a cached project relative to the workstation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    #[default]
    Pending,
    Conflict,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Conflict => "conflict",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "synced" => Some(Self::Synced),
            "pending" => Some(Self::Pending),
            "conflict" => Some(Self::Conflict),
            _ => None,
        }
    }
}

/// Per-project sync state tracked by the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSyncState {
    pub project_name: String,
    pub last_sync: Option<String>,
    /// 16-hex-char prefix of the SHA-256 over the canonical registry JSON
    /// last seen on the workstation.
    pub last_mac_registry_hash: Option<String>,
    pub sync_status: SyncStatus,
}
