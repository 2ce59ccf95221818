//! Operation kinds: what a task does, and what an engine sends

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Operation configured for an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CrudOperation {
    /// Create every source record in the target
    Insert,
    /// Update matched target records only
    Update,
    /// Update matched records, insert the rest
    Upsert,
    /// Only read; lets dependents resolve lookups
    Readonly,
    /// Delete matched target records
    Delete,
    /// Delete matched target records permanently (no recycle bin)
    HardDelete,
    /// Delete matched target records in reverse dependency order, before the main pass
    DeleteHierarchy,
    /// Delete the source records themselves
    DeleteSource,
}

impl CrudOperation {
    /// Whether source and target records must be paired by external Id
    pub fn requires_external_id_match(&self) -> bool {
        matches!(
            self,
            Self::Update | Self::Upsert | Self::Delete | Self::HardDelete | Self::DeleteHierarchy
        )
    }

    /// Whether this operation removes target records
    pub fn is_target_delete(&self) -> bool {
        matches!(self, Self::Delete | Self::HardDelete | Self::DeleteHierarchy)
    }

    /// Whether this operation writes records into the target
    pub fn writes_target(&self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Upsert)
    }

    /// Human-readable label
    pub fn label(&self) -> &'static str {
        match self {
            Self::Insert => "Insert",
            Self::Update => "Update",
            Self::Upsert => "Upsert",
            Self::Readonly => "Readonly",
            Self::Delete => "Delete",
            Self::HardDelete => "HardDelete",
            Self::DeleteHierarchy => "DeleteHierarchy",
            Self::DeleteSource => "DeleteSource",
        }
    }
}

impl fmt::Display for CrudOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for CrudOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "upsert" => Ok(Self::Upsert),
            "readonly" => Ok(Self::Readonly),
            "delete" => Ok(Self::Delete),
            "harddelete" => Ok(Self::HardDelete),
            "deletehierarchy" => Ok(Self::DeleteHierarchy),
            "deletesource" => Ok(Self::DeleteSource),
            other => Err(format!("unknown operation '{}'", other)),
        }
    }
}

/// Operation an engine sends to the remote API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApiOperation {
    Insert,
    Update,
    Delete,
    HardDelete,
}

impl ApiOperation {
    /// Name used by the remote API (`insert`, `update`, `delete`, `hardDelete`)
    pub fn api_name(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::HardDelete => "hardDelete",
        }
    }

    /// Whether records sent with this operation must carry an Id
    pub fn requires_id(&self) -> bool {
        !matches!(self, Self::Insert)
    }
}

impl fmt::Display for ApiOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.api_name())
    }
}

/// Preferred API family for an entity's writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiMode {
    /// REST below the bulk threshold, the configured bulk version above it
    #[default]
    Auto,
    /// Always REST
    Rest,
    /// Always Bulk API v1
    BulkV1,
    /// Always Bulk API v2
    BulkV2,
}
