//! Migration Definitions - Core types and structures for migrations
//!
//! Defines the action log vocabulary (the ten schema-change actions and their
//! payloads), the persisted Migration record and the MigrationConfig.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{MigrateError, MigrateResult};

/// Schema version written into every new migration record
pub const SCHEMA_VERSION: &str = "1";

/// On-disk encoding of a migration record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Json,
    Yaml,
}

impl Format {
    /// File extension written for new records
    pub fn extension(&self) -> &'static str {
        match self {
            Format::Json => "json",
            Format::Yaml => "yaml",
        }
    }

    /// Detect the format of a record from its file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "json" => Some(Format::Json),
            "yaml" | "yml" => Some(Format::Yaml),
            _ => None,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl std::str::FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Format::Json),
            "yaml" | "yml" => Ok(Format::Yaml),
            _ => Err(format!("Unsupported migration format: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddTableParams {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteTableParams {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddColumnParams {
    pub table: String,
    pub column: String,
    /// Dialect-specific column type, emitted verbatim
    #[serde(rename = "type")]
    pub column_type: String,
    #[serde(default)]
    pub is_nullable: bool,
    /// Default expression, emitted verbatim; empty means no default
    #[serde(default)]
    pub default_value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteColumnParams {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddPrimaryKeyParams {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletePrimaryKeyParams {
    pub table: String,
    pub column: String,
}

/// Cardinality hint of a relation; not enforced structurally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationType {
    #[default]
    Object,
    Array,
}

/// One local column paired with the remote column it references
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnsMap {
    pub column: String,
    pub remote_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddRelationParams {
    #[serde(rename = "type", default)]
    pub relation_type: RelationType,
    pub name: String,
    pub table: String,
    pub remote_table: String,
    #[serde(default)]
    pub columns_mapping: Vec<ColumnsMap>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRelationParams {
    pub table: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddUniqueConstraintParams {
    pub name: String,
    pub table: String,
    #[serde(default)]
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteUniqueConstraintParams {
    pub table: String,
    pub name: String,
}

/// A single schema-change action as stored in a migration
///
/// Persisted as `{"method": "<name>", "params": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum Action {
    AddTable(AddTableParams),
    DeleteTable(DeleteTableParams),
    AddColumn(AddColumnParams),
    DeleteColumn(DeleteColumnParams),
    AddPrimaryKey(AddPrimaryKeyParams),
    DeletePrimaryKey(DeletePrimaryKeyParams),
    AddRelation(AddRelationParams),
    DeleteRelation(DeleteRelationParams),
    AddUniqueConstraint(AddUniqueConstraintParams),
    DeleteUniqueConstraint(DeleteUniqueConstraintParams),
}

impl Action {
    /// The kind of this action
    pub fn method(&self) -> ActionMethod {
        match self {
            Action::AddTable(_) => ActionMethod::AddTable,
            Action::DeleteTable(_) => ActionMethod::DeleteTable,
            Action::AddColumn(_) => ActionMethod::AddColumn,
            Action::DeleteColumn(_) => ActionMethod::DeleteColumn,
            Action::AddPrimaryKey(_) => ActionMethod::AddPrimaryKey,
            Action::DeletePrimaryKey(_) => ActionMethod::DeletePrimaryKey,
            Action::AddRelation(_) => ActionMethod::AddRelation,
            Action::DeleteRelation(_) => ActionMethod::DeleteRelation,
            Action::AddUniqueConstraint(_) => ActionMethod::AddUniqueConstraint,
            Action::DeleteUniqueConstraint(_) => ActionMethod::DeleteUniqueConstraint,
        }
    }
}

/// Action kind without payload, used for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionMethod {
    AddTable,
    DeleteTable,
    AddColumn,
    DeleteColumn,
    AddPrimaryKey,
    DeletePrimaryKey,
    AddRelation,
    DeleteRelation,
    AddUniqueConstraint,
    DeleteUniqueConstraint,
}

impl ActionMethod {
    /// Name used for the `method` field of persisted actions
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionMethod::AddTable => "addTable",
            ActionMethod::DeleteTable => "deleteTable",
            ActionMethod::AddColumn => "addColumn",
            ActionMethod::DeleteColumn => "deleteColumn",
            ActionMethod::AddPrimaryKey => "addPrimaryKey",
            ActionMethod::DeletePrimaryKey => "deletePrimaryKey",
            ActionMethod::AddRelation => "addRelation",
            ActionMethod::DeleteRelation => "deleteRelation",
            ActionMethod::AddUniqueConstraint => "addUniqueConstraint",
            ActionMethod::DeleteUniqueConstraint => "deleteUniqueConstraint",
        }
    }
}

impl fmt::Display for ActionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a stored migration: an ordered, append-only list of actions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Migration {
    pub schema_version: String,
    /// Unique, sortable identifier: `<YYYYMMDDHHMMSS>[_<slug>]`
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub actions: Vec<Action>,
}

impl Migration {
    /// Create an empty migration
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            id: id.into(),
            description: description.into(),
            actions: Vec::new(),
        }
    }

    /// Encode the record in the given format
    pub fn to_text(&self, format: Format) -> MigrateResult<String> {
        match format {
            Format::Json => Ok(serde_json::to_string_pretty(self)?),
            Format::Yaml => Ok(serde_yaml::to_string(self)?),
        }
    }

    /// Decode a record in the given format
    pub fn from_text(text: &str, format: Format) -> MigrateResult<Self> {
        match format {
            Format::Json => Ok(serde_json::from_str(text)?),
            Format::Yaml => Ok(serde_yaml::from_str(text)?),
        }
    }
}

/// Configuration for the migration system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Directory where migration records are stored
    pub migrations_dir: PathBuf,
    /// Table name of the applied-migrations ledger
    pub migrations_table: String,
    /// Format used for newly created migrations
    pub format: Format,
}

impl MigrationConfig {
    /// Configuration rooted at the given store directory
    pub fn new(migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            migrations_dir: migrations_dir.into(),
            ..Self::default()
        }
    }

    /// Load a configuration from a YAML file
    pub fn load(path: &Path) -> MigrateResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MigrateError::Storage(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            migrations_dir: PathBuf::from("migrations"),
            migrations_table: "_migrations".to_string(),
            format: Format::Json,
        }
    }
}
