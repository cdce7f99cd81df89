//! Migration Manager - File system operations for migrations
//!
//! Owns the migration records on disk: one file per migration, named after its
//! id, in JSON or YAML. Actions are only ever appended to the newest migration,
//! and only after the whole log plus the candidate folds cleanly.
//!
//! The store assumes a single writer per directory. Create and append take an
//! exclusive lock file for their duration so that a second process fails with
//! [`MigrateError::Locked`] instead of interleaving writes.

use chrono::{DateTime, Utc};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use super::definitions::*;
use super::snapshot::{self, Snapshot};
use crate::error::{MigrateError, MigrateResult};

/// Name of the lock file inside the migrations directory
pub const LOCK_FILE_NAME: &str = ".migrations.lock";

const SLUG_MAX_LEN: usize = 50;
const ID_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Lowercase, underscore-separated file-name fragment for a description
///
/// Whitespace becomes `_`, characters other than ASCII letters, digits, `_`
/// and `-` are dropped, and the result is cut to 50 characters.
pub fn slugify(description: &str) -> String {
    description
        .trim()
        .to_lowercase()
        .chars()
        .filter_map(|c| {
            if c.is_whitespace() {
                Some('_')
            } else if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                Some(c)
            } else {
                None
            }
        })
        .take(SLUG_MAX_LEN)
        .collect()
}

/// A migration together with where it lives on disk
#[derive(Debug, Clone)]
struct StoredMigration {
    path: PathBuf,
    format: Format,
    migration: Migration,
}

/// Removes the lock file when dropped
#[derive(Debug)]
struct StoreLock {
    path: PathBuf,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!("Failed to release migration store lock {}: {}", self.path.display(), e);
        }
    }
}

/// Migration manager for creating, loading and extending migrations
#[derive(Debug, Clone)]
pub struct MigrationManager {
    config: MigrationConfig,
}

impl MigrationManager {
    /// Create a new migration manager with default configuration
    pub fn new() -> Self {
        Self::with_config(MigrationConfig::default())
    }

    /// Create a new migration manager with custom configuration
    pub fn with_config(config: MigrationConfig) -> Self {
        Self { config }
    }

    /// Get the configuration
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Create a new, empty migration and return its id
    pub fn create_migration(&self, description: &str, format: Format) -> MigrateResult<String> {
        self.create_migration_at(description, format, Utc::now())
    }

    /// Create a new, empty migration stamped with the given time
    ///
    /// Fails with `DuplicateId` when a migration from the same second (or a
    /// later one) already exists, which keeps ids unique and increasing.
    pub fn create_migration_at(
        &self,
        description: &str,
        format: Format,
        now: DateTime<Utc>,
    ) -> MigrateResult<String> {
        let dir = &self.config.migrations_dir;
        fs::create_dir_all(dir).map_err(|e| {
            MigrateError::Storage(format!(
                "Failed to create migrations directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let _lock = self.lock()?;

        let timestamp = now.format(ID_TIMESTAMP_FORMAT).to_string();
        let slug = slugify(description);
        let id = if slug.is_empty() {
            timestamp.clone()
        } else {
            format!("{}_{}", timestamp, slug)
        };

        if let Some(latest) = self.load()?.last() {
            if latest.migration.id.as_str() >= timestamp.as_str() {
                return Err(MigrateError::DuplicateId(id));
            }
        }

        let migration = Migration::new(id.clone(), description);
        let path = dir.join(format!("{}.{}", id, format.extension()));
        write_record(&path, format, &migration)?;

        tracing::info!("Created migration {}", path.display());
        Ok(id)
    }

    /// Load all migrations, sorted by id
    pub fn list_migrations(&self) -> MigrateResult<Vec<Migration>> {
        Ok(self
            .load()?
            .into_iter()
            .map(|stored| stored.migration)
            .collect())
    }

    /// Load the first migration whose id starts with `id`
    pub fn get_migration(&self, id: &str) -> MigrateResult<Migration> {
        let path = self.resolve_path(id)?;
        Ok(read_record(&path)?.migration)
    }

    /// Raw text of the first migration whose id starts with `id`
    pub fn get_migration_text(&self, id: &str) -> MigrateResult<String> {
        let path = self.resolve_path(id)?;
        fs::read_to_string(&path).map_err(|e| {
            MigrateError::Storage(format!("Failed to read migration {}: {}", path.display(), e))
        })
    }

    /// Validate `action` against the whole log and append it to the newest
    /// migration, returning that migration's id
    ///
    /// Nothing is written when validation fails.
    pub fn append_action(&self, action: Action) -> MigrateResult<String> {
        if !self.config.migrations_dir.is_dir() {
            return Err(MigrateError::NoMigration);
        }

        let _lock = self.lock()?;

        let (locations, mut migrations): (Vec<_>, Vec<_>) = self
            .load()?
            .into_iter()
            .map(|stored| ((stored.path, stored.format), stored.migration))
            .unzip();
        let Some((path, format)) = locations.last() else {
            return Err(MigrateError::NoMigration);
        };

        snapshot::fold_with_candidate(&migrations, &action)?;

        let method = action.method();
        let Some(latest) = migrations.last_mut() else {
            return Err(MigrateError::NoMigration);
        };
        latest.actions.push(action);
        write_record(path, *format, latest)?;

        tracing::debug!(
            "Appended action #{} '{}' to migration {}",
            latest.actions.len() - 1,
            method,
            latest.id
        );
        Ok(latest.id.clone())
    }

    pub fn add_table(&self, name: &str) -> MigrateResult<String> {
        require("table name", name)?;
        self.append_action(Action::AddTable(AddTableParams {
            name: name.to_string(),
        }))
    }

    pub fn delete_table(&self, name: &str) -> MigrateResult<String> {
        require("table name", name)?;
        self.append_action(Action::DeleteTable(DeleteTableParams {
            name: name.to_string(),
        }))
    }

    pub fn add_column(
        &self,
        table: &str,
        column: &str,
        column_type: &str,
        is_nullable: bool,
        default_value: &str,
    ) -> MigrateResult<String> {
        require("table name", table)?;
        require("column name", column)?;
        require("column type", column_type)?;
        self.append_action(Action::AddColumn(AddColumnParams {
            table: table.to_string(),
            column: column.to_string(),
            column_type: column_type.to_string(),
            is_nullable,
            default_value: default_value.to_string(),
        }))
    }

    pub fn delete_column(&self, table: &str, column: &str) -> MigrateResult<String> {
        require("table name", table)?;
        require("column name", column)?;
        self.append_action(Action::DeleteColumn(DeleteColumnParams {
            table: table.to_string(),
            column: column.to_string(),
        }))
    }

    pub fn add_primary_key(&self, table: &str, column: &str) -> MigrateResult<String> {
        require("table name", table)?;
        require("column name", column)?;
        self.append_action(Action::AddPrimaryKey(AddPrimaryKeyParams {
            table: table.to_string(),
            column: column.to_string(),
        }))
    }

    pub fn delete_primary_key(&self, table: &str, column: &str) -> MigrateResult<String> {
        require("table name", table)?;
        require("column name", column)?;
        self.append_action(Action::DeletePrimaryKey(DeletePrimaryKeyParams {
            table: table.to_string(),
            column: column.to_string(),
        }))
    }

    pub fn add_relation(
        &self,
        name: &str,
        relation_type: RelationType,
        table: &str,
        remote_table: &str,
        columns_mapping: Vec<ColumnsMap>,
    ) -> MigrateResult<String> {
        require("table name", table)?;
        require("relation name", name)?;
        require("remote table name", remote_table)?;
        self.append_action(Action::AddRelation(AddRelationParams {
            relation_type,
            name: name.to_string(),
            table: table.to_string(),
            remote_table: remote_table.to_string(),
            columns_mapping,
        }))
    }

    pub fn delete_relation(&self, table: &str, name: &str) -> MigrateResult<String> {
        require("table name", table)?;
        require("relation name", name)?;
        self.append_action(Action::DeleteRelation(DeleteRelationParams {
            table: table.to_string(),
            name: name.to_string(),
        }))
    }

    pub fn add_unique_constraint(
        &self,
        name: &str,
        table: &str,
        columns: Vec<String>,
    ) -> MigrateResult<String> {
        require("table name", table)?;
        require("constraint name", name)?;
        if columns.is_empty() {
            return Err(MigrateError::InvalidArgument("columns"));
        }
        self.append_action(Action::AddUniqueConstraint(AddUniqueConstraintParams {
            name: name.to_string(),
            table: table.to_string(),
            columns,
        }))
    }

    pub fn delete_unique_constraint(&self, table: &str, name: &str) -> MigrateResult<String> {
        require("table name", table)?;
        require("constraint name", name)?;
        self.append_action(Action::DeleteUniqueConstraint(DeleteUniqueConstraintParams {
            table: table.to_string(),
            name: name.to_string(),
        }))
    }

    /// Schema implied by every stored action
    pub fn current_snapshot(&self) -> MigrateResult<Snapshot> {
        snapshot::fold_migrations(&self.list_migrations()?)
    }

    /// Schema as of an action of a migration (all of its actions when `None`)
    pub fn snapshot_for_version(&self, id: &str, action_index: Option<usize>) -> MigrateResult<Snapshot> {
        let target = self.get_migration(id)?;
        snapshot::fold_up_to(&self.list_migrations()?, &target.id, action_index)
    }

    /// Schema just before an action of a migration
    pub fn step_back_snapshot(&self, id: &str, action_index: Option<usize>) -> MigrateResult<Snapshot> {
        let target = self.get_migration(id)?;
        snapshot::step_back(&self.list_migrations()?, &target.id, action_index)
    }

    /// Record files sorted by file name
    fn record_paths(&self) -> MigrateResult<Vec<PathBuf>> {
        let dir = &self.config.migrations_dir;
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(dir).map_err(|e| {
            MigrateError::Storage(format!(
                "Failed to read migrations directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| MigrateError::Storage(format!("Failed to read directory entry: {}", e)))?
                .path();
            if path.is_file() && Format::from_path(&path).is_some() && !is_hidden(&path) {
                paths.push(path);
            }
        }

        paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(paths)
    }

    fn load(&self) -> MigrateResult<Vec<StoredMigration>> {
        let mut stored: Vec<StoredMigration> = Vec::new();
        for path in self.record_paths()? {
            let record = read_record(&path)?;
            if let Some(previous) = stored.last() {
                if previous.migration.id == record.migration.id {
                    return Err(MigrateError::Storage(format!(
                        "migration {} is stored twice ({} and {})",
                        record.migration.id,
                        previous.path.display(),
                        path.display()
                    )));
                }
            }
            stored.push(record);
        }
        Ok(stored)
    }

    fn resolve_path(&self, id: &str) -> MigrateResult<PathBuf> {
        self.record_paths()?
            .into_iter()
            .find(|path| file_stem(path).is_some_and(|stem| stem.starts_with(id)))
            .ok_or_else(|| MigrateError::NotFound(id.to_string()))
    }

    fn lock(&self) -> MigrateResult<StoreLock> {
        let path = self.config.migrations_dir.join(LOCK_FILE_NAME);
        OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => MigrateError::Locked(format!(
                    "lock file {} is held by another process",
                    path.display()
                )),
                _ => MigrateError::Storage(format!(
                    "Failed to create lock file {}: {}",
                    path.display(),
                    e
                )),
            })?;
        Ok(StoreLock { path })
    }
}

impl Default for MigrationManager {
    fn default() -> Self {
        Self::new()
    }
}

fn require(what: &'static str, value: &str) -> MigrateResult<()> {
    if value.trim().is_empty() {
        return Err(MigrateError::InvalidArgument(what));
    }
    Ok(())
}

fn file_stem(path: &Path) -> Option<&str> {
    path.file_stem().and_then(|stem| stem.to_str())
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.'))
}

fn read_record(path: &Path) -> MigrateResult<StoredMigration> {
    let id = file_stem(path).unwrap_or_default().to_string();
    let format = Format::from_path(path)
        .ok_or_else(|| MigrateError::Storage(format!("unknown migration format: {}", path.display())))?;

    let text = fs::read_to_string(path)
        .map_err(|e| MigrateError::Storage(format!("can't read migration {}: {}", id, e)))?;
    let migration = Migration::from_text(&text, format)
        .map_err(|e| MigrateError::Storage(format!("can't parse migration {}: {}", id, e)))?;

    if migration.id != id {
        return Err(MigrateError::Storage(format!(
            "migration file {} declares id '{}'",
            path.display(),
            migration.id
        )));
    }

    Ok(StoredMigration {
        path: path.to_path_buf(),
        format,
        migration,
    })
}

/// Write the whole record to a sibling temporary file, then rename it over
/// the target
fn write_record(path: &Path, format: Format, migration: &Migration) -> MigrateResult<()> {
    let text = migration.to_text(format)?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| MigrateError::Storage(format!("invalid migration path {}", path.display())))?;
    let temp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    fs::write(&temp, text)
        .map_err(|e| MigrateError::Storage(format!("can't write migration {}: {}", temp.display(), e)))?;
    fs::rename(&temp, path).map_err(|e| {
        let _ = fs::remove_file(&temp);
        MigrateError::Storage(format!("can't write migration {}: {}", path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> MigrationManager {
        MigrationManager::with_config(MigrationConfig::new(dir.path()))
    }

    fn at(second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, second).unwrap()
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Create Users Table"), "create_users_table");
        assert_eq!(slugify("  add e-mail/phone  "), "add_e-mailphone");
        assert_eq!(slugify(&"x".repeat(80)).len(), 50);
        assert_eq!(slugify(""), "");
    }

    #[test]
    fn test_create_migration_writes_empty_record() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let id = manager
            .create_migration_at("Create users", Format::Json, at(0))
            .unwrap();
        assert_eq!(id, "20240301120000_create_users");

        let path = dir.path().join("20240301120000_create_users.json");
        let text = fs::read_to_string(path).unwrap();
        assert!(text.contains("\"schemaVersion\": \"1\""));
        assert!(text.contains("\"description\": \"Create users\""));

        let migration = manager.get_migration(&id).unwrap();
        assert!(migration.actions.is_empty());
        assert!(!dir.path().join(LOCK_FILE_NAME).exists());
    }

    #[test]
    fn test_same_second_is_duplicate() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        manager.create_migration_at("first", Format::Json, at(5)).unwrap();
        let err = manager
            .create_migration_at("second", Format::Json, at(5))
            .unwrap_err();
        assert!(matches!(err, MigrateError::DuplicateId(id) if id == "20240301120005_second"));

        let err = manager.create_migration_at("", Format::Json, at(4)).unwrap_err();
        assert!(matches!(err, MigrateError::DuplicateId(_)));
        assert_eq!(manager.list_migrations().unwrap().len(), 1);
    }

    #[test]
    fn test_list_is_sorted_across_formats() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        manager.create_migration_at("one", Format::Yaml, at(1)).unwrap();
        manager.create_migration_at("two", Format::Json, at(2)).unwrap();
        manager.create_migration_at("", Format::Yaml, at(3)).unwrap();
        fs::write(dir.path().join("README.md"), "notes").unwrap();

        let ids: Vec<String> = manager
            .list_migrations()
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(
            ids,
            vec!["20240301120001_one", "20240301120002_two", "20240301120003"]
        );
    }

    #[test]
    fn test_list_fails_on_corrupt_record() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        manager.create_migration_at("ok", Format::Json, at(1)).unwrap();
        fs::write(dir.path().join("20240301120002_broken.json"), "{ not json").unwrap();

        let err = manager.list_migrations().unwrap_err();
        assert!(matches!(err, MigrateError::Storage(_)));
        assert!(err.to_string().contains("20240301120002_broken"));
    }

    #[test]
    fn test_missing_directory_lists_nothing() {
        let dir = TempDir::new().unwrap();
        let manager =
            MigrationManager::with_config(MigrationConfig::new(dir.path().join("absent")));

        assert!(manager.list_migrations().unwrap().is_empty());
        assert!(matches!(manager.add_table("users"), Err(MigrateError::NoMigration)));
    }

    #[test]
    fn test_get_by_prefix() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        manager.create_migration_at("init", Format::Json, at(1)).unwrap();
        manager.create_migration_at("users", Format::Json, at(2)).unwrap();

        assert_eq!(manager.get_migration("20240301120002").unwrap().description, "users");
        assert!(manager.get_migration_text("20240301120001").unwrap().contains("\"init\""));
        assert!(matches!(
            manager.get_migration("20250101"),
            Err(MigrateError::NotFound(_))
        ));
    }

    #[test]
    fn test_append_requires_migration() {
        let dir = TempDir::new().unwrap();
        let err = manager(&dir).add_table("users").unwrap_err();
        assert!(matches!(err, MigrateError::NoMigration));
    }

    #[test]
    fn test_append_goes_to_latest_migration() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        manager.create_migration_at("init", Format::Json, at(1)).unwrap();
        manager.add_table("users").unwrap();
        manager.create_migration_at("more", Format::Yaml, at(2)).unwrap();
        let id = manager.add_column("users", "id", "integer", false, "").unwrap();
        assert_eq!(id, "20240301120002_more");

        let migrations = manager.list_migrations().unwrap();
        assert_eq!(migrations[0].actions.len(), 1);
        assert_eq!(migrations[1].actions.len(), 1);
        assert_eq!(migrations[1].actions[0].method(), ActionMethod::AddColumn);

        let text = manager.get_migration_text(&id).unwrap();
        assert!(text.contains("method: addColumn"));
    }

    #[test]
    fn test_rejected_append_leaves_store_untouched() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let id = manager.create_migration_at("init", Format::Json, at(1)).unwrap();
        manager.add_table("users").unwrap();
        let before = manager.get_migration_text(&id).unwrap();

        let err = manager.add_table("users").unwrap_err();
        assert!(matches!(err, MigrateError::Validation { position: 1, .. }));

        assert_eq!(manager.get_migration(&id).unwrap().actions.len(), 1);
        assert_eq!(manager.get_migration_text(&id).unwrap(), before);
        assert!(!dir.path().join(LOCK_FILE_NAME).exists());
    }

    #[test]
    fn test_blank_arguments_are_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.create_migration_at("init", Format::Json, at(1)).unwrap();

        let err = manager.add_table("  ").unwrap_err();
        assert_eq!(err.to_string(), "table name is required");
        assert!(matches!(
            manager.add_column("users", "id", "", false, ""),
            Err(MigrateError::InvalidArgument("column type"))
        ));
        assert!(matches!(
            manager.add_unique_constraint("uq", "users", Vec::new()),
            Err(MigrateError::InvalidArgument("columns"))
        ));
    }

    #[test]
    fn test_held_lock_blocks_writers() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.create_migration_at("init", Format::Json, at(1)).unwrap();

        fs::write(dir.path().join(LOCK_FILE_NAME), "").unwrap();
        assert!(matches!(manager.add_table("users"), Err(MigrateError::Locked(_))));
        assert!(manager.get_migration("2024").unwrap().actions.is_empty());
    }

    #[test]
    fn test_time_travel_snapshots() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        manager.create_migration_at("users", Format::Json, at(1)).unwrap();
        manager.add_table("users").unwrap();
        manager.add_column("users", "id", "integer", false, "").unwrap();
        manager.add_primary_key("users", "id").unwrap();
        manager.create_migration_at("posts", Format::Json, at(2)).unwrap();
        manager.add_table("posts").unwrap();

        let current = manager.current_snapshot().unwrap();
        assert!(current.table("posts").is_some());

        let users = manager.snapshot_for_version("20240301120001", Some(1)).unwrap();
        assert!(users.table("users").unwrap().primary_keys.is_empty());
        assert!(users.table("posts").is_none());

        let back = manager.step_back_snapshot("20240301120001", None).unwrap();
        assert!(back.table("users").unwrap().has_column("id"));
        assert!(back.table("users").unwrap().primary_keys.is_empty());
    }
}
