//! Snapshot Engine - replays an action log into a logical schema
//!
//! A [`Snapshot`] is never persisted. It is recomputed by folding actions in
//! order, starting from an empty schema; the same action sequence always yields
//! the same snapshot. Lookups hand out positions or `&mut` borrows into the
//! owning collections so mutations land on the snapshot itself.

use serde::{Deserialize, Serialize};

use super::definitions::*;
use super::schema_builder::primary_key_constraint_name;
use crate::error::{MigrateError, MigrateResult, SnapshotError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
    pub is_nullable: bool,
    pub default_value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    #[serde(rename = "type")]
    pub relation_type: RelationType,
    pub name: String,
    pub remote_table: String,
    pub columns_mapping: Vec<ColumnsMap>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueConstraint {
    pub name: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    /// Key columns in the order they were added
    pub primary_keys: Vec<String>,
    pub relations: Vec<Relation>,
    pub unique_constraints: Vec<UniqueConstraint>,
}

impl Table {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            columns: Vec::new(),
            primary_keys: Vec::new(),
            relations: Vec::new(),
            unique_constraints: Vec::new(),
        }
    }

    /// Position of a column within `columns`
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.iter().find(|relation| relation.name == name)
    }

    pub fn unique_constraint(&self, name: &str) -> Option<&UniqueConstraint> {
        self.unique_constraints
            .iter()
            .find(|constraint| constraint.name == name)
    }

    fn require_column(&self, name: &str) -> Result<usize, SnapshotError> {
        self.column_index(name).ok_or_else(|| {
            SnapshotError::Invalid(format!(
                "column '{}' doesn't exist in table '{}'",
                name, self.name
            ))
        })
    }

    /// Name of the first key, constraint or relation that uses the column
    fn column_usage(&self, column: &str) -> Option<String> {
        if self.primary_keys.iter().any(|key| key == column) {
            return Some("primary key".to_string());
        }
        if let Some(constraint) = self
            .unique_constraints
            .iter()
            .find(|constraint| constraint.columns.iter().any(|c| c == column))
        {
            return Some(format!("unique constraint '{}'", constraint.name));
        }
        self.relations
            .iter()
            .find(|relation| relation.columns_mapping.iter().any(|m| m.column == column))
            .map(|relation| format!("relation '{}'", relation.name))
    }

    /// Relations, unique constraints and the primary key share one namespace
    fn constraint_name_taken(&self, name: &str) -> bool {
        name == primary_key_constraint_name(&self.name)
            || self.relation(name).is_some()
            || self.unique_constraint(name).is_some()
    }
}

/// The logical schema implied by a prefix of the action log
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tables: Vec<Table>,
}

impl Snapshot {
    /// Empty schema
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold an ordered action sequence into a fresh snapshot
    ///
    /// Stops at the first failing action; the error carries its position
    /// within the sequence and its method.
    pub fn fold<'a, I>(actions: I) -> MigrateResult<Self>
    where
        I: IntoIterator<Item = &'a Action>,
    {
        let mut snapshot = Self::new();
        for (position, action) in actions.into_iter().enumerate() {
            snapshot
                .apply(action)
                .map_err(|reason| MigrateError::Validation {
                    position,
                    method: action.method(),
                    reason,
                })?;
        }
        Ok(snapshot)
    }

    /// Position of a table within `tables`
    pub fn table_index(&self, name: &str) -> Option<usize> {
        self.tables.iter().position(|table| table.name == name)
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|table| table.name == name)
    }

    /// Mutable borrow of a table; every field may be changed except `name`,
    /// which would break the uniqueness of table names.
    pub fn table_mut(&mut self, name: &str) -> Option<&mut Table> {
        self.tables.iter_mut().find(|table| table.name == name)
    }

    fn require_table(&mut self, name: &str) -> Result<&mut Table, SnapshotError> {
        self.table_mut(name)
            .ok_or_else(|| SnapshotError::Invalid(format!("table '{}' doesn't exist", name)))
    }

    /// Apply one action in place
    ///
    /// On error the snapshot is left unchanged.
    pub fn apply(&mut self, action: &Action) -> Result<(), SnapshotError> {
        match action {
            Action::AddTable(params) => self.add_table(params),
            Action::DeleteTable(params) => self.delete_table(params),
            Action::AddColumn(params) => self.add_column(params),
            Action::DeleteColumn(params) => self.delete_column(params),
            Action::AddPrimaryKey(params) => self.add_primary_key(params),
            Action::DeletePrimaryKey(params) => self.delete_primary_key(params),
            Action::AddRelation(params) => self.add_relation(params),
            Action::DeleteRelation(params) => self.delete_relation(params),
            Action::AddUniqueConstraint(params) => self.add_unique_constraint(params),
            Action::DeleteUniqueConstraint(params) => self.delete_unique_constraint(params),
        }
    }

    fn add_table(&mut self, params: &AddTableParams) -> Result<(), SnapshotError> {
        if self.table_index(&params.name).is_some() {
            return Err(SnapshotError::Invalid(format!(
                "table '{}' already exists",
                params.name
            )));
        }

        self.tables.push(Table::new(&params.name));
        Ok(())
    }

    fn delete_table(&mut self, params: &DeleteTableParams) -> Result<(), SnapshotError> {
        let index = self.table_index(&params.name).ok_or_else(|| {
            SnapshotError::Invalid(format!("table '{}' doesn't exist", params.name))
        })?;

        if let Some((table, relation)) = self.tables.iter().find_map(|table| {
            table
                .relations
                .iter()
                .find(|relation| relation.remote_table == params.name && table.name != params.name)
                .map(|relation| (&table.name, &relation.name))
        }) {
            return Err(SnapshotError::Invalid(format!(
                "table '{}' is referenced by relation '{}' of table '{}'",
                params.name, relation, table
            )));
        }

        self.tables.remove(index);
        Ok(())
    }

    fn add_column(&mut self, params: &AddColumnParams) -> Result<(), SnapshotError> {
        let table = self.require_table(&params.table)?;

        if table.has_column(&params.column) {
            return Err(SnapshotError::Invalid(format!(
                "column '{}' already exists in table '{}'",
                params.column, params.table
            )));
        }

        table.columns.push(Column {
            name: params.column.clone(),
            column_type: params.column_type.clone(),
            is_nullable: params.is_nullable,
            default_value: params.default_value.clone(),
        });
        Ok(())
    }

    fn delete_column(&mut self, params: &DeleteColumnParams) -> Result<(), SnapshotError> {
        if let Some((table, relation)) = self.tables.iter().find_map(|table| {
            table
                .relations
                .iter()
                .find(|relation| {
                    relation.remote_table == params.table
                        && relation
                            .columns_mapping
                            .iter()
                            .any(|mapping| mapping.remote_column == params.column)
                })
                .map(|relation| (&table.name, &relation.name))
        }) {
            return Err(SnapshotError::Invalid(format!(
                "column '{}' of table '{}' is referenced by relation '{}' of table '{}'",
                params.column, params.table, relation, table
            )));
        }

        let table = self.require_table(&params.table)?;
        let index = table.require_column(&params.column)?;

        if let Some(usage) = table.column_usage(&params.column) {
            return Err(SnapshotError::Invalid(format!(
                "column '{}' of table '{}' is used by {}",
                params.column, params.table, usage
            )));
        }

        table.columns.remove(index);
        Ok(())
    }

    fn add_primary_key(&mut self, params: &AddPrimaryKeyParams) -> Result<(), SnapshotError> {
        let table = self.require_table(&params.table)?;
        table.require_column(&params.column)?;

        if table.primary_keys.iter().any(|key| key == &params.column) {
            return Err(SnapshotError::Invalid(format!(
                "primary key for column '{}' already exists",
                params.column
            )));
        }

        table.primary_keys.push(params.column.clone());
        Ok(())
    }

    fn delete_primary_key(&mut self, params: &DeletePrimaryKeyParams) -> Result<(), SnapshotError> {
        let table = self.require_table(&params.table)?;
        table.require_column(&params.column)?;

        let index = table
            .primary_keys
            .iter()
            .position(|key| key == &params.column)
            .ok_or_else(|| {
                SnapshotError::Invalid(format!(
                    "primary key for column '{}' doesn't exist",
                    params.column
                ))
            })?;

        table.primary_keys.remove(index);
        Ok(())
    }

    fn add_relation(&mut self, params: &AddRelationParams) -> Result<(), SnapshotError> {
        if params.name.trim().is_empty() {
            return Err(SnapshotError::Invalid("relation name is required".to_string()));
        }
        if params.columns_mapping.is_empty() {
            return Err(SnapshotError::Invalid(format!(
                "relation '{}' needs at least one column mapping",
                params.name
            )));
        }

        let remote = self.table(&params.remote_table).ok_or_else(|| {
            SnapshotError::Invalid(format!(
                "remote table '{}' doesn't exist",
                params.remote_table
            ))
        })?;
        if let Some(mapping) = params
            .columns_mapping
            .iter()
            .find(|mapping| !remote.has_column(&mapping.remote_column))
        {
            return Err(SnapshotError::Invalid(format!(
                "column '{}' doesn't exist in remote table '{}'",
                mapping.remote_column, params.remote_table
            )));
        }

        let table = self.require_table(&params.table)?;
        for mapping in &params.columns_mapping {
            table.require_column(&mapping.column)?;
        }
        if table.constraint_name_taken(&params.name) {
            return Err(SnapshotError::Invalid(format!(
                "constraint '{}' already exists in table '{}'",
                params.name, params.table
            )));
        }

        table.relations.push(Relation {
            relation_type: params.relation_type,
            name: params.name.clone(),
            remote_table: params.remote_table.clone(),
            columns_mapping: params.columns_mapping.clone(),
        });
        Ok(())
    }

    fn delete_relation(&mut self, params: &DeleteRelationParams) -> Result<(), SnapshotError> {
        if params.name.trim().is_empty() {
            return Err(SnapshotError::Invalid("relation name is required".to_string()));
        }

        let table = self.require_table(&params.table)?;
        let index = table
            .relations
            .iter()
            .position(|relation| relation.name == params.name)
            .ok_or_else(|| SnapshotError::NotFound(format!("relation \"{}\"", params.name)))?;

        table.relations.remove(index);
        Ok(())
    }

    fn add_unique_constraint(
        &mut self,
        params: &AddUniqueConstraintParams,
    ) -> Result<(), SnapshotError> {
        if params.name.trim().is_empty() {
            return Err(SnapshotError::Invalid("constraint name is required".to_string()));
        }

        let table = self.require_table(&params.table)?;

        if params.columns.is_empty() {
            return Err(SnapshotError::Invalid("columns are required".to_string()));
        }
        for column in &params.columns {
            table.require_column(column)?;
        }
        if table.constraint_name_taken(&params.name) {
            return Err(SnapshotError::Invalid(format!(
                "constraint '{}' already exists in table '{}'",
                params.name, params.table
            )));
        }

        table.unique_constraints.push(UniqueConstraint {
            name: params.name.clone(),
            columns: params.columns.clone(),
        });
        Ok(())
    }

    fn delete_unique_constraint(
        &mut self,
        params: &DeleteUniqueConstraintParams,
    ) -> Result<(), SnapshotError> {
        if params.name.trim().is_empty() {
            return Err(SnapshotError::Invalid("constraint name is required".to_string()));
        }

        let table = self.require_table(&params.table)?;
        let index = table
            .unique_constraints
            .iter()
            .position(|constraint| constraint.name == params.name)
            .ok_or_else(|| SnapshotError::NotFound(format!("constraint \"{}\"", params.name)))?;

        table.unique_constraints.remove(index);
        Ok(())
    }
}

/// Actions of `migrations` up to a stop point, in log order
///
/// Includes every migration before `stop_id` and the actions of `stop_id`
/// up to and including `stop_action` (all of them when `None`).
pub fn actions_up_to<'a>(
    migrations: &'a [Migration],
    stop_id: &str,
    stop_action: Option<usize>,
) -> MigrateResult<Vec<&'a Action>> {
    let stop = migrations
        .iter()
        .position(|migration| migration.id == stop_id)
        .ok_or_else(|| MigrateError::NotFound(stop_id.to_string()))?;

    let mut actions: Vec<&Action> = migrations[..stop]
        .iter()
        .flat_map(|migration| migration.actions.iter())
        .collect();

    let last = &migrations[stop].actions;
    let take = match stop_action {
        Some(index) => (index + 1).min(last.len()),
        None => last.len(),
    };
    actions.extend(last[..take].iter());

    Ok(actions)
}

/// Fold every action of every migration
pub fn fold_migrations(migrations: &[Migration]) -> MigrateResult<Snapshot> {
    Snapshot::fold(migrations.iter().flat_map(|migration| migration.actions.iter()))
}

/// Fold the log up to and including the given action of `stop_id`
pub fn fold_up_to(
    migrations: &[Migration],
    stop_id: &str,
    stop_action: Option<usize>,
) -> MigrateResult<Snapshot> {
    Snapshot::fold(actions_up_to(migrations, stop_id, stop_action)?)
}

/// Fold the log up to the given action of `stop_id`, minus that last action
pub fn step_back(
    migrations: &[Migration],
    stop_id: &str,
    stop_action: Option<usize>,
) -> MigrateResult<Snapshot> {
    let mut actions = actions_up_to(migrations, stop_id, stop_action)?;
    actions.pop();
    Snapshot::fold(actions)
}

/// Fold the stored log followed by a candidate action
pub fn fold_with_candidate(migrations: &[Migration], candidate: &Action) -> MigrateResult<Snapshot> {
    Snapshot::fold(
        migrations
            .iter()
            .flat_map(|migration| migration.actions.iter())
            .chain(std::iter::once(candidate)),
    )
}
