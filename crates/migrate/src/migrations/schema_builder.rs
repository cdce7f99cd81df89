//! Schema Builder - PostgreSQL DDL for migration actions
//!
//! Turns actions into DDL statements. All identifiers are quoted through
//! [`escape_identifier`]; column types and default expressions are opaque
//! dialect text and are emitted as given.

use super::definitions::*;
use super::snapshot::Snapshot;
use crate::security::{escape_identifier, escape_identifier_list};

/// Name of the primary-key constraint of a table
pub fn primary_key_constraint_name(table: &str) -> String {
    format!("{}_pkey", table)
}

/// Accumulates DDL statements
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    statements: Vec<String>,
}

impl SchemaBuilder {
    /// Create a new schema builder
    pub fn new() -> Self {
        Self {
            statements: Vec::new(),
        }
    }

    /// Create an empty table
    pub fn create_table(&mut self, table: &str) -> &mut Self {
        self.statements
            .push(format!("CREATE TABLE {} ();", escape_identifier(table)));
        self
    }

    /// Drop a table
    pub fn drop_table(&mut self, table: &str) -> &mut Self {
        self.statements
            .push(format!("DROP TABLE {};", escape_identifier(table)));
        self
    }

    /// Add a column to an existing table
    pub fn add_column(
        &mut self,
        table: &str,
        column: &str,
        column_type: &str,
        is_nullable: bool,
        default_value: &str,
    ) -> &mut Self {
        let mut sql = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            escape_identifier(table),
            escape_identifier(column),
            column_type
        );
        if !is_nullable {
            sql.push_str(" NOT NULL");
        }
        if !default_value.is_empty() {
            sql.push_str(" DEFAULT ");
            sql.push_str(default_value);
        }
        sql.push(';');

        self.statements.push(sql);
        self
    }

    /// Drop a column from an existing table
    pub fn drop_column(&mut self, table: &str, column: &str) -> &mut Self {
        self.statements.push(format!(
            "ALTER TABLE {} DROP COLUMN {};",
            escape_identifier(table),
            escape_identifier(column)
        ));
        self
    }

    /// Drop a named constraint
    pub fn drop_constraint(&mut self, table: &str, constraint: &str) -> &mut Self {
        self.statements.push(format!(
            "ALTER TABLE {} DROP CONSTRAINT {};",
            escape_identifier(table),
            escape_identifier(constraint)
        ));
        self
    }

    /// Add the primary-key constraint over all key columns
    pub fn primary_key<S: AsRef<str>>(&mut self, table: &str, columns: &[S]) -> &mut Self {
        self.statements.push(format!(
            "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY ({});",
            escape_identifier(table),
            escape_identifier(&primary_key_constraint_name(table)),
            escape_identifier_list(columns)
        ));
        self
    }

    /// Add a foreign key constraint
    pub fn foreign_key(
        &mut self,
        table: &str,
        name: &str,
        remote_table: &str,
        mapping: &[ColumnsMap],
    ) -> &mut Self {
        let columns: Vec<&str> = mapping.iter().map(|m| m.column.as_str()).collect();
        let remote_columns: Vec<&str> = mapping.iter().map(|m| m.remote_column.as_str()).collect();

        self.statements.push(format!(
            "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) \
             MATCH SIMPLE ON UPDATE NO ACTION ON DELETE NO ACTION;",
            escape_identifier(table),
            escape_identifier(name),
            escape_identifier_list(&columns),
            escape_identifier(remote_table),
            escape_identifier_list(&remote_columns)
        ));
        self
    }

    /// Add a unique constraint
    pub fn unique<S: AsRef<str>>(&mut self, table: &str, name: &str, columns: &[S]) -> &mut Self {
        self.statements.push(format!(
            "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({});",
            escape_identifier(table),
            escape_identifier(name),
            escape_identifier_list(columns)
        ));
        self
    }

    /// Emit the statements for one action
    ///
    /// `before` is the schema just before the action. Primary keys are
    /// rebuilt as one constraint over the complete key list, so both key
    /// actions read the current key columns from it.
    pub fn action(&mut self, action: &Action, before: &Snapshot) -> &mut Self {
        match action {
            Action::AddTable(params) => self.create_table(&params.name),
            Action::DeleteTable(params) => self.drop_table(&params.name),
            Action::AddColumn(params) => self.add_column(
                &params.table,
                &params.column,
                &params.column_type,
                params.is_nullable,
                &params.default_value,
            ),
            Action::DeleteColumn(params) => self.drop_column(&params.table, &params.column),
            Action::AddPrimaryKey(params) => {
                let mut keys = current_keys(before, &params.table);
                if !keys.is_empty() {
                    self.drop_constraint(&params.table, &primary_key_constraint_name(&params.table));
                }
                keys.push(params.column.clone());
                self.primary_key(&params.table, &keys)
            }
            Action::DeletePrimaryKey(params) => {
                let remaining: Vec<String> = current_keys(before, &params.table)
                    .into_iter()
                    .filter(|key| key != &params.column)
                    .collect();
                self.drop_constraint(&params.table, &primary_key_constraint_name(&params.table));
                if !remaining.is_empty() {
                    self.primary_key(&params.table, &remaining);
                }
                self
            }
            Action::AddRelation(params) => self.foreign_key(
                &params.table,
                &params.name,
                &params.remote_table,
                &params.columns_mapping,
            ),
            Action::DeleteRelation(params) => self.drop_constraint(&params.table, &params.name),
            Action::AddUniqueConstraint(params) => {
                self.unique(&params.table, &params.name, &params.columns)
            }
            Action::DeleteUniqueConstraint(params) => {
                self.drop_constraint(&params.table, &params.name)
            }
        }
    }

    /// Get all SQL statements
    pub fn to_sql(&self) -> Vec<String> {
        self.statements.clone()
    }

    /// Take the statements, leaving the builder empty
    pub fn take(&mut self) -> Vec<String> {
        std::mem::take(&mut self.statements)
    }

    /// All statements as a single SQL string
    pub fn build(&self) -> String {
        self.statements.join("\n")
    }
}

fn current_keys(snapshot: &Snapshot, table: &str) -> Vec<String> {
    snapshot
        .table(table)
        .map(|table| table.primary_keys.clone())
        .unwrap_or_default()
}
