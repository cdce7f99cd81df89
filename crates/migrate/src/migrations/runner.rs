//! Migration Runner - Synchronises the database with the migration log
//!
//! A run happens in one transaction: ensure the ledger table, read the cursor
//! (highest applied id), apply every action of every newer migration, record
//! each migration in the ledger, commit. Any failure rolls the whole run back,
//! so a retry starts from the same cursor.

use std::time::{Duration, Instant};

use super::definitions::{Migration, MigrationConfig};
use super::manager::MigrationManager;
use super::schema_builder::SchemaBuilder;
use super::snapshot::{self, Snapshot};
use crate::backends::{
    DatabaseBackend, DatabaseConnection, DatabaseConnectionConfig, DatabaseTransaction,
    DatabaseValue, PostgresBackend,
};
use crate::error::{MigrateError, MigrateResult};
use crate::security::escape_identifier;

/// Timeouts applied during a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Upper bound for establishing the connection
    pub connect_timeout: Duration,
    /// Upper bound for each DDL statement; unbounded when `None`
    pub statement_timeout: Option<Duration>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            statement_timeout: None,
        }
    }
}

/// Summary of a run that applied at least one migration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// IDs of migrations that were applied, in order
    pub applied_migrations: Vec<String>,
    /// Number of migrations that were skipped (already applied)
    pub skipped_count: usize,
    /// Number of DDL statements executed for actions
    pub statements_executed: usize,
    /// Total execution time in milliseconds
    pub execution_time_ms: u128,
}

impl SyncReport {
    /// Id of the last migration applied by this run
    pub fn last_applied(&self) -> Option<&str> {
        self.applied_migrations.last().map(String::as_str)
    }
}

/// Result of a sync run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing newer than the ledger cursor; no DDL was executed
    UpToDate { last_applied: Option<String> },
    /// Pending migrations were applied and committed
    Applied(SyncReport),
}

impl SyncOutcome {
    pub fn is_up_to_date(&self) -> bool {
        matches!(self, SyncOutcome::UpToDate { .. })
    }

    /// Highest migration id recorded in the ledger after the run
    pub fn last_applied(&self) -> Option<&str> {
        match self {
            SyncOutcome::UpToDate { last_applied } => last_applied.as_deref(),
            SyncOutcome::Applied(report) => report.last_applied(),
        }
    }
}

/// Migration runner that executes migrations against a database
pub struct MigrationRunner<B: DatabaseBackend = PostgresBackend> {
    manager: MigrationManager,
    backend: B,
    options: SyncOptions,
}

impl MigrationRunner<PostgresBackend> {
    /// Create a new migration runner for PostgreSQL
    pub fn new(manager: MigrationManager) -> Self {
        Self::with_backend(manager, PostgresBackend::new())
    }
}

impl<B: DatabaseBackend> MigrationRunner<B> {
    /// Create a new migration runner on a specific backend
    pub fn with_backend(manager: MigrationManager, backend: B) -> Self {
        Self {
            manager,
            backend,
            options: SyncOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    /// Get the migration manager
    pub fn manager(&self) -> &MigrationManager {
        &self.manager
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Apply every migration newer than the ledger cursor
    ///
    /// The whole log is folded before connecting, so a store that does not
    /// replay cleanly is rejected without touching the database.
    pub async fn run(&self, credentials: &DatabaseConnectionConfig) -> MigrateResult<SyncOutcome> {
        let start_time = Instant::now();

        let migrations = self.manager.list_migrations()?;
        snapshot::fold_migrations(&migrations)?;
        tracing::debug!("Validated {} stored migrations", migrations.len());

        let connection = self
            .backend
            .connect(credentials, self.options.connect_timeout)
            .await?;

        let result = self
            .run_on_connection(connection.as_ref(), &migrations, start_time)
            .await;

        if let Err(e) = connection.close().await {
            tracing::warn!("Failed to close connection: {}", e);
        }

        result
    }

    /// Connect and run a trivial statement
    pub async fn ping(&self, credentials: &DatabaseConnectionConfig) -> MigrateResult<()> {
        let connection = self
            .backend
            .connect(credentials, self.options.connect_timeout)
            .await?;

        let mut tx = connection.begin_transaction().await?;
        let result = tx
            .execute("SELECT 1", &[])
            .await
            .map_err(|e| MigrateError::Connection(format!("can't ping db: {}", e)));
        if let Err(e) = tx.rollback().await {
            tracing::warn!("Failed to roll back ping transaction: {}", e);
        }
        if let Err(e) = connection.close().await {
            tracing::warn!("Failed to close connection: {}", e);
        }

        result.map(|_| ())
    }

    async fn run_on_connection(
        &self,
        connection: &dyn DatabaseConnection,
        migrations: &[Migration],
        start_time: Instant,
    ) -> MigrateResult<SyncOutcome> {
        let mut tx = connection.begin_transaction().await?;

        match self.apply_pending(tx.as_mut(), migrations, start_time).await {
            Ok(outcome) => {
                tx.commit().await?;
                match &outcome {
                    SyncOutcome::UpToDate { .. } => tracing::info!("Database is up to date"),
                    SyncOutcome::Applied(report) => tracing::info!(
                        "Applied {} migrations ({} statements) in {}ms",
                        report.applied_migrations.len(),
                        report.statements_executed,
                        report.execution_time_ms
                    ),
                }
                Ok(outcome)
            }
            Err(err) => {
                tracing::error!("Sync failed, rolling back: {}", err);
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!("Rollback failed: {}", rollback_err);
                }
                Err(err)
            }
        }
    }

    async fn apply_pending(
        &self,
        tx: &mut dyn DatabaseTransaction,
        migrations: &[Migration],
        start_time: Instant,
    ) -> MigrateResult<SyncOutcome> {
        let table = &self.manager.config().migrations_table;

        tx.execute(&self.advisory_lock_sql(), &[DatabaseValue::from(table.as_str())])
            .await
            .map_err(|e| MigrateError::Ledger(format!("can't lock migrations table: {}", e)))?;

        tx.execute(&self.create_migrations_table_sql(), &[])
            .await
            .map_err(|e| MigrateError::Ledger(format!("can't create migrations table: {}", e)))?;

        let cursor = self.read_cursor(tx).await?;
        tracing::debug!("Ledger cursor: '{}'", cursor);

        let split = migrations.partition_point(|migration| migration.id.as_str() <= cursor.as_str());
        let (applied, pending) = migrations.split_at(split);

        if pending.is_empty() {
            return Ok(SyncOutcome::UpToDate {
                last_applied: Some(cursor).filter(|c| !c.is_empty()),
            });
        }

        tracing::info!(
            "{} migrations pending, {} already applied",
            pending.len(),
            applied.len()
        );

        let mut running = snapshot::fold_migrations(applied)?;
        let mut applied_migrations = Vec::with_capacity(pending.len());
        let mut statements_executed = 0;

        for migration in pending {
            tracing::info!("Applying migration: {} - {}", migration.id, migration.description);
            statements_executed += self.apply_migration(tx, migration, &mut running).await?;

            let data = serde_json::to_string(migration)?;
            tx.execute(
                &self.record_migration_sql(),
                &[DatabaseValue::from(migration.id.as_str()), DatabaseValue::from(data)],
            )
            .await
            .map_err(|e| {
                MigrateError::Ledger(format!("can't record migration {}: {}", migration.id, e))
            })?;

            applied_migrations.push(migration.id.clone());
        }

        Ok(SyncOutcome::Applied(SyncReport {
            applied_migrations,
            skipped_count: applied.len(),
            statements_executed,
            execution_time_ms: start_time.elapsed().as_millis(),
        }))
    }

    /// Execute the DDL of one migration, advancing `running` action by action
    async fn apply_migration(
        &self,
        tx: &mut dyn DatabaseTransaction,
        migration: &Migration,
        running: &mut Snapshot,
    ) -> MigrateResult<usize> {
        let mut executed = 0;
        let mut builder = SchemaBuilder::new();

        for (action_index, action) in migration.actions.iter().enumerate() {
            let sync_error = |message: String| MigrateError::Sync {
                migration_id: migration.id.clone(),
                action_index,
                method: action.method(),
                message,
            };

            for statement in builder.action(action, running).take() {
                tracing::debug!("Executing: {}", statement);
                self.execute_statement(tx, &statement)
                    .await
                    .map_err(|message| {
                        tracing::error!(
                            "Action #{} '{}' of migration {} failed: {}",
                            action_index,
                            action.method(),
                            migration.id,
                            message
                        );
                        sync_error(message)
                    })?;
                executed += 1;
            }

            running
                .apply(action)
                .map_err(|reason| sync_error(reason.to_string()))?;
            tracing::debug!("Action #{} '{}' applied", action_index, action.method());
        }

        Ok(executed)
    }

    async fn execute_statement(
        &self,
        tx: &mut dyn DatabaseTransaction,
        statement: &str,
    ) -> Result<(), String> {
        let result = match self.options.statement_timeout {
            Some(limit) => tokio::time::timeout(limit, tx.execute(statement, &[]))
                .await
                .map_err(|_| format!("statement timed out after {:?}", limit))?,
            None => tx.execute(statement, &[]).await,
        };
        result.map(|_| ()).map_err(|e| e.to_string())
    }

    async fn read_cursor(&self, tx: &mut dyn DatabaseTransaction) -> MigrateResult<String> {
        let value = tx
            .fetch_scalar(&self.latest_migration_sql(), &[])
            .await
            .map_err(|e| MigrateError::Ledger(format!("can't read last migration: {}", e)))?;

        match value {
            None | Some(DatabaseValue::Null) => Ok(String::new()),
            Some(DatabaseValue::String(id)) => Ok(id),
            Some(other) => Err(MigrateError::Ledger(format!(
                "unexpected migration id value: {:?}",
                other
            ))),
        }
    }

    /// SQL serialising concurrent runs on the same ledger
    fn advisory_lock_sql(&self) -> String {
        "SELECT pg_advisory_xact_lock(hashtext($1))".to_string()
    }

    /// SQL to create the migrations tracking table
    fn create_migrations_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (id varchar(255) NOT NULL, data text NOT NULL, PRIMARY KEY (id));",
            escape_identifier(&self.manager.config().migrations_table)
        )
    }

    /// SQL to read the highest applied migration id
    fn latest_migration_sql(&self) -> String {
        format!(
            "SELECT id FROM {} ORDER BY id DESC LIMIT 1",
            escape_identifier(&self.manager.config().migrations_table)
        )
    }

    /// SQL to record a migration as applied
    fn record_migration_sql(&self) -> String {
        format!(
            "INSERT INTO {} (id, data) VALUES ($1, $2)",
            escape_identifier(&self.manager.config().migrations_table)
        )
    }
}

/// Sync the store described by `config` into a PostgreSQL database
pub async fn sync(
    config: MigrationConfig,
    credentials: &DatabaseConnectionConfig,
) -> MigrateResult<SyncOutcome> {
    MigrationRunner::new(MigrationManager::with_config(config))
        .run(credentials)
        .await
}

/// Check that a PostgreSQL database is reachable with the given credentials
pub async fn ping(credentials: &DatabaseConnectionConfig) -> MigrateResult<()> {
    MigrationRunner::new(MigrationManager::new())
        .ping(credentials)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(table: &str) -> MigrationRunner {
        let mut config = MigrationConfig::new("migrations");
        config.migrations_table = table.to_string();
        MigrationRunner::new(MigrationManager::with_config(config))
    }

    #[test]
    fn test_ledger_sql_quotes_table_name() {
        let runner = runner("_migrations");

        assert_eq!(
            runner.create_migrations_table_sql(),
            "CREATE TABLE IF NOT EXISTS \"_migrations\" (id varchar(255) NOT NULL, data text NOT NULL, PRIMARY KEY (id));"
        );
        assert_eq!(
            runner.latest_migration_sql(),
            "SELECT id FROM \"_migrations\" ORDER BY id DESC LIMIT 1"
        );
        assert_eq!(
            runner.record_migration_sql(),
            "INSERT INTO \"_migrations\" (id, data) VALUES ($1, $2)"
        );
    }

    #[test]
    fn test_hostile_ledger_name_is_escaped() {
        let runner = runner("m\"; DROP TABLE users; --");
        assert!(runner
            .record_migration_sql()
            .starts_with("INSERT INTO \"m\"\"; DROP TABLE users; --\" "));
    }

    #[test]
    fn test_outcome_last_applied() {
        let up_to_date = SyncOutcome::UpToDate { last_applied: None };
        assert!(up_to_date.is_up_to_date());
        assert_eq!(up_to_date.last_applied(), None);

        let applied = SyncOutcome::Applied(SyncReport {
            applied_migrations: vec!["20240101000000".to_string(), "20240102000000".to_string()],
            skipped_count: 0,
            statements_executed: 3,
            execution_time_ms: 1,
        });
        assert_eq!(applied.last_applied(), Some("20240102000000"));
    }

    #[test]
    fn test_default_options() {
        let options = SyncOptions::default();
        assert_eq!(options.connect_timeout, Duration::from_secs(30));
        assert_eq!(options.statement_timeout, None);
    }
}
