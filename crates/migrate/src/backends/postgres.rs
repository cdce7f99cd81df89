//! PostgreSQL Backend Implementation
//!
//! Implements the driver seam with sqlx. A sync run holds a single pooled
//! connection and one transaction on it.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{Pool, Postgres, Row};
use std::str::FromStr;
use std::time::Duration;

use super::core::*;
use crate::error::{MigrateError, MigrateResult};

/// PostgreSQL database backend implementation
#[derive(Debug, Default)]
pub struct PostgresBackend;

impl PostgresBackend {
    /// Create a new PostgreSQL backend instance
    pub fn new() -> Self {
        Self
    }

    fn connect_options(config: &DatabaseConnectionConfig) -> MigrateResult<PgConnectOptions> {
        let mut options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database);

        if let Some(username) = &config.username {
            options = options.username(username);
        }
        if let Some(password) = &config.password {
            options = options.password(password);
        }
        if let Some(ssl_mode) = &config.ssl_mode {
            let mode = PgSslMode::from_str(ssl_mode)
                .map_err(|e| MigrateError::Connection(format!("Invalid sslmode '{}': {}", ssl_mode, e)))?;
            options = options.ssl_mode(mode);
        }
        if let Some(name) = config.additional_params.get("application_name") {
            options = options.application_name(name);
        }

        Ok(options)
    }
}

#[async_trait]
impl DatabaseBackend for PostgresBackend {
    async fn connect(
        &self,
        config: &DatabaseConnectionConfig,
        connect_timeout: Duration,
    ) -> MigrateResult<Box<dyn DatabaseConnection>> {
        let options = Self::connect_options(config)?;

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(connect_timeout)
            .connect_with(options)
            .await
            .map_err(|e| MigrateError::Connection(format!("can't connect to db: {}", e)))?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| MigrateError::Connection(format!("can't connect to db: {}", e)))?;

        tracing::info!("Connected to db {}", config.display_target());
        Ok(Box::new(PostgresConnection { pool }))
    }
}

/// PostgreSQL connection implementation
pub struct PostgresConnection {
    pool: Pool<Postgres>,
}

#[async_trait]
impl DatabaseConnection for PostgresConnection {
    async fn begin_transaction(&self) -> MigrateResult<Box<dyn DatabaseTransaction>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| MigrateError::Database(format!("can't start transaction: {}", e)))?;

        Ok(Box::new(PostgresTransaction { tx: Some(tx) }))
    }

    async fn close(&self) -> MigrateResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// PostgreSQL transaction implementation
pub struct PostgresTransaction {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
}

impl PostgresTransaction {
    fn active(&mut self) -> MigrateResult<&mut sqlx::Transaction<'static, Postgres>> {
        self.tx
            .as_mut()
            .ok_or_else(|| MigrateError::Database("Transaction already completed".to_string()))
    }
}

#[async_trait]
impl DatabaseTransaction for PostgresTransaction {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrateResult<u64> {
        let tx = self.active()?;

        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_database_value(query, param);
        }

        let result = query.execute(&mut **tx).await?;
        Ok(result.rows_affected())
    }

    async fn fetch_scalar(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrateResult<Option<DatabaseValue>> {
        let tx = self.active()?;

        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_database_value(query, param);
        }

        let Some(row) = query.fetch_optional(&mut **tx).await? else {
            return Ok(None);
        };

        if let Ok(value) = row.try_get::<Option<String>, _>(0) {
            return Ok(Some(value.map_or(DatabaseValue::Null, DatabaseValue::String)));
        }
        let value: Option<i64> = row.try_get(0)?;
        Ok(Some(value.map_or(DatabaseValue::Null, DatabaseValue::Int64)))
    }

    async fn commit(mut self: Box<Self>) -> MigrateResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| MigrateError::Database("Transaction already completed".to_string()))?;

        tx.commit()
            .await
            .map_err(|e| MigrateError::Database(format!("Transaction commit failed: {}", e)))
    }

    async fn rollback(mut self: Box<Self>) -> MigrateResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| MigrateError::Database("Transaction already completed".to_string()))?;

        tx.rollback()
            .await
            .map_err(|e| MigrateError::Database(format!("Transaction rollback failed: {}", e)))
    }
}

/// Bind a DatabaseValue to a sqlx query
fn bind_database_value<'a>(
    query: sqlx::query::Query<'a, Postgres, sqlx::postgres::PgArguments>,
    value: &DatabaseValue,
) -> sqlx::query::Query<'a, Postgres, sqlx::postgres::PgArguments> {
    match value {
        DatabaseValue::Null => query.bind(Option::<String>::None),
        DatabaseValue::Int64(i) => query.bind(*i),
        DatabaseValue::String(s) => query.bind(s.clone()),
    }
}
