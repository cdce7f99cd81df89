//! In-memory database backend for sync tests
//!
//! Statements executed inside a transaction only become visible in
//! `FakeState::committed` on commit; a rollback discards them, ledger rows
//! included.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use elif_migrate::{
    DatabaseBackend, DatabaseConnection, DatabaseConnectionConfig, DatabaseTransaction,
    DatabaseValue, MigrateError, MigrateResult, MigrationConfig, MigrationManager,
};

#[derive(Debug, Default)]
pub struct FakeState {
    /// Statements of committed transactions, in execution order
    pub committed: Vec<String>,
    /// Committed ledger rows: id -> serialized migration
    pub ledger: BTreeMap<String, String>,
    /// Fail any statement containing this text
    pub fail_on: Option<String>,
    /// Hang on any statement containing this text
    pub stall_on: Option<String>,
    /// Refuse connections
    pub unreachable: bool,
    pub connections: usize,
    pub commits: usize,
    pub rollbacks: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Committed action DDL, without ledger bookkeeping
    pub fn ddl(&self) -> Vec<String> {
        self.state()
            .committed
            .iter()
            .filter(|sql| !sql.starts_with("SELECT") && !sql.contains("\"_migrations\""))
            .cloned()
            .collect()
    }

    pub fn ledger_ids(&self) -> Vec<String> {
        self.state().ledger.keys().cloned().collect()
    }
}

#[async_trait]
impl DatabaseBackend for FakeBackend {
    async fn connect(
        &self,
        _config: &DatabaseConnectionConfig,
        _connect_timeout: Duration,
    ) -> MigrateResult<Box<dyn DatabaseConnection>> {
        let mut state = self.state();
        if state.unreachable {
            return Err(MigrateError::Connection(
                "can't connect to db: connection refused".to_string(),
            ));
        }
        state.connections += 1;

        Ok(Box::new(FakeConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeConnection {
    state: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl DatabaseConnection for FakeConnection {
    async fn begin_transaction(&self) -> MigrateResult<Box<dyn DatabaseTransaction>> {
        Ok(Box::new(FakeTransaction {
            state: Arc::clone(&self.state),
            statements: Vec::new(),
            ledger: Vec::new(),
        }))
    }

    async fn close(&self) -> MigrateResult<()> {
        Ok(())
    }
}

struct FakeTransaction {
    state: Arc<Mutex<FakeState>>,
    statements: Vec<String>,
    ledger: Vec<(String, String)>,
}

#[async_trait]
impl DatabaseTransaction for FakeTransaction {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrateResult<u64> {
        let (fail, stall) = {
            let state = self.state.lock().unwrap();
            let matches = |needle: &Option<String>| {
                needle.as_deref().is_some_and(|needle| sql.contains(needle))
            };
            (matches(&state.fail_on), matches(&state.stall_on))
        };
        if stall {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        if fail {
            return Err(MigrateError::Database(format!("fake failure on: {}", sql)));
        }

        if sql.starts_with("INSERT INTO") {
            let id = params[0].as_str().unwrap_or_default().to_string();
            let data = params[1].as_str().unwrap_or_default().to_string();
            self.ledger.push((id, data));
        }
        self.statements.push(sql.to_string());
        Ok(0)
    }

    async fn fetch_scalar(
        &mut self,
        sql: &str,
        _params: &[DatabaseValue],
    ) -> MigrateResult<Option<DatabaseValue>> {
        if !sql.starts_with("SELECT id FROM") {
            return Ok(None);
        }

        let state = self.state.lock().unwrap();
        let latest = state
            .ledger
            .keys()
            .chain(self.ledger.iter().map(|(id, _)| id))
            .max()
            .cloned();
        Ok(latest.map(DatabaseValue::String))
    }

    async fn commit(self: Box<Self>) -> MigrateResult<()> {
        let FakeTransaction {
            state,
            statements,
            ledger,
        } = *self;
        let mut state = state.lock().unwrap();
        state.committed.extend(statements);
        state.ledger.extend(ledger);
        state.commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> MigrateResult<()> {
        self.state.lock().unwrap().rollbacks += 1;
        Ok(())
    }
}

pub fn credentials() -> DatabaseConnectionConfig {
    DatabaseConnectionConfig::new("app", "secret", "shop", "localhost", 5432)
}

pub fn store(dir: &tempfile::TempDir) -> MigrationManager {
    MigrationManager::with_config(MigrationConfig::new(dir.path()))
}

pub fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 20, 9, minute, 0).unwrap()
}
