//! Migration System
//!
//! Append-only migration log on disk, the pure snapshot fold over it, DDL
//! generation and the database sync run.

pub mod definitions;
pub mod manager;
pub mod runner;
pub mod schema_builder;
pub mod snapshot;

pub use definitions::*;
pub use manager::MigrationManager;
pub use runner::{ping, sync, MigrationRunner, SyncOptions, SyncOutcome, SyncReport};
pub use schema_builder::SchemaBuilder;
pub use snapshot::{Column, Relation, Snapshot, Table, UniqueConstraint};
