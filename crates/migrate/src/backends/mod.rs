//! Database Backend Abstractions
//!
//! The driver seam consumed by the sync engine and its PostgreSQL
//! implementation.

pub mod core;
pub mod postgres;

// Re-export core traits and types
pub use self::core::*;
pub use postgres::PostgresBackend;
