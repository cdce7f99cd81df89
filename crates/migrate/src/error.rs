//! Error types for the migration system
//!
//! Covers argument checks at the API boundary, snapshot validation, the
//! file-backed migration store and the database sync run.

use crate::migrations::definitions::ActionMethod;

/// Result type alias for migration operations
pub type MigrateResult<T> = Result<T, MigrateError>;

/// Why a single action could not be folded into a snapshot
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    /// The action breaks a structural invariant of the snapshot
    #[error("{0}")]
    Invalid(String),

    /// The action names a relation or constraint that is not there
    #[error("{0} doesn't exist")]
    NotFound(String),
}

/// Error types for migration operations
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// A required argument was blank
    #[error("{0} is required")]
    InvalidArgument(&'static str),

    /// Folding an action into the snapshot failed
    #[error("can't apply action #{position} '{method}': {reason}")]
    Validation {
        position: usize,
        method: ActionMethod,
        reason: SnapshotError,
    },

    /// Reading or writing migration records failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// A record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A new migration id collides with (or sorts before) a stored one
    #[error("Migration id '{0}' already exists or is not newer than the latest migration")]
    DuplicateId(String),

    /// No stored record matched the given id
    #[error("Migration '{0}' not found")]
    NotFound(String),

    /// An action was appended before any migration was created
    #[error("Migration doesn't exist, please add a migration first")]
    NoMigration,

    /// Another process holds the store lock
    #[error("Migration store is locked: {0}")]
    Locked(String),

    /// The database could not be reached or authenticated against
    #[error("Connection error: {0}")]
    Connection(String),

    /// A statement failed in the driver
    #[error("Database error: {0}")]
    Database(String),

    /// An action of a pending migration failed during sync
    #[error("can't apply migration {migration_id}, action #{action_index} '{method}': {message}")]
    Sync {
        migration_id: String,
        action_index: usize,
        method: ActionMethod,
        message: String,
    },

    /// The applied-migrations ledger could not be read or written
    #[error("Ledger error: {0}")]
    Ledger(String),
}

impl MigrateError {
    /// True for the caller-facing "nothing matched" conditions
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            MigrateError::NotFound(_)
                | MigrateError::NoMigration
                | MigrateError::Validation {
                    reason: SnapshotError::NotFound(_),
                    ..
                }
        )
    }
}

impl From<std::io::Error> for MigrateError {
    fn from(err: std::io::Error) -> Self {
        MigrateError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for MigrateError {
    fn from(err: serde_json::Error) -> Self {
        MigrateError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for MigrateError {
    fn from(err: serde_yaml::Error) -> Self {
        MigrateError::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for MigrateError {
    fn from(err: sqlx::Error) -> Self {
        MigrateError::Database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_names_position_and_method() {
        let err = MigrateError::Validation {
            position: 3,
            method: ActionMethod::AddRelation,
            reason: SnapshotError::Invalid("remote table 'ghost' doesn't exist".to_string()),
        };

        assert_eq!(
            err.to_string(),
            "can't apply action #3 'addRelation': remote table 'ghost' doesn't exist"
        );
    }

    #[test]
    fn test_not_found_conditions() {
        assert!(MigrateError::NoMigration.is_not_found());
        assert!(MigrateError::NotFound("2024".to_string()).is_not_found());
        assert!(MigrateError::Validation {
            position: 0,
            method: ActionMethod::DeleteRelation,
            reason: SnapshotError::NotFound("relation \"fk\"".to_string()),
        }
        .is_not_found());
        assert!(!MigrateError::Storage("disk".to_string()).is_not_found());
    }
}
