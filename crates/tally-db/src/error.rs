//! # Storage Errors
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  sqlx::Error ──classify──► DbError ◄── LedgerError raised mid-write     │
//! │                               │        (InsufficientStock, over-refund) │
//! │                               ▼                                         │
//! │                 LedgerError at the engine boundary                      │
//! │                   Ledger(e)             → e                             │
//! │                   Busy | PoolExhausted  → Storage { transient: true }   │
//! │                   anything else         → Storage { transient: false }  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use sqlx::error::ErrorKind as SqlErrorKind;
use tally_core::{LedgerError, ValidationError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    /// A business rule refused the write while the ledger lock was held.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// `column` is `table.column` as SQLite reports it.
    #[error("unique constraint failed on {column}")]
    UniqueViolation { column: String },

    /// FOREIGN KEY, CHECK or NOT NULL rejection.
    #[error("constraint failed: {0}")]
    Constraint(String),

    /// The write lock stayed taken past `busy_timeout`.
    #[error("database busy: {0}")]
    Busy(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("migration failed: {0}")]
    MigrationFailed(String),

    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("internal storage error: {0}")]
    Internal(String),
}

impl DbError {
    pub fn unique_violation(column: impl Into<String>) -> Self {
        DbError::UniqueViolation {
            column: column.into(),
        }
    }

    /// Lock or pool contention; the same call may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Busy(_) | DbError::PoolExhausted)
    }

    pub fn is_unique_violation_on(&self, target: &str) -> bool {
        matches!(self, DbError::UniqueViolation { column } if column == target)
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        let db_err = match err {
            sqlx::Error::Database(db_err) => db_err,
            sqlx::Error::RowNotFound => {
                return DbError::NotFound {
                    entity: "row".into(),
                    id: "?".into(),
                }
            }
            sqlx::Error::PoolTimedOut => return DbError::PoolExhausted,
            sqlx::Error::PoolClosed => return DbError::ConnectionFailed("pool closed".into()),
            other => return DbError::Internal(other.to_string()),
        };

        let message = db_err.message().to_string();
        match db_err.kind() {
            // "UNIQUE constraint failed: transactions.idempotency_key"
            kind if matches!(kind, SqlErrorKind::UniqueViolation)
                || message.starts_with("UNIQUE constraint failed") =>
            {
                DbError::UniqueViolation {
                    column: message
                        .rsplit(": ")
                        .next()
                        .unwrap_or_default()
                        .trim()
                        .to_string(),
                }
            }
            SqlErrorKind::ForeignKeyViolation
            | SqlErrorKind::CheckViolation
            | SqlErrorKind::NotNullViolation => DbError::Constraint(message),
            _ if message.contains("database is locked") || message.contains("database is busy") => {
                DbError::Busy(message)
            }
            _ => DbError::QueryFailed(message),
        }
    }
}

/// Rejected input inside a store call reads like any other business refusal.
impl From<ValidationError> for DbError {
    fn from(err: ValidationError) -> Self {
        DbError::Ledger(err.into())
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

impl From<DbError> for LedgerError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Ledger(inner) => inner,
            other => {
                let transient = other.is_transient();
                LedgerError::storage(other.to_string(), transient)
            }
        }
    }
}

pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_errors_pass_through() {
        let err: LedgerError = DbError::Ledger(LedgerError::invalid("over refund")).into();
        assert_eq!(err, LedgerError::invalid("over refund"));
    }

    #[test]
    fn test_contention_is_transient() {
        let err: LedgerError = DbError::Busy("database is locked".into()).into();
        assert!(err.is_transient());

        let err: LedgerError = DbError::PoolExhausted.into();
        assert!(err.is_transient());

        let err: LedgerError = DbError::Constraint("CHECK constraint failed".into()).into();
        assert!(!err.is_transient());
        assert_eq!(err.kind(), tally_core::ErrorKind::Storage);
    }

    #[test]
    fn test_validation_errors_become_invalid_transactions() {
        let err = DbError::from(ValidationError::Required {
            field: "sku".into(),
        });
        assert!(!err.is_transient());
        let err: LedgerError = err.into();
        assert_eq!(err.kind(), tally_core::ErrorKind::InvalidTransaction);
    }

    #[test]
    fn test_unique_violation_on() {
        let err = DbError::unique_violation("transactions.idempotency_key");
        assert!(err.is_unique_violation_on("transactions.idempotency_key"));
        assert!(!err.is_unique_violation_on("item_returns.idempotency_key"));
    }

    #[tokio::test]
    async fn test_sqlite_unique_failure_names_column() {
        let db = crate::Database::new(crate::DbConfig::in_memory()).await.unwrap();
        let insert = "INSERT INTO products (sku, name, price_cents, margin_bps, is_active, updated_at) \
                      VALUES ('A', 'a', 100, 0, 1, '2024-01-01T00:00:00Z')";
        sqlx::query(insert).execute(db.pool()).await.unwrap();

        let err: DbError = sqlx::query(insert)
            .execute(db.pool())
            .await
            .unwrap_err()
            .into();
        assert!(err.is_unique_violation_on("products.sku"), "{err:?}");
    }
}
