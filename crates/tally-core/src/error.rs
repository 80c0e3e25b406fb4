//! # Error Types
//!
//! The closed error taxonomy of the ledger.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tally-core errors (this file)                                         │
//! │  ├── LedgerError      - What every engine operation returns            │
//! │  │   ├── NotFound            (business)                                │
//! │  │   ├── InsufficientStock   (business)                                │
//! │  │   ├── InvalidTransaction  (business)                                │
//! │  │   └── Storage             (wrapped I/O, never a business kind)      │
//! │  └── ValidationError  - Field-level input failures                     │
//! │                                                                         │
//! │  tally-db errors (separate crate)                                      │
//! │  └── DbError          - sqlx failures, collapsed into Storage          │
//! │                                                                         │
//! │  Flow: ValidationError → LedgerError ← DbError                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Callers branch on [`LedgerError::kind`] rather than on message text.

use thiserror::Error;

// =============================================================================
// Ledger Error
// =============================================================================

/// Errors surfaced by the checkout, reversal and inventory operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// A referenced transaction, lot or SKU does not exist.
    ///
    /// ## When This Occurs
    /// - Voiding or refunding an unknown transaction id
    /// - Returning an item on a transaction id nobody has seen
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Aggregate or FEFO-available quantity cannot satisfy a line.
    ///
    /// ## User Workflow
    /// ```text
    /// Checkout (COKE × 5)
    ///      │
    ///      ▼
    /// Counter = 3, non-expired lots = 3
    ///      │
    ///      ▼
    /// InsufficientStock { sku: "COKE", available: 3, requested: 5 }
    ///      │
    ///      ▼
    /// Cashier re-quotes or drops the line
    /// ```
    #[error("Insufficient stock for {sku}: available {available}, requested {requested}")]
    InsufficientStock {
        sku: String,
        available: i64,
        requested: i64,
    },

    /// Malformed input or a violated precondition.
    ///
    /// ## When This Occurs
    /// - Unknown or inactive SKU in the cart
    /// - Payment does not cover or match the total
    /// - Second void, refund of a voided transaction
    /// - Refund or return beyond what remains
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    /// The storage layer failed underneath a business operation.
    ///
    /// `transient` marks failures worth retrying (lock contention,
    /// exhausted pool).
    #[error("Storage failure: {message}")]
    Storage { message: String, transient: bool },
}

/// Discriminant of [`LedgerError`] for exhaustive matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    InsufficientStock,
    InvalidTransaction,
    Storage,
}

impl LedgerError {
    /// Creates a NotFound error.
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        LedgerError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Creates an InvalidTransaction error.
    pub fn invalid(reason: impl Into<String>) -> Self {
        LedgerError::InvalidTransaction(reason.into())
    }

    /// Creates a Storage error.
    pub fn storage(message: impl Into<String>, transient: bool) -> Self {
        LedgerError::Storage {
            message: message.into(),
            transient,
        }
    }

    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::NotFound { .. } => ErrorKind::NotFound,
            LedgerError::InsufficientStock { .. } => ErrorKind::InsufficientStock,
            LedgerError::InvalidTransaction(_) => ErrorKind::InvalidTransaction,
            LedgerError::Storage { .. } => ErrorKind::Storage,
        }
    }

    /// Whether retrying the same operation could succeed.
    ///
    /// Business errors are never transient: the same input fails the same way.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Storage { transient: true, .. })
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Raised before any mutation begins; they surface to callers as
/// [`LedgerError::InvalidTransaction`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Invalid format (e.g., bad SKU characters).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Value is not in allowed set.
    #[error("{field} must be one of: {allowed:?}")]
    NotAllowed { field: String, allowed: Vec<String> },

    /// Duplicate value (e.g., the same method twice in a split).
    #[error("{field} '{value}' is duplicated")]
    Duplicate { field: String, value: String },

    /// Amounts that must agree do not.
    #[error("{field} mismatch: expected {expected}, got {actual}")]
    Mismatch {
        field: String,
        expected: i64,
        actual: i64,
    },
}

impl From<ValidationError> for LedgerError {
    fn from(err: ValidationError) -> Self {
        LedgerError::InvalidTransaction(err.to_string())
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with LedgerError.
pub type LedgerResult<T> = Result<T, LedgerError>;

// =============================================================================
// Unit Tests
// =============================================================================
