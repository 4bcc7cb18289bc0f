// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for instancer-core.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the persistence layer.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// The owner's pending reservation disappeared before it could be activated.
    ReservationLost {
        /// Owner whose reservation was lost.
        owner_id: String,
    },

    /// A stored row violates the record invariants.
    CorruptRecord {
        /// Owner of the offending row.
        owner_id: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ReservationLost { .. } => "RESERVATION_LOST",
            Self::CorruptRecord { .. } => "CORRUPT_RECORD",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReservationLost { owner_id } => {
                write!(f, "Reservation for owner '{}' no longer exists", owner_id)
            }
            Self::CorruptRecord { owner_id, reason } => {
                write!(f, "Record for owner '{}' is corrupt: {}", owner_id, reason)
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::DatabaseError {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}
