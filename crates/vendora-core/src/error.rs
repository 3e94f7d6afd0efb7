use thiserror::Error;
use uuid::Uuid;

use crate::status::OrderStatus;

/// Stable error classification exposed to callers; HTTP status mapping and
/// retry decisions key off this, never off the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Security,
    Validation,
    Conflict,
    NotFound,
    Internal,
}

#[derive(Debug, Error)]
pub enum CommerceError {
    #[error("security violation: {0}")]
    Security(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("illegal order transition {from} -> {to}")]
    IllegalTransition { from: OrderStatus, to: OrderStatus },

    #[error("{0} not found")]
    NotFound(String),

    #[error("insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: Uuid,
        variant_id: Option<Uuid>,
        requested: i64,
        available: i64,
    },

    #[error("insufficient coin balance for user {user_id}: requested {requested}, available {available}")]
    InsufficientBalance {
        user_id: Uuid,
        requested: i64,
        available: i64,
    },

    #[error("already processing: {0}")]
    AlreadyProcessing(String),

    #[error(transparent)]
    Storage(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CommerceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CommerceError::Security(_) => ErrorKind::Security,
            CommerceError::Validation(_) | CommerceError::IllegalTransition { .. } => {
                ErrorKind::Validation
            }
            CommerceError::NotFound(_) => ErrorKind::NotFound,
            CommerceError::InsufficientStock { .. }
            | CommerceError::InsufficientBalance { .. }
            | CommerceError::AlreadyProcessing(_) => ErrorKind::Conflict,
            CommerceError::Storage(_) | CommerceError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Conflicts may succeed on a later attempt; everything else is permanent
    /// as far as the caller is concerned.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}

pub type CommerceResult<T> = Result<T, CommerceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(
            CommerceError::Security("bad signature".into()).kind(),
            ErrorKind::Security
        );
        assert_eq!(
            CommerceError::IllegalTransition {
                from: OrderStatus::Delivered,
                to: OrderStatus::Created,
            }
            .kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            CommerceError::AlreadyProcessing("confirm in flight".into()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            CommerceError::NotFound("order".into()).kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn only_conflicts_are_retryable() {
        let conflict = CommerceError::InsufficientBalance {
            user_id: Uuid::new_v4(),
            requested: 50,
            available: 0,
        };
        assert!(conflict.is_retryable());
        assert!(!CommerceError::Validation("empty cart".into()).is_retryable());
    }
}
