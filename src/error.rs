//! Error types for the order core.
//!
//! Every variant is recoverable at the caller; the HTTP layer maps them to 4xx
//! responses. Unexpected persistence failures surface as [`OrderError::Storage`]
//! after the owning transaction has rolled back.

use thiserror::Error;
use uuid::Uuid;

use crate::domain::aggregates::order::OrderStatus;

#[derive(Error, Debug)]
pub enum OrderError {
    #[error("user not found: {0}")]
    UserNotFound(Uuid),

    #[error("product not found: {0}")]
    ProductNotFound(Uuid),

    #[error("order not found: {0}")]
    OrderNotFound(Uuid),

    #[error("{0}")]
    Validation(String),

    #[error("product {name} is out of stock or has insufficient quantity: requested {requested}, available {available}")]
    InsufficientStock {
        name: String,
        requested: u32,
        available: u32,
    },

    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("operation not permitted for this user")]
    Forbidden,

    #[error("order number already in use")]
    Conflict,

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for OrderError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            // The unique index on orders.order_number turns a generation
            // collision into a retryable Conflict.
            if db.is_unique_violation() {
                return OrderError::Conflict;
            }
        }
        OrderError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrderError>;
