//! SmartShop Order Core
//!
//! Order lifecycle and inventory reconciliation for the SmartShop e-commerce
//! backend.
//!
//! ## Features
//! - Order assembly with immutable price/discount snapshots and totals always
//!   recomputed from items
//! - Status state machine with inventory side effects (cancellation restores
//!   stock; cancelled orders are terminal)
//! - Atomic, serialized stock reservation that never oversells the last unit
//! - Role-aware operations behind explicit caller identity
//!
//! Storage sits behind the [`store::UserStore`], [`store::ProductStore`] and
//! [`store::OrderStore`] traits; Postgres and in-memory implementations ship
//! in [`store::postgres`] and [`store::memory`]. HTTP routing, authentication
//! and file storage live in other components.

pub mod config;
pub mod domain;
pub mod error;
pub mod service;
pub mod store;

pub use domain::aggregates::order::{Order, OrderItem, OrderStatus, PaymentMethod, PaymentStatus};
pub use domain::aggregates::product::{Product, StockLine};
pub use domain::transitions;
pub use domain::value_objects::{Address, OrderNumber};
pub use error::{OrderError, Result};
pub use service::{CreateOrderRequest, OrderItemRequest, OrderService, Requester, Role};
