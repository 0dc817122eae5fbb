//! Persistence interfaces consumed by the order core.
//!
//! The core never talks to a database directly; it goes through these traits.
//! `reserve_stock` and `release_stock` are all-or-nothing: implementations must
//! apply every line atomically and serialize concurrent reservations, so stock
//! never goes negative and the last unit is sold exactly once.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::aggregates::order::{Order, OrderStatus};
use crate::domain::aggregates::product::{Product, StockLine};
use crate::domain::value_objects::Address;
use crate::error::Result;

/// Profile fields of a user as stored by the accounts component. Address
/// fields are individually optional until the user completes their profile.
#[derive(Clone, Debug)]
pub struct UserProfile {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub address_line1: Option<String>,
    pub address_line2: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
}

impl UserProfile {
    /// Address snapshot built from the profile, or `None` while any required
    /// field is missing or blank.
    pub fn profile_address(&self) -> Option<Address> {
        let required = |field: &Option<String>| {
            field
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_owned)
        };
        Some(Address {
            address_line1: required(&self.address_line1)?,
            address_line2: self.address_line2.clone(),
            city: required(&self.city)?,
            state: required(&self.state)?,
            postal_code: required(&self.postal_code)?,
            country: required(&self.country)?,
        })
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserProfile>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProductStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Product>>;

    /// Atomically check and decrement stock for every line, or change nothing.
    /// Fails with `InsufficientStock` naming the first product that is short.
    async fn reserve_stock(&self, lines: &[StockLine]) -> Result<()>;

    /// Atomically return previously reserved quantities to stock.
    async fn release_stock(&self, lines: &[StockLine]) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Persist a new order with its items. Fails with `Conflict` when the
    /// order number is already taken.
    async fn insert(&self, order: &Order) -> Result<()>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Order>>;

    /// A user's orders, newest first.
    async fn find_by_user(&self, user_id: Uuid) -> Result<Vec<Order>>;

    /// Every order, newest first.
    async fn find_all(&self) -> Result<Vec<Order>>;

    /// Persist `payment_status`, `transaction_id` and `updated_at` without
    /// touching the fulfilment status.
    async fn update_payment(&self, order: &Order) -> Result<()>;

    /// Compare-and-swap status transition. Applies the status carried by
    /// `order` (with `updated_at` and `delivered_at`) and restores the
    /// `restock` quantities in one atomic unit of work, but only while the
    /// stored status still equals `expected`; fails with `InvalidTransition`
    /// when a concurrent transition got there first. Item snapshots are
    /// immutable and are not rewritten.
    async fn transition(
        &self,
        order: &Order,
        expected: OrderStatus,
        restock: &[StockLine],
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> UserProfile {
        UserProfile {
            id: Uuid::new_v4(),
            name: "Jordan".into(),
            email: "jordan@example.com".into(),
            address_line1: Some("1 Market St".into()),
            address_line2: None,
            city: Some("Springfield".into()),
            state: Some("IL".into()),
            postal_code: Some("62701".into()),
            country: Some("US".into()),
        }
    }

    #[test]
    fn test_complete_profile_yields_address() {
        let address = profile().profile_address().unwrap();
        assert_eq!(address.address_line1, "1 Market St");
        assert!(address.is_complete());
    }

    #[test]
    fn test_missing_field_yields_none() {
        let mut p = profile();
        p.postal_code = None;
        assert!(p.profile_address().is_none());
        let mut p = profile();
        p.country = Some("  ".into());
        assert!(p.profile_address().is_none());
    }
}
