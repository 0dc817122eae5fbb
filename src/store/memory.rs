//! In-memory store used by tests and lightweight embedders.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::domain::aggregates::order::{Order, OrderStatus};
use crate::domain::aggregates::product::{Product, StockLine};
use crate::error::{OrderError, Result};
use crate::store::{OrderStore, ProductStore, UserProfile, UserStore};

/// Single-process store backing all three persistence traits. One mutex guards
/// the whole state, which is what gives `reserve_stock` its all-or-nothing,
/// serialized semantics here.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, UserProfile>,
    products: HashMap<Uuid, Product>,
    orders: HashMap<Uuid, Order>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_user(&self, user: UserProfile) {
        if let Ok(mut inner) = self.locked() {
            inner.users.insert(user.id, user);
        }
    }

    pub fn put_product(&self, product: Product) {
        if let Ok(mut inner) = self.locked() {
            inner.products.insert(product.id, product);
        }
    }

    /// Current stock level, mainly for assertions in tests.
    pub fn stock_of(&self, product_id: Uuid) -> Option<u32> {
        self.locked()
            .ok()?
            .products
            .get(&product_id)
            .map(|p| p.stock_quantity)
    }

    fn locked(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| OrderError::Storage("store lock poisoned".into()))
    }
}

/// Merge duplicate product ids, preserving first-seen order so error reporting
/// names the first short product.
fn merge_lines(lines: &[StockLine]) -> Vec<(Uuid, u32)> {
    let mut totals: Vec<(Uuid, u32)> = Vec::with_capacity(lines.len());
    for line in lines {
        match totals.iter_mut().find(|(id, _)| *id == line.product_id) {
            Some((_, quantity)) => *quantity += line.quantity,
            None => totals.push((line.product_id, line.quantity)),
        }
    }
    totals
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserProfile>> {
        Ok(self.locked()?.users.get(&id).cloned())
    }
}

#[async_trait]
impl ProductStore for MemoryStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Product>> {
        Ok(self.locked()?.products.get(&id).cloned())
    }

    async fn reserve_stock(&self, lines: &[StockLine]) -> Result<()> {
        let mut inner = self.locked()?;
        let totals = merge_lines(lines);
        // Check every line before touching any stock.
        for (product_id, quantity) in &totals {
            let product = inner
                .products
                .get(product_id)
                .ok_or(OrderError::ProductNotFound(*product_id))?;
            if !product.has_stock(*quantity) {
                return Err(OrderError::InsufficientStock {
                    name: product.name.clone(),
                    requested: *quantity,
                    available: product.stock_quantity,
                });
            }
        }
        for (product_id, quantity) in totals {
            if let Some(product) = inner.products.get_mut(&product_id) {
                product.reserve(quantity);
            }
        }
        Ok(())
    }

    async fn release_stock(&self, lines: &[StockLine]) -> Result<()> {
        let mut inner = self.locked()?;
        for (product_id, quantity) in merge_lines(lines) {
            match inner.products.get_mut(&product_id) {
                Some(product) => product.restore(quantity),
                None => debug!(%product_id, "skipping stock release for missing product"),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn insert(&self, order: &Order) -> Result<()> {
        let mut inner = self.locked()?;
        if inner
            .orders
            .values()
            .any(|existing| existing.order_number == order.order_number)
        {
            return Err(OrderError::Conflict);
        }
        inner.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Order>> {
        Ok(self.locked()?.orders.get(&id).cloned())
    }

    async fn find_by_user(&self, user_id: Uuid) -> Result<Vec<Order>> {
        let mut orders: Vec<Order> = self
            .locked()?
            .orders
            .values()
            .filter(|order| order.user_id == user_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }

    async fn find_all(&self) -> Result<Vec<Order>> {
        let mut orders: Vec<Order> = self.locked()?.orders.values().cloned().collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }

    async fn update_payment(&self, order: &Order) -> Result<()> {
        let mut inner = self.locked()?;
        let stored = inner
            .orders
            .get_mut(&order.id)
            .ok_or(OrderError::OrderNotFound(order.id))?;
        stored.payment_status = order.payment_status;
        stored.transaction_id = order.transaction_id.clone();
        stored.updated_at = order.updated_at;
        Ok(())
    }

    async fn transition(
        &self,
        order: &Order,
        expected: OrderStatus,
        restock: &[StockLine],
    ) -> Result<()> {
        // One mutex guards both tables, so the status swap and the stock
        // restore commit together.
        let mut inner = self.locked()?;
        let stored = inner
            .orders
            .get_mut(&order.id)
            .ok_or(OrderError::OrderNotFound(order.id))?;
        if stored.status != expected {
            return Err(OrderError::InvalidTransition {
                from: stored.status,
                to: order.status,
            });
        }
        stored.status = order.status;
        stored.updated_at = order.updated_at;
        stored.delivered_at = order.delivered_at;
        for (product_id, quantity) in merge_lines(restock) {
            match inner.products.get_mut(&product_id) {
                Some(product) => product.restore(quantity),
                None => debug!(%product_id, "skipping stock release for missing product"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::order::PaymentMethod;
    use crate::domain::value_objects::Address;
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn seeded_product(store: &MemoryStore, stock: u32) -> Uuid {
        let id = Uuid::new_v4();
        store.put_product(Product {
            id,
            name: "Widget".into(),
            description: None,
            price: Decimal::new(1000, 2),
            stock_quantity: stock,
            discount_percentage: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });
        id
    }

    #[tokio::test]
    async fn test_reservation_is_all_or_nothing() {
        let store = MemoryStore::new();
        let available = seeded_product(&store, 10);
        let short = seeded_product(&store, 1);
        let lines = [
            StockLine { product_id: available, quantity: 5 },
            StockLine { product_id: short, quantity: 2 },
        ];
        let err = store.reserve_stock(&lines).await.unwrap_err();
        assert!(matches!(
            err,
            OrderError::InsufficientStock { requested: 2, available: 1, .. }
        ));
        assert_eq!(store.stock_of(available), Some(10));
        assert_eq!(store.stock_of(short), Some(1));
    }

    #[tokio::test]
    async fn test_duplicate_lines_are_merged_before_checking() {
        let store = MemoryStore::new();
        let id = seeded_product(&store, 3);
        let lines = [
            StockLine { product_id: id, quantity: 2 },
            StockLine { product_id: id, quantity: 2 },
        ];
        assert!(store.reserve_stock(&lines).await.is_err());
        assert_eq!(store.stock_of(id), Some(3));
    }

    #[tokio::test]
    async fn test_duplicate_order_number_conflicts() {
        let store = MemoryStore::new();
        let order = Order::create(
            Uuid::new_v4(),
            Address::default(),
            Address::default(),
            PaymentMethod::Paypal,
            None,
        );
        let mut copy = order.clone();
        copy.id = Uuid::new_v4();
        store.insert(&order).await.unwrap();
        assert!(matches!(
            store.insert(&copy).await.unwrap_err(),
            OrderError::Conflict
        ));
    }

    #[tokio::test]
    async fn test_transition_swaps_once_and_restores_stock_once() {
        let store = MemoryStore::new();
        let product_id = seeded_product(&store, 5);
        let mut order = Order::create(
            Uuid::new_v4(),
            Address::default(),
            Address::default(),
            PaymentMethod::Paypal,
            None,
        );
        store.insert(&order).await.unwrap();

        let restock = [StockLine { product_id, quantity: 3 }];
        order.set_status(OrderStatus::Cancelled);
        store
            .transition(&order, OrderStatus::Pending, &restock)
            .await
            .unwrap();
        assert_eq!(store.stock_of(product_id), Some(8));

        // A second swap against the stale PENDING expectation loses the race
        // and must not restore again.
        let err = store
            .transition(&order, OrderStatus::Pending, &restock)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrderError::InvalidTransition { from: OrderStatus::Cancelled, to: OrderStatus::Cancelled }
        ));
        assert_eq!(store.stock_of(product_id), Some(8));
    }

    #[tokio::test]
    async fn test_release_restores_stock() {
        let store = MemoryStore::new();
        let id = seeded_product(&store, 5);
        let lines = [StockLine { product_id: id, quantity: 3 }];
        store.reserve_stock(&lines).await.unwrap();
        assert_eq!(store.stock_of(id), Some(2));
        store.release_stock(&lines).await.unwrap();
        assert_eq!(store.stock_of(id), Some(5));
    }
}
