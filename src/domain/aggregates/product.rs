//! Product records as seen by the order core.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Product referenced by orders. The catalog component owns these rows; the
/// order core only reads pricing fields and adjusts `stock_quantity` through
/// [`reserve`](Product::reserve) and [`restore`](Product::restore).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub price: Decimal,
    pub stock_quantity: u32,
    /// Percentage off the list price, 0–100.
    pub discount_percentage: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    /// Price after the product discount, rounded half-up to 2 decimals.
    pub fn discounted_price(&self) -> Decimal {
        if self.discount_percentage == 0 {
            return self.price;
        }
        let pct = Decimal::from(self.discount_percentage.min(100));
        let discount = self.price * pct / Decimal::from(100);
        (self.price - discount).round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
    }

    pub fn has_stock(&self, quantity: u32) -> bool {
        self.stock_quantity >= quantity
    }

    /// Take `quantity` units out of stock. Returns `false` and leaves the record
    /// untouched when not enough units remain.
    pub fn reserve(&mut self, quantity: u32) -> bool {
        if self.stock_quantity < quantity {
            return false;
        }
        self.stock_quantity -= quantity;
        self.touch();
        true
    }

    /// Put `quantity` units back, e.g. when an order is cancelled.
    pub fn restore(&mut self, quantity: u32) {
        self.stock_quantity = self.stock_quantity.saturating_add(quantity);
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// One product/quantity pair of a stock reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StockLine {
    pub product_id: Uuid,
    pub quantity: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(price: Decimal, discount: u32) -> Product {
        Product {
            id: Uuid::new_v4(),
            name: "Widget".into(),
            description: None,
            price,
            stock_quantity: 10,
            discount_percentage: discount,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_no_discount_returns_list_price() {
        let p = product(Decimal::new(1999, 2), 0);
        assert_eq!(p.discounted_price(), Decimal::new(1999, 2));
    }

    #[test]
    fn test_discount_rounds_half_up() {
        // 19.99 at 10% off: 19.99 - 1.999 = 17.991 -> 17.99
        let p = product(Decimal::new(1999, 2), 10);
        assert_eq!(p.discounted_price(), Decimal::new(1799, 2));
        // 10.05 at 50% off: 5.025 -> 5.03
        let p = product(Decimal::new(1005, 2), 50);
        assert_eq!(p.discounted_price(), Decimal::new(503, 2));
    }

    #[test]
    fn test_reserve_and_restore() {
        let mut p = product(Decimal::new(500, 2), 0);
        assert!(p.reserve(4));
        assert_eq!(p.stock_quantity, 6);
        assert!(!p.reserve(7));
        assert_eq!(p.stock_quantity, 6);
        p.restore(4);
        assert_eq!(p.stock_quantity, 10);
    }
}
