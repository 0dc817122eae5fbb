//! Order aggregate: the order record, its immutable item snapshots, and the
//! status enums.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::aggregates::product::{Product, StockLine};
use crate::domain::value_objects::{Address, OrderNumber};
use crate::error::OrderError;

/// Fulfilment lifecycle of an order. Transitions are validated by
/// [`crate::domain::transitions`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    #[default]
    Pending,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Shipped => "SHIPPED",
            Self::Delivered => "DELIVERED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "SHIPPED" => Ok(Self::Shipped),
            "DELIVERED" => Ok(Self::Delivered),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(OrderError::Validation(format!(
                "invalid order status: {other}"
            ))),
        }
    }
}

/// Payment state, tracked independently of [`OrderStatus`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Paid,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Paid => "PAID",
            Self::Failed => "FAILED",
            Self::Refunded => "REFUNDED",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "PAID" => Ok(Self::Paid),
            "FAILED" => Ok(Self::Failed),
            "REFUNDED" => Ok(Self::Refunded),
            other => Err(OrderError::Validation(format!(
                "invalid payment status: {other}"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    CreditCard,
    DebitCard,
    Paypal,
    BankTransfer,
    CashOnDelivery,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreditCard => "CREDIT_CARD",
            Self::DebitCard => "DEBIT_CARD",
            Self::Paypal => "PAYPAL",
            Self::BankTransfer => "BANK_TRANSFER",
            Self::CashOnDelivery => "CASH_ON_DELIVERY",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREDIT_CARD" => Ok(Self::CreditCard),
            "DEBIT_CARD" => Ok(Self::DebitCard),
            "PAYPAL" => Ok(Self::Paypal),
            "BANK_TRANSFER" => Ok(Self::BankTransfer),
            "CASH_ON_DELIVERY" => Ok(Self::CashOnDelivery),
            other => Err(OrderError::Validation(format!(
                "invalid payment method: {other}"
            ))),
        }
    }
}

/// One line of an order. `price` and `discounted_price` are snapshots taken at
/// order time and never change afterwards, so later catalog edits leave
/// historical totals intact.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: u32,
    pub price: Decimal,
    pub discounted_price: Decimal,
}

impl OrderItem {
    /// Snapshot the product's current pricing for `quantity` units.
    pub fn snapshot(product: &Product, quantity: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            product_id: product.id,
            product_name: product.name.clone(),
            quantity,
            price: product.price,
            discounted_price: product.discounted_price(),
        }
    }

    pub fn line_total(&self) -> Decimal {
        self.discounted_price * Decimal::from(self.quantity)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub order_number: OrderNumber,
    pub user_id: Uuid,
    pub items: Vec<OrderItem>,
    pub shipping_address: Address,
    pub delivery_address: Address,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub payment_method: PaymentMethod,
    pub transaction_id: Option<String>,
    pub subtotal: Decimal,
    pub shipping_cost: Decimal,
    pub tax: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn create(
        user_id: Uuid,
        shipping_address: Address,
        delivery_address: Address,
        payment_method: PaymentMethod,
        notes: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            order_number: OrderNumber::generate(now),
            user_id,
            items: vec![],
            shipping_address,
            delivery_address,
            status: OrderStatus::Pending,
            payment_status: PaymentStatus::Pending,
            payment_method,
            transaction_id: None,
            subtotal: Decimal::ZERO,
            shipping_cost: Decimal::ZERO,
            tax: Decimal::ZERO,
            discount: Decimal::ZERO,
            total: Decimal::ZERO,
            notes,
            created_at: now,
            updated_at: now,
            delivered_at: None,
        }
    }

    pub fn add_item(&mut self, item: OrderItem) {
        self.items.push(item);
        self.calculate_totals();
    }

    /// Recompute `subtotal` and `total` from the item snapshots. Totals are
    /// never trusted from client input.
    pub fn calculate_totals(&mut self) {
        self.subtotal = self.items.iter().map(OrderItem::line_total).sum();
        self.total = (self.subtotal + self.shipping_cost + self.tax - self.discount)
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        self.touch();
    }

    /// Fresh order number for a retry after a uniqueness conflict. Keeps the
    /// creation timestamp component stable.
    pub fn regenerate_order_number(&mut self) {
        self.order_number = OrderNumber::generate(self.created_at);
    }

    pub fn stock_lines(&self) -> Vec<StockLine> {
        self.items
            .iter()
            .map(|item| StockLine {
                product_id: item.product_id,
                quantity: item.quantity,
            })
            .collect()
    }

    /// Move to `status`, stamping `delivered_at` on the transition into
    /// DELIVERED. Callers validate the transition first.
    pub fn set_status(&mut self, status: OrderStatus) {
        self.status = status;
        if status == OrderStatus::Delivered {
            self.delivered_at = Some(Utc::now());
        }
        self.touch();
    }

    /// Update payment state; the transaction id is only overwritten when a new
    /// one is supplied.
    pub fn set_payment_status(&mut self, status: PaymentStatus, transaction_id: Option<String>) {
        self.payment_status = status;
        if let Some(tx) = transaction_id {
            self.transaction_id = Some(tx);
        }
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
