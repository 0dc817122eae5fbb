//! Postgres-backed stores.
//!
//! Runtime-checked sqlx queries over the SmartShop schema; `migrations/` holds
//! the DDL this module expects. Stock reservation takes row locks in a stable
//! order inside a single transaction, so concurrent orders for the same
//! products serialize and the whole reservation commits or rolls back as one.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::domain::aggregates::order::{Order, OrderItem, OrderStatus};
use crate::domain::aggregates::product::{Product, StockLine};
use crate::domain::value_objects::{Address, OrderNumber};
use crate::error::{OrderError, Result};
use crate::store::{OrderStore, ProductStore, UserProfile, UserStore};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Open a connection pool and run pending migrations.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await?;
    MIGRATOR
        .run(&pool)
        .await
        .map_err(|err| OrderError::Storage(err.to_string()))?;
    info!("connected to database");
    Ok(pool)
}

#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct UserRow {
    id: Uuid,
    name: String,
    email: String,
    address_line1: Option<String>,
    address_line2: Option<String>,
    city: Option<String>,
    state: Option<String>,
    postal_code: Option<String>,
    country: Option<String>,
}

impl From<UserRow> for UserProfile {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            email: row.email,
            address_line1: row.address_line1,
            address_line2: row.address_line2,
            city: row.city,
            state: row.state,
            postal_code: row.postal_code,
            country: row.country,
        }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserProfile>> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT id, name, email, address_line1, address_line2, city, state, postal_code, country \
             FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(UserProfile::from))
    }
}

#[derive(Clone)]
pub struct PgProductStore {
    pool: PgPool,
}

impl PgProductStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct ProductRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    price: Decimal,
    stock_quantity: i32,
    discount_percentage: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ProductRow> for Product {
    fn from(row: ProductRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            description: row.description,
            price: row.price,
            stock_quantity: row.stock_quantity.max(0) as u32,
            discount_percentage: row.discount_percentage.max(0) as u32,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Merge duplicate product ids and sort, giving every transaction the same
/// lock acquisition order.
fn merged_sorted_lines(lines: &[StockLine]) -> Vec<(Uuid, u32)> {
    let mut totals: HashMap<Uuid, u32> = HashMap::new();
    for line in lines {
        *totals.entry(line.product_id).or_default() += line.quantity;
    }
    let mut totals: Vec<(Uuid, u32)> = totals.into_iter().collect();
    totals.sort_by_key(|(id, _)| *id);
    totals
}

#[async_trait]
impl ProductStore for PgProductStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Product>> {
        let row: Option<ProductRow> = sqlx::query_as(
            "SELECT id, name, description, price, stock_quantity, discount_percentage, created_at, updated_at \
             FROM products WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Product::from))
    }

    async fn reserve_stock(&self, lines: &[StockLine]) -> Result<()> {
        let mut txn = self.pool.begin().await?;
        for (product_id, quantity) in merged_sorted_lines(lines) {
            let row: Option<(String, i32)> =
                sqlx::query_as("SELECT name, stock_quantity FROM products WHERE id = $1 FOR UPDATE")
                    .bind(product_id)
                    .fetch_optional(&mut *txn)
                    .await?;
            let (name, available) = row.ok_or(OrderError::ProductNotFound(product_id))?;
            let available = available.max(0) as u32;
            if available < quantity {
                // Dropping the transaction rolls back earlier decrements.
                return Err(OrderError::InsufficientStock {
                    name,
                    requested: quantity,
                    available,
                });
            }
            sqlx::query(
                "UPDATE products SET stock_quantity = stock_quantity - $2, updated_at = NOW() WHERE id = $1",
            )
            .bind(product_id)
            .bind(quantity as i32)
            .execute(&mut *txn)
            .await?;
        }
        txn.commit().await?;
        debug!(lines = lines.len(), "reserved stock");
        Ok(())
    }

    async fn release_stock(&self, lines: &[StockLine]) -> Result<()> {
        let mut txn = self.pool.begin().await?;
        for (product_id, quantity) in merged_sorted_lines(lines) {
            sqlx::query(
                "UPDATE products SET stock_quantity = stock_quantity + $2, updated_at = NOW() WHERE id = $1",
            )
            .bind(product_id)
            .bind(quantity as i32)
            .execute(&mut *txn)
            .await?;
        }
        txn.commit().await?;
        debug!(lines = lines.len(), "released stock");
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_items(&self, order_ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<OrderItem>>> {
        let rows: Vec<OrderItemRow> = sqlx::query_as(
            "SELECT id, order_id, product_id, product_name, quantity, price, discounted_price \
             FROM order_items WHERE order_id = ANY($1)",
        )
        .bind(order_ids)
        .fetch_all(&self.pool)
        .await?;
        let mut items: HashMap<Uuid, Vec<OrderItem>> = HashMap::new();
        for row in rows {
            items.entry(row.order_id).or_default().push(row.into());
        }
        Ok(items)
    }

    async fn assemble(&self, rows: Vec<OrderRow>) -> Result<Vec<Order>> {
        let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();
        let mut items = self.load_items(&ids).await?;
        rows.into_iter()
            .map(|row| {
                let order_items = items.remove(&row.id).unwrap_or_default();
                row.into_order(order_items)
            })
            .collect()
    }
}

#[derive(FromRow)]
struct OrderRow {
    id: Uuid,
    order_number: String,
    user_id: Uuid,
    shipping_address: Json<Address>,
    delivery_address: Json<Address>,
    status: String,
    payment_status: String,
    payment_method: String,
    transaction_id: Option<String>,
    subtotal: Decimal,
    shipping_cost: Decimal,
    tax: Decimal,
    discount: Decimal,
    total: Decimal,
    notes: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
}

impl OrderRow {
    fn into_order(self, items: Vec<OrderItem>) -> Result<Order> {
        Ok(Order {
            id: self.id,
            order_number: OrderNumber::from(self.order_number),
            user_id: self.user_id,
            items,
            shipping_address: self.shipping_address.0,
            delivery_address: self.delivery_address.0,
            status: self.status.parse()?,
            payment_status: self.payment_status.parse()?,
            payment_method: self.payment_method.parse()?,
            transaction_id: self.transaction_id,
            subtotal: self.subtotal,
            shipping_cost: self.shipping_cost,
            tax: self.tax,
            discount: self.discount,
            total: self.total,
            notes: self.notes,
            created_at: self.created_at,
            updated_at: self.updated_at,
            delivered_at: self.delivered_at,
        })
    }
}

#[derive(FromRow)]
struct OrderItemRow {
    id: Uuid,
    order_id: Uuid,
    product_id: Uuid,
    product_name: String,
    quantity: i32,
    price: Decimal,
    discounted_price: Decimal,
}

impl From<OrderItemRow> for OrderItem {
    fn from(row: OrderItemRow) -> Self {
        Self {
            id: row.id,
            product_id: row.product_id,
            product_name: row.product_name,
            quantity: row.quantity.max(0) as u32,
            price: row.price,
            discounted_price: row.discounted_price,
        }
    }
}

const SELECT_ORDER: &str = "SELECT id, order_number, user_id, shipping_address, delivery_address, \
    status, payment_status, payment_method, transaction_id, subtotal, shipping_cost, tax, \
    discount, total, notes, created_at, updated_at, delivered_at FROM orders";

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn insert(&self, order: &Order) -> Result<()> {
        let mut txn = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO orders (id, order_number, user_id, shipping_address, delivery_address, \
             status, payment_status, payment_method, transaction_id, subtotal, shipping_cost, tax, \
             discount, total, notes, created_at, updated_at, delivered_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)",
        )
        .bind(order.id)
        .bind(order.order_number.as_str())
        .bind(order.user_id)
        .bind(Json(&order.shipping_address))
        .bind(Json(&order.delivery_address))
        .bind(order.status.as_str())
        .bind(order.payment_status.as_str())
        .bind(order.payment_method.as_str())
        .bind(&order.transaction_id)
        .bind(order.subtotal)
        .bind(order.shipping_cost)
        .bind(order.tax)
        .bind(order.discount)
        .bind(order.total)
        .bind(&order.notes)
        .bind(order.created_at)
        .bind(order.updated_at)
        .bind(order.delivered_at)
        .execute(&mut *txn)
        .await?;
        for item in &order.items {
            sqlx::query(
                "INSERT INTO order_items (id, order_id, product_id, product_name, quantity, price, discounted_price) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(item.id)
            .bind(order.id)
            .bind(item.product_id)
            .bind(&item.product_name)
            .bind(item.quantity as i32)
            .bind(item.price)
            .bind(item.discounted_price)
            .execute(&mut *txn)
            .await?;
        }
        txn.commit().await?;
        debug!(order_id = %order.id, order_number = %order.order_number, "inserted order");
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Order>> {
        let row: Option<OrderRow> = sqlx::query_as(&format!("{SELECT_ORDER} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let items = self
                    .load_items(&[row.id])
                    .await?
                    .remove(&row.id)
                    .unwrap_or_default();
                Ok(Some(row.into_order(items)?))
            }
            None => Ok(None),
        }
    }

    async fn find_by_user(&self, user_id: Uuid) -> Result<Vec<Order>> {
        let rows: Vec<OrderRow> =
            sqlx::query_as(&format!("{SELECT_ORDER} WHERE user_id = $1 ORDER BY created_at DESC"))
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        self.assemble(rows).await
    }

    async fn find_all(&self) -> Result<Vec<Order>> {
        let rows: Vec<OrderRow> =
            sqlx::query_as(&format!("{SELECT_ORDER} ORDER BY created_at DESC"))
                .fetch_all(&self.pool)
                .await?;
        self.assemble(rows).await
    }

    async fn update_payment(&self, order: &Order) -> Result<()> {
        let result = sqlx::query(
            "UPDATE orders SET payment_status = $2, transaction_id = $3, updated_at = $4 \
             WHERE id = $1",
        )
        .bind(order.id)
        .bind(order.payment_status.as_str())
        .bind(&order.transaction_id)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(OrderError::OrderNotFound(order.id));
        }
        Ok(())
    }

    async fn transition(
        &self,
        order: &Order,
        expected: OrderStatus,
        restock: &[StockLine],
    ) -> Result<()> {
        let mut txn = self.pool.begin().await?;
        // The status predicate makes this a compare-and-swap: a concurrent
        // transition that commits first leaves zero rows affected here.
        let result = sqlx::query(
            "UPDATE orders SET status = $3, updated_at = $4, delivered_at = $5 \
             WHERE id = $1 AND status = $2",
        )
        .bind(order.id)
        .bind(expected.as_str())
        .bind(order.status.as_str())
        .bind(order.updated_at)
        .bind(order.delivered_at)
        .execute(&mut *txn)
        .await?;
        if result.rows_affected() == 0 {
            let current: Option<(String,)> =
                sqlx::query_as("SELECT status FROM orders WHERE id = $1")
                    .bind(order.id)
                    .fetch_optional(&mut *txn)
                    .await?;
            return match current {
                None => Err(OrderError::OrderNotFound(order.id)),
                Some((status,)) => Err(OrderError::InvalidTransition {
                    from: status.parse()?,
                    to: order.status,
                }),
            };
        }
        for (product_id, quantity) in merged_sorted_lines(restock) {
            sqlx::query(
                "UPDATE products SET stock_quantity = stock_quantity + $2, updated_at = NOW() WHERE id = $1",
            )
            .bind(product_id)
            .bind(quantity as i32)
            .execute(&mut *txn)
            .await?;
        }
        txn.commit().await?;
        debug!(order_id = %order.id, status = %order.status, "committed status transition");
        Ok(())
    }
}
