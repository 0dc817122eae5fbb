//! Order operations: assembly and pricing, status transitions, and the
//! authorization guards in front of them.
//!
//! Every operation takes an explicit [`Requester`] identity; there is no
//! ambient security context. Preconditions are checked in a fixed order and
//! the first violation wins, before anything is mutated.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::domain::aggregates::order::{
    Order, OrderItem, OrderStatus, PaymentMethod, PaymentStatus,
};
use crate::domain::transitions::{self, StockEffect};
use crate::domain::value_objects::Address;
use crate::error::{OrderError, Result};
use crate::store::{OrderStore, ProductStore, UserStore};

/// How many fresh order numbers creation tries after a uniqueness conflict
/// before surfacing the conflict.
const ORDER_NUMBER_RETRIES: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    User,
    DeliveryPartner,
    Admin,
}

/// Identity of the caller, passed explicitly into every operation.
#[derive(Clone, Debug)]
pub struct Requester {
    pub user_id: Uuid,
    pub roles: Vec<Role>,
}

impl Requester {
    pub fn user(user_id: Uuid) -> Self {
        Self { user_id, roles: vec![Role::User] }
    }

    pub fn delivery_partner(user_id: Uuid) -> Self {
        Self { user_id, roles: vec![Role::User, Role::DeliveryPartner] }
    }

    pub fn admin(user_id: Uuid) -> Self {
        Self { user_id, roles: vec![Role::User, Role::Admin] }
    }

    pub fn is_admin(&self) -> bool {
        self.roles.contains(&Role::Admin)
    }

    /// Admins and delivery partners may see and fulfil any order.
    pub fn is_privileged(&self) -> bool {
        self.roles
            .iter()
            .any(|role| matches!(role, Role::Admin | Role::DeliveryPartner))
    }

    fn owns(&self, order: &Order) -> bool {
        order.user_id == self.user_id
    }
}

// Serialize is required by the length check on `CreateOrderRequest::items`,
// which embeds the offending value in the validation error parameters.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct OrderItemRequest {
    pub product_id: Uuid,
    #[validate(range(min = 1, message = "quantity must be greater than 0"))]
    pub quantity: u32,
}

/// Input contract for [`OrderService::create_order`].
///
/// The `Validate` derive gives the HTTP layer an early shape check; the
/// service re-checks everything in contract order regardless.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct CreateOrderRequest {
    #[validate(length(min = 1, message = "order must contain at least one item"))]
    pub items: Vec<OrderItemRequest>,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub notes: Option<String>,
    /// Deliver to the requester's profile address instead of an explicit one.
    #[serde(default = "default_use_profile_address")]
    pub use_profile_address: bool,
    #[serde(default)]
    pub delivery_address: Option<Address>,
}

fn default_use_profile_address() -> bool {
    true
}

impl CreateOrderRequest {
    /// Build a request from the parallel product-id and quantity lists used by
    /// the form-encoded wire format.
    pub fn from_lists(
        product_ids: &[Uuid],
        quantities: &[u32],
        payment_method: PaymentMethod,
        notes: Option<String>,
        use_profile_address: bool,
        delivery_address: Option<Address>,
    ) -> Result<Self> {
        if product_ids.len() != quantities.len() {
            return Err(OrderError::Validation(
                "number of product ids must match number of quantities".into(),
            ));
        }
        let items = product_ids
            .iter()
            .zip(quantities)
            .map(|(product_id, quantity)| OrderItemRequest {
                product_id: *product_id,
                quantity: *quantity,
            })
            .collect();
        Ok(Self {
            items,
            payment_method,
            notes,
            use_profile_address,
            delivery_address,
        })
    }
}

/// The order core. Owns no storage; everything goes through the store traits.
pub struct OrderService {
    users: Arc<dyn UserStore>,
    products: Arc<dyn ProductStore>,
    orders: Arc<dyn OrderStore>,
}

impl OrderService {
    pub fn new(
        users: Arc<dyn UserStore>,
        products: Arc<dyn ProductStore>,
        orders: Arc<dyn OrderStore>,
    ) -> Self {
        Self { users, products, orders }
    }

    /// Assemble and persist a new order for the requesting user.
    ///
    /// Checks, in order: profile address completeness, delivery address
    /// completeness, non-empty item list, then per item quantity, existence and
    /// stock. Stock for every line is then reserved atomically before the
    /// order row is written; a creation failure after reservation releases the
    /// reserved quantities again.
    pub async fn create_order(
        &self,
        requester: &Requester,
        request: CreateOrderRequest,
    ) -> Result<Order> {
        let user = self
            .users
            .find_by_id(requester.user_id)
            .await?
            .ok_or(OrderError::UserNotFound(requester.user_id))?;

        let shipping_address = user.profile_address().ok_or_else(|| {
            OrderError::Validation(
                "user profile address is incomplete; update the profile with a complete address"
                    .into(),
            )
        })?;

        let delivery_address = if request.use_profile_address {
            shipping_address.clone()
        } else {
            match request.delivery_address {
                Some(address) if address.is_complete() => address,
                _ => {
                    return Err(OrderError::Validation(
                        "delivery address is incomplete; provide all required fields".into(),
                    ))
                }
            }
        };

        if request.items.is_empty() {
            return Err(OrderError::Validation(
                "order must contain at least one item".into(),
            ));
        }

        let mut order = Order::create(
            user.id,
            shipping_address,
            delivery_address,
            request.payment_method,
            request.notes,
        );

        for item in &request.items {
            if item.quantity == 0 {
                return Err(OrderError::Validation(
                    "quantity must be greater than 0".into(),
                ));
            }
            let product = self
                .products
                .find_by_id(item.product_id)
                .await?
                .ok_or(OrderError::ProductNotFound(item.product_id))?;
            if !product.has_stock(item.quantity) {
                return Err(OrderError::InsufficientStock {
                    name: product.name.clone(),
                    requested: item.quantity,
                    available: product.stock_quantity,
                });
            }
            order.add_item(OrderItem::snapshot(&product, item.quantity));
        }

        // Commit the reservation only once every line has passed validation.
        let lines = order.stock_lines();
        self.products.reserve_stock(&lines).await?;

        if let Err(err) = self.insert_with_retries(&mut order).await {
            warn!(order_number = %order.order_number, %err, "releasing reserved stock after failed insert");
            if let Err(release_err) = self.products.release_stock(&lines).await {
                warn!(%release_err, "failed to release reserved stock");
            }
            return Err(err);
        }

        info!(order_id = %order.id, order_number = %order.order_number, total = %order.total, "order created");
        Ok(order)
    }

    async fn insert_with_retries(&self, order: &mut Order) -> Result<()> {
        let mut attempts = 0;
        loop {
            match self.orders.insert(order).await {
                Err(OrderError::Conflict) if attempts < ORDER_NUMBER_RETRIES => {
                    attempts += 1;
                    debug!(order_number = %order.order_number, "order number collision, regenerating");
                    order.regenerate_order_number();
                }
                other => return other,
            }
        }
    }

    /// Fetch one order; owners see their own, privileged roles see any.
    pub async fn get_order(&self, requester: &Requester, order_id: Uuid) -> Result<Order> {
        let order = self.find_order(order_id).await?;
        if !requester.owns(&order) && !requester.is_privileged() {
            return Err(OrderError::Forbidden);
        }
        Ok(order)
    }

    /// The requester's own orders, or every order for privileged roles.
    pub async fn list_orders(&self, requester: &Requester) -> Result<Vec<Order>> {
        if requester.is_privileged() {
            self.orders.find_all().await
        } else {
            self.orders.find_by_user(requester.user_id).await
        }
    }

    /// Admin view of another user's orders.
    pub async fn list_orders_for_user(
        &self,
        requester: &Requester,
        user_id: Uuid,
    ) -> Result<Vec<Order>> {
        if !requester.is_admin() {
            return Err(OrderError::Forbidden);
        }
        self.users
            .find_by_id(user_id)
            .await?
            .ok_or(OrderError::UserNotFound(user_id))?;
        self.orders.find_by_user(user_id).await
    }

    /// Move an order to a new status. Restricted to admins and delivery
    /// partners; cancelling an order that is past PROCESSING is an admin-only
    /// correction.
    pub async fn update_status(
        &self,
        requester: &Requester,
        order_id: Uuid,
        status: OrderStatus,
    ) -> Result<Order> {
        if !requester.is_privileged() {
            return Err(OrderError::Forbidden);
        }
        let mut order = self.find_order(order_id).await?;
        if status == OrderStatus::Cancelled
            && !transitions::cancellable_by_owner(order.status)
            && !requester.is_admin()
        {
            return Err(OrderError::Forbidden);
        }
        self.transition_and_store(&mut order, status).await?;
        info!(order_id = %order.id, status = %order.status, "order status updated");
        Ok(order)
    }

    /// Set payment state, independent of the fulfilment status machine. Admins
    /// may set any value at any time, optionally attaching a transaction id.
    pub async fn update_payment_status(
        &self,
        requester: &Requester,
        order_id: Uuid,
        status: PaymentStatus,
        transaction_id: Option<String>,
    ) -> Result<Order> {
        if !requester.is_admin() {
            return Err(OrderError::Forbidden);
        }
        let mut order = self.find_order(order_id).await?;
        order.set_payment_status(status, transaction_id);
        self.orders.update_payment(&order).await?;
        info!(order_id = %order.id, payment_status = %order.payment_status, "payment status updated");
        Ok(order)
    }

    /// Cancel an order and return its items to stock. Owners may cancel while
    /// the order is PENDING or PROCESSING; admins may cancel any order that is
    /// not already cancelled.
    pub async fn cancel_order(&self, requester: &Requester, order_id: Uuid) -> Result<Order> {
        let mut order = self.find_order(order_id).await?;
        if !requester.owns(&order) && !requester.is_admin() {
            return Err(OrderError::Forbidden);
        }
        if !requester.is_admin() && !transitions::cancellable_by_owner(order.status) {
            return Err(OrderError::InvalidTransition {
                from: order.status,
                to: OrderStatus::Cancelled,
            });
        }
        self.transition_and_store(&mut order, OrderStatus::Cancelled).await?;
        info!(order_id = %order.id, "order cancelled");
        Ok(order)
    }

    async fn find_order(&self, order_id: Uuid) -> Result<Order> {
        self.orders
            .find_by_id(order_id)
            .await?
            .ok_or(OrderError::OrderNotFound(order_id))
    }

    /// Validate the transition against the loaded order, then hand the store a
    /// compare-and-swap: the new status and its stock restore commit as one
    /// unit of work, and only while the stored status still equals the one the
    /// transition was validated against. A concurrent transition that wins the
    /// race leaves this one failing with `InvalidTransition`, so stock is never
    /// restored twice.
    async fn transition_and_store(&self, order: &mut Order, to: OrderStatus) -> Result<()> {
        let from = order.status;
        let outcome = transitions::validate_transition(from, to).map_err(|err| {
            warn!(order_id = %order.id, from = %from, to = %to, "rejected status transition");
            err
        })?;
        order.set_status(to);
        let restock = match outcome.stock_effect {
            StockEffect::Restore => order.stock_lines(),
            StockEffect::None => Vec::new(),
        };
        self.orders.transition(order, from, &restock).await?;
        if outcome.stock_effect == StockEffect::Restore {
            info!(order_id = %order.id, "restored stock for cancelled order");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::product::Product;
    use crate::store::{MockOrderStore, MockProductStore, MockUserStore, UserProfile};
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn profile(id: Uuid) -> UserProfile {
        UserProfile {
            id,
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

    fn product(id: Uuid) -> Product {
        Product {
            id,
            name: "Widget".into(),
            description: None,
            price: Decimal::new(1000, 2),
            stock_quantity: 5,
            discount_percentage: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn request(product_id: Uuid) -> CreateOrderRequest {
        CreateOrderRequest {
            items: vec![OrderItemRequest { product_id, quantity: 1 }],
            payment_method: PaymentMethod::Paypal,
            notes: None,
            use_profile_address: true,
            delivery_address: None,
        }
    }

    #[tokio::test]
    async fn test_failed_insert_releases_reserved_stock() {
        let user_id = Uuid::new_v4();
        let product_id = Uuid::new_v4();

        let mut users = MockUserStore::new();
        users
            .expect_find_by_id()
            .returning(move |id| Ok(Some(profile(id))));

        let mut products = MockProductStore::new();
        products
            .expect_find_by_id()
            .returning(move |id| Ok(Some(product(id))));
        products.expect_reserve_stock().times(1).returning(|_| Ok(()));
        products
            .expect_release_stock()
            .times(1)
            .withf(move |lines| lines.len() == 1 && lines[0].product_id == product_id)
            .returning(|_| Ok(()));

        let mut orders = MockOrderStore::new();
        orders
            .expect_insert()
            .returning(|_| Err(OrderError::Storage("connection reset".into())));

        let service = OrderService::new(Arc::new(users), Arc::new(products), Arc::new(orders));
        let err = service
            .create_order(&Requester::user(user_id), request(product_id))
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::Storage(_)));
    }

    #[tokio::test]
    async fn test_order_number_collision_is_retried() {
        let user_id = Uuid::new_v4();
        let product_id = Uuid::new_v4();

        let mut users = MockUserStore::new();
        users
            .expect_find_by_id()
            .returning(move |id| Ok(Some(profile(id))));

        let mut products = MockProductStore::new();
        products
            .expect_find_by_id()
            .returning(move |id| Ok(Some(product(id))));
        products.expect_reserve_stock().times(1).returning(|_| Ok(()));
        products.expect_release_stock().never();

        let mut orders = MockOrderStore::new();
        let mut calls = 0;
        orders.expect_insert().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(OrderError::Conflict)
            } else {
                Ok(())
            }
        });

        let service = OrderService::new(Arc::new(users), Arc::new(products), Arc::new(orders));
        let order = service
            .create_order(&Requester::user(user_id), request(product_id))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_conflict() {
        let user_id = Uuid::new_v4();
        let product_id = Uuid::new_v4();

        let mut users = MockUserStore::new();
        users
            .expect_find_by_id()
            .returning(move |id| Ok(Some(profile(id))));

        let mut products = MockProductStore::new();
        products
            .expect_find_by_id()
            .returning(move |id| Ok(Some(product(id))));
        products.expect_reserve_stock().times(1).returning(|_| Ok(()));
        products.expect_release_stock().times(1).returning(|_| Ok(()));

        let mut orders = MockOrderStore::new();
        orders
            .expect_insert()
            .times((ORDER_NUMBER_RETRIES + 1) as usize)
            .returning(|_| Err(OrderError::Conflict));

        let service = OrderService::new(Arc::new(users), Arc::new(products), Arc::new(orders));
        let err = service
            .create_order(&Requester::user(user_id), request(product_id))
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::Conflict));
    }

    #[test]
    fn test_mismatched_lists_are_rejected() {
        let err = CreateOrderRequest::from_lists(
            &[Uuid::new_v4(), Uuid::new_v4()],
            &[1],
            PaymentMethod::Paypal,
            None,
            true,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, OrderError::Validation(_)));
    }

    #[test]
    fn test_request_shape_validation() {
        let empty = CreateOrderRequest {
            items: vec![],
            payment_method: PaymentMethod::Paypal,
            notes: None,
            use_profile_address: true,
            delivery_address: None,
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_item_request_serializes_for_validation_params() {
        let item = OrderItemRequest {
            product_id: Uuid::new_v4(),
            quantity: 2,
        };
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["quantity"], 2);
    }
}
