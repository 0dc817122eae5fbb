//! Order status state machine.
//!
//! Stock is committed exactly once, at order creation. The only transition with
//! an inventory side effect is cancellation, which returns every item's
//! quantity to its product's stock. A cancelled order can never leave
//! CANCELLED, which also guards against restoring stock twice.

use crate::domain::aggregates::order::OrderStatus;
use crate::error::{OrderError, Result};

/// Inventory side effect carried by a status transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StockEffect {
    None,
    /// Return every item's quantity to its product's stock.
    Restore,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub stock_effect: StockEffect,
    /// The transition stamps `delivered_at`.
    pub delivers: bool,
}

pub fn is_valid_transition(from: OrderStatus, to: OrderStatus) -> bool {
    use OrderStatus::*;
    matches!(
        (from, to),
        (Pending, Processing)
            | (Pending, Shipped)
            | (Pending, Delivered)
            | (Pending, Cancelled)
            | (Processing, Shipped)
            | (Processing, Delivered)
            | (Processing, Cancelled)
            | (Shipped, Delivered)
            | (Shipped, Cancelled)
            | (Delivered, Cancelled)
    )
}

/// Validate a transition and describe its side effects.
pub fn validate_transition(from: OrderStatus, to: OrderStatus) -> Result<TransitionOutcome> {
    if !is_valid_transition(from, to) {
        return Err(OrderError::InvalidTransition { from, to });
    }
    Ok(TransitionOutcome {
        stock_effect: if to == OrderStatus::Cancelled {
            StockEffect::Restore
        } else {
            StockEffect::None
        },
        delivers: to == OrderStatus::Delivered,
    })
}

/// Owners may only cancel before fulfilment starts; cancelling later states is
/// an admin-only correction.
pub fn cancellable_by_owner(status: OrderStatus) -> bool {
    matches!(status, OrderStatus::Pending | OrderStatus::Processing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use OrderStatus::*;

    #[test]
    fn test_forward_path_is_valid() {
        for (from, to) in [(Pending, Processing), (Processing, Shipped), (Shipped, Delivered)] {
            let outcome = validate_transition(from, to).unwrap();
            assert_eq!(outcome.stock_effect, StockEffect::None);
        }
        assert!(validate_transition(Shipped, Delivered).unwrap().delivers);
    }

    #[test]
    fn test_cancellation_restores_stock() {
        for from in [Pending, Processing, Shipped, Delivered] {
            let outcome = validate_transition(from, Cancelled).unwrap();
            assert_eq!(outcome.stock_effect, StockEffect::Restore);
        }
    }

    #[test]
    fn test_cancelled_is_terminal() {
        for to in [Pending, Processing, Shipped, Delivered, Cancelled] {
            assert!(validate_transition(Cancelled, to).is_err());
        }
    }

    #[test]
    fn test_no_backward_or_self_transitions() {
        assert!(validate_transition(Shipped, Processing).is_err());
        assert!(validate_transition(Delivered, Shipped).is_err());
        assert!(validate_transition(Pending, Pending).is_err());
    }

    #[test]
    fn test_owner_cancellation_window() {
        assert!(cancellable_by_owner(Pending));
        assert!(cancellable_by_owner(Processing));
        assert!(!cancellable_by_owner(Shipped));
        assert!(!cancellable_by_owner(Delivered));
        assert!(!cancellable_by_owner(Cancelled));
    }
}
