//! Value objects for the order core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Postal address snapshot embedded in an order.
///
/// Copied by value at order creation; later edits to the user's profile never
/// rewrite the addresses on historical orders.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub address_line1: String,
    pub address_line2: Option<String>,
    pub city: String,
    pub state: String,
    pub postal_code: String,
    pub country: String,
}

impl Address {
    /// Every required field present and non-blank. `address_line2` stays optional.
    pub fn is_complete(&self) -> bool {
        !self.address_line1.trim().is_empty()
            && !self.city.trim().is_empty()
            && !self.state.trim().is_empty()
            && !self.postal_code.trim().is_empty()
            && !self.country.trim().is_empty()
    }
}

/// Human-facing order number: `ORD-<yyyyMMddHHmmss>-<4-char suffix>`.
///
/// The suffix is random, so collisions are possible; the persistence layer
/// enforces uniqueness and order creation retries generation on conflict.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderNumber(String);

impl OrderNumber {
    pub fn generate(at: DateTime<Utc>) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("ORD-{}-{}", at.format("%Y%m%d%H%M%S"), &suffix[..4]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for OrderNumber {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_address() -> Address {
        Address {
            address_line1: "1 Market St".into(),
            address_line2: None,
            city: "Springfield".into(),
            state: "IL".into(),
            postal_code: "62701".into(),
            country: "US".into(),
        }
    }

    #[test]
    fn test_complete_address() {
        assert!(full_address().is_complete());
    }

    #[test]
    fn test_blank_field_is_incomplete() {
        let mut address = full_address();
        address.city = "   ".into();
        assert!(!address.is_complete());
    }

    #[test]
    fn test_order_number_format() {
        let number = OrderNumber::generate(Utc::now());
        let parts: Vec<&str> = number.as_str().split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "ORD");
        assert_eq!(parts[1].len(), 14);
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(parts[2].len(), 4);
    }
}
