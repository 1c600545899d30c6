use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One buy attempt as submitted by a client.
///
/// `request_token` is the client-generated idempotency token: resubmitting
/// the same token replays the original outcome instead of repeating the
/// side effects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseRequest {
    pub request_token: String,
    pub buyer_id: i64,
    pub settlement_id: i64,
    pub item_id: i64,
    pub quantity: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Completed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<OrderStatus> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "completed" => Some(OrderStatus::Completed),
            _ => None,
        }
    }
}

/// A persisted purchase attempt. At most one order ever exists per
/// `request_token`; once `Completed` the row is immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub request_token: String,
    pub buyer_id: i64,
    pub item_id: i64,
    pub quantity: i32,
    pub unit_price: i64,
    pub total_price: i64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

/// Column values for an order row that has not been written yet.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub request_token: String,
    pub buyer_id: i64,
    pub item_id: i64,
    pub quantity: i32,
    pub unit_price: i64,
    pub total_price: i64,
}

impl NewOrder {
    /// `unit_price` must be the price observed under the stock row lock, so
    /// a concurrent price change cannot slip in between validation and
    /// commit.
    pub fn from_request(req: &PurchaseRequest, unit_price: i64) -> Self {
        Self {
            request_token: req.request_token.clone(),
            buyer_id: req.buyer_id,
            item_id: req.item_id,
            quantity: req.quantity,
            unit_price,
            total_price: unit_price * i64::from(req.quantity),
        }
    }
}

/// Stock on offer at one settlement, keyed by (settlement_id, item_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockEntry {
    pub settlement_id: i64,
    pub item_id: i64,
    pub unit_price: i64,
    pub quantity_available: i32,
}

/// A buyer's spendable balance. The primary account is the buyer's
/// earliest-created character.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletAccount {
    pub account_id: i64,
    pub buyer_id: i64,
    pub balance: i64,
}

/// Durability a freshly purchased item starts with.
pub const FULL_DURABILITY: i32 = 100;

/// Append-only record of items handed to a buyer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub owner_id: i64,
    pub item_id: i64,
    pub quantity: i32,
    pub durability: i32,
}

/// Terminal outcome of a purchase. `duplicate` is true when the token had
/// already been settled and the original result was replayed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseReceipt {
    pub order_id: String,
    pub duplicate: bool,
}

/// Failures surfaced by a ledger store backend.
///
/// `Conflict` covers serialization/deadlock-class failures the caller may
/// retry from a fresh transaction; everything else is a `Fault`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store conflict: {0}")]
    Conflict(String),
    #[error("store fault: {0}")]
    Fault(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("quantity must be a positive integer, got {0}")]
    InvalidQuantity(i32),
    #[error("no listing for item {item_id} at settlement {settlement_id}")]
    UnknownListing { settlement_id: i64, item_id: i64 },
    #[error("insufficient stock for item {item_id}: {available} available, {requested} requested")]
    InsufficientStock {
        item_id: i64,
        available: i32,
        requested: i32,
    },
    #[error("insufficient funds: balance {balance}, total price {required}")]
    InsufficientFunds { balance: i64, required: i64 },
    #[error("purchase could not be completed, retry later: {0}")]
    TransientConflict(String),
    #[error("internal store failure: {0}")]
    StoreFault(String),
}

impl From<StoreError> for MarketError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(reason) => MarketError::TransientConflict(reason),
            StoreError::Fault(err) => MarketError::StoreFault(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_total_uses_price_at_lock_time() {
        let req = PurchaseRequest {
            request_token: "tok-1".to_string(),
            buyer_id: 7,
            settlement_id: 1,
            item_id: 3,
            quantity: 4,
        };
        let order = NewOrder::from_request(&req, 25);
        assert_eq!(order.unit_price, 25);
        assert_eq!(order.total_price, 100);
    }

    #[test]
    fn order_status_round_trips() {
        assert_eq!(OrderStatus::parse("pending"), Some(OrderStatus::Pending));
        assert_eq!(
            OrderStatus::parse(OrderStatus::Completed.as_str()),
            Some(OrderStatus::Completed)
        );
        assert_eq!(OrderStatus::parse("refunded"), None);
    }

    #[test]
    fn conflict_maps_to_transient() {
        let err = MarketError::from(StoreError::Conflict("serialization failure".to_string()));
        assert!(matches!(err, MarketError::TransientConflict(_)));
    }
}
