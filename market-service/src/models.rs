use anyhow::anyhow;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use shared::{NewOrder, Order, OrderStatus, StockEntry, WalletAccount, FULL_DURABILITY};

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::market)]
pub struct MarketRow {
    pub settlement_id: i64,
    pub item_id: i64,
    pub current_price: i64,
    pub qty_available: i32,
}

impl From<MarketRow> for StockEntry {
    fn from(row: MarketRow) -> Self {
        Self {
            settlement_id: row.settlement_id,
            item_id: row.item_id,
            unit_price: row.current_price,
            quantity_available: row.qty_available,
        }
    }
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::characters)]
pub struct CharacterRow {
    pub character_id: i64,
    pub user_id: i64,
    pub money: i64,
    pub created_at: Option<DateTime<Utc>>,
}

impl From<CharacterRow> for WalletAccount {
    fn from(row: CharacterRow) -> Self {
        Self {
            account_id: row.character_id,
            buyer_id: row.user_id,
            balance: row.money,
        }
    }
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::orders)]
pub struct OrderRow {
    pub request_token: String,
    pub buyer_id: i64,
    pub item_id: i64,
    pub quantity: i32,
    pub unit_price: i64,
    pub total_price: i64,
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl TryFrom<OrderRow> for Order {
    type Error = anyhow::Error;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        let status = OrderStatus::parse(&row.status)
            .ok_or_else(|| anyhow!("unknown order status {:?}", row.status))?;
        Ok(Self {
            request_token: row.request_token,
            buyer_id: row.buyer_id,
            item_id: row.item_id,
            quantity: row.quantity,
            unit_price: row.unit_price,
            total_price: row.total_price,
            status,
            created_at: row.created_at.unwrap_or_else(Utc::now),
        })
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct NewOrderRow {
    pub request_token: String,
    pub buyer_id: i64,
    pub item_id: i64,
    pub quantity: i32,
    pub unit_price: i64,
    pub total_price: i64,
    pub status: String,
}

impl From<&NewOrder> for NewOrderRow {
    fn from(order: &NewOrder) -> Self {
        Self {
            request_token: order.request_token.clone(),
            buyer_id: order.buyer_id,
            item_id: order.item_id,
            quantity: order.quantity,
            unit_price: order.unit_price,
            total_price: order.total_price,
            status: OrderStatus::Pending.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::inventories)]
pub struct NewInventoryRow {
    pub character_id: i64,
    pub item_id: i64,
    pub quantity: i32,
    pub durability: i32,
}

impl NewInventoryRow {
    pub fn full(character_id: i64, item_id: i64, quantity: i32) -> Self {
        Self {
            character_id,
            item_id,
            quantity,
            durability: FULL_DURABILITY,
        }
    }
}
