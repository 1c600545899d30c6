use async_trait::async_trait;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::pooled_connection::PoolError;
use diesel_async::{AnsiTransactionManager, AsyncPgConnection, RunQueryDsl, TransactionManager};
use shared::{NewOrder, Order, OrderStatus, StockEntry, StoreError, WalletAccount};

use crate::models::{CharacterRow, MarketRow, NewInventoryRow, NewOrderRow, OrderRow};
use crate::schema::{characters, inventories, market, orders};
use crate::store::{LedgerStore, LedgerTx, ReserveOutcome};

pub type DbPool = diesel_async::pooled_connection::bb8::Pool<AsyncPgConnection>;
type PooledConn = diesel_async::pooled_connection::bb8::PooledConnection<'static, AsyncPgConnection>;

/// `LedgerStore` backed by Postgres. Row locks are `SELECT ... FOR UPDATE`,
/// the idempotent order insert is `ON CONFLICT DO NOTHING`, and every
/// purchase runs inside one explicitly managed transaction.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn store_err(err: DieselError) -> StoreError {
    match err {
        DieselError::DatabaseError(DatabaseErrorKind::SerializationFailure, info) => {
            StoreError::Conflict(info.message().to_string())
        }
        other => StoreError::Fault(other.into()),
    }
}

fn pool_err(err: bb8::RunError<PoolError>) -> StoreError {
    StoreError::Fault(anyhow::Error::new(err))
}

#[async_trait]
impl LedgerStore for PgStore {
    type Tx = PgTx;

    async fn find_order(&self, token: &str) -> Result<Option<Order>, StoreError> {
        let mut conn = self.pool.get().await.map_err(pool_err)?;
        let row = orders::table
            .find(token)
            .first::<OrderRow>(&mut conn)
            .await
            .optional()
            .map_err(store_err)?;
        row.map(Order::try_from)
            .transpose()
            .map_err(StoreError::Fault)
    }

    async fn list_stock(&self, settlement_id: i64) -> Result<Vec<StockEntry>, StoreError> {
        let mut conn = self.pool.get().await.map_err(pool_err)?;
        let rows = market::table
            .filter(market::settlement_id.eq(settlement_id))
            .order(market::item_id.asc())
            .load::<MarketRow>(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(rows.into_iter().map(StockEntry::from).collect())
    }

    async fn begin(&self) -> Result<PgTx, StoreError> {
        let mut conn = self.pool.get_owned().await.map_err(pool_err)?;
        AnsiTransactionManager::begin_transaction(&mut *conn)
            .await
            .map_err(store_err)?;
        Ok(PgTx { conn })
    }
}

/// One open Postgres transaction. The connection is checked back into the
/// pool when the transaction object is dropped after commit/rollback.
pub struct PgTx {
    conn: PooledConn,
}

#[async_trait]
impl LedgerTx for PgTx {
    async fn lock_stock(
        &mut self,
        settlement_id: i64,
        item_id: i64,
    ) -> Result<Option<StockEntry>, StoreError> {
        let row = market::table
            .find((settlement_id, item_id))
            .for_update()
            .get_result::<MarketRow>(&mut *self.conn)
            .await
            .optional()
            .map_err(store_err)?;
        Ok(row.map(StockEntry::from))
    }

    async fn lock_wallet(&mut self, buyer_id: i64) -> Result<Option<WalletAccount>, StoreError> {
        let row = characters::table
            .filter(characters::user_id.eq(buyer_id))
            .order(characters::created_at.asc())
            .limit(1)
            .for_update()
            .get_result::<CharacterRow>(&mut *self.conn)
            .await
            .optional()
            .map_err(store_err)?;
        Ok(row.map(WalletAccount::from))
    }

    async fn reserve_order(&mut self, order: &NewOrder) -> Result<ReserveOutcome, StoreError> {
        let inserted = diesel::insert_into(orders::table)
            .values(NewOrderRow::from(order))
            .on_conflict(orders::request_token)
            .do_nothing()
            .execute(&mut *self.conn)
            .await
            .map_err(store_err)?;
        if inserted == 0 {
            Ok(ReserveOutcome::AlreadyExists)
        } else {
            Ok(ReserveOutcome::Reserved)
        }
    }

    async fn debit_stock(
        &mut self,
        settlement_id: i64,
        item_id: i64,
        quantity: i32,
    ) -> Result<(), StoreError> {
        diesel::update(market::table.find((settlement_id, item_id)))
            .set(market::qty_available.eq(market::qty_available - quantity))
            .execute(&mut *self.conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn debit_wallet(&mut self, account_id: i64, amount: i64) -> Result<(), StoreError> {
        diesel::update(characters::table.find(account_id))
            .set(characters::money.eq(characters::money - amount))
            .execute(&mut *self.conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn credit_inventory(
        &mut self,
        owner_id: i64,
        item_id: i64,
        quantity: i32,
    ) -> Result<(), StoreError> {
        diesel::insert_into(inventories::table)
            .values(NewInventoryRow::full(owner_id, item_id, quantity))
            .execute(&mut *self.conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn complete_order(&mut self, token: &str) -> Result<(), StoreError> {
        diesel::update(orders::table.find(token))
            .set(orders::status.eq(OrderStatus::Completed.as_str()))
            .execute(&mut *self.conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        AnsiTransactionManager::commit_transaction(&mut *self.conn)
            .await
            .map_err(store_err)
    }

    async fn rollback(mut self) -> Result<(), StoreError> {
        AnsiTransactionManager::rollback_transaction(&mut *self.conn)
            .await
            .map_err(store_err)
    }
}
