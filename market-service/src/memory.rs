use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use shared::{
    InventoryEntry, NewOrder, Order, OrderStatus, StockEntry, StoreError, WalletAccount,
    FULL_DURABILITY,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::store::{LedgerStore, LedgerTx, ReserveOutcome};

/// Transactional in-memory ledger store.
///
/// Each stock row and wallet account sits behind its own async mutex; a
/// transaction holds the owned guards of the rows it locked until commit or
/// rollback, which is the row-level pessimistic locking the purchase engine
/// relies on. Writes are staged inside the transaction and applied under
/// the held guards at commit, so other transactions never observe partial
/// state. Backs the test suite and the service's local mode.
#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<MemInner>,
}

#[derive(Default)]
struct MemInner {
    stock: Mutex<HashMap<(i64, i64), Arc<Mutex<StockCell>>>>,
    wallets: Mutex<HashMap<i64, WalletSlot>>,
    orders: Mutex<HashMap<String, Order>>,
    inventory: Mutex<Vec<InventoryEntry>>,
    account_seq: AtomicI64,
}

struct StockCell {
    unit_price: i64,
    quantity_available: i32,
}

struct WalletSlot {
    buyer_id: i64,
    created_seq: i64,
    cell: Arc<Mutex<WalletCell>>,
}

struct WalletCell {
    balance: i64,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Puts an item on offer at a settlement.
    pub async fn add_listing(
        &self,
        settlement_id: i64,
        item_id: i64,
        unit_price: i64,
        quantity: i32,
    ) {
        self.inner.stock.lock().await.insert(
            (settlement_id, item_id),
            Arc::new(Mutex::new(StockCell {
                unit_price,
                quantity_available: quantity,
            })),
        );
    }

    /// Creates a wallet account for a buyer and returns its id. Accounts
    /// created earlier stay the buyer's primary account.
    pub async fn add_account(&self, buyer_id: i64, balance: i64) -> i64 {
        let account_id = self.inner.account_seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.wallets.lock().await.insert(
            account_id,
            WalletSlot {
                buyer_id,
                created_seq: account_id,
                cell: Arc::new(Mutex::new(WalletCell { balance })),
            },
        );
        account_id
    }

    /// Committed quantity for one listing. Waits for any open transaction
    /// holding the row.
    pub async fn stock_quantity(&self, settlement_id: i64, item_id: i64) -> Option<i32> {
        let cell = {
            self.inner
                .stock
                .lock()
                .await
                .get(&(settlement_id, item_id))
                .cloned()
        };
        match cell {
            Some(cell) => Some(cell.lock().await.quantity_available),
            None => None,
        }
    }

    /// Committed balance of one wallet account.
    pub async fn balance(&self, account_id: i64) -> Option<i64> {
        let cell = {
            self.inner
                .wallets
                .lock()
                .await
                .get(&account_id)
                .map(|slot| slot.cell.clone())
        };
        match cell {
            Some(cell) => Some(cell.lock().await.balance),
            None => None,
        }
    }

    /// Every committed order, in no particular order.
    pub async fn orders(&self) -> Vec<Order> {
        self.inner.orders.lock().await.values().cloned().collect()
    }

    /// Committed inventory records for one owner.
    pub async fn inventory_of(&self, owner_id: i64) -> Vec<InventoryEntry> {
        self.inner
            .inventory
            .lock()
            .await
            .iter()
            .filter(|entry| entry.owner_id == owner_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl LedgerStore for MemStore {
    type Tx = MemTx;

    async fn find_order(&self, token: &str) -> Result<Option<Order>, StoreError> {
        Ok(self.inner.orders.lock().await.get(token).cloned())
    }

    async fn list_stock(&self, settlement_id: i64) -> Result<Vec<StockEntry>, StoreError> {
        let cells: Vec<((i64, i64), Arc<Mutex<StockCell>>)> = {
            self.inner
                .stock
                .lock()
                .await
                .iter()
                .filter(|(key, _)| key.0 == settlement_id)
                .map(|(key, cell)| (*key, cell.clone()))
                .collect()
        };
        let mut entries = Vec::with_capacity(cells.len());
        for ((settlement_id, item_id), cell) in cells {
            let cell = cell.lock().await;
            entries.push(StockEntry {
                settlement_id,
                item_id,
                unit_price: cell.unit_price,
                quantity_available: cell.quantity_available,
            });
        }
        entries.sort_by_key(|entry| entry.item_id);
        Ok(entries)
    }

    async fn begin(&self) -> Result<MemTx, StoreError> {
        Ok(MemTx {
            inner: self.inner.clone(),
            stock: None,
            wallet: None,
            order: None,
            inventory: Vec::new(),
        })
    }
}

struct StockLock {
    key: (i64, i64),
    guard: OwnedMutexGuard<StockCell>,
    debit: i32,
}

struct WalletLock {
    account_id: i64,
    guard: OwnedMutexGuard<WalletCell>,
    debit: i64,
}

/// One open in-memory transaction. Dropping it without commit releases the
/// row guards and discards every staged write.
pub struct MemTx {
    inner: Arc<MemInner>,
    stock: Option<StockLock>,
    wallet: Option<WalletLock>,
    order: Option<Order>,
    inventory: Vec<InventoryEntry>,
}

#[async_trait]
impl LedgerTx for MemTx {
    async fn lock_stock(
        &mut self,
        settlement_id: i64,
        item_id: i64,
    ) -> Result<Option<StockEntry>, StoreError> {
        let cell = {
            self.inner
                .stock
                .lock()
                .await
                .get(&(settlement_id, item_id))
                .cloned()
        };
        let cell = match cell {
            Some(cell) => cell,
            None => return Ok(None),
        };
        let guard = cell.lock_owned().await;
        let entry = StockEntry {
            settlement_id,
            item_id,
            unit_price: guard.unit_price,
            quantity_available: guard.quantity_available,
        };
        self.stock = Some(StockLock {
            key: (settlement_id, item_id),
            guard,
            debit: 0,
        });
        Ok(Some(entry))
    }

    async fn lock_wallet(&mut self, buyer_id: i64) -> Result<Option<WalletAccount>, StoreError> {
        let primary = {
            let wallets = self.inner.wallets.lock().await;
            let mut primary: Option<(i64, i64, Arc<Mutex<WalletCell>>)> = None;
            for (account_id, slot) in wallets.iter() {
                if slot.buyer_id != buyer_id {
                    continue;
                }
                let earlier = primary
                    .as_ref()
                    .map_or(true, |(seq, _, _)| slot.created_seq < *seq);
                if earlier {
                    primary = Some((slot.created_seq, *account_id, slot.cell.clone()));
                }
            }
            primary
        };
        let (_, account_id, cell) = match primary {
            Some(found) => found,
            None => return Ok(None),
        };
        let guard = cell.lock_owned().await;
        let account = WalletAccount {
            account_id,
            buyer_id,
            balance: guard.balance,
        };
        self.wallet = Some(WalletLock {
            account_id,
            guard,
            debit: 0,
        });
        Ok(Some(account))
    }

    async fn reserve_order(&mut self, order: &NewOrder) -> Result<ReserveOutcome, StoreError> {
        if self
            .inner
            .orders
            .lock()
            .await
            .contains_key(&order.request_token)
        {
            return Ok(ReserveOutcome::AlreadyExists);
        }
        self.order = Some(Order {
            request_token: order.request_token.clone(),
            buyer_id: order.buyer_id,
            item_id: order.item_id,
            quantity: order.quantity,
            unit_price: order.unit_price,
            total_price: order.total_price,
            status: OrderStatus::Pending,
            created_at: Utc::now(),
        });
        Ok(ReserveOutcome::Reserved)
    }

    async fn debit_stock(
        &mut self,
        settlement_id: i64,
        item_id: i64,
        quantity: i32,
    ) -> Result<(), StoreError> {
        let lock = match self.stock.as_mut() {
            Some(lock) if lock.key == (settlement_id, item_id) => lock,
            Some(_) => {
                return Err(StoreError::Fault(anyhow!(
                    "stock debit outside the locked row"
                )))
            }
            None => return Err(StoreError::Fault(anyhow!("stock row not locked"))),
        };
        if lock.guard.quantity_available - lock.debit < quantity {
            return Err(StoreError::Fault(anyhow!(
                "stock debit would drop quantity below zero"
            )));
        }
        lock.debit += quantity;
        Ok(())
    }

    async fn debit_wallet(&mut self, account_id: i64, amount: i64) -> Result<(), StoreError> {
        let lock = match self.wallet.as_mut() {
            Some(lock) if lock.account_id == account_id => lock,
            Some(_) => {
                return Err(StoreError::Fault(anyhow!(
                    "wallet debit outside the locked account"
                )))
            }
            None => return Err(StoreError::Fault(anyhow!("wallet account not locked"))),
        };
        if lock.guard.balance - lock.debit < amount {
            return Err(StoreError::Fault(anyhow!(
                "wallet debit would drop balance below zero"
            )));
        }
        lock.debit += amount;
        Ok(())
    }

    async fn credit_inventory(
        &mut self,
        owner_id: i64,
        item_id: i64,
        quantity: i32,
    ) -> Result<(), StoreError> {
        self.inventory.push(InventoryEntry {
            owner_id,
            item_id,
            quantity,
            durability: FULL_DURABILITY,
        });
        Ok(())
    }

    async fn complete_order(&mut self, token: &str) -> Result<(), StoreError> {
        match self.order.as_mut() {
            Some(order) if order.request_token == token => {
                order.status = OrderStatus::Completed;
                Ok(())
            }
            _ => Err(StoreError::Fault(anyhow!(
                "no reserved order for token {token:?}"
            ))),
        }
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        if let Some(order) = self.order.take() {
            let mut orders = self.inner.orders.lock().await;
            // Unique-token backstop, mirroring the orders primary key.
            if orders.contains_key(&order.request_token) {
                return Err(StoreError::Conflict(format!(
                    "order {} already committed",
                    order.request_token
                )));
            }
            orders.insert(order.request_token.clone(), order);
        }
        if let Some(mut lock) = self.stock.take() {
            lock.guard.quantity_available -= lock.debit;
        }
        if let Some(mut lock) = self.wallet.take() {
            lock.guard.balance -= lock.debit;
        }
        if !self.inventory.is_empty() {
            let staged = std::mem::take(&mut self.inventory);
            self.inner.inventory.lock().await.extend(staged);
        }
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::PurchaseRequest;
    use std::time::Duration;
    use tokio::time::timeout;

    fn new_order(token: &str) -> NewOrder {
        let req = PurchaseRequest {
            request_token: token.to_string(),
            buyer_id: 1,
            settlement_id: 1,
            item_id: 1,
            quantity: 1,
        };
        NewOrder::from_request(&req, 5)
    }

    #[tokio::test]
    async fn stock_lock_excludes_concurrent_transactions() {
        let store = MemStore::new();
        store.add_listing(1, 1, 5, 10).await;

        let mut holder = store.begin().await.unwrap();
        holder.lock_stock(1, 1).await.unwrap().unwrap();

        let contender = store.clone();
        let waiting = tokio::spawn(async move {
            let mut tx = contender.begin().await.unwrap();
            tx.lock_stock(1, 1).await.unwrap().unwrap();
            tx.rollback().await.unwrap();
        });

        // The second transaction must not get the row while it is held.
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        holder.rollback().await.unwrap();
        timeout(Duration::from_secs(1), waiting)
            .await
            .expect("lock was not released")
            .unwrap();
    }

    #[tokio::test]
    async fn staged_writes_are_invisible_until_commit() {
        let store = MemStore::new();
        store.add_listing(1, 1, 5, 10).await;
        let account_id = store.add_account(1, 100).await;

        let mut tx = store.begin().await.unwrap();
        tx.lock_stock(1, 1).await.unwrap().unwrap();
        tx.lock_wallet(1).await.unwrap().unwrap();
        tx.reserve_order(&new_order("tok-stage")).await.unwrap();
        tx.debit_stock(1, 1, 3).await.unwrap();
        tx.debit_wallet(account_id, 15).await.unwrap();
        tx.credit_inventory(account_id, 1, 3).await.unwrap();
        tx.complete_order("tok-stage").await.unwrap();

        assert!(store.find_order("tok-stage").await.unwrap().is_none());
        assert!(store.inventory_of(account_id).await.is_empty());

        tx.commit().await.unwrap();

        let order = store.find_order("tok-stage").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Completed);
        assert_eq!(store.stock_quantity(1, 1).await, Some(7));
        assert_eq!(store.balance(account_id).await, Some(85));
        assert_eq!(store.inventory_of(account_id).await.len(), 1);
    }

    #[tokio::test]
    async fn rollback_discards_staged_writes() {
        let store = MemStore::new();
        store.add_listing(1, 1, 5, 10).await;
        let account_id = store.add_account(1, 100).await;

        let mut tx = store.begin().await.unwrap();
        tx.lock_stock(1, 1).await.unwrap().unwrap();
        tx.lock_wallet(1).await.unwrap().unwrap();
        tx.reserve_order(&new_order("tok-abort")).await.unwrap();
        tx.debit_stock(1, 1, 3).await.unwrap();
        tx.debit_wallet(account_id, 15).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(store.find_order("tok-abort").await.unwrap().is_none());
        assert_eq!(store.stock_quantity(1, 1).await, Some(10));
        assert_eq!(store.balance(account_id).await, Some(100));
    }

    #[tokio::test]
    async fn reserve_reports_conflict_for_committed_token() {
        let store = MemStore::new();
        store.add_listing(1, 1, 5, 10).await;
        store.add_account(1, 100).await;

        let mut tx = store.begin().await.unwrap();
        tx.lock_stock(1, 1).await.unwrap().unwrap();
        assert_eq!(
            tx.reserve_order(&new_order("tok-dup")).await.unwrap(),
            ReserveOutcome::Reserved
        );
        tx.complete_order("tok-dup").await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.lock_stock(1, 1).await.unwrap().unwrap();
        assert_eq!(
            tx.reserve_order(&new_order("tok-dup")).await.unwrap(),
            ReserveOutcome::AlreadyExists
        );
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn primary_account_is_the_earliest_created() {
        let store = MemStore::new();
        let first = store.add_account(9, 50).await;
        let _second = store.add_account(9, 500).await;

        let mut tx = store.begin().await.unwrap();
        let wallet = tx.lock_wallet(9).await.unwrap().unwrap();
        assert_eq!(wallet.account_id, first);
        assert_eq!(wallet.balance, 50);
        tx.rollback().await.unwrap();
    }
}
