use async_trait::async_trait;
use shared::{NewOrder, Order, StockEntry, StoreError, WalletAccount};

/// Outcome of inserting the pending order row for an idempotency token.
///
/// `AlreadyExists` is not an error: it means another writer settled (or is
/// settling) the same token, and the caller should abort its transaction
/// and report the existing order as a duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved,
    AlreadyExists,
}

/// The transactional store the purchase engine coordinates over.
///
/// Implementations must provide row-level exclusive locking scoped to one
/// transaction and atomic multi-write commit/rollback. The engine holds no
/// persistent state of its own.
#[async_trait]
pub trait LedgerStore: Clone + Send + Sync + 'static {
    type Tx: LedgerTx;

    /// Idempotency lookup. Called before any row lock is taken, and again
    /// after a reserve conflict to fetch the winning order.
    async fn find_order(&self, token: &str) -> Result<Option<Order>, StoreError>;

    /// Current listings for one settlement. Plain committed read, no locks.
    async fn list_stock(&self, settlement_id: i64) -> Result<Vec<StockEntry>, StoreError>;

    /// Opens one atomic transaction.
    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}

/// One open transaction. Every method operates inside it; nothing becomes
/// visible to other transactions until `commit`.
///
/// Lock acquisition order is fixed for every transaction: `lock_stock`
/// before `lock_wallet`. No other code path may write these rows.
#[async_trait]
pub trait LedgerTx: Send {
    /// Takes an exclusive, transaction-scoped lock on the (settlement,
    /// item) stock row and returns its snapshot, or `None` if no such
    /// listing exists.
    async fn lock_stock(
        &mut self,
        settlement_id: i64,
        item_id: i64,
    ) -> Result<Option<StockEntry>, StoreError>;

    /// Locks the buyer's primary wallet account (the earliest-created one)
    /// and returns its snapshot, or `None` if the buyer has no account.
    async fn lock_wallet(&mut self, buyer_id: i64) -> Result<Option<WalletAccount>, StoreError>;

    /// Writes the order row as pending. A concurrent insert of the same
    /// token reports `AlreadyExists` rather than failing.
    async fn reserve_order(&mut self, order: &NewOrder) -> Result<ReserveOutcome, StoreError>;

    /// Subtracts from the locked stock row. The caller has already checked
    /// availability against the locked snapshot; the store only backstops
    /// the non-negativity invariant.
    async fn debit_stock(
        &mut self,
        settlement_id: i64,
        item_id: i64,
        quantity: i32,
    ) -> Result<(), StoreError>;

    /// Subtracts from the locked wallet account.
    async fn debit_wallet(&mut self, account_id: i64, amount: i64) -> Result<(), StoreError>;

    /// Appends one inventory record at full durability. Cannot fail on
    /// business grounds; preconditions were validated under the locks.
    async fn credit_inventory(
        &mut self,
        owner_id: i64,
        item_id: i64,
        quantity: i32,
    ) -> Result<(), StoreError>;

    /// Flips the reserved order to completed.
    async fn complete_order(&mut self, token: &str) -> Result<(), StoreError>;

    /// Atomically publishes every write in this transaction.
    async fn commit(self) -> Result<(), StoreError>;

    /// Discards every write and releases all row locks.
    async fn rollback(self) -> Result<(), StoreError>;
}
