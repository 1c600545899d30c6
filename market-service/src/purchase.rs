use std::time::Duration;

use shared::{MarketError, NewOrder, OrderStatus, PurchaseReceipt, PurchaseRequest};
use tracing::{info, warn};

use crate::store::{LedgerStore, LedgerTx, ReserveOutcome};

/// Attempts per purchase before a store conflict is surfaced to the caller.
const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(25);

/// Sequences one purchase over the ledger store: duplicate check, row
/// locks in fixed order (stock, then wallet), validation, order reserve,
/// debits and inventory credit, completion, commit. All inside a single
/// store transaction; any failure aborts the whole transaction.
#[derive(Clone)]
pub struct PurchaseEngine<S> {
    store: S,
}

enum StepOutcome {
    Commit,
    DuplicateInFlight,
}

impl<S: LedgerStore> PurchaseEngine<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs one purchase to a terminal outcome.
    ///
    /// Replaying a token that already settled returns the original order
    /// with `duplicate: true` and performs no writes. Transient store
    /// conflicts are retried from a fresh transaction a bounded number of
    /// times; once a transaction is open the attempt runs to commit or
    /// abort, never partway.
    pub async fn purchase(&self, req: &PurchaseRequest) -> Result<PurchaseReceipt, MarketError> {
        if req.quantity <= 0 {
            return Err(MarketError::InvalidQuantity(req.quantity));
        }

        // Replays of a finished purchase short-circuit before any lock.
        if let Some(order) = self.store.find_order(&req.request_token).await? {
            if order.status == OrderStatus::Completed {
                info!(
                    token = %req.request_token,
                    "duplicate purchase request, returning original order"
                );
                return Ok(PurchaseReceipt {
                    order_id: order.request_token,
                    duplicate: true,
                });
            }
        }

        let mut attempt = 1;
        loop {
            match self.attempt(req).await {
                Err(MarketError::TransientConflict(reason)) if attempt < MAX_ATTEMPTS => {
                    warn!(
                        token = %req.request_token,
                        attempt,
                        %reason,
                        "store conflict, retrying purchase"
                    );
                    tokio::time::sleep(RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }

    async fn attempt(&self, req: &PurchaseRequest) -> Result<PurchaseReceipt, MarketError> {
        let mut tx = self.store.begin().await?;
        match self.run(&mut tx, req).await {
            Ok(StepOutcome::Commit) => {
                tx.commit().await?;
                Ok(PurchaseReceipt {
                    order_id: req.request_token.clone(),
                    duplicate: false,
                })
            }
            Ok(StepOutcome::DuplicateInFlight) => {
                tx.rollback().await?;
                // Re-read outside the dead transaction. The winning writer
                // may not have committed yet; the token identifies the
                // order either way.
                if self.store.find_order(&req.request_token).await?.is_none() {
                    info!(
                        token = %req.request_token,
                        "duplicate token raced a purchase that is still in flight"
                    );
                }
                Ok(PurchaseReceipt {
                    order_id: req.request_token.clone(),
                    duplicate: true,
                })
            }
            Err(err) => {
                if let Err(abort) = tx.rollback().await {
                    warn!(
                        token = %req.request_token,
                        error = %abort,
                        "rollback after failed purchase also failed"
                    );
                }
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        tx: &mut S::Tx,
        req: &PurchaseRequest,
    ) -> Result<StepOutcome, MarketError> {
        // Fixed lock order for every transaction: stock row first, wallet
        // second. Concurrent purchases can never circular-wait.
        let stock = match tx.lock_stock(req.settlement_id, req.item_id).await? {
            Some(stock) => stock,
            None => {
                return Err(MarketError::UnknownListing {
                    settlement_id: req.settlement_id,
                    item_id: req.item_id,
                })
            }
        };
        if stock.quantity_available < req.quantity {
            return Err(MarketError::InsufficientStock {
                item_id: req.item_id,
                available: stock.quantity_available,
                requested: req.quantity,
            });
        }

        let order = NewOrder::from_request(req, stock.unit_price);

        let wallet = match tx.lock_wallet(req.buyer_id).await? {
            Some(wallet) => wallet,
            None => {
                return Err(MarketError::InsufficientFunds {
                    balance: 0,
                    required: order.total_price,
                })
            }
        };
        if wallet.balance < order.total_price {
            return Err(MarketError::InsufficientFunds {
                balance: wallet.balance,
                required: order.total_price,
            });
        }

        if tx.reserve_order(&order).await? == ReserveOutcome::AlreadyExists {
            return Ok(StepOutcome::DuplicateInFlight);
        }

        tx.debit_stock(req.settlement_id, req.item_id, req.quantity)
            .await?;
        tx.debit_wallet(wallet.account_id, order.total_price).await?;
        tx.credit_inventory(wallet.account_id, req.item_id, req.quantity)
            .await?;
        tx.complete_order(&req.request_token).await?;
        Ok(StepOutcome::Commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemStore;

    #[tokio::test]
    async fn non_positive_quantity_is_rejected_before_any_lock() {
        let engine = PurchaseEngine::new(MemStore::new());
        let mut req = PurchaseRequest {
            request_token: "tok-qty".to_string(),
            buyer_id: 1,
            settlement_id: 1,
            item_id: 1,
            quantity: 0,
        };
        assert!(matches!(
            engine.purchase(&req).await,
            Err(MarketError::InvalidQuantity(0))
        ));

        req.quantity = -2;
        assert!(matches!(
            engine.purchase(&req).await,
            Err(MarketError::InvalidQuantity(-2))
        ));
        // Nothing reached the store: no order row exists.
        assert!(engine.store().orders().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_listing_is_an_input_error() {
        let store = MemStore::new();
        store.add_account(1, 100).await;
        let engine = PurchaseEngine::new(store);
        let req = PurchaseRequest {
            request_token: "tok-unknown".to_string(),
            buyer_id: 1,
            settlement_id: 1,
            item_id: 99,
            quantity: 1,
        };
        assert!(matches!(
            engine.purchase(&req).await,
            Err(MarketError::UnknownListing { item_id: 99, .. })
        ));
    }
}
