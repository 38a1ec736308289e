use serde::Serialize;
use thiserror::Error;

use crate::sqlite_store::{SqliteStore, StoreError};

/// Detects and repairs drift between the stored balance and the balance
/// derived from the transaction log.
///
/// Under the billing engine's atomicity discipline the two can never
/// diverge; this exists as an operator tool, not a normal code path.
#[derive(Clone, Debug)]
pub struct ConsistencyChecker {
    store: SqliteStore,
    initial_balance: i64,
}

#[derive(Debug, Error)]
pub enum ConsistencyError {
    #[error("account not found: user {user_id}")]
    AccountNotFound { user_id: i64 },
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for ConsistencyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AccountNotFound { user_id } => {
                ConsistencyError::AccountNotFound { user_id }
            }
            other => ConsistencyError::Store(other),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct ConsistencyReport {
    pub user_id: i64,
    pub consistent: bool,
    pub stored_balance: i64,
    pub derived_balance: i64,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct RepairOutcome {
    pub user_id: i64,
    pub previous_balance: i64,
    pub repaired_balance: i64,
}

impl ConsistencyChecker {
    pub fn new(store: SqliteStore, initial_balance: i64) -> Self {
        Self {
            store,
            initial_balance,
        }
    }

    /// Compares the stored balance against `initial + Σ amounts`. The sum is
    /// order-independent, so the log can be replayed in any order.
    pub async fn check(&self, user_id: i64) -> Result<ConsistencyReport, ConsistencyError> {
        let snapshot = self.store.ledger_snapshot(user_id).await?;
        let derived_balance = self.initial_balance + snapshot.transaction_sum;
        let consistent = snapshot.stored_balance == derived_balance;
        if !consistent {
            tracing::error!(
                user_id,
                stored_balance = snapshot.stored_balance,
                derived_balance,
                "ledger inconsistency detected"
            );
        }
        Ok(ConsistencyReport {
            user_id,
            consistent,
            stored_balance: snapshot.stored_balance,
            derived_balance,
        })
    }

    /// Overwrites the stored balance with the derived value. Last-resort
    /// manual operation.
    pub async fn repair(&self, user_id: i64) -> Result<RepairOutcome, ConsistencyError> {
        let (previous_balance, repaired_balance) = self
            .store
            .repair_balance(user_id, self.initial_balance)
            .await?;
        if previous_balance != repaired_balance {
            tracing::warn!(
                user_id,
                previous_balance,
                repaired_balance,
                "ledger balance repaired"
            );
        }
        Ok(RepairOutcome {
            user_id,
            previous_balance,
            repaired_balance,
        })
    }
}
