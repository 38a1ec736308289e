use std::collections::BTreeMap;

use thiserror::Error;

use crate::model::{ModelId, ModelIdError};
use crate::sqlite_store::{
    NewInteraction, SqliteStore, StoreError, TransactionKind, TransactionRecord,
};

/// Cost charged for a model that is missing from the table. An explicit
/// policy, not an error: unknown models bill at the floor rate.
pub const DEFAULT_MODEL_COST: i64 = 1;

/// The canonical model -> credit cost table. One table, no alias maps.
#[derive(Clone, Debug, Default)]
pub struct CostTable {
    costs: BTreeMap<ModelId, i64>,
}

#[derive(Debug, Error)]
pub enum CostTableError {
    #[error("invalid model id in cost table: {0}")]
    ModelId(#[from] ModelIdError),
    #[error("invalid cost for model {model}: {cost} (must be >= 1)")]
    InvalidCost { model: String, cost: i64 },
}

impl CostTable {
    pub fn from_config(raw: &BTreeMap<String, i64>) -> Result<Self, CostTableError> {
        let mut costs = BTreeMap::new();
        for (model, cost) in raw {
            let id = ModelId::parse(model)?;
            if *cost < 1 {
                return Err(CostTableError::InvalidCost {
                    model: model.clone(),
                    cost: *cost,
                });
            }
            costs.insert(id, *cost);
        }
        Ok(Self { costs })
    }

    pub fn insert(&mut self, model: ModelId, cost: i64) {
        self.costs.insert(model, cost.max(1));
    }

    pub fn cost_of(&self, model: &ModelId) -> i64 {
        self.costs.get(model).copied().unwrap_or(DEFAULT_MODEL_COST)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ModelId, i64)> {
        self.costs.iter().map(|(model, cost)| (model, *cost))
    }
}

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("account not found: user {user_id}")]
    AccountNotFound { user_id: i64 },
    #[error("amount must be positive, got {amount}")]
    InvalidAmount { amount: i64 },
    #[error("insufficient credits: balance={balance} required={required}")]
    InsufficientFunds { balance: i64, required: i64 },
    #[error("billing transaction failed: {0}")]
    Store(StoreError),
}

impl From<StoreError> for BillingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AccountNotFound { user_id } => BillingError::AccountNotFound { user_id },
            StoreError::InsufficientFunds { balance, required } => {
                BillingError::InsufficientFunds { balance, required }
            }
            other => BillingError::Store(other),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FundsCheck {
    pub sufficient: bool,
    pub balance: i64,
    pub required: i64,
}

#[derive(Clone, Copy, Debug, Default, serde::Serialize)]
pub struct BulkAddOutcome {
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Clone, Copy, Debug, serde::Serialize)]
pub struct TransactionSummary {
    pub total_transactions: u64,
    pub total_charged: i64,
    pub total_added: i64,
    pub total_refunded: i64,
    /// Refunds reduce lifetime spend; plain adds do not.
    pub net_spent: i64,
    pub balance: i64,
}

/// Result of the atomic charge + interaction-record pair.
#[derive(Clone, Copy, Debug)]
pub struct ChargedInteraction {
    pub interaction_id: i64,
    pub credits_charged: i64,
    pub remaining_balance: i64,
}

/// The only component allowed to mutate balances. Enforces the positive
/// amount policy and the non-negative balance policy, and always writes the
/// balance mutation and its transaction row in one store transaction.
#[derive(Clone, Debug)]
pub struct BillingEngine {
    store: SqliteStore,
    costs: CostTable,
}

impl BillingEngine {
    pub fn new(store: SqliteStore, costs: CostTable) -> Self {
        Self { store, costs }
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    /// Debits `amount` and appends the matching `charge` row (amount is
    /// stored negated). Rejected entirely when the balance is short.
    pub async fn charge(
        &self,
        user_id: i64,
        amount: i64,
        description: &str,
    ) -> Result<i64, BillingError> {
        if amount <= 0 {
            return Err(BillingError::InvalidAmount { amount });
        }
        let balance = self.store.charge(user_id, amount, description).await?;
        tracing::info!(user_id, amount, balance, "credits charged");
        Ok(balance)
    }

    /// Charge plus interaction record, both-or-neither. Used by the chat
    /// flow after a successful generation.
    pub async fn charge_for_interaction(
        &self,
        user_id: i64,
        amount: i64,
        description: &str,
        interaction: NewInteraction,
    ) -> Result<ChargedInteraction, BillingError> {
        if amount <= 0 {
            return Err(BillingError::InvalidAmount { amount });
        }
        let (remaining_balance, interaction_id) = self
            .store
            .charge_with_interaction(user_id, amount, description, interaction)
            .await?;
        tracing::info!(
            user_id,
            amount,
            remaining_balance,
            interaction_id,
            "credits charged for interaction"
        );
        Ok(ChargedInteraction {
            interaction_id,
            credits_charged: amount,
            remaining_balance,
        })
    }

    pub async fn add(
        &self,
        user_id: i64,
        amount: i64,
        description: &str,
    ) -> Result<i64, BillingError> {
        self.credit(user_id, amount, TransactionKind::Add, description)
            .await
    }

    /// Same balance math as `add`; kept distinct in the log for reporting.
    pub async fn refund(
        &self,
        user_id: i64,
        amount: i64,
        description: &str,
    ) -> Result<i64, BillingError> {
        self.credit(user_id, amount, TransactionKind::Refund, description)
            .await
    }

    async fn credit(
        &self,
        user_id: i64,
        amount: i64,
        kind: TransactionKind,
        description: &str,
    ) -> Result<i64, BillingError> {
        if amount <= 0 {
            return Err(BillingError::InvalidAmount { amount });
        }
        let balance = self.store.credit(user_id, amount, kind, description).await?;
        tracing::info!(user_id, amount, balance, kind = kind.as_str(), "credits credited");
        Ok(balance)
    }

    /// Advisory read-only check. The later `charge` call remains the
    /// authority; two requests may both pass here and only one win the
    /// conditional debit.
    pub async fn check_sufficient(
        &self,
        user_id: i64,
        required: i64,
    ) -> Result<FundsCheck, BillingError> {
        let balance = self
            .store
            .get_balance(user_id)
            .await?
            .ok_or(BillingError::AccountNotFound { user_id })?;
        Ok(FundsCheck {
            sufficient: balance >= required,
            balance,
            required,
        })
    }

    pub async fn balance(&self, user_id: i64) -> Result<i64, BillingError> {
        let balance = self
            .store
            .get_balance(user_id)
            .await?
            .ok_or(BillingError::AccountNotFound { user_id })?;
        Ok(balance)
    }

    pub fn model_cost(&self, model: &ModelId) -> i64 {
        self.costs.cost_of(model)
    }

    pub fn cost_table(&self) -> &CostTable {
        &self.costs
    }

    /// Applies `add` independently per entry; one bad entry never aborts the
    /// rest.
    pub async fn bulk_add(&self, grants: &[(i64, i64)]) -> BulkAddOutcome {
        let mut outcome = BulkAddOutcome::default();
        for (user_id, amount) in grants {
            match self.add(*user_id, *amount, "bulk credit addition").await {
                Ok(_) => outcome.succeeded += 1,
                Err(err) => {
                    tracing::warn!(user_id, amount, %err, "bulk add entry failed");
                    outcome.failed += 1;
                }
            }
        }
        tracing::info!(
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            "bulk add completed"
        );
        outcome
    }

    pub async fn transactions(
        &self,
        user_id: i64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>, BillingError> {
        Ok(self.store.list_transactions(user_id, offset, limit).await?)
    }

    pub async fn summary(&self, user_id: i64) -> Result<TransactionSummary, BillingError> {
        let balance = self.balance(user_id).await?;
        let totals = self.store.transaction_totals(user_id).await?;
        Ok(TransactionSummary {
            total_transactions: totals.count,
            total_charged: totals.charged,
            total_added: totals.added,
            total_refunded: totals.refunded,
            net_spent: totals.charged - totals.refunded,
            balance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CostTable {
        let mut raw = BTreeMap::new();
        raw.insert("gemma3-1b".to_string(), 1);
        raw.insert("gemma3-4b".to_string(), 3);
        CostTable::from_config(&raw).expect("cost table")
    }

    #[test]
    fn cost_lookup_is_stable_and_defaults_to_one() {
        let table = table();
        let known = ModelId::parse("gemma3-4b").expect("id");
        let unknown = ModelId::parse("mystery-model").expect("id");

        for _ in 0..3 {
            assert_eq!(table.cost_of(&known), 3);
            assert_eq!(table.cost_of(&unknown), DEFAULT_MODEL_COST);
        }
    }

    #[test]
    fn cost_table_rejects_non_positive_costs() {
        let mut raw = BTreeMap::new();
        raw.insert("free-model".to_string(), 0);
        assert!(matches!(
            CostTable::from_config(&raw),
            Err(CostTableError::InvalidCost { .. })
        ));
    }

    #[test]
    fn cost_table_rejects_unparseable_ids() {
        let mut raw = BTreeMap::new();
        raw.insert("not a model".to_string(), 2);
        assert!(matches!(
            CostTable::from_config(&raw),
            Err(CostTableError::ModelId(_))
        ));
    }

    async fn engine_with_user(dir: &tempfile::TempDir, balance: i64) -> (BillingEngine, i64) {
        let store = SqliteStore::new(dir.path().join("billing.sqlite"));
        store.init().await.expect("init");
        let user = store
            .create_user("alice", "alice@example.com", "hash", "salt", balance)
            .await
            .expect("user");
        (BillingEngine::new(store, table()), user.id)
    }

    #[tokio::test]
    async fn charge_add_refund_scenario() {
        // Account starts at 100: charge 30, add 50, refund 10 -> 130.
        let dir = tempfile::tempdir().expect("tempdir");
        let (engine, user_id) = engine_with_user(&dir, 100).await;

        assert_eq!(engine.charge(user_id, 30, "charge").await.expect("charge"), 70);
        assert_eq!(engine.add(user_id, 50, "add").await.expect("add"), 120);
        assert_eq!(engine.refund(user_id, 10, "refund").await.expect("refund"), 130);

        let log = engine.transactions(user_id, 0, 10).await.expect("log");
        assert_eq!(log.len(), 3);
        assert_eq!(log[2].amount, -30);
        assert_eq!(log[1].amount, 50);
        assert_eq!(log[0].amount, 10);
    }

    #[tokio::test]
    async fn charge_beyond_balance_is_rejected_whole() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (engine, user_id) = engine_with_user(&dir, 1).await;

        let err = engine.charge(user_id, 3, "too much").await;
        assert!(matches!(
            err,
            Err(BillingError::InsufficientFunds {
                balance: 1,
                required: 3
            })
        ));
        assert_eq!(engine.balance(user_id).await.expect("balance"), 1);
        assert!(engine.transactions(user_id, 0, 10).await.expect("log").is_empty());
    }

    #[tokio::test]
    async fn non_positive_amounts_are_invalid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (engine, user_id) = engine_with_user(&dir, 100).await;

        for amount in [0, -5] {
            assert!(matches!(
                engine.add(user_id, amount, "bad").await,
                Err(BillingError::InvalidAmount { .. })
            ));
            assert!(matches!(
                engine.refund(user_id, amount, "bad").await,
                Err(BillingError::InvalidAmount { .. })
            ));
            assert!(matches!(
                engine.charge(user_id, amount, "bad").await,
                Err(BillingError::InvalidAmount { .. })
            ));
        }
        assert_eq!(engine.balance(user_id).await.expect("balance"), 100);
    }

    #[tokio::test]
    async fn check_sufficient_is_read_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (engine, user_id) = engine_with_user(&dir, 5).await;

        let check = engine.check_sufficient(user_id, 3).await.expect("check");
        assert!(check.sufficient);
        let check = engine.check_sufficient(user_id, 9).await.expect("check");
        assert!(!check.sufficient);
        assert_eq!(check.balance, 5);

        assert_eq!(engine.balance(user_id).await.expect("balance"), 5);
        assert!(engine.transactions(user_id, 0, 10).await.expect("log").is_empty());
    }

    #[tokio::test]
    async fn bulk_add_is_independent_per_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("billing.sqlite"));
        store.init().await.expect("init");
        let u1 = store
            .create_user("u1", "u1@example.com", "h", "s", 10)
            .await
            .expect("u1")
            .id;
        let u2 = store
            .create_user("u2", "u2@example.com", "h", "s", 20)
            .await
            .expect("u2")
            .id;
        let engine = BillingEngine::new(store, table());

        let outcome = engine.bulk_add(&[(u1, 50), (u2, 75), (9999, 100)]).await;
        assert_eq!(outcome.succeeded, 2);
        assert_eq!(outcome.failed, 1);
        assert_eq!(engine.balance(u1).await.expect("u1"), 60);
        assert_eq!(engine.balance(u2).await.expect("u2"), 95);
    }

    #[tokio::test]
    async fn summary_separates_refunds_from_adds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (engine, user_id) = engine_with_user(&dir, 100).await;

        engine.charge(user_id, 30, "charge").await.expect("charge");
        engine.add(user_id, 50, "add").await.expect("add");
        engine.refund(user_id, 10, "refund").await.expect("refund");

        let summary = engine.summary(user_id).await.expect("summary");
        assert_eq!(summary.total_transactions, 3);
        assert_eq!(summary.total_charged, 30);
        assert_eq!(summary.total_added, 50);
        assert_eq!(summary.total_refunded, 10);
        assert_eq!(summary.net_spent, 20);
        assert_eq!(summary.balance, 130);
    }
}
