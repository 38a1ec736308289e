use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::billing::{BillingEngine, BillingError};
use crate::guardrails::GuardrailsConfig;
use crate::model::{ChatModel, GenerateRequest, GenerationError, ModelId, ModelIdError};
use crate::sqlite_store::{InteractionRecord, NewInteraction, SqliteStore, StoreError};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("invalid message: {reason}")]
    InvalidMessage { reason: String },
    #[error("unknown model: {model}")]
    UnknownModel { model: String },
    #[error("invalid model id: {0}")]
    ModelId(#[from] ModelIdError),
    #[error("insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits { balance: i64, required: i64 },
    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),
    #[error("billing failed: {0}")]
    Billing(BillingError),
    #[error("account not found: user {user_id}")]
    AccountNotFound { user_id: i64 },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    pub model: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChatReply {
    pub response: String,
    pub model_used: ModelId,
    pub credits_charged: i64,
    pub remaining_balance: i64,
    pub processing_time_ms: u64,
    pub interaction_id: i64,
    pub used_fallback: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct ModelCatalogEntry {
    pub id: ModelId,
    pub cost: i64,
    pub affordable: bool,
}

/// Drives a full gated exchange: validate the message, resolve the model,
/// verify funds (falling back to a cheaper model at most once), invoke the
/// backend under a timeout, then charge and record in one step. Nothing is
/// written unless generation succeeded.
pub struct ChatService {
    billing: BillingEngine,
    store: SqliteStore,
    guardrails: GuardrailsConfig,
    models: HashMap<ModelId, Arc<dyn ChatModel>>,
    generation_timeout: Duration,
}

impl ChatService {
    pub fn new(
        billing: BillingEngine,
        guardrails: GuardrailsConfig,
        generation_timeout: Duration,
    ) -> Self {
        let store = billing.store().clone();
        Self {
            billing,
            store,
            guardrails,
            models: HashMap::new(),
            generation_timeout,
        }
    }

    pub fn register_model(&mut self, model: Arc<dyn ChatModel>) {
        self.models.insert(model.model_id().clone(), model);
    }

    pub fn has_model(&self, id: &ModelId) -> bool {
        self.models.contains_key(id)
    }

    pub async fn send_message(
        &self,
        user_id: i64,
        request: ChatRequest,
    ) -> Result<ChatReply, ChatError> {
        if let Some(reason) = self.guardrails.check_message(&request.message) {
            return Err(ChatError::InvalidMessage { reason });
        }

        let requested = ModelId::parse(&request.model)?;
        if !self.models.contains_key(&requested) {
            return Err(ChatError::UnknownModel {
                model: requested.as_str().to_string(),
            });
        }

        let cost = self.billing.model_cost(&requested);
        let funds = self
            .billing
            .check_sufficient(user_id, cost)
            .await
            .map_err(map_billing)?;

        let (model_id, cost, used_fallback) = if funds.sufficient {
            (requested, cost, false)
        } else {
            // One attempt at the cheapest strictly-different model the
            // balance still covers; never a fallback of a fallback.
            match self.cheapest_affordable(&requested, funds.balance) {
                Some((fallback, fallback_cost)) => {
                    tracing::info!(
                        user_id,
                        requested = %requested,
                        fallback = %fallback,
                        fallback_cost,
                        "falling back to cheaper model"
                    );
                    (fallback, fallback_cost, true)
                }
                None => {
                    return Err(ChatError::InsufficientCredits {
                        balance: funds.balance,
                        required: cost,
                    });
                }
            }
        };

        let model = self
            .models
            .get(&model_id)
            .ok_or_else(|| ChatError::UnknownModel {
                model: model_id.as_str().to_string(),
            })?;

        let generate = model.generate(GenerateRequest {
            prompt: request.message.clone(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        });
        let reply = match tokio::time::timeout(self.generation_timeout, generate).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ChatError::Generation(GenerationError::Timeout {
                    timeout_ms: self.generation_timeout.as_millis().min(u64::MAX as u128) as u64,
                }));
            }
        };

        let charged = self
            .billing
            .charge_for_interaction(
                user_id,
                cost,
                &format!("chat with {model_id}"),
                NewInteraction {
                    model: model_id.as_str().to_string(),
                    prompt: request.message,
                    response: reply.text.clone(),
                    processing_time_ms: reply.latency_ms,
                },
            )
            .await
            .map_err(map_billing)?;

        tracing::info!(
            user_id,
            model = %model_id,
            credits_charged = charged.credits_charged,
            remaining_balance = charged.remaining_balance,
            used_fallback,
            "chat exchange completed"
        );

        Ok(ChatReply {
            response: reply.text,
            model_used: model_id,
            credits_charged: charged.credits_charged,
            remaining_balance: charged.remaining_balance,
            processing_time_ms: reply.latency_ms,
            interaction_id: charged.interaction_id,
            used_fallback,
        })
    }

    /// Registered models with their cost and whether `balance` covers each.
    pub fn model_catalog(&self, balance: i64) -> Vec<ModelCatalogEntry> {
        let mut entries: Vec<ModelCatalogEntry> = self
            .models
            .keys()
            .map(|id| {
                let cost = self.billing.model_cost(id);
                ModelCatalogEntry {
                    id: id.clone(),
                    cost,
                    affordable: cost <= balance,
                }
            })
            .collect();
        entries.sort_by(|a, b| (a.cost, a.id.as_str()).cmp(&(b.cost, b.id.as_str())));
        entries
    }

    pub fn model_cost(&self, id: &ModelId) -> Option<i64> {
        self.models
            .contains_key(id)
            .then(|| self.billing.model_cost(id))
    }

    pub async fn history(
        &self,
        user_id: i64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<InteractionRecord>, ChatError> {
        Ok(self.store.list_interactions(user_id, offset, limit).await?)
    }

    fn cheapest_affordable(&self, requested: &ModelId, balance: i64) -> Option<(ModelId, i64)> {
        self.models
            .keys()
            .filter(|id| *id != requested)
            .map(|id| (id.clone(), self.billing.model_cost(id)))
            .filter(|(_, cost)| *cost <= balance)
            .min_by(|a, b| (a.1, a.0.as_str()).cmp(&(b.1, b.0.as_str())))
    }
}

fn map_billing(err: BillingError) -> ChatError {
    match err {
        BillingError::InsufficientFunds { balance, required } => {
            ChatError::InsufficientCredits { balance, required }
        }
        BillingError::AccountNotFound { user_id } => ChatError::AccountNotFound { user_id },
        other => ChatError::Billing(other),
    }
}
