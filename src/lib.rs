pub mod auth;
pub mod billing;
pub mod chat;
pub mod config;
pub mod consistency;
pub mod guardrails;
pub mod http;
pub mod model;
pub mod providers;
pub mod sqlite_store;

pub use auth::{AuthError, AuthService};
pub use billing::{
    BillingEngine, BillingError, BulkAddOutcome, ChargedInteraction, CostTable, CostTableError,
    DEFAULT_MODEL_COST, FundsCheck, TransactionSummary,
};
pub use chat::{ChatError, ChatReply, ChatRequest, ChatService, ModelCatalogEntry};
pub use config::{
    AuthConfig, BillingConfig, ConfigError, GenerationConfig, ModelConfig, ServiceConfig,
};
pub use consistency::{ConsistencyChecker, ConsistencyError, ConsistencyReport, RepairOutcome};
pub use guardrails::GuardrailsConfig;
pub use http::{AppState, router};
pub use model::{
    ChatModel, GenerateReply, GenerateRequest, GenerationError, ModelId, ModelIdError,
};
pub use providers::OllamaModel;
pub use sqlite_store::{
    InteractionRecord, LedgerSnapshot, NewInteraction, SqliteStore, StoreError, TransactionKind,
    TransactionRecord, UserRecord,
};
