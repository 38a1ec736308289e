use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use tallygate::{
    AppState, AuthService, BillingEngine, ChatService, ConsistencyChecker, CostTable, ModelId,
    OllamaModel, ServiceConfig, SqliteStore, router,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let path = args
        .next()
        .ok_or("usage: tallygate <config.toml> [--listen HOST:PORT] [--sqlite PATH] [--admin-token TOKEN]")?;

    let mut config = ServiceConfig::load(&path)?;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--addr" => {
                config.listen = args.next().ok_or("missing value for --listen/--addr")?;
            }
            "--sqlite" => {
                config.sqlite_path = args.next().ok_or("missing value for --sqlite")?.into();
            }
            "--admin-token" => {
                config.admin_token = Some(args.next().ok_or("missing value for --admin-token")?);
            }
            other => return Err(format!("unknown arg: {other}").into()),
        }
    }

    config.guardrails.validate()?;

    let store = SqliteStore::new(&config.sqlite_path);
    store.init().await?;

    let costs = CostTable::from_config(&config.billing.model_costs)?;
    let billing = Arc::new(BillingEngine::new(store.clone(), costs));
    let auth = Arc::new(AuthService::new(
        store.clone(),
        config.auth.jwt_secret.clone(),
        Duration::from_secs(config.auth.token_ttl_secs),
        config.billing.initial_credits,
    ));
    let consistency = Arc::new(ConsistencyChecker::new(
        store.clone(),
        config.billing.initial_credits,
    ));

    let mut chat = ChatService::new(
        billing.as_ref().clone(),
        config.guardrails.clone(),
        Duration::from_secs(config.generation.timeout_secs),
    );
    for model in &config.models {
        let id = ModelId::parse(&model.id)?;
        let mut backend = OllamaModel::new(id.clone(), model.base_url.clone());
        if let Some(name) = model.backend_model.as_deref() {
            backend = backend.with_backend_model(name);
        }
        chat.register_model(Arc::new(backend));
        tracing::info!(model = %id, base_url = %model.base_url, "model registered");
    }
    let chat = Arc::new(chat);

    {
        let auth = auth.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(300));
            loop {
                ticker.tick().await;
                if let Err(err) = auth.cleanup_expired_sessions().await {
                    tracing::warn!(%err, "session cleanup failed");
                }
            }
        });
    }

    let mut state = AppState::new(auth, billing, chat, consistency);
    if let Some(token) = config.admin_token.clone() {
        state = state.with_admin_token(token);
    }

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!(listen = %config.listen, "tallygate listening");
    axum::serve(listener, app).await?;
    Ok(())
}
