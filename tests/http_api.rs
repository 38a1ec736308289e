use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::util::ServiceExt;

use tallygate::{
    AppState, AuthService, BillingEngine, ChatModel, ChatService, ConsistencyChecker, CostTable,
    GenerateReply, GenerateRequest, GenerationError, GuardrailsConfig, ModelId, SqliteStore,
    router,
};

struct CannedModel {
    id: ModelId,
}

#[async_trait]
impl ChatModel for CannedModel {
    fn model_id(&self) -> &ModelId {
        &self.id
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateReply, GenerationError> {
        Ok(GenerateReply {
            text: format!("echo: {}", request.prompt),
            latency_ms: 4,
        })
    }
}

fn model_id(s: &str) -> ModelId {
    ModelId::parse(s).expect("model id")
}

fn build_app(dir: &tempfile::TempDir, admin_token: Option<&str>) -> Router {
    let store = SqliteStore::new(dir.path().join("api.sqlite"));

    let mut raw_costs = std::collections::BTreeMap::new();
    raw_costs.insert("small".to_string(), 1);
    raw_costs.insert("large".to_string(), 3);
    let costs = CostTable::from_config(&raw_costs).expect("cost table");

    let billing = BillingEngine::new(store.clone(), costs);
    let auth = AuthService::new(
        store.clone(),
        "test-secret",
        Duration::from_secs(3600),
        100,
    );
    let consistency = ConsistencyChecker::new(store.clone(), 100);
    let mut chat = ChatService::new(
        billing.clone(),
        GuardrailsConfig::default(),
        Duration::from_secs(5),
    );
    chat.register_model(Arc::new(CannedModel {
        id: model_id("small"),
    }));
    chat.register_model(Arc::new(CannedModel {
        id: model_id("large"),
    }));

    let mut state = AppState::new(
        Arc::new(auth),
        Arc::new(billing),
        Arc::new(chat),
        Arc::new(consistency),
    );
    if let Some(token) = admin_token {
        state = state.with_admin_token(token);
    }
    router(state)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("request");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

fn post_json(uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).expect("request")
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).expect("request")
}

async fn register_and_login(app: &Router, username: &str) -> (i64, String) {
    let (status, body) = send(
        app,
        post_json(
            "/v1/register",
            None,
            json!({
                "username": username,
                "email": format!("{username}@example.com"),
                "password": "Passw0rd"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let user_id = body["user_id"].as_i64().expect("user_id");

    let (status, body) = send(
        app,
        post_json(
            "/v1/login",
            None,
            json!({ "username": username, "password": "Passw0rd" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let token = body["token"].as_str().expect("token").to_string();
    (user_id, token)
}

#[tokio::test]
async fn register_login_chat_and_inspect() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = build_app(&dir, None);
    let (_user_id, token) = register_and_login(&app, "alice").await;

    let (status, body) = send(&app, get("/v1/balance", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance"], json!(100));

    let (status, body) = send(
        &app,
        post_json(
            "/v1/chat",
            Some(&token),
            json!({ "message": "hello", "model": "large" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"], json!("echo: hello"));
    assert_eq!(body["model_used"], json!("large"));
    assert_eq!(body["credits_charged"], json!(3));
    assert_eq!(body["remaining_balance"], json!(97));
    assert_eq!(body["used_fallback"], json!(false));

    let (status, body) = send(&app, get("/v1/history", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["interactions"].as_array().map(Vec::len), Some(1));
    assert_eq!(body["interactions"][0]["model"], json!("large"));

    let (status, body) = send(&app, get("/v1/transactions", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["transactions"][0]["amount"], json!(-3));
    assert_eq!(body["transactions"][0]["kind"], json!("charge"));

    let (status, body) = send(&app, get("/v1/transactions/summary", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_charged"], json!(3));
    assert_eq!(body["net_spent"], json!(3));
    assert_eq!(body["balance"], json!(97));

    let (status, body) = send(&app, get("/v1/models", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["models"][0]["id"], json!("small"));
    assert_eq!(body["models"][0]["affordable"], json!(true));

    let (status, body) = send(&app, get("/v1/models/large/cost", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cost"], json!(3));
}

#[tokio::test]
async fn insufficient_credits_maps_to_payment_required() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = build_app(&dir, None);
    let (_user_id, token) = register_and_login(&app, "alice").await;

    // Burn the balance down to 0 with a manual charge, then chat.
    let (status, _) = send(
        &app,
        post_json("/v1/credits/charge", Some(&token), json!({ "amount": 100 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        post_json(
            "/v1/chat",
            Some(&token),
            json!({ "message": "hello", "model": "small" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"]["code"], json!("insufficient_credits"));
}

#[tokio::test]
async fn credit_mutations_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = build_app(&dir, None);
    let (_user_id, token) = register_and_login(&app, "alice").await;

    let (status, body) = send(
        &app,
        post_json("/v1/credits/add", Some(&token), json!({ "amount": 50 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance"], json!(150));

    let (status, body) = send(
        &app,
        post_json("/v1/credits/charge", Some(&token), json!({ "amount": 30 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance"], json!(120));

    let (status, body) = send(
        &app,
        post_json("/v1/credits/refund", Some(&token), json!({ "amount": 10 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance"], json!(130));

    let (status, body) = send(
        &app,
        post_json("/v1/credits/add", Some(&token), json!({ "amount": -5 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], json!("invalid_amount"));
}

#[tokio::test]
async fn authentication_is_required_and_revocable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = build_app(&dir, None);

    let (status, body) = send(&app, get("/v1/balance", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], json!("unauthorized"));

    let (status, _) = send(&app, get("/v1/balance", Some("not-a-token"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (_user_id, token) = register_and_login(&app, "alice").await;
    let (status, body) = send(&app, post_json("/v1/logout", Some(&token), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["logged_out"], json!(true));

    let (status, _) = send(&app, get("/v1/balance", Some(&token))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn duplicate_registration_conflicts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = build_app(&dir, None);
    register_and_login(&app, "alice").await;

    let (status, body) = send(
        &app,
        post_json(
            "/v1/register",
            None,
            json!({
                "username": "alice",
                "email": "other@example.com",
                "password": "Passw0rd"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], json!("already_registered"));
}

#[tokio::test]
async fn admin_endpoints_require_the_admin_token() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = build_app(&dir, Some("admin-secret"));
    let (user_id, token) = register_and_login(&app, "alice").await;

    let uri = format!("/admin/consistency/{user_id}");
    let (status, _) = send(&app, get(&uri, Some(&token))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(&app, get(&uri, Some("admin-secret"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["consistent"], json!(true));
    assert_eq!(body["stored_balance"], json!(100));

    let (status, body) = send(
        &app,
        post_json(
            "/admin/credits/bulk_add",
            Some("admin-secret"),
            json!({ "grants": [
                { "user_id": user_id, "amount": 10 },
                { "user_id": 9999, "amount": 10 }
            ]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["succeeded"], json!(1));
    assert_eq!(body["failed"], json!(1));

    let uri = format!("/admin/transactions/{user_id}");
    let (status, body) = send(&app, get(&uri, Some("admin-secret"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["transactions"][0]["kind"], json!("add"));
}

#[tokio::test]
async fn admin_routes_absent_without_a_token() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = build_app(&dir, None);

    let (status, _) = send(&app, get("/admin/consistency/1", Some("anything"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn admin_repair_restores_a_drifted_balance() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::new(dir.path().join("api.sqlite"));
    let app = build_app(&dir, Some("admin-secret"));
    let (user_id, token) = register_and_login(&app, "alice").await;

    let (status, _) = send(
        &app,
        post_json("/v1/credits/charge", Some(&token), json!({ "amount": 30 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Corrupt the stored balance directly, bypassing the billing engine.
    store.set_balance(user_id, 5).await.expect("set balance");

    let uri = format!("/admin/consistency/{user_id}");
    let (status, body) = send(&app, get(&uri, Some("admin-secret"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["consistent"], json!(false));
    assert_eq!(body["stored_balance"], json!(5));
    assert_eq!(body["derived_balance"], json!(70));

    let uri = format!("/admin/consistency/{user_id}/repair");
    let (status, body) = send(&app, post_json(&uri, Some("admin-secret"), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["previous_balance"], json!(5));
    assert_eq!(body["repaired_balance"], json!(70));

    let (status, body) = send(&app, get("/v1/balance", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance"], json!(70));
}

#[tokio::test]
async fn health_is_open() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = build_app(&dir, None);

    let (status, body) = send(&app, get("/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("ok"));
}
