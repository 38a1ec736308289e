use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::{ChatModel, GenerateReply, GenerateRequest, GenerationError, ModelId};

/// A model served by a local or remote Ollama instance via its
/// non-streaming `/api/generate` endpoint.
#[derive(Clone)]
pub struct OllamaModel {
    id: ModelId,
    backend_model: String,
    http: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct OllamaGenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Map::is_empty")]
    options: Map<String, Value>,
}

#[derive(Deserialize)]
struct OllamaGenerateReply {
    response: String,
}

impl OllamaModel {
    pub fn new(id: ModelId, base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .expect("reqwest client build should not fail");
        let backend_model = id.as_str().to_string();

        Self {
            id,
            backend_model,
            http,
            base_url: base_url.into(),
        }
    }

    /// Overrides the name the backend knows the model by, when it differs
    /// from the identifier clients request.
    pub fn with_backend_model(mut self, backend_model: impl Into<String>) -> Self {
        self.backend_model = backend_model.into();
        self
    }

    fn generate_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        format!("{base}/api/generate")
    }
}

#[async_trait]
impl ChatModel for OllamaModel {
    fn model_id(&self) -> &ModelId {
        &self.id
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateReply, GenerationError> {
        let mut options = Map::<String, Value>::new();
        if let Some(max_tokens) = request.max_tokens {
            options.insert("num_predict".to_string(), Value::from(max_tokens));
        }
        if let Some(temperature) = request.temperature {
            options.insert("temperature".to_string(), Value::from(temperature));
        }

        let body = OllamaGenerateBody {
            model: &self.backend_model,
            prompt: &request.prompt,
            stream: false,
            options,
        };

        let started = Instant::now();
        let response = self
            .http
            .post(self.generate_url())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(GenerationError::Backend(format!(
                "ollama returned {status}: {detail}"
            )));
        }

        let reply: OllamaGenerateReply = response.json().await?;
        let latency_ms = started.elapsed().as_millis().min(u64::MAX as u128) as u64;
        Ok(GenerateReply {
            text: reply.response,
            latency_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_id(s: &str) -> ModelId {
        ModelId::parse(s).expect("model id")
    }

    #[tokio::test]
    async fn generates_against_mock_server() {
        let server = httpmock::MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST)
                    .path("/api/generate")
                    .json_body_includes(r#"{"model": "llama3", "stream": false}"#);
                then.status(200)
                    .json_body(serde_json::json!({ "response": "hello there" }));
            })
            .await;

        let model = OllamaModel::new(model_id("llama3"), server.base_url());
        let reply = model
            .generate(GenerateRequest {
                prompt: "hi".to_string(),
                max_tokens: None,
                temperature: None,
            })
            .await
            .expect("generate");

        mock.assert_async().await;
        assert_eq!(reply.text, "hello there");
    }

    #[tokio::test]
    async fn maps_backend_model_and_options() {
        let server = httpmock::MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST)
                    .path("/api/generate")
                    .json_body_includes(
                        r#"{"model": "llama3:70b-instruct", "options": {"num_predict": 64}}"#,
                    );
                then.status(200)
                    .json_body(serde_json::json!({ "response": "ok" }));
            })
            .await;

        let model = OllamaModel::new(model_id("llama3:70b"), server.base_url())
            .with_backend_model("llama3:70b-instruct");
        model
            .generate(GenerateRequest {
                prompt: "hi".to_string(),
                max_tokens: Some(64),
                temperature: None,
            })
            .await
            .expect("generate");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_success_status_is_a_backend_error() {
        let server = httpmock::MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST).path("/api/generate");
                then.status(500).body("model not loaded");
            })
            .await;

        let model = OllamaModel::new(model_id("llama3"), server.base_url());
        let err = model
            .generate(GenerateRequest {
                prompt: "hi".to_string(),
                max_tokens: None,
                temperature: None,
            })
            .await
            .expect_err("should fail");
        assert!(matches!(err, GenerationError::Backend(_)));
    }
}
