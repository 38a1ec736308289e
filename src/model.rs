use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

/// Canonical model identifier.
///
/// Identifiers are taken as written: no case folding, no alias maps. A
/// spelling that does not parse is rejected at the boundary instead of being
/// silently normalized.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(String);

pub const MODEL_ID_MAX_LEN: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelIdError {
    #[error("model id must not be empty")]
    Empty,
    #[error("model id exceeds {MODEL_ID_MAX_LEN} characters")]
    TooLong,
    #[error("model id contains invalid character {0:?}")]
    InvalidCharacter(char),
}

impl ModelId {
    pub fn parse(raw: &str) -> Result<Self, ModelIdError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ModelIdError::Empty);
        }
        if raw.len() > MODEL_ID_MAX_LEN {
            return Err(ModelIdError::TooLong);
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '-' | '_' | '.' | ':' | '/'))
        {
            return Err(ModelIdError::InvalidCharacter(bad));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl serde::Serialize for ModelId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for ModelId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug)]
pub struct GenerateRequest {
    pub prompt: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[derive(Clone, Debug)]
pub struct GenerateReply {
    pub text: String,
    pub latency_ms: u64,
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("model backend unavailable: {0}")]
    Unavailable(String),
    #[error("model backend error: {0}")]
    Backend(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Text-generation capability. Backends are opaque to the billing core; a
/// failure here must never produce a charge.
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_id(&self) -> &ModelId;

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateReply, GenerationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_id_accepts_common_spellings() {
        for raw in ["gemma3-1b", "llama3.1:8b", "org/model_v2"] {
            let id = ModelId::parse(raw).expect(raw);
            assert_eq!(id.as_str(), raw);
        }
    }

    #[test]
    fn model_id_trims_but_never_case_folds() {
        let id = ModelId::parse("  Gemma3-1B ").expect("parse");
        assert_eq!(id.as_str(), "Gemma3-1B");
    }

    #[test]
    fn model_id_rejects_bad_input() {
        assert_eq!(ModelId::parse(""), Err(ModelIdError::Empty));
        assert_eq!(ModelId::parse("   "), Err(ModelIdError::Empty));
        assert_eq!(
            ModelId::parse("model name"),
            Err(ModelIdError::InvalidCharacter(' '))
        );
        assert_eq!(
            ModelId::parse(&"x".repeat(MODEL_ID_MAX_LEN + 1)),
            Err(ModelIdError::TooLong)
        );
    }
}
