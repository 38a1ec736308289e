use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::sqlite_store::{SqliteStore, StoreError, UserRecord};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid username: {reason}")]
    InvalidUsername { reason: &'static str },
    #[error("invalid email address")]
    InvalidEmail,
    #[error("weak password: {reason}")]
    WeakPassword { reason: &'static str },
    #[error("username or email already registered")]
    AlreadyRegistered,
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("random generator unavailable")]
    Rng,
    #[error("token error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UserExists => AuthError::AlreadyRegistered,
            other => AuthError::Store(other),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
    iat: i64,
}

/// Registration, login, and token resolution. Tokens are JWTs whose SHA-256
/// hash is also stored as a revocable session row; logout deletes the row,
/// which invalidates the token before its expiry.
pub struct AuthService {
    store: SqliteStore,
    jwt_secret: String,
    token_ttl: Duration,
    initial_credits: i64,
}

impl AuthService {
    pub fn new(
        store: SqliteStore,
        jwt_secret: impl Into<String>,
        token_ttl: Duration,
        initial_credits: i64,
    ) -> Self {
        Self {
            store,
            jwt_secret: jwt_secret.into(),
            token_ttl,
            initial_credits,
        }
    }

    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<UserRecord, AuthError> {
        validate_username(username)?;
        validate_email(email)?;
        validate_password_strength(password)?;

        let salt = generate_salt()?;
        let password_hash = hash_password(password, &salt);
        let user = self
            .store
            .create_user(username, email, &password_hash, &salt, self.initial_credits)
            .await?;
        tracing::info!(user_id = user.id, username, "user registered");
        Ok(user)
    }

    /// Verifies the password and mints a session token.
    pub async fn login(&self, username: &str, password: &str) -> Result<(String, UserRecord), AuthError> {
        let Some(user) = self.store.user_by_username(username).await? else {
            tracing::info!(username, "login failed: unknown user");
            return Err(AuthError::InvalidCredentials);
        };

        if hash_password(password, &user.salt) != user.password_hash {
            tracing::info!(user_id = user.id, "login failed: bad password");
            return Err(AuthError::InvalidCredentials);
        }

        let token = self.mint_token(user.id)?;
        let expires_at_ms = (now_millis() as u64)
            .saturating_add(self.token_ttl.as_millis().min(u64::MAX as u128) as u64);
        self.store
            .insert_session(&token_hash(&token), user.id, expires_at_ms)
            .await?;
        tracing::info!(user_id = user.id, "session created");
        Ok((token, user))
    }

    /// Resolves a bearer token to its user: signature and expiry via the
    /// JWT, revocation via the session row.
    pub async fn resolve(&self, token: &str) -> Result<UserRecord, AuthError> {
        let claims = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| AuthError::InvalidToken)?
        .claims;

        let session_user = self
            .store
            .session_user(&token_hash(token))
            .await?
            .ok_or(AuthError::InvalidToken)?;

        let claimed_user: i64 = claims.sub.parse().map_err(|_| AuthError::InvalidToken)?;
        if claimed_user != session_user {
            return Err(AuthError::InvalidToken);
        }

        self.store
            .user_by_id(session_user)
            .await?
            .ok_or(AuthError::InvalidToken)
    }

    pub async fn logout(&self, token: &str) -> Result<bool, AuthError> {
        Ok(self.store.delete_session(&token_hash(token)).await?)
    }

    pub async fn cleanup_expired_sessions(&self) -> Result<usize, AuthError> {
        let deleted = self.store.delete_expired_sessions().await?;
        if deleted > 0 {
            tracing::debug!(deleted, "expired sessions removed");
        }
        Ok(deleted)
    }

    fn mint_token(&self, user_id: i64) -> Result<String, AuthError> {
        let iat = now_secs();
        let exp = iat.saturating_add(self.token_ttl.as_secs().min(i64::MAX as u64) as i64);
        let claims = Claims {
            sub: user_id.to_string(),
            exp,
            iat,
        };
        Ok(encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )?)
    }
}

fn validate_username(username: &str) -> Result<(), AuthError> {
    if username.len() < 3 {
        return Err(AuthError::InvalidUsername {
            reason: "must be at least 3 characters",
        });
    }
    if username.len() > 64 {
        return Err(AuthError::InvalidUsername {
            reason: "must be at most 64 characters",
        });
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(AuthError::InvalidUsername {
            reason: "only letters, digits, '-', '_' and '.' allowed",
        });
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<(), AuthError> {
    let pattern = Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$")
        .map_err(|_| AuthError::InvalidEmail)?;
    if pattern.is_match(email) {
        Ok(())
    } else {
        Err(AuthError::InvalidEmail)
    }
}

fn validate_password_strength(password: &str) -> Result<(), AuthError> {
    if password.len() < 8 {
        return Err(AuthError::WeakPassword {
            reason: "must be at least 8 characters",
        });
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(AuthError::WeakPassword {
            reason: "must contain an uppercase letter",
        });
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        return Err(AuthError::WeakPassword {
            reason: "must contain a lowercase letter",
        });
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(AuthError::WeakPassword {
            reason: "must contain a digit",
        });
    }
    Ok(())
}

fn generate_salt() -> Result<String, AuthError> {
    let mut bytes = [0u8; 16];
    getrandom::fill(&mut bytes).map_err(|_| AuthError::Rng)?;
    Ok(hex_encode(&bytes))
}

fn hash_password(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex_encode(&hasher.finalize())
}

fn token_hash(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service(dir: &tempfile::TempDir) -> AuthService {
        let store = SqliteStore::new(dir.path().join("auth.sqlite"));
        store.init().await.expect("init");
        AuthService::new(store, "test-secret", Duration::from_secs(3600), 100)
    }

    #[tokio::test]
    async fn register_login_resolve_logout_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let auth = service(&dir).await;

        let user = auth
            .register("alice", "alice@example.com", "Passw0rd")
            .await
            .expect("register");

        let (token, logged_in) = auth.login("alice", "Passw0rd").await.expect("login");
        assert_eq!(logged_in.id, user.id);

        let resolved = auth.resolve(&token).await.expect("resolve");
        assert_eq!(resolved.id, user.id);
        assert_eq!(resolved.username, "alice");

        assert!(auth.logout(&token).await.expect("logout"));
        assert!(matches!(
            auth.resolve(&token).await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn login_rejects_bad_credentials_uniformly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let auth = service(&dir).await;
        auth.register("alice", "alice@example.com", "Passw0rd")
            .await
            .expect("register");

        assert!(matches!(
            auth.login("alice", "wrong-Passw0rd").await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            auth.login("nobody", "Passw0rd").await,
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn register_validates_inputs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let auth = service(&dir).await;

        assert!(matches!(
            auth.register("al", "al@example.com", "Passw0rd").await,
            Err(AuthError::InvalidUsername { .. })
        ));
        assert!(matches!(
            auth.register("alice", "not-an-email", "Passw0rd").await,
            Err(AuthError::InvalidEmail)
        ));
        assert!(matches!(
            auth.register("alice", "alice@example.com", "password").await,
            Err(AuthError::WeakPassword { .. })
        ));
        assert!(matches!(
            auth.register("alice", "alice@example.com", "Short1A").await,
            Err(AuthError::WeakPassword { .. })
        ));

        auth.register("alice", "alice@example.com", "Passw0rd")
            .await
            .expect("register");
        assert!(matches!(
            auth.register("alice", "alice2@example.com", "Passw0rd").await,
            Err(AuthError::AlreadyRegistered)
        ));
    }

    #[test]
    fn password_hash_depends_on_salt() {
        let a = hash_password("Passw0rd", "salt-a");
        let b = hash_password("Passw0rd", "salt-b");
        assert_ne!(a, b);
        assert_eq!(a, hash_password("Passw0rd", "salt-a"));
    }
}
