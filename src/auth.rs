//! Password hashing and bearer tokens.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::models::User;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authentication required")]
    MissingToken,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Invalid email or password")]
    InvalidCredentials,
    #[error("password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),
    #[error("token encoding failed: {0}")]
    Encode(#[from] jsonwebtoken::errors::Error),
    #[error("password hashing task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("token lifetime overflows the expiry timestamp")]
    TokenLifetime,
}

/// JWT claims carried by every bearer token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    /// User id.
    pub sub: String,
    pub email: String,
    pub iat: u64,
    pub exp: u64,
}

impl Claims {
    pub fn user_id(&self) -> Result<Uuid, AuthError> {
        Uuid::parse_str(&self.sub).map_err(|_| AuthError::InvalidToken)
    }
}

struct Keys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

/// Issues and verifies tokens and hashes passwords. Cheap to clone.
#[derive(Clone)]
pub struct Authenticator {
    keys: Arc<Keys>,
    token_ttl: Duration,
    bcrypt_cost: u32,
}

impl Authenticator {
    pub fn new(config: &AuthConfig) -> Self {
        let secret = config.jwt_secret.as_bytes();
        Self {
            keys: Arc::new(Keys {
                encoding: EncodingKey::from_secret(secret),
                decoding: DecodingKey::from_secret(secret),
            }),
            token_ttl: config.token_ttl,
            bcrypt_cost: config.bcrypt_cost,
        }
    }

    /// Hash a password on the blocking pool.
    pub async fn hash_password(&self, password: &str) -> Result<String, AuthError> {
        let password = password.to_string();
        let cost = self.bcrypt_cost;
        let hash = tokio::task::spawn_blocking(move || bcrypt::hash(password, cost)).await??;
        Ok(hash)
    }

    /// Check a password against a stored hash.
    ///
    /// A malformed hash counts as a mismatch.
    pub async fn verify_password(&self, password: &str, hash: &str) -> Result<bool, AuthError> {
        let password = password.to_string();
        let hash = hash.to_string();
        let verified = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash)).await?;
        Ok(verified.unwrap_or(false))
    }

    pub fn issue_token(&self, user: &User) -> Result<String, AuthError> {
        self.issue_token_at(user, unix_now())
    }

    fn issue_token_at(&self, user: &User, now: u64) -> Result<String, AuthError> {
        let claims = Claims {
            sub: user.id.to_string(),
            email: user.email.clone(),
            iat: now,
            exp: now
                .checked_add(self.token_ttl.as_secs())
                .ok_or(AuthError::TokenLifetime)?,
        };
        Ok(encode(&Header::default(), &claims, &self.keys.encoding)?)
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.keys.decoding, &Validation::default())
            .map_err(|e| {
                tracing::debug!("Rejected token: {}", e);
                AuthError::InvalidToken
            })?;
        Ok(data.claims)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn authenticator(secret: &str) -> Authenticator {
        Authenticator::new(&AuthConfig {
            jwt_secret: secret.to_string(),
            token_ttl: Duration::from_secs(3600),
            bcrypt_cost: 4,
        })
    }

    fn user() -> User {
        User {
            id: Uuid::new_v4(),
            name: "Ada".to_string(),
            email: "ada@example.com".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn password_round_trip() {
        let auth = authenticator("secret");
        let hash = auth.hash_password("correct horse").await.unwrap();
        assert_ne!(hash, "correct horse");
        assert!(auth.verify_password("correct horse", &hash).await.unwrap());
        assert!(!auth.verify_password("wrong horse", &hash).await.unwrap());
    }

    #[tokio::test]
    async fn malformed_hash_is_a_mismatch() {
        let auth = authenticator("secret");
        assert!(!auth.verify_password("anything", "not-a-hash").await.unwrap());
    }

    #[test]
    fn token_carries_user_identity() {
        let auth = authenticator("secret");
        let user = user();
        let token = auth.issue_token(&user).unwrap();

        let claims = auth.verify_token(&token).unwrap();
        assert_eq!(claims.user_id().unwrap(), user.id);
        assert_eq!(claims.email, user.email);
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn token_signed_with_other_secret_is_rejected() {
        let token = authenticator("one").issue_token(&user()).unwrap();
        assert!(matches!(
            authenticator("two").verify_token(&token),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let auth = authenticator("secret");
        let token = auth.issue_token_at(&user(), unix_now() - 7200).unwrap();
        assert!(matches!(auth.verify_token(&token), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn overlong_lifetime_fails_without_panicking() {
        let auth = Authenticator::new(&AuthConfig {
            jwt_secret: "secret".to_string(),
            token_ttl: Duration::from_secs(u64::MAX),
            bcrypt_cost: 4,
        });
        assert!(matches!(auth.issue_token(&user()), Err(AuthError::TokenLifetime)));
    }

    #[test]
    fn garbage_token_is_rejected() {
        assert!(authenticator("secret").verify_token("not.a.jwt").is_err());
    }
}
