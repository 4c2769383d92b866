use axum::{extract::State, http::StatusCode, Json};

use crate::api::middleware::AuthUser;
use crate::auth::{AuthError, Authenticator};
use crate::db::{Database, StoreError};
use crate::error::{success, ApiError, ApiJson, ApiResult, Envelope};
use crate::models::*;

const MIN_PASSWORD_LEN: usize = 8;

pub async fn register(
    State(db): State<Database>,
    State(auth): State<Authenticator>,
    ApiJson(input): ApiJson<RegisterInput>,
) -> ApiResult<(StatusCode, Json<Envelope<AuthResponse>>)> {
    let name = input.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("Name is required".to_string()));
    }
    let email = normalize_email(&input.email);
    if !is_valid_email(&email) {
        return Err(ApiError::BadRequest("A valid email is required".to_string()));
    }
    if input.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::BadRequest(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    if db.get_user_by_email(&email)?.is_some() {
        return Err(StoreError::Conflict("Email is already registered".to_string()).into());
    }

    let password_hash = auth.hash_password(&input.password).await?;
    let user = db.create_user(NewUser {
        name: name.to_string(),
        email,
        password_hash,
    })?;
    let token = auth.issue_token(&user)?;

    tracing::info!(user_id = %user.id, "Registered user");
    Ok((StatusCode::CREATED, success(AuthResponse { token, user })))
}

pub async fn login(
    State(db): State<Database>,
    State(auth): State<Authenticator>,
    ApiJson(input): ApiJson<LoginInput>,
) -> ApiResult<Json<Envelope<AuthResponse>>> {
    let credentials = db
        .get_user_credentials(&input.email)?
        .ok_or(AuthError::InvalidCredentials)?;
    if !auth
        .verify_password(&input.password, &credentials.password_hash)
        .await?
    {
        return Err(AuthError::InvalidCredentials.into());
    }

    let user = credentials.user;
    let token = auth.issue_token(&user)?;
    Ok(success(AuthResponse { token, user }))
}

pub async fn me(AuthUser(user): AuthUser) -> Json<Envelope<User>> {
    success(user)
}

fn is_valid_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_validation() {
        assert!(is_valid_email("ada@example.com"));
        assert!(!is_valid_email("ada"));
        assert!(!is_valid_email("@example.com"));
        assert!(!is_valid_email("ada@"));
        assert!(!is_valid_email("a da@example.com"));
        assert!(!is_valid_email("a@b@c"));
    }
}
