//! Identity boundary: account registration and login.
//!
//! The room engine only ever sees the verified (user_id, username) pair
//! carried in JWT claims; everything here exists to mint that pair.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::jwt;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub user_id: String,
    pub username: String,
}

/// POST /api/auth/register — Create an account and return an access token.
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<AuthResponse>), ApiError> {
    let username = req.username.trim().to_string();
    if username.is_empty() || username.len() > 50 {
        return Err(ApiError::BadRequest(
            "username must be 1-50 characters".to_string(),
        ));
    }
    if req.password.len() < 8 {
        return Err(ApiError::BadRequest(
            "password must be at least 8 characters".to_string(),
        ));
    }

    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|e| ApiError::internal("password hashing failed", e))?
        .to_string();

    let db = state.db.clone();
    let user_id = Uuid::new_v4().to_string();
    let uid = user_id.clone();
    let uname = username.clone();

    tokio::task::spawn_blocking(move || {
        let conn = db
            .lock()
            .map_err(|e| ApiError::internal("DB lock", e))?;
        let now = Utc::now().to_rfc3339();

        let inserted = conn
            .execute(
                "INSERT INTO users (id, username, password_hash, is_online, created_at, updated_at)
                 SELECT ?1, ?2, ?3, 0, ?4, ?4
                 WHERE NOT EXISTS (SELECT 1 FROM users WHERE username = ?2)",
                rusqlite::params![uid, uname, password_hash, now],
            )?;
        if inserted == 0 {
            return Err(ApiError::Conflict("username already taken".to_string()));
        }
        Ok(())
    })
    .await??;

    let token = jwt::issue_access_token(&state.jwt_secret, &user_id, &username)
        .map_err(|e| ApiError::internal("token issuance failed", e))?;

    tracing::info!(user_id = %user_id, username = %username, "Account registered");

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            access_token: token,
            user_id,
            username,
        }),
    ))
}

/// POST /api/auth/login — Verify credentials and return an access token.
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let db = state.db.clone();
    let username = req.username.trim().to_string();
    let uname = username.clone();

    let (user_id, stored_hash) = tokio::task::spawn_blocking(move || {
        let conn = db
            .lock()
            .map_err(|e| ApiError::internal("DB lock", e))?;
        conn.query_row(
            "SELECT id, password_hash FROM users WHERE username = ?1",
            rusqlite::params![uname],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )
        .map_err(|_| ApiError::Unauthorized)
    })
    .await??;

    let parsed = PasswordHash::new(&stored_hash)
        .map_err(|e| ApiError::internal("stored hash unreadable", e))?;
    if Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed)
        .is_err()
    {
        return Err(ApiError::Unauthorized);
    }

    let token = jwt::issue_access_token(&state.jwt_secret, &user_id, &username)
        .map_err(|e| ApiError::internal("token issuance failed", e))?;

    Ok(Json(AuthResponse {
        access_token: token,
        user_id,
        username,
    }))
}
