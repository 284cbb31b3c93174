//! Auth HTTP surface (C2): `/auth/login`, `/auth/verify`, `/auth/refresh`.
//!
//! Implemented in-process since no user database is in scope: credentials
//! are the single configured demo username/password pair, compared via
//! `bcrypt` so the code path looks like (and costs like) real credential
//! checking even though there is exactly one account.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::auth::token::verify_password;
use crate::server::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: message.into() })).into_response()
}

/// `POST /auth/login {username, password} -> {token}`.
pub async fn login(State(state): State<AppState>, Json(body): Json<LoginRequest>) -> Response {
    if body.username != state.config.demo_username {
        return error_response(StatusCode::UNAUTHORIZED, "invalid username or password");
    }
    match verify_password(&body.password, &state.config.demo_password_hash) {
        Ok(true) => match state.token_service.issue(&body.username) {
            Ok(token) => Json(TokenResponse { token }).into_response(),
            Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        Ok(false) => error_response(StatusCode::UNAUTHORIZED, "invalid username or password"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// `GET /auth/verify` with an `Authorization: Bearer <token>` header.
pub async fn verify(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return error_response(StatusCode::UNAUTHORIZED, "missing bearer token");
    };
    match state.token_service.verify(token) {
        Ok(claims) => Json(serde_json::json!({ "valid": true, "sub": claims.sub })).into_response(),
        Err(e) => error_response(StatusCode::UNAUTHORIZED, e.to_string()),
    }
}

/// `POST /auth/refresh {token} -> {token}`. Succeeds for tokens expired
/// within the 24h grace window; signature failures are hard-rejected.
pub async fn refresh(State(state): State<AppState>, Json(body): Json<RefreshRequest>) -> Response {
    match state.token_service.refresh(&body.token) {
        Ok(token) => Json(TokenResponse { token }).into_response(),
        Err(e) => error_response(StatusCode::UNAUTHORIZED, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi"));
    }

    #[test]
    fn test_bearer_token_missing() {
        let headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn test_bearer_token_rejects_non_bearer_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Basic abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }
}
