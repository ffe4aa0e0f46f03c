//! Operator auth surface: one-shot registration, login, session info.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::Extension;
use axum_extra::extract::cookie::{Cookie, SameSite};
use serde::Deserialize;
use serde_json::json;

use crate::auth::{self, SessionClaims, SESSION_COOKIE, SESSION_TTL_SECS};
use crate::error::ApiError;
use crate::routes::AppState;
use crate::store::StoreError;

pub async fn setup(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let has_user = state.store.has_any_user().await?;
    Ok(Json(json!({ "registration_open": !has_user })))
}

#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

/// First user wins; every later attempt is refused.
pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<CredentialsRequest>,
) -> Result<Response, ApiError> {
    if state.store.has_any_user().await? {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "registration already completed",
        ));
    }
    if request.username.is_empty() || request.password.is_empty() {
        return Err(ApiError::bad_request("username and password required"));
    }
    let password_hash = auth::hash_password(&request.password)?;
    match state
        .store
        .create_user(&request.username, &password_hash)
        .await
    {
        Ok(_) => Ok((StatusCode::CREATED, Json(json!({ "status": "created" }))).into_response()),
        Err(StoreError::Duplicate) => Err(ApiError::new(
            StatusCode::CONFLICT,
            "username already exists",
        )),
        Err(err) => Err(err.into()),
    }
}

pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<CredentialsRequest>,
) -> Result<Response, ApiError> {
    if request.username.is_empty() || request.password.is_empty() {
        return Err(ApiError::bad_request("username and password required"));
    }
    let user = state
        .store
        .user_by_username(&request.username)
        .await?
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "invalid credentials"))?;
    if !auth::verify_password(&user.password_hash, &request.password) {
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "invalid credentials",
        ));
    }
    let token = auth::issue_token(user.id, &user.username, &state.config.jwt_secret)?;
    let cookie = Cookie::build((SESSION_COOKIE, token.clone()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::seconds(SESSION_TTL_SECS))
        .build();
    Ok((
        [(header::SET_COOKIE, cookie.to_string())],
        Json(json!({
            "token": token,
            "user_id": user.id,
            "username": user.username,
        })),
    )
        .into_response())
}

pub async fn me(Extension(claims): Extension<SessionClaims>) -> Json<serde_json::Value> {
    Json(json!({
        "user_id": claims.user_id,
        "username": claims.username,
    }))
}
