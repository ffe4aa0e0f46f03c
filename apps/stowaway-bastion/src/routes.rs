//! Router assembly; kept as a function so tests can build the full app
//! against the in-memory store.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::Router;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::set_status::SetStatus;
use tower_http::trace::TraceLayer;

use crate::agent_ws;
use crate::agents;
use crate::auth;
use crate::config::Config;
use crate::files;
use crate::handlers;
use crate::hub::Hub;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub hub: Hub,
}

pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/api/setup", get(handlers::setup))
        .route("/api/register", post(handlers::register))
        .route("/api/login", post(handlers::login));

    let protected = Router::new()
        .route("/api/me", get(handlers::me))
        .route(
            "/api/agents",
            get(agents::list_agents).post(agents::create_agent),
        )
        .route(
            "/api/agents/:id",
            patch(agents::update_agent).delete(agents::delete_agent),
        )
        .route(
            "/api/agents/:id/files",
            get(files::files_get)
                .put(files::files_put)
                .delete(files::files_delete),
        )
        .route("/api/agents/:id/meta", get(files::meta_get))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_session,
        ))
        // The write protocol carries whole payloads; no body cap here.
        .layer(DefaultBodyLimit::disable());

    let agent_ws = Router::new().route("/ws/agent", get(agent_ws::agent_ws_handler));

    let mut app = Router::new().merge(public).merge(protected).merge(agent_ws);
    if let Some(dir) = &state.config.static_dir {
        app = app.fallback_service(spa_service(dir));
    }
    app.layer(middleware::from_fn_with_state(state.clone(), cors))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the web console with an `index.html` fallback for SPA routes.
fn spa_service(dir: &str) -> ServeDir<SetStatus<ServeFile>> {
    let index = std::path::Path::new(dir).join("index.html");
    ServeDir::new(dir).not_found_service(ServeFile::new(index))
}

/// Single-origin CORS; preflight requests short-circuit with 204.
async fn cors(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let origin = state
        .config
        .cors_origin
        .clone()
        .unwrap_or_else(|| "*".to_string());
    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors_headers(response.headers_mut(), &origin);
        return response;
    }
    let mut response = next.run(request).await;
    apply_cors_headers(response.headers_mut(), &origin);
    response
}

fn apply_cors_headers(headers: &mut HeaderMap, origin: &str) {
    if let Ok(value) = HeaderValue::from_str(origin) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, PATCH, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
    if origin != "*" {
        // Cookie auth needs credentials, which the wildcard origin forbids.
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
        headers.insert(header::VARY, HeaderValue::from_static("Origin"));
    }
}
