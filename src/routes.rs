use axum::{middleware, Router};

use crate::auth::accounts;
use crate::auth::middleware::JwtSecret;
use crate::rooms::crud as room_crud;
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Inject the JWT secret into request extensions so the Claims extractor can find it.
async fn inject_jwt_secret(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    req.extensions_mut()
        .insert(JwtSecret(state.jwt_secret.clone()));
    next.run(req).await
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // Public auth routes (identity boundary)
    let auth_routes = Router::new()
        .route("/api/auth/register", axum::routing::post(accounts::register))
        .route("/api/auth/login", axum::routing::post(accounts::login));

    // Room CRUD and the join-request workflow (JWT required — the Claims
    // extractor validates tokens).
    // Note: /api/rooms/public, /mine, and /code/{code} MUST come before
    // /api/rooms/{id} to avoid path param conflicts.
    let room_routes = Router::new()
        .route("/api/rooms", axum::routing::post(room_crud::create_room))
        .route("/api/rooms/public", axum::routing::get(room_crud::list_public_rooms))
        .route("/api/rooms/mine", axum::routing::get(room_crud::list_my_rooms))
        .route("/api/rooms/code/{code}", axum::routing::get(room_crud::resolve_join_code))
        .route("/api/rooms/join-with-code", axum::routing::post(room_crud::join_room_with_code))
        .route("/api/rooms/{id}", axum::routing::get(room_crud::get_room))
        .route("/api/rooms/{id}", axum::routing::put(room_crud::update_room))
        .route("/api/rooms/{id}", axum::routing::delete(room_crud::delete_room))
        .route("/api/rooms/{id}/join", axum::routing::post(room_crud::join_room))
        .route("/api/rooms/{id}/leave", axum::routing::post(room_crud::leave_room))
        .route("/api/rooms/{id}/join-code", axum::routing::post(room_crud::generate_join_code))
        .route("/api/rooms/{id}/requests", axum::routing::post(room_crud::request_join))
        .route("/api/rooms/{id}/requests", axum::routing::get(room_crud::list_requests))
        .route("/api/rooms/{id}/requests", axum::routing::delete(room_crud::cancel_request))
        .route(
            "/api/rooms/{id}/requests/{user_id}/approve",
            axum::routing::post(room_crud::approve_request),
        )
        .route(
            "/api/rooms/{id}/requests/{user_id}/reject",
            axum::routing::post(room_crud::reject_request),
        );

    // WebSocket endpoint (auth via query param, not JWT header)
    let ws_routes = Router::new().route("/ws", axum::routing::get(ws_handler::ws_upgrade));

    // Health check
    let health = Router::new().route("/health", axum::routing::get(health_check));

    Router::new()
        .merge(auth_routes)
        .merge(room_routes)
        .merge(ws_routes)
        .merge(health)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inject_jwt_secret,
        ))
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
