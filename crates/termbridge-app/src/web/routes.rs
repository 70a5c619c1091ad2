use std::sync::Arc;

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use termbridge_terminal::{SessionError, SessionManager};
use termbridge_types::SessionInfo;

use super::handler::handle_socket;
use crate::resolver::SpawnResolver;

/// Application state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub manager: SessionManager,
    pub resolver: Arc<dyn SpawnResolver>,
}

/// Create router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // API routes
        .route("/api/sessions", get(list_sessions))
        .route(
            "/api/sessions/:session_key",
            get(get_session_details).delete(terminate_session),
        )
        // WebSocket endpoint
        .route("/ws/:session_key", get(websocket_handler))
        .with_state(state)
}

/// Optional initial terminal size for a new connection
#[derive(Debug, Default, Deserialize)]
pub struct SizeQuery {
    pub rows: Option<u16>,
    pub cols: Option<u16>,
}

impl SizeQuery {
    pub fn size(&self) -> Option<(u16, u16)> {
        match (self.rows, self.cols) {
            (Some(rows), Some(cols)) if rows > 0 && cols > 0 => Some((rows, cols)),
            _ => None,
        }
    }
}

/// GET /health
async fn health() -> &'static str {
    "ok"
}

/// GET /api/sessions - List all sessions
async fn list_sessions(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sessions = state.manager.list_sessions().await;
    Json(serde_json::json!({ "sessions": sessions }))
}

/// GET /api/sessions/:session_key - Get session details
async fn get_session_details(
    State(state): State<AppState>,
    Path(session_key): Path<String>,
) -> Result<Json<SessionInfo>, AppError> {
    state
        .manager
        .session_info(&session_key)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Session {} not found", session_key)))
}

/// DELETE /api/sessions/:session_key - Terminate a session
async fn terminate_session(
    State(state): State<AppState>,
    Path(session_key): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.manager.terminate(&session_key).await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "message": "Session terminated",
    })))
}

/// GET /ws/:session_key - WebSocket endpoint
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(session_key): Path<String>,
    Query(query): Query<SizeQuery>,
) -> Response {
    let size = query.size();
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_key, size))
}

#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    Session(SessionError),
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(_) => AppError::NotFound(err.to_string()),
            other => AppError::Session(other),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "session_not_found", msg),
            AppError::Session(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                err.code().as_str(),
                err.to_string(),
            ),
        };

        let body = Json(serde_json::json!({
            "error": message,
            "code": code,
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_query() {
        let query = SizeQuery {
            rows: Some(30),
            cols: Some(100),
        };
        assert_eq!(query.size(), Some((30, 100)));
        assert_eq!(SizeQuery::default().size(), None);
        let zero = SizeQuery {
            rows: Some(0),
            cols: Some(100),
        };
        assert_eq!(zero.size(), None);
    }

    #[test]
    fn test_not_found_maps_to_404() {
        let response = AppError::from(SessionError::NotFound("k".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = AppError::from(SessionError::Terminated("k".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
