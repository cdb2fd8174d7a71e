use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::time::Duration;

use anyhow::Result;
use askama::Template;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::bootstrap::Services;
use crate::browser::BrowserLauncher;
use crate::config::AppConfig;
use crate::memory::{SessionStore, DEFAULT_SESSION_ID};
use crate::models::{
    ChatRequest, RetrieveRequest, RetrieveResponse, ScoredNode, SessionResponse,
};
use crate::stream::{batch_tokens, CHAT_BATCH_SIZE};

const STREAM_ERROR_MARKER: &str = "\n[error] the answer could not be completed";
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    services: Services,
    retrieve_query: String,
}

impl AppState {
    pub fn new(services: Services, config: &AppConfig) -> Self {
        Self {
            services,
            retrieve_query: config.retrieval.fixed_query.clone(),
        }
    }
}

pub fn build_router(state: AppState, template_dir: &FsPath) -> Router {
    Router::new()
        .route("/", get(index_page))
        .route("/chat", post(chat_handler))
        .route("/retrive", post(retrieve_handler))
        .route("/session", post(create_session))
        .route("/session/:session_id", delete(close_session))
        .fallback_service(ServeDir::new(template_dir))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_server(config: AppConfig, services: Services) -> Result<()> {
    let sessions = services.sessions.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SESSION_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            sweep_idle_sessions(&sessions, Utc::now());
        }
    });

    let state = AppState::new(services, &config);
    let app = build_router(state, &config.template_dir);

    let addr: SocketAddr = config.bind_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on http://{}", addr);

    launch_browser_if_enabled(&config, &BrowserLauncher::new(), Duration::from_secs(1));

    axum::serve(listener, app).await?;
    Ok(())
}

fn sweep_idle_sessions(sessions: &SessionStore, now: DateTime<Utc>) -> usize {
    let evicted = sessions.evict_idle(now);
    if evicted > 0 {
        tracing::info!("evicted {} idle chat sessions", evicted);
    }
    evicted
}

/// Returns whether a launch was scheduled.
fn launch_browser_if_enabled(
    config: &AppConfig,
    launcher: &BrowserLauncher,
    delay: Duration,
) -> bool {
    config.open_browser && launcher.launch_after(config.browser_url(), delay)
}

async fn index_page(State(state): State<AppState>) -> Result<Html<String>, ApiError> {
    let session_id = state.services.sessions.create();

    let template = IndexTemplate { session_id };
    let body = template.render()?;

    Ok(Html(body))
}

async fn chat_handler(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let message = request
        .message
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("message is required"))?;
    let session_id = request
        .session_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SESSION_ID.to_string());

    let memory = state.services.sessions.get_or_create(&session_id);
    let tokens = state
        .services
        .chat
        .stream_chat(memory, &message)
        .await
        .map_err(ApiError::upstream)?;

    let body = batch_tokens(tokens, CHAT_BATCH_SIZE).map(|chunk| {
        Ok::<_, Infallible>(match chunk {
            Ok(text) => text,
            Err(err) => {
                tracing::error!("chat stream failed: {:#}", err);
                STREAM_ERROR_MARKER.to_string()
            }
        })
    });

    let mut response = Body::from_stream(body).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    if let Ok(value) = HeaderValue::from_str(&session_id) {
        headers.insert("x-session-id", value);
    }
    Ok(response)
}

async fn retrieve_handler(
    State(state): State<AppState>,
    payload: Result<Json<RetrieveRequest>, JsonRejection>,
) -> Result<Json<RetrieveResponse>, ApiError> {
    // The request message is accepted but the configured query is what runs.
    let Json(_request) = payload?;

    let nodes = state
        .services
        .retriever
        .retrieve(&state.retrieve_query)
        .await
        .map_err(ApiError::upstream)?;

    Ok(Json(RetrieveResponse {
        source: nodes.iter().map(ScoredNode::source_line).collect(),
    }))
}

async fn create_session(State(state): State<AppState>) -> Json<SessionResponse> {
    Json(SessionResponse {
        session_id: state.services.sessions.create(),
    })
}

async fn close_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.services.sessions.close(&session_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!(
            "session not found: {}",
            session_id
        )))
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    session_id: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: String) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message,
        }
    }

    fn upstream(err: anyhow::Error) -> Self {
        tracing::error!("upstream call failed: {:#}", err);
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: "upstream service failed".to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        tracing::error!("request failed: {:#}", value);
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal server error".to_string(),
        }
    }
}

impl From<askama::Error> for ApiError {
    fn from(value: askama::Error) -> Self {
        Self::from(anyhow::Error::new(value))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(value: JsonRejection) -> Self {
        Self::bad_request(value.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}
