use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use server_api::ApiContext;
use shared::{
    domain::{AccountId, ChatId, MessageId},
    error::{ApiError, ErrorCode},
    protocol::{ChatSummary, MessagePayload, ServerFrame},
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

mod app_state;
mod auth;
mod config;
mod hub;
mod ws;

use app_state::AppState;
use auth::{mint_token, verify_token, AuthConfig};
use config::{load_settings, prepare_database_url};
use hub::ChatHub;

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct LoginResponse {
    account_id: i64,
    token: String,
}

#[derive(Debug, Deserialize)]
struct CreateChatRequest {
    target_account_id: i64,
}

#[derive(Debug, Deserialize)]
struct ListMessagesQuery {
    after: Option<i64>,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct MarkReadRequest {
    through_seq: i64,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

const MAX_BODY_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = AppState {
        api: ApiContext { storage },
        hub: Arc::new(ChatHub::new()),
        auth: AuthConfig {
            secret: settings.auth_secret,
            ttl_seconds: settings.auth_token_ttl_seconds,
        },
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/chats", post(http_create_chat).get(http_list_chats))
        .route("/chats/:chat_id/messages", get(http_list_messages))
        .route(
            "/chats/:chat_id/messages/:message_id",
            delete(http_delete_message),
        )
        .route("/chats/:chat_id/read", post(http_mark_read))
        .route("/chats/:chat_id", delete(http_delete_chat))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(error: ApiError) -> (StatusCode, Json<ApiError>) {
    (status_for(error.code), Json(error))
}

fn bearer_account(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<AccountId, (StatusCode, Json<ApiError>)> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| {
            reject(ApiError::new(
                ErrorCode::Unauthorized,
                "missing bearer token",
            ))
        })?;

    verify_token(&state.auth, token).map_err(|_| {
        reject(ApiError::new(
            ErrorCode::Unauthorized,
            "invalid or expired token",
        ))
    })
}

async fn healthz(
    State(state): State<Arc<AppState>>,
) -> Result<&'static str, (StatusCode, Json<ApiError>)> {
    state
        .api
        .storage
        .health_check()
        .await
        .map_err(|e| reject(ApiError::new(ErrorCode::Unavailable, e.to_string())))?;
    Ok("ok")
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, Json<ApiError>)> {
    let username = req.username.trim();
    if username.is_empty() {
        return Err(reject(ApiError::new(
            ErrorCode::Validation,
            "username cannot be empty",
        )));
    }

    let account_id = state
        .api
        .storage
        .create_account(username)
        .await
        .map_err(|e| reject(ApiError::new(ErrorCode::Internal, e.to_string())))?;

    let token = mint_token(&state.auth, account_id)
        .map_err(|e| reject(ApiError::new(ErrorCode::Internal, e.to_string())))?;

    Ok(Json(LoginResponse {
        account_id: account_id.0,
        token,
    }))
}

async fn http_create_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateChatRequest>,
) -> Result<Json<ChatSummary>, (StatusCode, Json<ApiError>)> {
    let account = bearer_account(&state, &headers)?;
    let chat = server_api::resolve_or_create_chat(
        &state.api,
        account,
        AccountId(req.target_account_id),
    )
    .await
    .map_err(reject)?;
    Ok(Json(chat))
}

async fn http_list_chats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ChatSummary>>, (StatusCode, Json<ApiError>)> {
    let account = bearer_account(&state, &headers)?;
    let chats = server_api::list_chats(&state.api, account)
        .await
        .map_err(reject)?;
    Ok(Json(chats))
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<i64>,
    Query(q): Query<ListMessagesQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<MessagePayload>>, (StatusCode, Json<ApiError>)> {
    let account = bearer_account(&state, &headers)?;
    let messages =
        server_api::list_messages(&state.api, account, ChatId(chat_id), q.after, q.limit)
            .await
            .map_err(reject)?;
    Ok(Json(messages))
}

async fn http_delete_message(
    State(state): State<Arc<AppState>>,
    Path((chat_id, message_id)): Path<(i64, i64)>,
    headers: HeaderMap,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let account = bearer_account(&state, &headers)?;
    let chat_id = ChatId(chat_id);
    let message_id = MessageId(message_id);

    let last_message = server_api::delete_message(&state.api, account, chat_id, message_id)
        .await
        .map_err(reject)?;

    state
        .hub
        .publish(
            chat_id,
            ServerFrame::MessageDeleted {
                chat_id,
                message_id,
                last_message,
            },
        )
        .await;

    Ok(StatusCode::NO_CONTENT)
}

async fn http_mark_read(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<MarkReadRequest>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let account = bearer_account(&state, &headers)?;
    server_api::mark_read(&state.api, account, ChatId(chat_id), req.through_seq)
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_delete_chat(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<i64>,
    headers: HeaderMap,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let account = bearer_account(&state, &headers)?;
    let chat_id = ChatId(chat_id);
    server_api::delete_chat(&state.api, account, chat_id)
        .await
        .map_err(reject)?;
    state.hub.retire(chat_id).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    // Browser WebSocket clients cannot set headers, hence the query fallback.
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or(q.token);

    let account_id = match token.as_deref().map(|t| verify_token(&state.auth, t)) {
        Some(Ok(account_id)) => account_id,
        // Refused before any session or chat state exists; no payload.
        _ => return StatusCode::UNAUTHORIZED.into_response(),
    };

    ws.on_upgrade(move |socket| ws::run_session(state, socket, account_id))
        .into_response()
}
