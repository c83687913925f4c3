use std::net::SocketAddr;

use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{Method, StatusCode},
    middleware,
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_shared::constants::MAX_MESSAGE_SIZE;
use parley_shared::rest::{
    AddMembersRequest, CreateGroupRequest, GroupInfo, MarkReadResponse, OnlineUsersResponse,
    PageQuery, PublicKeyResponse, RegisterKeyRequest, SendMessageRequest, UnreadCountResponse,
    WrappedGroupKey,
};
use parley_shared::types::{ConversationId, GroupId, Message, UserId};

use crate::admin::admin_ws_handler;
use crate::auth::AuthenticatedUser;
use crate::error::ServerError;
use crate::rate_limit::rate_limit_middleware;
use crate::router::OutgoingMessage;
use crate::state::AppState;
use crate::ws::ws_handler;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .route("/admin/ws", get(admin_ws_handler))
        .route("/messages/register-key", post(register_key))
        .route("/messages/public-key/:user_id", get(public_key))
        .route("/messages/send", post(send_message))
        .route("/messages/mark-read/:sender_id", put(mark_read))
        .route("/messages/online-users", get(online_users))
        .route("/messages/conversation/:user_id", get(conversation))
        .route("/messages/unread-count", get(unread_count))
        .route("/groups", get(list_groups).post(create_group))
        .route("/groups/:id", get(group_details))
        .route("/groups/:id/members", post(add_members))
        .route("/groups/:id/key", get(group_key))
        .route("/groups/:id/messages", get(group_messages))
        // Envelope JSON plus attachment references stays well under 2x.
        .layer(DefaultBodyLimit::max(MAX_MESSAGE_SIZE * 2))
        .layer(middleware::from_fn_with_state(
            state.http_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
    online_users: usize,
    connections: usize,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        online_users: state.registry.online_users().await.len(),
        connections: state.registry.connection_count().await,
    })
}

async fn register_key(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Json(req): Json<RegisterKeyRequest>,
) -> Result<Json<PublicKeyResponse>, ServerError> {
    let published = state
        .directory
        .publish(&user, &req.public_key, req.key_version)?;
    Ok(Json(published))
}

/// 404 here is routine: the peer has not published a key yet.
async fn public_key(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<PublicKeyResponse>, ServerError> {
    let user = parse_user(&user_id)?;
    state
        .directory
        .lookup(&user)?
        .map(Json)
        .ok_or_else(|| ServerError::NotFound(format!("no public key for {user}")))
}

async fn send_message(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Message>), ServerError> {
    let outgoing = OutgoingMessage {
        target: req.recipient_id,
        content: req.content,
        attachments: req.attachments,
        is_group: req.is_group,
    };
    let message = state.router.send(&user, outgoing, None).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn mark_read(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Path(sender_id): Path<String>,
) -> Result<Json<MarkReadResponse>, ServerError> {
    let sender = parse_user(&sender_id)?;
    let conversation = ConversationId::direct(&user, &sender);
    let updated = state.router.mark_read(&conversation, &user)?;
    Ok(Json(MarkReadResponse { updated }))
}

async fn online_users(
    State(state): State<AppState>,
    AuthenticatedUser(_): AuthenticatedUser,
) -> Json<OnlineUsersResponse> {
    Json(OnlineUsersResponse {
        users: state.presence.snapshot_online_users().await,
    })
}

async fn conversation(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Path(peer_id): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<Message>>, ServerError> {
    let peer = parse_user(&peer_id)?;
    Ok(Json(state.router.conversation(&user, &peer, page)?))
}

async fn unread_count(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
) -> Result<Json<UnreadCountResponse>, ServerError> {
    let count = state.router.unread_count(&user)?;
    Ok(Json(UnreadCountResponse { count }))
}

async fn list_groups(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
) -> Result<Json<Vec<GroupInfo>>, ServerError> {
    Ok(Json(state.groups.groups_for(&user).await?))
}

async fn create_group(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Json(req): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<GroupInfo>), ServerError> {
    let group = state.groups.create_group(&user, req).await?;
    info!(group = %group.id, "group created via API");
    Ok((StatusCode::CREATED, Json(group)))
}

async fn group_details(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<Json<GroupInfo>, ServerError> {
    let group_id = parse_group(&id)?;
    Ok(Json(state.groups.details(&group_id, &user).await?))
}

async fn add_members(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Path(id): Path<String>,
    Json(req): Json<AddMembersRequest>,
) -> Result<Json<GroupInfo>, ServerError> {
    let group_id = parse_group(&id)?;
    Ok(Json(state.groups.add_members(&group_id, &user, req).await?))
}

async fn group_key(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<Json<WrappedGroupKey>, ServerError> {
    let group_id = parse_group(&id)?;
    state
        .groups
        .wrapped_key_for(&group_id, &user)?
        .map(Json)
        .ok_or_else(|| ServerError::NotFound("no group key distributed to you".into()))
}

async fn group_messages(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Path(id): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<Message>>, ServerError> {
    let group_id = parse_group(&id)?;
    Ok(Json(state.router.group_messages(&group_id, &user, page)?))
}

fn parse_user(raw: &str) -> Result<UserId, ServerError> {
    UserId::parse(raw).map_err(|e| ServerError::BadRequest(e.to_string()))
}

fn parse_group(raw: &str) -> Result<GroupId, ServerError> {
    GroupId::parse(raw).map_err(|e| ServerError::BadRequest(e.to_string()))
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_on(state, listener).await
}

/// Serve on an already-bound listener (tests bind port 0).
pub async fn serve_on(state: AppState, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %listener.local_addr()?, "Starting HTTP API server");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
