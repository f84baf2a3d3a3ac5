use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tower_http::trace::TraceLayer;

use application::ApplicationError;
use domain::{MessageId, Notification, NotificationType, UserId};

use crate::{
    auth::extract_credential, error::ApiError, state::AppState, ws_connection::RealtimeConnection,
};

#[derive(Debug, Default, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DispatchNotificationPayload {
    user_id: UserId,
    #[serde(rename = "type")]
    notification_type: NotificationType,
    #[serde(default)]
    payload: JsonValue,
    #[serde(default)]
    related_message_id: Option<MessageId>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(websocket_upgrade))
        .route("/internal/notifications", post(dispatch_notification))
}

async fn health(State(state): State<AppState>) -> Json<JsonValue> {
    Json(json!({
        "status": "ok",
        "connections": state.hub.connection_count(),
    }))
}

/// 握手阶段完成认证：凭证缺失或无效直接返回 401，不会升级
async fn websocket_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let credential = extract_credential(query.token.as_deref(), &headers)
        .ok_or_else(|| ApiError::unauthorized("Missing credential"))?;
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let accepted = state.hub.connect(&credential).await.map_err(|err| {
        if matches!(err, ApplicationError::Authentication(_)) {
            tracing::info!(error = %err, "websocket handshake rejected");
        }
        ApiError::from(err)
    })?;

    let failed_handle = accepted.handle.clone();
    let hub = state.hub.clone();

    Ok(ws
        .on_failed_upgrade(move |err| {
            tracing::warn!(error = %err, connection_id = %failed_handle.id, "websocket upgrade failed");
            failed_handle.close();
        })
        .on_upgrade(move |socket| RealtimeConnection::new(socket, hub, accepted).run())
        .into_response())
}

/// 外部流程（如好友请求）写入通知并推送给在线设备
async fn dispatch_notification(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<DispatchNotificationPayload>,
) -> Result<(StatusCode, Json<Notification>), ApiError> {
    let actor = state.jwt_service.extract_user_from_headers(&headers)?;

    let notification = state
        .hub
        .notify(
            body.user_id,
            body.notification_type,
            body.payload,
            body.related_message_id,
        )
        .await?;

    tracing::info!(
        actor = %actor,
        recipient = %notification.user_id,
        notification_id = %notification.id,
        "notification dispatched"
    );
    Ok((StatusCode::CREATED, Json(notification)))
}
