use application::{
    AcceptedConnection, Ack, ApplicationError, ClientFrame, ConnectionHandle, Correlation,
    RealtimeHub, ServerEvent,
};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

/// 单个 WebSocket 连接
///
/// 写端只有发送任务一个持有者：出站事件、ack 和 pong 都经由它写出。
/// 读端解析客户端帧并交给中枢处理，结果以 ack 的形式回到出站队列。
pub struct RealtimeConnection {
    socket: WebSocket,
    hub: RealtimeHub,
    handle: ConnectionHandle,
    events: mpsc::Receiver<ServerEvent>,
}

enum WsCommand {
    SendPong(axum::body::Bytes),
}

impl RealtimeConnection {
    pub fn new(socket: WebSocket, hub: RealtimeHub, accepted: AcceptedConnection) -> Self {
        Self {
            socket,
            hub,
            handle: accepted.handle,
            events: accepted.events,
        }
    }

    /// 运行连接主循环，返回时连接已关闭并交由中枢清理
    pub async fn run(self) {
        let Self {
            socket,
            hub,
            handle,
            mut events,
        } = self;

        let (mut sender, mut incoming) = socket.split();
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(32);

        let mut send_task = {
            let closer = handle.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = closer.closed() => {
                            let _ = sender.send(WsMessage::Close(None)).await;
                            break;
                        }
                        Some(cmd) = cmd_rx.recv() => {
                            match cmd {
                                WsCommand::SendPong(data) => {
                                    if sender.send(WsMessage::Pong(data)).await.is_err() {
                                        tracing::warn!("Failed to send pong message");
                                        break;
                                    }
                                }
                            }
                        }
                        maybe_event = events.recv() => {
                            let Some(event) = maybe_event else { break };
                            let payload = match serde_json::to_string(&event) {
                                Ok(payload) => payload,
                                Err(err) => {
                                    tracing::error!(error = %err, "Failed to serialize server event");
                                    continue;
                                }
                            };
                            if sender.send(WsMessage::Text(payload.into())).await.is_err() {
                                tracing::warn!("Failed to write server event");
                                break;
                            }
                        }
                    }
                }
            })
        };

        let mut recv_task = {
            let hub = hub.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                while let Some(message) = incoming.next().await {
                    let message = match message {
                        Ok(message) => message,
                        Err(err) => {
                            tracing::debug!(error = %err, "websocket protocol error");
                            break;
                        }
                    };
                    match message {
                        WsMessage::Text(text) => {
                            Self::handle_text(&hub, &handle, text.as_str()).await;
                        }
                        WsMessage::Binary(_) => {
                            let ack = Ack::error(
                                Correlation::default(),
                                &ApplicationError::validation("frame", "binary frames are not supported"),
                            );
                            handle.deliver(ServerEvent::Ack(ack));
                        }
                        WsMessage::Ping(data) => {
                            if cmd_tx.send(WsCommand::SendPong(data)).await.is_err() {
                                break;
                            }
                        }
                        WsMessage::Pong(_) => {}
                        WsMessage::Close(_) => break,
                    }
                }
            })
        };

        tokio::select! {
            _ = &mut send_task => recv_task.abort(),
            _ = &mut recv_task => send_task.abort(),
        }

        handle.close();
        tracing::debug!(connection_id = %handle.id, user_id = %handle.user_id, "websocket loop finished");
    }

    async fn handle_text(hub: &RealtimeHub, handle: &ConnectionHandle, text: &str) {
        let ack = match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => hub.handle(handle, frame).await,
            Err(err) => {
                tracing::debug!(connection_id = %handle.id, error = %err, "malformed client frame");
                Ack::error(
                    correlation_from_raw(text),
                    &ApplicationError::validation("frame", err.to_string()),
                )
            }
        };
        handle.deliver(ServerEvent::Ack(ack));
    }
}

/// 帧无法解析时尽量取回关联字段，让客户端能对上请求
fn correlation_from_raw(text: &str) -> Correlation {
    let Ok(JsonValue::Object(map)) = serde_json::from_str::<JsonValue>(text) else {
        return Correlation::default();
    };
    let field = |name: &str| map.get(name).and_then(JsonValue::as_str).map(str::to_string);
    Correlation {
        request_id: field("requestId"),
        idempotency_token: field("idempotencyToken"),
    }
}
