//! Web API 层。
//!
//! 提供 Axum 路由，负责 WebSocket 握手认证、帧编解码，并把事件委托给实时中枢。

mod auth;
mod error;
mod routes;
mod state;
mod ws_connection;

pub use auth::{extract_credential, Claims, JwtService, AUTH_TOKEN_HEADER};
pub use config::JwtConfig;
pub use error::ApiError;
pub use routes::router;
pub use state::AppState;
pub use ws_connection::RealtimeConnection;
