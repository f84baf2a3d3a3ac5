use std::sync::Arc;

use application::RealtimeHub;

use crate::JwtService;

#[derive(Clone)]
pub struct AppState {
    pub hub: RealtimeHub,
    pub jwt_service: Arc<JwtService>,
}

impl AppState {
    pub fn new(hub: RealtimeHub, jwt_service: Arc<JwtService>) -> Self {
        Self { hub, jwt_service }
    }
}
