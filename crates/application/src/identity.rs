use async_trait::async_trait;
use domain::UserId;

use crate::error::ApplicationError;

/// 身份端口：在连接被接纳之前把握手凭证解析为用户身份。
///
/// 失败时必须返回 `ApplicationError::Authentication`。
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<UserId, ApplicationError>;
}
