use domain::{DomainError, RepositoryError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApplicationError {
    /// 握手凭证无效，连接直接拒绝
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("authorization failed: {action}")]
    Authorization { action: String },
    #[error("validation failed: {field}: {message}")]
    Validation { field: String, message: String },
    #[error("{resource} {id} not found")]
    NotFound { resource: String, id: String },
    #[error("store error: {0}")]
    Store(RepositoryError),
    /// 出站通道已关闭或溢出
    #[error("transport error: {0}")]
    Transport(String),
    #[error("operation timed out")]
    Timeout,
}

impl ApplicationError {
    pub fn authorization(action: impl Into<String>) -> Self {
        Self::Authorization {
            action: action.into(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.to_string(),
        }
    }

    /// 错误 ack 中返回给客户端的机器可读原因
    pub fn code(&self) -> &'static str {
        match self {
            ApplicationError::Authentication(_) => "authentication_error",
            ApplicationError::Authorization { .. } => "authorization_error",
            ApplicationError::Validation { .. } => "validation_error",
            ApplicationError::NotFound { .. } => "not_found",
            ApplicationError::Store(_) => "store_error",
            ApplicationError::Transport(_) => "transport_error",
            ApplicationError::Timeout => "timeout",
        }
    }
}

impl From<DomainError> for ApplicationError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::ValidationError { field, message } => {
                ApplicationError::Validation { field, message }
            }
        }
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        ApplicationError::Store(value)
    }
}
