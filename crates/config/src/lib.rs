//! 统一配置中心
//!
//! 提供实时中继的全局配置管理，包括：
//! - 服务监听地址
//! - JWT认证
//! - 实时通道参数（在线宽限期、出站队列、ack 超时等）
//! - 内存存储的种子数据
//!
//! 加载顺序：内置默认值 -> `APP_CONFIG_FILE` 指定的文件 -> `APP_*` 环境变量。

use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// 全局应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AppConfig {
    /// 服务配置
    #[validate(nested)]
    pub server: ServerConfig,
    /// JWT认证配置
    #[validate(nested)]
    pub jwt: JwtConfig,
    /// 实时通道配置
    #[validate(nested)]
    pub realtime: RealtimeConfig,
    /// 种子数据
    #[serde(default)]
    pub seed: SeedConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
}

/// JWT配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct JwtConfig {
    /// 至少 256 位
    #[validate(length(min = 32, message = "JWT secret must be at least 32 characters long"))]
    pub secret: String,
    #[validate(range(min = 1))]
    pub expiration_hours: i64,
}

/// 实时通道配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RealtimeConfig {
    /// 最后一条连接断开后确认离线前的等待时间
    pub presence_grace_ms: u64,
    /// 每条连接的出站队列容量，溢出即强制断开
    #[validate(range(min = 1))]
    pub outbound_queue_capacity: usize,
    /// 单个客户端请求的 ack 超时
    #[validate(range(min = 1))]
    pub ack_timeout_ms: u64,
    #[validate(range(min = 1))]
    pub max_content_length: usize,
    /// 已读账本乐观并发冲突时的重试次数
    #[validate(range(min = 1))]
    pub read_retry_limit: u32,
    /// 通知中消息预览的字符数
    #[serde(default = "default_preview_chars")]
    pub notification_preview_chars: usize,
}

fn default_preview_chars() -> usize {
    100
}

/// 内存存储的种子数据配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedConfig {
    /// JSON 文件，包含会话与测试用户令牌
    #[serde(default)]
    pub file: Option<String>,
}

impl RealtimeConfig {
    pub fn presence_grace(&self) -> Duration {
        Duration::from_millis(self.presence_grace_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            presence_grace_ms: 5_000,
            outbound_queue_capacity: 256,
            ack_timeout_ms: 10_000,
            max_content_length: 1_000,
            read_retry_limit: 5,
            notification_preview_chars: default_preview_chars(),
        }
    }
}

impl Default for AppConfig {
    /// 默认配置只适合开发环境，生产环境必须覆盖 `jwt.secret`
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 8080,
            },
            jwt: JwtConfig {
                secret: "dev-secret-key-not-for-production-use-minimum-32-chars".into(),
                expiration_hours: 24,
            },
            realtime: RealtimeConfig::default(),
            seed: SeedConfig::default(),
        }
    }
}

impl AppConfig {
    /// 按 默认值 -> 配置文件 -> 环境变量 的顺序加载并校验
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        if let Ok(path) = std::env::var("APP_CONFIG_FILE") {
            figment = if path.ends_with(".yml") || path.ends_with(".yaml") {
                figment.merge(Yaml::file(path))
            } else if path.ends_with(".json") {
                figment.merge(Json::file(path))
            } else {
                figment.merge(Toml::file(path))
            };
        }
        Self::from_figment(figment.merge(Env::prefixed("APP_").split("__")))
    }

    /// 从任意 figment 来源提取配置
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: AppConfig = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// 在默认值之上叠加一段 TOML 文本，主要用于测试
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Self::from_figment(
            Figment::from(Serialized::defaults(AppConfig::default())).merge(Toml::string(text)),
        )
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// 用于日志输出的脱敏表示
    pub fn sanitize(&self) -> String {
        let mut redacted = self.clone();
        redacted.jwt.secret = "[REDACTED]".into();
        format!("{:?}", redacted)
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Source(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(#[from] validator::ValidationErrors),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.realtime.presence_grace(), Duration::from_secs(5));
        assert_eq!(config.realtime.outbound_queue_capacity, 256);
    }

    #[test]
    fn toml_overrides_nested_values() {
        let config = AppConfig::from_toml_str(
            r#"
            [realtime]
            presence_grace_ms = 50
            outbound_queue_capacity = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.realtime.presence_grace_ms, 50);
        assert_eq!(config.realtime.outbound_queue_capacity, 4);
        assert_eq!(config.realtime.max_content_length, 1_000);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn short_jwt_secret_is_rejected() {
        let result = AppConfig::from_toml_str(
            r#"
            [jwt]
            secret = "short"
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_queue_capacity_is_rejected() {
        let result = AppConfig::from_toml_str(
            r#"
            [realtime]
            outbound_queue_capacity = 0
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn sanitize_hides_secret() {
        let config = AppConfig::default();
        assert!(!config.sanitize().contains(&config.jwt.secret));
    }
}
