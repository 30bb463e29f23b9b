//! Outbox 统一错误定义
//!
//! 聚焦入队校验、序列化、存储、投递与配置等最小必要集合，
//! 便于在各实现层统一转换为 `OutboxError`。
//!
use std::time::Duration;
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum OutboxError {
    // --- 入队校验 ---
    #[error("validation error: {reason}")]
    Validation { reason: String },

    // --- 序列化 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },

    // --- 存储 ---
    #[error("database error: {reason}")]
    Database { reason: String },
    #[error("not found: {reason}")]
    NotFound { reason: String },

    // --- 投递 ---
    #[error("publish failed: {reason}")]
    Publish { reason: String },
    #[error("broker confirm timed out after {timeout:?}")]
    ConfirmTimeout { timeout: Duration },

    // --- 配置 ---
    #[error("invalid config: {reason}")]
    Config { reason: String },
}

impl OutboxError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub fn database(reason: impl Into<String>) -> Self {
        Self::Database {
            reason: reason.into(),
        }
    }
}

/// 统一 Result 类型别名
pub type OutboxResult<T> = Result<T, OutboxError>;

// 允许在存储实现中直接使用 `?` 将 sqlx 错误转换为 OutboxError
#[cfg(feature = "postgres")]
impl From<sqlx::Error> for OutboxError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => OutboxError::NotFound {
                reason: "row not found".to_string(),
            },
            other => OutboxError::Database {
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_keeps_reason() {
        let err = OutboxError::database("connection lost");
        assert_eq!(err.to_string(), "database error: connection lost");

        let err = OutboxError::ConfirmTimeout {
            timeout: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "broker confirm timed out after 250ms");
    }
}
