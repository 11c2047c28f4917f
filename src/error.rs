//! Error types for channel-fabric.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("channel {0} is not active in this process")]
    ChannelNotActive(String),

    #[error("invalid channel name {name:?}: {reason}")]
    InvalidChannel { name: String, reason: &'static str },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("queue engine error: {0}")]
    Engine(String),

    #[error("fatal condition on channel {channel}: {message}")]
    Fatal { channel: String, message: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
