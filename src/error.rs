//! Error types for the fingerprinting engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to decode audio {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("decoded audio is empty")]
    EmptyAudio,

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("io error opening {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn decode(path: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        EngineError::Decode {
            path: path.into(),
            source: source.into(),
        }
    }

    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        EngineError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for errors local to one track; the caller must not abort a batch on these.
    pub fn is_per_track(&self) -> bool {
        matches!(
            self,
            EngineError::Decode { .. } | EngineError::EmptyAudio | EngineError::Io { .. }
        )
    }
}
