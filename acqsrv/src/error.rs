//! Service error type

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AcqError>;

#[derive(Debug, Error)]
pub enum AcqError {
    #[error(transparent)]
    Link(#[from] gridflux_comlink::LinkError),

    #[error("catalogue spec invalid: {0}")]
    Spec(#[from] gridflux_model::SpecError),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no factory registered for plugin type {0:?}")]
    NoFactory(String),

    #[error("factory for plugin type {0:?} already registered")]
    DuplicateFactory(String),

    #[error("no instance {plugin}/{id}")]
    NoInstance { plugin: String, id: String },

    #[error("instance {plugin}/{id} already exists")]
    DuplicateInstance { plugin: String, id: String },

    #[error("parent scope cancelled")]
    Cancelled,

    #[error("broker error: {0}")]
    Broker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AcqError {
    pub fn config(msg: impl Into<String>) -> Self {
        AcqError::Config(msg.into())
    }
}
