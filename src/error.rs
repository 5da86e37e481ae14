use thiserror::Error;

use crate::graph::GraphError;
use crate::publish::PublishError;
use crate::queue::{StoreError, ValidationError};

#[derive(Debug, Error)]
pub enum PostqueueError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid job: {0}")]
    Validation(#[from] ValidationError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Graph API error: {0}")]
    Graph(#[from] GraphError),

    #[error("Publish failed: {0}")]
    Publish(#[from] PublishError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}
