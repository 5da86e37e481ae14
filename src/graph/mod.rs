//! Instagram Graph API: the remote side of the publish workflow.

pub mod client;
pub mod error;
pub mod types;

use async_trait::async_trait;

pub use client::GraphClient;
pub use error::GraphError;
pub use types::{ContainerStatus, ContainerStatusResponse, Profile};

/// The three remote calls a publish needs. Each call is made once; retrying
/// is the caller's business.
#[async_trait]
pub trait MediaApi: Send + Sync {
    /// Create a media container. Returns the creation id.
    async fn create_container(&self, image_url: &str, caption: &str) -> Result<String, GraphError>;

    async fn container_status(&self, creation_id: &str) -> Result<ContainerStatusResponse, GraphError>;

    /// Publish a finished container. Returns the published media id.
    async fn publish_container(&self, creation_id: &str) -> Result<String, GraphError>;
}
