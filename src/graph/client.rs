use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::error::GraphError;
use super::types::{ContainerStatusResponse, GraphErrorEnvelope, IdResponse, Profile};
use super::MediaApi;
use crate::config::GraphConfig;

const PROFILE_FIELDS: &str = "id,username,followers_count,media_count";

/// Longest raw body kept in an error message when the body is not Graph JSON.
const MAX_ERROR_BODY: usize = 512;

pub struct GraphClient {
    client: Client,
    endpoint: String,
    user_id: String,
    access_token: String,
}

impl GraphClient {
    pub fn new(config: &GraphConfig) -> Result<Self, GraphError> {
        if config.user_id.trim().is_empty() {
            return Err(GraphError::NotConfigured("graph.user_id"));
        }
        if config.access_token.trim().is_empty() {
            return Err(GraphError::NotConfigured("graph.access_token"));
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint(),
            user_id: config.user_id.trim().to_string(),
            access_token: config.access_token.trim().to_string(),
        })
    }

    /// Account profile, used as a credentials check.
    pub async fn profile(&self) -> Result<Profile, GraphError> {
        let request = self
            .client
            .get(self.url(&self.user_id))
            .query(&[("fields", PROFILE_FIELDS)]);
        self.send(request).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, GraphError> {
        let response = request.bearer_auth(&self.access_token).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(api_error(status.as_u16(), &body));
        }
        Ok(serde_json::from_str(&body)?)
    }
}

/// Build an [`GraphError::Api`] from a failed response body.
fn api_error(status: u16, body: &str) -> GraphError {
    match serde_json::from_str::<GraphErrorEnvelope>(body) {
        Ok(envelope) => {
            let error = envelope.error;
            GraphError::Api {
                status,
                code: error.code,
                subcode: error.error_subcode,
                message: error.message,
                is_transient: error.is_transient,
            }
        }
        Err(_) => {
            let message = if body.trim().is_empty() {
                "unknown error".to_string()
            } else {
                body.chars().take(MAX_ERROR_BODY).collect()
            };
            GraphError::Api {
                status,
                code: None,
                subcode: None,
                message,
                is_transient: false,
            }
        }
    }
}

#[async_trait]
impl MediaApi for GraphClient {
    async fn create_container(&self, image_url: &str, caption: &str) -> Result<String, GraphError> {
        let request = self
            .client
            .post(self.url(&format!("{}/media", self.user_id)))
            .query(&[("image_url", image_url), ("caption", caption)]);
        let created: IdResponse = self.send(request).await?;
        let id = created.id.ok_or(GraphError::MissingField("id"))?;
        debug!(creation_id = %id, "container created");
        Ok(id)
    }

    async fn container_status(&self, creation_id: &str) -> Result<ContainerStatusResponse, GraphError> {
        let request = self
            .client
            .get(self.url(creation_id))
            .query(&[("fields", "status_code,status")]);
        self.send(request).await
    }

    async fn publish_container(&self, creation_id: &str) -> Result<String, GraphError> {
        let request = self
            .client
            .post(self.url(&format!("{}/media_publish", self.user_id)))
            .query(&[("creation_id", creation_id)]);
        let published: IdResponse = self.send(request).await?;
        published.id.ok_or(GraphError::MissingField("id"))
    }
}
