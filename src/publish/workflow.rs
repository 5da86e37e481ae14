use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::state::{ArtifactState, RemoteArtifact};
use crate::backoff::RetryPolicy;
use crate::clock::Clock;
use crate::graph::{ContainerStatus, GraphError, MediaApi};

/// Why a publish did not produce a published media id.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("container creation failed: {0}")]
    Create(#[source] GraphError),

    #[error("status check for container {creation_id} failed: {source}")]
    Status {
        creation_id: String,
        #[source]
        source: GraphError,
    },

    #[error("container {creation_id} failed: {detail}")]
    ContainerFailed { creation_id: String, detail: String },

    #[error("container {creation_id} not ready after {polls} polls")]
    Timeout { creation_id: String, polls: u32 },

    #[error("container {creation_id} is {state}, only FINISHED containers can be published")]
    NotReady {
        creation_id: String,
        state: ArtifactState,
    },

    #[error("publishing container {creation_id} failed: {source}")]
    Finalize {
        creation_id: String,
        #[source]
        source: GraphError,
    },
}

/// Anything that can turn an image and caption into a published post.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Returns the published media id.
    async fn publish(&self, artifact_ref: &str, caption: &str) -> Result<String, PublishError>;
}

/// Bound on readiness polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub max_polls: u32,
    pub interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            max_polls: 10,
            interval: Duration::from_secs(3),
        }
    }
}

/// Create → poll until ready → finalize, each remote call retried on
/// transient failures.
pub struct PublishWorkflow {
    api: Arc<dyn MediaApi>,
    retry: RetryPolicy,
    poll: PollSettings,
    caption_limit: usize,
    clock: Arc<dyn Clock>,
}

impl PublishWorkflow {
    pub fn new(
        api: Arc<dyn MediaApi>,
        retry: RetryPolicy,
        poll: PollSettings,
        caption_limit: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            api,
            retry,
            poll,
            caption_limit,
            clock,
        }
    }

    /// Submit the image. The caption is cut to the remote limit and the URL
    /// gets a `ts=<millis>` parameter so the remote side refetches it.
    pub async fn create_container(
        &self,
        artifact_ref: &str,
        caption: &str,
    ) -> Result<RemoteArtifact, PublishError> {
        let caption = truncate_caption(caption, self.caption_limit);
        let url = cache_bust(artifact_ref, self.clock.now().timestamp_millis());

        let creation_id = self
            .retry
            .run("create_container", || self.api.create_container(&url, &caption))
            .await
            .map_err(PublishError::Create)?;

        debug!(creation_id = %creation_id, url = %url, "container created");
        Ok(RemoteArtifact::created(creation_id))
    }

    /// Poll the container status until it is `FINISHED`, at most `max_polls`
    /// times with `interval` between queries.
    pub async fn wait_until_ready(
        &self,
        artifact: &mut RemoteArtifact,
        max_polls: u32,
        interval: Duration,
    ) -> Result<(), PublishError> {
        let creation_id = artifact.creation_id.clone();
        artifact.state = ArtifactState::Polling;

        for poll in 1..=max_polls {
            let status = self
                .retry
                .run("container_status", || self.api.container_status(&creation_id))
                .await;
            artifact.polls = poll;

            let status = match status {
                Ok(status) => status,
                Err(source) => {
                    artifact.state = ArtifactState::Error;
                    return Err(PublishError::Status {
                        creation_id,
                        source,
                    });
                }
            };

            match status.code() {
                ContainerStatus::Finished => {
                    artifact.state = ArtifactState::Finished;
                    debug!(creation_id = %creation_id, polls = poll, "container ready");
                    return Ok(());
                }
                ContainerStatus::Error | ContainerStatus::Expired | ContainerStatus::Published => {
                    artifact.state = ArtifactState::Error;
                    let detail = status.detail();
                    warn!(creation_id = %creation_id, detail = %detail, "container rejected");
                    return Err(PublishError::ContainerFailed {
                        creation_id,
                        detail,
                    });
                }
                ContainerStatus::InProgress | ContainerStatus::Unknown(_) => {
                    if poll < max_polls {
                        sleep(interval).await;
                    }
                }
            }
        }

        artifact.state = ArtifactState::Timeout;
        warn!(creation_id = %creation_id, polls = max_polls, "container not ready in time");
        Err(PublishError::Timeout {
            creation_id,
            polls: max_polls,
        })
    }

    /// Publish a `Finished` container. Returns the published media id.
    pub async fn finalize(&self, artifact: &RemoteArtifact) -> Result<String, PublishError> {
        if artifact.state != ArtifactState::Finished {
            return Err(PublishError::NotReady {
                creation_id: artifact.creation_id.clone(),
                state: artifact.state,
            });
        }

        self.retry
            .run("publish_container", || {
                self.api.publish_container(&artifact.creation_id)
            })
            .await
            .map_err(|source| PublishError::Finalize {
                creation_id: artifact.creation_id.clone(),
                source,
            })
    }
}

#[async_trait]
impl Publisher for PublishWorkflow {
    async fn publish(&self, artifact_ref: &str, caption: &str) -> Result<String, PublishError> {
        let mut artifact = self.create_container(artifact_ref, caption).await?;
        self.wait_until_ready(&mut artifact, self.poll.max_polls, self.poll.interval)
            .await?;
        let published_id = self.finalize(&artifact).await?;
        info!(
            creation_id = %artifact.creation_id,
            published_id = %published_id,
            polls = artifact.polls,
            "published"
        );
        Ok(published_id)
    }
}

/// Cut `caption` to at most `limit` characters.
pub fn truncate_caption(caption: &str, limit: usize) -> String {
    match caption.char_indices().nth(limit) {
        Some((end, _)) => caption[..end].to_string(),
        None => caption.to_string(),
    }
}

/// Append `ts=<millis>` unless the URL already carries a numeric `ts`.
pub fn cache_bust(url: &str, millis: i64) -> String {
    if has_numeric_ts(url) {
        return url.to_string();
    }
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}ts={millis}")
}

/// True when `ts=` followed by a digit appears at a word boundary.
fn has_numeric_ts(url: &str) -> bool {
    url.match_indices("ts=").any(|(at, _)| {
        let boundary = url[..at]
            .chars()
            .next_back()
            .is_none_or(|c| !(c.is_alphanumeric() || c == '_'));
        let digit = url[at + 3..].starts_with(|c: char| c.is_ascii_digit());
        boundary && digit
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::graph::ContainerStatusResponse;
    use chrono::{TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted stand-in for the Graph API.
    #[derive(Default)]
    struct MockApi {
        create_errors: Mutex<VecDeque<GraphError>>,
        statuses: Mutex<VecDeque<Result<&'static str, GraphError>>>,
        publish_errors: Mutex<VecDeque<GraphError>>,
        create_calls: AtomicU32,
        status_calls: AtomicU32,
        publish_calls: AtomicU32,
        submitted: Mutex<Option<(String, String)>>,
    }

    impl MockApi {
        fn with_statuses(codes: &[&'static str]) -> Self {
            Self {
                statuses: Mutex::new(codes.iter().map(|c| Ok(*c)).collect()),
                ..Self::default()
            }
        }
    }

    fn api_error(status: u16, code: Option<i64>) -> GraphError {
        GraphError::Api {
            status,
            code,
            subcode: None,
            message: "scripted".into(),
            is_transient: false,
        }
    }

    #[async_trait]
    impl MediaApi for MockApi {
        async fn create_container(&self, image_url: &str, caption: &str) -> Result<String, GraphError> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            *self.submitted.lock().unwrap() = Some((image_url.to_string(), caption.to_string()));
            match self.create_errors.lock().unwrap().pop_front() {
                Some(err) => Err(err),
                None => Ok("c-1".to_string()),
            }
        }

        async fn container_status(&self, _creation_id: &str) -> Result<ContainerStatusResponse, GraphError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            let next = self.statuses.lock().unwrap().pop_front().unwrap_or(Ok("IN_PROGRESS"));
            next.map(|code| ContainerStatusResponse {
                status_code: Some(code.to_string()),
                status: Some(format!("{code}: scripted")),
            })
        }

        async fn publish_container(&self, _creation_id: &str) -> Result<String, GraphError> {
            self.publish_calls.fetch_add(1, Ordering::SeqCst);
            match self.publish_errors.lock().unwrap().pop_front() {
                Some(err) => Err(err),
                None => Ok("m-1".to_string()),
            }
        }
    }

    fn millis_now() -> i64 {
        Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap().timestamp_millis()
    }

    fn workflow(api: Arc<MockApi>, caption_limit: usize) -> PublishWorkflow {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()));
        PublishWorkflow::new(
            api,
            RetryPolicy::default(),
            PollSettings {
                max_polls: 5,
                interval: Duration::from_secs(2),
            },
            caption_limit,
            clock,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn ready_after_third_poll() {
        let api = Arc::new(MockApi::with_statuses(&["CREATED", "CREATED", "FINISHED"]));
        let flow = workflow(api.clone(), 2200);
        let mut artifact = RemoteArtifact::created("c-1");

        flow.wait_until_ready(&mut artifact, 5, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(artifact.state, ArtifactState::Finished);
        assert_eq!(artifact.polls, 3);
        assert_eq!(api.status_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn error_status_fails_on_first_poll() {
        let api = Arc::new(MockApi::with_statuses(&["ERROR"]));
        let flow = workflow(api.clone(), 2200);
        let mut artifact = RemoteArtifact::created("c-1");

        let err = flow
            .wait_until_ready(&mut artifact, 5, Duration::from_secs(2))
            .await
            .unwrap_err();
        match err {
            PublishError::ContainerFailed { creation_id, detail } => {
                assert_eq!(creation_id, "c-1");
                assert_eq!(detail, "ERROR: scripted");
            }
            other => panic!("expected ContainerFailed, got {other:?}"),
        }
        assert_eq!(artifact.state, ArtifactState::Error);
        assert_eq!(api.status_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_after_exactly_max_polls() {
        let api = Arc::new(MockApi::default());
        let flow = workflow(api.clone(), 2200);
        let mut artifact = RemoteArtifact::created("c-1");

        let started = tokio::time::Instant::now();
        let err = flow
            .wait_until_ready(&mut artifact, 4, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Timeout { polls: 4, .. }));
        assert_eq!(artifact.state, ArtifactState::Timeout);
        assert_eq!(api.status_calls.load(Ordering::SeqCst), 4);
        // Sleeps only between polls.
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_status_error_is_retried_within_one_poll() {
        let api = Arc::new(MockApi::default());
        api.statuses
            .lock()
            .unwrap()
            .extend([Err(api_error(503, None)), Ok("FINISHED")]);
        let flow = workflow(api.clone(), 2200);
        let mut artifact = RemoteArtifact::created("c-1");

        flow.wait_until_ready(&mut artifact, 1, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(artifact.polls, 1);
        assert_eq!(api.status_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn finalize_requires_finished() {
        let api = Arc::new(MockApi::default());
        let flow = workflow(api.clone(), 2200);
        let artifact = RemoteArtifact::created("c-1");

        let err = flow.finalize(&artifact).await.unwrap_err();
        assert!(matches!(
            err,
            PublishError::NotReady {
                state: ArtifactState::Created,
                ..
            }
        ));
        assert_eq!(api.publish_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_runs_all_three_steps() {
        let api = Arc::new(MockApi::with_statuses(&["IN_PROGRESS", "FINISHED"]));
        let flow = workflow(api.clone(), 5);

        let id = flow.publish("http://x/a.jpg", "hello world").await.unwrap();
        assert_eq!(id, "m-1");
        assert_eq!(api.create_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.status_calls.load(Ordering::SeqCst), 2);
        assert_eq!(api.publish_calls.load(Ordering::SeqCst), 1);

        let (url, caption) = api.submitted.lock().unwrap().clone().unwrap();
        assert_eq!(url, format!("http://x/a.jpg?ts={}", millis_now()));
        assert_eq!(caption, "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_create_error_is_retried() {
        let api = Arc::new(MockApi::with_statuses(&["FINISHED"]));
        api.create_errors.lock().unwrap().push_back(api_error(500, None));
        let flow = workflow(api.clone(), 2200);

        flow.publish("http://x/a.jpg", "hi").await.unwrap();
        assert_eq!(api.create_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_create_error_is_not_retried() {
        let api = Arc::new(MockApi::default());
        api.create_errors
            .lock()
            .unwrap()
            .push_back(api_error(400, Some(100)));
        let flow = workflow(api.clone(), 2200);

        let err = flow.publish("http://x/a.jpg", "hi").await.unwrap_err();
        assert!(matches!(err, PublishError::Create(_)));
        assert_eq!(api.create_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.status_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn finalize_failure_after_retries() {
        let api = Arc::new(MockApi::with_statuses(&["FINISHED"]));
        api.publish_errors
            .lock()
            .unwrap()
            .extend([api_error(500, None), api_error(500, None), api_error(500, None)]);
        let flow = workflow(api.clone(), 2200);

        let err = flow.publish("http://x/a.jpg", "hi").await.unwrap_err();
        assert!(matches!(err, PublishError::Finalize { .. }));
        assert_eq!(api.publish_calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn truncate_counts_characters() {
        assert_eq!(truncate_caption("short", 10), "short");
        assert_eq!(truncate_caption("exactly", 7), "exactly");
        assert_eq!(truncate_caption("çãõé🙂x", 5), "çãõé🙂");
        assert_eq!(truncate_caption("abc", 0), "");
    }

    #[test]
    fn cache_bust_appends_timestamp() {
        assert_eq!(cache_bust("http://x/a.jpg", 42), "http://x/a.jpg?ts=42");
        assert_eq!(cache_bust("http://x/a.jpg?w=1", 42), "http://x/a.jpg?w=1&ts=42");
    }

    #[test]
    fn cache_bust_keeps_existing_timestamp() {
        assert_eq!(cache_bust("http://x/a.jpg?ts=7", 42), "http://x/a.jpg?ts=7");
        assert_eq!(cache_bust("http://x/a.jpg?w=1&ts=7", 42), "http://x/a.jpg?w=1&ts=7");
        // Not a numeric ts, or not at a word boundary.
        assert_eq!(cache_bust("http://x/a.jpg?ts=now", 42), "http://x/a.jpg?ts=now&ts=42");
        assert_eq!(cache_bust("http://x/a.jpg?posts=7", 42), "http://x/a.jpg?posts=7&ts=42");
    }
}
