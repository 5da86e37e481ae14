use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::key::derive_key;
use super::store::QueuePolicy;

/// Lifecycle status of a scheduled publish.
///
/// `Queued → Publishing → Done`, or back to `Queued` on failure. `Done` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Publishing,
    Done,
    /// Dead letter: the attempt budget ran out.
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Publishing => "publishing",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "publishing" => Ok(JobStatus::Publishing),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(format!("invalid job status: {s}")),
        }
    }
}

/// Rejected enqueue input. Never stored, never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid image url {url:?}: {reason}")]
    InvalidArtifactRef { url: String, reason: String },

    #[error("invalid publish_at {value:?} (expected RFC 3339, e.g. 2025-07-24T23:06:00Z)")]
    InvalidPublishAt { value: String },
}

/// A job state change that the lifecycle forbids.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("job {key}: cannot move from {from} to {to}")]
pub struct TransitionError {
    pub key: String,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// A validated enqueue request with its idempotency key already derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub key: String,
    pub artifact_ref: String,
    pub caption: String,
    pub publish_at: DateTime<Utc>,
}

impl NewJob {
    /// Validate the raw request fields and derive the key.
    ///
    /// The key covers the trimmed URL and `publish_at` exactly as written,
    /// so two spellings of the same instant are two different jobs.
    pub fn new(artifact_ref: &str, caption: &str, publish_at: &str) -> Result<Self, ValidationError> {
        if artifact_ref.trim().is_empty() {
            return Err(ValidationError::MissingField("image_url"));
        }
        if caption.trim().is_empty() {
            return Err(ValidationError::MissingField("caption"));
        }
        if publish_at.trim().is_empty() {
            return Err(ValidationError::MissingField("publish_at"));
        }

        let artifact_ref = artifact_ref.trim();
        let publish_at = publish_at.trim();

        let url = Url::parse(artifact_ref).map_err(|e| ValidationError::InvalidArtifactRef {
            url: artifact_ref.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ValidationError::InvalidArtifactRef {
                url: artifact_ref.to_string(),
                reason: format!("unsupported scheme {}", url.scheme()),
            });
        }

        let parsed = DateTime::parse_from_rfc3339(publish_at).map_err(|_| {
            ValidationError::InvalidPublishAt {
                value: publish_at.to_string(),
            }
        })?;

        Ok(Self {
            key: derive_key(artifact_ref, caption, publish_at),
            artifact_ref: artifact_ref.to_string(),
            caption: caption.to_string(),
            publish_at: parsed.with_timezone(&Utc),
        })
    }
}

/// What a claimer gets back: enough to publish and to report the outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub key: String,
    pub artifact_ref: String,
    pub caption: String,
    /// Failed cycles before this claim.
    pub attempts: u32,
    pub claimed_at: DateTime<Utc>,
    /// Identifies this claim. A reclaimed and re-claimed job gets a new one.
    pub claim_id: String,
}

/// Result of an enqueue call. Duplicates are reported, not raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOutcome {
    pub queued: bool,
    pub key: String,
}

/// Where a failed job went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum FailureDisposition {
    Requeued {
        attempts: u32,
        retry_at: DateTime<Utc>,
    },
    DeadLettered {
        attempts: u32,
    },
    /// The claim was lost to lease expiry; nothing was recorded.
    Superseded,
}

/// A unit of deferred publishing work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub key: String,
    pub artifact_ref: String,
    pub caption: String,
    pub publish_at: DateTime<Utc>,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub published_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expire_at: Option<DateTime<Utc>>,
    /// Token of the current claim while `Publishing`.
    pub claim_id: Option<String>,
}

impl Job {
    pub fn from_new(new: NewJob, now: DateTime<Utc>, policy: &QueuePolicy) -> Self {
        Self {
            key: new.key,
            artifact_ref: new.artifact_ref,
            caption: new.caption,
            publish_at: new.publish_at,
            status: JobStatus::Queued,
            attempts: 0,
            last_error: None,
            published_id: None,
            created_at: now,
            updated_at: now,
            expire_at: policy.retention.and_then(|ttl| now.checked_add_signed(ttl)),
            claim_id: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.publish_at <= now
    }

    /// Whether `handle` still owns the current claim.
    pub fn is_claimed_by(&self, handle: &JobHandle) -> bool {
        self.status == JobStatus::Publishing
            && self.claim_id.as_deref() == Some(handle.claim_id.as_str())
    }

    fn require(&self, from: JobStatus, to: JobStatus) -> Result<(), TransitionError> {
        if self.status == from {
            Ok(())
        } else {
            Err(TransitionError {
                key: self.key.clone(),
                from: self.status,
                to,
            })
        }
    }

    /// `Queued → Publishing`.
    pub fn claim(&mut self, now: DateTime<Utc>) -> Result<JobHandle, TransitionError> {
        self.require(JobStatus::Queued, JobStatus::Publishing)?;
        let claim_id = Uuid::new_v4().to_string();
        self.status = JobStatus::Publishing;
        self.updated_at = now;
        self.claim_id = Some(claim_id.clone());
        Ok(JobHandle {
            key: self.key.clone(),
            artifact_ref: self.artifact_ref.clone(),
            caption: self.caption.clone(),
            attempts: self.attempts,
            claimed_at: now,
            claim_id,
        })
    }

    /// Mark as published. Returns `false` when the job was already done.
    ///
    /// A job whose lease was reclaimed (back in `Queued`) may still complete:
    /// the remote side effect already happened.
    pub fn complete(&mut self, published_id: &str, now: DateTime<Utc>) -> Result<bool, TransitionError> {
        match self.status {
            JobStatus::Done => Ok(false),
            JobStatus::Failed => Err(TransitionError {
                key: self.key.clone(),
                from: self.status,
                to: JobStatus::Done,
            }),
            JobStatus::Queued | JobStatus::Publishing => {
                self.status = JobStatus::Done;
                self.published_id = Some(published_id.to_string());
                self.last_error = None;
                self.updated_at = now;
                self.claim_id = None;
                Ok(true)
            }
        }
    }

    /// `Publishing → Queued` with backoff, or `Publishing → Failed` once the
    /// attempt budget is spent.
    ///
    /// A handle whose claim was reclaimed gets [`FailureDisposition::Superseded`]
    /// and the job is left alone: another claimer may be publishing it.
    pub fn fail(
        &mut self,
        handle: &JobHandle,
        error: &str,
        policy: &QueuePolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureDisposition, TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError {
                key: self.key.clone(),
                from: self.status,
                to: JobStatus::Queued,
            });
        }
        if !self.is_claimed_by(handle) {
            return Ok(FailureDisposition::Superseded);
        }

        self.claim_id = None;
        self.attempts = self.attempts.saturating_add(1);
        self.last_error = Some(error.to_string());
        self.updated_at = now;

        if policy.max_attempts.is_some_and(|max| self.attempts >= max) {
            self.status = JobStatus::Failed;
            return Ok(FailureDisposition::DeadLettered {
                attempts: self.attempts,
            });
        }

        let retry_at = policy.retry_at(self.attempts, now).max(self.publish_at);
        self.publish_at = retry_at;
        self.status = JobStatus::Queued;
        Ok(FailureDisposition::Requeued {
            attempts: self.attempts,
            retry_at,
        })
    }

    /// Lease expiry: a claimer vanished mid-publish. Back to `Queued` without
    /// counting an attempt.
    pub fn release_stale(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.require(JobStatus::Publishing, JobStatus::Queued)?;
        self.status = JobStatus::Queued;
        self.claim_id = None;
        self.last_error = Some("lease expired".to_string());
        self.updated_at = now;
        Ok(())
    }
}
