use std::fmt;

use serde::{Deserialize, Serialize};

/// Where an in-flight remote artifact is in the publish workflow.
///
/// `Created → Polling → {Finished | Error | Timeout}`. Only `Finished` may be
/// finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactState {
    Created,
    Polling,
    Finished,
    Error,
    Timeout,
}

impl ArtifactState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ArtifactState::Finished | ArtifactState::Error | ArtifactState::Timeout
        )
    }
}

impl fmt::Display for ArtifactState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactState::Created => write!(f, "CREATED"),
            ArtifactState::Polling => write!(f, "POLLING"),
            ArtifactState::Finished => write!(f, "FINISHED"),
            ArtifactState::Error => write!(f, "ERROR"),
            ArtifactState::Timeout => write!(f, "TIMEOUT"),
        }
    }
}

/// A media container created on the remote side. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteArtifact {
    pub creation_id: String,
    pub state: ArtifactState,
    /// Status queries made so far.
    pub polls: u32,
}

impl RemoteArtifact {
    pub fn created(creation_id: impl Into<String>) -> Self {
        Self {
            creation_id: creation_id.into(),
            state: ArtifactState::Created,
            polls: 0,
        }
    }
}
