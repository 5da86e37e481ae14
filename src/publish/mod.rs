//! The remote publish workflow: create a media container, wait for it to
//! be processed, publish it.

mod state;
mod workflow;

pub use state::{ArtifactState, RemoteArtifact};
pub use workflow::{PollSettings, PublishError, PublishWorkflow, Publisher, cache_bust, truncate_caption};
