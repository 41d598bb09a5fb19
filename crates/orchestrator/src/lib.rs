//! Resumable three-agent delivery orchestrator.
//!
//! Drives features from a durable backlog through remote architecture,
//! development, and review agent sessions, ending in a merged PR. Each
//! invocation is short-lived and bounded by a run deadline; the remote
//! sessions outlive it, so every stage persists a resumption anchor and a
//! repeated invocation picks up exactly where the last one stopped.

pub mod backlog;
pub mod config;
pub mod engine;
pub mod error;
pub mod extract;
pub mod github;
pub mod intake;
pub mod model;
pub mod poller;
pub mod prompts;
pub mod session;
pub mod status;
pub mod vcs;

pub use backlog::{BacklogStore, ReconcileMode};
pub use config::Config;
pub use engine::{Collaborators, Engine};
pub use model::{Feature, FeatureStatus, StageAnchor, Verdict};
