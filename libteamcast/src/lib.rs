//! Teamcast - team social accounts and multi-platform publishing
//!
//! This library holds the credential vault for a team's connected social
//! accounts and the orchestrator that publishes one post to several
//! platforms, tracking each platform's outcome separately.

pub mod accounts;
pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod logging;
pub mod outbox;
pub mod permissions;
pub mod platforms;
pub mod posts;
pub mod publisher;
pub mod queue;
pub mod rate_limiter;
pub mod refresh;
pub mod repository;
pub mod service;
pub mod types;

// Re-export commonly used types
pub use accounts::{Account, AccountStatus, Credentials};
pub use config::Config;
pub use credentials::{CredentialVault, KeyRing};
pub use db::Database;
pub use error::{Result, TeamcastError};
pub use permissions::{Capability, Member, Role};
pub use posts::{Post, PostStatus, PublishOutcome, PublishingRecord};
pub use service::TeamcastService;
pub use types::{Content, Platform};
