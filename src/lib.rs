#![doc = include_str!("../README.md")]

pub mod client;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod pipeline;
pub mod refresh;
pub mod request;
pub mod retry;
pub mod storage;
pub mod store;
pub mod types;

// Re-exports for convenient access
pub use client::{AuthClient, LoginCredentials, Registration};
pub use config::ClientConfig;
pub use error::{Error, FieldErrors};
pub use lifecycle::{EndReason, LifecycleState, SessionEvent, SessionLifecycle};
pub use pipeline::RequestPipeline;
pub use refresh::{RefreshCoordinator, RefreshResponse};
pub use request::{ApiRequest, PendingRequest, attach_credential};
pub use retry::{RetryDecision, RetryPolicy};
#[cfg(feature = "file-storage")]
pub use storage::FileStorage;
pub use storage::{MemoryStorage, SessionStorage};
pub use store::CredentialStore;
pub use types::{AccessToken, CredentialPair, Principal, PrincipalId, RefreshToken, Role, Session};
