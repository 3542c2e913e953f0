//! Configuration and authentication collaborators for Bitloops clients.
//!
//! Holds the client configuration (server, workspace, auth mode), the
//! credential store interface with an in-memory implementation, and the
//! provider that turns both into request headers.

pub mod config;
pub mod headers;
pub mod store;

pub use config::{AuthConfig, ClientConfig, ConfigError, ReconnectSettings};
pub use headers::{AuthHeaderProvider, AuthHeaders, StoreHeaderProvider};
pub use store::{CredentialStore, MemoryStore, StoredUser};
