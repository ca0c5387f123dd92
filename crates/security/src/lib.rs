//! Security module for taskforge: credential sealing and path sandboxing.
//!
//! Provides:
//! - **Secrets**: AES-256-GCM sealing of provider credentials at rest
//! - **Path resolution**: confine tool file access to a task's root directory

pub mod path;
pub mod secrets;

pub use path::{PathValidationError, resolve_in_root};
pub use secrets::{EncryptedValue, SecretError, SecretsManager};
