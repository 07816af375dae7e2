//! Common types for tunecheck: errors, targets, polling, configuration and
//! Kubernetes utilities shared by the engine and the CLI.

#![deny(missing_docs)]

pub mod config;
pub mod cpuset;
pub mod error;
pub mod kube_utils;
pub mod poll;
pub mod retry;
pub mod target;

pub use error::{Error, ScenarioFailure};
pub use target::Target;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager name used for every write this suite makes
pub const FIELD_MANAGER: &str = "tunecheck";

/// Label put on every object the suite creates, so leftovers can be found
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Install the process-wide rustls crypto provider.
///
/// Must run before the first kube client is built. Repeated calls are harmless.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}
