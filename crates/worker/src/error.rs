use crate::config::ConfigError;
use crate::registry::RegistryError;
use crate::scope::ScopeError;

/// Startup failures. The host refuses to start on any of these.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("shared scope unavailable: {0}")]
    Scope(#[from] ScopeError),

    #[error("no handlers registered")]
    EmptyRegistry,
}
