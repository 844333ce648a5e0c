use thiserror::Error;

pub type Result<T> = std::result::Result<T, SandboxError>;

/// Errors surfaced by the sandbox manager and its compilers.
///
/// Cleanup noise ("already closed" proxies, ESRCH on bridge kill) is
/// swallowed at the call sites and never reaches this enum.
#[derive(Debug, Clone, Error)]
pub enum SandboxError {
    #[error("unsupported platform: {0} (only macos and linux are supported)")]
    UnsupportedPlatform(String),

    #[error("missing required tools: {}", tools.join(", "))]
    MissingDependency { tools: Vec<String> },

    #[error("invalid configuration:\n{}", diagnostics.join("\n"))]
    InvalidConfig { diagnostics: Vec<String> },

    #[error("network bridge failed to start: {0}")]
    BridgeStartup(String),

    #[error("proxy failed to start: {0}")]
    ProxyStartup(String),

    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error("{0}")]
    Io(String),
}

impl From<std::io::Error> for SandboxError {
    fn from(err: std::io::Error) -> Self {
        SandboxError::Io(err.to_string())
    }
}
