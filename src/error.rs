use thiserror::Error;

use crate::platform::AccessMode;

#[derive(Error, Debug)]
pub enum PyletError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    // Sandbox lifecycle errors
    #[error("Sandbox initialization failed: {0}")]
    SandboxInit(String),

    // Capability grant errors
    #[error("{mode} access to directory not granted")]
    PermissionDenied { mode: AccessMode },

    #[error("Directory selection cancelled")]
    PromptCancelled,

    // Per-run pipeline errors
    #[error("Failed to install package '{package}': {reason}")]
    Install { package: String, reason: String },

    #[error("Failed to mount directory at '{path}': {reason}")]
    Mount { path: String, reason: String },

    #[error("Mount path does not exist: {path}")]
    MountPathNotFound { path: String },

    #[error("Script execution failed: {0}")]
    Exec(String),

    #[error("Failed to sync mount '{path}': {reason}")]
    Sync { path: String, reason: String },

    #[error("Failed to collect text input: {0}")]
    Input(String),

    // Run boundary errors
    #[error("A run is already in progress")]
    RunInFlight,

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // Generic wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PyletError {
    /// Fatal errors disable the session entirely; everything else is a
    /// per-run failure the user may retry by re-invoking the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SandboxInit(_))
    }
}

pub type Result<T> = std::result::Result<T, PyletError>;
