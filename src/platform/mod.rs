use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{PyletError, Result};

/// Logical role a mounted directory plays for the script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MountRole {
    /// Source data the script reads.
    Input,
    /// Directory the script writes results into.
    Output,
}

impl MountRole {
    /// The access mode a grant for this role must obtain.
    pub fn access_mode(self) -> AccessMode {
        match self {
            Self::Input => AccessMode::ReadOnly,
            Self::Output => AccessMode::ReadWrite,
        }
    }
}

impl fmt::Display for MountRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// Access mode requested on a host directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadOnly => write!(f, "read"),
            Self::ReadWrite => write!(f, "read-write"),
        }
    }
}

/// Outcome of an access request on a host directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Granted,
    Denied,
}

/// Opaque reference to a host directory selected through the platform.
#[derive(Debug, Clone)]
pub struct HostDirHandle {
    path: PathBuf,
}

impl HostDirHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Platform directory-access layer.
///
/// Abstracts the directory selection prompt and the permission check so the
/// orchestrator never touches the host file system directly.
#[async_trait]
pub trait HostPlatform: Send + Sync {
    /// Ask the user for a directory to serve the given role.
    /// Cancellation surfaces as `PromptCancelled`.
    async fn prompt_for_directory(&self, role: MountRole) -> Result<HostDirHandle>;

    /// Request the given access mode on a previously selected directory.
    async fn request_access(
        &self,
        handle: &HostDirHandle,
        mode: AccessMode,
    ) -> Result<AccessDecision>;

    /// Collect ad-hoc free text from the user.
    async fn collect_text_input(&self) -> Result<String>;
}

/// Negotiate access to a host directory for the given role.
///
/// Prompts for a directory, then requests the role's access mode on it.
/// Both a refused grant and a cancelled prompt surface as
/// `PermissionDenied` carrying the requested mode.
pub async fn grant_access(platform: &dyn HostPlatform, role: MountRole) -> Result<HostDirHandle> {
    let mode = role.access_mode();

    let handle = match platform.prompt_for_directory(role).await {
        Ok(handle) => handle,
        Err(PyletError::PromptCancelled) => {
            return Err(PyletError::PermissionDenied { mode });
        }
        Err(e) => return Err(e),
    };

    match platform.request_access(&handle, mode).await? {
        AccessDecision::Granted => Ok(handle),
        AccessDecision::Denied => Err(PyletError::PermissionDenied { mode }),
    }
}

/// Native platform implementation.
///
/// Directories pre-configured via the CLI or config file are used without
/// prompting; otherwise the user is asked on the terminal. Access is decided
/// by probing the file system: a directory is readable if it can be listed,
/// and writable if a probe file can be created and removed inside it.
pub struct NativePlatform {
    input_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    interactive: bool,
}

impl NativePlatform {
    pub fn new(input_dir: Option<PathBuf>, output_dir: Option<PathBuf>) -> Self {
        Self {
            input_dir,
            output_dir,
            interactive: true,
        }
    }

    /// Disable terminal prompts; unresolved directories and text input then
    /// surface as cancellations.
    pub fn non_interactive(mut self) -> Self {
        self.interactive = false;
        self
    }

    fn configured_dir(&self, role: MountRole) -> Option<&PathBuf> {
        match role {
            MountRole::Input => self.input_dir.as_ref(),
            MountRole::Output => self.output_dir.as_ref(),
        }
    }

    fn read_prompt_line(prompt: String) -> Result<String> {
        let mut stderr = std::io::stderr();
        stderr.write_all(prompt.as_bytes())?;
        stderr.flush()?;

        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        Ok(line.trim().to_string())
    }
}

#[async_trait]
impl HostPlatform for NativePlatform {
    async fn prompt_for_directory(&self, role: MountRole) -> Result<HostDirHandle> {
        if let Some(dir) = self.configured_dir(role) {
            debug!(role = %role, path = %dir.display(), "Using pre-configured directory");
            return Ok(HostDirHandle::new(dir.clone()));
        }

        if !self.interactive {
            return Err(PyletError::PromptCancelled);
        }

        let prompt = format!("Select {} directory (path, empty to cancel): ", role);
        let answer = tokio::task::spawn_blocking(move || Self::read_prompt_line(prompt))
            .await
            .map_err(|e| PyletError::Input(e.to_string()))??;

        if answer.is_empty() {
            return Err(PyletError::PromptCancelled);
        }

        Ok(HostDirHandle::new(answer))
    }

    async fn request_access(
        &self,
        handle: &HostDirHandle,
        mode: AccessMode,
    ) -> Result<AccessDecision> {
        let path = handle.path();

        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Directory not accessible");
                return Ok(AccessDecision::Denied);
            }
        };

        if !metadata.is_dir() {
            debug!(path = %path.display(), "Not a directory");
            return Ok(AccessDecision::Denied);
        }

        if tokio::fs::read_dir(path).await.is_err() {
            return Ok(AccessDecision::Denied);
        }

        if mode == AccessMode::ReadWrite {
            let probe = path.join(".pylet-write-probe");
            if tokio::fs::write(&probe, b"").await.is_err() {
                return Ok(AccessDecision::Denied);
            }
            let _ = tokio::fs::remove_file(&probe).await;
        }

        Ok(AccessDecision::Granted)
    }

    async fn collect_text_input(&self) -> Result<String> {
        if !self.interactive {
            return Err(PyletError::Input(
                "no text input provided and prompts are disabled".to_string(),
            ));
        }

        let prompt = "Text input: ".to_string();
        tokio::task::spawn_blocking(move || Self::read_prompt_line(prompt))
            .await
            .map_err(|e| PyletError::Input(e.to_string()))?
    }
}
