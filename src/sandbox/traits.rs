use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::Result;
use crate::platform::HostDirHandle;

/// Information about the running sandbox instance
#[derive(Debug, Clone)]
pub struct SandboxInfo {
    /// Backend type identifier
    pub backend_type: String,
    /// Interpreter the sandbox executes scripts with
    pub interpreter: String,
    /// Root directory of the sandbox file system
    pub session_root: String,
}

/// Trait for the sandboxed script interpreter.
///
/// Abstracts the execution engine so the run orchestrator never depends on a
/// concrete interpreter. All package, mount, and environment state lives
/// inside the sandbox and persists across `execute` calls for the lifetime
/// of the instance.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Returns the backend name (e.g., "python-subprocess")
    fn name(&self) -> &str;

    /// Install a package into the sandbox's package environment
    async fn install_package(&self, name: &str) -> Result<()>;

    /// Make a granted host directory visible inside the sandbox
    async fn mount_directory(
        &self,
        guest_path: &str,
        handle: &HostDirHandle,
        readonly: bool,
    ) -> Result<()>;

    /// Set an environment variable visible to executed scripts
    async fn set_env(&self, key: &str, value: &str) -> Result<()>;

    /// Execute a script, streaming each produced output line through the
    /// sender as it appears. The sender is dropped when execution ends.
    async fn execute(&self, script: &str, output: UnboundedSender<String>) -> Result<()>;

    /// Flush sandbox-side writes under a mounted path back to the bound
    /// host directory
    async fn sync_mount(&self, guest_path: &str) -> Result<()>;

    /// Get information about the sandbox instance
    fn info(&self) -> SandboxInfo;
}
