use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PyletConfig {
    pub sandbox: SandboxConfig,
    pub mounts: MountConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Path to the Python interpreter (auto-detected if not set)
    pub python_binary: Option<PathBuf>,
    /// Sandbox path the input directory is mounted at
    pub input_mount: String,
    /// Sandbox path the output directory is mounted at
    pub output_mount: String,
    /// Extra environment variables [(KEY, VALUE), ...]
    pub env_vars: Vec<(String, String)>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            python_binary: None,
            input_mount: "/data/input".to_string(),
            output_mount: "/data/output".to_string(),
            env_vars: Vec::new(),
        }
    }
}

/// Pre-configured host directories, used before falling back to a prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Host directory served to input mounts
    pub input_dir: Option<PathBuf>,
    /// Host directory served to output mounts
    pub output_dir: Option<PathBuf>,
}
