use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use crate::config::loader::get_data_dir;
use crate::config::types::SandboxConfig;
use crate::error::{PyletError, Result};
use crate::platform::HostDirHandle;
use crate::runner::placeholders::{INPUT_PATH_VAR, OUTPUT_PATH_VAR};
use crate::sandbox::interpreter::locate_python;
use crate::sandbox::traits::{Sandbox, SandboxInfo};
use crate::session::generate_session_id;

#[derive(Debug, Clone)]
struct MountEntry {
    host_path: PathBuf,
    readonly: bool,
}

/// Subprocess-isolated Python sandbox.
///
/// Each instance owns a private root directory under the data dir. Packages
/// install into a per-session `site-packages`, mounted host directories are
/// copied beneath the root, and scripts run with the working directory and
/// `PYTHONPATH` pinned inside it. The root is removed when the sandbox is
/// dropped.
pub struct PythonSandbox {
    python: PathBuf,
    root: PathBuf,
    site_packages: PathBuf,
    env_vars: Mutex<Vec<(String, String)>>,
    mounts: Mutex<HashMap<String, MountEntry>>,
}

impl PythonSandbox {
    pub async fn new(config: &SandboxConfig) -> Result<Self> {
        let python = locate_python(config.python_binary.as_deref()).await?;

        let root = get_data_dir().join("sessions").join(generate_session_id());
        let site_packages = root.join("site-packages");
        tokio::fs::create_dir_all(&site_packages)
            .await
            .map_err(|e| {
                PyletError::SandboxInit(format!(
                    "Failed to create sandbox root at {}: {}",
                    root.display(),
                    e
                ))
            })?;

        // Environment handed to every executed script. The mount path
        // variables are fixed at creation; scripts read them whether or not
        // the corresponding directory ends up mounted.
        let mut env_vars = config.env_vars.clone();
        upsert_env(
            &mut env_vars,
            INPUT_PATH_VAR,
            guest_to_host(&root, &config.input_mount)
                .display()
                .to_string(),
        );
        upsert_env(
            &mut env_vars,
            OUTPUT_PATH_VAR,
            guest_to_host(&root, &config.output_mount)
                .display()
                .to_string(),
        );

        info!(root = %root.display(), python = %python.display(), "Sandbox ready");

        Ok(Self {
            python,
            root,
            site_packages,
            env_vars: Mutex::new(env_vars),
            mounts: Mutex::new(HashMap::new()),
        })
    }

    fn guest_dir(&self, guest_path: &str) -> PathBuf {
        guest_to_host(&self.root, guest_path)
    }

    fn env_snapshot(&self) -> Vec<(String, String)> {
        self.env_vars.lock().expect("env poisoned").clone()
    }
}

#[async_trait]
impl Sandbox for PythonSandbox {
    fn name(&self) -> &str {
        "python-subprocess"
    }

    async fn install_package(&self, name: &str) -> Result<()> {
        debug!(package = %name, "Installing package");

        let output = Command::new(&self.python)
            .args(["-m", "pip", "install", "--quiet", "--target"])
            .arg(&self.site_packages)
            .arg(name)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| PyletError::Install {
                package: name.to_string(),
                reason: format!("failed to run pip: {}", e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PyletError::Install {
                package: name.to_string(),
                reason: stderr.trim().to_string(),
            });
        }

        Ok(())
    }

    async fn mount_directory(
        &self,
        guest_path: &str,
        handle: &HostDirHandle,
        readonly: bool,
    ) -> Result<()> {
        let host_path = handle.path();
        if !host_path.exists() {
            return Err(PyletError::MountPathNotFound {
                path: host_path.display().to_string(),
            });
        }

        let target = self.guest_dir(guest_path);
        debug!(
            host = %host_path.display(),
            guest = %guest_path,
            readonly = readonly,
            "Mounting directory"
        );

        copy_dir(host_path, &target)
            .await
            .map_err(|e| PyletError::Mount {
                path: guest_path.to_string(),
                reason: e.to_string(),
            })?;

        self.mounts.lock().expect("mounts poisoned").insert(
            guest_path.to_string(),
            MountEntry {
                host_path: host_path.to_path_buf(),
                readonly,
            },
        );

        Ok(())
    }

    async fn set_env(&self, key: &str, value: &str) -> Result<()> {
        let mut env_vars = self.env_vars.lock().expect("env poisoned");
        upsert_env(&mut env_vars, key, value.to_string());
        Ok(())
    }

    async fn execute(&self, script: &str, output: UnboundedSender<String>) -> Result<()> {
        let script_path = self.root.join("main.py");
        tokio::fs::write(&script_path, script)
            .await
            .map_err(|e| PyletError::Exec(format!("Failed to stage script: {}", e)))?;

        let mut cmd = Command::new(&self.python);
        cmd.arg(&script_path);
        cmd.current_dir(&self.root);
        cmd.env("PYTHONPATH", &self.site_packages);
        cmd.env("PYTHONUNBUFFERED", "1");
        for (key, value) in self.env_snapshot() {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| PyletError::Exec(format!("Failed to spawn interpreter: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PyletError::Exec("Interpreter stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PyletError::Exec("Interpreter stderr not captured".to_string()))?;

        // Drain stderr concurrently so a chatty script cannot deadlock the
        // stdout loop on a full pipe.
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut reader = BufReader::new(stderr);
            let _ = reader.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).to_string()
        });

        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| PyletError::Exec(format!("Failed to read output: {}", e)))?
        {
            // Receiver dropping just means nobody is listening anymore
            let _ = output.send(line);
        }

        let status = child
            .wait()
            .await
            .map_err(|e| PyletError::Exec(format!("Failed to wait for interpreter: {}", e)))?;

        let stderr_text = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let reason = if stderr_text.trim().is_empty() {
                format!("interpreter exited with status {}", status)
            } else {
                stderr_text.trim().to_string()
            };
            return Err(PyletError::Exec(reason));
        }

        if !stderr_text.trim().is_empty() {
            debug!(stderr = %stderr_text.trim(), "Script wrote to stderr");
        }

        Ok(())
    }

    async fn sync_mount(&self, guest_path: &str) -> Result<()> {
        let entry = self
            .mounts
            .lock()
            .expect("mounts poisoned")
            .get(guest_path)
            .cloned()
            .ok_or_else(|| PyletError::Sync {
                path: guest_path.to_string(),
                reason: "no directory is mounted at this path".to_string(),
            })?;

        if entry.readonly {
            return Err(PyletError::Sync {
                path: guest_path.to_string(),
                reason: "mount is read-only".to_string(),
            });
        }

        debug!(guest = %guest_path, host = %entry.host_path.display(), "Syncing mount");

        copy_dir(&self.guest_dir(guest_path), &entry.host_path)
            .await
            .map_err(|e| PyletError::Sync {
                path: guest_path.to_string(),
                reason: e.to_string(),
            })
    }

    fn info(&self) -> SandboxInfo {
        SandboxInfo {
            backend_type: self.name().to_string(),
            interpreter: self.python.display().to_string(),
            session_root: self.root.display().to_string(),
        }
    }
}

impl Drop for PythonSandbox {
    fn drop(&mut self) {
        // Best-effort cleanup of the session root
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

/// Resolve a sandbox-absolute guest path beneath the session root.
fn guest_to_host(root: &Path, guest_path: &str) -> PathBuf {
    root.join(guest_path.trim_start_matches('/'))
}

fn upsert_env(env_vars: &mut Vec<(String, String)>, key: &str, value: impl Into<String>) {
    let value = value.into();
    if let Some(entry) = env_vars.iter_mut().find(|(k, _)| k == key) {
        entry.1 = value;
    } else {
        env_vars.push((key.to_string(), value));
    }
}

/// Copy a directory tree. Regular files and directories only; symlinks are
/// not carried across the sandbox boundary.
async fn copy_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    let mut pending = vec![(src.to_path_buf(), dst.to_path_buf())];

    while let Some((from, to)) = pending.pop() {
        tokio::fs::create_dir_all(&to).await?;
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let target = to.join(entry.file_name());
            if file_type.is_dir() {
                pending.push((entry.path(), target));
            } else if file_type.is_file() {
                tokio::fs::copy(entry.path(), target).await?;
            }
        }
    }

    Ok(())
}
