use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::info;

use crate::config::loader::get_cache_dir;
use crate::error::{PyletError, Result};

/// python-build-standalone release to download if no interpreter is installed
const PYTHON_STANDALONE_RELEASE: &str = "20250702";
const PYTHON_STANDALONE_VERSION: &str = "3.12.11";

/// Get the standalone CPython download URL for the current platform.
fn get_python_download_url() -> Result<String> {
    let os = std::env::consts::OS;
    let arch = std::env::consts::ARCH;

    let triple = match (os, arch) {
        ("linux", "x86_64") => "x86_64-unknown-linux-gnu",
        ("linux", "aarch64") => "aarch64-unknown-linux-gnu",
        ("macos", "x86_64") => "x86_64-apple-darwin",
        ("macos", "aarch64") => "aarch64-apple-darwin",
        ("windows", "x86_64") => "x86_64-pc-windows-msvc",
        _ => {
            return Err(PyletError::SandboxInit(format!(
                "Unsupported platform: {}-{}",
                os, arch
            )));
        }
    };

    Ok(format!(
        "https://github.com/astral-sh/python-build-standalone/releases/download/{release}/cpython-{version}+{release}-{triple}-install_only.tar.gz",
        release = PYTHON_STANDALONE_RELEASE,
        version = PYTHON_STANDALONE_VERSION,
        triple = triple,
    ))
}

/// Locate the Python interpreter the sandbox will run scripts with.
///
/// Resolution order: configured path, `python3`/`python` on PATH, a
/// previously downloaded standalone build, then a fresh download into the
/// cache directory.
pub async fn locate_python(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if !path.exists() {
            return Err(PyletError::SandboxInit(format!(
                "Configured Python interpreter not found: {}",
                path.display()
            )));
        }
        return Ok(path.to_path_buf());
    }

    for name in ["python3", "python"] {
        if let Ok(path) = which::which(name) {
            return Ok(path);
        }
    }

    let python = get_or_download_python().await?;
    check_python_works(&python).await?;
    Ok(python)
}

/// Path the standalone interpreter lands at inside the cache directory.
fn cached_python_path(cache_dir: &Path) -> PathBuf {
    let root = cache_dir.join("python");
    if cfg!(windows) {
        root.join("python.exe")
    } else {
        root.join("bin").join("python3")
    }
}

/// Get the cached standalone interpreter or download and extract it.
async fn get_or_download_python() -> Result<PathBuf> {
    let cache_dir = get_cache_dir();
    let python_path = cached_python_path(&cache_dir);

    // Check cache first
    if python_path.exists() {
        info!(path = %python_path.display(), "Using cached Python build");
        return Ok(python_path);
    }

    info!(
        version = PYTHON_STANDALONE_VERSION,
        "Downloading standalone Python build..."
    );

    // Create cache directory
    tokio::fs::create_dir_all(&cache_dir).await?;

    let url = get_python_download_url()?;
    let client = reqwest::Client::builder()
        .build()
        .map_err(|e| PyletError::SandboxInit(format!("Failed to create HTTP client: {}", e)))?;

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| PyletError::SandboxInit(format!("Failed to download: {}", e)))?;

    if !response.status().is_success() {
        return Err(PyletError::SandboxInit(format!(
            "Failed to download Python build: HTTP {}",
            response.status()
        )));
    }

    let archive_bytes = response
        .bytes()
        .await
        .map_err(|e| PyletError::SandboxInit(format!("Failed to read response: {}", e)))?;

    // Extract the tarball (blocking IO, off the runtime)
    let extract_dir = cache_dir.clone();
    tokio::task::spawn_blocking(move || extract_tarball(&archive_bytes, &extract_dir))
        .await
        .map_err(|e| PyletError::SandboxInit(format!("Extraction task failed: {}", e)))??;

    if !python_path.exists() {
        return Err(PyletError::SandboxInit(
            "Downloaded Python build has unexpected layout".to_string(),
        ));
    }

    info!(path = %python_path.display(), "Cached standalone Python build");

    Ok(python_path)
}

/// Unpack a gzipped tarball into the target directory. The archive carries a
/// top-level `python/` directory.
fn extract_tarball(bytes: &[u8], target: &Path) -> Result<()> {
    let decoder = flate2::read::GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(target)
        .map_err(|e| PyletError::SandboxInit(format!("Failed to extract Python build: {}", e)))?;
    Ok(())
}

/// Verify the interpreter starts
async fn check_python_works(python: &Path) -> Result<()> {
    let output = Command::new(python)
        .arg("--version")
        .output()
        .await
        .map_err(|e| {
            PyletError::SandboxInit(format!(
                "Python interpreter at {} is not runnable: {}",
                python.display(),
                e
            ))
        })?;

    if !output.status.success() {
        return Err(PyletError::SandboxInit(
            "Python interpreter is not working properly".to_string(),
        ));
    }

    let version = String::from_utf8_lossy(&output.stdout);
    info!(version = %version.trim(), "Found Python");

    Ok(())
}
