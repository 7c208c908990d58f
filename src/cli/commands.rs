use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::info;

use crate::cli::args::{ConfigAction, ConfigArgs, InitArgs, InspectArgs, OutputFormat, RunArgs};
use crate::config::loader::get_config_path;
use crate::config::types::PyletConfig;
use crate::error::{PyletError, Result};
use crate::platform::NativePlatform;
use crate::runner::placeholders;
use crate::runner::requirements::parse_requirements;
use crate::runner::{RunRequest, Runner};
use crate::sandbox::{PythonSandbox, Sandbox};

// ============================================================================
// Run Command
// ============================================================================

/// Run scripts against a shared sandbox session
pub async fn run(args: RunArgs, config: PyletConfig, format: OutputFormat) -> Result<()> {
    let mut sandbox_config = config.sandbox.clone();
    if let Some(python) = args.python {
        sandbox_config.python_binary = Some(python);
    }
    sandbox_config.env_vars.extend(args.env_vars);

    let input_dir = args.input_dir.or(config.mounts.input_dir);
    let output_dir = args.output_dir.or(config.mounts.output_dir);
    let mut platform = NativePlatform::new(input_dir, output_dir);
    if args.non_interactive {
        platform = platform.non_interactive();
    }

    let requirements = match &args.requirements {
        Some(path) => tokio::fs::read_to_string(path).await?,
        None => String::new(),
    };

    // A sandbox that cannot initialize disables the session entirely;
    // nothing below is attempted.
    let sandbox = PythonSandbox::new(&sandbox_config).await?;
    let sandbox_info = sandbox.info();
    info!(
        backend = %sandbox_info.backend_type,
        root = %sandbox_info.session_root,
        "Session started"
    );

    let echo = matches!(format, OutputFormat::Text);
    let runner = Runner::new(Arc::new(sandbox), Arc::new(platform), &sandbox_config)
        .echo_output(echo);

    for script_path in &args.scripts {
        let script = tokio::fs::read_to_string(script_path).await?;
        info!(script = %script_path.display(), "Starting run");

        let mut request = RunRequest::new(script).with_requirements(requirements.clone());
        if let Some(text) = &args.text_input {
            request = request.with_text_input(text.clone());
        }

        let lines_before = runner.output().len();
        let started = Instant::now();
        let outcome = runner.run(request).await?;
        let duration = started.elapsed();

        match format {
            OutputFormat::Text => {
                // Output lines were already echoed while streaming; a
                // failure propagates below
            }
            OutputFormat::Json => {
                let lines: Vec<String> = runner
                    .output()
                    .snapshot()
                    .split_off(lines_before);
                println!(
                    "{}",
                    serde_json::json!({
                        "script": script_path.display().to_string(),
                        "session": runner.session_id(),
                        "succeeded": outcome.succeeded(),
                        "error": outcome.error().map(|e| e.to_string()),
                        "output": lines,
                        "duration_ms": duration.as_millis() as u64,
                        "finished_at": Utc::now().to_rfc3339(),
                    })
                );
            }
        }

        // Remaining scripts are not attempted after a failed run; the user
        // retries manually
        if let Some(error) = outcome.into_error() {
            return Err(error);
        }
    }

    Ok(())
}

// ============================================================================
// Inspect Command
// ============================================================================

/// Show the resources a script would require without running it
pub async fn inspect(args: InspectArgs, format: OutputFormat) -> Result<()> {
    let script = tokio::fs::read_to_string(&args.script).await?;
    let requirements = match &args.requirements {
        Some(path) => tokio::fs::read_to_string(path).await?,
        None => String::new(),
    };

    let detected = placeholders::detect(&script);
    let packages = parse_requirements(&requirements);

    match format {
        OutputFormat::Text => {
            println!("script: {}", args.script.display());
            if packages.is_empty() {
                println!("packages: none");
            } else {
                println!("packages: {}", packages.join(", "));
            }
            println!("input mount: {}", yes_no(detected.input_path));
            println!("output mount: {}", yes_no(detected.output_path));
            println!("text input: {}", yes_no(detected.text_input));
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "script": args.script.display().to_string(),
                    "packages": packages,
                    "placeholders": {
                        "input_path": detected.input_path,
                        "output_path": detected.output_path,
                        "text_input": detected.text_input,
                    },
                })
            );
        }
    }

    Ok(())
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

// ============================================================================
// Config Commands
// ============================================================================

/// Write a default configuration file
pub async fn init(args: InitArgs) -> Result<()> {
    let path = get_config_path();

    if path.exists() && !args.force {
        return Err(PyletError::Config(format!(
            "Configuration already exists at {} (use --force to overwrite)",
            path.display()
        )));
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let defaults = toml::to_string_pretty(&PyletConfig::default())
        .map_err(|e| PyletError::Config(e.to_string()))?;
    tokio::fs::write(&path, defaults).await?;

    println!("Wrote {}", path.display());
    Ok(())
}

/// Show the effective configuration or its path
pub async fn config(args: ConfigArgs, config: PyletConfig) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let rendered = toml::to_string_pretty(&config)
                .map_err(|e| PyletError::Config(e.to_string()))?;
            print!("{}", rendered);
        }
        ConfigAction::Path => {
            println!("{}", get_config_path().display());
        }
    }
    Ok(())
}
