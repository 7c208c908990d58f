use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(name = "pylet")]
#[clap(version, about = "Sandboxed Python script runner")]
#[clap(propagate_version = true)]
pub struct Cli {
    #[clap(flatten)]
    pub global_opts: GlobalOpts,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Configuration file path
    #[clap(short, long, global = true, env = "PYLET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[clap(long, global = true, default_value = "text", value_enum)]
    pub format: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one or more scripts against a shared sandbox session
    Run(RunArgs),

    /// Show what a script would require without running it
    Inspect(InspectArgs),

    /// Initialize a new pylet configuration
    Init(InitArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

// ============================================================================
// Run Command
// ============================================================================

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Script files, executed in order within one session
    #[clap(required = true)]
    pub scripts: Vec<PathBuf>,

    /// Requirements file; one package per line, # comments allowed
    #[clap(long, short = 'r')]
    pub requirements: Option<PathBuf>,

    /// Value for the TEXT_INPUT placeholder (prompted for otherwise)
    #[clap(long)]
    pub text_input: Option<String>,

    /// Host directory served to the INPUT_PATH mount
    #[clap(long)]
    pub input_dir: Option<PathBuf>,

    /// Host directory served to the OUTPUT_PATH mount
    #[clap(long)]
    pub output_dir: Option<PathBuf>,

    /// Environment variables to set in the sandbox (KEY=VALUE)
    #[clap(long = "env", short = 'e', value_parser = parse_env_var)]
    pub env_vars: Vec<(String, String)>,

    /// Python interpreter to run scripts with
    #[clap(long)]
    pub python: Option<PathBuf>,

    /// Never prompt on the terminal; unresolved directories fail the run
    #[clap(long)]
    pub non_interactive: bool,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Script file to analyze
    pub script: PathBuf,

    /// Requirements file to parse alongside the script
    #[clap(long, short = 'r')]
    pub requirements: Option<PathBuf>,
}

// ============================================================================
// Config Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Force overwrite existing configuration
    #[clap(short, long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[clap(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Show configuration file path
    Path,
}

// ============================================================================
// Common Types
// ============================================================================

fn parse_env_var(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| "Environment variable format: KEY=VALUE".to_string())
}

#[derive(Debug, Clone, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}
