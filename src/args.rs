use std::path::PathBuf;

use clap::Args;

#[derive(Debug, Clone, Args)]
pub struct BaseArgs {
    /// Output as JSON
    #[arg(short = 'j', long, global = true)]
    pub json: bool,

    /// Print engine diagnostics to stderr
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Override the scanner API URL (or via SCANSYNC_API_URL)
    #[arg(long, env = "SCANSYNC_API_URL", hide_env_values = true, global = true)]
    pub api_url: Option<String>,

    /// Override the status channel URL (or via SCANSYNC_WS_URL)
    #[arg(long, env = "SCANSYNC_WS_URL", hide_env_values = true, global = true)]
    pub ws_url: Option<String>,

    /// Path to a .env file to load before running commands.
    #[arg(long, env = "SCANSYNC_ENV_FILE", hide_env_values = true)]
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct CLIArgs<T: Args> {
    #[command(flatten)]
    pub base: BaseArgs,

    #[command(flatten)]
    pub args: T,
}
