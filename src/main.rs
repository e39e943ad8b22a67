use anyhow::Result;
use clap::{Parser, Subcommand};
use std::ffi::OsString;

mod args;
mod config;
mod engine;
mod env;
mod files;
mod http;
mod logging;
mod ui;
mod upload;
mod utils;
mod watch;

use crate::args::CLIArgs;

const DEFAULT_DEV_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-dev");
const CLI_VERSION: &str = match option_env!("SCANSYNC_VERSION_STRING") {
    Some(version) => version,
    None => DEFAULT_DEV_VERSION,
};

#[derive(Debug, Parser)]
#[command(
    name = "scansync",
    about = "Upload files to a scanning backend and follow their scan status live",
    version = CLI_VERSION
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Follow scan status live until Ctrl+C
    Watch(CLIArgs<watch::WatchArgs>),
    /// Upload a file, in chunks when it is large
    Upload(CLIArgs<upload::UploadArgs>),
    /// List and download scanned files
    Files(CLIArgs<files::FilesArgs>),
    /// View and modify persisted settings
    Config(CLIArgs<config::ConfigArgs>),
}

#[tokio::main]
async fn main() -> Result<()> {
    let argv: Vec<OsString> = std::env::args_os().collect();
    env::bootstrap_from_args(&argv)?;
    let cli = Cli::parse_from(argv);

    match cli.command {
        Commands::Watch(cmd) => {
            logging::init(cmd.base.verbose);
            watch::run(cmd.base, cmd.args).await?
        }
        Commands::Upload(cmd) => {
            logging::init(cmd.base.verbose);
            upload::run(cmd.base, cmd.args).await?
        }
        Commands::Files(cmd) => {
            logging::init(cmd.base.verbose);
            files::run(cmd.base, cmd.args).await?
        }
        Commands::Config(cmd) => {
            logging::init(cmd.base.verbose);
            config::run(cmd.base, cmd.args)?
        }
    }

    Ok(())
}
