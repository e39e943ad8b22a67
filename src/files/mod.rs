use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Subcommand};

use crate::args::BaseArgs;
use crate::config;
use crate::http::ApiClient;

pub mod api;
mod download;
mod list;

#[derive(Debug, Clone, Args)]
pub struct FilesArgs {
    #[command(subcommand)]
    command: Option<FilesCommands>,
}

#[derive(Debug, Clone, Subcommand)]
enum FilesCommands {
    /// List files known to the scanner
    List,
    /// Download a file that scanned clean
    Download {
        /// File id
        id: String,
        /// Output path (defaults to the stored file name)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Overwrite an existing output file without asking
        #[arg(long)]
        force: bool,
    },
}

pub async fn run(base: BaseArgs, args: FilesArgs) -> Result<()> {
    let settings = config::resolve(&base)?;
    let client = ApiClient::new(&settings.api_url)?;

    match args.command {
        None | Some(FilesCommands::List) => list::run(&client, base.json).await,
        Some(FilesCommands::Download { id, output, force }) => {
            download::run(&client, &id, output, force, base.json).await
        }
    }
}
