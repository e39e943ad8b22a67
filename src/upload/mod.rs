use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Args, ValueEnum};
use serde_json::json;
use tracing::debug;

use crate::args::BaseArgs;
use crate::config;
use crate::files::api::{self, FileRecord, UploadReceipt};
use crate::http::ApiClient;
use crate::ui::{byte_bar, print_command_status, with_spinner, CommandStatus};
use crate::utils::{format_bytes, pluralize};

pub mod chunked;

use chunked::{ChunkedUploadManager, UploadError, UploadReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum UploadMode {
    /// Single request up to the chunk size, chunked above it
    #[default]
    Auto,
    /// One multipart request for the whole file
    Single,
    /// Sequential fixed-size chunks
    Chunked,
}

#[derive(Debug, Clone, Args)]
pub struct UploadArgs {
    /// File to upload
    #[arg(value_name = "PATH")]
    pub path: Option<PathBuf>,

    /// Transfer strategy
    #[arg(long, value_enum, default_value_t = UploadMode::Auto)]
    pub mode: UploadMode,

    /// Chunk size in bytes (overrides the chunk_size config key)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub chunk_size: Option<u64>,
}

#[derive(Debug)]
pub enum UploadOutcome {
    Single(UploadReceipt),
    Chunked(UploadReport),
}

impl UploadOutcome {
    /// Partial record the registry may learn about right away. Chunked
    /// uploads get no receipt; their record arrives through the status
    /// channel or the next snapshot.
    pub fn announced_record(&self) -> Option<FileRecord> {
        match self {
            Self::Single(receipt) => Some(receipt.clone().into_record()),
            Self::Chunked(_) => None,
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Single(receipt) => json!({
                "mode": "single",
                "id": receipt.id,
                "filename": receipt.filename,
                "status": receipt.status,
            }),
            Self::Chunked(report) => json!({
                "mode": "chunked",
                "filename": report.file_name,
                "bytes": report.total_bytes,
                "chunks": report.chunks,
            }),
        }
    }

    pub fn summary(&self) -> String {
        match self {
            Self::Single(receipt) => format!(
                "Uploaded {} as file {} (scan {})",
                receipt.filename, receipt.id, receipt.status
            ),
            Self::Chunked(report) => format!(
                "Uploaded {} ({} in {} {})",
                report.file_name,
                format_bytes(report.total_bytes),
                report.chunks,
                pluralize(report.chunks as usize, "chunk", None)
            ),
        }
    }
}

/// Resolve `auto` against the file size.
pub fn choose_mode(mode: UploadMode, size: u64, chunk_size: u64) -> UploadMode {
    match mode {
        UploadMode::Auto if size > chunk_size => UploadMode::Chunked,
        UploadMode::Auto => UploadMode::Single,
        explicit => explicit,
    }
}

/// Upload one file with progress on stderr. `quiet` hides the progress UI.
pub async fn transfer(
    client: &ApiClient,
    path: Option<&Path>,
    mode: UploadMode,
    chunk_size: u64,
    quiet: bool,
) -> Result<UploadOutcome, UploadError> {
    let path = path.ok_or(UploadError::NoFileSelected)?;
    let size = tokio::fs::metadata(path)
        .await
        .map_err(|source| UploadError::Open {
            path: path.to_path_buf(),
            source,
        })?
        .len();

    match choose_mode(mode, size, chunk_size) {
        UploadMode::Chunked => {
            let manager = ChunkedUploadManager::new(client.clone(), chunk_size);
            let bar = byte_bar(size, &api::logical_name(path), quiet);
            let result = manager
                .upload(Some(path), |progress| {
                    debug!(percent = progress.percent(), status = ?progress.status, "upload progress");
                    bar.set_position(progress.bytes_sent);
                    bar.set_message(format!(
                        "chunk {}/{}",
                        progress.chunks_sent, progress.total_chunks
                    ));
                })
                .await;
            bar.finish_and_clear();
            result.map(UploadOutcome::Chunked)
        }
        _ => {
            let message = format!("Uploading {}", api::logical_name(path));
            with_spinner(&message, quiet, api::upload_file(client, path))
                .await
                .map(UploadOutcome::Single)
                .map_err(|err| UploadError::Single {
                    path: path.to_path_buf(),
                    source: err.into(),
                })
        }
    }
}

pub async fn run(base: BaseArgs, args: UploadArgs) -> Result<()> {
    let settings = config::resolve(&base)?;
    let chunk_size = args.chunk_size.unwrap_or(settings.chunk_size);
    let client = ApiClient::new(&settings.api_url)?;

    let outcome = match transfer(
        &client,
        args.path.as_deref(),
        args.mode,
        chunk_size,
        base.json,
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(err) => {
            if let Some(index) = err.failed_chunk() {
                print_command_status(
                    CommandStatus::Warning,
                    &format!("Transfer stopped at chunk {index}; rerunning starts over from chunk 0"),
                );
            }
            return Err(err.into());
        }
    };

    if base.json {
        println!("{}", serde_json::to_string(&outcome.to_json())?);
    } else {
        print_command_status(CommandStatus::Success, &outcome.summary());
    }
    Ok(())
}
