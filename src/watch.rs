use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use chrono::{Local, Utc};
use clap::Args;
use dialoguer::console::style;
use futures_util::FutureExt;
use serde_json::json;
use tokio::sync::watch;
use tracing::warn;

use crate::args::BaseArgs;
use crate::config;
use crate::engine::session::{SessionConfig, SyncSession};
use crate::engine::stream::ConnectionIndicator;
use crate::engine::ws::WsConnector;
use crate::files::api::{FileId, FileRecord};
use crate::http::ApiClient;
use crate::ui::{connection_line, print_command_status, CommandStatus};
use crate::upload::{self, UploadMode};
use crate::utils::pluralize;

#[derive(Debug, Clone, Args)]
pub struct WatchArgs {
    /// Upload this file inside the session and follow its scan
    #[arg(long, value_name = "PATH")]
    pub upload: Option<PathBuf>,

    /// Transfer strategy for --upload
    #[arg(long, value_enum, default_value_t = UploadMode::Auto)]
    pub mode: UploadMode,
}

pub async fn run(base: BaseArgs, args: WatchArgs) -> Result<()> {
    let settings = config::resolve(&base)?;
    let client = ApiClient::new(&settings.api_url)?;
    let connector = WsConnector::new(settings.ws_url.clone());
    let mut session = SyncSession::new(
        connector,
        client.clone(),
        SessionConfig::new(settings.poll_interval),
    );

    if let Some(path) = args.upload {
        let client = client.clone();
        let chunk_size = settings.chunk_size;
        let mode = args.mode;
        let quiet = base.json;
        session.attach(
            async move {
                match upload::transfer(&client, Some(&path), mode, chunk_size, quiet).await {
                    Ok(outcome) => {
                        print_command_status(CommandStatus::Success, &outcome.summary());
                        outcome.announced_record()
                    }
                    Err(err) => {
                        let err = anyhow::Error::from(err);
                        print_command_status(CommandStatus::Error, &format!("{err:#}"));
                        None
                    }
                }
            }
            .boxed(),
        );
    }

    if !base.json {
        eprintln!(
            "{} {} (Ctrl+C to stop)",
            style("Watching").bold(),
            client.base_url()
        );
    }

    let registry = session.registry();
    let connection = session.connection();
    let (records, rendered, ()) = tokio::join!(
        session.run(shutdown_signal()),
        render_registry(registry, base.json),
        render_connection(connection),
    );
    rendered?;

    if !base.json {
        print_command_status(
            CommandStatus::Success,
            &format!(
                "Stopped watching; {} {} tracked",
                records.len(),
                pluralize(records.len(), "file", None)
            ),
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for Ctrl+C; watching until killed");
        std::future::pending::<()>().await;
    }
}

/// Print registry changes until the session closes the channel.
async fn render_registry(mut rx: watch::Receiver<Vec<FileRecord>>, json: bool) -> Result<()> {
    let mut previous: Vec<FileRecord> = Vec::new();
    while rx.changed().await.is_ok() {
        let current = rx.borrow_and_update().clone();
        if json {
            println!(
                "{}",
                serde_json::to_string(&json!({
                    "at": Utc::now().to_rfc3339(),
                    "files": current,
                }))?
            );
        } else {
            let stamp = Local::now().format("%H:%M:%S").to_string();
            for line in describe_changes(&previous, &current) {
                println!("{} {line}", style(&stamp).dim());
            }
        }
        previous = current;
    }
    Ok(())
}

async fn render_connection(mut rx: watch::Receiver<ConnectionIndicator>) {
    while rx.changed().await.is_ok() {
        let indicator = rx.borrow_and_update().clone();
        let (status, line) = connection_line(&indicator);
        print_command_status(status, &line);
    }
}

/// One line per new record or visible change, newest first.
fn describe_changes(previous: &[FileRecord], current: &[FileRecord]) -> Vec<String> {
    let before: HashMap<&FileId, &FileRecord> = previous.iter().map(|r| (&r.id, r)).collect();
    let mut lines = Vec::new();

    for record in current {
        let Some(old) = before.get(&record.id) else {
            lines.push(format!(
                "+ {} {} [{}]",
                record.id,
                record.display_name(),
                record.scan_status
            ));
            continue;
        };

        let mut changes = Vec::new();
        if old.filename != record.filename {
            changes.push(format!("named {}", record.display_name()));
        }
        if old.scan_status != record.scan_status {
            changes.push(format!("{} -> {}", old.scan_status, record.scan_status));
        }
        if old.checksum != record.checksum {
            if let Some(checksum) = &record.checksum {
                changes.push(format!("checksum {checksum}"));
            }
        }
        if old.scan_details != record.scan_details {
            if let Some(details) = record.scan_details.as_deref().filter(|d| !d.is_empty()) {
                changes.push(format!("({details})"));
            }
        }
        if !changes.is_empty() {
            lines.push(format!(
                "~ {} {} {}",
                record.id,
                record.display_name(),
                changes.join(", ")
            ));
        }
    }
    lines
}
