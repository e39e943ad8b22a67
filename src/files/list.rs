use std::fmt::Write as _;

use anyhow::Result;
use dialoguer::console;

use crate::http::ApiClient;
use crate::ui::{apply_column_padding, header, status_cell, styled_table, truncate, with_spinner};
use crate::utils::{format_bytes, pluralize};

use super::api::{self, FileRecord};

pub async fn run(client: &ApiClient, json: bool) -> Result<()> {
    let mut files = with_spinner("Loading files...", json, api::list_files_with_retry(client)).await?;
    files.sort_by(|a, b| b.id.cmp(&a.id));

    if json {
        println!("{}", serde_json::to_string(&files)?);
    } else {
        print!("{}", render(&files)?);
    }

    Ok(())
}

fn render(files: &[FileRecord]) -> Result<String> {
    let mut output = String::new();
    writeln!(
        output,
        "{} {} found\n",
        console::style(files.len()),
        pluralize(files.len(), "file", None)
    )?;
    if files.is_empty() {
        return Ok(output);
    }

    let mut table = styled_table();
    table.set_header(vec![
        header("ID"),
        header("Name"),
        header("Size"),
        header("Status"),
        header("Details"),
    ]);
    apply_column_padding(&mut table, (0, 3));

    for file in files {
        let size = file.filesize.map(format_bytes).unwrap_or_else(|| "-".into());
        let details = file
            .scan_details
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|s| truncate(s, 48))
            .unwrap_or_else(|| "-".into());
        table.add_row(vec![
            comfy_table::Cell::new(file.id.as_str()),
            comfy_table::Cell::new(truncate(file.display_name(), 40)),
            comfy_table::Cell::new(size),
            status_cell(file.scan_status),
            comfy_table::Cell::new(details),
        ]);
    }

    writeln!(output, "{table}")?;
    Ok(output)
}
