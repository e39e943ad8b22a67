use std::path::Path;

use anyhow::Result;
use serde_json::{Map, Value};

use crate::args::BaseArgs;

use super::Config;

type Fields = Vec<(&'static str, String)>;

/// One config file that contributes to the effective settings.
struct Source {
    label: String,
    config: Config,
}

pub fn run(base: BaseArgs, global: bool, local: bool, verbose: bool) -> Result<()> {
    let sources = collect_sources(global, local)?;

    let output = if verbose {
        let grouped: Vec<(String, Fields)> = sources
            .iter()
            .map(|source| (source.label.clone(), source.config.non_empty_fields()))
            .filter(|(_, fields)| !fields.is_empty())
            .collect();
        format_verbose(&grouped, base.json)?
    } else {
        // later sources (local) override earlier ones (global)
        let merged = sources
            .iter()
            .fold(Config::default(), |acc, source| acc.merge(&source.config));
        format_resolved(&merged, base.json)?
    };

    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}

fn collect_sources(global: bool, local: bool) -> Result<Vec<Source>> {
    let mut sources = Vec::new();
    if !local {
        let path = super::global_path()?;
        sources.push(Source {
            label: path.display().to_string(),
            config: super::load_file(&path),
        });
    }
    if !global {
        if let Some(path) = super::local_path() {
            sources.push(Source {
                label: relative_label(&path),
                config: super::load_file(&path),
            });
        }
    }
    Ok(sources)
}

fn relative_label(path: &Path) -> String {
    std::env::current_dir()
        .ok()
        .and_then(|cwd| pathdiff::diff_paths(path, cwd))
        .unwrap_or_else(|| path.to_path_buf())
        .display()
        .to_string()
}

fn fields_json(fields: &[(&'static str, String)]) -> Value {
    Value::Object(
        fields
            .iter()
            .map(|(key, value)| (key.to_string(), Value::String(value.clone())))
            .collect(),
    )
}

fn format_resolved(config: &Config, json: bool) -> Result<String> {
    let fields = config.non_empty_fields();
    if json {
        return Ok(serde_json::to_string(&fields_json(&fields))?);
    }
    Ok(fields
        .iter()
        .map(|(key, value)| format!("{key}: {value}"))
        .collect::<Vec<_>>()
        .join("\n"))
}

fn format_verbose(sources: &[(String, Fields)], json: bool) -> Result<String> {
    if json {
        let map: Map<String, Value> = sources
            .iter()
            .map(|(label, fields)| (label.clone(), fields_json(fields)))
            .collect();
        return Ok(serde_json::to_string(&map)?);
    }

    let groups: Vec<String> = sources
        .iter()
        .map(|(label, fields)| {
            fields.iter().fold(label.clone(), |mut group, (key, value)| {
                group.push_str(&format!("\n  {key}: {value}"));
                group
            })
        })
        .collect();
    Ok(groups.join("\n\n"))
}
