use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Subcommand};
use std::{
    env, fs,
    io::{self, Write as _},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::args::BaseArgs;
use crate::engine::snapshot::DEFAULT_POLL_INTERVAL;
use crate::engine::ws::status_url_from_api;
use crate::ui::{print_command_status, CommandStatus};
use crate::upload::chunked::DEFAULT_CHUNK_SIZE;

mod get;
mod list;
mod set;

pub const DEFAULT_API_URL: &str = "http://localhost:8000";
const CONFIG_DIR_NAME: &str = ".scansync";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_secs: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

pub const KNOWN_KEYS: &[&str] = &["api_url", "ws_url", "chunk_size", "poll_interval_secs"];

impl Config {
    pub fn get_field(&self, key: &str) -> Option<String> {
        match key {
            "api_url" => self.api_url.clone(),
            "ws_url" => self.ws_url.clone(),
            "chunk_size" => self.chunk_size.map(|v| v.to_string()),
            "poll_interval_secs" => self.poll_interval_secs.map(|v| v.to_string()),
            _ => None,
        }
    }

    /// Validates `value` for `key` before storing it.
    pub fn set_field(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "api_url" => {
                status_url_from_api(value)?;
                self.api_url = Some(value.trim().to_string());
            }
            "ws_url" => {
                if !(value.starts_with("ws://") || value.starts_with("wss://")) {
                    bail!("ws_url must start with ws:// or wss://");
                }
                self.ws_url = Some(value.trim().to_string());
            }
            "chunk_size" => self.chunk_size = Some(parse_positive(key, value)?),
            "poll_interval_secs" => self.poll_interval_secs = Some(parse_positive(key, value)?),
            _ => bail!("Unknown config key: {key}"),
        }
        Ok(())
    }

    pub fn unset_field(&mut self, key: &str) -> bool {
        match key {
            "api_url" => self.api_url = None,
            "ws_url" => self.ws_url = None,
            "chunk_size" => self.chunk_size = None,
            "poll_interval_secs" => self.poll_interval_secs = None,
            _ => return false,
        }
        true
    }

    pub fn non_empty_fields(&self) -> Vec<(&'static str, String)> {
        KNOWN_KEYS
            .iter()
            .filter_map(|&key| self.get_field(key).map(|v| (key, v)))
            .collect()
    }

    fn merge(&self, other: &Config) -> Config {
        let mut extra = self.extra.clone();
        extra.extend(other.extra.clone());
        Config {
            api_url: other.api_url.clone().or_else(|| self.api_url.clone()),
            ws_url: other.ws_url.clone().or_else(|| self.ws_url.clone()),
            chunk_size: other.chunk_size.or(self.chunk_size),
            poll_interval_secs: other.poll_interval_secs.or(self.poll_interval_secs),
            extra,
        }
    }
}

fn parse_positive(key: &str, value: &str) -> Result<u64> {
    let parsed: u64 = value
        .trim()
        .parse()
        .with_context(|| format!("{key} must be a whole number, got '{value}'"))?;
    if parsed == 0 {
        bail!("{key} must be at least 1");
    }
    Ok(parsed)
}

/// Effective settings for one command after flags, environment, config files
/// and defaults are layered.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub api_url: String,
    pub ws_url: String,
    pub chunk_size: u64,
    pub poll_interval: Duration,
}

pub fn resolve(base: &BaseArgs) -> Result<Settings> {
    resolve_with(base, &load()?)
}

fn resolve_with(base: &BaseArgs, config: &Config) -> Result<Settings> {
    let api_url = base
        .api_url
        .clone()
        .or_else(|| config.api_url.clone())
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());
    let ws_url = match base.ws_url.clone().or_else(|| config.ws_url.clone()) {
        Some(url) => url,
        None => status_url_from_api(&api_url)?,
    };
    let chunk_size = config.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
    let poll_interval = match config.poll_interval_secs {
        Some(0) => bail!("poll_interval_secs must be at least 1"),
        Some(secs) => Duration::from_secs(secs),
        None => DEFAULT_POLL_INTERVAL,
    };

    Ok(Settings {
        api_url,
        ws_url,
        chunk_size: chunk_size.max(1),
        poll_interval,
    })
}

pub fn global_config_dir() -> Result<PathBuf> {
    if let Some(xdg) = env::var_os("XDG_CONFIG_HOME") {
        return Ok(PathBuf::from(xdg).join("scansync"));
    }
    dirs::home_dir()
        .map(|path| path.join(".config").join("scansync"))
        .ok_or_else(|| anyhow!("$HOME not configured."))
}

pub fn global_path() -> Result<PathBuf> {
    Ok(global_config_dir()?.join("config.json"))
}

pub fn load_file(path: &Path) -> Config {
    let file_contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Config::default(),
        Err(e) => {
            print_command_status(
                CommandStatus::Warning,
                &format!("could not read {}: {e}", path.display()),
            );
            return Config::default();
        }
    };

    let config: Config = match serde_json::from_str(&file_contents) {
        Ok(c) => c,
        Err(e) => {
            print_command_status(
                CommandStatus::Warning,
                &format!("could not parse {}: {e}", path.display()),
            );
            return Config::default();
        }
    };

    for key in config.extra.keys() {
        print_command_status(
            CommandStatus::Warning,
            &format!("unknown config key {} in {}", key, path.display()),
        );
    }

    config
}

pub fn load_global() -> Result<Config> {
    Ok(load_file(&global_path()?))
}

pub fn load() -> Result<Config> {
    let global = load_global().unwrap_or_default();
    let local = match local_path() {
        Some(p) => load_file(&p),
        None => Config::default(),
    };
    Ok(global.merge(&local))
}

pub fn save_file(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("could not create {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(config)?;
    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path)?;
    file.write_all(json.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;

    Ok(())
}

/// Nearest `.scansync` directory walking up from the working directory,
/// stopping at a repository root or the home directory.
pub fn find_local_config_dir() -> Option<PathBuf> {
    let home = dirs::home_dir();
    let mut current_dir = env::current_dir().ok()?;

    loop {
        if current_dir.join(CONFIG_DIR_NAME).is_dir() {
            return Some(current_dir.join(CONFIG_DIR_NAME));
        }
        if current_dir.join(".git").exists() {
            return None;
        }
        if Some(&current_dir) == home.as_ref() {
            return None;
        }
        if !current_dir.pop() {
            return None;
        }
    }
}

pub fn local_path() -> Option<PathBuf> {
    find_local_config_dir().map(|dir| dir.join("config.json"))
}

/// Which file `set`/`unset` write to. Without a flag the nearest local config
/// wins, then the global one; `--local` creates `./.scansync` when needed.
pub fn resolve_write_path(global: bool, local: bool) -> Result<PathBuf> {
    if global {
        return global_path();
    }
    if let Some(path) = local_path() {
        return Ok(path);
    }
    if local {
        return Ok(env::current_dir()?.join(CONFIG_DIR_NAME).join("config.json"));
    }
    global_path()
}

// --- CLI commands ---

#[derive(Debug, Clone, Args)]
pub struct ScopeArgs {
    /// Apply to global config ($XDG_CONFIG_HOME/scansync/config.json)
    #[arg(long, short = 'g', conflicts_with = "local")]
    global: bool,

    /// Apply to local config (.scansync/config.json)
    #[arg(long, short = 'l')]
    local: bool,
}

#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommands>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommands {
    /// List config values
    List {
        #[command(flatten)]
        scope: ScopeArgs,
        /// Show config values grouped by source
        #[arg(long)]
        verbose: bool,
    },
    /// Get a config value
    Get {
        /// Config key (api_url, ws_url, chunk_size, poll_interval_secs)
        key: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Set a config value
    Set {
        /// Config key (api_url, ws_url, chunk_size, poll_interval_secs)
        key: String,
        /// Value to set
        value: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Remove a config value
    Unset {
        /// Config key (api_url, ws_url, chunk_size, poll_interval_secs)
        key: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
}

fn validate_key(key: &str) -> Result<()> {
    if !KNOWN_KEYS.contains(&key) {
        bail!(
            "Unknown config key: {key}\nValid keys: {}",
            KNOWN_KEYS.join(", ")
        );
    }
    Ok(())
}

pub fn run(base: BaseArgs, args: ConfigArgs) -> Result<()> {
    match args.command {
        None => list::run(base, false, false, false),
        Some(ConfigCommands::List { scope, verbose }) => {
            list::run(base, scope.global, scope.local, verbose)
        }
        Some(ConfigCommands::Get { key, scope }) => {
            validate_key(&key)?;
            get::run(base, &key, scope.global, scope.local)
        }
        Some(ConfigCommands::Set { key, value, scope }) => {
            validate_key(&key)?;
            set::run(&key, &value, scope.global, scope.local)
        }
        Some(ConfigCommands::Unset { key, scope }) => {
            validate_key(&key)?;
            set::unset(&key, scope.global, scope.local)
        }
    }
}
