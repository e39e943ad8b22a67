use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const PROFILE_VAR: &str = "SCANSYNC_ENV";
const DEFAULT_PROFILE: &str = "development";

/// Load `.env` files before clap parses the command line so that
/// `env = "..."` argument fallbacks can see their values.
pub fn bootstrap_from_args(args: &[OsString]) -> Result<()> {
    let explicit = env_file_arg(args);
    load_env(explicit.as_deref())
}

pub fn load_env(explicit: Option<&Path>) -> Result<()> {
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    let profile = std::env::var(PROFILE_VAR).unwrap_or_else(|_| DEFAULT_PROFILE.to_string());
    let mut loaded = HashMap::new();

    for env_file in env_files(&cwd, explicit, &profile) {
        if explicit.is_none() && !env_file.exists() {
            continue;
        }

        let parsed = dotenvy::from_path_iter(&env_file)
            .with_context(|| format!("failed to read env file {}", env_file.display()))?;
        for item in parsed {
            let (key, value) =
                item.with_context(|| format!("failed to parse env file {}", env_file.display()))?;
            // The process environment always wins over file values.
            if std::env::var_os(&key).is_some() {
                continue;
            }
            loaded.insert(key, value);
        }
    }

    let mut vars: Vec<(String, String)> = loaded.into_iter().collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    for (key, value) in vars {
        std::env::set_var(key, value);
    }
    Ok(())
}

fn env_file_arg(args: &[OsString]) -> Option<PathBuf> {
    let mut explicit = None;
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        let Some(arg) = arg.to_str() else {
            continue;
        };
        if arg == "--" {
            break;
        }
        if arg == "--env-file" {
            explicit = iter.next().map(PathBuf::from);
        } else if let Some(value) = arg.strip_prefix("--env-file=") {
            explicit = Some(PathBuf::from(value));
        }
    }
    explicit
}

/// Files in ascending precedence: later files override earlier ones.
fn env_files(cwd: &Path, explicit: Option<&Path>, profile: &str) -> Vec<PathBuf> {
    if let Some(path) = explicit {
        return vec![cwd.join(path)];
    }

    let mut files = vec![cwd.join(".env"), cwd.join(format!(".env.{profile}"))];
    if profile != "test" {
        files.push(cwd.join(".env.local"));
    }
    files.push(cwd.join(format!(".env.{profile}.local")));
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os_args(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn env_file_flag_with_separate_value() {
        let args = os_args(&["scansync", "watch", "--env-file", "custom.env"]);
        assert_eq!(env_file_arg(&args), Some(PathBuf::from("custom.env")));
    }

    #[test]
    fn env_file_flag_with_equals() {
        let args = os_args(&["scansync", "--env-file=/tmp/x.env", "files", "list"]);
        assert_eq!(env_file_arg(&args), Some(PathBuf::from("/tmp/x.env")));
    }

    #[test]
    fn env_file_flag_after_double_dash_is_ignored() {
        let args = os_args(&["scansync", "upload", "--", "--env-file", "x.env"]);
        assert_eq!(env_file_arg(&args), None);
    }

    #[test]
    fn test_profile_skips_dot_env_local() {
        let cwd = Path::new("/work");
        let files = env_files(cwd, None, "test");
        assert_eq!(
            files,
            vec![
                cwd.join(".env"),
                cwd.join(".env.test"),
                cwd.join(".env.test.local"),
            ]
        );
    }

    #[test]
    fn explicit_file_replaces_defaults() {
        let cwd = Path::new("/work");
        let files = env_files(cwd, Some(Path::new("conf/dev.env")), DEFAULT_PROFILE);
        assert_eq!(files, vec![cwd.join("conf/dev.env")]);
    }
}
