//! TOML configuration loading with environment overlay and atomic saves.
//!
//! # Loading order
//! 1. Parse `~/.agentic-os/config.toml` (or the path in `AGENTIC_OS_CONFIG`)
//! 2. Apply `AGENTIC_OS_*` environment variable overrides onto the raw TOML
//!    tree: the suffix is a dot-path with `__` as the segment separator,
//!    and string values that parse as integer/float/boolean are coerced
//!    (e.g. `AGENTIC_OS_SCHEDULER__MAX_CONCURRENT=8`).
//! 3. Deserialize into [`RuntimeConfig`], falling back to defaults for
//!    anything unset.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use crate::error::{Result, RuntimeError};

use super::schema::RuntimeConfig;

/// Environment variable prefix for overrides.
const ENV_PREFIX: &str = "AGENTIC_OS_";

// ─── Paths ───────────────────────────────────────────────────────────────────

/// Default config file path: `~/.agentic-os/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".agentic-os").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Load config from `path` (defaults when missing), then apply env
/// overrides.
pub fn load_config(path: &Path) -> Result<RuntimeConfig> {
    let mut tree = match fs::read_to_string(path) {
        Ok(raw) => raw
            .parse::<toml::Value>()
            .map_err(|e| RuntimeError::Internal(format!("bad config at {path:?}: {e}")))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            toml::Value::Table(toml::map::Map::new())
        }
        Err(e) => return Err(e.into()),
    };

    apply_env_overrides(&mut tree, env::vars());

    tree.try_into()
        .map_err(|e| RuntimeError::Internal(format!("invalid config: {e}")))
}

/// Load from `AGENTIC_OS_CONFIG` or the default path; never fails — a bad
/// file logs and yields defaults.
pub fn load_default_config() -> RuntimeConfig {
    let path = env::var("AGENTIC_OS_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_config_path());
    load_config(&path).unwrap_or_else(|e| {
        log::warn!("config load failed ({e}), using defaults");
        RuntimeConfig::default()
    })
}

// ─── Env overlay ─────────────────────────────────────────────────────────────

/// Apply `AGENTIC_OS_*` overrides onto the TOML tree.
fn apply_env_overrides<I>(tree: &mut toml::Value, vars: I)
where
    I: Iterator<Item = (String, String)>,
{
    for (name, value) in vars {
        let Some(suffix) = name.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        // AGENTIC_OS_CONFIG selects the file, it is not an override.
        if suffix == "CONFIG" {
            continue;
        }
        let segments: Vec<String> = suffix
            .split("__")
            .map(|s| s.to_ascii_lowercase())
            .collect();
        if segments.iter().any(String::is_empty) {
            continue;
        }
        set_path(tree, &segments, coerce(&value));
    }
}

/// Coerce an env string to integer/float/boolean when it parses as one.
fn coerce(raw: &str) -> toml::Value {
    if let Ok(i) = raw.parse::<i64>() {
        return toml::Value::Integer(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return toml::Value::Float(f);
    }
    if raw.eq_ignore_ascii_case("true") {
        return toml::Value::Boolean(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return toml::Value::Boolean(false);
    }
    toml::Value::String(raw.to_string())
}

/// Set a dot-path in the tree, creating intermediate tables.
fn set_path(tree: &mut toml::Value, segments: &[String], value: toml::Value) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut node = tree;
    for segment in parents {
        if !node.is_table() {
            return;
        }
        let table = match node.as_table_mut() {
            Some(t) => t,
            None => return,
        };
        node = table
            .entry(segment.clone())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }
    if let Some(table) = node.as_table_mut() {
        table.insert(last.clone(), value);
    }
}

// ─── Saving ──────────────────────────────────────────────────────────────────

/// Atomically save `config` to `path`: write `<path>.tmp`, back up any
/// existing file to `<path>.bak`, then rename.
pub fn save_config(path: &Path, config: &RuntimeConfig) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| RuntimeError::Internal(format!("config serialization failed: {e}")))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, &content)?;

    if path.exists() {
        fs::copy(path, path.with_extension("toml.bak"))?;
    }

    fs::rename(&tmp_path, path)?;
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
