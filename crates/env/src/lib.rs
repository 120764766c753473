//! Environment helpers shared by the dev gateway crates.
//!
//! The gateway reads most of its settings from the process environment, optionally seeded from a
//! `.env` file that sits next to the working directory.

use std::path::Path;

/// Read an env var, treating empty/whitespace-only values as unset.
#[must_use]
pub fn non_empty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Expand `${VAR}` occurrences in a string using environment variables.
///
/// Returns an error if a referenced env var is missing.
///
/// # Errors
///
/// Returns `Err(...)` when a referenced environment variable is not set.
pub fn expand_env_string(s: &str) -> Result<String, String> {
    let mut result = s.to_string();
    let mut start = 0usize;

    while let Some(dollar_pos) = result[start..].find("${") {
        let abs_pos = start + dollar_pos;
        if let Some(end_pos) = result[abs_pos..].find('}') {
            let var_name = &result[abs_pos + 2..abs_pos + end_pos];
            let var_value = std::env::var(var_name).map_err(|_| {
                format!("Environment variable '{var_name}' not found (referenced in config)")
            })?;
            result = format!(
                "{}{}{}",
                &result[..abs_pos],
                var_value,
                &result[abs_pos + end_pos + 1..]
            );
            start = abs_pos + var_value.len();
        } else {
            start = abs_pos + 2;
        }
    }

    Ok(result)
}

/// Parse `KEY=VALUE` lines from a dotenv-style file body.
///
/// Blank lines and lines starting with `#` are skipped, as are lines without `=` or with an
/// empty key. Keys and values are trimmed; values are taken literally (no quote stripping).
#[must_use]
pub fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.trim_start().starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Read a dotenv file and return the entries that are not already present in the environment.
///
/// A missing file yields an empty list.
///
/// # Errors
///
/// Returns an I/O error when the file exists but cannot be read.
pub fn pending_dotenv_entries(path: &Path) -> std::io::Result<Vec<(String, String)>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    Ok(parse_dotenv(&contents)
        .into_iter()
        .filter(|(key, _)| std::env::var_os(key).is_none())
        .collect())
}
