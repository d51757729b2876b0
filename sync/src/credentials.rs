//! Database credential intake from a local `.env` style file

use std::path::Path;

use tracing::debug;

/// Key read from the environment file.
pub const PASSWORD_KEY: &str = "DB_PASSWORD";

/// Variable name the PostgreSQL client tools read the password from.
pub const PG_PASSWORD_VAR: &str = "PGPASSWORD";

/// Read `DB_PASSWORD=<value>` from `env_file`.
///
/// Blank lines and `#` comments are skipped, surrounding quotes are stripped.
/// A missing or unreadable file yields `None`.
pub fn read_db_password(env_file: &Path) -> Option<String> {
    let content = match std::fs::read_to_string(env_file) {
        Ok(content) => content,
        Err(e) => {
            debug!(path = %env_file.display(), error = %e, "No credential file");
            return None;
        }
    };
    parse_password(&content)
}

fn parse_password(content: &str) -> Option<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .find(|(key, _)| key.trim().trim_start_matches("export ").trim() == PASSWORD_KEY)
        .map(|(_, value)| unquote(value.trim()).to_string())
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}
