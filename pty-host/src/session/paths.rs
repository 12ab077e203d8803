// Path helpers for handing filesystem paths to shells
//
// Escaping here is the last line before a path is typed into a live shell, so
// anything that could start an expansion or command substitution is removed
// rather than quoted.

use super::protocol::OperatingSystem;
use serde::{Deserialize, Serialize};

/// Shell dialect a path is being prepared for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellDialect {
    Bash,
    Sh,
    Zsh,
    Fish,
    GitBash,
    Pwsh,
    Cmd,
    Wsl,
}

/// Characters that must never reach a POSIX shell unquoted
const BANNED_CHARS: &[char] = &['`', '$', '|', '&', '>', '~', '#', '!', '^', '*', ';', '<'];

/// Escape a path for interpolation into a non-Windows shell.
///
/// Backslashes are doubled, expansion characters are dropped, single quotes
/// are escaped for the dialect and the result is wrapped in single quotes.
pub fn escape_non_windows_path(path: &str, shell: ShellDialect) -> String {
    let mut escaped = path.replace('\\', "\\\\");
    escaped.retain(|c| !BANNED_CHARS.contains(&c));

    let quote_replacement = match shell {
        ShellDialect::Pwsh => "''",
        _ => "\\'",
    };
    escaped = escaped.replace('\'', quote_replacement);

    format!("'{}'", escaped)
}

/// Prepare a path so it can be pasted into a shell of the given dialect
pub fn prepare_path_for_shell(path: &str, shell: ShellDialect, os: OperatingSystem) -> String {
    match shell {
        ShellDialect::Cmd => {
            if path.contains(' ') {
                format!("\"{}\"", path)
            } else {
                path.to_string()
            }
        }
        ShellDialect::Pwsh if os == OperatingSystem::Windows => {
            let needs_quoting = path
                .chars()
                .any(|c| matches!(c, ' ' | '\'' | '$' | '(' | ')' | '`' | '&'));
            if needs_quoting {
                format!("& '{}'", path.replace('\'', "''"))
            } else {
                path.to_string()
            }
        }
        ShellDialect::GitBash => escape_non_windows_path(&path.replace('\\', "/"), shell),
        ShellDialect::Wsl => windows_path_to_wsl_mount(path).unwrap_or_else(|| path.to_string()),
        _ => escape_non_windows_path(path, shell),
    }
}

/// `c:\foo\bar` -> `/mnt/c/foo/bar`, the default WSL automount layout
pub fn windows_path_to_wsl_mount(path: &str) -> Option<String> {
    let mut chars = path.chars();
    let drive = chars.next().filter(|c| c.is_ascii_alphabetic())?;
    if chars.next() != Some(':') {
        return None;
    }
    let rest = chars.as_str().replace('\\', "/");
    let rest = rest.trim_start_matches('/');
    Some(format!("/mnt/{}/{}", drive.to_ascii_lowercase(), rest))
}

/// Strip wrapping quotes and upper-case a leading drive letter
pub fn sanitize_cwd(cwd: &str) -> String {
    let mut cwd = cwd;
    if cwd.len() >= 2 {
        let first = cwd.as_bytes()[0];
        let last = cwd.as_bytes()[cwd.len() - 1];
        if matches!(first, b'\'' | b'"') && matches!(last, b'\'' | b'"') {
            cwd = &cwd[1..cwd.len() - 1];
        }
    }

    let mut chars = cwd.chars();
    match (chars.next(), chars.next()) {
        (Some(drive), Some(':')) if drive.is_ascii_alphabetic() => {
            format!("{}{}", drive.to_ascii_uppercase(), &cwd[1..])
        }
        _ => cwd.to_string(),
    }
}

fn normalize_for_compare(path: &str) -> String {
    path.replace('\\', "/").to_lowercase()
}

/// Collapse a path under the user's home directory into `~{sep}rest`.
///
/// The home prefix is matched case-insensitively and with either slash style.
/// Paths outside home are returned unchanged.
pub fn collapse_tilde_path(path: &str, user_home: Option<&str>, separator: char) -> String {
    if path.is_empty() {
        return String::new();
    }
    let Some(home) = user_home.filter(|h| !h.is_empty()) else {
        return path.to_string();
    };
    let home = home.trim_end_matches(['/', '\\']);

    let normalized_path = normalize_for_compare(path);
    let normalized_home = normalize_for_compare(home);
    if !normalized_path.starts_with(&normalized_home) {
        return path.to_string();
    }

    match path.get(home.len()..) {
        Some("") => "~".to_string(),
        Some(rest) if rest.starts_with(['/', '\\']) => format!("~{}{}", separator, &rest[1..]),
        _ => path.to_string(),
    }
}

/// Inverse of [`collapse_tilde_path`] for paths it produced
pub fn expand_tilde_path(path: &str, user_home: &str, separator: char) -> String {
    let home = user_home.trim_end_matches(['/', '\\']);
    if path == "~" {
        return home.to_string();
    }
    match path.strip_prefix('~') {
        Some(rest) if rest.starts_with(separator) => format!("{}{}", home, rest),
        _ => path.to_string(),
    }
}
