//! Path utilities

use std::path::{Path, PathBuf};

/// Runtime data root (~/.genesis)
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".genesis"))
        .unwrap_or_else(|| PathBuf::from(".genesis"))
}

/// Config file location
pub fn config_path() -> PathBuf {
    data_dir().join("config.json")
}

/// System-wide plugin directory
pub fn system_plugins_dir() -> PathBuf {
    data_dir().join("plugins")
}

/// Root of all per-user data
pub fn users_dir() -> PathBuf {
    data_dir().join("users")
}

/// Plugin directory owned by one user
pub fn user_plugins_dir(users_root: &Path, user: &str) -> PathBuf {
    users_root.join(safe_filename(user)).join("plugins")
}

/// Root of action working homes
pub fn homes_dir() -> PathBuf {
    data_dir().join("home")
}

/// Working home for actions invoked by the system scope
pub fn system_home(homes_root: &Path) -> PathBuf {
    homes_root.join("_system")
}

/// Working home for actions invoked on behalf of one user
pub fn user_home(homes_root: &Path, user: &str) -> PathBuf {
    homes_root.join("users").join(safe_filename(user))
}

/// Conversation history storage
pub fn sessions_dir() -> PathBuf {
    data_dir().join("sessions")
}

/// Ensure directory exists
pub async fn ensure_dir(path: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(path).await
}

/// Encode an identity or key as a single path component.
///
/// Path separators, characters Windows rejects, control characters and `%`
/// itself become `%XX`, so distinct names always map to distinct
/// components. `.`, `..` and the empty name are fully escaped.
pub fn safe_filename(name: &str) -> String {
    match name {
        "" => return "%".to_string(),
        "." => return "%2E".to_string(),
        ".." => return "%2E%2E".to_string(),
        _ => {}
    }

    let mut encoded = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '%' | '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => {
                encoded.push_str(&format!("%{:02X}", c as u32))
            }
            c if c.is_control() => {
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    encoded.push_str(&format!("%{:02X}", byte));
                }
            }
            c => encoded.push(c),
        }
    }
    encoded
}

/// Inverse of [`safe_filename`]; `None` if `component` is not an encoding.
pub fn decode_filename(component: &str) -> Option<String> {
    if component == "%" {
        return Some(String::new());
    }

    let mut bytes = Vec::with_capacity(component.len());
    let mut rest = component.as_bytes();
    while let Some((&byte, tail)) = rest.split_first() {
        if byte == b'%' {
            let hex = tail.get(..2)?;
            let hex = std::str::from_utf8(hex).ok()?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
            rest = &tail[2..];
        } else {
            bytes.push(byte);
            rest = tail;
        }
    }
    let decoded = String::from_utf8(bytes).ok()?;
    (safe_filename(&decoded) == component).then_some(decoded)
}
