pub mod context;
pub mod middleware;
pub mod rate_limit;
pub mod token_store;
pub mod user_store;
pub mod watcher;

pub use context::RequestContext;

use std::path::Path;

/// Credential failure kinds. Clients only ever see the fixed display
/// strings; anything more specific stays in server-side logs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("invalid or unknown token")]
    Unknown,

    #[error("expired")]
    Expired,

    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("user account is disabled")]
    Disabled,
}

/// Write a credential file with owner-only permissions (0600, parent
/// directory 0700). Writes a sibling temp file first and renames it over
/// the target, so a concurrent reload never sees a partial file.
pub(crate) fn write_restricted(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
            }
        }
    }

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("credentials");
    let tmp = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            parent.join(format!(".{file_name}.tmp"))
        }
        _ => Path::new(&format!(".{file_name}.tmp")).to_path_buf(),
    };

    std::fs::write(&tmp, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}
