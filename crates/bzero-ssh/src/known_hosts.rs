//! known_hosts maintenance for the operator side.

use std::path::{Path, PathBuf};

use bzero_types::TunnelError;
use tokio::fs;

/// Appends standard OpenSSH known_hosts lines, once per session, for the
/// hostnames the ZLI asked us to trust.
pub struct KnownHosts {
    path: PathBuf,
}

impl KnownHosts {
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `<host> <key-type> <key>` for each hostname not already
    /// present with this key.
    pub async fn add_host_keys(
        &self,
        hostnames: &[String],
        key_type: &str,
        public_key: &str,
    ) -> Result<(), TunnelError> {
        let existing = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(TunnelError::Internal(e.to_string())),
        };

        let mut additions = String::new();
        for hostname in hostnames {
            let line = format!("{} {} {}", hostname, key_type, public_key);
            if !existing.lines().any(|l| l == line) {
                additions.push_str(&line);
                additions.push('\n');
            }
        }
        if additions.is_empty() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| TunnelError::Internal(e.to_string()))?;
        }
        let mut contents = existing;
        contents.push_str(&additions);
        fs::write(&self.path, contents)
            .await
            .map_err(|e| TunnelError::Internal(e.to_string()))
    }
}
