//! Session-scoped authorized_keys entries and their sweeper.
//!
//! Every opaque session installs one marker line:
//!
//! ```text
//! ssh-rsa <pubkey> bzero-temp-key created_at=YYYYMMDDhhmmss
//! ```
//!
//! The sweeper runs on every open and close. It must never delete a line
//! that does not carry the marker comment, and it leaves marker lines
//! younger than the grace period alone so a sibling session's just-written
//! key survives.

use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDateTime, Utc};
use tokio::fs;

use bzero_types::TunnelError;

/// Comment marking lines owned by this subsystem.
pub const KEY_MARKER: &str = "bzero-temp-key";
/// Timestamp format inside `created_at=`.
pub const CREATED_AT_FORMAT: &str = "%Y%m%d%H%M%S";
/// How long an installed key may live.
pub const KEY_LIFETIME_SECS: i64 = 30;

/// Handle on one user's authorized_keys file.
pub struct AuthorizedKeys {
    path: PathBuf,
}

impl AuthorizedKeys {
    /// The conventional location for `user`.
    pub fn for_user(user: &str) -> Self {
        Self {
            path: PathBuf::from(format!("/home/{}/.ssh/authorized_keys", user)),
        }
    }

    /// Explicit path, for containers and tests.
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Install a session key and return the exact line written, so the
    /// session can remove precisely that line on close.
    pub async fn install(&self, key_type: &str, public_key: &str) -> Result<String, TunnelError> {
        let line = format!(
            "{} {} {} created_at={}",
            key_type,
            public_key,
            KEY_MARKER,
            Utc::now().format(CREATED_AT_FORMAT)
        );

        self.sweep().await?;

        let mut contents = self.read_lines().await?;
        contents.push(line.clone());
        self.write_lines(&contents).await?;
        Ok(line)
    }

    /// Remove exactly `line` (if still present), then sweep.
    pub async fn remove(&self, line: &str) -> Result<(), TunnelError> {
        let contents = self.read_lines().await?;
        let remaining: Vec<String> = contents.into_iter().filter(|l| l != line).collect();
        self.write_lines(&remaining).await?;
        self.sweep().await
    }

    /// Drop expired marker lines; never touch anything else.
    pub async fn sweep(&self) -> Result<(), TunnelError> {
        let now = Utc::now().naive_utc();
        let contents = self.read_lines().await?;
        let kept: Vec<String> = contents
            .into_iter()
            .filter(|line| keep_line(line, now))
            .collect();
        self.write_lines(&kept).await
    }

    async fn read_lines(&self) -> Result<Vec<String>, TunnelError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(contents
                .lines()
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(TunnelError::Internal(format!(
                "reading {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn write_lines(&self, lines: &[String]) -> Result<(), TunnelError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| TunnelError::Internal(e.to_string()))?;
        }
        let mut contents = lines.join("\n");
        if !contents.is_empty() {
            contents.push('\n');
        }
        fs::write(&self.path, contents)
            .await
            .map_err(|e| TunnelError::Internal(format!("writing {}: {}", self.path.display(), e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            fs::set_permissions(&self.path, perms)
                .await
                .map_err(|e| TunnelError::Internal(e.to_string()))?;
        }
        Ok(())
    }
}

/// A line survives a sweep unless it carries the marker AND has an expired
/// (or unparseable) `created_at=`.
fn keep_line(line: &str, now: NaiveDateTime) -> bool {
    if !line.contains(KEY_MARKER) {
        return true;
    }
    let Some(created_at) = line
        .split_whitespace()
        .find_map(|field| field.strip_prefix("created_at="))
    else {
        // marker without a timestamp: ours but unparseable, drop it
        return false;
    };
    match NaiveDateTime::parse_from_str(created_at, CREATED_AT_FORMAT) {
        Ok(created) => now - created < Duration::seconds(KEY_LIFETIME_SECS),
        Err(_) => false,
    }
}
