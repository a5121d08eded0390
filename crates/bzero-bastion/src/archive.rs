//! Building `archive.zip` for the log upload endpoint.

use std::io::{Cursor, Write};
use std::path::Path;

use chrono::{Duration, Utc};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::{BastionError, BastionResult};

/// Cap on in-cluster pod logs.
pub const POD_LOG_BYTE_CAP: i64 = 200 * 1024 * 1024;
/// How far back pod logs reach.
pub const POD_LOG_WINDOW_HOURS: i64 = 48;
/// How many rotated files ride along with the live log.
const MAX_ROTATED_FILES: usize = 2;

/// Host agents: zip the live log plus up to two rotated files whose names
/// carry today's or yesterday's date (`YYYY-MM-DD`), newest first.
pub fn build_host_archive(log_path: &Path) -> BastionResult<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();

    let live = std::fs::read(log_path)
        .map_err(|e| BastionError::Archive(format!("reading {}: {}", log_path.display(), e)))?;
    let live_name = log_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "agent.log".into());
    writer
        .start_file(live_name.as_str(), options)
        .map_err(|e| BastionError::Archive(e.to_string()))?;
    writer
        .write_all(&live)
        .map_err(|e| BastionError::Archive(e.to_string()))?;

    for (name, contents) in recent_rotated_logs(log_path)? {
        writer
            .start_file(name.as_str(), options)
            .map_err(|e| BastionError::Archive(e.to_string()))?;
        writer
            .write_all(&contents)
            .map_err(|e| BastionError::Archive(e.to_string()))?;
    }

    let cursor = writer
        .finish()
        .map_err(|e| BastionError::Archive(e.to_string()))?;
    Ok(cursor.into_inner())
}

fn recent_rotated_logs(log_path: &Path) -> BastionResult<Vec<(String, Vec<u8>)>> {
    let Some(dir) = log_path.parent() else {
        return Ok(Vec::new());
    };
    let live_name = log_path.file_name().unwrap_or_default();

    let today = Utc::now().format("%Y-%m-%d").to_string();
    let yesterday = (Utc::now() - Duration::days(1)).format("%Y-%m-%d").to_string();

    let mut candidates: Vec<(std::time::SystemTime, String, std::path::PathBuf)> = Vec::new();
    let entries = std::fs::read_dir(dir).map_err(|e| BastionError::Archive(e.to_string()))?;
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_name() == live_name {
            continue;
        }
        if !name.contains(&today) && !name.contains(&yesterday) {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        candidates.push((modified, name, path));
    }

    // newest first
    candidates.sort_by(|a, b| b.0.cmp(&a.0));
    candidates.truncate(MAX_ROTATED_FILES);

    let mut out = Vec::new();
    for (_, name, path) in candidates {
        let contents =
            std::fs::read(&path).map_err(|e| BastionError::Archive(e.to_string()))?;
        out.push((name, contents));
    }
    Ok(out)
}

/// Kubernetes agents: zip this pod's own recent logs, streamed through the
/// API server, capped in both time and size.
pub async fn build_pod_archive(
    client: kube::Client,
    namespace: &str,
    pod_name: &str,
) -> BastionResult<Vec<u8>> {
    use k8s_openapi::api::core::v1::Pod;
    use kube::api::LogParams;

    let pods: kube::Api<Pod> = kube::Api::namespaced(client, namespace);
    let logs = pods
        .logs(
            pod_name,
            &LogParams {
                since_seconds: Some(POD_LOG_WINDOW_HOURS * 3600),
                limit_bytes: Some(POD_LOG_BYTE_CAP),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| BastionError::Archive(format!("pod logs: {}", e)))?;

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file(format!("{}.log", pod_name), SimpleFileOptions::default())
        .map_err(|e| BastionError::Archive(e.to_string()))?;
    writer
        .write_all(logs.as_bytes())
        .map_err(|e| BastionError::Archive(e.to_string()))?;
    let cursor = writer
        .finish()
        .map_err(|e| BastionError::Archive(e.to_string()))?;
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_names(archive_bytes: &[u8]) -> Vec<String> {
        let mut archive = zip::ZipArchive::new(Cursor::new(archive_bytes.to_vec())).unwrap();
        (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect()
    }

    #[test]
    fn test_archive_contains_live_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("agent.log");
        std::fs::write(&log, "live output\n").unwrap();

        let bytes = build_host_archive(&log).unwrap();
        assert_eq!(entry_names(&bytes), vec!["agent.log"]);
    }

    #[test]
    fn test_archive_picks_dated_rotations_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("agent.log");
        std::fs::write(&log, "live\n").unwrap();

        let today = Utc::now().format("%Y-%m-%d").to_string();
        let old = dir.path().join("agent-2001-01-01.log");
        std::fs::write(&old, "ancient\n").unwrap();
        let r1 = dir.path().join(format!("agent-{}.0.log", today));
        std::fs::write(&r1, "rotation one\n").unwrap();
        let r2 = dir.path().join(format!("agent-{}.1.log", today));
        std::fs::write(&r2, "rotation two\n").unwrap();
        let r3 = dir.path().join(format!("agent-{}.2.log", today));
        std::fs::write(&r3, "rotation three\n").unwrap();

        let bytes = build_host_archive(&log).unwrap();
        let names = entry_names(&bytes);
        assert_eq!(names[0], "agent.log");
        // at most two rotations, never the undated ancient file
        assert_eq!(names.len(), 3);
        assert!(!names.iter().any(|n| n.contains("2001")));
    }
}
