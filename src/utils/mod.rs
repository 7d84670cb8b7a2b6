//! Shared filesystem utilities.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

const WRITE_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Write a JSON value to `path` atomically: serialize to a temporary file
/// in the target directory, then rename over the destination. Transient
/// failures are retried up to `retries` additional times.
pub async fn write_json_file_atomic(
    value: &serde_json::Value,
    path: &Path,
    retries: u32,
) -> std::io::Result<()> {
    let mut attempt = 0;
    loop {
        match try_write_atomic(value, path) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < retries => {
                attempt += 1;
                debug!(
                    "Atomic write of {} failed (attempt {}): {}",
                    path.display(),
                    attempt,
                    e
                );
                tokio::time::sleep(WRITE_RETRY_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn try_write_atomic(value: &serde_json::Value, path: &Path) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Concatenate per-item result artifacts into one `results.json` in the
/// batch directory.
///
/// Each source file is expected to have produced `<stem>.json` in
/// `base_path`; files that produced nothing (failed or skipped items) are
/// left out of the combined document.
pub async fn combine_result_files(files: &[PathBuf], base_path: &Path) -> std::io::Result<()> {
    let mut combined = Vec::with_capacity(files.len());
    for file in files {
        let Some(stem) = file.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let artifact = base_path.join(format!("{stem}.json"));
        match tokio::fs::read(&artifact).await {
            Ok(bytes) => match serde_json::from_slice::<serde_json::Value>(&bytes) {
                Ok(value) => combined.push(value),
                Err(e) => warn!("Skipping unparsable result artifact {}: {}", artifact.display(), e),
            },
            Err(_) => debug!("No result artifact for {}", file.display()),
        }
    }
    write_json_file_atomic(
        &serde_json::Value::Array(combined),
        &base_path.join("results.json"),
        3,
    )
    .await
}
