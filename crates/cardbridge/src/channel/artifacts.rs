use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::stream::extract_image_paths;

use super::transport::MessagingTransport;

/// Download an inbound image into `scratch_dir` for the agent to read.
///
/// Returns the staged path, or `None` when the download failed.
pub async fn stage_input_image(
    transport: &dyn MessagingTransport,
    scratch_dir: &Path,
    message_id: &str,
    image_key: &str,
) -> Option<PathBuf> {
    if let Err(e) = tokio::fs::create_dir_all(scratch_dir).await {
        tracing::warn!(dir = %scratch_dir.display(), error = %e, "failed to create scratch dir");
        return None;
    }
    let dest = scratch_dir.join(format!("{}.png", Uuid::new_v4()));
    match transport
        .download_input_artifact(message_id, image_key, &dest)
        .await
    {
        Ok(()) => {
            tracing::debug!(message_id, path = %dest.display(), "staged input image");
            Some(dest)
        }
        Err(e) => {
            tracing::warn!(message_id, error = %e, "failed to download input image");
            remove_staged(&dest).await;
            None
        }
    }
}

/// Append a reference to the staged image, or a note that it is missing.
pub fn splice_image_prompt(prompt: &str, staged: Option<&Path>) -> String {
    let note = match staged {
        Some(path) => format!(
            "[The user attached an image, saved at {}. Read it before answering.]",
            path.display()
        ),
        None => "[The user attached an image, but it could not be downloaded.]".to_string(),
    };
    if prompt.trim().is_empty() {
        note
    } else {
        format!("{prompt}\n\n{note}")
    }
}

/// Delete a staged input file. A file that is already gone is fine.
pub async fn remove_staged(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove staged file"),
    }
}

/// Images written by the agent plus any absolute image paths its answer mentions.
pub fn collect_output_artifacts(written: &[PathBuf], final_text: &str) -> Vec<PathBuf> {
    let mut all = written.to_vec();
    for path in extract_image_paths(final_text) {
        if !all.contains(&path) {
            all.push(path);
        }
    }
    all
}

/// Upload and post each deliverable artifact. Returns how many were sent.
///
/// A file is skipped unless it exists, is a regular non-empty file and fits
/// under `max_bytes`. Upload and send failures are logged per file.
pub async fn deliver_output_artifacts(
    transport: &dyn MessagingTransport,
    context_id: &str,
    candidates: &[PathBuf],
    max_bytes: u64,
) -> usize {
    let mut sent = 0;
    for path in candidates {
        let meta = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "skipping missing artifact");
                continue;
            }
        };
        if !meta.is_file() || meta.len() == 0 || meta.len() > max_bytes {
            tracing::debug!(
                path = %path.display(),
                size = meta.len(),
                "skipping artifact outside size limits"
            );
            continue;
        }

        let key = match transport.upload_artifact(path).await {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "artifact upload failed");
                continue;
            }
        };
        match transport.send_artifact_message(context_id, &key).await {
            Ok(()) => sent += 1,
            Err(e) => {
                tracing::warn!(context_id, path = %path.display(), error = %e, "artifact send failed")
            }
        }
    }
    sent
}
