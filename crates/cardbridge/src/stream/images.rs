use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

/// Extensions the chat platform can display inline.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp"];

// An absolute path made of non-space, non-quote characters ending in an image extension.
static IMAGE_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:^|[\s(\[<"'`=])(/[^\s"'`()<>\[\]]+\.(?:png|jpe?g|gif|webp|bmp))\b"#)
        .unwrap()
});

pub fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Find absolute image paths mentioned anywhere in `text`.
///
/// Catches images the agent produced by other means (scripts, renderers) and
/// only mentions in its answer. Results are deduplicated in first-seen order.
pub fn extract_image_paths(text: &str) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = Vec::new();
    for caps in IMAGE_PATH_RE.captures_iter(text) {
        let path = PathBuf::from(&caps[1]);
        if !found.contains(&path) {
            found.push(path);
        }
    }
    found
}
