//! Slug normalization and deterministic capture paths

use std::path::{Path, PathBuf};

use crate::PartitionKey;

/// Fallback token for text with no alphanumerics.
pub const UNKNOWN_SLUG: &str = "unknown";

/// Lowercase `value`, collapse every run of non-alphanumeric characters into
/// a single `-`, and trim hyphens from both ends.
///
/// Only ASCII letters and digits survive, so the result is safe as a path
/// segment on every platform. Applying `slug` to its own output is a no-op.
///
/// ```
/// assert_eq!(refhub::slug::slug("APC Golf!"), "apc-golf");
/// assert_eq!(refhub::slug::slug("  --  "), "unknown");
/// ```
pub fn slug(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut pending_hyphen = false;
    for c in value.trim().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }

    if out.is_empty() {
        UNKNOWN_SLUG.to_string()
    } else {
        out
    }
}

/// Output directory for a partition: `{root}/{brand}/{season}/{item}`.
pub fn partition_dir(output_root: &Path, key: &PartitionKey) -> PathBuf {
    output_root
        .join(slug(&key.brand))
        .join(slug(&key.season))
        .join(slug(&key.item))
}

/// Image path for the `index`-th (1-based) URL of a batch captured at `stamp`
/// (`YYYYMMDD_HHMMSS`).
pub fn capture_path(output_root: &Path, key: &PartitionKey, stamp: &str, index: usize) -> PathBuf {
    partition_dir(output_root, key).join(format!("{}_{:03}.jpg", stamp, index))
}
