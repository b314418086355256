//! Single-item result application

use log::debug;
use rusqlite::params;

use crate::{CaptureResult, Error, ItemStatus, ReferenceStore, Result};

impl ReferenceStore {
    /// Write a capture result onto one item.
    ///
    /// Sets image path, captured timestamp, status, error text and fit score,
    /// and always bumps `updated_at`. SUCCESS clears the error text and
    /// FAILED clears the image location, so repeated application of the same
    /// result leaves the same row. Returns `false` when `item_id` does not
    /// exist.
    pub fn apply_result(&self, item_id: &str, result: &CaptureResult) -> Result<bool> {
        let status = result.status();
        if !status.is_terminal() {
            return Err(Error::InvalidOutcome(format!(
                "{} is not a capture outcome for {}",
                status, item_id
            )));
        }

        let (image_path, captured_at, error_message) = match status {
            ItemStatus::Success => (
                result.image_path.clone().unwrap_or_default(),
                result.captured_at.clone().unwrap_or_default(),
                String::new(),
            ),
            _ => (
                String::new(),
                String::new(),
                result.error_message.clone().unwrap_or_default(),
            ),
        };

        let conn = self.lock_conn()?;
        let stamp = self.stamp(&conn)?;
        let changed = conn.execute(
            "UPDATE reference_items SET image_path = ?1, captured_at = ?2, status = ?3, \
             error_message = ?4, apc_fit_score = ?5, updated_at = ?6 \
             WHERE id = ?7",
            params![
                image_path,
                captured_at,
                status.as_str(),
                error_message,
                result.parsed_fit_score(),
                stamp,
                item_id,
            ],
        )?;
        debug!("Applied {} to {} ({} row)", status, item_id, changed);
        Ok(changed > 0)
    }
}
