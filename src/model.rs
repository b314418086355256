//! Data model for reference items and capture outcomes

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Names of the seven free-text classification tag columns, in table order.
pub const TAG_COLUMNS: [&str; 7] = [
    "SILHOUETTE",
    "COLOR",
    "DETAIL",
    "MATERIAL",
    "MOOD",
    "FUNCTION",
    "USE_CASE",
];

/// Persisted columns in display/export order.
pub const COLUMNS: [&str; 21] = [
    "id",
    "brand",
    "season",
    "item",
    "source_url",
    "image_path",
    "captured_at",
    "SILHOUETTE",
    "COLOR",
    "DETAIL",
    "MATERIAL",
    "MOOD",
    "FUNCTION",
    "USE_CASE",
    "fit_key",
    "apc_fit_score",
    "notes",
    "status",
    "error_message",
    "created_at",
    "updated_at",
];

/// Lifecycle state of a reference item.
///
/// ```text
/// PENDING --claim--> PROCESSING --apply--> SUCCESS
///    ^                              \----> FAILED --reset--> PENDING
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ItemStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

impl ItemStatus {
    /// All states, in lifecycle order.
    pub const ALL: [ItemStatus; 4] = [
        ItemStatus::Pending,
        ItemStatus::Processing,
        ItemStatus::Success,
        ItemStatus::Failed,
    ];

    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "PENDING",
            ItemStatus::Processing => "PROCESSING",
            ItemStatus::Success => "SUCCESS",
            ItemStatus::Failed => "FAILED",
        }
    }

    /// SUCCESS and FAILED end an orchestration run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Success | ItemStatus::Failed)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(ItemStatus::Pending),
            "PROCESSING" => Ok(ItemStatus::Processing),
            "SUCCESS" => Ok(ItemStatus::Success),
            "FAILED" => Ok(ItemStatus::Failed),
            other => Err(Error::Other(format!("unknown item status '{}'", other))),
        }
    }
}

/// The seven classification tag slots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tags {
    pub silhouette: String,
    pub color: String,
    pub detail: String,
    pub material: String,
    pub mood: String,
    pub function: String,
    pub use_case: String,
}

impl Tags {
    /// Tag values in [`TAG_COLUMNS`] order.
    pub fn values(&self) -> [&str; 7] {
        [
            &self.silhouette,
            &self.color,
            &self.detail,
            &self.material,
            &self.mood,
            &self.function,
            &self.use_case,
        ]
    }
}

/// A new capture request: the dedup partition of an item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NewReference {
    pub brand: String,
    pub season: String,
    pub item: String,
    pub source_url: String,
}

impl NewReference {
    pub fn new(
        brand: impl Into<String>,
        season: impl Into<String>,
        item: impl Into<String>,
        source_url: impl Into<String>,
    ) -> Self {
        Self {
            brand: brand.into(),
            season: season.into(),
            item: item.into(),
            source_url: source_url.into(),
        }
    }
}

/// A persisted reference item (one row of the reference store).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceItem {
    pub id: String,
    pub brand: String,
    pub season: String,
    pub item: String,
    pub source_url: String,
    /// Empty until captured
    pub image_path: String,
    /// Empty until captured
    pub captured_at: String,
    pub tags: Tags,
    pub fit_key: String,
    pub fit_score: Option<i64>,
    pub notes: String,
    pub status: ItemStatus,
    /// Non-empty only while FAILED
    pub error_message: String,
    pub created_at: String,
    pub updated_at: String,
}

impl ReferenceItem {
    /// The (brand, season, item) triple that groups captures into one session.
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey {
            brand: self.brand.clone(),
            season: self.season.clone(),
            item: self.item.clone(),
        }
    }
}

/// Grouping key for render sessions and output directories.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub brand: String,
    pub season: String,
    pub item: String,
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.brand, self.season, self.item)
    }
}

/// Result payload consumed by [`ReferenceStore::apply_result`](crate::ReferenceStore::apply_result).
///
/// Every field is optional; absent text fields are written as empty
/// strings and an absent status means FAILED.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureResult {
    #[serde(default)]
    pub status: Option<ItemStatus>,
    #[serde(default)]
    pub image_path: Option<String>,
    #[serde(default)]
    pub captured_at: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Parsed best-effort: integers and integer strings are kept, anything else is dropped.
    #[serde(default, alias = "apc_fit_score")]
    pub fit_score: Option<serde_json::Value>,
}

impl CaptureResult {
    pub fn success(image_path: impl Into<String>, captured_at: impl Into<String>) -> Self {
        Self {
            status: Some(ItemStatus::Success),
            image_path: Some(image_path.into()),
            captured_at: Some(captured_at.into()),
            error_message: None,
            fit_score: None,
        }
    }

    pub fn failure(error_message: impl Into<String>) -> Self {
        Self {
            status: Some(ItemStatus::Failed),
            image_path: None,
            captured_at: None,
            error_message: Some(error_message.into()),
            fit_score: None,
        }
    }

    /// Status to write; absent means FAILED.
    pub fn status(&self) -> ItemStatus {
        self.status.unwrap_or(ItemStatus::Failed)
    }

    /// Fit score as an integer, or `None` when absent or unparsable.
    pub fn parsed_fit_score(&self) -> Option<i64> {
        match self.fit_score.as_ref()? {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }
}

/// Per-URL outcome emitted by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOutcome {
    pub item_id: String,
    pub source_url: String,
    /// 1-based position in the submitted batch
    pub index: usize,
    /// Number of render attempts made (0 when the session never opened)
    pub attempts: u32,
    pub result: CaptureResult,
}

impl CaptureOutcome {
    pub fn is_success(&self) -> bool {
        self.result.status() == ItemStatus::Success
    }
}

/// Manual post-capture edit of tags and metadata.
///
/// Edits never touch status, image location or error text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemEdit {
    pub id: String,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default)]
    pub fit_key: String,
    #[serde(default)]
    pub fit_score: Option<i64>,
    #[serde(default)]
    pub notes: String,
}

/// Aggregate result of an enqueue call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnqueueReport {
    pub inserted: usize,
    pub duplicated: usize,
}

/// Per-status item counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub processing: usize,
    pub success: usize,
    pub failed: usize,
    pub total: usize,
}

impl StatusCounts {
    pub fn get(&self, status: ItemStatus) -> usize {
        match status {
            ItemStatus::Pending => self.pending,
            ItemStatus::Processing => self.processing,
            ItemStatus::Success => self.success,
            ItemStatus::Failed => self.failed,
        }
    }
}

/// Listing filter; blank text fields match everything.
#[derive(Debug, Clone)]
pub struct ListFilter {
    pub brand: String,
    pub season: String,
    pub item: String,
    pub status: Option<ItemStatus>,
    pub limit: usize,
}

impl Default for ListFilter {
    fn default() -> Self {
        Self {
            brand: String::new(),
            season: String::new(),
            item: String::new(),
            status: None,
            limit: 5000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_roundtrips_through_str() {
        for status in ItemStatus::ALL {
            assert_eq!(status.as_str().parse::<ItemStatus>().unwrap(), status);
        }
        assert_eq!(" failed ".parse::<ItemStatus>().unwrap(), ItemStatus::Failed);
        assert!("DONE".parse::<ItemStatus>().is_err());
    }

    #[test]
    fn only_success_and_failed_are_terminal() {
        assert!(!ItemStatus::Pending.is_terminal());
        assert!(!ItemStatus::Processing.is_terminal());
        assert!(ItemStatus::Success.is_terminal());
        assert!(ItemStatus::Failed.is_terminal());
    }

    #[test]
    fn fit_score_is_best_effort() {
        let mut r = CaptureResult::success("a.jpg", "2026-01-01T00:00:00");
        assert_eq!(r.parsed_fit_score(), None);

        r.fit_score = Some(json!(7));
        assert_eq!(r.parsed_fit_score(), Some(7));

        r.fit_score = Some(json!(" 42 "));
        assert_eq!(r.parsed_fit_score(), Some(42));

        r.fit_score = Some(json!("high"));
        assert_eq!(r.parsed_fit_score(), None);

        r.fit_score = Some(json!(3.5));
        assert_eq!(r.parsed_fit_score(), None);

        r.fit_score = Some(json!(null));
        assert_eq!(r.parsed_fit_score(), None);
    }

    #[test]
    fn result_payload_defaults() {
        let r: CaptureResult = serde_json::from_str(r#"{"apc_fit_score": "5"}"#).unwrap();
        assert_eq!(r.status(), ItemStatus::Failed);
        assert_eq!(r.image_path, None);
        assert_eq!(r.parsed_fit_score(), Some(5));

        let r: CaptureResult =
            serde_json::from_str(r#"{"status": "SUCCESS", "image_path": "x.jpg"}"#).unwrap();
        assert_eq!(r.status(), ItemStatus::Success);
    }

    #[test]
    fn tag_values_follow_column_order() {
        let tags = Tags {
            silhouette: "boxy".into(),
            use_case: "range".into(),
            ..Default::default()
        };
        let values = tags.values();
        assert_eq!(values[0], "boxy");
        assert_eq!(values[6], "range");
        assert_eq!(TAG_COLUMNS[6], "USE_CASE");
        assert_eq!(&COLUMNS[7..14], &TAG_COLUMNS[..]);
    }
}
