//! Store records: canonical reference entries and target collection items

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Compact, serializable representation of an item's text.
///
/// Opaque to the orchestration core: it is embedded in prompts verbatim
/// and never inspected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// An entry of the canonical reference collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntry {
    pub id: String,
    pub text: String,
    /// False for entries created from NEW proposals until a human confirms them
    #[serde(default = "default_verified")]
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_collection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

fn default_verified() -> bool {
    true
}

impl CanonicalEntry {
    /// A verified entry, as imported from the reference collection.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            verified: true,
            origin_item_id: None,
            origin_collection_id: None,
            created_at: None,
        }
    }

    /// An unverified entry proposed from a target item that matched nothing.
    pub fn unverified_from(id: impl Into<String>, item: &TargetItem) -> Self {
        Self {
            id: id.into(),
            text: item.text.clone(),
            verified: false,
            origin_item_id: Some(item.id.clone()),
            origin_collection_id: Some(item.collection_id.clone()),
            created_at: Some(Utc::now()),
        }
    }
}

/// An item of a target collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetItem {
    pub id: String,
    pub collection_id: String,
    pub text: String,
    /// Canonical entry this item corresponds to, once assigned
    #[serde(default)]
    pub correspondence: Option<String>,
}

impl TargetItem {
    pub fn new(
        id: impl Into<String>,
        collection_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            collection_id: collection_id.into(),
            text: text.into(),
            correspondence: None,
        }
    }

    pub fn with_correspondence(mut self, reference_id: impl Into<String>) -> Self {
        self.correspondence = Some(reference_id.into());
        self
    }
}
