use serde::{Deserialize, Serialize};
use wideworlds_types::Prop;

/// One message on the world-update channel. Create and update carry full
/// prop records; delete carries ids only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "data", rename_all = "lowercase")]
pub enum WorldUpdate {
    Create(Vec<Prop>),
    Update(Vec<Prop>),
    Delete(Vec<u32>),
}

/// Per-id outcome of a batched prop write: `Some(true)` applied,
/// `Some(false)` unauthorized, `None` unknown id.
pub type BatchStatus = std::collections::HashMap<u32, Option<bool>>;
