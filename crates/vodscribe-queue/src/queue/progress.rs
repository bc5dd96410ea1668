//! Per-item progress reporting.

use std::sync::Arc;

use crate::Result;
use crate::store::BatchStore;

/// Progress callback handed to a processor for one queue item.
///
/// Each call persists the latest value through the store. Calls for the
/// same item are serialized because the processor awaits the
/// acknowledgement; updates for different items are not ordered relative
/// to each other.
#[derive(Clone)]
pub struct ProgressHandle {
    item_id: String,
    store: Arc<dyn BatchStore>,
}

impl ProgressHandle {
    pub fn new(item_id: impl Into<String>, store: Arc<dyn BatchStore>) -> Self {
        Self {
            item_id: item_id.into(),
            store,
        }
    }

    /// Report progress for the item. `percent` is clamped to [0, 100].
    pub async fn update(&self, percent: f32, stage: Option<&str>) -> Result<()> {
        let percent = percent.clamp(0.0, 100.0);
        self.store
            .update_item_progress(&self.item_id, percent, stage)
            .await
    }

    /// The item this handle reports for.
    pub fn item_id(&self) -> &str {
        &self.item_id
    }
}
