//! Database models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One stored observation plus its linkage to the group primary
///
/// `linked_id` is the only field rewritten after creation. `None` means the
/// record is unlinked or is itself the primary of its group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: i64,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub linked_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IdentityRecord {
    /// True when this record's pointer already targets `primary_id`
    pub fn is_linked_to(&self, primary_id: i64) -> bool {
        self.linked_id == Some(primary_id)
    }
}
