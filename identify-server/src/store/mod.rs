//! Identity store capability
//!
//! The engine never talks to a database directly. It opens a
//! [`StoreTransaction`] per reconcile call and runs every lookup, insert, and
//! pointer update through it. Dropping a transaction without calling
//! [`StoreTransaction::commit`] rolls back everything it wrote.

use async_trait::async_trait;
use identify_common::{IdentityRecord, Result};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Source of transactional scopes over the identity table
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Acquire a connection and open a transaction on it
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;
}

/// One open transaction against the identity table
///
/// All lookups return records ordered by ascending id.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Records whose email equals `email` or whose phone number equals
    /// `phone_number`. A `None` argument matches nothing.
    async fn find_by_email_or_phone(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<IdentityRecord>>;

    async fn find_by_id(&mut self, id: i64) -> Result<Option<IdentityRecord>>;

    /// The record `id` plus every record whose `linked_id` is `id`
    async fn find_by_id_or_linked_id(&mut self, id: i64) -> Result<Vec<IdentityRecord>>;

    /// Every record whose `linked_id` is one of `ids`, in a single query.
    /// An empty `ids` matches nothing.
    async fn find_by_linked_ids(&mut self, ids: &[i64]) -> Result<Vec<IdentityRecord>>;

    /// Create a record; the store assigns the id
    async fn insert(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
        linked_id: Option<i64>,
    ) -> Result<IdentityRecord>;

    /// Point record `id` at `linked_id`
    async fn update_linked_id(&mut self, id: i64, linked_id: i64) -> Result<()>;

    /// Make every write in this scope durable and release the connection
    async fn commit(self: Box<Self>) -> Result<()>;
}
