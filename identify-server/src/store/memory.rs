//! In-memory identity store
//!
//! A transaction takes the store's lock, works on a private copy of the
//! table, and publishes the copy on commit. Transactions are therefore fully
//! serialized. Committed writes are counted so callers can check that a
//! reconcile performed no redundant updates, and a failure can be injected
//! into any upcoming store call.

use async_trait::async_trait;
use chrono::Utc;
use identify_common::{Error, IdentityRecord, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{IdentityStore, StoreTransaction};

#[derive(Debug, Clone, Default)]
struct Table {
    records: Vec<IdentityRecord>,
    next_id: i64,
}

#[derive(Debug, Default)]
struct WriteCounters {
    inserts: AtomicUsize,
    updates: AtomicUsize,
    reads: AtomicUsize,
}

/// Identity store held entirely in process memory
#[derive(Clone, Default)]
pub struct MemoryStore {
    table: Arc<Mutex<Table>>,
    counters: Arc<WriteCounters>,
    /// Number of store calls left before the injected failure fires
    fail_after: Arc<StdMutex<Option<usize>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `records`, ids kept as given
    ///
    /// Lets tests build link topologies the engine would not produce itself.
    pub fn with_records(mut records: Vec<IdentityRecord>) -> Self {
        records.sort_by_key(|r| r.id);
        let next_id = records.last().map(|r| r.id + 1).unwrap_or(1);

        Self {
            table: Arc::new(Mutex::new(Table { records, next_id })),
            ..Self::default()
        }
    }

    /// Copy of every committed record, ordered by id
    pub async fn records(&self) -> Vec<IdentityRecord> {
        self.table.lock().await.records.clone()
    }

    pub async fn get(&self, id: i64) -> Option<IdentityRecord> {
        self.table.lock().await.records.iter().find(|r| r.id == id).cloned()
    }

    /// Committed inserts plus committed pointer updates
    pub fn write_count(&self) -> usize {
        self.insert_count() + self.update_count()
    }

    pub fn insert_count(&self) -> usize {
        self.counters.inserts.load(Ordering::SeqCst)
    }

    pub fn update_count(&self) -> usize {
        self.counters.updates.load(Ordering::SeqCst)
    }

    /// Lookup calls issued against the store, committed or not
    pub fn read_count(&self) -> usize {
        self.counters.reads.load(Ordering::SeqCst)
    }

    /// Let `calls` store calls succeed, then fail the next one with a
    /// store-unavailable error
    pub fn fail_after(&self, calls: usize) {
        *self.fail_after.lock().unwrap_or_else(PoisonError::into_inner) = Some(calls);
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        check_injected_failure(&self.fail_after)?;

        let guard = self.table.clone().lock_owned().await;
        let mut working = guard.clone();
        if working.next_id == 0 {
            working.next_id = 1;
        }

        Ok(Box::new(MemoryTransaction {
            guard,
            working,
            inserts: 0,
            updates: 0,
            counters: self.counters.clone(),
            fail_after: self.fail_after.clone(),
        }))
    }
}

fn check_injected_failure(fail_after: &StdMutex<Option<usize>>) -> Result<()> {
    let mut remaining = fail_after.lock().unwrap_or_else(PoisonError::into_inner);
    match *remaining {
        Some(0) => {
            *remaining = None;
            Err(Error::Database(sqlx::Error::PoolTimedOut))
        }
        Some(n) => {
            *remaining = Some(n - 1);
            Ok(())
        }
        None => Ok(()),
    }
}

/// Open in-memory transaction; discarded when dropped uncommitted
pub struct MemoryTransaction {
    guard: OwnedMutexGuard<Table>,
    working: Table,
    inserts: usize,
    updates: usize,
    counters: Arc<WriteCounters>,
    fail_after: Arc<StdMutex<Option<usize>>>,
}

impl MemoryTransaction {
    fn check(&self) -> Result<()> {
        check_injected_failure(&self.fail_after)
    }

    fn check_read(&self) -> Result<()> {
        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        self.check()
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn find_by_email_or_phone(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<IdentityRecord>> {
        self.check_read()?;

        Ok(self
            .working
            .records
            .iter()
            .filter(|r| {
                let email_hit = email.is_some() && r.email.as_deref() == email;
                let phone_hit = phone_number.is_some() && r.phone_number.as_deref() == phone_number;
                email_hit || phone_hit
            })
            .cloned()
            .collect())
    }

    async fn find_by_id(&mut self, id: i64) -> Result<Option<IdentityRecord>> {
        self.check_read()?;
        Ok(self.working.records.iter().find(|r| r.id == id).cloned())
    }

    async fn find_by_id_or_linked_id(&mut self, id: i64) -> Result<Vec<IdentityRecord>> {
        self.check_read()?;

        Ok(self
            .working
            .records
            .iter()
            .filter(|r| r.id == id || r.linked_id == Some(id))
            .cloned()
            .collect())
    }

    async fn find_by_linked_ids(&mut self, ids: &[i64]) -> Result<Vec<IdentityRecord>> {
        self.check_read()?;

        Ok(self
            .working
            .records
            .iter()
            .filter(|r| r.linked_id.is_some_and(|l| ids.contains(&l)))
            .cloned()
            .collect())
    }

    async fn insert(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
        linked_id: Option<i64>,
    ) -> Result<IdentityRecord> {
        self.check()?;

        if email.is_none() && phone_number.is_none() {
            return Err(Error::InvalidInput(
                "identity record needs an email or a phone number".to_string(),
            ));
        }
        if let Some(target) = linked_id {
            if !self.working.records.iter().any(|r| r.id == target) {
                return Err(Error::NotFound(format!("identity record {}", target)));
            }
        }

        let now = Utc::now();
        let record = IdentityRecord {
            id: self.working.next_id,
            email: email.map(str::to_string),
            phone_number: phone_number.map(str::to_string),
            linked_id,
            created_at: now,
            updated_at: now,
        };
        self.working.next_id += 1;
        self.working.records.push(record.clone());
        self.inserts += 1;

        Ok(record)
    }

    async fn update_linked_id(&mut self, id: i64, linked_id: i64) -> Result<()> {
        self.check()?;

        let record = self
            .working
            .records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::NotFound(format!("identity record {}", id)))?;
        record.linked_id = Some(linked_id);
        record.updated_at = Utc::now();
        self.updates += 1;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.check()?;

        let MemoryTransaction {
            mut guard,
            working,
            inserts,
            updates,
            counters,
            ..
        } = *self;

        *guard = working;
        counters.inserts.fetch_add(inserts, Ordering::SeqCst);
        counters.updates.fetch_add(updates, Ordering::SeqCst);

        Ok(())
    }
}
