//! Reconciliation engine
//!
//! Resolves an (email, phone number) observation into the contact group it
//! belongs to. One call runs entirely inside a single store transaction:
//!
//! 1. Find records matching the email or phone number
//! 2. No match: create a new primary and return it
//! 3. Elect the smallest id as primary (over the matched records, or over
//!    every group they belong to, depending on [`MergeStrategy`])
//! 4. Relink the other records to the primary
//! 5. Load the primary's group
//! 6. If the observation carries an unseen email or phone, append a
//!    secondary record and reload the group
//! 7. Build the consolidated view

use identify_common::{Error, IdentityRecord, MergeStrategy, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::store::{IdentityStore, StoreTransaction};

pub mod contact;
pub mod locks;
pub mod retry;

pub use contact::{ConsolidatedContact, Observation};
pub use locks::ObservationLocks;

/// Default total time spent retrying on store lock contention
pub const DEFAULT_LOCK_RETRY_MAX_WAIT_MS: u64 = 2000;

/// Reconciliation engine over an injected identity store
pub struct Reconciler {
    store: Arc<dyn IdentityStore>,
    locks: ObservationLocks,
    strategy: MergeStrategy,
    lock_retry_max_wait_ms: u64,
}

impl Reconciler {
    pub fn new(store: Arc<dyn IdentityStore>, strategy: MergeStrategy) -> Self {
        Self {
            store,
            locks: ObservationLocks::new(),
            strategy,
            lock_retry_max_wait_ms: DEFAULT_LOCK_RETRY_MAX_WAIT_MS,
        }
    }

    /// Override how long a call keeps retrying while the store is locked
    pub fn with_lock_retry_max_wait_ms(mut self, max_wait_ms: u64) -> Self {
        self.lock_retry_max_wait_ms = max_wait_ms;
        self
    }

    /// Reconcile one observation and return the consolidated group
    ///
    /// Store failures surface as [`Error::Database`]; nothing the call wrote
    /// is committed in that case and the call may be retried as a whole.
    pub async fn reconcile(&self, observation: &Observation) -> Result<ConsolidatedContact> {
        let _guard = self.locks.acquire(observation.lock_keys()).await;

        retry::retry_on_lock("reconcile", self.lock_retry_max_wait_ms, || {
            self.reconcile_once(observation)
        })
        .await
    }

    /// Consolidated view of the group containing record `id`, without writes
    ///
    /// The group is the record's primary (its own `linked_id` target, or
    /// itself when unlinked) plus every record linked to that primary, so the
    /// requested record is always part of the result.
    pub async fn lookup(&self, id: i64) -> Result<ConsolidatedContact> {
        let mut tx = self.store.begin().await?;

        let record = tx
            .find_by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("contact {}", id)))?;
        let primary_id = record.linked_id.unwrap_or(record.id);
        let group = tx.find_by_id_or_linked_id(primary_id).await?;
        tx.commit().await?;

        let contact = self.build_contact(primary_id, &group)?;
        if contact.primary_contact_id != id && !contact.secondary_contact_ids.contains(&id) {
            error!(id, primary_id, "Lookup group does not contain the requested contact");
            return Err(Error::Invariant(format!(
                "group of {} does not contain contact {}",
                primary_id, id
            )));
        }

        Ok(contact)
    }

    async fn reconcile_once(&self, observation: &Observation) -> Result<ConsolidatedContact> {
        let mut tx = self.store.begin().await?;
        let contact = self.run(tx.as_mut(), observation).await?;
        tx.commit().await?;
        Ok(contact)
    }

    async fn run(
        &self,
        tx: &mut dyn StoreTransaction,
        observation: &Observation,
    ) -> Result<ConsolidatedContact> {
        let email = observation.email();
        let phone_number = observation.phone_number();

        let matches = tx.find_by_email_or_phone(email, phone_number).await?;
        debug!(
            email = ?email,
            phone_number = ?phone_number,
            matches = matches.len(),
            "Direct match lookup"
        );

        if matches.is_empty() {
            let record = tx.insert(email, phone_number, None).await?;
            info!(id = record.id, "Created new primary contact");
            return self.build_contact(record.id, std::slice::from_ref(&record));
        }

        let primary_id = match self.strategy {
            MergeStrategy::Direct => link_direct(tx, &matches).await?,
            MergeStrategy::Transitive => link_transitive(tx, matches).await?,
        };

        let mut group = tx.find_by_id_or_linked_id(primary_id).await?;

        if observation.is_novel_for(&group) {
            let record = tx.insert(email, phone_number, Some(primary_id)).await?;
            info!(
                id = record.id,
                primary_id, "Appended secondary contact with new information"
            );
            group = tx.find_by_id_or_linked_id(primary_id).await?;
        }

        self.build_contact(primary_id, &group)
    }

    fn build_contact(
        &self,
        primary_id: i64,
        group: &[IdentityRecord],
    ) -> Result<ConsolidatedContact> {
        ConsolidatedContact::from_group(primary_id, group).map_err(|err| {
            error!(
                primary_id,
                group_size = group.len(),
                error = %err,
                "Contact group failed consistency check"
            );
            err
        })
    }
}

/// Elect the smallest matched id and relink the other matched records to it
///
/// Records already pointing at the primary are left untouched. Secondaries
/// of a matched record that loses the election are not retargeted.
async fn link_direct(tx: &mut dyn StoreTransaction, matches: &[IdentityRecord]) -> Result<i64> {
    let primary_id = matches
        .iter()
        .map(|r| r.id)
        .min()
        .ok_or_else(|| Error::Internal("primary election over an empty match set".to_string()))?;

    let relinked = relink(tx, primary_id, matches.iter()).await?;
    if relinked > 0 {
        info!(primary_id, relinked, "Merged directly matched contacts");
    }

    Ok(primary_id)
}

/// Merge every group the matched records belong to under the smallest id
///
/// The closure follows each record's `linked_id` chain upward and collects
/// every record linked to any member, so no former secondary is left behind.
/// Downward expansion is one query per level of the link tree, not per
/// member.
async fn link_transitive(
    tx: &mut dyn StoreTransaction,
    matches: Vec<IdentityRecord>,
) -> Result<i64> {
    let mut closure: BTreeMap<i64, IdentityRecord> = BTreeMap::new();
    let mut frontier: Vec<i64> = Vec::with_capacity(matches.len());

    for record in matches {
        frontier.push(record.id);
        closure.insert(record.id, record);
    }

    while !frontier.is_empty() {
        let mut next = Vec::new();

        let mut parents: Vec<i64> = frontier
            .iter()
            .filter_map(|id| closure.get(id).and_then(|r| r.linked_id))
            .filter(|parent_id| !closure.contains_key(parent_id))
            .collect();
        parents.sort_unstable();
        parents.dedup();

        for parent_id in parents {
            match tx.find_by_id(parent_id).await? {
                Some(parent) => {
                    next.push(parent.id);
                    closure.insert(parent.id, parent);
                }
                None => warn!(parent_id, "Record links to a missing contact"),
            }
        }

        for member in tx.find_by_linked_ids(&frontier).await? {
            if !closure.contains_key(&member.id) {
                next.push(member.id);
                closure.insert(member.id, member);
            }
        }

        frontier = next;
    }

    let primary_id = closure
        .keys()
        .next()
        .copied()
        .ok_or_else(|| Error::Internal("primary election over an empty match set".to_string()))?;

    let relinked = relink(tx, primary_id, closure.values()).await?;
    if relinked > 0 {
        info!(
            primary_id,
            relinked,
            group_size = closure.len(),
            "Merged contact groups"
        );
    }

    Ok(primary_id)
}

/// Point every non-primary record at `primary_id`; returns the number of writes
async fn relink<'a>(
    tx: &mut dyn StoreTransaction,
    primary_id: i64,
    records: impl Iterator<Item = &'a IdentityRecord>,
) -> Result<usize> {
    let mut relinked = 0;

    for record in records {
        if record.id != primary_id && !record.is_linked_to(primary_id) {
            debug!(
                id = record.id,
                from = ?record.linked_id,
                to = primary_id,
                "Relinking contact"
            );
            tx.update_linked_id(record.id, primary_id).await?;
            relinked += 1;
        }
    }

    Ok(relinked)
}
