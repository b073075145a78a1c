//! Roster reads: unread counts and the recent-contacts list.
//!
//! Both are pure reads over the store, safe to run concurrently with
//! the write paths. They see a point-in-time snapshot, not a
//! transactional view.

use std::collections::HashMap;
use std::sync::Arc;

use parley_core::{Error, IdentityId, Result};

use crate::storage::{ContactSummary, Store};

pub struct Roster {
    store: Arc<Store>,
}

impl Roster {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Unread message count per counterparty, keyed by username.
    pub fn unread_counts(&self, identity_id: &IdentityId) -> Result<HashMap<String, i64>> {
        self.require(identity_id)?;
        self.store.unread_counts(identity_id).map_err(Error::store)
    }

    /// Counterparties ever exchanged with, most recent message first.
    /// Ordering is query-derived recency; the incrementally appended
    /// contact set only guarantees membership.
    pub fn contacts_for(&self, identity_id: &IdentityId) -> Result<Vec<ContactSummary>> {
        self.require(identity_id)?;
        self.store
            .contact_summaries(identity_id)
            .map_err(Error::store)
    }

    /// Membership of the appended contact set, insertion-ordered.
    pub fn contact_members(&self, identity_id: &IdentityId) -> Result<Vec<IdentityId>> {
        self.require(identity_id)?;
        self.store
            .recent_contact_ids(identity_id)
            .map_err(Error::store)
    }

    fn require(&self, identity_id: &IdentityId) -> Result<()> {
        self.store
            .find_identity(identity_id)
            .map_err(Error::store)?
            .ok_or_else(|| Error::not_found(format!("identity {identity_id}")))?;
        Ok(())
    }
}
