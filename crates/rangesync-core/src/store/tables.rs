// Table layout shared by the built-in stores.
//
// Records are partitioned by scope and sorted by range key inside each
// partition, mirroring the keyed-table layout the store contract describes.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::model::{RangeRecord, Scope, ScopeLease, SyncToken};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct RangeTables {
    #[serde(default)]
    pub(crate) partitions: HashMap<Scope, BTreeMap<String, RangeRecord>>,
    #[serde(default)]
    pub(crate) sync_tokens: HashMap<Scope, SyncToken>,
    #[serde(default)]
    pub(crate) leases: HashMap<Scope, ScopeLease>,
}

impl RangeTables {
    pub(crate) fn put(&mut self, record: &RangeRecord) {
        self.partitions
            .entry(record.scope.clone())
            .or_default()
            .insert(record.range_key.clone(), record.clone());
    }

    /// Upsert unless a newer batch already confirmed the key
    ///
    /// Returns whether the record was written.
    pub(crate) fn put_if_not_older(&mut self, record: &RangeRecord) -> bool {
        let partition = self.partitions.entry(record.scope.clone()).or_default();
        if let Some(existing) = partition.get(&record.range_key)
            && existing.sync_token > record.sync_token
        {
            return false;
        }
        partition.insert(record.range_key.clone(), record.clone());
        true
    }

    pub(crate) fn get(&self, scope: &Scope, range_key: &str) -> Option<RangeRecord> {
        self.partitions
            .get(scope)
            .and_then(|partition| partition.get(range_key))
            .cloned()
    }

    pub(crate) fn query_scope(&self, scope: &Scope) -> Vec<RangeRecord> {
        self.partitions
            .get(scope)
            .map(|partition| partition.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn query_sync_token(&self, token: SyncToken) -> Vec<RangeRecord> {
        let mut records: Vec<RangeRecord> = self
            .partitions
            .values()
            .flat_map(|partition| partition.values())
            .filter(|record| record.sync_token == token)
            .cloned()
            .collect();
        records.sort_by(|a, b| (&a.scope, &a.range_key).cmp(&(&b.scope, &b.range_key)));
        records
    }

    /// Returns whether anything was removed
    pub(crate) fn delete(&mut self, scope: &Scope, range_key: &str) -> bool {
        let Some(partition) = self.partitions.get_mut(scope) else {
            return false;
        };
        let removed = partition.remove(range_key).is_some();
        if partition.is_empty() {
            self.partitions.remove(scope);
        }
        removed
    }

    pub(crate) fn latest_sync_token(&self, scope: &Scope) -> Option<SyncToken> {
        self.sync_tokens.get(scope).copied()
    }

    /// Returns whether the ledger changed; it never moves backwards
    pub(crate) fn record_sync_token(&mut self, scope: &Scope, token: SyncToken) -> bool {
        match self.sync_tokens.get(scope) {
            Some(latest) if *latest >= token => false,
            _ => {
                self.sync_tokens.insert(scope.clone(), token);
                true
            }
        }
    }

    pub(crate) fn acquire_lease(
        &mut self,
        scope: &Scope,
        holder: &str,
        ttl: std::time::Duration,
    ) -> bool {
        if let Some(existing) = self.leases.get(scope)
            && !existing.can_be_taken_by(holder)
        {
            return false;
        }
        self.leases
            .insert(scope.clone(), ScopeLease::new(holder, ttl));
        true
    }

    /// Returns whether a lease was released
    pub(crate) fn release_lease(&mut self, scope: &Scope, holder: &str) -> bool {
        match self.leases.get(scope) {
            Some(lease) if lease.holder == holder => {
                self.leases.remove(scope);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn record_count(&self) -> usize {
        self.partitions.values().map(BTreeMap::len).sum()
    }
}
