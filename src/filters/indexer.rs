//! Filter indexes: tenant-scoped reverse maps from rule signatures to the
//! profiles that use them.
//!
//! A signature is `<kind>:<field>:<value>`, e.g. `*string:Account:1001`.
//! Profiles with nothing indexable live under [`NONE_SIGNATURE`], which every
//! lookup includes. Indexes are persisted under `fii_` keys and read through
//! the cache; every writer holds the data manager's index lock.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::IndexingOpts;
use crate::error::{MonitorError, MonitorResult, ValidationError};
use crate::event::{field_paths, field_value, value_as_string, CgrEvent};
use crate::storage::keys::{id_from_key, ItemKind};
use crate::storage::DataManager;

use super::{FilterRule, RuleKind};

/// Signature → profile ids.
pub type FilterIndex = BTreeMap<String, BTreeSet<String>>;

/// Bucket for profiles without indexable rules.
pub const NONE_SIGNATURE: &str = "*none:*any:*any";

fn signature(kind: RuleKind, field: &str, value: &str) -> String {
    format!("{kind}:{field}:{value}")
}

/// Index maintenance and lookup over one data manager.
pub struct FilterIndexer<'a> {
    dm: &'a DataManager,
}

impl<'a> FilterIndexer<'a> {
    #[must_use]
    pub const fn new(dm: &'a DataManager) -> Self {
        Self { dm }
    }

    /// Signatures a profile with these filters is registered under.
    ///
    /// # Errors
    ///
    /// `UnknownFilter` if a stored filter is missing, or a malformed inline
    /// rule.
    pub fn signatures_for(&self, tenant: &str, filter_ids: &[String]) -> MonitorResult<BTreeSet<String>> {
        let mut sigs = BTreeSet::new();
        let mut add = |rule: &FilterRule| {
            if rule.is_indexable() {
                for v in &rule.values {
                    sigs.insert(signature(rule.kind, rule.field_path(), v));
                }
            }
        };

        for fid in filter_ids {
            if fid.starts_with('*') {
                add(&FilterRule::parse_inline(fid)?);
                continue;
            }
            let filter = self.dm.get_filter(tenant, fid, true, true).map_err(|e| match e {
                MonitorError::NotFound => ValidationError::UnknownFilter {
                    filter_id: fid.clone(),
                }
                .into(),
                other => other,
            })?;
            filter.rules.iter().for_each(&mut add);
        }

        if sigs.is_empty() {
            sigs.insert(NONE_SIGNATURE.to_string());
        }
        Ok(sigs)
    }

    /// Registers `item_id` under every signature of its filters, replacing
    /// any previous registration.
    ///
    /// # Errors
    ///
    /// Signature resolution or storage failures.
    pub fn index_item(
        &self,
        kind: ItemKind,
        tenant_ctx: &str,
        tenant: &str,
        item_id: &str,
        filter_ids: &[String],
    ) -> MonitorResult<()> {
        let sigs = self.signatures_for(tenant, filter_ids)?;
        let _guard = self.dm.lock_indexes();
        let mut index = (*self.dm.get_filter_index(kind, tenant_ctx)?).clone();
        remove_from(&mut index, item_id);
        for sig in sigs {
            index.entry(sig).or_default().insert(item_id.to_string());
        }
        self.store_indexes(kind, tenant_ctx, index)
    }

    /// Drops `item_id` from every signature of the index.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub fn remove_item(&self, kind: ItemKind, tenant_ctx: &str, item_id: &str) -> MonitorResult<()> {
        let _guard = self.dm.lock_indexes();
        let mut index = (*self.dm.get_filter_index(kind, tenant_ctx)?).clone();
        if remove_from(&mut index, item_id) {
            self.store_indexes(kind, tenant_ctx, index)?;
        }
        Ok(())
    }

    /// Writes a whole index to storage and cache. Callers hold the index lock.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub fn store_indexes(&self, kind: ItemKind, tenant_ctx: &str, index: FilterIndex) -> MonitorResult<()> {
        self.dm.set_filter_index(kind, tenant_ctx, index)
    }

    /// Rebuilds the tenant's index from the stored profiles. Returns the
    /// number of profiles indexed.
    ///
    /// # Errors
    ///
    /// Storage failures or a profile referencing a missing filter.
    pub fn reindex(&self, kind: ItemKind, tenant: &str) -> MonitorResult<usize> {
        let ids = self.dm.profile_ids(kind, tenant)?;
        let mut index = FilterIndex::new();
        for id in &ids {
            let filter_ids = match self.dm.profile_filter_ids(kind, tenant, id) {
                Ok(f) => f,
                Err(MonitorError::NotFound) => continue,
                Err(e) => return Err(e),
            };
            for sig in self.signatures_for(tenant, &filter_ids)? {
                index.entry(sig).or_default().insert(id.clone());
            }
        }
        let _guard = self.dm.lock_indexes();
        self.store_indexes(kind, tenant, index)?;
        tracing::debug!(?kind, tenant, profiles = ids.len(), "rebuilt filter index");
        Ok(ids.len())
    }

    /// Profiles of the tenant whose own filter ids name `filter_id`.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub fn filter_users(&self, tenant: &str, filter_id: &str) -> MonitorResult<Vec<(ItemKind, String, Vec<String>)>> {
        let mut users = Vec::new();
        for kind in ItemKind::ALL {
            for id in self.dm.profile_ids(kind, tenant)? {
                let filter_ids = match self.dm.profile_filter_ids(kind, tenant, &id) {
                    Ok(f) => f,
                    Err(MonitorError::NotFound) => continue,
                    Err(e) => return Err(e),
                };
                if filter_ids.iter().any(|f| f == filter_id) {
                    users.push((kind, id, filter_ids));
                }
            }
        }
        Ok(users)
    }

    /// Re-registers every profile using `filter_id` against its current
    /// rules. Returns the number of profiles touched.
    ///
    /// # Errors
    ///
    /// Storage failures or a profile referencing a missing filter.
    pub fn reindex_filter_users(&self, tenant: &str, filter_id: &str) -> MonitorResult<usize> {
        let users = self.filter_users(tenant, filter_id)?;
        for (kind, id, filter_ids) in &users {
            self.index_item(*kind, tenant, tenant, id, filter_ids)?;
        }
        if !users.is_empty() {
            tracing::debug!(tenant, filter = filter_id, profiles = users.len(), "reindexed filter users");
        }
        Ok(users.len())
    }

    /// Candidate profile ids for an event.
    ///
    /// Union of exact `*string` hits, longest-prefix `*prefix` hits and the
    /// `*none` bucket, or every profile of the tenant when indexing is off.
    /// Ids may be stale; callers skip profiles that no longer exist.
    ///
    /// # Errors
    ///
    /// `NotFound` when no candidate exists.
    pub fn matching_item_ids_for_event(
        &self,
        event: &CgrEvent,
        opts: &IndexingOpts,
        kind: ItemKind,
        tenant_ctx: &str,
    ) -> MonitorResult<BTreeSet<String>> {
        if opts.full_scan() {
            let ids: BTreeSet<String> = self.dm.profile_ids(kind, &event.tenant)?.into_iter().collect();
            return if ids.is_empty() { Err(MonitorError::NotFound) } else { Ok(ids) };
        }

        let index = self.dm.get_filter_index(kind, tenant_ctx)?;
        let nested = opts.nested_fields;
        let mut ids = BTreeSet::new();

        let string_fields = opts
            .string_indexed_fields
            .clone()
            .unwrap_or_else(|| field_paths(&event.event, nested));
        for field in &string_fields {
            let Some(v) = field_value(&event.event, field, nested) else {
                continue;
            };
            if let Some(hit) = index.get(&signature(RuleKind::String, field, &value_as_string(v))) {
                ids.extend(hit.iter().cloned());
            }
        }

        for field in &opts.prefix_indexed_fields {
            let Some(v) = field_value(&event.event, field, nested) else {
                continue;
            };
            let value = value_as_string(v);
            let mut ends: Vec<usize> = value.char_indices().map(|(i, c)| i + c.len_utf8()).collect();
            ends.reverse();
            for end in ends {
                if let Some(hit) = index.get(&signature(RuleKind::Prefix, field, &value[..end])) {
                    ids.extend(hit.iter().cloned());
                    break;
                }
            }
        }

        if let Some(hit) = index.get(NONE_SIGNATURE) {
            ids.extend(hit.iter().cloned());
        }

        if ids.is_empty() {
            return Err(MonitorError::NotFound);
        }
        Ok(ids)
    }
}

fn remove_from(index: &mut FilterIndex, item_id: &str) -> bool {
    let mut changed = false;
    index.retain(|_, ids| {
        changed |= ids.remove(item_id);
        !ids.is_empty()
    });
    changed
}

/// Ids under `<prefix><tenant>:` in the given key list.
pub(crate) fn ids_from_keys(keys: Vec<String>, prefix: &str, tenant: &str) -> Vec<String> {
    keys.iter()
        .filter_map(|k| id_from_key(k, prefix, tenant).map(str::to_string))
        .collect()
}
