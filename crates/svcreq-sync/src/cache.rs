//! Local read cache of request lists, keyed by the query that produced them.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use svcreq_core::ServiceRequest;
use tokio::sync::watch;

/// Identifies one cached result set. The same request may sit in several.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueryKey {
    Sent,
    Received,
    ActiveJobs,
    Detail(String),
}

/// Shared cache of request lists. Every write touches all copies of an id
/// under a single lock and bumps the revision counter.
#[derive(Debug, Clone)]
pub struct RequestCache {
    lists: Arc<RwLock<BTreeMap<QueryKey, Vec<ServiceRequest>>>>,
    revision: Arc<watch::Sender<u64>>,
}

/// Undo record for one optimistic write.
#[derive(Debug, Clone)]
pub struct CacheRollback {
    id: String,
    entries: Vec<RollbackEntry>,
}

#[derive(Debug, Clone)]
struct RollbackEntry {
    key: QueryKey,
    index: usize,
    previous: ServiceRequest,
    /// What the optimistic write left behind; `None` when it removed the row.
    applied: Option<ServiceRequest>,
}

impl CacheRollback {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of cached copies the optimistic write touched.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for RequestCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestCache {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            lists: Arc::new(RwLock::new(BTreeMap::new())),
            revision: Arc::new(revision),
        }
    }

    /// Receiver that observes a new revision after every cache change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    pub fn put_list(&self, key: QueryKey, rows: Vec<ServiceRequest>) {
        self.write().insert(key, rows);
        self.bump();
    }

    pub fn list(&self, key: &QueryKey) -> Option<Vec<ServiceRequest>> {
        self.read().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<QueryKey> {
        self.read().keys().cloned().collect()
    }

    /// First cached copy of `id`.
    pub fn get(&self, id: &str) -> Option<ServiceRequest> {
        self.read()
            .values()
            .flat_map(|rows| rows.iter())
            .find(|row| row.id == id)
            .cloned()
    }

    pub fn copies(&self, id: &str) -> usize {
        self.read()
            .values()
            .filter(|rows| rows.iter().any(|row| row.id == id))
            .count()
    }

    /// Every cached row, duplicates across lists included.
    pub fn records(&self) -> Vec<ServiceRequest> {
        self.read().values().flat_map(|rows| rows.iter().cloned()).collect()
    }

    /// Applies `apply` to every cached copy of `id`.
    pub fn patch(&self, id: &str, apply: impl Fn(&mut ServiceRequest)) -> CacheRollback {
        let mut entries = Vec::new();
        {
            let mut lists = self.write();
            for (key, rows) in lists.iter_mut() {
                if let Some(index) = rows.iter().position(|row| row.id == id) {
                    let previous = rows[index].clone();
                    apply(&mut rows[index]);
                    entries.push(RollbackEntry {
                        key: key.clone(),
                        index,
                        previous,
                        applied: Some(rows[index].clone()),
                    });
                }
            }
        }
        if !entries.is_empty() {
            self.bump();
        }
        CacheRollback {
            id: id.to_string(),
            entries,
        }
    }

    /// Removes every cached copy of `id`.
    pub fn remove(&self, id: &str) -> CacheRollback {
        let mut entries = Vec::new();
        {
            let mut lists = self.write();
            for (key, rows) in lists.iter_mut() {
                if let Some(index) = rows.iter().position(|row| row.id == id) {
                    let previous = rows.remove(index);
                    entries.push(RollbackEntry {
                        key: key.clone(),
                        index,
                        previous,
                        applied: None,
                    });
                }
            }
        }
        if !entries.is_empty() {
            self.bump();
        }
        CacheRollback {
            id: id.to_string(),
            entries,
        }
    }

    /// Undoes an optimistic write. Copies replaced by a server read since the
    /// write are left alone. Returns the number of copies restored.
    pub fn rollback(&self, token: CacheRollback) -> usize {
        let mut restored = 0;
        {
            let mut lists = self.write();
            for entry in token.entries {
                let Some(rows) = lists.get_mut(&entry.key) else {
                    continue;
                };
                let position = rows.iter().position(|row| row.id == token.id);
                match (&entry.applied, position) {
                    (Some(applied), Some(index)) if &rows[index] == applied => {
                        rows[index] = entry.previous;
                        restored += 1;
                    }
                    (None, None) => {
                        let at = entry.index.min(rows.len());
                        rows.insert(at, entry.previous);
                        restored += 1;
                    }
                    _ => {}
                }
            }
        }
        if restored > 0 {
            self.bump();
        }
        restored
    }

    /// Makes the cache agree with an authoritative `record`: it is written into
    /// `member_of` lists (and its own detail entry), and dropped from every other list.
    pub fn reconcile(&self, record: &ServiceRequest, member_of: &[QueryKey]) -> bool {
        let detail = QueryKey::Detail(record.id.clone());
        let mut changed = false;
        {
            let mut lists = self.write();
            for (key, rows) in lists.iter_mut() {
                let belongs = *key == detail || member_of.contains(key);
                let position = rows.iter().position(|row| row.id == record.id);
                match (belongs, position) {
                    (true, Some(index)) => {
                        if rows[index] != *record {
                            rows[index] = record.clone();
                            changed = true;
                        }
                    }
                    (true, None) => {
                        let at = rows
                            .iter()
                            .position(|row| row.created_at < record.created_at)
                            .unwrap_or(rows.len());
                        rows.insert(at, record.clone());
                        changed = true;
                    }
                    (false, Some(index)) => {
                        rows.remove(index);
                        changed = true;
                    }
                    (false, None) => {}
                }
            }
        }
        if changed {
            self.bump();
        }
        changed
    }

    /// Drops `id` from every list, and its detail entry. Returns the copies removed.
    pub fn evict(&self, id: &str) -> usize {
        let mut removed = 0;
        {
            let mut lists = self.write();
            if lists.remove(&QueryKey::Detail(id.to_string())).is_some() {
                removed += 1;
            }
            for rows in lists.values_mut() {
                let before = rows.len();
                rows.retain(|row| row.id != id);
                removed += before - rows.len();
            }
        }
        if removed > 0 {
            self.bump();
        }
        removed
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<QueryKey, Vec<ServiceRequest>>> {
        self.lists.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<QueryKey, Vec<ServiceRequest>>> {
        self.lists.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use svcreq_core::{NewServiceRequest, RequestStatus};

    fn mk_request(id: &str, status: RequestStatus, minutes: i64) -> ServiceRequest {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap();
        let created = start + Duration::minutes(minutes);
        let mut request = ServiceRequest::from_new(
            id,
            NewServiceRequest {
                client_id: "client".into(),
                provider_id: "provider".into(),
                listing_id: "listing".into(),
                ..Default::default()
            },
            created,
        );
        request.status = status;
        request
    }

    fn seeded() -> RequestCache {
        let cache = RequestCache::new();
        let r1 = mk_request("r1", RequestStatus::Accepted, 10);
        let r2 = mk_request("r2", RequestStatus::Pending, 5);
        cache.put_list(QueryKey::Sent, vec![r1.clone(), r2]);
        cache.put_list(QueryKey::ActiveJobs, vec![r1]);
        cache
    }

    #[test]
    fn patch_touches_every_copy_and_rollback_restores_them() {
        let cache = seeded();
        let token = cache.patch("r1", |r| r.status = RequestStatus::InProgress);
        assert_eq!(token.len(), 2);
        assert!(cache
            .records()
            .iter()
            .filter(|r| r.id == "r1")
            .all(|r| r.status == RequestStatus::InProgress));

        assert_eq!(cache.rollback(token), 2);
        assert!(cache
            .records()
            .iter()
            .filter(|r| r.id == "r1")
            .all(|r| r.status == RequestStatus::Accepted));
    }

    #[test]
    fn rollback_never_overwrites_a_newer_server_read() {
        let cache = seeded();
        let token = cache.patch("r1", |r| r.status = RequestStatus::InProgress);

        let server = mk_request("r1", RequestStatus::CancelledByProvider, 10);
        cache.reconcile(&server, &[QueryKey::Sent]);

        assert_eq!(cache.rollback(token), 0);
        assert_eq!(cache.get("r1").unwrap().status, RequestStatus::CancelledByProvider);
        assert_eq!(cache.copies("r1"), 1);
    }

    #[test]
    fn removal_is_restored_at_its_old_position() {
        let cache = seeded();
        let token = cache.remove("r1");
        assert_eq!(cache.copies("r1"), 0);
        cache.rollback(token);
        let sent = cache.list(&QueryKey::Sent).unwrap();
        assert_eq!(sent[0].id, "r1");
        assert_eq!(cache.copies("r1"), 2);
    }

    #[test]
    fn reconcile_inserts_newest_first_and_leaves_uncached_lists_alone() {
        let cache = seeded();
        let r3 = mk_request("r3", RequestStatus::Pending, 20);
        assert!(cache.reconcile(&r3, &[QueryKey::Sent, QueryKey::Received]));
        let sent = cache.list(&QueryKey::Sent).unwrap();
        assert_eq!(sent.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["r3", "r1", "r2"]);
        assert_eq!(cache.list(&QueryKey::Received), None);
        assert!(!cache.reconcile(&r3, &[QueryKey::Sent]));
    }

    #[test]
    fn evict_drops_lists_and_detail_entries() {
        let cache = seeded();
        cache.put_list(
            QueryKey::Detail("r1".into()),
            vec![mk_request("r1", RequestStatus::Accepted, 10)],
        );
        assert_eq!(cache.evict("r1"), 3);
        assert_eq!(cache.get("r1"), None);
        assert!(!cache.keys().contains(&QueryKey::Detail("r1".into())));
    }

    #[test]
    fn writes_bump_the_revision() {
        let cache = RequestCache::new();
        let rx = cache.subscribe();
        let before = cache.revision();
        cache.put_list(QueryKey::Sent, vec![mk_request("r1", RequestStatus::Pending, 0)]);
        assert!(rx.has_changed().unwrap());
        assert_eq!(cache.revision(), before + 1);

        let untouched = cache.patch("missing", |r| r.status = RequestStatus::Rejected);
        assert!(untouched.is_empty());
        assert_eq!(cache.revision(), before + 1);
    }
}
