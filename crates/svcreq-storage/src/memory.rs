use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use svcreq_core::{
    ChangeEvent, NewReview, NewServiceRequest, NotificationDraft, RequestPatch, Review,
    ServiceRequest,
};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::{NotificationSink, RealtimeHub, RequestFilter, RequestStore, StoreError};

/// In-process store holding the authoritative copy of every row.
///
/// It enforces the same legality rules a hosted backend would: status changes
/// must follow a table edge, a request gets at most one review, and only
/// rejected or cancelled requests may be deleted. Every committed row change is
/// published to the attached [`RealtimeHub`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    realtime: Option<RealtimeHub>,
    faults: Arc<Faults>,
}

#[derive(Debug, Default)]
struct MemoryState {
    requests: BTreeMap<String, ServiceRequest>,
    reviews: Vec<Review>,
    notifications: Vec<NotificationDraft>,
}

#[derive(Debug, Default)]
struct Faults {
    failing_mutations: AtomicUsize,
    failing_updates: AtomicUsize,
    failing_notifications: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_realtime(mut self, hub: RealtimeHub) -> Self {
        self.realtime = Some(hub);
        self
    }

    /// Seeds a row as-is, bypassing lifecycle checks.
    pub async fn insert_request(&self, request: ServiceRequest) {
        self.state
            .lock()
            .await
            .requests
            .insert(request.id.clone(), request.clone());
        self.publish(ChangeEvent::inserted(request));
    }

    /// Makes the next `count` mutations fail with a transient error.
    pub fn fail_next_mutations(&self, count: usize) {
        self.faults.failing_mutations.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` status updates fail with a transient error. Other writes succeed.
    pub fn fail_next_updates(&self, count: usize) {
        self.faults.failing_updates.store(count, Ordering::SeqCst);
    }

    pub fn fail_notifications(&self, failing: bool) {
        self.faults.failing_notifications.store(failing, Ordering::SeqCst);
    }

    pub async fn notifications(&self) -> Vec<NotificationDraft> {
        self.state.lock().await.notifications.clone()
    }

    pub async fn notifications_for(&self, user_id: &str) -> Vec<NotificationDraft> {
        self.state
            .lock()
            .await
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect()
    }

    fn publish(&self, event: ChangeEvent) {
        if let Some(hub) = &self.realtime {
            hub.publish(event);
        }
    }

    fn take_injected_failure(&self) -> Result<(), StoreError> {
        if trip(&self.faults.failing_mutations) {
            Err(StoreError::Transient("injected mutation failure".to_string()))
        } else {
            Ok(())
        }
    }

    fn take_injected_update_failure(&self) -> Result<(), StoreError> {
        self.take_injected_failure()?;
        if trip(&self.faults.failing_updates) {
            Err(StoreError::Transient("injected update failure".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Consumes one pending failure from `counter`, if any are left.
fn trip(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn create_request(&self, new: NewServiceRequest) -> Result<ServiceRequest, StoreError> {
        self.take_injected_failure()?;
        let request = ServiceRequest::from_new(Uuid::new_v4().to_string(), new, Utc::now());
        self.state
            .lock()
            .await
            .requests
            .insert(request.id.clone(), request.clone());
        self.publish(ChangeEvent::inserted(request.clone()));
        Ok(request)
    }

    async fn update_request(
        &self,
        id: &str,
        patch: &RequestPatch,
    ) -> Result<ServiceRequest, StoreError> {
        self.take_injected_update_failure()?;
        let (before, after) = {
            let mut state = self.state.lock().await;
            let row = state
                .requests
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
            if let Some(to) = patch.status {
                if to != row.status && !row.status.can_move_to(to) {
                    return Err(StoreError::Rejected {
                        status: Some(409),
                        message: format!("request {id} cannot move from {} to {to}", row.status),
                    });
                }
            }
            let before = row.clone();
            patch.apply_to(row);
            (before, row.clone())
        };
        debug!(id, from = %before.status, to = %after.status, "memory store updated request");
        self.publish(ChangeEvent::updated(&before, after.clone()));
        Ok(after)
    }

    async fn delete_request(&self, id: &str) -> Result<(), StoreError> {
        self.take_injected_failure()?;
        let removed = {
            let mut state = self.state.lock().await;
            let status = state
                .requests
                .get(id)
                .map(|row| row.status)
                .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
            if !status.is_deletable() {
                return Err(StoreError::Rejected {
                    status: Some(403),
                    message: format!("request {id} cannot be deleted while {status}"),
                });
            }
            state.reviews.retain(|review| review.request_id != id);
            state.requests.remove(id)
        };
        if let Some(removed) = removed {
            self.publish(ChangeEvent::deleted(&removed));
        }
        Ok(())
    }

    async fn find_request(&self, id: &str) -> Result<Option<ServiceRequest>, StoreError> {
        Ok(self.state.lock().await.requests.get(id).cloned())
    }

    async fn find_requests(
        &self,
        filter: &RequestFilter,
    ) -> Result<Vec<ServiceRequest>, StoreError> {
        let state = self.state.lock().await;
        let mut rows = state
            .requests
            .values()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn create_review(&self, review: NewReview) -> Result<Review, StoreError> {
        self.take_injected_failure()?;
        if !(1..=5).contains(&review.rating) {
            return Err(StoreError::Rejected {
                status: Some(400),
                message: format!("rating {} out of range", review.rating),
            });
        }
        let mut state = self.state.lock().await;
        if !state.requests.contains_key(&review.request_id) {
            return Err(StoreError::NotFound { id: review.request_id });
        }
        if state.reviews.iter().any(|r| r.request_id == review.request_id) {
            return Err(StoreError::Rejected {
                status: Some(409),
                message: format!("request {} already has a review", review.request_id),
            });
        }
        let stored = Review {
            id: Uuid::new_v4().to_string(),
            request_id: review.request_id,
            listing_id: review.listing_id,
            reviewer_id: review.reviewer_id,
            provider_id: review.provider_id,
            rating: review.rating,
            comment: review.comment,
            created_at: Utc::now(),
        };
        state.reviews.push(stored.clone());
        Ok(stored)
    }

    async fn find_reviews(&self, request_id: &str) -> Result<Vec<Review>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .reviews
            .iter()
            .filter(|r| r.request_id == request_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl NotificationSink for MemoryStore {
    async fn notify(&self, draft: &NotificationDraft) -> Result<(), StoreError> {
        if self.faults.failing_notifications.load(Ordering::SeqCst) {
            return Err(StoreError::Transient("notification sink unavailable".to_string()));
        }
        self.state.lock().await.notifications.push(draft.clone());
        Ok(())
    }
}
