//! Collaborator seams for the request coordinator: the persistent store, the
//! notification sink and the realtime change channel, plus two backends.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use svcreq_core::{
    NewReview, NewServiceRequest, NotificationDraft, RequestPatch, RequestStatus, Review,
    ServiceRequest,
};
use thiserror::Error;

mod memory;
mod realtime;
mod rest;

pub use memory::MemoryStore;
pub use realtime::{RealtimeChannel, RealtimeHub, RealtimeSignal, Subscription, Topic};
pub use rest::{request_filter_query, RestStore, RestStoreConfig};

pub const CRATE_NAME: &str = "svcreq-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {id} not found")]
    NotFound { id: String },
    #[error("store rejected the operation: {message}")]
    Rejected { status: Option<u16>, message: String },
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("decoding store response: {0}")]
    Decode(String),
    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl StoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Transient(_) => RetryDisposition::Retryable,
            StoreError::Http(err) => classify_reqwest_error(err),
            StoreError::NotFound { .. } | StoreError::Rejected { .. } | StoreError::Decode(_) => {
                RetryDisposition::NonRetryable
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition() == RetryDisposition::Retryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Backoff between read attempts. Mutations are never retried.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Row filter for request lists. Results are always ordered newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestFilter {
    pub id: Option<String>,
    pub client_id: Option<String>,
    pub provider_id: Option<String>,
    /// Matches rows where the user is either party.
    pub party_id: Option<String>,
    pub statuses: Vec<RequestStatus>,
}

impl RequestFilter {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn sent_by(user_id: impl Into<String>) -> Self {
        Self {
            client_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    pub fn received_by(user_id: impl Into<String>) -> Self {
        Self {
            provider_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    pub fn involving(user_id: impl Into<String>) -> Self {
        Self {
            party_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = RequestStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn matches(&self, request: &ServiceRequest) -> bool {
        self.id.as_ref().map_or(true, |id| &request.id == id)
            && self.client_id.as_ref().map_or(true, |id| &request.client_id == id)
            && self.provider_id.as_ref().map_or(true, |id| &request.provider_id == id)
            && self
                .party_id
                .as_ref()
                .map_or(true, |id| &request.client_id == id || &request.provider_id == id)
            && (self.statuses.is_empty() || self.statuses.contains(&request.status))
    }
}

/// Filtered CRUD over service requests and their reviews.
#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn create_request(&self, new: NewServiceRequest) -> Result<ServiceRequest, StoreError>;

    /// Applies `patch` to the row and returns the stored result.
    async fn update_request(
        &self,
        id: &str,
        patch: &RequestPatch,
    ) -> Result<ServiceRequest, StoreError>;

    async fn delete_request(&self, id: &str) -> Result<(), StoreError>;

    async fn find_request(&self, id: &str) -> Result<Option<ServiceRequest>, StoreError>;

    async fn find_requests(
        &self,
        filter: &RequestFilter,
    ) -> Result<Vec<ServiceRequest>, StoreError>;

    async fn create_review(&self, review: NewReview) -> Result<Review, StoreError>;

    async fn find_reviews(&self, request_id: &str) -> Result<Vec<Review>, StoreError>;
}

/// Best-effort user notification delivery.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, draft: &NotificationDraft) -> Result<(), StoreError>;
}
