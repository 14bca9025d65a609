use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use svcreq_core::{
    NewReview, NewServiceRequest, NotificationDraft, RequestPatch, Review, ServiceRequest,
};
use tracing::{info_span, warn, Instrument};

use crate::realtime::REQUESTS_TABLE;
use crate::{
    classify_status, BackoffPolicy, NotificationSink, RequestFilter, RequestStore, RetryDisposition,
    StoreError,
};

#[derive(Debug, Clone)]
pub struct RestStoreConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Bearer token of the signed-in user; row-level policies on the backend scope reads to them.
    pub access_token: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub reviews_table: String,
    pub notifications_table: String,
}

impl Default for RestStoreConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:54321".to_string(),
            api_key: None,
            access_token: None,
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            reviews_table: "reviews".to_string(),
            notifications_table: "notifications".to_string(),
        }
    }
}

/// Store backed by a PostgREST-style HTTP API (`/rest/v1/<table>`).
#[derive(Debug, Clone)]
pub struct RestStore {
    client: reqwest::Client,
    config: RestStoreConfig,
}

impl RestStore {
    pub fn new(config: RestStoreConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &config.api_key {
            let value = HeaderValue::from_str(api_key).context("api key is not a valid header")?;
            headers.insert("apikey", value);
        }
        let bearer = config.access_token.as_ref().or(config.api_key.as_ref());
        if let Some(token) = bearer {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .context("token is not a valid header")?;
            headers.insert(AUTHORIZATION, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &RestStoreConfig {
        &self.config
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.config.base_url.trim_end_matches('/'), table)
    }

    /// GET with retry and backoff for transient failures.
    async fn read_rows<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(String, String)],
    ) -> Result<Vec<T>, StoreError> {
        let url = self.table_url(table);
        let span = info_span!("rest_read", table, rows = tracing::field::Empty);

        async {
            let mut attempt = 0;
            loop {
                match self.send(self.client.get(&url).query(query)).await {
                    Ok(rows) => {
                        tracing::Span::current().record("rows", rows.len());
                        return Ok(rows);
                    }
                    Err(err) if err.is_retryable() && attempt < self.config.backoff.max_retries => {
                        let delay = self.config.backoff.delay_for_attempt(attempt);
                        warn!(error = %err, attempt, ?delay, "retrying store read");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Single-attempt mutation returning the affected rows.
    async fn write_rows<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        method: Method,
        table: &str,
        query: &[(String, String)],
        body: Option<&B>,
    ) -> Result<Vec<T>, StoreError> {
        let mut request = self
            .client
            .request(method.clone(), self.table_url(table))
            .query(query)
            .header("Prefer", "return=representation");
        if let Some(body) = body {
            request = request.json(body);
        }
        self.send(request)
            .instrument(info_span!("rest_write", %method, table))
            .await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<Vec<T>, StoreError> {
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(match classify_status(status) {
                RetryDisposition::Retryable => {
                    StoreError::Transient(format!("http {status}: {text}"))
                }
                RetryDisposition::NonRetryable => StoreError::Rejected {
                    status: Some(status.as_u16()),
                    message: text,
                },
            });
        }
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&text).map_err(|err| StoreError::Decode(err.to_string()))
    }
}

fn eq(value: &str) -> String {
    format!("eq.{value}")
}

/// PostgREST query pairs for a request filter.
pub fn request_filter_query(filter: &RequestFilter) -> Vec<(String, String)> {
    let mut query = vec![("select".to_string(), "*".to_string())];
    if let Some(id) = &filter.id {
        query.push(("id".to_string(), eq(id)));
    }
    if let Some(client_id) = &filter.client_id {
        query.push(("client_id".to_string(), eq(client_id)));
    }
    if let Some(provider_id) = &filter.provider_id {
        query.push(("provider_id".to_string(), eq(provider_id)));
    }
    if let Some(party_id) = &filter.party_id {
        query.push((
            "or".to_string(),
            format!("(client_id.eq.{party_id},provider_id.eq.{party_id})"),
        ));
    }
    if !filter.statuses.is_empty() {
        let statuses = filter
            .statuses
            .iter()
            .map(|status| status.as_str())
            .collect::<Vec<_>>()
            .join(",");
        query.push(("status".to_string(), format!("in.({statuses})")));
    }
    query.push(("order".to_string(), "created_at.desc".to_string()));
    query
}

fn id_query(id: &str) -> Vec<(String, String)> {
    vec![("id".to_string(), eq(id))]
}

#[async_trait]
impl RequestStore for RestStore {
    async fn create_request(&self, new: NewServiceRequest) -> Result<ServiceRequest, StoreError> {
        let rows: Vec<ServiceRequest> = self
            .write_rows(Method::POST, REQUESTS_TABLE, &[], Some(&new))
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::Decode("insert returned no row".to_string()))
    }

    async fn update_request(
        &self,
        id: &str,
        patch: &RequestPatch,
    ) -> Result<ServiceRequest, StoreError> {
        let rows: Vec<ServiceRequest> = self
            .write_rows(Method::PATCH, REQUESTS_TABLE, &id_query(id), Some(patch))
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    async fn delete_request(&self, id: &str) -> Result<(), StoreError> {
        let rows: Vec<serde_json::Value> = self
            .write_rows::<_, ()>(Method::DELETE, REQUESTS_TABLE, &id_query(id), None)
            .await?;
        if rows.is_empty() {
            return Err(StoreError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn find_request(&self, id: &str) -> Result<Option<ServiceRequest>, StoreError> {
        let rows: Vec<ServiceRequest> = self
            .read_rows(REQUESTS_TABLE, &request_filter_query(&RequestFilter::by_id(id)))
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn find_requests(
        &self,
        filter: &RequestFilter,
    ) -> Result<Vec<ServiceRequest>, StoreError> {
        self.read_rows(REQUESTS_TABLE, &request_filter_query(filter)).await
    }

    async fn create_review(&self, review: NewReview) -> Result<Review, StoreError> {
        let rows: Vec<Review> = self
            .write_rows(Method::POST, &self.config.reviews_table, &[], Some(&review))
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::Decode("insert returned no review".to_string()))
    }

    async fn find_reviews(&self, request_id: &str) -> Result<Vec<Review>, StoreError> {
        let query = vec![
            ("select".to_string(), "*".to_string()),
            ("request_id".to_string(), eq(request_id)),
        ];
        self.read_rows(&self.config.reviews_table, &query).await
    }
}

#[async_trait]
impl NotificationSink for RestStore {
    async fn notify(&self, draft: &NotificationDraft) -> Result<(), StoreError> {
        let _rows: Vec<serde_json::Value> = self
            .write_rows(Method::POST, &self.config.notifications_table, &[], Some(draft))
            .await?;
        Ok(())
    }
}
