use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use svcreq_core::{
    Bucket, EventKind, NewReview, NewServiceRequest, NotificationKind, RequestEvent, RequestPatch,
    RequestStatus, Review, Role, ServiceRequest, TRANSITIONS,
};
use svcreq_storage::{
    MemoryStore, RealtimeHub, RealtimeSignal, RequestFilter, RequestStore, StoreError, Topic,
};
use svcreq_sync::{Clock, Coordinator, CoordinatorError, ManualClock};
use tokio::sync::Notify;

const CLIENT: &str = "client-1";
const PROVIDER: &str = "provider-1";

/// 10:00 on 2026-03-10 at +08:00.
fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, 2, 0, 0).single().unwrap()
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 10).unwrap()
}

fn mk_request(id: &str, status: RequestStatus) -> ServiceRequest {
    let mut request = ServiceRequest::from_new(
        id,
        NewServiceRequest {
            client_id: CLIENT.into(),
            provider_id: PROVIDER.into(),
            listing_id: "listing-plumbing".into(),
            message: Some("Kitchen sink is leaking".into()),
            preferred_date: today().succ_opt(),
            address_detail: Some("Building 12, door 4".into()),
            ..Default::default()
        },
        now() - chrono::Duration::days(1),
    );
    request.status = status;
    request
}

fn coordinator_for(viewer: &str, store: &MemoryStore, clock: &ManualClock) -> Coordinator {
    Coordinator::new(viewer, Arc::new(store.clone()), Arc::new(store.clone()))
        .with_clock(Arc::new(clock.clone()))
}

struct Harness {
    hub: RealtimeHub,
    store: MemoryStore,
    clock: ManualClock,
    client: Coordinator,
    provider: Coordinator,
}

fn harness() -> Harness {
    let hub = RealtimeHub::new();
    let store = MemoryStore::new().with_realtime(hub.clone());
    let clock = ManualClock::new(now());
    let client = coordinator_for(CLIENT, &store, &clock);
    let provider = coordinator_for(PROVIDER, &store, &clock);
    Harness {
        hub,
        store,
        clock,
        client,
        provider,
    }
}

async fn wait_until(coordinator: &Coordinator, mut done: impl FnMut(&Coordinator) -> bool) {
    let mut changes = coordinator.changes();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done(coordinator) {
            changes.changed().await.expect("cache dropped");
        }
    })
    .await
    .expect("coordinator never converged");
}

fn kinds(notifications: &[svcreq_core::NotificationDraft]) -> Vec<NotificationKind> {
    notifications.iter().map(|n| n.kind).collect()
}

#[tokio::test]
async fn price_negotiation_ends_accepted_at_the_proposed_price() {
    let h = harness();
    h.store.insert_request(mk_request("r1", RequestStatus::Pending)).await;
    h.provider.refresh().await.unwrap();

    let proposed = h
        .provider
        .propose_price("r1", 50_000, Some("Includes replacement parts".into()))
        .await
        .unwrap();
    assert_eq!(proposed.status, RequestStatus::PriceProposed);
    assert_eq!(proposed.proposed_price, Some(50_000));
    assert_eq!(proposed.provider_response.as_deref(), Some("Includes replacement parts"));

    h.client.refresh().await.unwrap();
    let actions = h.client.actions("r1").unwrap();
    assert!(actions.can_confirm_price && actions.can_reject_price && !actions.can_accept);

    let accepted = h.client.confirm_price("r1").await.unwrap();
    assert_eq!(accepted.status, RequestStatus::Accepted);
    assert_eq!(accepted.proposed_price, Some(50_000));
    assert_eq!(accepted.accepted_at, Some(h.clock.now()));

    h.provider.flush_notifications().await;
    h.client.flush_notifications().await;
    assert_eq!(
        kinds(&h.store.notifications_for(CLIENT).await),
        vec![NotificationKind::PriceProposed]
    );
    assert_eq!(
        kinds(&h.store.notifications_for(PROVIDER).await),
        vec![NotificationKind::PriceConfirmed]
    );
}

#[tokio::test]
async fn rejecting_a_price_clears_it() {
    let h = harness();
    let mut request = mk_request("r1", RequestStatus::PriceProposed);
    request.proposed_price = Some(80_000);
    h.store.insert_request(request).await;

    let rejected = h.client.reject_price("r1").await.unwrap();
    assert_eq!(rejected.status, RequestStatus::Rejected);
    assert_eq!(rejected.proposed_price, None);
    assert_eq!(h.client.request("r1").unwrap().proposed_price, None);
}

#[tokio::test]
async fn accepted_for_today_moves_into_active_jobs() {
    let h = harness();
    let mut request = mk_request("r2", RequestStatus::Pending);
    request.preferred_date = Some(today());
    h.store.insert_request(request).await;

    let board = h.provider.refresh().await.unwrap();
    assert_eq!(board.bucket_of("r2"), Some(Bucket::Received));

    h.provider.accept("r2").await.unwrap();
    assert_eq!(h.provider.board().bucket_of("r2"), Some(Bucket::ActiveJobs));

    let client_board = h.client.refresh().await.unwrap();
    assert_eq!(client_board.bucket_of("r2"), Some(Bucket::ActiveJobs));
    assert_eq!(client_board.len(), 1);
}

#[tokio::test]
async fn accepted_later_joins_active_jobs_as_the_start_nears() {
    let h = harness();
    let mut request = mk_request("r2", RequestStatus::Accepted);
    request.preferred_date = today().succ_opt();
    request.preferred_time = chrono::NaiveTime::from_hms_opt(9, 0, 0);
    h.store.insert_request(request).await;

    assert_eq!(h.client.refresh().await.unwrap().bucket_of("r2"), Some(Bucket::Sent));

    // 04:00 local on the day of the job, five hours before the start.
    h.clock.set(Utc.with_ymd_and_hms(2026, 3, 10, 20, 0, 0).single().unwrap());
    assert_eq!(h.client.board().bucket_of("r2"), Some(Bucket::ActiveJobs));
}

#[tokio::test]
async fn completion_confirmation_and_payment() {
    let h = harness();
    h.store.insert_request(mk_request("r3", RequestStatus::InProgress)).await;
    h.provider.refresh().await.unwrap();

    let submitted = h
        .provider
        .submit_details(
            "r3",
            "  Replaced the trap and both seals  ",
            vec!["photos/r3-after.jpg".into()],
        )
        .await
        .unwrap();
    assert_eq!(submitted.status, RequestStatus::AwaitingClientConfirmation);
    assert_eq!(
        submitted.completion_description.as_deref(),
        Some("Replaced the trap and both seals")
    );
    assert_eq!(submitted.completion_photos, vec!["photos/r3-after.jpg".to_string()]);

    h.client.refresh().await.unwrap();
    let confirmed = h.client.confirm("r3", 5, Some("Quick and tidy".into())).await.unwrap();
    assert_eq!(confirmed.status, RequestStatus::AwaitingPayment);
    let reviews = h.store.find_reviews("r3").await.unwrap();
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].rating, 5);
    assert_eq!(reviews[0].reviewer_id, CLIENT);
    assert_eq!(reviews[0].provider_id, PROVIDER);

    h.clock.advance(chrono::Duration::hours(2));
    h.provider.refresh().await.unwrap();
    let completed = h.provider.payment_complete("r3").await.unwrap();
    assert_eq!(completed.status, RequestStatus::Completed);
    assert_eq!(completed.completed_at, Some(h.clock.now()));
    assert_eq!(h.provider.board().bucket_of("r3"), Some(Bucket::Received));

    h.provider.flush_notifications().await;
    h.client.flush_notifications().await;
    let client_kinds = kinds(&h.store.notifications_for(CLIENT).await);
    assert_eq!(
        client_kinds,
        vec![NotificationKind::WorkSubmitted, NotificationKind::PaymentCompleted]
    );
    let provider_kinds = kinds(&h.store.notifications_for(PROVIDER).await);
    assert_eq!(
        provider_kinds,
        vec![NotificationKind::WorkConfirmed, NotificationKind::PaymentCompleted]
    );
}

#[tokio::test]
async fn write_once_timestamps_survive_later_transitions() {
    let h = harness();
    let mut request = mk_request("r1", RequestStatus::Accepted);
    let accepted_at = now() - chrono::Duration::hours(3);
    request.accepted_at = Some(accepted_at);
    h.store.insert_request(request).await;

    let started = h.provider.start_work("r1").await.unwrap();
    assert_eq!(started.accepted_at, Some(accepted_at));
    assert_eq!(started.started_at, Some(now()));
}

#[tokio::test]
async fn completed_requests_cannot_be_deleted() {
    let h = harness();
    h.store.insert_request(mk_request("done", RequestStatus::Completed)).await;
    h.client.refresh().await.unwrap();

    let err = h.client.delete("done").await.unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::NotDeletable {
            status: RequestStatus::Completed,
            ..
        }
    ));
    assert!(h.store.find_request("done").await.unwrap().is_some());
    assert!(h.client.request("done").is_some());
}

#[tokio::test]
async fn cancelled_requests_are_deleted_by_the_client_only() {
    let h = harness();
    h.store.insert_request(mk_request("gone", RequestStatus::CancelledByProvider)).await;
    h.client.refresh().await.unwrap();
    h.provider.refresh().await.unwrap();

    assert!(matches!(
        h.provider.delete("gone").await,
        Err(CoordinatorError::NotDeletable { .. })
    ));

    h.client.delete("gone").await.unwrap();
    assert!(h.client.request("gone").is_none());
    assert_eq!(h.client.cache().copies("gone"), 0);
    assert_eq!(h.store.find_request("gone").await.unwrap(), None);
}

#[tokio::test]
async fn failed_delete_restores_the_request() {
    let h = harness();
    h.store.insert_request(mk_request("gone", RequestStatus::Rejected)).await;
    h.client.refresh().await.unwrap();
    let before = h.client.cache().records();

    h.store.fail_next_mutations(1);
    let err = h.client.delete("gone").await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(h.client.cache().records(), before);
    assert!(h.client.last_failure("gone").is_some());
}

fn sample_event(kind: EventKind) -> RequestEvent {
    match kind {
        EventKind::Accept => RequestEvent::Accept,
        EventKind::Reject => RequestEvent::Reject {
            response: Some("Fully booked this week".into()),
        },
        EventKind::ProposePrice => RequestEvent::ProposePrice {
            price: 45_000,
            response: None,
        },
        EventKind::ConfirmPrice => RequestEvent::ConfirmPrice,
        EventKind::RejectPrice => RequestEvent::RejectPrice,
        EventKind::Cancel => RequestEvent::Cancel,
        EventKind::StartWork => RequestEvent::StartWork,
        EventKind::SubmitDetails => RequestEvent::SubmitDetails {
            description: "Done".into(),
            photos: vec![],
        },
        EventKind::Confirm => RequestEvent::Confirm {
            rating: 4,
            comment: None,
        },
        EventKind::PaymentComplete => RequestEvent::PaymentComplete,
    }
}

#[tokio::test]
async fn every_transition_rolls_back_when_the_store_fails() {
    for (index, rule) in TRANSITIONS.iter().enumerate() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(now());
        let id = format!("rb-{index}");
        let mut request = mk_request(&id, rule.from);
        request.preferred_date = Some(today());
        if rule.from == RequestStatus::PriceProposed {
            request.proposed_price = Some(30_000);
        }
        store.insert_request(request).await;

        let viewer = match rule.actor {
            Role::Client => CLIENT,
            Role::Provider => PROVIDER,
        };
        let coordinator = coordinator_for(viewer, &store, &clock);
        coordinator.refresh().await.unwrap();
        let before = coordinator.cache().records();
        assert!(coordinator.cache().copies(&id) >= 1);

        store.fail_next_mutations(1);
        let err = coordinator
            .apply(&id, &sample_event(rule.event))
            .await
            .expect_err("forced failure");
        assert!(
            matches!(err, CoordinatorError::Remote(StoreError::Transient(_))),
            "{rule:?}: {err}"
        );

        assert_eq!(coordinator.cache().records(), before, "cache not restored for {rule:?}");
        assert!(coordinator.last_failure(&id).is_some());
        assert!(!coordinator.mutation_in_flight());
        assert_eq!(store.find_request(&id).await.unwrap().unwrap().status, rule.from);
        assert!(store.find_reviews(&id).await.unwrap().is_empty());

        coordinator.flush_notifications().await;
        assert!(store.notifications().await.is_empty(), "{rule:?} notified after failure");
    }
}

#[tokio::test]
async fn confirm_keeps_the_review_when_the_status_update_fails() {
    let h = harness();
    h.store
        .insert_request(mk_request("r3", RequestStatus::AwaitingClientConfirmation))
        .await;
    h.client.refresh().await.unwrap();
    let before = h.client.cache().records();

    h.store.fail_next_updates(1);
    let err = h.client.confirm("r3", 4, Some("Good work".into())).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Remote(StoreError::Transient(_))), "{err}");
    assert!(err.is_retryable());

    assert_eq!(h.client.cache().records(), before);
    assert!(h.client.last_failure("r3").is_some());
    assert_eq!(
        h.store.find_request("r3").await.unwrap().unwrap().status,
        RequestStatus::AwaitingClientConfirmation
    );
    let reviews = h.store.find_reviews("r3").await.unwrap();
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].rating, 4);

    h.client.flush_notifications().await;
    assert!(h.store.notifications().await.is_empty());
}

#[tokio::test]
async fn retrying_a_half_done_confirm_finishes_it() {
    let h = harness();
    h.store
        .insert_request(mk_request("r3", RequestStatus::AwaitingClientConfirmation))
        .await;
    h.client.refresh().await.unwrap();

    h.store.fail_next_updates(1);
    assert!(h.client.confirm("r3", 4, None).await.is_err());

    let confirmed = h.client.confirm("r3", 4, None).await.unwrap();
    assert_eq!(confirmed.status, RequestStatus::AwaitingPayment);
    assert_eq!(h.client.request("r3").unwrap().status, RequestStatus::AwaitingPayment);
    assert_eq!(h.client.last_failure("r3"), None);
    assert_eq!(h.store.find_reviews("r3").await.unwrap().len(), 1);

    h.client.flush_notifications().await;
    assert_eq!(
        kinds(&h.store.notifications_for(PROVIDER).await),
        vec![NotificationKind::WorkConfirmed]
    );
}

#[tokio::test]
async fn a_later_success_clears_the_failure() {
    let h = harness();
    h.store.insert_request(mk_request("r1", RequestStatus::Pending)).await;
    h.store.fail_next_mutations(1);
    assert!(h.provider.accept("r1").await.is_err());
    assert!(h.provider.last_failure("r1").is_some());

    h.provider.accept("r1").await.unwrap();
    assert_eq!(h.provider.last_failure("r1"), None);
}

#[tokio::test]
async fn rejected_mutation_reconciles_with_the_server() {
    let h = harness();
    h.store.insert_request(mk_request("r1", RequestStatus::Pending)).await;
    h.client.refresh().await.unwrap();

    h.store
        .update_request("r1", &RequestPatch::status(RequestStatus::Rejected))
        .await
        .unwrap();

    let err = h.client.cancel("r1").await.unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(h.client.request("r1").unwrap().status, RequestStatus::Rejected);
    assert!(h.client.last_failure("r1").is_some());
}

#[tokio::test]
async fn realtime_push_converges_the_other_party() {
    let h = harness();
    h.store.insert_request(mk_request("r1", RequestStatus::Accepted)).await;
    h.client.refresh().await.unwrap();
    let watch = h.client.watch_request(&h.hub, "r1").await.unwrap();
    assert_eq!(h.hub.subscriber_count(&Topic::Request("r1".into())), 1);

    h.provider.cancel("r1").await.unwrap();

    wait_until(&h.client, |c| {
        c.request("r1").map(|r| r.status) == Some(RequestStatus::CancelledByProvider)
    })
    .await;
    assert_eq!(h.client.board().bucket_of("r1"), Some(Bucket::Sent));
    assert!(h.client.actions("r1").unwrap().can_delete);

    watch.close().await;
    assert_eq!(h.hub.subscriber_count(&Topic::Request("r1".into())), 0);
}

#[tokio::test]
async fn table_watch_picks_up_new_and_deleted_rows() {
    let h = harness();
    h.provider.refresh().await.unwrap();
    let watch = h.provider.watch_all(&h.hub).await.unwrap();

    let created = h
        .client
        .create(NewServiceRequest {
            client_id: CLIENT.into(),
            provider_id: PROVIDER.into(),
            listing_id: "listing-plumbing".into(),
            aimag_id: Some("aimag-1".into()),
            district_id: Some("district-3".into()),
            khoroo_id: Some("khoroo-7".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    let id = created.id.clone();
    wait_until(&h.provider, |c| c.request(&id).is_some()).await;
    assert_eq!(h.provider.board().bucket_of(&id), Some(Bucket::Received));

    h.client.cancel(&id).await.unwrap();
    h.client.delete(&id).await.unwrap();
    wait_until(&h.provider, |c| c.request(&id).is_none()).await;

    drop(watch);
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.hub.subscriber_count(&Topic::Table) > 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("table subscription was not released");
}

#[tokio::test]
async fn lagged_subscribers_refresh_everything() {
    let clock = ManualClock::new(now());
    // No realtime hub: changes only arrive through a refresh.
    let quiet = MemoryStore::new();
    let provider = coordinator_for(PROVIDER, &quiet, &clock);
    provider.refresh().await.unwrap();
    quiet.insert_request(mk_request("missed", RequestStatus::Pending)).await;
    assert!(provider.request("missed").is_none());

    provider.handle_signal(RealtimeSignal::Lagged(12)).await.unwrap();
    assert_eq!(provider.request("missed").unwrap().status, RequestStatus::Pending);

    quiet
        .update_request("missed", &RequestPatch::status(RequestStatus::Rejected))
        .await
        .unwrap();
    provider.on_reconnect().await.unwrap();
    assert_eq!(provider.request("missed").unwrap().status, RequestStatus::Rejected);
}

#[tokio::test]
async fn changes_for_other_users_are_ignored() {
    let h = harness();
    h.client.refresh().await.unwrap();
    let mut stranger = mk_request("other", RequestStatus::Pending);
    stranger.client_id = "someone-else".into();
    stranger.provider_id = "another-provider".into();
    h.store.insert_request(stranger.clone()).await;

    let revision = h.client.cache().revision();
    h.client
        .handle_change(&svcreq_core::ChangeEvent::inserted(stranger))
        .await
        .unwrap();
    assert_eq!(h.client.cache().revision(), revision);
    assert!(h.client.request("other").is_none());
}

#[tokio::test]
async fn notification_failures_never_fail_the_transition() {
    let h = harness();
    h.store.insert_request(mk_request("r1", RequestStatus::Pending)).await;
    h.store.fail_notifications(true);

    let accepted = h.provider.accept("r1").await.unwrap();
    assert_eq!(accepted.status, RequestStatus::Accepted);
    h.provider.flush_notifications().await;
    assert!(h.store.notifications().await.is_empty());
    assert_eq!(h.provider.last_failure("r1"), None);
}

#[tokio::test]
async fn invalid_inputs_are_refused_before_any_write() {
    let h = harness();
    h.store.insert_request(mk_request("r1", RequestStatus::Pending)).await;
    h.provider.refresh().await.unwrap();
    let revision = h.provider.cache().revision();

    let err = h.provider.propose_price("r1", 0, None).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Transition(_)));
    assert_eq!(h.provider.cache().revision(), revision);
    assert_eq!(h.store.find_request("r1").await.unwrap().unwrap().status, RequestStatus::Pending);
}

/// Store whose status updates block until released.
struct GatedStore {
    inner: MemoryStore,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl RequestStore for GatedStore {
    async fn create_request(&self, new: NewServiceRequest) -> Result<ServiceRequest, StoreError> {
        self.inner.create_request(new).await
    }

    async fn update_request(
        &self,
        id: &str,
        patch: &RequestPatch,
    ) -> Result<ServiceRequest, StoreError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.update_request(id, patch).await
    }

    async fn delete_request(&self, id: &str) -> Result<(), StoreError> {
        self.inner.delete_request(id).await
    }

    async fn find_request(&self, id: &str) -> Result<Option<ServiceRequest>, StoreError> {
        self.inner.find_request(id).await
    }

    async fn find_requests(
        &self,
        filter: &RequestFilter,
    ) -> Result<Vec<ServiceRequest>, StoreError> {
        self.inner.find_requests(filter).await
    }

    async fn create_review(&self, review: NewReview) -> Result<Review, StoreError> {
        self.inner.create_review(review).await
    }

    async fn find_reviews(&self, request_id: &str) -> Result<Vec<Review>, StoreError> {
        self.inner.find_reviews(request_id).await
    }
}

#[tokio::test]
async fn second_mutation_on_a_busy_request_is_refused() {
    let inner = MemoryStore::new();
    inner.insert_request(mk_request("r1", RequestStatus::Pending)).await;
    inner.insert_request(mk_request("r2", RequestStatus::Pending)).await;
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let store = GatedStore {
        inner: inner.clone(),
        entered: entered.clone(),
        release: release.clone(),
    };
    let provider = Coordinator::new(PROVIDER, Arc::new(store), Arc::new(inner.clone()))
        .with_clock(Arc::new(ManualClock::new(now())));
    provider.refresh().await.unwrap();

    let pending = {
        let provider = provider.clone();
        tokio::spawn(async move { provider.accept("r1").await })
    };
    entered.notified().await;

    assert!(provider.mutation_in_flight());
    assert!(provider.is_pending("r1"));
    assert_eq!(provider.request("r1").unwrap().status, RequestStatus::Accepted);
    assert!(!provider.actions("r1").unwrap().any());
    assert!(!provider.is_pending("r2"));
    assert!(!provider.actions("r2").unwrap().any());
    assert!(matches!(
        provider.reject("r1", None).await,
        Err(CoordinatorError::Busy { .. })
    ));

    release.notify_one();
    let accepted = pending.await.unwrap().unwrap();
    assert_eq!(accepted.status, RequestStatus::Accepted);
    assert!(!provider.mutation_in_flight());
    assert!(provider.actions("r1").unwrap().can_start_work);
    assert!(provider.actions("r2").unwrap().can_accept);
}
