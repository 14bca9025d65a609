//! Core domain model, lifecycle state machine and display bucketing for service requests.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "svcreq-core";

/// Lifecycle status of a service request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    PriceProposed,
    Accepted,
    InProgress,
    AwaitingClientConfirmation,
    AwaitingPayment,
    Completed,
    Rejected,
    CancelledByClient,
    CancelledByProvider,
    Disputed,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 11] = [
        RequestStatus::Pending,
        RequestStatus::PriceProposed,
        RequestStatus::Accepted,
        RequestStatus::InProgress,
        RequestStatus::AwaitingClientConfirmation,
        RequestStatus::AwaitingPayment,
        RequestStatus::Completed,
        RequestStatus::Rejected,
        RequestStatus::CancelledByClient,
        RequestStatus::CancelledByProvider,
        RequestStatus::Disputed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::PriceProposed => "price_proposed",
            RequestStatus::Accepted => "accepted",
            RequestStatus::InProgress => "in_progress",
            RequestStatus::AwaitingClientConfirmation => "awaiting_client_confirmation",
            RequestStatus::AwaitingPayment => "awaiting_payment",
            RequestStatus::Completed => "completed",
            RequestStatus::Rejected => "rejected",
            RequestStatus::CancelledByClient => "cancelled_by_client",
            RequestStatus::CancelledByProvider => "cancelled_by_provider",
            RequestStatus::Disputed => "disputed",
        }
    }

    /// `disputed` is terminal until resolved out of band.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Completed
                | RequestStatus::Rejected
                | RequestStatus::CancelledByClient
                | RequestStatus::CancelledByProvider
                | RequestStatus::Disputed
        )
    }

    /// Statuses in which the client may hard-delete the request.
    pub fn is_deletable(self) -> bool {
        matches!(
            self,
            RequestStatus::Rejected
                | RequestStatus::CancelledByClient
                | RequestStatus::CancelledByProvider
        )
    }

    /// Work statuses that are always shown as active jobs, whatever the schedule says.
    pub fn is_work_in_flight(self) -> bool {
        matches!(
            self,
            RequestStatus::InProgress
                | RequestStatus::AwaitingClientConfirmation
                | RequestStatus::AwaitingPayment
        )
    }

    /// Whether any table entry moves a request from `self` to `to`.
    pub fn can_move_to(self, to: RequestStatus) -> bool {
        TRANSITIONS.iter().any(|rule| rule.from == self && rule.to == to)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown request status `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for RequestStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RequestStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Which side of a request a user is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Provider,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.pad("client"),
            Role::Provider => f.pad("provider"),
        }
    }
}

/// Payload-free name of a lifecycle event, used by the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Accept,
    Reject,
    ProposePrice,
    ConfirmPrice,
    RejectPrice,
    Cancel,
    StartWork,
    SubmitDetails,
    Confirm,
    PaymentComplete,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Accept => "accept",
            EventKind::Reject => "reject",
            EventKind::ProposePrice => "propose_price",
            EventKind::ConfirmPrice => "confirm_price",
            EventKind::RejectPrice => "reject_price",
            EventKind::Cancel => "cancel",
            EventKind::StartWork => "start_work",
            EventKind::SubmitDetails => "submit_details",
            EventKind::Confirm => "confirm",
            EventKind::PaymentComplete => "payment_complete",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A lifecycle event together with the inputs the acting party supplied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RequestEvent {
    Accept,
    Reject {
        #[serde(default)]
        response: Option<String>,
    },
    ProposePrice {
        price: i64,
        #[serde(default)]
        response: Option<String>,
    },
    ConfirmPrice,
    RejectPrice,
    Cancel,
    StartWork,
    SubmitDetails {
        description: String,
        #[serde(default)]
        photos: Vec<String>,
    },
    Confirm {
        rating: u8,
        #[serde(default)]
        comment: Option<String>,
    },
    PaymentComplete,
}

impl RequestEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RequestEvent::Accept => EventKind::Accept,
            RequestEvent::Reject { .. } => EventKind::Reject,
            RequestEvent::ProposePrice { .. } => EventKind::ProposePrice,
            RequestEvent::ConfirmPrice => EventKind::ConfirmPrice,
            RequestEvent::RejectPrice => EventKind::RejectPrice,
            RequestEvent::Cancel => EventKind::Cancel,
            RequestEvent::StartWork => EventKind::StartWork,
            RequestEvent::SubmitDetails { .. } => EventKind::SubmitDetails,
            RequestEvent::Confirm { .. } => EventKind::Confirm,
            RequestEvent::PaymentComplete => EventKind::PaymentComplete,
        }
    }

    fn validate(&self) -> Result<(), TransitionError> {
        match self {
            RequestEvent::ProposePrice { price, .. } if *price <= 0 => {
                Err(TransitionError::InvalidInput {
                    field: "proposed_price",
                    reason: format!("must be positive, got {price}"),
                })
            }
            RequestEvent::SubmitDetails { description, .. } if description.trim().is_empty() => {
                Err(TransitionError::InvalidInput {
                    field: "completion_description",
                    reason: "must not be blank".to_string(),
                })
            }
            RequestEvent::Confirm { rating, .. } if !(1..=5).contains(rating) => {
                Err(TransitionError::InvalidInput {
                    field: "rating",
                    reason: format!("must be between 1 and 5, got {rating}"),
                })
            }
            _ => Ok(()),
        }
    }
}

/// One row of the lifecycle transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRule {
    pub from: RequestStatus,
    pub event: EventKind,
    pub actor: Role,
    pub to: RequestStatus,
}

const fn rule(
    from: RequestStatus,
    event: EventKind,
    actor: Role,
    to: RequestStatus,
) -> TransitionRule {
    TransitionRule { from, event, actor, to }
}

/// The complete lifecycle. Anything not listed here is refused.
pub const TRANSITIONS: &[TransitionRule] = &[
    rule(RequestStatus::Pending, EventKind::Accept, Role::Provider, RequestStatus::Accepted),
    rule(RequestStatus::Pending, EventKind::Reject, Role::Provider, RequestStatus::Rejected),
    rule(
        RequestStatus::Pending,
        EventKind::ProposePrice,
        Role::Provider,
        RequestStatus::PriceProposed,
    ),
    rule(
        RequestStatus::PriceProposed,
        EventKind::ConfirmPrice,
        Role::Client,
        RequestStatus::Accepted,
    ),
    rule(
        RequestStatus::PriceProposed,
        EventKind::RejectPrice,
        Role::Client,
        RequestStatus::Rejected,
    ),
    rule(RequestStatus::Pending, EventKind::Cancel, Role::Client, RequestStatus::CancelledByClient),
    rule(
        RequestStatus::Accepted,
        EventKind::Cancel,
        Role::Client,
        RequestStatus::CancelledByClient,
    ),
    rule(
        RequestStatus::Accepted,
        EventKind::Cancel,
        Role::Provider,
        RequestStatus::CancelledByProvider,
    ),
    rule(
        RequestStatus::InProgress,
        EventKind::Cancel,
        Role::Provider,
        RequestStatus::CancelledByProvider,
    ),
    rule(RequestStatus::Accepted, EventKind::StartWork, Role::Provider, RequestStatus::InProgress),
    rule(
        RequestStatus::InProgress,
        EventKind::SubmitDetails,
        Role::Provider,
        RequestStatus::AwaitingClientConfirmation,
    ),
    rule(
        RequestStatus::AwaitingClientConfirmation,
        EventKind::Confirm,
        Role::Client,
        RequestStatus::AwaitingPayment,
    ),
    rule(
        RequestStatus::AwaitingPayment,
        EventKind::PaymentComplete,
        Role::Provider,
        RequestStatus::Completed,
    ),
];

pub fn find_rule(
    from: RequestStatus,
    event: EventKind,
    actor: Role,
) -> Option<&'static TransitionRule> {
    TRANSITIONS
        .iter()
        .find(|rule| rule.from == from && rule.event == event && rule.actor == actor)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("{event} is not allowed for the {actor} while the request is {from}")]
    NotAllowed {
        from: RequestStatus,
        event: EventKind,
        actor: Role,
    },
    #[error("invalid {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },
}

/// Persisted service request row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub id: String,
    pub client_id: String,
    pub provider_id: String,
    pub listing_id: String,
    pub status: RequestStatus,
    #[serde(default)]
    pub proposed_price: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub provider_response: Option<String>,
    #[serde(default)]
    pub preferred_date: Option<NaiveDate>,
    #[serde(default, with = "wire::opt_time")]
    pub preferred_time: Option<NaiveTime>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub address_detail: Option<String>,
    #[serde(default)]
    pub aimag_id: Option<String>,
    #[serde(default)]
    pub district_id: Option<String>,
    #[serde(default)]
    pub khoroo_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completion_description: Option<String>,
    #[serde(default, deserialize_with = "wire::null_as_empty")]
    pub completion_photos: Vec<String>,
}

/// Where the work happens: the provider travels (on-site) or the client travels (remote).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServiceLocation {
    OnSite {
        latitude: f64,
        longitude: f64,
        address_detail: Option<String>,
    },
    Remote {
        aimag_id: String,
        district_id: Option<String>,
        khoroo_id: Option<String>,
    },
}

impl ServiceRequest {
    /// Builds the initial `pending` row for a freshly submitted request.
    pub fn from_new(
        id: impl Into<String>,
        new: NewServiceRequest,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            client_id: new.client_id,
            provider_id: new.provider_id,
            listing_id: new.listing_id,
            status: RequestStatus::Pending,
            proposed_price: None,
            message: new.message,
            provider_response: None,
            preferred_date: new.preferred_date,
            preferred_time: new.preferred_time,
            latitude: new.latitude,
            longitude: new.longitude,
            address_detail: new.address_detail,
            aimag_id: new.aimag_id,
            district_id: new.district_id,
            khoroo_id: new.khoroo_id,
            created_at,
            accepted_at: None,
            started_at: None,
            completed_at: None,
            completion_description: None,
            completion_photos: Vec::new(),
        }
    }

    pub fn role_of(&self, user_id: &str) -> Option<Role> {
        if self.client_id == user_id {
            Some(Role::Client)
        } else if self.provider_id == user_id {
            Some(Role::Provider)
        } else {
            None
        }
    }

    pub fn party(&self, role: Role) -> &str {
        match role {
            Role::Client => &self.client_id,
            Role::Provider => &self.provider_id,
        }
    }

    pub fn location(&self) -> Option<ServiceLocation> {
        if let (Some(latitude), Some(longitude)) = (self.latitude, self.longitude) {
            return Some(ServiceLocation::OnSite {
                latitude,
                longitude,
                address_detail: self.address_detail.clone(),
            });
        }
        self.aimag_id.as_ref().map(|aimag_id| ServiceLocation::Remote {
            aimag_id: aimag_id.clone(),
            district_id: self.district_id.clone(),
            khoroo_id: self.khoroo_id.clone(),
        })
    }

    /// Wall-clock start of the job, if a preferred time was given.
    pub fn preferred_start(&self, today: NaiveDate) -> Option<NaiveDateTime> {
        let time = self.preferred_time?;
        Some(self.preferred_date.unwrap_or(today).and_time(time))
    }
}

/// Client-supplied fields of the request-creation form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewServiceRequest {
    pub client_id: String,
    pub provider_id: String,
    pub listing_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "wire::opt_time")]
    pub preferred_time: Option<NaiveTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aimag_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub district_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub khoroo_id: Option<String>,
}

/// Fields co-committed with a status change. Absent fields are left untouched;
/// `proposed_price: Some(None)` clears the price.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RequestStatus>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "wire::double_option"
    )]
    pub proposed_price: Option<Option<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_photos: Option<Vec<String>>,
}

impl RequestPatch {
    pub fn status(status: RequestStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Applies the patch in place. Lifecycle timestamps are write-once: a value
    /// that is already set is never replaced.
    pub fn apply_to(&self, request: &mut ServiceRequest) {
        if let Some(status) = self.status {
            request.status = status;
        }
        if let Some(price) = self.proposed_price {
            request.proposed_price = price;
        }
        if let Some(response) = &self.provider_response {
            request.provider_response = Some(response.clone());
        }
        write_once(&mut request.accepted_at, self.accepted_at);
        write_once(&mut request.started_at, self.started_at);
        write_once(&mut request.completed_at, self.completed_at);
        if let Some(description) = &self.completion_description {
            request.completion_description = Some(description.clone());
        }
        if let Some(photos) = &self.completion_photos {
            request.completion_photos = photos.clone();
        }
    }
}

fn write_once(slot: &mut Option<DateTime<Utc>>, value: Option<DateTime<Utc>>) {
    if slot.is_none() {
        *slot = value;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub id: String,
    pub request_id: String,
    pub listing_id: String,
    pub reviewer_id: String,
    pub provider_id: String,
    pub rating: u8,
    #[serde(default)]
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReview {
    pub request_id: String,
    pub listing_id: String,
    pub reviewer_id: String,
    pub provider_id: String,
    pub rating: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    RequestAccepted,
    RequestRejected,
    PriceProposed,
    PriceConfirmed,
    PriceRejected,
    RequestCancelled,
    WorkStarted,
    WorkSubmitted,
    WorkConfirmed,
    PaymentCompleted,
}

/// Payload handed to the notification sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationDraft {
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub request_id: String,
    pub actor_id: String,
}

/// Everything a single lifecycle step commits: the status edge, the co-committed
/// fields, an optional review and the notifications to send once it succeeds.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionPlan {
    pub request_id: String,
    pub event: EventKind,
    pub actor: Role,
    pub from: RequestStatus,
    pub to: RequestStatus,
    pub patch: RequestPatch,
    pub review: Option<NewReview>,
    pub notifications: Vec<NotificationDraft>,
}

/// Resolves `event` against the transition table for `request` as seen by `actor`.
pub fn plan_transition(
    request: &ServiceRequest,
    actor: Role,
    event: &RequestEvent,
    now: DateTime<Utc>,
) -> Result<TransitionPlan, TransitionError> {
    let kind = event.kind();
    let rule = find_rule(request.status, kind, actor).ok_or(TransitionError::NotAllowed {
        from: request.status,
        event: kind,
        actor,
    })?;
    event.validate()?;

    let mut patch = RequestPatch::status(rule.to);
    let mut review = None;
    match event {
        RequestEvent::Accept | RequestEvent::ConfirmPrice => {
            if request.accepted_at.is_none() {
                patch.accepted_at = Some(now);
            }
        }
        RequestEvent::Reject { response } => {
            patch.provider_response = response.clone();
        }
        RequestEvent::ProposePrice { price, response } => {
            patch.proposed_price = Some(Some(*price));
            patch.provider_response = response.clone();
        }
        RequestEvent::RejectPrice => {
            patch.proposed_price = Some(None);
        }
        RequestEvent::Cancel => {}
        RequestEvent::StartWork => {
            if request.started_at.is_none() {
                patch.started_at = Some(now);
            }
        }
        RequestEvent::SubmitDetails { description, photos } => {
            patch.completion_description = Some(description.trim().to_string());
            patch.completion_photos = Some(photos.clone());
        }
        RequestEvent::Confirm { rating, comment } => {
            review = Some(NewReview {
                request_id: request.id.clone(),
                listing_id: request.listing_id.clone(),
                reviewer_id: request.client_id.clone(),
                provider_id: request.provider_id.clone(),
                rating: *rating,
                comment: comment.clone().filter(|c| !c.trim().is_empty()),
            });
        }
        RequestEvent::PaymentComplete => {
            if request.completed_at.is_none() {
                patch.completed_at = Some(now);
            }
        }
    }

    Ok(TransitionPlan {
        request_id: request.id.clone(),
        event: kind,
        actor,
        from: rule.from,
        to: rule.to,
        patch,
        review,
        notifications: notifications_for(request, actor, event),
    })
}

fn notifications_for(
    request: &ServiceRequest,
    actor: Role,
    event: &RequestEvent,
) -> Vec<NotificationDraft> {
    let counterpart = match actor {
        Role::Client => Role::Provider,
        Role::Provider => Role::Client,
    };
    let draft = |recipient: Role, kind: NotificationKind, title: &str, message: String| {
        NotificationDraft {
            user_id: request.party(recipient).to_string(),
            kind,
            title: title.to_string(),
            message,
            request_id: request.id.clone(),
            actor_id: request.party(actor).to_string(),
        }
    };

    match event {
        RequestEvent::Accept => vec![draft(
            counterpart,
            NotificationKind::RequestAccepted,
            "Request accepted",
            "The provider accepted your service request.".to_string(),
        )],
        RequestEvent::Reject { .. } => vec![draft(
            counterpart,
            NotificationKind::RequestRejected,
            "Request declined",
            "The provider declined your service request.".to_string(),
        )],
        RequestEvent::ProposePrice { price, .. } => vec![draft(
            counterpart,
            NotificationKind::PriceProposed,
            "New price proposed",
            format!("The provider proposed a price of {price}. Please confirm or decline it."),
        )],
        RequestEvent::ConfirmPrice => vec![draft(
            counterpart,
            NotificationKind::PriceConfirmed,
            "Price confirmed",
            "The client accepted your proposed price.".to_string(),
        )],
        RequestEvent::RejectPrice => vec![draft(
            counterpart,
            NotificationKind::PriceRejected,
            "Price declined",
            "The client declined your proposed price.".to_string(),
        )],
        RequestEvent::Cancel => vec![draft(
            counterpart,
            NotificationKind::RequestCancelled,
            "Request cancelled",
            format!("The {actor} cancelled the service request."),
        )],
        RequestEvent::StartWork => vec![draft(
            counterpart,
            NotificationKind::WorkStarted,
            "Work started",
            "The provider has started working on your request.".to_string(),
        )],
        RequestEvent::SubmitDetails { .. } => vec![draft(
            counterpart,
            NotificationKind::WorkSubmitted,
            "Work completed",
            "The provider submitted a completion report. Please review and confirm.".to_string(),
        )],
        RequestEvent::Confirm { rating, .. } => vec![draft(
            counterpart,
            NotificationKind::WorkConfirmed,
            "Work confirmed",
            format!("The client confirmed the work and left a {rating}-star review."),
        )],
        RequestEvent::PaymentComplete => vec![
            draft(
                Role::Client,
                NotificationKind::PaymentCompleted,
                "Payment completed",
                "Payment was recorded and the request is now complete.".to_string(),
            ),
            draft(
                Role::Provider,
                NotificationKind::PaymentCompleted,
                "Payment completed",
                "Payment was recorded and the request is now complete.".to_string(),
            ),
        ],
    }
}

/// Per-action availability for one viewer, read by the UI instead of comparing status strings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RequestActions {
    pub can_accept: bool,
    pub can_reject: bool,
    pub can_propose_price: bool,
    pub can_confirm_price: bool,
    pub can_reject_price: bool,
    pub can_cancel: bool,
    pub can_start_work: bool,
    pub can_submit_details: bool,
    pub can_confirm: bool,
    pub can_complete_payment: bool,
    pub can_delete: bool,
}

impl RequestActions {
    pub fn for_status(status: RequestStatus, role: Role) -> Self {
        let allowed = |event| find_rule(status, event, role).is_some();
        Self {
            can_accept: allowed(EventKind::Accept),
            can_reject: allowed(EventKind::Reject),
            can_propose_price: allowed(EventKind::ProposePrice),
            can_confirm_price: allowed(EventKind::ConfirmPrice),
            can_reject_price: allowed(EventKind::RejectPrice),
            can_cancel: allowed(EventKind::Cancel),
            can_start_work: allowed(EventKind::StartWork),
            can_submit_details: allowed(EventKind::SubmitDetails),
            can_confirm: allowed(EventKind::Confirm),
            can_complete_payment: allowed(EventKind::PaymentComplete),
            can_delete: role == Role::Client && status.is_deletable(),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn allows(&self, event: EventKind) -> bool {
        match event {
            EventKind::Accept => self.can_accept,
            EventKind::Reject => self.can_reject,
            EventKind::ProposePrice => self.can_propose_price,
            EventKind::ConfirmPrice => self.can_confirm_price,
            EventKind::RejectPrice => self.can_reject_price,
            EventKind::Cancel => self.can_cancel,
            EventKind::StartWork => self.can_start_work,
            EventKind::SubmitDetails => self.can_submit_details,
            EventKind::Confirm => self.can_confirm,
            EventKind::PaymentComplete => self.can_complete_payment,
        }
    }

    pub fn any(&self) -> bool {
        *self != Self::disabled()
    }
}

/// Mutually exclusive display grouping of a request for one viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Sent,
    Received,
    ActiveJobs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketPolicy {
    /// An accepted request whose start is at most this far away counts as an active job.
    pub near_start_window: Duration,
    /// Offset used to turn `now` into the wall-clock date/time the schedule is written in.
    pub utc_offset_minutes: i32,
}

impl Default for BucketPolicy {
    fn default() -> Self {
        Self {
            near_start_window: Duration::hours(5),
            utc_offset_minutes: 8 * 60,
        }
    }
}

impl BucketPolicy {
    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes.saturating_mul(60))
            .unwrap_or_else(|| Utc.fix())
    }

    pub fn local_now(&self, now: DateTime<Utc>) -> NaiveDateTime {
        now.with_timezone(&self.offset()).naive_local()
    }
}

/// True for an accepted request scheduled today or earlier, or starting within the window.
pub fn is_near_start(request: &ServiceRequest, now: DateTime<Utc>, policy: &BucketPolicy) -> bool {
    let local_now = policy.local_now(now);
    let today = local_now.date();
    if request.preferred_date.is_some_and(|date| date <= today) {
        return true;
    }
    request
        .preferred_start(today)
        .is_some_and(|start| start - local_now <= policy.near_start_window)
}

pub fn is_active_job(request: &ServiceRequest, now: DateTime<Utc>, policy: &BucketPolicy) -> bool {
    match request.status {
        status if status.is_work_in_flight() => true,
        RequestStatus::Accepted => is_near_start(request, now, policy),
        _ => false,
    }
}

/// Bucket for `viewer_id`, or `None` when the viewer is not a party to the request.
pub fn bucket_for(
    request: &ServiceRequest,
    viewer_id: &str,
    now: DateTime<Utc>,
    policy: &BucketPolicy,
) -> Option<Bucket> {
    let role = request.role_of(viewer_id)?;
    if is_active_job(request, now, policy) {
        return Some(Bucket::ActiveJobs);
    }
    Some(match role {
        Role::Client => Bucket::Sent,
        Role::Provider => Bucket::Received,
    })
}

/// A viewer's requests split into display buckets, newest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestBoard {
    pub sent: Vec<ServiceRequest>,
    pub received: Vec<ServiceRequest>,
    pub active_jobs: Vec<ServiceRequest>,
}

impl RequestBoard {
    /// Records may repeat across source lists; each id is bucketed once.
    pub fn build<'a>(
        records: impl IntoIterator<Item = &'a ServiceRequest>,
        viewer_id: &str,
        now: DateTime<Utc>,
        policy: &BucketPolicy,
    ) -> Self {
        let mut seen = HashSet::new();
        let mut board = Self::default();
        for record in records {
            if !seen.insert(record.id.as_str()) {
                continue;
            }
            match bucket_for(record, viewer_id, now, policy) {
                Some(Bucket::Sent) => board.sent.push(record.clone()),
                Some(Bucket::Received) => board.received.push(record.clone()),
                Some(Bucket::ActiveJobs) => board.active_jobs.push(record.clone()),
                None => {}
            }
        }
        for bucket in [&mut board.sent, &mut board.received, &mut board.active_jobs] {
            bucket.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        }
        board
    }

    pub fn bucket(&self, bucket: Bucket) -> &[ServiceRequest] {
        match bucket {
            Bucket::Sent => &self.sent,
            Bucket::Received => &self.received,
            Bucket::ActiveJobs => &self.active_jobs,
        }
    }

    pub fn bucket_of(&self, id: &str) -> Option<Bucket> {
        [Bucket::Sent, Bucket::Received, Bucket::ActiveJobs]
            .into_iter()
            .find(|bucket| self.bucket(*bucket).iter().any(|r| r.id == id))
    }

    pub fn len(&self) -> usize {
        self.sent.len() + self.received.len() + self.active_jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Key columns of a changed row; delete payloads often carry nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRef {
    pub id: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub provider_id: Option<String>,
}

impl From<&ServiceRequest> for RowRef {
    fn from(request: &ServiceRequest) -> Self {
        Self {
            id: request.id.clone(),
            client_id: Some(request.client_id.clone()),
            provider_id: Some(request.provider_id.clone()),
        }
    }
}

/// Realtime row-change message for the service request table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "eventType")]
    pub event_type: ChangeKind,
    #[serde(default)]
    pub new: Option<ServiceRequest>,
    #[serde(default)]
    pub old: Option<RowRef>,
}

impl ChangeEvent {
    pub fn inserted(record: ServiceRequest) -> Self {
        Self {
            event_type: ChangeKind::Insert,
            new: Some(record),
            old: None,
        }
    }

    pub fn updated(old: &ServiceRequest, new: ServiceRequest) -> Self {
        Self {
            event_type: ChangeKind::Update,
            new: Some(new),
            old: Some(RowRef::from(old)),
        }
    }

    pub fn deleted(old: &ServiceRequest) -> Self {
        Self {
            event_type: ChangeKind::Delete,
            new: None,
            old: Some(RowRef::from(old)),
        }
    }

    pub fn record_id(&self) -> Option<&str> {
        self.new
            .as_ref()
            .map(|r| r.id.as_str())
            .or_else(|| self.old.as_ref().map(|r| r.id.as_str()))
    }

    /// Whether the change may concern `user_id`. A delete carrying only the id
    /// cannot be ruled out and counts as relevant.
    pub fn may_involve(&self, user_id: &str) -> bool {
        if let Some(new) = &self.new {
            if new.role_of(user_id).is_some() {
                return true;
            }
        }
        match &self.old {
            Some(old) => match (&old.client_id, &old.provider_id) {
                (None, None) => self.new.is_none(),
                (client, provider) => {
                    client.as_deref() == Some(user_id) || provider.as_deref() == Some(user_id)
                }
            },
            None => false,
        }
    }
}

mod wire {
    use chrono::NaiveTime;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
    }

    pub fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }

    pub fn parse_time(text: &str) -> Option<NaiveTime> {
        NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
            .or_else(|_| NaiveTime::parse_from_str(text, "%H:%M"))
            .ok()
    }

    /// `preferred_time` arrives as `HH:MM` from forms and `HH:MM:SS` from the database.
    pub mod opt_time {
        use super::*;

        pub fn serialize<S>(value: &Option<NaiveTime>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(time) => serializer.collect_str(&time.format("%H:%M:%S")),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveTime>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let raw = Option::<String>::deserialize(deserializer)?;
            match raw.as_deref().map(str::trim) {
                None | Some("") => Ok(None),
                Some(text) => parse_time(text)
                    .map(Some)
                    .ok_or_else(|| de::Error::custom(format!("invalid time `{text}`"))),
            }
        }
    }
}
