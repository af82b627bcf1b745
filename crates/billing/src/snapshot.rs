//! Internal subscription snapshot
//!
//! The rest of the system never reads `stripe::Subscription` directly. A
//! snapshot is taken at the ingestion boundary so upstream schema drift is
//! absorbed in one place.

use serde::{Deserialize, Serialize};
use stripe::Subscription;
use time::OffsetDateTime;

/// Subscription status vocabulary, mirroring Stripe's
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
    Unpaid,
    Incomplete,
    IncompleteExpired,
    Paused,
}

impl SubscriptionStatus {
    /// Stable string form stored on entitlement records
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Paused => "paused",
        }
    }

    /// Whether this status grants access (before period-end checks)
    pub fn is_entitled(&self) -> bool {
        matches!(self, SubscriptionStatus::Trialing | SubscriptionStatus::Active)
    }
}

impl From<stripe::SubscriptionStatus> for SubscriptionStatus {
    fn from(status: stripe::SubscriptionStatus) -> Self {
        match status {
            stripe::SubscriptionStatus::Trialing => SubscriptionStatus::Trialing,
            stripe::SubscriptionStatus::Active => SubscriptionStatus::Active,
            stripe::SubscriptionStatus::PastDue => SubscriptionStatus::PastDue,
            stripe::SubscriptionStatus::Canceled => SubscriptionStatus::Canceled,
            stripe::SubscriptionStatus::Unpaid => SubscriptionStatus::Unpaid,
            stripe::SubscriptionStatus::Incomplete => SubscriptionStatus::Incomplete,
            stripe::SubscriptionStatus::IncompleteExpired => {
                SubscriptionStatus::IncompleteExpired
            }
            stripe::SubscriptionStatus::Paused => SubscriptionStatus::Paused,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Point-in-time view of a Stripe subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    pub subscription_id: String,
    pub customer_id: String,
    /// Price id of the first line item, if any
    pub price_id: Option<String>,
    pub status: SubscriptionStatus,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

impl SubscriptionSnapshot {
    /// Build a snapshot from a Stripe subscription object
    pub fn from_subscription(subscription: &Subscription) -> Self {
        let price_id = subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.to_string());

        Self {
            subscription_id: subscription.id.to_string(),
            customer_id: subscription.customer.id().to_string(),
            price_id,
            status: subscription.status.into(),
            current_period_start: timestamp(subscription.current_period_start),
            current_period_end: timestamp(subscription.current_period_end),
            trial_start: subscription.trial_start.map(timestamp),
            trial_end: subscription.trial_end.map(timestamp),
            cancel_at_period_end: subscription.cancel_at_period_end,
        }
    }
}

/// Convert a Unix-seconds timestamp from Stripe to `OffsetDateTime`.
/// Out-of-range values fall back to the epoch rather than failing ingestion.
fn timestamp(unix_seconds: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(unix_seconds)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}
