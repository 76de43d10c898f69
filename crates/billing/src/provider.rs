//! Payment provider seam
//!
//! [`BillingProvider`] is everything the subscription flow needs from Stripe:
//! read a subscription, preview an item change, apply an item change, and
//! toggle cancel-at-period-end. [`StripeProvider`] is the production
//! implementation.
//!
//! The subscription carries two line items: the first-subject price with
//! quantity 1, and the additional-subject price with quantity `count - 1`
//! (removed when it would be zero). The selected subject ids are mirrored in
//! the subscription metadata under [`SUBJECT_IDS_METADATA_KEY`].

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stripe::{
    Subscription, SubscriptionId, SubscriptionStatus as StripeSubStatus, UpdateSubscription,
    UpdateSubscriptionItems,
};
// Import the proration behavior enum from the subscription module (not subscription_item)
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::{PriceIds, StripeClient};
use crate::error::{BillingError, BillingResult};

/// Metadata key holding the comma-separated subject ids
pub const SUBJECT_IDS_METADATA_KEY: &str = "subject_ids";

/// Normalized subscription state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Active,
    PastDue,
    Canceled,
    Incomplete,
}

impl SubscriptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::Active => "active",
            SubscriptionState::PastDue => "past_due",
            SubscriptionState::Canceled => "canceled",
            SubscriptionState::Incomplete => "incomplete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SubscriptionState::Active),
            "past_due" => Some(SubscriptionState::PastDue),
            "canceled" => Some(SubscriptionState::Canceled),
            "incomplete" => Some(SubscriptionState::Incomplete),
            _ => None,
        }
    }

    /// Trialing counts as active, unpaid as past due, expired as canceled
    pub fn from_stripe(status: &StripeSubStatus) -> Self {
        match status {
            StripeSubStatus::Active | StripeSubStatus::Trialing => SubscriptionState::Active,
            StripeSubStatus::PastDue | StripeSubStatus::Unpaid => SubscriptionState::PastDue,
            StripeSubStatus::Canceled | StripeSubStatus::IncompleteExpired => {
                SubscriptionState::Canceled
            }
            // incomplete, paused
            _ => SubscriptionState::Incomplete,
        }
    }

    /// Past-due subscriptions keep access while Stripe retries the payment
    pub fn grants_access(&self) -> bool {
        matches!(self, SubscriptionState::Active | SubscriptionState::PastDue)
    }
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A priced line item on the provider subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionItem {
    pub id: String,
    pub price_id: String,
    pub quantity: u64,
}

/// Provider subscription reduced to the fields the subject flow uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSubscription {
    pub id: String,
    pub customer_id: String,
    pub state: SubscriptionState,
    pub cancel_at_period_end: bool,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub items: Vec<SubscriptionItem>,
    /// Subject ids from metadata (what Stripe will bill for next)
    pub subject_ids: BTreeSet<Uuid>,
}

impl ProviderSubscription {
    pub fn from_stripe(subscription: &Subscription) -> Self {
        let customer_id = match &subscription.customer {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(customer) => customer.id.to_string(),
        };

        let items = subscription
            .items
            .data
            .iter()
            .filter_map(|item| {
                let price = item.price.as_ref()?;
                Some(SubscriptionItem {
                    id: item.id.to_string(),
                    price_id: price.id.to_string(),
                    quantity: item.quantity.unwrap_or(0),
                })
            })
            .collect();

        Self {
            id: subscription.id.to_string(),
            customer_id,
            state: SubscriptionState::from_stripe(&subscription.status),
            cancel_at_period_end: subscription.cancel_at_period_end,
            current_period_start: timestamp(subscription.current_period_start),
            current_period_end: timestamp(subscription.current_period_end),
            items,
            subject_ids: parse_subject_ids(
                subscription
                    .metadata
                    .get(SUBJECT_IDS_METADATA_KEY)
                    .map(String::as_str),
            ),
        }
    }

    /// Whole days until the current period ends (never negative)
    pub fn days_remaining(&self, now: OffsetDateTime) -> i64 {
        let seconds = (self.current_period_end - now).whole_seconds().max(0);
        (seconds + 86_399) / 86_400
    }
}

fn timestamp(unix: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(unix).unwrap_or_else(|_| OffsetDateTime::now_utc())
}

pub fn format_subject_ids(ids: &BTreeSet<Uuid>) -> String {
    ids.iter()
        .map(Uuid::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Malformed entries are dropped
pub fn parse_subject_ids(raw: Option<&str>) -> BTreeSet<Uuid> {
    raw.map(|s| {
        s.split(',')
            .filter_map(|part| Uuid::parse_str(part.trim()).ok())
            .collect()
    })
    .unwrap_or_default()
}

/// How Stripe should bill an item change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProrationMode {
    /// Invoice the prorated difference right away
    AlwaysInvoice,
    /// No proration; the next renewal bills the new amount
    None,
}

impl ProrationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProrationMode::AlwaysInvoice => "always_invoice",
            ProrationMode::None => "none",
        }
    }
}

/// One entry of a subscription item update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemUpdate {
    /// Existing item id; `None` adds a new item
    pub id: Option<String>,
    pub price: Option<String>,
    pub quantity: Option<u64>,
    pub deleted: bool,
}

/// Compute the item updates that bill `subject_count` subjects
///
/// Items on prices other than the two subject prices are left alone.
pub fn plan_item_updates(
    items: &[SubscriptionItem],
    prices: &PriceIds,
    subject_count: usize,
) -> Vec<ItemUpdate> {
    let first_quantity = u64::from(subject_count > 0);
    let additional_quantity = subject_count.saturating_sub(1) as u64;

    let mut updates = Vec::new();
    for (price_id, quantity) in [
        (&prices.first_subject, first_quantity),
        (&prices.additional_subject, additional_quantity),
    ] {
        match items.iter().find(|item| &item.price_id == price_id) {
            Some(item) if quantity == 0 => updates.push(ItemUpdate {
                id: Some(item.id.clone()),
                price: None,
                quantity: None,
                deleted: true,
            }),
            Some(item) => updates.push(ItemUpdate {
                id: Some(item.id.clone()),
                price: None,
                quantity: Some(quantity),
                deleted: false,
            }),
            None if quantity > 0 => updates.push(ItemUpdate {
                id: None,
                price: Some(price_id.clone()),
                quantity: Some(quantity),
                deleted: false,
            }),
            None => {}
        }
    }
    updates
}

#[async_trait]
pub trait BillingProvider: Send + Sync {
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription>;

    /// Amount in cents that would be invoiced now if the subscription
    /// switched to `subject_count` subjects with immediate proration
    async fn preview_subject_change(
        &self,
        subscription: &ProviderSubscription,
        subject_count: usize,
    ) -> BillingResult<i64>;

    /// Bill for `subject_ids` from now on and record them in metadata
    async fn update_subjects(
        &self,
        subscription: &ProviderSubscription,
        subject_ids: &BTreeSet<Uuid>,
        proration: ProrationMode,
    ) -> BillingResult<ProviderSubscription>;

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> BillingResult<ProviderSubscription>;
}

/// Stripe-backed provider
#[derive(Clone)]
pub struct StripeProvider {
    stripe: StripeClient,
    http: reqwest::Client,
}

impl StripeProvider {
    pub fn new(stripe: StripeClient) -> Self {
        Self {
            stripe,
            http: reqwest::Client::new(),
        }
    }

    pub fn stripe(&self) -> &StripeClient {
        &self.stripe
    }

    fn parse_subscription_id(subscription_id: &str) -> BillingResult<SubscriptionId> {
        subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))
    }
}

#[async_trait]
impl BillingProvider for StripeProvider {
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let sub_id = Self::parse_subscription_id(subscription_id)?;
        let subscription = Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;
        Ok(ProviderSubscription::from_stripe(&subscription))
    }

    async fn preview_subject_change(
        &self,
        subscription: &ProviderSubscription,
        subject_count: usize,
    ) -> BillingResult<i64> {
        let updates = plan_item_updates(
            &subscription.items,
            &self.stripe.config().price_ids,
            subject_count,
        );

        // Use the POST /invoices/create_preview API (the old GET /invoices/upcoming is deprecated)
        let mut form: Vec<(String, String)> = vec![
            ("customer".to_string(), subscription.customer_id.clone()),
            ("subscription".to_string(), subscription.id.clone()),
            (
                "subscription_details[proration_behavior]".to_string(),
                ProrationMode::AlwaysInvoice.as_str().to_string(),
            ),
        ];
        for (i, update) in updates.iter().enumerate() {
            let key = |field: &str| format!("subscription_details[items][{}][{}]", i, field);
            if let Some(id) = &update.id {
                form.push((key("id"), id.clone()));
            }
            if let Some(price) = &update.price {
                form.push((key("price"), price.clone()));
            }
            if let Some(quantity) = update.quantity {
                form.push((key("quantity"), quantity.to_string()));
            }
            if update.deleted {
                form.push((key("deleted"), "true".to_string()));
            }
        }

        tracing::debug!(
            subscription_id = %subscription.id,
            subject_count = subject_count,
            "Calling Stripe invoices/create_preview API"
        );

        let response = self
            .http
            .post(format!(
                "{}/v1/invoices/create_preview",
                self.stripe.config().api_base
            ))
            .bearer_auth(&self.stripe.config().secret_key)
            .form(&form)
            .send()
            .await
            .map_err(|e| BillingError::StripeApi(format!("Failed to call Stripe API: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response.text().await.unwrap_or_default();
            tracing::error!(
                status = %status,
                error_body = %error_body,
                "Stripe invoices/create_preview API failed"
            );
            return Err(BillingError::StripeApi(format!(
                "Stripe API error ({}): {}",
                status, error_body
            )));
        }

        let preview: serde_json::Value = response.json().await.map_err(|e| {
            BillingError::StripeApi(format!("Failed to parse Stripe response: {}", e))
        })?;

        Ok(preview["amount_due"].as_i64().unwrap_or(0))
    }

    async fn update_subjects(
        &self,
        subscription: &ProviderSubscription,
        subject_ids: &BTreeSet<Uuid>,
        proration: ProrationMode,
    ) -> BillingResult<ProviderSubscription> {
        let sub_id = Self::parse_subscription_id(&subscription.id)?;
        let updates = plan_item_updates(
            &subscription.items,
            &self.stripe.config().price_ids,
            subject_ids.len(),
        );

        let items = updates
            .into_iter()
            .map(|update| UpdateSubscriptionItems {
                id: update.id,
                price: update.price,
                quantity: update.quantity,
                deleted: update.deleted.then_some(true),
                ..Default::default()
            })
            .collect();

        let mut metadata = HashMap::new();
        metadata.insert(
            SUBJECT_IDS_METADATA_KEY.to_string(),
            format_subject_ids(subject_ids),
        );

        let params = UpdateSubscription {
            items: Some(items),
            metadata: Some(metadata),
            proration_behavior: Some(match proration {
                ProrationMode::AlwaysInvoice => SubscriptionProrationBehavior::AlwaysInvoice,
                ProrationMode::None => SubscriptionProrationBehavior::None,
            }),
            ..Default::default()
        };

        let updated = Subscription::update(self.stripe.inner(), &sub_id, params)
            .await
            .map_err(|e| BillingError::StripeApi(e.to_string()))?;

        tracing::info!(
            subscription_id = %updated.id,
            subject_count = subject_ids.len(),
            proration = proration.as_str(),
            "Updated subscription subject items"
        );

        Ok(ProviderSubscription::from_stripe(&updated))
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> BillingResult<ProviderSubscription> {
        let sub_id = Self::parse_subscription_id(subscription_id)?;

        let params = UpdateSubscription {
            cancel_at_period_end: Some(cancel_at_period_end),
            ..Default::default()
        };

        let updated = Subscription::update(self.stripe.inner(), &sub_id, params).await?;
        Ok(ProviderSubscription::from_stripe(&updated))
    }
}
