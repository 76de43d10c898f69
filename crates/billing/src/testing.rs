//! In-memory provider and store for tests
//!
//! Compiled for this crate's tests and, through the `test-utils` feature,
//! for dependent crates' tests.

#![allow(clippy::unwrap_used)]

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use maturamate_shared::Subject;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::PriceIds;
use crate::error::{BillingError, BillingResult};
use crate::provider::{
    plan_item_updates, BillingProvider, ProrationMode, ProviderSubscription, SubscriptionItem,
    SubscriptionState,
};
use crate::store::{
    BillingCustomer, BillingStore, PendingChangeStatus, PendingSubscriptionChange,
    WEBHOOK_PROCESSING_TIMEOUT,
};

pub fn test_price_ids() -> PriceIds {
    PriceIds {
        first_subject: "price_first_subject".to_string(),
        additional_subject: "price_additional_subject".to_string(),
    }
}

pub fn test_subject(name: &str, order_index: i32) -> Subject {
    Subject {
        id: Uuid::new_v4(),
        name: name.to_string(),
        description: Some(format!("Corso di {}", name)),
        color: "#4f46e5".to_string(),
        slug: name.to_lowercase(),
        maturita: true,
        order_index,
    }
}

/// Call recorded by [`InMemoryProvider`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    Preview { subject_count: usize },
    UpdateSubjects { subject_count: usize, proration: ProrationMode },
    SetCancelAtPeriodEnd(bool),
}

/// Fake Stripe holding subscriptions in memory
///
/// Previews return the configured `preview_amount_cents`; updates rewrite
/// item quantities the same way Stripe would.
pub struct InMemoryProvider {
    prices: PriceIds,
    subscriptions: Mutex<HashMap<String, ProviderSubscription>>,
    calls: Mutex<Vec<ProviderCall>>,
    preview_amount_cents: Mutex<i64>,
    fail_updates: Mutex<bool>,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new(test_price_ids())
    }
}

impl InMemoryProvider {
    pub fn new(prices: PriceIds) -> Self {
        Self {
            prices,
            subscriptions: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            preview_amount_cents: Mutex::new(0),
            fail_updates: Mutex::new(false),
        }
    }

    /// Create an active subscription billing `subject_ids`, period ending in `days_left` days
    pub fn create_subscription(
        &self,
        subject_ids: &BTreeSet<Uuid>,
        days_left: i64,
    ) -> ProviderSubscription {
        let now = OffsetDateTime::now_utc();
        let id = format!("sub_{}", Uuid::new_v4().simple());
        let mut subscription = ProviderSubscription {
            id: id.clone(),
            customer_id: format!("cus_{}", Uuid::new_v4().simple()),
            state: SubscriptionState::Active,
            cancel_at_period_end: false,
            current_period_start: now - time::Duration::days(30 - days_left),
            current_period_end: now + time::Duration::days(days_left),
            items: Vec::new(),
            subject_ids: subject_ids.clone(),
        };
        subscription.items = self.apply_items(&subscription.items, subject_ids.len());

        self.subscriptions
            .lock()
            .unwrap()
            .insert(id, subscription.clone());
        subscription
    }

    pub fn subscription(&self, id: &str) -> Option<ProviderSubscription> {
        self.subscriptions.lock().unwrap().get(id).cloned()
    }

    /// Mutate a stored subscription, e.g. to simulate a period rollover
    pub fn update_stored(&self, id: &str, f: impl FnOnce(&mut ProviderSubscription)) {
        if let Some(sub) = self.subscriptions.lock().unwrap().get_mut(id) {
            f(sub);
        }
    }

    pub fn set_preview_amount(&self, cents: i64) {
        *self.preview_amount_cents.lock().unwrap() = cents;
    }

    pub fn fail_updates(&self, fail: bool) {
        *self.fail_updates.lock().unwrap() = fail;
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Billed subject count derived from item quantities
    pub fn billed_subject_count(&self, id: &str) -> u64 {
        self.subscription(id)
            .map(|sub| {
                sub.items
                    .iter()
                    .filter(|item| self.prices.is_known(&item.price_id))
                    .map(|item| item.quantity)
                    .sum()
            })
            .unwrap_or(0)
    }

    fn apply_items(&self, items: &[SubscriptionItem], subject_count: usize) -> Vec<SubscriptionItem> {
        let mut items = items.to_vec();
        for update in plan_item_updates(&items, &self.prices, subject_count) {
            match update.id {
                Some(id) if update.deleted => items.retain(|item| item.id != id),
                Some(id) => {
                    if let Some(item) = items.iter_mut().find(|item| item.id == id) {
                        item.quantity = update.quantity.unwrap_or(item.quantity);
                    }
                }
                None => items.push(SubscriptionItem {
                    id: format!("si_{}", Uuid::new_v4().simple()),
                    price_id: update.price.unwrap_or_default(),
                    quantity: update.quantity.unwrap_or(1),
                }),
            }
        }
        items
    }

    fn stored(&self, id: &str) -> BillingResult<ProviderSubscription> {
        self.subscription(id)
            .ok_or_else(|| BillingError::StripeApi(format!("No such subscription: '{}'", id)))
    }
}

#[async_trait]
impl BillingProvider for InMemoryProvider {
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        self.stored(subscription_id)
    }

    async fn preview_subject_change(
        &self,
        subscription: &ProviderSubscription,
        subject_count: usize,
    ) -> BillingResult<i64> {
        self.stored(&subscription.id)?;
        self.calls
            .lock()
            .unwrap()
            .push(ProviderCall::Preview { subject_count });
        Ok(*self.preview_amount_cents.lock().unwrap())
    }

    async fn update_subjects(
        &self,
        subscription: &ProviderSubscription,
        subject_ids: &BTreeSet<Uuid>,
        proration: ProrationMode,
    ) -> BillingResult<ProviderSubscription> {
        if *self.fail_updates.lock().unwrap() {
            return Err(BillingError::StripeApi("Your card was declined.".to_string()));
        }

        let mut current = self.stored(&subscription.id)?;
        current.items = self.apply_items(&current.items, subject_ids.len());
        current.subject_ids = subject_ids.clone();

        self.subscriptions
            .lock()
            .unwrap()
            .insert(current.id.clone(), current.clone());
        self.calls.lock().unwrap().push(ProviderCall::UpdateSubjects {
            subject_count: subject_ids.len(),
            proration,
        });
        Ok(current)
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> BillingResult<ProviderSubscription> {
        let mut current = self.stored(subscription_id)?;
        current.cancel_at_period_end = cancel_at_period_end;

        self.subscriptions
            .lock()
            .unwrap()
            .insert(current.id.clone(), current.clone());
        self.calls
            .lock()
            .unwrap()
            .push(ProviderCall::SetCancelAtPeriodEnd(cancel_at_period_end));
        Ok(current)
    }
}

/// Store backed by hash maps, mirroring the Postgres constraints
#[derive(Default)]
pub struct InMemoryStore {
    subjects: Mutex<Vec<Subject>>,
    customers: Mutex<HashMap<String, BillingCustomer>>,
    entitlements: Mutex<HashMap<String, BTreeSet<Uuid>>>,
    pending: Mutex<Vec<PendingSubscriptionChange>>,
    webhook_events: Mutex<HashMap<String, WebhookEventRecord>>,
    fail_pending_writes: Mutex<bool>,
}

/// Stored webhook event; `finished` is false while a handler holds the claim
#[derive(Debug, Clone)]
struct WebhookEventRecord {
    finished: bool,
    error: Option<String>,
    started_at: OffsetDateTime,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subjects(subjects: Vec<Subject>) -> Self {
        let store = Self::default();
        *store.subjects.lock().unwrap() = subjects;
        store
    }

    pub fn add_customer(&self, user_id: &str, subscription: &ProviderSubscription) {
        self.customers.lock().unwrap().insert(
            user_id.to_string(),
            BillingCustomer {
                user_id: user_id.to_string(),
                stripe_customer_id: Some(subscription.customer_id.clone()),
                stripe_subscription_id: Some(subscription.id.clone()),
                status: Some(subscription.state.as_str().to_string()),
                cancel_at_period_end: subscription.cancel_at_period_end,
                current_period_end: Some(subscription.current_period_end),
            },
        );
        self.entitlements
            .lock()
            .unwrap()
            .insert(user_id.to_string(), subscription.subject_ids.clone());
    }

    pub fn all_pending_changes(&self) -> Vec<PendingSubscriptionChange> {
        self.pending.lock().unwrap().clone()
    }

    /// Move a change's effective date, e.g. into the past to make it due
    pub fn set_effective_at(&self, change_id: Uuid, effective_at: OffsetDateTime) {
        if let Some(change) = self
            .pending
            .lock()
            .unwrap()
            .iter_mut()
            .find(|c| c.id == change_id)
        {
            change.effective_at = effective_at;
        }
    }

    /// `Some(None)` for a successful or in-flight event, `Some(Some(err))` for a failed one
    pub fn webhook_event_result(&self, event_id: &str) -> Option<Option<String>> {
        self.webhook_events
            .lock()
            .unwrap()
            .get(event_id)
            .map(|record| record.error.clone())
    }

    /// Backdate an in-flight claim, as if its handler died long ago
    pub fn age_webhook_claim(&self, event_id: &str, age: time::Duration) {
        if let Some(record) = self.webhook_events.lock().unwrap().get_mut(event_id) {
            record.started_at = OffsetDateTime::now_utc() - age;
        }
    }

    /// Make pending-change updates and cancellations fail with a database error
    pub fn fail_pending_writes(&self, fail: bool) {
        *self.fail_pending_writes.lock().unwrap() = fail;
    }

    fn check_pending_writes(&self) -> BillingResult<()> {
        if *self.fail_pending_writes.lock().unwrap() {
            return Err(BillingError::Database("connection reset by peer".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BillingStore for InMemoryStore {
    async fn customer(&self, user_id: &str) -> BillingResult<Option<BillingCustomer>> {
        Ok(self.customers.lock().unwrap().get(user_id).cloned())
    }

    async fn customer_for_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<BillingCustomer>> {
        Ok(self
            .customers
            .lock()
            .unwrap()
            .values()
            .find(|c| c.stripe_subscription_id.as_deref() == Some(stripe_subscription_id))
            .cloned())
    }

    async fn sync_subscription(
        &self,
        user_id: &str,
        subscription: &ProviderSubscription,
    ) -> BillingResult<()> {
        let mut customers = self.customers.lock().unwrap();
        let customer = customers
            .entry(user_id.to_string())
            .or_insert_with(|| BillingCustomer {
                user_id: user_id.to_string(),
                stripe_customer_id: None,
                stripe_subscription_id: None,
                status: None,
                cancel_at_period_end: false,
                current_period_end: None,
            });
        customer.stripe_customer_id = Some(subscription.customer_id.clone());
        customer.stripe_subscription_id = Some(subscription.id.clone());
        customer.status = Some(subscription.state.as_str().to_string());
        customer.cancel_at_period_end = subscription.cancel_at_period_end;
        customer.current_period_end = Some(subscription.current_period_end);
        Ok(())
    }

    async fn list_subjects(&self) -> BillingResult<Vec<Subject>> {
        Ok(self.subjects.lock().unwrap().clone())
    }

    async fn entitled_subject_ids(&self, user_id: &str) -> BillingResult<BTreeSet<Uuid>> {
        Ok(self
            .entitlements
            .lock()
            .unwrap()
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn replace_entitlements(
        &self,
        user_id: &str,
        subject_ids: &BTreeSet<Uuid>,
    ) -> BillingResult<()> {
        self.entitlements
            .lock()
            .unwrap()
            .insert(user_id.to_string(), subject_ids.clone());
        Ok(())
    }

    async fn pending_change(
        &self,
        user_id: &str,
    ) -> BillingResult<Option<PendingSubscriptionChange>> {
        Ok(self
            .pending
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.user_id == user_id && c.status == PendingChangeStatus::Pending)
            .cloned())
    }

    async fn list_pending_changes(
        &self,
        user_id: &str,
    ) -> BillingResult<Vec<PendingSubscriptionChange>> {
        Ok(self
            .pending
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.user_id == user_id && c.status == PendingChangeStatus::Pending)
            .cloned()
            .collect())
    }

    async fn insert_pending_change(
        &self,
        change: &PendingSubscriptionChange,
    ) -> BillingResult<()> {
        let mut pending = self.pending.lock().unwrap();
        if pending
            .iter()
            .any(|c| c.user_id == change.user_id && c.status == PendingChangeStatus::Pending)
        {
            return Err(BillingError::PendingChangeExists);
        }
        pending.push(change.clone());
        Ok(())
    }

    async fn update_pending_target(
        &self,
        change_id: Uuid,
        target_subject_ids: &BTreeSet<Uuid>,
        new_price_cents: i64,
    ) -> BillingResult<()> {
        self.check_pending_writes()?;
        let mut pending = self.pending.lock().unwrap();
        let change = pending
            .iter_mut()
            .find(|c| c.id == change_id && c.status == PendingChangeStatus::Pending)
            .ok_or(BillingError::NoPendingChange)?;
        change.target_subject_ids = target_subject_ids.iter().copied().collect();
        change.new_price_cents = new_price_cents;
        change.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn cancel_pending_change(&self, change_id: Uuid) -> BillingResult<bool> {
        self.check_pending_writes()?;
        let mut pending = self.pending.lock().unwrap();
        match pending
            .iter_mut()
            .find(|c| c.id == change_id && c.status == PendingChangeStatus::Pending)
        {
            Some(change) => {
                change.status = PendingChangeStatus::Cancelled;
                change.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn resolve_pending_change(
        &self,
        change: &PendingSubscriptionChange,
    ) -> BillingResult<bool> {
        {
            let mut pending = self.pending.lock().unwrap();
            match pending
                .iter_mut()
                .find(|c| c.id == change.id && c.status == PendingChangeStatus::Pending)
            {
                Some(stored) => {
                    stored.status = PendingChangeStatus::Resolved;
                    stored.updated_at = OffsetDateTime::now_utc();
                }
                None => return Ok(false),
            }
        }
        self.entitlements
            .lock()
            .unwrap()
            .insert(change.user_id.clone(), change.target_set());
        Ok(true)
    }

    async fn claim_webhook_event(&self, event_id: &str, _event_type: &str) -> BillingResult<bool> {
        let now = OffsetDateTime::now_utc();
        let mut events = self.webhook_events.lock().unwrap();
        let claimable = match events.get(event_id) {
            None => true,
            Some(record) if record.finished => record.error.is_some(),
            Some(record) => record.started_at < now - WEBHOOK_PROCESSING_TIMEOUT,
        };
        if !claimable {
            return Ok(false);
        }
        events.insert(
            event_id.to_string(),
            WebhookEventRecord {
                finished: false,
                error: None,
                started_at: now,
            },
        );
        Ok(true)
    }

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        error: Option<&str>,
    ) -> BillingResult<()> {
        if let Some(record) = self.webhook_events.lock().unwrap().get_mut(event_id) {
            record.finished = true;
            record.error = error.map(str::to_string);
        }
        Ok(())
    }
}
