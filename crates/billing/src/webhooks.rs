//! Stripe webhook handling
//!
//! Keeps the local subscription mirror in step with Stripe and resolves
//! pending subject changes when a new billing period starts.

use std::future::Future;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use stripe::{Event, EventObject, EventType, Invoice, InvoiceBillingReason, Subscription};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::provider::ProviderSubscription;
use crate::store::BillingStore;
use crate::subscriptions::resolve_due_change;

type HmacSha256 = Hmac<Sha256>;

/// Metadata key set on subscriptions created through Checkout
pub const USER_ID_METADATA_KEY: &str = "user_id";

/// Maximum age of a signed webhook payload, in seconds
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    store: Arc<dyn BillingStore>,
    webhook_secret: String,
}

impl WebhookHandler {
    pub fn new(store: Arc<dyn BillingStore>, webhook_secret: String) -> Self {
        Self {
            store,
            webhook_secret,
        }
    }

    /// Verify the `Stripe-Signature` header and parse the event
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        verify_signature(
            payload,
            signature,
            &self.webhook_secret,
            OffsetDateTime::now_utc().unix_timestamp(),
        )?;

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(
                parse_error = %e,
                "Failed to parse webhook event JSON"
            );
            BillingError::WebhookSignatureInvalid
        })?;

        tracing::debug!(
            event_type = %event.type_,
            event_id = %event.id,
            "Webhook signature verified"
        );

        Ok(event)
    }

    /// Handle a verified Stripe event
    ///
    /// Each event id is processed at most once; redeliveries of an event that
    /// already succeeded are acknowledged without side effects.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();

        self.process_once(&event_id, &event_type, self.dispatch(event))
            .await
            .map(|_| ())
    }

    /// Run `work` under the idempotency claim for `event_id`
    ///
    /// Returns false without running `work` when the event was already handled.
    pub async fn process_once<F>(
        &self,
        event_id: &str,
        event_type: &str,
        work: F,
    ) -> BillingResult<bool>
    where
        F: Future<Output = BillingResult<()>>,
    {
        if !self.store.claim_webhook_event(event_id, event_type).await? {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type,
                "Duplicate webhook event, skipping"
            );
            return Ok(false);
        }

        tracing::info!(
            event_id = %event_id,
            event_type = %event_type,
            "Processing Stripe webhook event"
        );

        let result = work.await;
        let error_message = result.as_ref().err().map(|e| e.to_string());

        if let Err(e) = self
            .store
            .finish_webhook_event(event_id, error_message.as_deref())
            .await
        {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to record webhook processing result"
            );
        }

        result.map(|_| true)
    }

    async fn dispatch(&self, event: Event) -> BillingResult<()> {
        match event.type_ {
            EventType::CustomerSubscriptionCreated | EventType::CustomerSubscriptionUpdated => {
                let subscription = extract_subscription(event)?;
                let metadata_user = user_id_from_metadata(&subscription);
                self.subscription_changed(
                    &ProviderSubscription::from_stripe(&subscription),
                    metadata_user.as_deref(),
                )
                .await
            }
            EventType::CustomerSubscriptionDeleted => {
                let subscription = extract_subscription(event)?;
                let metadata_user = user_id_from_metadata(&subscription);
                self.subscription_deleted(
                    &ProviderSubscription::from_stripe(&subscription),
                    metadata_user.as_deref(),
                )
                .await
            }
            EventType::InvoicePaid => {
                let invoice = extract_invoice(event)?;
                if !matches!(
                    invoice.billing_reason,
                    Some(InvoiceBillingReason::SubscriptionCycle)
                ) {
                    return Ok(());
                }
                let subscription_id = match &invoice.subscription {
                    Some(stripe::Expandable::Id(id)) => id.to_string(),
                    Some(stripe::Expandable::Object(s)) => s.id.to_string(),
                    None => return Ok(()),
                };
                self.billing_cycle_renewed(&subscription_id).await
            }
            _ => {
                tracing::debug!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "Ignoring unhandled Stripe event type"
                );
                Ok(())
            }
        }
    }

    /// Subscription created or updated in Stripe
    ///
    /// A subscription seen for the first time is attached to the user named
    /// in its metadata and granted the subjects listed there.
    pub async fn subscription_changed(
        &self,
        subscription: &ProviderSubscription,
        metadata_user_id: Option<&str>,
    ) -> BillingResult<()> {
        let known = self.store.customer_for_subscription(&subscription.id).await?;
        let user_id = match (&known, metadata_user_id) {
            (Some(customer), _) => customer.user_id.clone(),
            (None, Some(user_id)) => user_id.to_string(),
            (None, None) => {
                return Err(BillingError::Internal(format!(
                    "No user for subscription {}",
                    subscription.id
                )))
            }
        };

        self.store.sync_subscription(&user_id, subscription).await?;

        if known.is_none() {
            self.store
                .replace_entitlements(&user_id, &subscription.subject_ids)
                .await?;
            tracing::info!(
                user_id = %user_id,
                subscription_id = %subscription.id,
                subject_count = subscription.subject_ids.len(),
                "Subscription linked to user"
            );
        }

        resolve_due_change(self.store.as_ref(), &user_id, OffsetDateTime::now_utc()).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            status = %subscription.state,
            cancel_at_period_end = subscription.cancel_at_period_end,
            "Subscription synced from webhook"
        );
        Ok(())
    }

    /// Subscription ended: mark it canceled and drop any pending change
    pub async fn subscription_deleted(
        &self,
        subscription: &ProviderSubscription,
        metadata_user_id: Option<&str>,
    ) -> BillingResult<()> {
        let user_id = match self.store.customer_for_subscription(&subscription.id).await? {
            Some(customer) => customer.user_id,
            None => match metadata_user_id {
                Some(user_id) => user_id.to_string(),
                None => {
                    tracing::warn!(
                        subscription_id = %subscription.id,
                        "Deleted subscription has no known user"
                    );
                    return Ok(());
                }
            },
        };

        self.store.sync_subscription(&user_id, subscription).await?;

        if let Some(pending) = self.store.pending_change(&user_id).await? {
            self.store.cancel_pending_change(pending.id).await?;
            tracing::info!(
                user_id = %user_id,
                change_id = %pending.id,
                "Dropped pending change for deleted subscription"
            );
        }

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            "Subscription deleted"
        );
        Ok(())
    }

    /// Renewal invoice paid: the new period has started
    pub async fn billing_cycle_renewed(&self, subscription_id: &str) -> BillingResult<()> {
        let Some(customer) = self.store.customer_for_subscription(subscription_id).await? else {
            tracing::warn!(
                subscription_id = %subscription_id,
                "Renewal invoice for unknown subscription"
            );
            return Ok(());
        };

        let resolved =
            resolve_due_change(self.store.as_ref(), &customer.user_id, OffsetDateTime::now_utc())
                .await?;

        tracing::info!(
            user_id = %customer.user_id,
            subscription_id = %subscription_id,
            resolved_change = resolved.is_some(),
            "Billing cycle renewed"
        );
        Ok(())
    }
}

/// Check a `Stripe-Signature` header (`t=<unix>,v1=<hex hmac>`) against the
/// payload. The HMAC-SHA256 is computed over `"{t}.{payload}"` with the
/// endpoint secret; any `v1` entry may match.
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    now: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if now.abs_diff(timestamp) > SIGNATURE_TOLERANCE_SECS.unsigned_abs() {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let signed_payload = format!("{}.{}", timestamp, payload);
    for signature in signatures {
        let Ok(expected) = hex::decode(signature) else {
            continue;
        };
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| BillingError::WebhookSignatureInvalid)?;
        mac.update(signed_payload.as_bytes());
        // Constant-time comparison
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }

    tracing::warn!("Webhook signature mismatch");
    Err(BillingError::WebhookSignatureInvalid)
}

fn extract_subscription(event: Event) -> BillingResult<Subscription> {
    match event.data.object {
        EventObject::Subscription(subscription) => Ok(subscription),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected Subscription".to_string(),
        )),
    }
}

fn extract_invoice(event: Event) -> BillingResult<Invoice> {
    match event.data.object {
        EventObject::Invoice(invoice) => Ok(invoice),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected Invoice".to_string(),
        )),
    }
}

fn user_id_from_metadata(subscription: &Subscription) -> Option<String> {
    subscription
        .metadata
        .get(USER_ID_METADATA_KEY)
        .filter(|id| !id.is_empty())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::SubscriptionState;
    use crate::store::PendingChangeStatus;
    use crate::testing::{test_subject, InMemoryProvider, InMemoryStore};
    use std::collections::BTreeSet;
    use uuid::Uuid;

    const SECRET: &str = "whsec_test_secret";

    fn sign(payload: &str, timestamp: i64, secret: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!(
            "t={},v1={}",
            timestamp,
            hex::encode(mac.finalize().into_bytes())
        )
    }

    #[test]
    fn test_valid_signature() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign(payload, 1_700_000_000, SECRET);
        assert!(verify_signature(payload, &header, SECRET, 1_700_000_010).is_ok());
    }

    #[test]
    fn test_signature_with_multiple_v1_entries() {
        let payload = r#"{"id":"evt_1"}"#;
        let valid = sign(payload, 1_700_000_000, SECRET);
        let header = format!("{},v1={}", valid, "00".repeat(32));
        assert!(verify_signature(payload, &header, SECRET, 1_700_000_000).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let header = sign(r#"{"id":"evt_1"}"#, 1_700_000_000, SECRET);
        let result = verify_signature(r#"{"id":"evt_2"}"#, &header, SECRET, 1_700_000_000);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = "{}";
        let header = sign(payload, 1_700_000_000, "whsec_other");
        assert!(verify_signature(payload, &header, SECRET, 1_700_000_000).is_err());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let payload = "{}";
        let header = sign(payload, 1_700_000_000, SECRET);
        assert!(verify_signature(payload, &header, SECRET, 1_700_000_301).is_err());
    }

    #[test]
    fn test_malformed_header_rejected() {
        assert!(verify_signature("{}", "", SECRET, 0).is_err());
        assert!(verify_signature("{}", "t=abc,v1=zz", SECRET, 0).is_err());
        assert!(verify_signature("{}", "t=0", SECRET, 0).is_err());
        assert!(verify_signature("{}", "t=-9223372036854775808,v1=00", SECRET, 1_700_000_000).is_err());
        assert!(verify_signature("{}", "t=9223372036854775807,v1=00", SECRET, -1).is_err());
    }

    fn handler_with_store() -> (WebhookHandler, Arc<InMemoryStore>, InMemoryProvider) {
        let store = Arc::new(InMemoryStore::with_subjects(vec![
            test_subject("Italiano", 0),
            test_subject("Matematica", 1),
        ]));
        (
            WebhookHandler::new(store.clone(), SECRET.to_string()),
            store,
            InMemoryProvider::default(),
        )
    }

    #[tokio::test]
    async fn test_new_subscription_grants_metadata_subjects() {
        let (handler, store, provider) = handler_with_store();
        let subjects = store.list_subjects().await.unwrap();
        let ids: BTreeSet<Uuid> = subjects.iter().map(|s| s.id).collect();
        let subscription = provider.create_subscription(&ids, 30);

        handler
            .subscription_changed(&subscription, Some("user_new"))
            .await
            .unwrap();

        let customer = store.customer("user_new").await.unwrap().unwrap();
        assert_eq!(customer.stripe_subscription_id, Some(subscription.id));
        assert_eq!(store.entitled_subject_ids("user_new").await.unwrap(), ids);
    }

    #[tokio::test]
    async fn test_subscription_without_user_is_an_error() {
        let (handler, _, provider) = handler_with_store();
        let subscription = provider.create_subscription(&BTreeSet::new(), 30);

        let result = handler.subscription_changed(&subscription, None).await;
        assert!(matches!(result, Err(BillingError::Internal(_))));
    }

    #[tokio::test]
    async fn test_update_syncs_status() {
        let (handler, store, provider) = handler_with_store();
        let subscription = provider.create_subscription(&BTreeSet::new(), 30);
        store.add_customer("user_1", &subscription);

        let mut updated = subscription.clone();
        updated.state = SubscriptionState::PastDue;
        handler.subscription_changed(&updated, None).await.unwrap();

        let customer = store.customer("user_1").await.unwrap().unwrap();
        assert_eq!(customer.status.as_deref(), Some("past_due"));
    }

    #[tokio::test]
    async fn test_duplicate_event_processed_once() {
        let (handler, store, provider) = handler_with_store();
        let subscription = provider.create_subscription(&BTreeSet::new(), 30);

        let first = handler
            .process_once(
                "evt_1",
                "customer.subscription.created",
                handler.subscription_changed(&subscription, Some("user_1")),
            )
            .await
            .unwrap();
        assert!(first);

        let mut other = subscription.clone();
        other.cancel_at_period_end = true;
        let second = handler
            .process_once(
                "evt_1",
                "customer.subscription.created",
                handler.subscription_changed(&other, Some("user_1")),
            )
            .await
            .unwrap();
        assert!(!second);

        let customer = store.customer("user_1").await.unwrap().unwrap();
        assert!(!customer.cancel_at_period_end);
        assert_eq!(store.webhook_event_result("evt_1"), Some(None));
    }

    #[tokio::test]
    async fn test_failed_event_can_be_retried() {
        let (handler, store, provider) = handler_with_store();
        let subscription = provider.create_subscription(&BTreeSet::new(), 30);

        let result = handler
            .process_once(
                "evt_2",
                "customer.subscription.updated",
                handler.subscription_changed(&subscription, None),
            )
            .await;
        assert!(result.is_err());
        assert!(matches!(store.webhook_event_result("evt_2"), Some(Some(_))));

        let retried = handler
            .process_once(
                "evt_2",
                "customer.subscription.updated",
                handler.subscription_changed(&subscription, Some("user_2")),
            )
            .await
            .unwrap();
        assert!(retried);
    }

    #[tokio::test]
    async fn test_in_flight_event_is_not_claimed_twice() {
        let (handler, store, provider) = handler_with_store();
        let subscription = provider.create_subscription(&BTreeSet::new(), 30);

        // Claimed by a handler that has not finished yet
        assert!(store
            .claim_webhook_event("evt_3", "customer.subscription.updated")
            .await
            .unwrap());

        let second = handler
            .process_once(
                "evt_3",
                "customer.subscription.updated",
                handler.subscription_changed(&subscription, Some("user_3")),
            )
            .await
            .unwrap();
        assert!(!second);
        assert!(store.customer("user_3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_abandoned_claim_is_recovered() {
        let (handler, store, provider) = handler_with_store();
        let subscription = provider.create_subscription(&BTreeSet::new(), 30);

        // Handler died after claiming; the row never left `processing`
        assert!(store
            .claim_webhook_event("evt_4", "customer.subscription.updated")
            .await
            .unwrap());
        store.age_webhook_claim(
            "evt_4",
            crate::store::WEBHOOK_PROCESSING_TIMEOUT + time::Duration::minutes(1),
        );

        let redelivered = handler
            .process_once(
                "evt_4",
                "customer.subscription.updated",
                handler.subscription_changed(&subscription, Some("user_4")),
            )
            .await
            .unwrap();
        assert!(redelivered);
        assert!(store.customer("user_4").await.unwrap().is_some());
        assert_eq!(store.webhook_event_result("evt_4"), Some(None));
    }

    #[tokio::test]
    async fn test_deleted_subscription_drops_pending_change() {
        let (handler, store, provider) = handler_with_store();
        let subjects = store.list_subjects().await.unwrap();
        let ids: BTreeSet<Uuid> = subjects.iter().map(|s| s.id).collect();
        let subscription = provider.create_subscription(&ids, 5);
        store.add_customer("user_1", &subscription);

        let now = OffsetDateTime::now_utc();
        let pending = crate::store::PendingSubscriptionChange {
            id: Uuid::new_v4(),
            user_id: "user_1".to_string(),
            stripe_subscription_id: subscription.id.clone(),
            change_type: crate::plan_change::ChangeType::Downgrade,
            previous_subject_ids: ids.iter().copied().collect(),
            target_subject_ids: vec![subjects[0].id],
            previous_price_cents: 748,
            new_price_cents: 499,
            effective_at: subscription.current_period_end,
            status: PendingChangeStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        store.insert_pending_change(&pending).await.unwrap();

        let mut deleted = subscription.clone();
        deleted.state = SubscriptionState::Canceled;
        handler.subscription_deleted(&deleted, None).await.unwrap();

        assert!(store.pending_change("user_1").await.unwrap().is_none());
        let customer = store.customer("user_1").await.unwrap().unwrap();
        assert_eq!(customer.status.as_deref(), Some("canceled"));
    }

    #[tokio::test]
    async fn test_renewal_resolves_due_change() {
        let (handler, store, provider) = handler_with_store();
        let subjects = store.list_subjects().await.unwrap();
        let ids: BTreeSet<Uuid> = subjects.iter().map(|s| s.id).collect();
        let subscription = provider.create_subscription(&ids, 5);
        store.add_customer("user_1", &subscription);

        let now = OffsetDateTime::now_utc();
        let pending = crate::store::PendingSubscriptionChange {
            id: Uuid::new_v4(),
            user_id: "user_1".to_string(),
            stripe_subscription_id: subscription.id.clone(),
            change_type: crate::plan_change::ChangeType::Downgrade,
            previous_subject_ids: ids.iter().copied().collect(),
            target_subject_ids: vec![subjects[1].id],
            previous_price_cents: 748,
            new_price_cents: 499,
            effective_at: now - time::Duration::seconds(5),
            status: PendingChangeStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        store.insert_pending_change(&pending).await.unwrap();

        handler.billing_cycle_renewed(&subscription.id).await.unwrap();

        assert_eq!(
            store.entitled_subject_ids("user_1").await.unwrap(),
            BTreeSet::from([subjects[1].id])
        );
        assert!(store.pending_change("user_1").await.unwrap().is_none());
    }
}
