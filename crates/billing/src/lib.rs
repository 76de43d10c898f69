// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries provider messages
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! MaturaMate Billing Module
//!
//! Stripe-backed subject subscriptions: the user pays for a set of subjects
//! and can add or remove subjects during the billing period.
//!
//! ## Features
//!
//! - **Pricing**: €4.99 for the first subject, €2.49 for each additional one
//! - **Upgrades**: Added subjects are charged prorated and unlocked immediately
//! - **Downgrades**: Removed subjects stay available until the period ends
//! - **Pending Changes**: Scheduled changes can be undone fully or per subject
//! - **Cancellation**: Cancel at period end and reactivate
//! - **Webhooks**: Handle Stripe events, resolve changes at renewal

pub mod client;
pub mod entitlement;
pub mod error;
pub mod plan_change;
pub mod pricing;
pub mod provider;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;


use std::sync::Arc;

// Client
pub use client::{PriceIds, StripeClient, StripeConfig};

// Entitlement
pub use entitlement::{EntitlementService, UserSubjectAccess};

// Error
pub use error::{BillingError, BillingResult};

// Plan changes
pub use plan_change::{ChangeTiming, ChangeType, PlanChange, PlanChangeError};

// Pricing
pub use pricing::{
    format_eur, monthly_price_cents, ADDITIONAL_SUBJECT_PRICE_CENTS, FIRST_SUBJECT_PRICE_CENTS,
};

// Provider
pub use provider::{BillingProvider, ProviderSubscription, StripeProvider, SubscriptionState};

// Store
pub use store::{
    BillingCustomer, BillingStore, PendingChangeStatus, PendingSubscriptionChange, PgBillingStore,
};

// Subscriptions
pub use subscriptions::{
    CancellationResult, PendingChangeModification, PlanChangePreview, PlanChangeResult,
    SubscriptionService, SubscriptionStatus,
};

// Webhooks
pub use webhooks::{verify_signature, WebhookHandler};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub subscriptions: SubscriptionService,
    pub entitlements: EntitlementService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        Ok(Self::with_client(stripe, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        Self::with_client(StripeClient::new(config), pool)
    }

    fn with_client(stripe: StripeClient, pool: PgPool) -> Self {
        let webhook_secret = stripe.config().webhook_secret.clone();
        let provider: Arc<dyn BillingProvider> = Arc::new(StripeProvider::new(stripe));
        let store: Arc<dyn BillingStore> = Arc::new(PgBillingStore::new(pool));
        Self::with_backends(provider, store, webhook_secret)
    }

    /// Assemble the service from any provider/store pair
    pub fn with_backends(
        provider: Arc<dyn BillingProvider>,
        store: Arc<dyn BillingStore>,
        webhook_secret: String,
    ) -> Self {
        Self {
            subscriptions: SubscriptionService::new(provider, store.clone()),
            entitlements: EntitlementService::new(store.clone()),
            webhooks: WebhookHandler::new(store, webhook_secret),
        }
    }
}
