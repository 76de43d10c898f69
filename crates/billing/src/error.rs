//! Billing error types

use thiserror::Error;

use crate::plan_change::PlanChangeError;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No subscription found for user {0}")]
    SubscriptionNotFound(String),

    #[error("Subscription is not active (status: {0})")]
    SubscriptionInactive(String),

    #[error("Subscription is scheduled for cancellation")]
    CancellationScheduled,

    #[error("Subscription is not scheduled for cancellation")]
    NotScheduledForCancellation,

    #[error("Invalid plan change: {0}")]
    InvalidPlanChange(#[from] PlanChangeError),

    #[error("A subscription change is already pending")]
    PendingChangeExists,

    #[error("No pending subscription change")]
    NoPendingChange,

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Unsupported webhook event: {0}")]
    WebhookEventNotSupported(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}
