//! Stripe client configuration

use stripe::Client;

/// Stripe price ids for the per-subject subscription
#[derive(Debug, Clone)]
pub struct PriceIds {
    /// Flat price charged for the first subject (quantity is always 1)
    pub first_subject: String,
    /// Per-unit price for every subject after the first
    pub additional_subject: String,
}

impl PriceIds {
    pub fn is_known(&self, price_id: &str) -> bool {
        price_id == self.first_subject || price_id == self.additional_subject
    }
}

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub price_ids: PriceIds,
    /// Base URL for endpoints called without the typed client
    pub api_base: String,
}

impl StripeConfig {
    pub fn from_env() -> Result<Self, String> {
        let required = |name: &str| -> Result<String, String> {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| format!("{} must be set", name))
        };

        Ok(Self {
            secret_key: required("STRIPE_SECRET_KEY")?,
            webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
            price_ids: PriceIds {
                first_subject: required("STRIPE_PRICE_FIRST_SUBJECT")?,
                additional_subject: required("STRIPE_PRICE_ADDITIONAL_SUBJECT")?,
            },
            api_base: std::env::var("STRIPE_API_BASE")
                .unwrap_or_else(|_| "https://api.stripe.com".to_string()),
        })
    }
}

/// Thin wrapper around the async-stripe client plus its config
#[derive(Clone)]
pub struct StripeClient {
    inner: Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = Client::new(config.secret_key.clone());
        Self { inner, config }
    }

    pub fn from_env() -> Result<Self, crate::BillingError> {
        let config = StripeConfig::from_env().map_err(crate::BillingError::Config)?;
        Ok(Self::new(config))
    }

    pub fn inner(&self) -> &Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
