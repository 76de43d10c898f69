//! Subscription management
//!
//! Reads the user's subscription state and applies subject changes:
//! immediate upgrades with a prorated charge, deferred downgrades recorded
//! as pending changes, undo of pending changes, and cancel/reactivate.
//!
//! The database holds entitlements and pending changes; Stripe holds what
//! gets billed. A deferred change updates Stripe right away with no
//! proration (so the next renewal bills the new amount) and leaves the
//! entitlements alone until the period rolls over.

use std::collections::BTreeSet;
use std::sync::Arc;

use maturamate_shared::SubjectCatalog;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::plan_change::{restore_subjects, ChangeTiming, ChangeType, PlanChange, PlanChangeError};
use crate::pricing::{format_eur, monthly_price_cents};
use crate::provider::{BillingProvider, ProrationMode, ProviderSubscription, SubscriptionState};
use crate::store::{BillingCustomer, BillingStore, PendingChangeStatus, PendingSubscriptionChange};

/// Normalized view of a user's subscription
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStatus {
    pub has_subscription: bool,
    pub state: Option<SubscriptionState>,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub subject_count: usize,
    pub subject_ids: Vec<Uuid>,
    /// Monthly price for the current subject set, in cents
    pub price_cents: i64,
    pub pending_change: Option<PendingSubscriptionChange>,
}

impl SubscriptionStatus {
    fn none() -> Self {
        Self {
            has_subscription: false,
            state: None,
            cancel_at_period_end: false,
            current_period_end: None,
            subject_count: 0,
            subject_ids: Vec::new(),
            price_cents: 0,
            pending_change: None,
        }
    }
}

/// Preview of a subject change, computed without side effects
#[derive(Debug, Clone, Serialize)]
pub struct PlanChangePreview {
    pub change_type: ChangeType,
    pub current_subject_ids: Vec<Uuid>,
    pub target_subject_ids: Vec<Uuid>,
    pub added_subject_ids: Vec<Uuid>,
    pub removed_subject_ids: Vec<Uuid>,
    pub current_price_cents: i64,
    pub new_price_cents: i64,
    pub price_delta_cents: i64,
    /// Prorated amount Stripe would invoice now (0 for downgrades)
    pub proration_amount_cents: i64,
    /// Whether the change is charged and applied immediately
    pub immediate: bool,
    pub days_remaining: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub effective_date: OffsetDateTime,
    pub description: String,
}

/// Outcome of applying a subject change
#[derive(Debug, Clone, Serialize)]
pub struct PlanChangeResult {
    pub change_type: ChangeType,
    /// True when entitlements already reflect the new set
    pub applied_immediately: bool,
    /// Subjects the user has access to right now
    pub subject_ids: Vec<Uuid>,
    /// Price billed from the next renewal
    pub new_price_cents: i64,
    pub pending_change: Option<PendingSubscriptionChange>,
    pub message: String,
}

/// Outcome of undoing all or part of a pending change
#[derive(Debug, Clone, Serialize)]
pub struct PendingChangeModification {
    /// True when the whole pending change was withdrawn
    pub cancelled: bool,
    /// The narrowed pending change, when some removals remain
    pub pending_change: Option<PendingSubscriptionChange>,
    pub subject_ids: Vec<Uuid>,
    /// Price billed from the next renewal
    pub next_price_cents: i64,
    pub message: String,
}

/// Result of cancel/reactivate
#[derive(Debug, Clone, Serialize)]
pub struct CancellationResult {
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_end: OffsetDateTime,
    pub message: String,
}

/// Subscription service for subject-based subscriptions
#[derive(Clone)]
pub struct SubscriptionService {
    provider: Arc<dyn BillingProvider>,
    store: Arc<dyn BillingStore>,
}

impl SubscriptionService {
    pub fn new(provider: Arc<dyn BillingProvider>, store: Arc<dyn BillingStore>) -> Self {
        Self { provider, store }
    }

    // =========================================================================
    // State reader
    // =========================================================================

    /// Current subscription state, synced from Stripe
    ///
    /// Resolves a pending change whose effective date has passed before
    /// reporting, so the status never shows a stale subject set.
    pub async fn get_status(&self, user_id: &str) -> BillingResult<SubscriptionStatus> {
        let Some(subscription_id) = self
            .store
            .customer(user_id)
            .await?
            .and_then(|c| c.stripe_subscription_id)
        else {
            return Ok(SubscriptionStatus::none());
        };

        let subscription = self.provider.retrieve_subscription(&subscription_id).await?;
        self.store.sync_subscription(user_id, &subscription).await?;
        resolve_due_change(self.store.as_ref(), user_id, OffsetDateTime::now_utc()).await?;

        let subject_ids = self.store.entitled_subject_ids(user_id).await?;
        let pending_change = self.store.pending_change(user_id).await?;

        Ok(SubscriptionStatus {
            has_subscription: true,
            state: Some(subscription.state),
            cancel_at_period_end: subscription.cancel_at_period_end,
            current_period_end: Some(subscription.current_period_end),
            subject_count: subject_ids.len(),
            price_cents: monthly_price_cents(subject_ids.len()),
            subject_ids: subject_ids.into_iter().collect(),
            pending_change,
        })
    }

    pub async fn list_pending_changes(
        &self,
        user_id: &str,
    ) -> BillingResult<Vec<PendingSubscriptionChange>> {
        resolve_due_change(self.store.as_ref(), user_id, OffsetDateTime::now_utc()).await?;
        self.store.list_pending_changes(user_id).await
    }

    // =========================================================================
    // Plan change preview / executor
    // =========================================================================

    /// Preview a change to `target_subject_ids`. Read-only.
    pub async fn preview_plan_change(
        &self,
        user_id: &str,
        target_subject_ids: &[Uuid],
    ) -> BillingResult<PlanChangePreview> {
        let ctx = self.changeable_context(user_id).await?;
        let change = self.validate_change(&ctx.current, target_subject_ids).await?;
        let now = OffsetDateTime::now_utc();

        let immediate = change.applies_immediately(ChangeTiming::Immediate);
        let proration_amount_cents = if immediate {
            self.provider
                .preview_subject_change(&ctx.subscription, change.target.len())
                .await?
        } else {
            0
        };

        let days_remaining = ctx.subscription.days_remaining(now);
        let effective_date = if immediate {
            now
        } else {
            ctx.subscription.current_period_end
        };

        let description = match change.change_type {
            ChangeType::Upgrade => format!(
                "Adding {} subject(s): {} charged now for the remaining {} day(s), then {} per month",
                change.added.len(),
                format_eur(proration_amount_cents),
                days_remaining,
                format_eur(change.new_price_cents()),
            ),
            ChangeType::Downgrade => format!(
                "Removing {} subject(s) from the next billing period: {} per month, access kept for the remaining {} day(s)",
                change.removed.len(),
                format_eur(change.new_price_cents()),
                days_remaining,
            ),
        };

        tracing::info!(
            user_id = %user_id,
            subscription_id = %ctx.subscription.id,
            change_type = %change.change_type,
            current_price_cents = change.current_price_cents(),
            new_price_cents = change.new_price_cents(),
            proration_amount_cents = proration_amount_cents,
            "Previewed plan change"
        );

        Ok(PlanChangePreview {
            change_type: change.change_type,
            current_subject_ids: change.current.iter().copied().collect(),
            target_subject_ids: change.target.iter().copied().collect(),
            added_subject_ids: change.added.clone(),
            removed_subject_ids: change.removed.clone(),
            current_price_cents: change.current_price_cents(),
            new_price_cents: change.new_price_cents(),
            price_delta_cents: change.price_delta_cents(),
            proration_amount_cents,
            immediate,
            days_remaining,
            effective_date,
            description,
        })
    }

    /// Apply a change to `target_subject_ids`
    ///
    /// Immediate upgrades are invoiced with proration and granted now.
    /// Everything else is recorded as a pending change effective at the end
    /// of the current period. On failure nothing is left half-applied.
    pub async fn execute_plan_change(
        &self,
        user_id: &str,
        target_subject_ids: &[Uuid],
        timing: ChangeTiming,
    ) -> BillingResult<PlanChangeResult> {
        let ctx = self.changeable_context(user_id).await?;
        let change = self.validate_change(&ctx.current, target_subject_ids).await?;

        if change.applies_immediately(timing) {
            return self.apply_upgrade_now(user_id, &ctx, &change).await;
        }

        let now = OffsetDateTime::now_utc();
        let pending = PendingSubscriptionChange {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            stripe_subscription_id: ctx.subscription.id.clone(),
            change_type: change.change_type,
            previous_subject_ids: change.current.iter().copied().collect(),
            target_subject_ids: change.target.iter().copied().collect(),
            previous_price_cents: change.current_price_cents(),
            new_price_cents: change.new_price_cents(),
            effective_at: ctx.subscription.current_period_end,
            status: PendingChangeStatus::Pending,
            created_at: now,
            updated_at: now,
        };

        // Insert first: the one-open-change constraint rejects a double submit
        // before Stripe is touched
        self.store.insert_pending_change(&pending).await?;

        let updated = match self
            .provider
            .update_subjects(&ctx.subscription, &change.target, ProrationMode::None)
            .await
        {
            Ok(updated) => updated,
            Err(e) => {
                tracing::error!(
                    user_id = %user_id,
                    subscription_id = %ctx.subscription.id,
                    error = %e,
                    "Stripe update failed, withdrawing pending change"
                );
                if let Err(cancel_err) = self.store.cancel_pending_change(pending.id).await {
                    tracing::error!(
                        user_id = %user_id,
                        change_id = %pending.id,
                        error = %cancel_err,
                        "Failed to withdraw pending change after Stripe failure"
                    );
                }
                return Err(e);
            }
        };
        self.store.sync_subscription(user_id, &updated).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %updated.id,
            change_id = %pending.id,
            change_type = %pending.change_type,
            effective_at = %pending.effective_at,
            new_price_cents = pending.new_price_cents,
            "Scheduled subscription change for period end"
        );

        let message = match change.change_type {
            ChangeType::Downgrade => format!(
                "{} subject(s) will be removed at the end of the current period",
                change.removed.len()
            ),
            ChangeType::Upgrade => format!(
                "{} subject(s) will be added at the start of the next period",
                change.added.len()
            ),
        };

        Ok(PlanChangeResult {
            change_type: change.change_type,
            applied_immediately: false,
            subject_ids: change.current.iter().copied().collect(),
            new_price_cents: pending.new_price_cents,
            pending_change: Some(pending),
            message,
        })
    }

    async fn apply_upgrade_now(
        &self,
        user_id: &str,
        ctx: &ChangeContext,
        change: &PlanChange,
    ) -> BillingResult<PlanChangeResult> {
        let updated = self
            .provider
            .update_subjects(&ctx.subscription, &change.target, ProrationMode::AlwaysInvoice)
            .await?;

        if let Err(e) = self.store.replace_entitlements(user_id, &change.target).await {
            tracing::error!(
                user_id = %user_id,
                subscription_id = %updated.id,
                error = %e,
                "Stripe subscription upgraded but entitlements were not saved"
            );
            return Err(e);
        }
        self.store.sync_subscription(user_id, &updated).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %updated.id,
            added = change.added.len(),
            new_price_cents = change.new_price_cents(),
            "Upgraded subscription immediately"
        );

        Ok(PlanChangeResult {
            change_type: ChangeType::Upgrade,
            applied_immediately: true,
            subject_ids: change.target.iter().copied().collect(),
            new_price_cents: change.new_price_cents(),
            pending_change: None,
            message: format!("{} subject(s) added", change.added.len()),
        })
    }

    // =========================================================================
    // Pending change undo
    // =========================================================================

    /// Undo a pending change
    ///
    /// With no ids the whole change is withdrawn. With ids, each one must be
    /// a subject the pending downgrade removes; it is kept instead. Restoring
    /// every removal is the same as withdrawing the change.
    pub async fn modify_pending_change(
        &self,
        user_id: &str,
        restore_subject_ids: &[Uuid],
    ) -> BillingResult<PendingChangeModification> {
        // A change past its effective date is applied, not undone
        resolve_due_change(self.store.as_ref(), user_id, OffsetDateTime::now_utc()).await?;
        let pending = self
            .store
            .pending_change(user_id)
            .await?
            .ok_or(BillingError::NoPendingChange)?;

        let subscription = self
            .provider
            .retrieve_subscription(&pending.stripe_subscription_id)
            .await?;

        let previous = pending.previous_set();
        let new_target = if restore_subject_ids.is_empty() {
            previous.clone()
        } else {
            if pending.change_type != ChangeType::Downgrade {
                return Err(PlanChangeError::RestoreOnUpgrade.into());
            }
            restore_subjects(&previous, &pending.target_set(), restore_subject_ids)?
        };

        if new_target == previous {
            return self.withdraw_pending_change(user_id, &pending, &subscription).await;
        }

        let updated = self
            .provider
            .update_subjects(&subscription, &new_target, ProrationMode::None)
            .await?;
        let next_price_cents = monthly_price_cents(new_target.len());
        if let Err(e) = self
            .store
            .update_pending_target(pending.id, &new_target, next_price_cents)
            .await
        {
            return Err(self.revert_to_pending_target(&updated, &pending, e).await);
        }
        self.store.sync_subscription(user_id, &updated).await?;

        tracing::info!(
            user_id = %user_id,
            change_id = %pending.id,
            restored = restore_subject_ids.len(),
            next_price_cents = next_price_cents,
            "Restored subjects on pending downgrade"
        );

        let pending_change = self.store.pending_change(user_id).await?;
        let subject_ids = self.store.entitled_subject_ids(user_id).await?;

        Ok(PendingChangeModification {
            cancelled: false,
            pending_change,
            subject_ids: subject_ids.into_iter().collect(),
            next_price_cents,
            message: format!(
                "{} subject(s) restored, {} per month from the next period",
                restore_subject_ids.len(),
                format_eur(next_price_cents)
            ),
        })
    }

    async fn withdraw_pending_change(
        &self,
        user_id: &str,
        pending: &PendingSubscriptionChange,
        subscription: &ProviderSubscription,
    ) -> BillingResult<PendingChangeModification> {
        let previous = pending.previous_set();

        // The current period was paid at the previous price, so nothing is prorated
        let updated = self
            .provider
            .update_subjects(subscription, &previous, ProrationMode::None)
            .await?;

        if let Err(e) = self.withdraw_record(pending).await {
            return Err(self.revert_to_pending_target(&updated, pending, e).await);
        }
        self.store.sync_subscription(user_id, &updated).await?;

        tracing::info!(
            user_id = %user_id,
            change_id = %pending.id,
            change_type = %pending.change_type,
            "Cancelled pending subscription change"
        );

        let subject_ids = self.store.entitled_subject_ids(user_id).await?;
        Ok(PendingChangeModification {
            cancelled: true,
            pending_change: None,
            subject_ids: subject_ids.into_iter().collect(),
            next_price_cents: pending.previous_price_cents,
            message: "Scheduled change cancelled".to_string(),
        })
    }

    // =========================================================================
    // Cancel / reactivate
    // =========================================================================

    /// Cancel at the end of the current period; withdraws any pending change
    pub async fn cancel_subscription(&self, user_id: &str) -> BillingResult<CancellationResult> {
        let (_, subscription) = self.current_subscription(user_id).await?;

        if subscription.state == SubscriptionState::Canceled {
            return Err(BillingError::SubscriptionInactive(
                subscription.state.to_string(),
            ));
        }
        if subscription.cancel_at_period_end {
            return Err(BillingError::CancellationScheduled);
        }

        resolve_due_change(self.store.as_ref(), user_id, OffsetDateTime::now_utc()).await?;

        let mut subscription = subscription;
        if let Some(pending) = self.store.pending_change(user_id).await? {
            // Put Stripe back on the previous set so a later reactivation bills correctly
            let reverted = self
                .provider
                .update_subjects(&subscription, &pending.previous_set(), ProrationMode::None)
                .await?;
            if let Err(e) = self.withdraw_record(&pending).await {
                return Err(self.revert_to_pending_target(&reverted, &pending, e).await);
            }
            subscription = reverted;
            tracing::info!(
                user_id = %user_id,
                change_id = %pending.id,
                "Withdrew pending change on cancellation"
            );
        }

        let updated = self
            .provider
            .set_cancel_at_period_end(&subscription.id, true)
            .await?;
        self.store.sync_subscription(user_id, &updated).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %updated.id,
            period_end = %updated.current_period_end,
            "Cancelled subscription at period end"
        );

        Ok(CancellationResult {
            cancel_at_period_end: true,
            current_period_end: updated.current_period_end,
            message: "Subscription will end at the end of the current period".to_string(),
        })
    }

    /// Undo a scheduled cancellation
    pub async fn reactivate_subscription(
        &self,
        user_id: &str,
    ) -> BillingResult<CancellationResult> {
        let (_, subscription) = self.current_subscription(user_id).await?;

        if subscription.state == SubscriptionState::Canceled {
            return Err(BillingError::SubscriptionInactive(
                subscription.state.to_string(),
            ));
        }
        if !subscription.cancel_at_period_end {
            return Err(BillingError::NotScheduledForCancellation);
        }

        let updated = self
            .provider
            .set_cancel_at_period_end(&subscription.id, false)
            .await?;
        self.store.sync_subscription(user_id, &updated).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %updated.id,
            "Reactivated subscription"
        );

        Ok(CancellationResult {
            cancel_at_period_end: false,
            current_period_end: updated.current_period_end,
            message: "Subscription reactivated".to_string(),
        })
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn current_subscription(
        &self,
        user_id: &str,
    ) -> BillingResult<(BillingCustomer, ProviderSubscription)> {
        let customer = self
            .store
            .customer(user_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(user_id.to_string()))?;
        let subscription_id = customer
            .stripe_subscription_id
            .clone()
            .ok_or_else(|| BillingError::SubscriptionNotFound(user_id.to_string()))?;

        let subscription = self.provider.retrieve_subscription(&subscription_id).await?;
        self.store.sync_subscription(user_id, &subscription).await?;
        Ok((customer, subscription))
    }

    /// Mark a pending change cancelled; fails if it is no longer pending
    async fn withdraw_record(&self, pending: &PendingSubscriptionChange) -> BillingResult<()> {
        if self.store.cancel_pending_change(pending.id).await? {
            Ok(())
        } else {
            Err(BillingError::NoPendingChange)
        }
    }

    /// Put Stripe back on the pending change's target after the store
    /// rejected a transition, so billing matches the recorded change.
    /// Returns the original store error.
    async fn revert_to_pending_target(
        &self,
        subscription: &ProviderSubscription,
        pending: &PendingSubscriptionChange,
        err: BillingError,
    ) -> BillingError {
        tracing::warn!(
            subscription_id = %subscription.id,
            change_id = %pending.id,
            error = %err,
            "Store update failed after provider update, reverting provider"
        );
        if let Err(revert_err) = self
            .provider
            .update_subjects(subscription, &pending.target_set(), ProrationMode::None)
            .await
        {
            tracing::error!(
                subscription_id = %subscription.id,
                change_id = %pending.id,
                error = %revert_err,
                "Failed to revert provider subjects; billing differs from pending change"
            );
        }
        err
    }

    /// Load everything a plan change needs and check its preconditions:
    /// active subscription, no scheduled cancellation, no pending change
    async fn changeable_context(&self, user_id: &str) -> BillingResult<ChangeContext> {
        let (_, subscription) = self.current_subscription(user_id).await?;

        if subscription.state != SubscriptionState::Active {
            return Err(BillingError::SubscriptionInactive(
                subscription.state.to_string(),
            ));
        }
        if subscription.cancel_at_period_end {
            return Err(BillingError::CancellationScheduled);
        }

        resolve_due_change(self.store.as_ref(), user_id, OffsetDateTime::now_utc()).await?;
        if self.store.pending_change(user_id).await?.is_some() {
            return Err(BillingError::PendingChangeExists);
        }

        let current = self.store.entitled_subject_ids(user_id).await?;
        Ok(ChangeContext {
            subscription,
            current,
        })
    }

    async fn validate_change(
        &self,
        current: &BTreeSet<Uuid>,
        target_subject_ids: &[Uuid],
    ) -> BillingResult<PlanChange> {
        let catalog = SubjectCatalog::new(self.store.list_subjects().await?);
        let unknown = catalog.unknown_ids(target_subject_ids);
        if !unknown.is_empty() {
            return Err(PlanChangeError::UnknownSubjects(unknown).into());
        }
        Ok(PlanChange::classify(current, target_subject_ids)?)
    }
}

struct ChangeContext {
    subscription: ProviderSubscription,
    current: BTreeSet<Uuid>,
}

/// Apply the user's pending change if its effective date has passed
pub(crate) async fn resolve_due_change(
    store: &dyn BillingStore,
    user_id: &str,
    now: OffsetDateTime,
) -> BillingResult<Option<PendingSubscriptionChange>> {
    let Some(pending) = store.pending_change(user_id).await? else {
        return Ok(None);
    };
    if !pending.is_due(now) {
        return Ok(None);
    }

    if !store.resolve_pending_change(&pending).await? {
        tracing::debug!(
            user_id = %user_id,
            change_id = %pending.id,
            "Pending change already resolved or cancelled"
        );
        return Ok(None);
    }

    tracing::info!(
        user_id = %user_id,
        change_id = %pending.id,
        change_type = %pending.change_type,
        subject_count = pending.target_subject_ids.len(),
        "Resolved pending subscription change"
    );
    Ok(Some(pending))
}
