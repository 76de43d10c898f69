//! Local persistence for subscriptions, entitlements and pending changes
//!
//! [`BillingStore`] is the seam between the subscription flow and Postgres.
//! [`PgBillingStore`] is the sqlx implementation used in production.

use std::collections::BTreeSet;

use async_trait::async_trait;
use maturamate_shared::Subject;
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::plan_change::ChangeType;
use crate::provider::ProviderSubscription;

/// Postgres unique_violation
const UNIQUE_VIOLATION: &str = "23505";

/// A webhook claim still `processing` after this long is treated as abandoned
pub const WEBHOOK_PROCESSING_TIMEOUT: time::Duration = time::Duration::minutes(30);

/// Local record linking a user to their Stripe customer and subscription
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct BillingCustomer {
    pub user_id: String,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    /// Last synced normalized state (see `SubscriptionState::as_str`)
    pub status: Option<String>,
    pub cancel_at_period_end: bool,
    pub current_period_end: Option<OffsetDateTime>,
}

/// Lifecycle of a pending change: pending -> resolved | cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingChangeStatus {
    Pending,
    Resolved,
    Cancelled,
}

impl PendingChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingChangeStatus::Pending => "pending",
            PendingChangeStatus::Resolved => "resolved",
            PendingChangeStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PendingChangeStatus::Pending),
            "resolved" => Some(PendingChangeStatus::Resolved),
            "cancelled" => Some(PendingChangeStatus::Cancelled),
            _ => None,
        }
    }
}

/// A change scheduled for the next billing period
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingSubscriptionChange {
    pub id: Uuid,
    pub user_id: String,
    pub stripe_subscription_id: String,
    pub change_type: ChangeType,
    /// Subject set at the time the change was scheduled
    pub previous_subject_ids: Vec<Uuid>,
    /// Subject set that applies from `effective_at`
    pub target_subject_ids: Vec<Uuid>,
    pub previous_price_cents: i64,
    pub new_price_cents: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub effective_at: OffsetDateTime,
    pub status: PendingChangeStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl PendingSubscriptionChange {
    pub fn previous_set(&self) -> BTreeSet<Uuid> {
        self.previous_subject_ids.iter().copied().collect()
    }

    pub fn target_set(&self) -> BTreeSet<Uuid> {
        self.target_subject_ids.iter().copied().collect()
    }

    /// Subjects the change removes (empty for upgrades)
    pub fn removed_subject_ids(&self) -> Vec<Uuid> {
        self.previous_set()
            .difference(&self.target_set())
            .copied()
            .collect()
    }

    /// Subjects the change adds (empty for downgrades)
    pub fn added_subject_ids(&self) -> Vec<Uuid> {
        self.target_set()
            .difference(&self.previous_set())
            .copied()
            .collect()
    }

    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        self.status == PendingChangeStatus::Pending && self.effective_at <= now
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PendingChangeRow {
    id: Uuid,
    user_id: String,
    stripe_subscription_id: String,
    change_type: String,
    previous_subject_ids: Vec<Uuid>,
    target_subject_ids: Vec<Uuid>,
    previous_price_cents: i64,
    new_price_cents: i64,
    effective_at: OffsetDateTime,
    status: String,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<PendingChangeRow> for PendingSubscriptionChange {
    type Error = BillingError;

    fn try_from(row: PendingChangeRow) -> Result<Self, Self::Error> {
        let change_type = ChangeType::parse(&row.change_type).ok_or_else(|| {
            BillingError::Database(format!("Unknown change_type '{}'", row.change_type))
        })?;
        let status = PendingChangeStatus::parse(&row.status)
            .ok_or_else(|| BillingError::Database(format!("Unknown status '{}'", row.status)))?;

        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            stripe_subscription_id: row.stripe_subscription_id,
            change_type,
            previous_subject_ids: row.previous_subject_ids,
            target_subject_ids: row.target_subject_ids,
            previous_price_cents: row.previous_price_cents,
            new_price_cents: row.new_price_cents,
            effective_at: row.effective_at,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn customer(&self, user_id: &str) -> BillingResult<Option<BillingCustomer>>;

    async fn customer_for_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<BillingCustomer>>;

    /// Upsert the user's customer row from the provider subscription
    async fn sync_subscription(
        &self,
        user_id: &str,
        subscription: &ProviderSubscription,
    ) -> BillingResult<()>;

    async fn list_subjects(&self) -> BillingResult<Vec<Subject>>;

    async fn entitled_subject_ids(&self, user_id: &str) -> BillingResult<BTreeSet<Uuid>>;

    async fn replace_entitlements(
        &self,
        user_id: &str,
        subject_ids: &BTreeSet<Uuid>,
    ) -> BillingResult<()>;

    /// The user's change in `pending` status, if any
    async fn pending_change(&self, user_id: &str)
        -> BillingResult<Option<PendingSubscriptionChange>>;

    async fn list_pending_changes(
        &self,
        user_id: &str,
    ) -> BillingResult<Vec<PendingSubscriptionChange>>;

    /// Fails with `PendingChangeExists` if the user already has one pending
    async fn insert_pending_change(&self, change: &PendingSubscriptionChange)
        -> BillingResult<()>;

    async fn update_pending_target(
        &self,
        change_id: Uuid,
        target_subject_ids: &BTreeSet<Uuid>,
        new_price_cents: i64,
    ) -> BillingResult<()>;

    /// Move a pending change to `cancelled`. Returns false if it was no longer pending.
    async fn cancel_pending_change(&self, change_id: Uuid) -> BillingResult<bool>;

    /// Atomically mark a pending change resolved and apply its target set as
    /// the user's entitlements. Returns false if it was no longer pending.
    async fn resolve_pending_change(&self, change: &PendingSubscriptionChange)
        -> BillingResult<bool>;

    /// Claim a webhook event for processing. Returns false for duplicates.
    /// Failed events, and events stuck in processing longer than
    /// [`WEBHOOK_PROCESSING_TIMEOUT`], can be claimed again.
    async fn claim_webhook_event(&self, event_id: &str, event_type: &str) -> BillingResult<bool>;

    async fn finish_webhook_event(&self, event_id: &str, error: Option<&str>)
        -> BillingResult<()>;
}

/// sqlx/Postgres implementation
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const PENDING_CHANGE_COLUMNS: &str = r#"
    id, user_id, stripe_subscription_id, change_type,
    previous_subject_ids, target_subject_ids,
    previous_price_cents, new_price_cents,
    effective_at, status, created_at, updated_at
"#;

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn customer(&self, user_id: &str) -> BillingResult<Option<BillingCustomer>> {
        let customer = sqlx::query_as::<_, BillingCustomer>(
            r#"
            SELECT user_id, stripe_customer_id, stripe_subscription_id,
                   status, cancel_at_period_end, current_period_end
            FROM billing_customers
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(customer)
    }

    async fn customer_for_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<BillingCustomer>> {
        let customer = sqlx::query_as::<_, BillingCustomer>(
            r#"
            SELECT user_id, stripe_customer_id, stripe_subscription_id,
                   status, cancel_at_period_end, current_period_end
            FROM billing_customers
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(customer)
    }

    async fn sync_subscription(
        &self,
        user_id: &str,
        subscription: &ProviderSubscription,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_customers
                (user_id, stripe_customer_id, stripe_subscription_id, status,
                 cancel_at_period_end, current_period_end, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                stripe_customer_id = EXCLUDED.stripe_customer_id,
                stripe_subscription_id = EXCLUDED.stripe_subscription_id,
                status = EXCLUDED.status,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                current_period_end = EXCLUDED.current_period_end,
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(&subscription.customer_id)
        .bind(&subscription.id)
        .bind(subscription.state.as_str())
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.current_period_end)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_subjects(&self) -> BillingResult<Vec<Subject>> {
        let subjects = sqlx::query_as::<_, Subject>(
            r#"
            SELECT id, name, description, color, slug, maturita, order_index
            FROM subjects
            ORDER BY order_index, name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(subjects)
    }

    async fn entitled_subject_ids(&self, user_id: &str) -> BillingResult<BTreeSet<Uuid>> {
        let ids: Vec<Uuid> =
            sqlx::query_scalar("SELECT subject_id FROM user_subjects WHERE user_id = $1")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(ids.into_iter().collect())
    }

    async fn replace_entitlements(
        &self,
        user_id: &str,
        subject_ids: &BTreeSet<Uuid>,
    ) -> BillingResult<()> {
        let ids: Vec<Uuid> = subject_ids.iter().copied().collect();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM user_subjects WHERE user_id = $1 AND NOT (subject_id = ANY($2))")
            .bind(user_id)
            .bind(&ids)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO user_subjects (user_id, subject_id)
            SELECT $1, UNNEST($2::uuid[])
            ON CONFLICT (user_id, subject_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(&ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn pending_change(
        &self,
        user_id: &str,
    ) -> BillingResult<Option<PendingSubscriptionChange>> {
        let sql = format!(
            "SELECT {} FROM pending_subscription_changes WHERE user_id = $1 AND status = 'pending'",
            PENDING_CHANGE_COLUMNS
        );
        let row: Option<PendingChangeRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(PendingSubscriptionChange::try_from).transpose()
    }

    async fn list_pending_changes(
        &self,
        user_id: &str,
    ) -> BillingResult<Vec<PendingSubscriptionChange>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM pending_subscription_changes
            WHERE user_id = $1 AND status = 'pending'
            ORDER BY created_at DESC
            "#,
            PENDING_CHANGE_COLUMNS
        );
        let rows: Vec<PendingChangeRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(PendingSubscriptionChange::try_from)
            .collect()
    }

    async fn insert_pending_change(
        &self,
        change: &PendingSubscriptionChange,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO pending_subscription_changes
                (id, user_id, stripe_subscription_id, change_type,
                 previous_subject_ids, target_subject_ids,
                 previous_price_cents, new_price_cents,
                 effective_at, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(change.id)
        .bind(&change.user_id)
        .bind(&change.stripe_subscription_id)
        .bind(change.change_type.as_str())
        .bind(&change.previous_subject_ids)
        .bind(&change.target_subject_ids)
        .bind(change.previous_price_cents)
        .bind(change.new_price_cents)
        .bind(change.effective_at)
        .bind(change.status.as_str())
        .bind(change.created_at)
        .bind(change.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db))
                if db.code().as_deref() == Some(UNIQUE_VIOLATION) =>
            {
                Err(BillingError::PendingChangeExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_pending_target(
        &self,
        change_id: Uuid,
        target_subject_ids: &BTreeSet<Uuid>,
        new_price_cents: i64,
    ) -> BillingResult<()> {
        let ids: Vec<Uuid> = target_subject_ids.iter().copied().collect();
        let result = sqlx::query(
            r#"
            UPDATE pending_subscription_changes
            SET target_subject_ids = $2,
                new_price_cents = $3,
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(change_id)
        .bind(&ids)
        .bind(new_price_cents)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NoPendingChange);
        }
        Ok(())
    }

    async fn cancel_pending_change(&self, change_id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pending_subscription_changes
            SET status = 'cancelled', updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(change_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn resolve_pending_change(
        &self,
        change: &PendingSubscriptionChange,
    ) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;

        // Claim first so a concurrent undo or webhook cannot apply it twice
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE pending_subscription_changes
            SET status = 'resolved', updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING id
            "#,
        )
        .bind(change.id)
        .fetch_optional(&mut *tx)
        .await?;

        if claimed.is_none() {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM user_subjects WHERE user_id = $1 AND NOT (subject_id = ANY($2))")
            .bind(&change.user_id)
            .bind(&change.target_subject_ids)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO user_subjects (user_id, subject_id)
            SELECT $1, UNNEST($2::uuid[])
            ON CONFLICT (user_id, subject_id) DO NOTHING
            "#,
        )
        .bind(&change.user_id)
        .bind(&change.target_subject_ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn claim_webhook_event(&self, event_id: &str, event_type: &str) -> BillingResult<bool> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, processing_result, processing_started_at)
            VALUES ($1, $2, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = NULL,
                processed_at = NULL
            WHERE stripe_webhook_events.processing_result = 'error'
               OR (stripe_webhook_events.processing_result = 'processing'
                   AND stripe_webhook_events.processing_started_at
                       < NOW() - make_interval(mins => $3))
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(WEBHOOK_PROCESSING_TIMEOUT.whole_minutes() as i32)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        error: Option<&str>,
    ) -> BillingResult<()> {
        let result = if error.is_some() { "error" } else { "success" };
        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $2, error_message = $3, processed_at = NOW()
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(result)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(previous: Vec<Uuid>, target: Vec<Uuid>) -> PendingSubscriptionChange {
        let now = OffsetDateTime::now_utc();
        PendingSubscriptionChange {
            id: Uuid::new_v4(),
            user_id: "user_1".to_string(),
            stripe_subscription_id: "sub_1".to_string(),
            change_type: ChangeType::Downgrade,
            previous_subject_ids: previous,
            target_subject_ids: target,
            previous_price_cents: 748,
            new_price_cents: 499,
            effective_at: now + time::Duration::days(3),
            status: PendingChangeStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_removed_and_added_subjects() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let pending = change(vec![a, b], vec![a]);

        assert_eq!(pending.removed_subject_ids(), vec![b]);
        assert!(pending.added_subject_ids().is_empty());
    }

    #[test]
    fn test_is_due() {
        let a = Uuid::new_v4();
        let mut pending = change(vec![a], vec![a]);
        let now = OffsetDateTime::now_utc();

        assert!(!pending.is_due(now));
        assert!(pending.is_due(now + time::Duration::days(4)));

        pending.status = PendingChangeStatus::Cancelled;
        assert!(!pending.is_due(now + time::Duration::days(4)));
    }

    #[test]
    fn test_row_conversion_rejects_unknown_values() {
        let now = OffsetDateTime::now_utc();
        let row = PendingChangeRow {
            id: Uuid::new_v4(),
            user_id: "user_1".to_string(),
            stripe_subscription_id: "sub_1".to_string(),
            change_type: "sidegrade".to_string(),
            previous_subject_ids: vec![],
            target_subject_ids: vec![],
            previous_price_cents: 0,
            new_price_cents: 0,
            effective_at: now,
            status: "pending".to_string(),
            created_at: now,
            updated_at: now,
        };

        assert!(matches!(
            PendingSubscriptionChange::try_from(row),
            Err(BillingError::Database(_))
        ));
    }

    #[test]
    fn test_pending_change_serialization() {
        let a = Uuid::new_v4();
        let pending = change(vec![a], vec![a]);
        let json = serde_json::to_string(&pending).expect("Failed to serialize");

        assert!(json.contains("\"change_type\":\"downgrade\""));
        assert!(json.contains("\"status\":\"pending\""));
        assert!(json.contains("\"new_price_cents\":499"));
    }
}
