//! Subject access checks

use std::sync::Arc;

use maturamate_shared::{Subject, SubjectCatalog};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::provider::SubscriptionState;
use crate::store::BillingStore;
use crate::subscriptions::resolve_due_change;

/// Subjects a user can study right now
#[derive(Debug, Clone, Serialize)]
pub struct UserSubjectAccess {
    pub has_access: bool,
    pub subject_ids: Vec<Uuid>,
    pub subjects: Vec<Subject>,
    pub count: usize,
    /// Catalog subjects the user could still add
    pub available_slots: usize,
}

#[derive(Clone)]
pub struct EntitlementService {
    store: Arc<dyn BillingStore>,
}

impl EntitlementService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Entitled subjects, gated on the last synced subscription state
    ///
    /// Canceled or incomplete subscriptions grant nothing even though the
    /// entitlement rows are kept.
    pub async fn subject_access(&self, user_id: &str) -> BillingResult<UserSubjectAccess> {
        resolve_due_change(self.store.as_ref(), user_id, OffsetDateTime::now_utc()).await?;

        let catalog = SubjectCatalog::new(self.store.list_subjects().await?);
        let has_access = self
            .store
            .customer(user_id)
            .await?
            .and_then(|c| c.status)
            .and_then(|s| SubscriptionState::parse(&s))
            .is_some_and(|state| state.grants_access());

        let entitled = if has_access {
            self.store.entitled_subject_ids(user_id).await?
        } else {
            Default::default()
        };

        let subjects = catalog.resolve(&entitled);
        let count = subjects.len();
        Ok(UserSubjectAccess {
            has_access,
            subject_ids: subjects.iter().map(|s| s.id).collect(),
            subjects,
            count,
            available_slots: catalog.len().saturating_sub(count),
        })
    }

    pub async fn has_subject_access(&self, user_id: &str, subject_id: Uuid) -> BillingResult<bool> {
        let access = self.subject_access(user_id).await?;
        Ok(access.subject_ids.contains(&subject_id))
    }

    /// Catalog listing, optionally filtered on the maturita flag
    pub async fn list_subjects(&self, maturita: Option<bool>) -> BillingResult<Vec<Subject>> {
        let catalog = SubjectCatalog::new(self.store.list_subjects().await?);
        Ok(catalog.list(maturita))
    }
}
