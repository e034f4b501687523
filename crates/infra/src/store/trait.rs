use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use warden_core::{
    ContributionKey, DirectRelation, GroupPk, Membership, MembershipError,
    NewTemplateContribution, Pagination, StoredDirectRelation, Subject, SubjectPk, TemplateId,
    TemplateContribution,
};

pub type StoreResult<T> = Result<T, StoreError>;

/// Store operation error.
///
/// These are **infrastructure errors** raised by a backend. They convert into
/// [`MembershipError`] at the controller boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("row not found: {0}")]
    NotFound(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Connectivity failure (pool closed, acquire timeout, IO).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for MembershipError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => MembershipError::NotFound(msg),
            StoreError::ConstraintViolation(msg) => MembershipError::ConstraintViolation(msg),
            StoreError::Unavailable(msg) | StoreError::Backend(msg) => MembershipError::Store(msg),
        }
    }
}

/// An open store transaction.
///
/// Dropping a transaction without calling [`StoreTransaction::commit`] rolls
/// it back, so `?` on any step inside an operation leaves no partial writes.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn commit(self) -> StoreResult<()>;

    async fn rollback(self) -> StoreResult<()>;
}

/// A store that can open transactions.
#[async_trait]
pub trait Transactional: Send + Sync {
    type Tx: StoreTransaction;

    async fn begin(&self) -> StoreResult<Self::Tx>;
}

/// Resolution of external `(type, id)` identities to store keys.
///
/// The identity tables are provisioned elsewhere; this boundary only reads
/// them (and row-locks groups).
#[async_trait]
pub trait SubjectDirectory: Transactional {
    async fn get_subject_pk(&self, subject: &Subject) -> StoreResult<Option<SubjectPk>>;

    /// Resolve many subjects at once. Unknown subjects are absent from the map.
    async fn list_subject_pks(
        &self,
        subjects: &[Subject],
    ) -> StoreResult<HashMap<Subject, SubjectPk>>;

    async fn list_subjects_by_pks(
        &self,
        pks: &[SubjectPk],
    ) -> StoreResult<HashMap<SubjectPk, Subject>>;

    /// Take the group's row lock for the rest of the transaction.
    ///
    /// Every mutation of a group's ledgers takes this lock before reading, so
    /// concurrent grants and revocations for the same group serialize.
    async fn lock_group(&self, tx: &mut Self::Tx, group_pk: GroupPk) -> StoreResult<()>;
}

/// Direct membership ledger (`group_member`): one row per `(subject, group)`.
#[async_trait]
pub trait DirectLedger: Transactional {
    async fn list_members_by_group_subjects(
        &self,
        tx: &mut Self::Tx,
        group_pk: GroupPk,
        subject_pks: &[SubjectPk],
    ) -> StoreResult<Vec<StoredDirectRelation>>;

    async fn member_exists(
        &self,
        tx: &mut Self::Tx,
        subject_pk: SubjectPk,
        group_pk: GroupPk,
    ) -> StoreResult<bool>;

    /// Insert-or-update keyed by `(subject_pk, group_pk)`.
    async fn bulk_upsert_members(
        &self,
        tx: &mut Self::Tx,
        relations: &[DirectRelation],
    ) -> StoreResult<()>;

    /// Overwrite `expired_at` of existing rows; missing rows are skipped.
    async fn bulk_update_member_expired_at(
        &self,
        tx: &mut Self::Tx,
        relations: &[DirectRelation],
    ) -> StoreResult<u64>;

    async fn bulk_delete_members(
        &self,
        tx: &mut Self::Tx,
        pairs: &[(SubjectPk, GroupPk)],
    ) -> StoreResult<u64>;

    /// Direct rows of a group ordered by `subject_pk`, optionally only those
    /// expiring before `before`.
    async fn list_direct_members(
        &self,
        group_pk: GroupPk,
        before: Option<i64>,
        pagination: Pagination,
    ) -> StoreResult<Vec<StoredDirectRelation>>;

    async fn count_direct_members(&self, group_pk: GroupPk, before: Option<i64>)
        -> StoreResult<u64>;
}

/// Template contribution ledger (`subject_template_group`): one row per
/// `(subject, template, group)`.
#[async_trait]
pub trait TemplateLedger: Transactional {
    async fn list_contributions_by_template_group_subjects(
        &self,
        tx: &mut Self::Tx,
        template_id: TemplateId,
        group_pk: GroupPk,
        subject_pks: &[SubjectPk],
    ) -> StoreResult<Vec<TemplateContribution>>;

    /// Insert new contributions. A triple that already exists (or repeats in
    /// the batch) fails with [`StoreError::ConstraintViolation`].
    async fn bulk_create_contributions(
        &self,
        tx: &mut Self::Tx,
        rows: &[NewTemplateContribution],
    ) -> StoreResult<()>;

    /// Overwrite `expired_at` matched on the full `(subject, template, group)`
    /// triple. Other templates' rows for the same pair are never touched.
    async fn bulk_update_contribution_expired_at(
        &self,
        tx: &mut Self::Tx,
        rows: &[NewTemplateContribution],
    ) -> StoreResult<u64>;

    async fn bulk_delete_contributions(
        &self,
        tx: &mut Self::Tx,
        keys: &[ContributionKey],
    ) -> StoreResult<u64>;

    /// Whether a template other than `template_id` still grants the pair.
    async fn has_relation_except_template(
        &self,
        tx: &mut Self::Tx,
        subject_pk: SubjectPk,
        group_pk: GroupPk,
        template_id: TemplateId,
    ) -> StoreResult<bool>;

    /// Latest template-sourced expiry of the pair, or `NotFound`.
    async fn get_expired_at_by_subject_group(
        &self,
        subject_pk: SubjectPk,
        group_pk: GroupPk,
    ) -> StoreResult<i64>;

    /// Contributions of one template ordered by `pk`, optionally for one group.
    async fn list_contributions_by_template(
        &self,
        template_id: TemplateId,
        group_pk: Option<GroupPk>,
    ) -> StoreResult<Vec<TemplateContribution>>;
}

/// Read-time materialization over both ledgers.
///
/// Every method merges direct and template rows per `(subject, group)` pair:
/// expiry is the max, creation the min.
#[async_trait]
pub trait MembershipView: Transactional {
    /// Merged members of a group ordered by `subject_pk`; with `before`, only
    /// those whose merged expiry is earlier.
    async fn list_group_memberships(
        &self,
        group_pk: GroupPk,
        before: Option<i64>,
        pagination: Pagination,
    ) -> StoreResult<Vec<Membership>>;

    async fn count_group_memberships(
        &self,
        group_pk: GroupPk,
        before: Option<i64>,
    ) -> StoreResult<u64>;

    /// Merged groups of a subject ordered by `group_pk`.
    async fn list_subject_memberships(
        &self,
        subject_pk: SubjectPk,
        before: Option<i64>,
    ) -> StoreResult<Vec<Membership>>;

    async fn get_membership(
        &self,
        subject_pk: SubjectPk,
        group_pk: GroupPk,
    ) -> StoreResult<Option<Membership>>;

    /// Of `group_pks`, the groups holding at least one merged membership that
    /// expires before `before`, in ascending key order.
    async fn filter_groups_with_expiring_members(
        &self,
        group_pks: &[GroupPk],
        before: i64,
    ) -> StoreResult<Vec<GroupPk>>;
}

/// Everything the group controller needs from a backend.
pub trait MembershipStore: SubjectDirectory + DirectLedger + TemplateLedger + MembershipView {}

impl<S> MembershipStore for S where
    S: SubjectDirectory + DirectLedger + TemplateLedger + MembershipView
{
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_onto_the_membership_taxonomy() {
        assert_eq!(
            MembershipError::from(StoreError::NotFound("pair".into())),
            MembershipError::NotFound("pair".into())
        );
        assert_eq!(
            MembershipError::from(StoreError::ConstraintViolation("dup".into())),
            MembershipError::ConstraintViolation("dup".into())
        );
        assert!(MembershipError::from(StoreError::Unavailable("pool closed".into())).is_retryable());
        assert!(MembershipError::from(StoreError::Backend("deadlock".into())).is_retryable());
    }
}
