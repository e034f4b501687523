//! Membership reconciliation (application-level orchestration).
//!
//! `GroupController` is the only writer of both ledgers. Every mutation runs
//! the same pipeline:
//!
//! ```text
//! request
//!   ↓
//! 1. Validate and normalize input (no store calls on failure or empty input)
//!   ↓
//! 2. Resolve group and subjects to store keys
//!   ↓
//! 3. Begin transaction, lock the group row
//!   ↓
//! 4. Read existing ledger rows, compute the writes
//!   ↓
//! 5. Write, commit (or roll back on the first error)
//! ```
//!
//! Reads go through the store's materialized view and are not transactional.

mod members;
mod queries;
mod templates;

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use warden_core::{
    GroupMember, GroupPk, MembershipError, MembershipResult, Pagination, Subject, SubjectPk,
    TemplateId, TypeCount,
};

use crate::config::PagingConfig;
use crate::store::{MembershipStore, StoreTransaction};

/// Outcome of revoking a template grant.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RevokeSummary {
    /// Template contributions deleted.
    pub revoked: TypeCount,
    /// Memberships that no longer exist at all after the revocation.
    pub removed: TypeCount,
}

/// Orchestrates membership changes and reads over an injected store.
#[derive(Debug)]
pub struct GroupController<S> {
    store: Arc<S>,
    paging: PagingConfig,
}

impl<S> Clone for GroupController<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            paging: self.paging,
        }
    }
}

/// Something that names a member subject.
trait MemberRef {
    fn subject(&self) -> &Subject;
}

impl MemberRef for GroupMember {
    fn subject(&self) -> &Subject {
        &self.subject
    }
}

impl MemberRef for Subject {
    fn subject(&self) -> &Subject {
        self
    }
}

struct Resolved<T> {
    item: T,
    pk: SubjectPk,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Resolution {
    /// Every subject must exist.
    Strict,
    /// Unknown subjects are dropped.
    Lenient,
}

impl<S: MembershipStore> GroupController<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_paging(store, PagingConfig::default())
    }

    pub fn with_paging(store: Arc<S>, paging: PagingConfig) -> Self {
        Self { store, paging }
    }

    /// First page at the configured default size.
    pub fn first_page(&self) -> Pagination {
        Pagination {
            limit: self.paging.default_limit,
            offset: 0,
        }
    }

    async fn resolve_group(&self, group: &Subject) -> MembershipResult<GroupPk> {
        self.store
            .get_subject_pk(group)
            .await?
            .map(GroupPk::from)
            .ok_or_else(|| MembershipError::not_found(format!("group {}", group.id)))
    }

    async fn resolve_subject(&self, subject: &Subject) -> MembershipResult<SubjectPk> {
        self.store
            .get_subject_pk(subject)
            .await?
            .ok_or_else(|| MembershipError::not_found(format!("subject {subject}")))
    }

    /// Resolve member subjects, keeping request order.
    async fn resolve_members<T: MemberRef>(
        &self,
        items: Vec<T>,
        resolution: Resolution,
    ) -> MembershipResult<Vec<Resolved<T>>> {
        let subjects: Vec<Subject> = items.iter().map(|i| i.subject().clone()).collect();
        let pks = self.store.list_subject_pks(&subjects).await?;

        let mut resolved = Vec::with_capacity(items.len());
        let mut missing = Vec::new();
        for item in items {
            match pks.get(item.subject()) {
                Some(pk) => resolved.push(Resolved { pk: *pk, item }),
                None => missing.push(item.subject().to_string()),
            }
        }

        if !missing.is_empty() {
            match resolution {
                Resolution::Strict => {
                    return Err(MembershipError::not_found(format!(
                        "subjects not found: {}",
                        missing.join(", ")
                    )));
                }
                Resolution::Lenient => {
                    tracing::debug!(skipped = missing.len(), "ignoring unknown subjects");
                }
            }
        }
        Ok(resolved)
    }

    /// Commit on success, roll back otherwise.
    async fn settle<T>(
        &self,
        tx: S::Tx,
        outcome: MembershipResult<T>,
        operation: &'static str,
    ) -> MembershipResult<T> {
        match outcome {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                warn!(operation, error = %err, "rolling back membership transaction");
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(operation, error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }
}

fn validate_template_id(template_id: TemplateId) -> MembershipResult<()> {
    if template_id.get() <= 0 {
        return Err(MembershipError::validation(format!(
            "template id must be positive, got {template_id}"
        )));
    }
    Ok(())
}

/// Validate group references, dropping duplicates.
fn normalize_groups(groups: &[Subject]) -> MembershipResult<Vec<Subject>> {
    let mut seen = HashSet::with_capacity(groups.len());
    let mut out = Vec::with_capacity(groups.len());
    for group in groups {
        group.validate_group()?;
        if seen.insert(group) {
            out.push(group.clone());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_ids_must_be_positive() {
        assert!(validate_template_id(TemplateId::new(7)).is_ok());
        assert!(matches!(
            validate_template_id(TemplateId::new(0)),
            Err(MembershipError::Validation(_))
        ));
    }

    #[test]
    fn group_refs_are_validated_and_deduplicated() {
        let groups = vec![Subject::group("g1"), Subject::group("g2"), Subject::group("g1")];
        assert_eq!(normalize_groups(&groups).unwrap().len(), 2);
        assert!(normalize_groups(&[Subject::user("alice")]).is_err());
    }

    #[test]
    fn revoke_summary_serializes_per_type_counts() {
        let mut summary = RevokeSummary::default();
        summary.revoked.increment(warden_core::SubjectType::User);
        assert_eq!(
            serde_json::to_value(&summary).unwrap(),
            serde_json::json!({
                "revoked": {"user": 1, "department": 0},
                "removed": {"user": 0, "department": 0},
            })
        );
    }
}
