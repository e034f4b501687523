use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use warden_core::relation::{materialize, merge_expired_at};
use warden_core::{
    ContributionKey, DirectRelation, GroupPk, Membership, NewTemplateContribution, Pagination,
    StoredDirectRelation, Subject, SubjectPk, SubjectType, TemplateContribution, TemplateId,
};

use super::r#trait::{
    DirectLedger, MembershipView, StoreError, StoreResult, StoreTransaction, SubjectDirectory,
    TemplateLedger, Transactional,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    subjects: BTreeMap<SubjectPk, Subject>,
    subject_index: HashMap<Subject, SubjectPk>,
    next_subject_pk: i64,

    direct: BTreeMap<(GroupPk, SubjectPk), StoredDirectRelation>,

    contributions: BTreeMap<i64, TemplateContribution>,
    contribution_index: HashMap<ContributionKey, i64>,
    next_contribution_pk: i64,
}

impl Tables {
    fn insert_subject(&mut self, pk: SubjectPk, subject: Subject) {
        self.subject_index.insert(subject.clone(), pk);
        self.subjects.insert(pk, subject);
        self.next_subject_pk = self.next_subject_pk.max(pk.get());
    }

    fn direct_of_group(&self, group_pk: GroupPk) -> impl Iterator<Item = &StoredDirectRelation> {
        self.direct
            .range((group_pk, SubjectPk::new(i64::MIN))..=(group_pk, SubjectPk::new(i64::MAX)))
            .map(|(_, row)| row)
    }

    /// Merge only the rows accepted by `keep`.
    fn memberships_where(
        &self,
        keep: impl Fn(SubjectPk, GroupPk) -> bool,
    ) -> BTreeMap<(GroupPk, SubjectPk), Membership> {
        materialize(
            self.direct
                .values()
                .filter(|r| keep(r.subject_pk, r.group_pk)),
            self.contributions
                .values()
                .filter(|c| keep(c.subject_pk, c.group_pk)),
        )
    }
}

/// Counters and the write-failure trigger used by tests.
#[derive(Debug, Default)]
struct WriteCounters {
    writes: AtomicU64,
    transactions: AtomicU64,
    fail_at: AtomicU64,
}

impl WriteCounters {
    fn record_write(&self) -> StoreResult<()> {
        let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        let target = self.fail_at.load(Ordering::SeqCst);
        if target != 0 && n == target {
            self.fail_at.store(0, Ordering::SeqCst);
            return Err(StoreError::Backend(format!("injected failure on row write #{n}")));
        }
        Ok(())
    }
}

/// Open transaction of [`InMemoryMembershipStore`].
///
/// Holds the store-wide lock and a staged copy of every table; commit swaps
/// the copy in, drop discards it.
pub struct InMemoryTransaction {
    guard: OwnedMutexGuard<Tables>,
    staged: Tables,
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn commit(self) -> StoreResult<()> {
        let InMemoryTransaction { mut guard, staged } = self;
        *guard = staged;
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        drop(self);
        Ok(())
    }
}

/// In-memory membership store.
///
/// Intended for tests/dev. Not optimized for performance: transactions are
/// fully serialized and every view query re-merges the affected rows.
///
/// Non-transactional reads wait for the open transaction, so a caller must not
/// issue them from the task that holds one.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMembershipStore {
    tables: Arc<Mutex<Tables>>,
    counters: Arc<WriteCounters>,
}

impl InMemoryMembershipStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provision a subject (or group), returning its key. Idempotent.
    pub async fn register_subject(&self, subject: Subject) -> SubjectPk {
        let mut guard = self.tables.lock().await;
        let t = &mut *guard;
        if let Some(pk) = t.subject_index.get(&subject) {
            return *pk;
        }
        let pk = SubjectPk::new(t.next_subject_pk + 1);
        t.insert_subject(pk, subject);
        pk
    }

    /// Provision a subject under a caller-chosen key.
    pub async fn register_subject_with_pk(
        &self,
        subject: Subject,
        pk: SubjectPk,
    ) -> StoreResult<SubjectPk> {
        let mut guard = self.tables.lock().await;
        let t = &mut *guard;
        let existing = t.subject_index.get(&subject).copied();
        let key_taken = t.subjects.contains_key(&pk);
        match existing {
            Some(current) if current == pk => Ok(pk),
            None if !key_taken => {
                t.insert_subject(pk, subject);
                Ok(pk)
            }
            _ => Err(StoreError::ConstraintViolation(format!(
                "subject {subject} or key {pk} already registered"
            ))),
        }
    }

    /// Fail the `nth` row write from now (1-based) with a backend error.
    pub fn inject_write_failure(&self, nth: u64) {
        let base = self.counters.writes.load(Ordering::SeqCst);
        self.counters.fail_at.store(base + nth, Ordering::SeqCst);
    }

    /// Row writes attempted since the store was created.
    pub fn write_count(&self) -> u64 {
        self.counters.writes.load(Ordering::SeqCst)
    }

    /// Transactions opened since the store was created.
    pub fn transaction_count(&self) -> u64 {
        self.counters.transactions.load(Ordering::SeqCst)
    }

    pub async fn direct_row_count(&self) -> usize {
        self.tables.lock().await.direct.len()
    }

    pub async fn contribution_row_count(&self) -> usize {
        self.tables.lock().await.contributions.len()
    }
}

#[async_trait]
impl Transactional for InMemoryMembershipStore {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> StoreResult<InMemoryTransaction> {
        self.counters.transactions.fetch_add(1, Ordering::SeqCst);
        let guard = self.tables.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(InMemoryTransaction { guard, staged })
    }
}

#[async_trait]
impl SubjectDirectory for InMemoryMembershipStore {
    async fn get_subject_pk(&self, subject: &Subject) -> StoreResult<Option<SubjectPk>> {
        Ok(self.tables.lock().await.subject_index.get(subject).copied())
    }

    async fn list_subject_pks(
        &self,
        subjects: &[Subject],
    ) -> StoreResult<HashMap<Subject, SubjectPk>> {
        let t = self.tables.lock().await;
        Ok(subjects
            .iter()
            .filter_map(|s| t.subject_index.get(s).map(|pk| (s.clone(), *pk)))
            .collect())
    }

    async fn list_subjects_by_pks(
        &self,
        pks: &[SubjectPk],
    ) -> StoreResult<HashMap<SubjectPk, Subject>> {
        let t = self.tables.lock().await;
        Ok(pks
            .iter()
            .filter_map(|pk| t.subjects.get(pk).map(|s| (*pk, s.clone())))
            .collect())
    }

    async fn lock_group(&self, tx: &mut InMemoryTransaction, group_pk: GroupPk) -> StoreResult<()> {
        // The transaction already owns the store-wide lock.
        let is_group = tx
            .staged
            .subjects
            .get(&SubjectPk::from(group_pk))
            .is_some_and(|s| s.subject_type == SubjectType::Group);
        if is_group {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("group {group_pk}")))
        }
    }
}

#[async_trait]
impl DirectLedger for InMemoryMembershipStore {
    async fn list_members_by_group_subjects(
        &self,
        tx: &mut InMemoryTransaction,
        group_pk: GroupPk,
        subject_pks: &[SubjectPk],
    ) -> StoreResult<Vec<StoredDirectRelation>> {
        Ok(subject_pks
            .iter()
            .filter_map(|s| tx.staged.direct.get(&(group_pk, *s)).cloned())
            .collect())
    }

    async fn member_exists(
        &self,
        tx: &mut InMemoryTransaction,
        subject_pk: SubjectPk,
        group_pk: GroupPk,
    ) -> StoreResult<bool> {
        Ok(tx.staged.direct.contains_key(&(group_pk, subject_pk)))
    }

    async fn bulk_upsert_members(
        &self,
        tx: &mut InMemoryTransaction,
        relations: &[DirectRelation],
    ) -> StoreResult<()> {
        let now = Utc::now();
        for r in relations {
            self.counters.record_write()?;
            tx.staged
                .direct
                .entry((r.group_pk, r.subject_pk))
                .and_modify(|row| row.expired_at = r.expired_at)
                .or_insert(StoredDirectRelation {
                    subject_pk: r.subject_pk,
                    group_pk: r.group_pk,
                    expired_at: r.expired_at,
                    created_at: now,
                });
        }
        Ok(())
    }

    async fn bulk_update_member_expired_at(
        &self,
        tx: &mut InMemoryTransaction,
        relations: &[DirectRelation],
    ) -> StoreResult<u64> {
        let mut affected = 0;
        for r in relations {
            if let Some(row) = tx.staged.direct.get_mut(&(r.group_pk, r.subject_pk)) {
                self.counters.record_write()?;
                row.expired_at = r.expired_at;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn bulk_delete_members(
        &self,
        tx: &mut InMemoryTransaction,
        pairs: &[(SubjectPk, GroupPk)],
    ) -> StoreResult<u64> {
        let mut affected = 0;
        for (subject_pk, group_pk) in pairs {
            let key = (*group_pk, *subject_pk);
            if tx.staged.direct.contains_key(&key) {
                self.counters.record_write()?;
                tx.staged.direct.remove(&key);
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn list_direct_members(
        &self,
        group_pk: GroupPk,
        before: Option<i64>,
        pagination: Pagination,
    ) -> StoreResult<Vec<StoredDirectRelation>> {
        let t = self.tables.lock().await;
        Ok(pagination.slice(
            t.direct_of_group(group_pk)
                .filter(|r| before.is_none_or(|b| r.expired_at < b))
                .cloned(),
        ))
    }

    async fn count_direct_members(
        &self,
        group_pk: GroupPk,
        before: Option<i64>,
    ) -> StoreResult<u64> {
        let t = self.tables.lock().await;
        Ok(t.direct_of_group(group_pk)
            .filter(|r| before.is_none_or(|b| r.expired_at < b))
            .count() as u64)
    }
}

#[async_trait]
impl TemplateLedger for InMemoryMembershipStore {
    async fn list_contributions_by_template_group_subjects(
        &self,
        tx: &mut InMemoryTransaction,
        template_id: TemplateId,
        group_pk: GroupPk,
        subject_pks: &[SubjectPk],
    ) -> StoreResult<Vec<TemplateContribution>> {
        let t = &tx.staged;
        Ok(subject_pks
            .iter()
            .filter_map(|s| {
                let key = ContributionKey {
                    subject_pk: *s,
                    template_id,
                    group_pk,
                };
                t.contribution_index
                    .get(&key)
                    .and_then(|pk| t.contributions.get(pk))
                    .cloned()
            })
            .collect())
    }

    async fn bulk_create_contributions(
        &self,
        tx: &mut InMemoryTransaction,
        rows: &[NewTemplateContribution],
    ) -> StoreResult<()> {
        let now = Utc::now();
        let t = &mut tx.staged;
        for row in rows {
            self.counters.record_write()?;
            let key = row.key();
            if t.contribution_index.contains_key(&key) {
                return Err(StoreError::ConstraintViolation(format!(
                    "subject_template_group (subject {}, template {}, group {}) already exists",
                    key.subject_pk, key.template_id, key.group_pk
                )));
            }
            t.next_contribution_pk += 1;
            let pk = t.next_contribution_pk;
            t.contribution_index.insert(key, pk);
            t.contributions.insert(
                pk,
                TemplateContribution {
                    pk,
                    subject_pk: row.subject_pk,
                    template_id: row.template_id,
                    group_pk: row.group_pk,
                    expired_at: row.expired_at,
                    created_at: now,
                },
            );
        }
        Ok(())
    }

    async fn bulk_update_contribution_expired_at(
        &self,
        tx: &mut InMemoryTransaction,
        rows: &[NewTemplateContribution],
    ) -> StoreResult<u64> {
        let t = &mut tx.staged;
        let mut affected = 0;
        for row in rows {
            let Some(pk) = t.contribution_index.get(&row.key()).copied() else {
                continue;
            };
            if let Some(stored) = t.contributions.get_mut(&pk) {
                self.counters.record_write()?;
                stored.expired_at = row.expired_at;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn bulk_delete_contributions(
        &self,
        tx: &mut InMemoryTransaction,
        keys: &[ContributionKey],
    ) -> StoreResult<u64> {
        let t = &mut tx.staged;
        let mut affected = 0;
        for key in keys {
            if let Some(pk) = t.contribution_index.get(key).copied() {
                self.counters.record_write()?;
                t.contribution_index.remove(key);
                t.contributions.remove(&pk);
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn has_relation_except_template(
        &self,
        tx: &mut InMemoryTransaction,
        subject_pk: SubjectPk,
        group_pk: GroupPk,
        template_id: TemplateId,
    ) -> StoreResult<bool> {
        Ok(tx.staged.contributions.values().any(|c| {
            c.subject_pk == subject_pk && c.group_pk == group_pk && c.template_id != template_id
        }))
    }

    async fn get_expired_at_by_subject_group(
        &self,
        subject_pk: SubjectPk,
        group_pk: GroupPk,
    ) -> StoreResult<i64> {
        let t = self.tables.lock().await;
        let expiries = t
            .contributions
            .values()
            .filter(|c| c.subject_pk == subject_pk && c.group_pk == group_pk)
            .map(|c| c.expired_at);
        merge_expired_at(None, expiries).ok_or_else(|| {
                StoreError::NotFound(format!(
                    "no template contribution for subject {subject_pk} in group {group_pk}"
                ))
            })
    }

    async fn list_contributions_by_template(
        &self,
        template_id: TemplateId,
        group_pk: Option<GroupPk>,
    ) -> StoreResult<Vec<TemplateContribution>> {
        let t = self.tables.lock().await;
        Ok(t.contributions
            .values()
            .filter(|c| c.template_id == template_id && group_pk.is_none_or(|g| c.group_pk == g))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MembershipView for InMemoryMembershipStore {
    async fn list_group_memberships(
        &self,
        group_pk: GroupPk,
        before: Option<i64>,
        pagination: Pagination,
    ) -> StoreResult<Vec<Membership>> {
        let t = self.tables.lock().await;
        let merged = t.memberships_where(|_, g| g == group_pk);
        Ok(pagination.slice(
            merged
                .into_values()
                .filter(|m| before.is_none_or(|b| m.is_expired_before(b))),
        ))
    }

    async fn count_group_memberships(
        &self,
        group_pk: GroupPk,
        before: Option<i64>,
    ) -> StoreResult<u64> {
        let t = self.tables.lock().await;
        Ok(t.memberships_where(|_, g| g == group_pk)
            .values()
            .filter(|m| before.is_none_or(|b| m.is_expired_before(b)))
            .count() as u64)
    }

    async fn list_subject_memberships(
        &self,
        subject_pk: SubjectPk,
        before: Option<i64>,
    ) -> StoreResult<Vec<Membership>> {
        let t = self.tables.lock().await;
        Ok(t.memberships_where(|s, _| s == subject_pk)
            .into_values()
            .filter(|m| before.is_none_or(|b| m.is_expired_before(b)))
            .collect())
    }

    async fn get_membership(
        &self,
        subject_pk: SubjectPk,
        group_pk: GroupPk,
    ) -> StoreResult<Option<Membership>> {
        let t = self.tables.lock().await;
        Ok(t.memberships_where(|s, g| s == subject_pk && g == group_pk)
            .into_values()
            .next())
    }

    async fn filter_groups_with_expiring_members(
        &self,
        group_pks: &[GroupPk],
        before: i64,
    ) -> StoreResult<Vec<GroupPk>> {
        let wanted: BTreeSet<GroupPk> = group_pks.iter().copied().collect();
        let t = self.tables.lock().await;
        let expiring: BTreeSet<GroupPk> = t
            .memberships_where(|_, g| wanted.contains(&g))
            .into_values()
            .filter(|m| m.is_expired_before(before))
            .map(|m| m.group_pk)
            .collect();
        Ok(expiring.into_iter().collect())
    }
}
