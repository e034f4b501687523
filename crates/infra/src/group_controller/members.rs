//! Direct membership changes.

use std::collections::{HashMap, HashSet};

use tracing::{info, instrument};

use warden_core::member::{normalize_members, normalize_subjects};
use warden_core::{
    DirectRelation, DuplicatePolicy, GroupMember, GroupPk, MembershipError, MembershipResult,
    Subject, SubjectPk, TypeCount,
};

use super::{GroupController, Resolution, Resolved};
use crate::store::MembershipStore;

impl<S: MembershipStore> GroupController<S> {
    /// Add members to a group, or extend their direct expiry.
    ///
    /// An existing direct row is only ever extended to the requested expiry,
    /// never shortened. Returns the number of newly created direct rows per
    /// subject type; repeating the call is a no-op.
    #[instrument(skip(self, members), fields(group = %group, count = members.len()), err)]
    pub async fn create_or_update_subject_members(
        &self,
        group: &Subject,
        members: &[GroupMember],
    ) -> MembershipResult<TypeCount> {
        group.validate_group()?;
        let members = normalize_members(members, DuplicatePolicy::KeepLatestExpiry)?;
        if members.is_empty() {
            return Ok(TypeCount::new());
        }

        let group_pk = self.resolve_group(group).await?;
        let resolved = self.resolve_members(members, Resolution::Strict).await?;

        let mut tx = self.store.begin().await?;
        let outcome = self.upsert_direct(&mut tx, group_pk, &resolved).await;
        let created = self
            .settle(tx, outcome, "create_or_update_subject_members")
            .await?;

        info!(group_pk = %group_pk, created = created.total(), "group members added");
        Ok(created)
    }

    async fn upsert_direct(
        &self,
        tx: &mut S::Tx,
        group_pk: GroupPk,
        resolved: &[Resolved<GroupMember>],
    ) -> MembershipResult<TypeCount> {
        self.store.lock_group(tx, group_pk).await?;

        let pks: Vec<SubjectPk> = resolved.iter().map(|r| r.pk).collect();
        let current: HashMap<SubjectPk, i64> = self
            .store
            .list_members_by_group_subjects(tx, group_pk, &pks)
            .await?
            .into_iter()
            .map(|row| (row.subject_pk, row.expired_at))
            .collect();

        let mut created = TypeCount::new();
        let mut writes = Vec::with_capacity(resolved.len());
        for Resolved { item, pk } in resolved {
            match current.get(pk) {
                Some(&expired_at) if expired_at >= item.expired_at => {}
                Some(_) => writes.push(DirectRelation::new(*pk, group_pk, item.expired_at)),
                None => {
                    created.increment(item.subject.subject_type);
                    writes.push(DirectRelation::new(*pk, group_pk, item.expired_at));
                }
            }
        }

        self.store.bulk_upsert_members(tx, &writes).await?;
        Ok(created)
    }

    /// Remove direct membership rows.
    ///
    /// Template contributions are untouched, so a subject may remain a member
    /// through a template. Unknown subjects and absent rows are skipped; the
    /// count covers rows actually deleted.
    #[instrument(skip(self, subjects), fields(group = %group, count = subjects.len()), err)]
    pub async fn delete_subject_members(
        &self,
        group: &Subject,
        subjects: &[Subject],
    ) -> MembershipResult<TypeCount> {
        group.validate_group()?;
        let subjects = normalize_subjects(subjects)?;
        if subjects.is_empty() {
            return Ok(TypeCount::new());
        }

        let group_pk = self.resolve_group(group).await?;
        let resolved = self.resolve_members(subjects, Resolution::Lenient).await?;
        if resolved.is_empty() {
            return Ok(TypeCount::new());
        }

        let mut tx = self.store.begin().await?;
        let outcome = self.delete_direct(&mut tx, group_pk, &resolved).await;
        let deleted = self.settle(tx, outcome, "delete_subject_members").await?;

        info!(group_pk = %group_pk, deleted = deleted.total(), "group members deleted");
        Ok(deleted)
    }

    async fn delete_direct(
        &self,
        tx: &mut S::Tx,
        group_pk: GroupPk,
        resolved: &[Resolved<Subject>],
    ) -> MembershipResult<TypeCount> {
        self.store.lock_group(tx, group_pk).await?;

        let pks: Vec<SubjectPk> = resolved.iter().map(|r| r.pk).collect();
        let existing: HashSet<SubjectPk> = self
            .store
            .list_members_by_group_subjects(tx, group_pk, &pks)
            .await?
            .into_iter()
            .map(|row| row.subject_pk)
            .collect();

        let mut deleted = TypeCount::new();
        let mut pairs = Vec::with_capacity(existing.len());
        for Resolved { item, pk } in resolved {
            if existing.contains(pk) {
                deleted.increment(item.subject_type);
                pairs.push((*pk, group_pk));
            }
        }

        self.store.bulk_delete_members(tx, &pairs).await?;
        Ok(deleted)
    }

    /// Overwrite the direct expiry of existing members verbatim.
    ///
    /// Unlike [`Self::create_or_update_subject_members`] this may shorten a
    /// membership. Subjects without a direct row are skipped; for a subject
    /// repeated in the batch the last entry wins.
    #[instrument(skip(self, members), fields(group = %group, count = members.len()), err)]
    pub async fn update_subject_members_expired_at(
        &self,
        group: &Subject,
        members: &[GroupMember],
    ) -> MembershipResult<()> {
        group.validate_group()?;
        let members = normalize_members(members, DuplicatePolicy::KeepLast)?;
        if members.is_empty() {
            return Ok(());
        }

        let group_pk = self.resolve_group(group).await?;
        let resolved = self.resolve_members(members, Resolution::Lenient).await?;
        if resolved.is_empty() {
            return Ok(());
        }
        let writes: Vec<DirectRelation> = resolved
            .iter()
            .map(|r| DirectRelation::new(r.pk, group_pk, r.item.expired_at))
            .collect();

        let mut tx = self.store.begin().await?;
        let outcome = async {
            self.store.lock_group(&mut tx, group_pk).await?;
            let updated = self.store.bulk_update_member_expired_at(&mut tx, &writes).await?;
            Ok::<_, MembershipError>(updated)
        }
        .await;
        let updated = self
            .settle(tx, outcome, "update_subject_members_expired_at")
            .await?;

        info!(group_pk = %group_pk, updated, "group member expiry updated");
        Ok(())
    }
}
