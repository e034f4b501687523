//! Template-sourced membership.
//!
//! A subject template grants its subjects membership of a group through the
//! contribution ledger only. Revoking a template removes just its own
//! contributions; the membership survives while a direct row or another
//! template still justifies it.

use std::collections::{HashMap, HashSet};

use tracing::{info, instrument};

use warden_core::member::{normalize_members, normalize_subjects};
use warden_core::{
    ContributionKey, DuplicatePolicy, GroupMember, GroupPk, MembershipError, MembershipResult,
    NewTemplateContribution, Subject, SubjectPk, TemplateId, TypeCount,
};

use super::{GroupController, Resolution, Resolved, RevokeSummary, validate_template_id};
use crate::store::MembershipStore;

fn contribution(
    pk: SubjectPk,
    template_id: TemplateId,
    group_pk: GroupPk,
    expired_at: i64,
) -> NewTemplateContribution {
    NewTemplateContribution {
        subject_pk: pk,
        template_id,
        group_pk,
        expired_at,
    }
}

impl<S: MembershipStore> GroupController<S> {
    /// Grant group membership to a template's subjects.
    ///
    /// Existing contributions of this template are extended to the requested
    /// expiry (never shortened); missing ones are created. Returns the number
    /// of newly created contributions per subject type.
    #[instrument(
        skip(self, members),
        fields(template_id = %template_id, group = %group, count = members.len()),
        err
    )]
    pub async fn apply_template_grant(
        &self,
        template_id: TemplateId,
        group: &Subject,
        members: &[GroupMember],
    ) -> MembershipResult<TypeCount> {
        validate_template_id(template_id)?;
        group.validate_group()?;
        let members = normalize_members(members, DuplicatePolicy::KeepLatestExpiry)?;
        if members.is_empty() {
            return Ok(TypeCount::new());
        }

        let group_pk = self.resolve_group(group).await?;
        let resolved = self.resolve_members(members, Resolution::Strict).await?;

        let mut tx = self.store.begin().await?;
        let outcome = self
            .grant_contributions(&mut tx, template_id, group_pk, &resolved)
            .await;
        let created = self.settle(tx, outcome, "apply_template_grant").await?;

        info!(
            template_id = %template_id,
            group_pk = %group_pk,
            created = created.total(),
            "template grant applied"
        );
        Ok(created)
    }

    async fn grant_contributions(
        &self,
        tx: &mut S::Tx,
        template_id: TemplateId,
        group_pk: GroupPk,
        resolved: &[Resolved<GroupMember>],
    ) -> MembershipResult<TypeCount> {
        self.store.lock_group(tx, group_pk).await?;

        let pks: Vec<SubjectPk> = resolved.iter().map(|r| r.pk).collect();
        let current: HashMap<SubjectPk, i64> = self
            .store
            .list_contributions_by_template_group_subjects(tx, template_id, group_pk, &pks)
            .await?
            .into_iter()
            .map(|row| (row.subject_pk, row.expired_at))
            .collect();

        let mut created = TypeCount::new();
        let mut creates = Vec::new();
        let mut extends = Vec::new();
        for Resolved { item, pk } in resolved {
            let row = contribution(*pk, template_id, group_pk, item.expired_at);
            match current.get(pk) {
                Some(&expired_at) if expired_at >= item.expired_at => {}
                Some(_) => extends.push(row),
                None => {
                    created.increment(item.subject.subject_type);
                    creates.push(row);
                }
            }
        }

        self.store
            .bulk_update_contribution_expired_at(tx, &extends)
            .await?;
        self.store.bulk_create_contributions(tx, &creates).await?;
        Ok(created)
    }

    /// Overwrite the expiry of one template's contributions verbatim.
    ///
    /// Only rows of `template_id` are touched; subjects without a
    /// contribution are skipped and the last entry wins for repeats.
    #[instrument(
        skip(self, members),
        fields(template_id = %template_id, group = %group, count = members.len()),
        err
    )]
    pub async fn update_template_grant_expired_at(
        &self,
        template_id: TemplateId,
        group: &Subject,
        members: &[GroupMember],
    ) -> MembershipResult<()> {
        validate_template_id(template_id)?;
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
        let rows: Vec<NewTemplateContribution> = resolved
            .iter()
            .map(|r| contribution(r.pk, template_id, group_pk, r.item.expired_at))
            .collect();

        let mut tx = self.store.begin().await?;
        let outcome = async {
            self.store.lock_group(&mut tx, group_pk).await?;
            let updated = self
                .store
                .bulk_update_contribution_expired_at(&mut tx, &rows)
                .await?;
            Ok::<_, MembershipError>(updated)
        }
        .await;
        let updated = self
            .settle(tx, outcome, "update_template_grant_expired_at")
            .await?;

        info!(template_id = %template_id, group_pk = %group_pk, updated, "template grant renewed");
        Ok(())
    }

    /// Withdraw a template's grant from the given subjects.
    ///
    /// Deletes only this template's contributions. A membership disappears
    /// only when neither a direct row nor another template still grants it;
    /// those are reported in [`RevokeSummary::removed`].
    #[instrument(
        skip(self, subjects),
        fields(template_id = %template_id, group = %group, count = subjects.len()),
        err
    )]
    pub async fn revoke_template_grant(
        &self,
        template_id: TemplateId,
        group: &Subject,
        subjects: &[Subject],
    ) -> MembershipResult<RevokeSummary> {
        validate_template_id(template_id)?;
        group.validate_group()?;
        let subjects = normalize_subjects(subjects)?;
        if subjects.is_empty() {
            return Ok(RevokeSummary::default());
        }

        let group_pk = self.resolve_group(group).await?;
        let resolved = self.resolve_members(subjects, Resolution::Lenient).await?;
        if resolved.is_empty() {
            return Ok(RevokeSummary::default());
        }

        let mut tx = self.store.begin().await?;
        let outcome = self
            .revoke_contributions(&mut tx, template_id, group_pk, &resolved)
            .await;
        let summary = self.settle(tx, outcome, "revoke_template_grant").await?;

        info!(
            template_id = %template_id,
            group_pk = %group_pk,
            revoked = summary.revoked.total(),
            removed = summary.removed.total(),
            "template grant revoked"
        );
        Ok(summary)
    }

    async fn revoke_contributions(
        &self,
        tx: &mut S::Tx,
        template_id: TemplateId,
        group_pk: GroupPk,
        resolved: &[Resolved<Subject>],
    ) -> MembershipResult<RevokeSummary> {
        self.store.lock_group(tx, group_pk).await?;

        let pks: Vec<SubjectPk> = resolved.iter().map(|r| r.pk).collect();
        let granted: HashSet<SubjectPk> = self
            .store
            .list_contributions_by_template_group_subjects(tx, template_id, group_pk, &pks)
            .await?
            .into_iter()
            .map(|row| row.subject_pk)
            .collect();

        let revoked: Vec<&Resolved<Subject>> =
            resolved.iter().filter(|r| granted.contains(&r.pk)).collect();
        let keys: Vec<ContributionKey> = revoked
            .iter()
            .map(|r| ContributionKey {
                subject_pk: r.pk,
                template_id,
                group_pk,
            })
            .collect();
        self.store.bulk_delete_contributions(tx, &keys).await?;

        // Delete first, then check what still justifies each pair.
        let mut summary = RevokeSummary::default();
        for r in revoked {
            summary.revoked.increment(r.item.subject_type);
            let still_granted = self
                .store
                .has_relation_except_template(tx, r.pk, group_pk, template_id)
                .await?
                || self.store.member_exists(tx, r.pk, group_pk).await?;
            if !still_granted {
                summary.removed.increment(r.item.subject_type);
            }
        }
        Ok(summary)
    }
}
