//! Read side: materialized memberships and expiry queries.

use std::collections::HashMap;

use tracing::{instrument, warn};

use warden_core::member::validate_timestamp;
use warden_core::{
    GroupPk, Membership, MembershipError, MembershipResult, Pagination, Subject, SubjectGroup,
    SubjectMember, SubjectPk, TemplateId, TemplateMember,
};

use super::{GroupController, normalize_groups, validate_template_id};
use crate::store::MembershipStore;

impl<S: MembershipStore> GroupController<S> {
    /// Groups the subject belongs to through any grant, ordered by group key.
    ///
    /// With `before`, only memberships whose merged expiry is earlier.
    #[instrument(skip(self), fields(subject = %subject), err)]
    pub async fn list_subject_groups(
        &self,
        subject: &Subject,
        before: Option<i64>,
    ) -> MembershipResult<Vec<SubjectGroup>> {
        subject.validate_member()?;
        if let Some(before) = before {
            validate_timestamp("before", before)?;
        }

        let subject_pk = self.resolve_subject(subject).await?;
        let memberships = self
            .store
            .list_subject_memberships(subject_pk, before)
            .await?;

        let group_pks: Vec<SubjectPk> = memberships
            .iter()
            .map(|m| SubjectPk::from(m.group_pk))
            .collect();
        let groups = self.store.list_subjects_by_pks(&group_pks).await?;

        Ok(memberships
            .into_iter()
            .filter_map(|m| {
                let Some(group) = groups.get(&SubjectPk::from(m.group_pk)) else {
                    warn!(group_pk = %m.group_pk, "membership references an unknown group");
                    return None;
                };
                Some(SubjectGroup {
                    group: group.clone(),
                    expired_at: m.expired_at,
                    created_at: m.created_at,
                })
            })
            .collect())
    }

    /// Merged expiry of one `(subject, group)` pair.
    #[instrument(skip(self), fields(subject = %subject, group = %group), err)]
    pub async fn get_membership_expired_at(
        &self,
        subject: &Subject,
        group: &Subject,
    ) -> MembershipResult<i64> {
        subject.validate_member()?;
        group.validate_group()?;

        let subject_pk = self.resolve_subject(subject).await?;
        let group_pk = self.resolve_group(group).await?;
        self.store
            .get_membership(subject_pk, group_pk)
            .await?
            .map(|m| m.expired_at)
            .ok_or_else(|| {
                MembershipError::not_found(format!(
                    "{subject} is not a member of group {}",
                    group.id
                ))
            })
    }

    /// One page of a group's members, ordered by subject key.
    #[instrument(skip(self), fields(group = %group), err)]
    pub async fn list_members(
        &self,
        group: &Subject,
        pagination: Pagination,
    ) -> MembershipResult<Vec<SubjectMember>> {
        self.member_page(group, None, pagination).await
    }

    #[instrument(skip(self), fields(group = %group), err)]
    pub async fn count_members(&self, group: &Subject) -> MembershipResult<u64> {
        self.member_count(group, None).await
    }

    /// One page of a group's members whose merged expiry is before `before`.
    #[instrument(skip(self), fields(group = %group), err)]
    pub async fn list_members_before_expiration(
        &self,
        group: &Subject,
        before: i64,
        pagination: Pagination,
    ) -> MembershipResult<Vec<SubjectMember>> {
        validate_timestamp("before", before)?;
        self.member_page(group, Some(before), pagination).await
    }

    #[instrument(skip(self), fields(group = %group), err)]
    pub async fn count_members_before_expiration(
        &self,
        group: &Subject,
        before: i64,
    ) -> MembershipResult<u64> {
        validate_timestamp("before", before)?;
        self.member_count(group, Some(before)).await
    }

    /// Of the candidate groups, those with at least one member expiring before
    /// `before`. Unknown groups are skipped.
    #[instrument(skip(self, groups), fields(count = groups.len()), err)]
    pub async fn filter_subjects_with_expiring_membership(
        &self,
        groups: &[Subject],
        before: i64,
    ) -> MembershipResult<Vec<Subject>> {
        let groups = normalize_groups(groups)?;
        validate_timestamp("before", before)?;
        if groups.is_empty() {
            return Ok(vec![]);
        }

        let by_subject = self.store.list_subject_pks(&groups).await?;
        let by_pk: HashMap<GroupPk, Subject> = by_subject
            .into_iter()
            .map(|(subject, pk)| (GroupPk::from(pk), subject))
            .collect();
        let candidates: Vec<GroupPk> = by_pk.keys().copied().collect();

        let expiring = self
            .store
            .filter_groups_with_expiring_members(&candidates, before)
            .await?;
        Ok(expiring
            .into_iter()
            .filter_map(|pk| by_pk.get(&pk).cloned())
            .collect())
    }

    /// Current contributions of one template, optionally within one group.
    #[instrument(skip(self), fields(template_id = %template_id), err)]
    pub async fn list_template_members(
        &self,
        template_id: TemplateId,
        group: Option<&Subject>,
    ) -> MembershipResult<Vec<TemplateMember>> {
        validate_template_id(template_id)?;
        let group_pk = match group {
            Some(group) => {
                group.validate_group()?;
                Some(self.resolve_group(group).await?)
            }
            None => None,
        };

        let rows = self
            .store
            .list_contributions_by_template(template_id, group_pk)
            .await?;

        let mut pks: Vec<SubjectPk> = rows
            .iter()
            .flat_map(|r| [r.subject_pk, SubjectPk::from(r.group_pk)])
            .collect();
        pks.sort();
        pks.dedup();
        let subjects = self.store.list_subjects_by_pks(&pks).await?;

        Ok(rows
            .into_iter()
            .filter_map(|r| {
                let subject = subjects.get(&r.subject_pk)?;
                let group = subjects.get(&SubjectPk::from(r.group_pk))?;
                Some(TemplateMember {
                    template_id: r.template_id,
                    subject: subject.clone(),
                    group: group.clone(),
                    expired_at: r.expired_at,
                    created_at: r.created_at,
                })
            })
            .collect())
    }

    async fn member_page(
        &self,
        group: &Subject,
        before: Option<i64>,
        pagination: Pagination,
    ) -> MembershipResult<Vec<SubjectMember>> {
        group.validate_group()?;
        pagination.validate(self.paging.max_limit)?;

        let group_pk = self.resolve_group(group).await?;
        let memberships = self
            .store
            .list_group_memberships(group_pk, before, pagination)
            .await?;
        self.with_subjects(memberships).await
    }

    async fn member_count(&self, group: &Subject, before: Option<i64>) -> MembershipResult<u64> {
        group.validate_group()?;
        let group_pk = self.resolve_group(group).await?;
        Ok(self.store.count_group_memberships(group_pk, before).await?)
    }

    async fn with_subjects(
        &self,
        memberships: Vec<Membership>,
    ) -> MembershipResult<Vec<SubjectMember>> {
        let pks: Vec<SubjectPk> = memberships.iter().map(|m| m.subject_pk).collect();
        let subjects = self.store.list_subjects_by_pks(&pks).await?;

        Ok(memberships
            .into_iter()
            .filter_map(|m| {
                let Some(subject) = subjects.get(&m.subject_pk) else {
                    warn!(subject_pk = %m.subject_pk, "membership references an unknown subject");
                    return None;
                };
                Some(SubjectMember {
                    subject: subject.clone(),
                    expired_at: m.expired_at,
                    created_at: m.created_at,
                })
            })
            .collect())
    }
}
