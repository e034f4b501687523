//! Ledger rows and the read-time membership merge.
//!
//! A `(subject, group)` pair can be justified by one direct relation and any
//! number of template contributions. The externally visible membership exists
//! iff at least one of those rows exists, and expires at the latest of them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{GroupPk, SubjectPk, TemplateId};
use crate::subject::Subject;

/// Conventional "never expires" timestamp (2100-01-01T00:00:00Z).
pub const PERMANENT_EXPIRED_AT: i64 = 4_102_444_800;

/// Row of the direct membership ledger (`group_member`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectRelation {
    pub subject_pk: SubjectPk,
    pub group_pk: GroupPk,
    pub expired_at: i64,
}

impl DirectRelation {
    pub fn new(subject_pk: SubjectPk, group_pk: GroupPk, expired_at: i64) -> Self {
        Self {
            subject_pk,
            group_pk,
            expired_at,
        }
    }
}

/// Direct relation as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDirectRelation {
    pub subject_pk: SubjectPk,
    pub group_pk: GroupPk,
    pub expired_at: i64,
    pub created_at: DateTime<Utc>,
}

/// Template contribution that has not been written yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTemplateContribution {
    pub subject_pk: SubjectPk,
    pub template_id: TemplateId,
    pub group_pk: GroupPk,
    pub expired_at: i64,
}

/// Row of the template contribution ledger (`subject_template_group`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateContribution {
    pub pk: i64,
    pub subject_pk: SubjectPk,
    pub template_id: TemplateId,
    pub group_pk: GroupPk,
    pub expired_at: i64,
    pub created_at: DateTime<Utc>,
}

/// Exact key of a template contribution.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContributionKey {
    pub subject_pk: SubjectPk,
    pub template_id: TemplateId,
    pub group_pk: GroupPk,
}

impl NewTemplateContribution {
    pub fn key(&self) -> ContributionKey {
        ContributionKey {
            subject_pk: self.subject_pk,
            template_id: self.template_id,
            group_pk: self.group_pk,
        }
    }
}

impl TemplateContribution {
    pub fn key(&self) -> ContributionKey {
        ContributionKey {
            subject_pk: self.subject_pk,
            template_id: self.template_id,
            group_pk: self.group_pk,
        }
    }
}

/// Materialized membership of one `(subject, group)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub subject_pk: SubjectPk,
    pub group_pk: GroupPk,
    /// Latest expiry across all contributing rows.
    pub expired_at: i64,
    /// Earliest creation across all contributing rows.
    pub created_at: DateTime<Utc>,
}

impl Membership {
    fn absorb(&mut self, expired_at: i64, created_at: DateTime<Utc>) {
        self.expired_at = self.expired_at.max(expired_at);
        self.created_at = self.created_at.min(created_at);
    }

    pub fn is_expired_before(&self, before: i64) -> bool {
        self.expired_at < before
    }
}

/// Merge the expiries of every grant for a single pair.
///
/// Returns `None` when nothing grants the pair.
pub fn merge_expired_at(
    direct: Option<i64>,
    templates: impl IntoIterator<Item = i64>,
) -> Option<i64> {
    templates.into_iter().chain(direct).max()
}

/// Merge ledger rows into materialized memberships keyed by `(group, subject)`.
///
/// The key order makes a group's members contiguous and sorted by subject,
/// which is the paging order used everywhere.
pub fn materialize<'a>(
    direct: impl IntoIterator<Item = &'a StoredDirectRelation>,
    templates: impl IntoIterator<Item = &'a TemplateContribution>,
) -> BTreeMap<(GroupPk, SubjectPk), Membership> {
    let mut merged: BTreeMap<(GroupPk, SubjectPk), Membership> = BTreeMap::new();

    let rows = direct
        .into_iter()
        .map(|r| (r.subject_pk, r.group_pk, r.expired_at, r.created_at))
        .chain(
            templates
                .into_iter()
                .map(|r| (r.subject_pk, r.group_pk, r.expired_at, r.created_at)),
        );

    for (subject_pk, group_pk, expired_at, created_at) in rows {
        merged
            .entry((group_pk, subject_pk))
            .and_modify(|m| m.absorb(expired_at, created_at))
            .or_insert(Membership {
                subject_pk,
                group_pk,
                expired_at,
                created_at,
            });
    }

    merged
}

/// A group's member, as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectMember {
    #[serde(flatten)]
    pub subject: Subject,
    pub expired_at: i64,
    pub created_at: DateTime<Utc>,
}

/// A group a subject belongs to, as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectGroup {
    #[serde(flatten)]
    pub group: Subject,
    pub expired_at: i64,
    pub created_at: DateTime<Utc>,
}

/// A template's contribution, as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateMember {
    pub template_id: TemplateId,
    #[serde(flatten)]
    pub subject: Subject,
    pub group: Subject,
    pub expired_at: i64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn direct(subject: i64, group: i64, expired_at: i64, created: i64) -> StoredDirectRelation {
        StoredDirectRelation {
            subject_pk: SubjectPk::new(subject),
            group_pk: GroupPk::new(group),
            expired_at,
            created_at: at(created),
        }
    }

    fn contribution(
        pk: i64,
        subject: i64,
        template: i64,
        group: i64,
        expired_at: i64,
    ) -> TemplateContribution {
        TemplateContribution {
            pk,
            subject_pk: SubjectPk::new(subject),
            template_id: TemplateId::new(template),
            group_pk: GroupPk::new(group),
            expired_at,
            created_at: at(pk),
        }
    }

    #[test]
    fn direct_and_template_rows_merge_to_the_latest_expiry() {
        let d = [direct(5, 100, 1000, 10)];
        let t = [contribution(1, 5, 7, 100, 2000)];

        let merged = materialize(&d, &t);
        let m = &merged[&(GroupPk::new(100), SubjectPk::new(5))];
        assert_eq!(m.expired_at, 2000);
        assert_eq!(m.created_at, at(1));
    }

    #[test]
    fn pairs_stay_separate() {
        let d = [direct(5, 100, 1000, 10), direct(6, 100, 500, 10)];
        let t = [contribution(1, 5, 7, 101, 2000)];

        let merged = materialize(&d, &t);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[&(GroupPk::new(100), SubjectPk::new(6))].expired_at, 500);
        assert_eq!(merged[&(GroupPk::new(101), SubjectPk::new(5))].expired_at, 2000);
    }

    #[test]
    fn nothing_granted_means_no_membership() {
        assert_eq!(merge_expired_at(None, []), None);
        let no_direct: Vec<StoredDirectRelation> = Vec::new();
        let no_templates: Vec<TemplateContribution> = Vec::new();
        assert!(materialize(&no_direct, &no_templates).is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: the merged expiry is the max over every contributing row,
        /// and a membership exists iff at least one row contributes.
        #[test]
        fn merged_expiry_is_max_of_contributions(
            d in proptest::option::of(0i64..PERMANENT_EXPIRED_AT),
            ts in prop::collection::vec(0i64..PERMANENT_EXPIRED_AT, 0..8)
        ) {
            let direct_rows: Vec<_> = d.iter().map(|e| direct(5, 100, *e, 0)).collect();
            let template_rows: Vec<_> = ts
                .iter()
                .enumerate()
                .map(|(i, e)| contribution(i as i64 + 1, 5, i as i64 + 1, 100, *e))
                .collect();

            let expected = ts.iter().copied().chain(d).max();
            prop_assert_eq!(merge_expired_at(d, ts.iter().copied()), expected);

            let merged = materialize(&direct_rows, &template_rows);
            let key = (GroupPk::new(100), SubjectPk::new(5));
            prop_assert_eq!(merged.get(&key).map(|m| m.expired_at), expected);
            prop_assert_eq!(merged.contains_key(&key), d.is_some() || !ts.is_empty());
        }
    }
}
