//! Member change requests and their validation.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{MembershipError, MembershipResult};
use crate::subject::Subject;

/// A subject to add to (or renew in) a group, with the requested expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    #[serde(flatten)]
    pub subject: Subject,
    pub expired_at: i64,
}

impl GroupMember {
    pub fn new(subject: Subject, expired_at: i64) -> Self {
        Self {
            subject,
            expired_at,
        }
    }

    pub fn validate(&self) -> MembershipResult<()> {
        self.subject.validate_member()?;
        validate_timestamp("expired_at", self.expired_at)
    }
}

/// How duplicate subjects inside one batch are collapsed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Keep the furthest-future expiry (grants only ever extend).
    KeepLatestExpiry,
    /// Keep the last occurrence (verbatim overwrites).
    KeepLast,
}

/// Validate every member, then collapse duplicates.
///
/// Fails wholesale on the first invalid entry. Output preserves first-seen
/// order.
pub fn normalize_members(
    members: &[GroupMember],
    policy: DuplicatePolicy,
) -> MembershipResult<Vec<GroupMember>> {
    let mut index: HashMap<&Subject, usize> = HashMap::with_capacity(members.len());
    let mut out: Vec<GroupMember> = Vec::with_capacity(members.len());

    for member in members {
        member.validate()?;
        match index.get(&member.subject) {
            Some(&i) => {
                let kept = &mut out[i];
                kept.expired_at = match policy {
                    DuplicatePolicy::KeepLatestExpiry => kept.expired_at.max(member.expired_at),
                    DuplicatePolicy::KeepLast => member.expired_at,
                };
            }
            None => {
                index.insert(&member.subject, out.len());
                out.push(member.clone());
            }
        }
    }

    Ok(out)
}

/// Validate member subjects (no expiry involved), dropping duplicates.
pub fn normalize_subjects(subjects: &[Subject]) -> MembershipResult<Vec<Subject>> {
    let mut seen = HashSet::with_capacity(subjects.len());
    let mut out: Vec<Subject> = Vec::with_capacity(subjects.len());
    for subject in subjects {
        subject.validate_member()?;
        if seen.insert(subject) {
            out.push(subject.clone());
        }
    }
    Ok(out)
}

/// Timestamps are Unix seconds and may lie in the past, but never before the epoch.
pub fn validate_timestamp(field: &str, value: i64) -> MembershipResult<()> {
    if value < 0 {
        return Err(MembershipError::validation(format!(
            "{field} must be a non-negative unix timestamp, got {value}"
        )));
    }
    Ok(())
}
