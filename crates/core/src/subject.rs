//! Subject identities and their closed set of types.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MembershipError, MembershipResult};

/// Longest subject id accepted at the boundary (matches the `subject.id` column).
pub const MAX_SUBJECT_ID_LEN: usize = 64;

/// Kind of identity a subject row represents.
///
/// Groups are stored as subjects too; only users and departments can be
/// members of a group.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectType {
    User,
    Department,
    Group,
}

impl SubjectType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SubjectType::User => "user",
            SubjectType::Department => "department",
            SubjectType::Group => "group",
        }
    }

    /// Whether subjects of this type may hold group membership.
    pub const fn can_be_member(&self) -> bool {
        matches!(self, SubjectType::User | SubjectType::Department)
    }
}

impl core::fmt::Display for SubjectType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubjectType {
    type Err = MembershipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(SubjectType::User),
            "department" => Ok(SubjectType::Department),
            "group" => Ok(SubjectType::Group),
            other => Err(MembershipError::validation(format!(
                "unknown subject type `{other}`"
            ))),
        }
    }
}

/// External identity of a subject: `(type, id)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Subject {
    #[serde(rename = "type")]
    pub subject_type: SubjectType,
    pub id: String,
}

impl Subject {
    pub fn new(subject_type: SubjectType, id: impl Into<String>) -> Self {
        Self {
            subject_type,
            id: id.into(),
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(SubjectType::User, id)
    }

    pub fn department(id: impl Into<String>) -> Self {
        Self::new(SubjectType::Department, id)
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self::new(SubjectType::Group, id)
    }

    /// Build a subject from its wire-level string tag.
    pub fn parse(subject_type: &str, id: impl Into<String>) -> MembershipResult<Self> {
        let subject = Self::new(subject_type.parse()?, id);
        subject.validate_id()?;
        Ok(subject)
    }

    fn validate_id(&self) -> MembershipResult<()> {
        if self.id.trim().is_empty() {
            return Err(MembershipError::validation(format!(
                "{} id must not be empty",
                self.subject_type
            )));
        }
        if self.id.len() > MAX_SUBJECT_ID_LEN {
            return Err(MembershipError::validation(format!(
                "{} id `{}` exceeds {} bytes",
                self.subject_type, self.id, MAX_SUBJECT_ID_LEN
            )));
        }
        Ok(())
    }

    /// Validate a subject that is about to be used as a group member.
    pub fn validate_member(&self) -> MembershipResult<()> {
        if !self.subject_type.can_be_member() {
            return Err(MembershipError::validation(format!(
                "subject type `{}` cannot be a group member",
                self.subject_type
            )));
        }
        self.validate_id()
    }

    /// Validate a subject that is about to be used as a group reference.
    pub fn validate_group(&self) -> MembershipResult<()> {
        if self.subject_type != SubjectType::Group {
            return Err(MembershipError::validation(format!(
                "expected a group, got `{}`",
                self.subject_type
            )));
        }
        self.validate_id()
    }
}

impl core::fmt::Display for Subject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.subject_type, self.id)
    }
}

/// Affected-row counts partitioned by subject type.
///
/// User and department buckets are always present so callers see explicit
/// zeros.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeCount(BTreeMap<SubjectType, u64>);

impl TypeCount {
    pub fn new() -> Self {
        let mut counts = BTreeMap::new();
        counts.insert(SubjectType::User, 0);
        counts.insert(SubjectType::Department, 0);
        Self(counts)
    }

    pub fn increment(&mut self, subject_type: SubjectType) {
        *self.0.entry(subject_type).or_insert(0) += 1;
    }

    pub fn get(&self, subject_type: SubjectType) -> u64 {
        self.0.get(&subject_type).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SubjectType, u64)> + '_ {
        self.0.iter().map(|(t, n)| (*t, *n))
    }
}

impl Default for TypeCount {
    fn default() -> Self {
        Self::new()
    }
}
