//! `warden-core`: membership domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! subject typing, ledger rows, the membership merge and input validation.

pub mod error;
pub mod id;
pub mod member;
pub mod paging;
pub mod relation;
pub mod subject;

pub use error::{MembershipError, MembershipResult};
pub use id::{GroupPk, SubjectPk, TemplateId};
pub use member::{DuplicatePolicy, GroupMember};
pub use paging::Pagination;
pub use relation::{
    ContributionKey, DirectRelation, Membership, NewTemplateContribution, StoredDirectRelation,
    SubjectGroup, SubjectMember, TemplateContribution, TemplateMember, PERMANENT_EXPIRED_AT,
};
pub use subject::{Subject, SubjectType, TypeCount};
