//! Membership storage boundary.
//!
//! The traits in [`r#trait`] describe the two ledgers, the materialized view
//! over them and the identity lookups the controller needs. Backends:
//! in-memory (tests/dev) and Postgres.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{InMemoryMembershipStore, InMemoryTransaction};
pub use postgres::{PostgresMembershipStore, PostgresTransaction};
pub use r#trait::{
    DirectLedger, MembershipStore, MembershipView, StoreError, StoreResult, StoreTransaction,
    SubjectDirectory, TemplateLedger, Transactional,
};
