//! Infrastructure layer: membership stores, Postgres bootstrap, config and
//! the group controller that orchestrates them.

pub mod config;
pub mod db;
pub mod group_controller;
pub mod schema;
pub mod store;

mod integration_tests;

pub use config::{ConfigError, PagingConfig, StoreConfig, WardenConfig};
pub use group_controller::{GroupController, RevokeSummary};
pub use store::{
    InMemoryMembershipStore, MembershipStore, PostgresMembershipStore, StoreError, StoreResult,
};
