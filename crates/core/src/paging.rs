//! Paging parameters shared by every list operation.

use serde::{Deserialize, Serialize};

use crate::error::{MembershipError, MembershipResult};

pub const DEFAULT_PAGE_LIMIT: u32 = 50;
pub const MAX_PAGE_LIMIT: u32 = 1000;

/// Limit/offset window over a stably ordered result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of rows to return.
    pub limit: u32,
    /// Number of rows to skip (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

impl Pagination {
    /// Build a page window, rejecting a zero limit or one above `max_limit`.
    pub fn new(limit: u32, offset: u32, max_limit: u32) -> MembershipResult<Self> {
        if limit == 0 {
            return Err(MembershipError::validation("page limit must be positive"));
        }
        if limit > max_limit {
            return Err(MembershipError::validation(format!(
                "page limit {limit} exceeds maximum {max_limit}"
            )));
        }
        Ok(Self { limit, offset })
    }

    /// Window with the default limit cap.
    pub fn page(limit: u32, offset: u32) -> MembershipResult<Self> {
        Self::new(limit, offset, MAX_PAGE_LIMIT)
    }

    pub fn validate(&self, max_limit: u32) -> MembershipResult<()> {
        Self::new(self.limit, self.offset, max_limit).map(|_| ())
    }

    /// Apply the window to an already ordered iterator.
    pub fn slice<T>(&self, items: impl IntoIterator<Item = T>) -> Vec<T> {
        items
            .into_iter()
            .skip(self.offset as usize)
            .take(self.limit as usize)
            .collect()
    }
}
