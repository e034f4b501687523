//! Strongly-typed store keys used across the engine.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::MembershipError;

/// Internal key of a subject row (user or department).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectPk(i64);

/// Internal key of a group. Groups live in the subject table, so this shares
/// the key space of [`SubjectPk`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupPk(i64);

/// Identifier of a subject template.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateId(i64);

macro_rules! impl_i64_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            pub const fn get(&self) -> i64 {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<i64> for $t {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$t> for i64 {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = MembershipError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let value = i64::from_str(s)
                    .map_err(|e| MembershipError::validation(format!("{}: {}", $name, e)))?;
                Ok(Self(value))
            }
        }
    };
}

impl_i64_newtype!(SubjectPk, "SubjectPk");
impl_i64_newtype!(GroupPk, "GroupPk");
impl_i64_newtype!(TemplateId, "TemplateId");

impl From<SubjectPk> for GroupPk {
    fn from(pk: SubjectPk) -> Self {
        Self(pk.0)
    }
}

impl From<GroupPk> for SubjectPk {
    fn from(pk: GroupPk) -> Self {
        Self(pk.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays() {
        let pk: TemplateId = "42".parse().unwrap();
        assert_eq!(pk.get(), 42);
        assert_eq!(pk.to_string(), "42");
    }

    #[test]
    fn rejects_non_numeric_keys() {
        let err = "abc".parse::<SubjectPk>().unwrap_err();
        assert!(matches!(err, MembershipError::Validation(msg) if msg.starts_with("SubjectPk")));
    }

    #[test]
    fn group_and_subject_keys_share_a_key_space() {
        let subject = SubjectPk::new(100);
        assert_eq!(GroupPk::from(subject), GroupPk::new(100));
        assert_eq!(SubjectPk::from(GroupPk::new(7)), SubjectPk::new(7));
    }
}
