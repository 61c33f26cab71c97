//! Container ids and db names.
//!
//! Container ids end up as directory names and storage key prefixes, db names
//! as file name stems, on every platform a container may be synchronized to.
//! Both are validated once, at construction, and are immutable afterwards.

use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use crate::error::{Error, ErrorKind, Result};

static CONTAINER_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").unwrap());
static DIGITS_AND_HYPHENS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9-]+$").unwrap());

const CONTAINER_ID_LEN: std::ops::RangeInclusive<usize> = 3..=63;
const DB_NAME_MAX_LEN: usize = 255;
const DB_NAME_FORBIDDEN: &[char] = &['/', '\\', '"', ':', '.', '?', '*', '|', '<', '>'];
const RESERVED_NAMES: &[&str] = &[
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8", "com9", "lpt1", "lpt2",
    "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

/// A validated container id.
///
/// 3 to 63 lowercase letters, digits and single hyphens, neither starting
/// nor ending with a hyphen. Any well-formed GUID is accepted as is.
///
/// ```
/// use stow_workspace::ContainerId;
/// assert!(ContainerId::new("fonts-02").is_ok());
/// assert!(ContainerId::new("5A08A5D0-B8B5-4BB7-9D1C-3F0C2C6F4A11").is_ok());
/// assert!(ContainerId::new("-leading-dash").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if uuid::Uuid::try_parse(&id).is_ok() {
            return Ok(Self(id));
        }
        let invalid = |reason| Err(Error::from(ErrorKind::InvalidContainerId { id: id.clone(), reason }));
        if !CONTAINER_ID_LEN.contains(&id.len()) {
            return invalid("must be between 3 and 63 characters");
        }
        if !CONTAINER_ID.is_match(&id) {
            return invalid("may only contain lowercase letters, digits and single hyphens, and may not start or end with a hyphen");
        }
        if id.contains('-') && DIGITS_AND_HYPHENS.is_match(&id) {
            return invalid("looks like a malformed GUID");
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A validated workspace db name.
///
/// 1 to 255 characters, no path separators, quotes, colons, dots, wildcards
/// or control characters, no leading or trailing whitespace, and not a
/// reserved device name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DbName(String);

impl DbName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let invalid = |reason| Err(Error::from(ErrorKind::InvalidDbName { name: name.clone(), reason }));
        if name.is_empty() || name.len() > DB_NAME_MAX_LEN {
            return invalid("must be between 1 and 255 characters");
        }
        if name.chars().any(|c| c.is_control()) {
            return invalid("may not contain control characters");
        }
        if name.contains(DB_NAME_FORBIDDEN) {
            return invalid("may not contain any of / \\ \" : . ? * | < >");
        }
        if name.trim() != name {
            return invalid("may not start or end with whitespace");
        }
        if RESERVED_NAMES.contains(&name.to_ascii_lowercase().as_str()) {
            return invalid("is a reserved device name");
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! impl_name_traits {
    ($name:ident) => {
        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::new(s)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = Error;

            fn try_from(s: &str) -> Result<Self> {
                Self::new(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

impl_name_traits!(ContainerId);
impl_name_traits!(DbName);

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("abc")]
    #[case("fonts-02")]
    #[case("a1-b2-c3")]
    #[case("2024")]
    #[case("5a08a5d0-b8b5-4bb7-9d1c-3f0c2c6f4a11")]
    #[case("5A08A5D0-B8B5-4BB7-9D1C-3F0C2C6F4A11")]
    fn test_valid_container_ids(#[case] id: &str) {
        assert_eq!(ContainerId::new(id).unwrap().as_str(), id);
    }

    #[rstest]
    #[case("")]
    #[case("  ")]
    #[case("12")]
    #[case("a\\b")]
    #[case("a\"b")]
    #[case("a:b")]
    #[case("a.b")]
    #[case("a?b")]
    #[case("a*b")]
    #[case("a|b")]
    #[case("123--4")]
    #[case("12-34")]
    #[case("Abc")]
    #[case("return\r")]
    #[case("newline\n")]
    #[case("-leading-dash")]
    #[case("trailing-dash-")]
    fn test_invalid_container_ids(#[case] id: &str) {
        let err = ContainerId::new(id).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidContainerId { .. }));
        assert!((*err).to_string().contains("containerId"));
    }

    #[rstest]
    #[case("fonts")]
    #[case("a")]
    #[case("Styles And Stuff")]
    #[case("base-1")]
    #[case("5a08a5d0-b8b5-4bb7-9d1c-3f0c2c6f4a11")]
    #[case("console")]
    fn test_valid_db_names(#[case] name: &str) {
        assert_eq!(DbName::new(name).unwrap().to_string(), name);
    }

    #[rstest]
    #[case("")]
    #[case("  ")]
    #[case("1/2")]
    #[case("a\\b")]
    #[case("a\"b")]
    #[case("base:1.2.3")]
    #[case("a:b")]
    #[case("a.b")]
    #[case("a?b")]
    #[case("a*b")]
    #[case("a|b")]
    #[case("con")]
    #[case("PRN")]
    #[case("\r")]
    #[case("\n")]
    #[case(" leading space")]
    #[case("trailing space ")]
    fn test_invalid_db_names(#[case] name: &str) {
        let err = DbName::new(name).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidDbName { .. }));
        assert!((*err).to_string().contains("dbName"));
    }

    #[test]
    fn test_length_limits() {
        assert!(ContainerId::new("a".repeat(63)).is_ok());
        assert!(ContainerId::new("a".repeat(64)).is_err());
        assert!(DbName::new("a".repeat(255)).is_ok());
        assert!(DbName::new("a".repeat(256)).is_err());
    }
}
