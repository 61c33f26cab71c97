//! Semantic version ranges.
//!
//! Ranges follow the npm grammar rather than Cargo's: a bare `1.2.0` means
//! exactly that version, `1.2` means any `1.2.x`, and prerelease versions only
//! match when asked for. The set of accepted forms:
//!
//! | Form              | Meaning                                  |
//! |-------------------|------------------------------------------|
//! | `*`, `x`, empty   | any version                              |
//! | `1`, `1.x`        | `>=1.0.0 <2.0.0-0`                        |
//! | `1.2`, `1.2.x`    | `>=1.2.0 <1.3.0-0`                        |
//! | `1.2.3`, `=1.2.3` | exactly `1.2.3`                          |
//! | `~1.2.3`          | `>=1.2.3 <1.3.0-0`                        |
//! | `^1.2.3`          | `>=1.2.3 <2.0.0-0` (`^0.2.3` → `<0.3.0-0`) |
//! | `1.2 - 2.3.4`     | `>=1.2.0 <=2.3.4`                         |
//! | `<`, `<=`, `>`, `>=` | comparisons, with partial versions     |
//!
//! Whitespace joins comparators (all must match), `||` separates
//! alternatives (any may match).

use semver::{BuildMetadata, Prerelease, Version};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use crate::error::{ErrorKind, Result};

// `X.Y.Z-0` is the lowest version with core `X.Y.Z`; exclusive upper bounds
// use it so `<2.0.0-0` also shuts out `2.0.0-alpha`.
static LOWEST_PRERELEASE: LazyLock<Prerelease> = LazyLock::new(|| Prerelease::new("0").unwrap_or(Prerelease::EMPTY));

/// Parse a loosely written version into a strict one.
///
/// Accepts a leading `v` or `=`, and pads `MAJOR` and `MAJOR.MINOR` with
/// zeros. Build metadata is dropped since it takes no part in ordering.
///
/// ```
/// use stow_resource::normalize_version;
/// assert_eq!(normalize_version("v1.2.4").unwrap().to_string(), "1.2.4");
/// assert_eq!(normalize_version("1.2").unwrap().to_string(), "1.2.0");
/// assert_eq!(normalize_version("3").unwrap().to_string(), "3.0.0");
/// assert!(normalize_version("badname").is_err());
/// ```
pub fn normalize_version(input: &str) -> Result<Version> {
    let trimmed = input.trim();
    let bare = trimmed.strip_prefix(['v', 'V', '=']).unwrap_or(trimmed);
    if let Ok(mut version) = Version::parse(bare) {
        version.build = BuildMetadata::EMPTY;
        return Ok(version);
    }
    let parts: Vec<&str> = bare.split('.').collect();
    if !(1..=2).contains(&parts.len()) {
        exn::bail!(ErrorKind::InvalidVersion(input.to_string()));
    }
    let mut numbers = [0u64; 2];
    for (slot, part) in numbers.iter_mut().zip(&parts) {
        *slot = parse_number(part).ok_or_else(|| exn::Exn::from(ErrorKind::InvalidVersion(input.to_string())))?;
    }
    Ok(Version::new(numbers[0], numbers[1], 0))
}

fn parse_number(part: &str) -> Option<u64> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) || (part.len() > 1 && part.starts_with('0')) {
        return None;
    }
    part.parse().ok()
}

/// Compare two versions by semver precedence, ignoring build metadata.
pub fn cmp_precedence(a: &Version, b: &Version) -> Ordering {
    (a.major, a.minor, a.patch).cmp(&(b.major, b.minor, b.patch)).then_with(|| a.pre.cmp(&b.pre))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Comparator {
    op: Op,
    version: Version,
}

impl Comparator {
    fn new(op: Op, version: Version) -> Self {
        Self { op, version }
    }

    /// A comparator that no version satisfies.
    fn never() -> Self {
        Self::new(Op::Lt, bound(0, 0, 0))
    }

    fn matches(&self, version: &Version) -> bool {
        let ord = cmp_precedence(version, &self.version);
        match self.op {
            Op::Lt => ord == Ordering::Less,
            Op::Le => ord != Ordering::Greater,
            Op::Gt => ord == Ordering::Greater,
            Op::Ge => ord != Ordering::Less,
            Op::Eq => ord == Ordering::Equal,
        }
    }
}

fn bound(major: u64, minor: u64, patch: u64) -> Version {
    let mut version = Version::new(major, minor, patch);
    version.pre = LOWEST_PRERELEASE.clone();
    version
}

/// A possibly incomplete version as written inside a range.
#[derive(Debug, Default)]
struct Partial {
    major: Option<u64>,
    minor: Option<u64>,
    patch: Option<u64>,
    pre: Prerelease,
}

impl Partial {
    fn parse(input: &str) -> Option<Self> {
        let input = input.strip_prefix(['v', 'V', '=']).unwrap_or(input);
        let input = input.split_once('+').map_or(input, |(core, _build)| core);
        let (core, pre) = match input.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (input, None),
        };
        let mut numbers = [None; 3];
        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() > 3 {
            return None;
        }
        let mut wildcard = false;
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            if matches!(*part, "x" | "X" | "*") {
                wildcard = true;
                continue;
            }
            // `1.x.3` is not a thing.
            if wildcard {
                return None;
            }
            *slot = Some(parse_number(part)?);
        }
        let pre = match pre {
            Some(pre) if numbers.iter().all(Option::is_some) => Prerelease::new(pre).ok()?,
            Some(_) => return None,
            None => Prerelease::EMPTY,
        };
        Some(Self { major: numbers[0], minor: numbers[1], patch: numbers[2], pre })
    }

    fn floor(&self) -> Version {
        let mut version = Version::new(self.major.unwrap_or(0), self.minor.unwrap_or(0), self.patch.unwrap_or(0));
        version.pre = self.pre.clone();
        version
    }

    /// The comparators for a primitive range: `op` applied to this version.
    ///
    /// `None` when an upper bound would not fit in a version component.
    fn desugar(self, op: &str) -> Option<Vec<Comparator>> {
        let floor = self.floor();
        let next = |n: u64| n.checked_add(1);
        let comparators = match (op, self.major, self.minor, self.patch) {
            ("" | "=", None, ..) | (">=" | "<=" | "~" | "^", None, ..) => vec![],
            ("" | "=", Some(_), Some(_), Some(_)) => vec![Comparator::new(Op::Eq, floor)],
            ("" | "=" | "~" | "^", Some(major), None, _) => {
                vec![Comparator::new(Op::Ge, floor), Comparator::new(Op::Lt, bound(next(major)?, 0, 0))]
            },
            ("" | "=" | "~", Some(major), Some(minor), _) => {
                vec![Comparator::new(Op::Ge, floor), Comparator::new(Op::Lt, bound(major, next(minor)?, 0))]
            },
            ("^", Some(major), Some(minor), patch) => {
                let upper = match (major, minor, patch) {
                    (0, 0, Some(patch)) => bound(0, 0, next(patch)?),
                    (0, minor, _) => bound(0, next(minor)?, 0),
                    (major, ..) => bound(next(major)?, 0, 0),
                };
                vec![Comparator::new(Op::Ge, floor), Comparator::new(Op::Lt, upper)]
            },
            (">", None, ..) | ("<", None, ..) => vec![Comparator::never()],
            (">", Some(_), Some(_), Some(_)) => vec![Comparator::new(Op::Gt, floor)],
            (">", Some(major), Some(minor), None) => vec![Comparator::new(Op::Ge, Version::new(major, next(minor)?, 0))],
            (">", Some(major), None, _) => vec![Comparator::new(Op::Ge, Version::new(next(major)?, 0, 0))],
            (">=", Some(_), ..) => vec![Comparator::new(Op::Ge, floor)],
            ("<", Some(_), Some(_), Some(_)) => vec![Comparator::new(Op::Lt, floor)],
            ("<", Some(major), minor, None) => vec![Comparator::new(Op::Lt, bound(major, minor.unwrap_or(0), 0))],
            ("<=", Some(_), Some(_), Some(_)) => vec![Comparator::new(Op::Le, floor)],
            ("<=", Some(major), Some(minor), None) => vec![Comparator::new(Op::Lt, bound(major, next(minor)?, 0))],
            ("<=", Some(major), None, _) => vec![Comparator::new(Op::Lt, bound(next(major)?, 0, 0))],
            _ => vec![Comparator::never()],
        };
        Some(comparators)
    }

    /// Upper end of a hyphen range, `A - B`.
    fn hyphen_upper(self) -> Option<Vec<Comparator>> {
        self.desugar("<=")
    }
}

const OPERATORS: [&str; 8] = [">=", "<=", "~>", ">", "<", "=", "~", "^"];

fn split_operator(token: &str) -> (&str, &str) {
    for op in OPERATORS {
        if let Some(rest) = token.strip_prefix(op) {
            return (if op == "~>" { "~" } else { op }, rest.trim_start());
        }
    }
    ("", token)
}

/// A set of version requirements in npm range syntax.
///
/// ```
/// use stow_resource::VersionRange;
/// use semver::Version;
///
/// let range: VersionRange = "~1.1.0".parse().unwrap();
/// assert!(range.matches(&Version::parse("1.1.3").unwrap(), false));
/// assert!(!range.matches(&Version::parse("1.2.0").unwrap(), false));
/// // Prereleases are opt-in.
/// assert!(!range.matches(&Version::parse("1.1.4-beta").unwrap(), false));
/// assert!(range.matches(&Version::parse("1.1.4-beta").unwrap(), true));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
    source: String,
    alternatives: Vec<Vec<Comparator>>,
}

impl VersionRange {
    /// The range that every release version satisfies.
    pub fn any() -> Self {
        Self { source: "*".to_string(), alternatives: vec![vec![]] }
    }

    pub fn parse(input: &str) -> Result<Self> {
        let source = input.trim();
        let invalid = || exn::Exn::from(ErrorKind::InvalidRange(input.to_string()));
        let mut alternatives = Vec::new();
        for alternative in source.split("||") {
            let alternative = alternative.trim();
            let mut comparators = Vec::new();
            if let Some((low, high)) = alternative.split_once(" - ") {
                let low = Partial::parse(low.trim()).ok_or_else(invalid)?;
                let high = Partial::parse(high.trim()).ok_or_else(invalid)?;
                comparators.extend(low.desugar(">=").ok_or_else(invalid)?);
                comparators.extend(high.hyphen_upper().ok_or_else(invalid)?);
                alternatives.push(comparators);
                continue;
            }
            // Rejoin operators that were written apart from their version: `>= 1.2`.
            let mut tokens = Vec::new();
            let mut pending = String::new();
            for word in alternative.split_whitespace() {
                pending.push_str(word);
                if !OPERATORS.contains(&pending.as_str()) {
                    tokens.push(std::mem::take(&mut pending));
                }
            }
            if !pending.is_empty() {
                return Err(invalid());
            }
            for token in tokens {
                let (op, version) = split_operator(&token);
                let partial = if version.is_empty() && op.is_empty() {
                    Partial::default()
                } else {
                    Partial::parse(version).ok_or_else(invalid)?
                };
                comparators.extend(partial.desugar(op).ok_or_else(invalid)?);
            }
            alternatives.push(comparators);
        }
        Ok(Self { source: source.to_string(), alternatives })
    }

    /// Whether `version` satisfies the range.
    ///
    /// A prerelease version only satisfies a range if `include_prerelease` is
    /// set, or if the range itself names a prerelease of the same
    /// `MAJOR.MINOR.PATCH`.
    pub fn matches(&self, version: &Version, include_prerelease: bool) -> bool {
        self.alternatives.iter().any(|comparators| {
            if !comparators.iter().all(|c| c.matches(version)) {
                return false;
            }
            if version.pre.is_empty() || include_prerelease {
                return true;
            }
            comparators.iter().any(|c| {
                !c.version.pre.is_empty()
                    && (c.version.major, c.version.minor, c.version.patch)
                        == (version.major, version.minor, version.patch)
            })
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl Default for VersionRange {
    fn default() -> Self {
        Self::any()
    }
}

impl FromStr for VersionRange {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
