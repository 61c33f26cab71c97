//! Db file naming and version resolution.
//!
//! A container directory is the source of truth for which versions of a db
//! exist: every version is a sibling file named `<dbName>-<version>.wsdb`.

use stow_resource::{Version, VersionRange, cmp_precedence};

use crate::error::{ErrorKind, Result};
use crate::names::DbName;

pub const DB_EXTENSION: &str = "wsdb";

/// File name of one version of a db.
pub fn db_file_name(db_name: &DbName, version: &Version) -> String {
    format!("{db_name}-{version}.{DB_EXTENSION}")
}

/// Split a db file name into its db name and version.
///
/// Db names cannot contain dots and versions always do, so the name ends at
/// the last hyphen before the first dot.
pub fn parse_db_file_name(file_name: &str) -> Option<(&str, Version)> {
    let stem = file_name.strip_suffix(DB_EXTENSION)?.strip_suffix('.')?;
    let first_dot = stem.find('.')?;
    let split = stem[..first_dot].rfind('-')?;
    let (name, version) = (&stem[..split], &stem[split + 1..]);
    if name.is_empty() {
        return None;
    }
    Version::parse(version).ok().map(|version| (name, version))
}

/// A version resolution request.
#[derive(Debug, Clone)]
pub struct VersionQuery<'a> {
    pub db_name: &'a DbName,
    pub range: &'a VersionRange,
    pub include_prerelease: bool,
}

/// Pick the file holding the highest version of a db that satisfies the query.
///
/// Candidates that are not files of this db, or whose version does not parse,
/// are ignored. Should two files carry versions of equal precedence (which
/// only differ in build metadata), the lexicographically smallest file name
/// wins.
pub fn resolve_version<'a>(
    query: &VersionQuery<'_>,
    candidates: impl IntoIterator<Item = &'a str>,
) -> Result<(&'a str, Version)> {
    let mut best: Option<(&'a str, Version)> = None;
    for file_name in candidates {
        let Some((name, version)) = parse_db_file_name(file_name) else { continue };
        if name != query.db_name.as_str() || !query.range.matches(&version, query.include_prerelease) {
            continue;
        }
        let better = match &best {
            None => true,
            Some((best_name, best_version)) => match cmp_precedence(&version, best_version) {
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Equal => file_name < *best_name,
                std::cmp::Ordering::Less => false,
            },
        };
        if better {
            best = Some((file_name, version));
        }
    }
    best.ok_or_else(|| {
        exn::Exn::from(ErrorKind::NoVersion {
            db_name: query.db_name.to_string(),
            range: query.range.to_string(),
        })
    })
}

/// Every version of a db present among `candidates`, lowest first.
pub fn versions_of<'a>(db_name: &DbName, candidates: impl IntoIterator<Item = &'a str>) -> Vec<Version> {
    let mut versions: Vec<Version> = candidates
        .into_iter()
        .filter_map(parse_db_file_name)
        .filter(|(name, _)| *name == db_name.as_str())
        .map(|(_, version)| version)
        .collect();
    versions.sort_by(cmp_precedence);
    versions.dedup_by(|a, b| cmp_precedence(a, b).is_eq());
    versions
}
