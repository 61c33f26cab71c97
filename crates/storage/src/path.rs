//! Blob key validation.
//!
//! Every backend maps keys onto something with a root (a directory, a bucket
//! prefix, a map), so every key must stay underneath that root.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Validates and normalizes a blob key.
///
/// `.` components and repeated separators are dropped, `..` is resolved
/// against the preceding components and must never climb above the root.
/// Empty keys and keys containing NUL bytes are rejected.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use stow_storage::validate_path;
/// assert!(validate_path("fonts-02/manifest.json").is_ok());
/// assert!(validate_path("fonts-02/blobs/../write-lock.json").is_ok());
/// assert!(validate_path("../fonts-02/manifest.json").is_err());
/// assert!(validate_path("fonts-02\0").is_err());
/// assert_eq!(
///     validate_path("fonts-02//./blobs/").unwrap(),
///     Path::new("fonts-02/blobs")
/// );
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let original = path.as_ref();
    let mut components = Vec::new();
    for component in original.components() {
        match component {
            Component::Normal(s) => {
                // Path::components() lets NUL through on Unix; syscalls would
                // silently truncate at it.
                if s.as_encoded_bytes().contains(&0) {
                    exn::bail!(ErrorKind::InvalidPath(original.to_path_buf()));
                }
                components.push(s)
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => exn::bail!(ErrorKind::InvalidPath(original.to_path_buf())),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidPath(original.to_path_buf()));
                }
            },
        }
    }
    if components.is_empty() {
        exn::bail!(ErrorKind::InvalidPath(original.to_path_buf()));
    }
    Ok(components.into_iter().collect())
}
