//! Blob storage for cloud-backed workspace containers.
//!
//! A cloud container is nothing more than a handful of keys in some blob
//! store: a manifest, a lock object and the content blobs themselves. This
//! crate provides the store; `stow-workspace` gives the keys their meaning.

pub mod backend;
pub mod error;
mod file;
mod path;

pub use crate::backend::StorageBackend;
pub use crate::file::FileInfo;
pub use crate::path::validate as validate_path;
use std::sync::Arc;

pub type BackendHandle = Arc<dyn StorageBackend + Send + Sync>;
