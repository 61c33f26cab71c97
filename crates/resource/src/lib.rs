//! Resource databases.
//!
//! A resource database is a single SQLite file with three namespaces:
//! strings (which also hold JSON objects), binary blobs and embedded files.
//! Databases carry a persistence version stamp and refuse to open for
//! libraries that do not satisfy it.

mod db;
pub mod error;
mod files;
mod resources;
mod version;

pub use self::db::{
    OpenMode, PERSISTENCE_VERSION, REQUIRED_READ_VERSION, REQUIRED_WRITE_VERSION, RequiredVersions, ResourceDb,
};
pub use self::error::{ErrorKind, ResourceKind};
pub use self::files::EmbeddedFile;
pub use self::resources::ResourceValue;
pub use self::version::{VersionRange, cmp_precedence, normalize_version};
pub use semver::Version;
