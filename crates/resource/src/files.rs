//! Embedded file resources.
//!
//! Files are stored gzip-compressed whenever that makes them smaller, along
//! with their original size, extension and modification time. Every
//! replacement bumps the row's generation so that extracted copies can be
//! checked for staleness without reading the data.

use exn::{OptionExt, ResultExt};
use flate2::Compression as Level;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sqlx::FromRow;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::instrument;

use crate::db::ResourceDb;
use crate::error::{ErrorKind, ResourceKind, Result};
use crate::resources::{insert_error, validate_name};

/// Metadata of an embedded file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedFile {
    pub name: String,
    /// Extension without the leading dot; empty when the file had none.
    pub ext: String,
    /// Uncompressed size in bytes.
    pub size: u64,
    pub generation: i64,
    pub modified: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compression {
    None,
    Gzip,
}

impl Compression {
    fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            _ => exn::bail!(ErrorKind::InvalidData),
        }
    }
}

#[derive(Debug, FromRow)]
struct FileRow {
    name: String,
    ext: String,
    compression: String,
    size: i64,
    generation: i64,
    modified: i64,
}

#[derive(Debug, FromRow)]
struct FileDataRow {
    #[sqlx(flatten)]
    info: FileRow,
    data: Vec<u8>,
}

impl TryFrom<FileRow> for EmbeddedFile {
    type Error = crate::error::Error;

    fn try_from(row: FileRow) -> Result<Self> {
        Ok(Self {
            name: row.name,
            ext: row.ext,
            size: u64::try_from(row.size).or_raise(|| ErrorKind::InvalidData)?,
            generation: row.generation,
            modified: OffsetDateTime::from_unix_timestamp(row.modified).or_raise(|| ErrorKind::InvalidData)?,
        })
    }
}

struct Packed {
    compression: Compression,
    size: i64,
    modified: i64,
    data: Vec<u8>,
}

/// Read a local file and pack it for storage.
async fn pack(source: &Path) -> Result<Packed> {
    let raw = match tokio::fs::read(source).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => exn::bail!(ErrorKind::NoSuchFile(source.to_path_buf())),
        Err(e) => return Err(e).or_raise(|| ErrorKind::Io),
    };
    let modified = tokio::fs::metadata(source)
        .await
        .and_then(|m| m.modified())
        .map(OffsetDateTime::from)
        .unwrap_or_else(|_| OffsetDateTime::now_utc());
    let size = i64::try_from(raw.len()).or_raise(|| ErrorKind::InvalidData)?;
    let mut encoder = GzEncoder::new(Vec::new(), Level::best());
    encoder.write_all(&raw).or_raise(|| ErrorKind::Io)?;
    let compressed = encoder.finish().or_raise(|| ErrorKind::Io)?;
    let (compression, data) =
        if compressed.len() < raw.len() { (Compression::Gzip, compressed) } else { (Compression::None, raw) };
    Ok(Packed { compression, size, modified: modified.unix_timestamp(), data })
}

fn unpack(compression: Compression, data: Vec<u8>, size: u64) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(data),
        Compression::Gzip => {
            let mut out = Vec::with_capacity(usize::try_from(size).unwrap_or_default());
            GzDecoder::new(data.as_slice()).read_to_end(&mut out).or_raise(|| ErrorKind::InvalidData)?;
            Ok(out)
        },
    }
}

fn extension_of(source: &Path, ext: Option<&str>) -> String {
    match ext {
        Some(ext) => ext.trim_start_matches('.').to_string(),
        None => source.extension().map(|e| e.to_string_lossy().into_owned()).unwrap_or_default(),
    }
}

impl ResourceDb {
    /// Embed a local file under `name`.
    ///
    /// The extension defaults to that of `source`. Fails if `source` cannot
    /// be read or the name is already taken.
    #[instrument(skip(self), fields(source = %source.display()))]
    pub async fn add_file(&self, name: &str, source: &Path, ext: Option<&str>) -> Result<()> {
        self.ensure_writable()?;
        validate_name(name)?;
        let packed = pack(source).await?;
        sqlx::query(include_str!("../queries/insert_file.sql"))
            .bind(name)
            .bind(extension_of(source, ext))
            .bind(packed.compression.as_str())
            .bind(packed.size)
            .bind(packed.modified)
            .bind(packed.data)
            .execute(self.pool())
            .await
            .map_err(|e| insert_error(e, ResourceKind::File, name))?;
        tracing::debug!(size = packed.size, compression = packed.compression.as_str(), "embedded file");
        Ok(())
    }

    /// Replace the contents of an existing embedded file.
    ///
    /// The source is checked first: a missing source is
    /// [`ErrorKind::NoSuchFile`] even when `name` does not exist either.
    #[instrument(skip(self), fields(source = %source.display()))]
    pub async fn update_file(&self, name: &str, source: &Path) -> Result<()> {
        self.ensure_writable()?;
        let packed = pack(source).await?;
        let result = sqlx::query(include_str!("../queries/replace_file.sql"))
            .bind(name)
            .bind(packed.compression.as_str())
            .bind(packed.size)
            .bind(packed.modified)
            .bind(packed.data)
            .execute(self.pool())
            .await
            .or_raise(|| ErrorKind::Database)?;
        if result.rows_affected() == 0 {
            exn::bail!(ErrorKind::ReplaceFailed(ResourceKind::File, name.to_string()));
        }
        Ok(())
    }

    pub async fn remove_file(&self, name: &str) -> Result<()> {
        self.delete_resource(ResourceKind::File, name).await
    }

    /// Metadata of an embedded file, without its contents.
    pub async fn file_info(&self, name: &str) -> Result<Option<EmbeddedFile>> {
        let row: Option<FileRow> = sqlx::query_as(include_str!("../queries/get_file_info.sql"))
            .bind(name)
            .fetch_optional(self.pool())
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(EmbeddedFile::try_from).transpose()
    }

    pub async fn file_names(&self) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT name FROM files ORDER BY name")
            .fetch_all(self.pool())
            .await
            .or_raise(|| ErrorKind::Database)
    }

    /// Decompress an embedded file to `dest`.
    ///
    /// Parent directories are created. The file is written to a sibling
    /// temporary path first and renamed into place, so a concurrent reader
    /// never sees a partial file.
    #[instrument(skip(self), fields(dest = %dest.display()))]
    pub async fn extract_file(&self, name: &str, dest: &Path) -> Result<EmbeddedFile> {
        let row: Option<FileDataRow> = sqlx::query_as(include_str!("../queries/get_file_data.sql"))
            .bind(name)
            .fetch_optional(self.pool())
            .await
            .or_raise(|| ErrorKind::Database)?;
        let FileDataRow { info, data } = row.ok_or_raise(|| ErrorKind::NotFound(ResourceKind::File, name.to_string()))?;
        let compression = Compression::parse(&info.compression)?;
        let info = EmbeddedFile::try_from(info)?;
        let contents = unpack(compression, data, info.size)?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.or_raise(|| ErrorKind::Io)?;
        }
        let tmp = temporary_sibling(dest);
        tokio::fs::write(&tmp, &contents).await.or_raise(|| ErrorKind::Io)?;
        if let Err(e) = tokio::fs::rename(&tmp, dest).await {
            _ = tokio::fs::remove_file(&tmp).await;
            return Err(e).or_raise(|| ErrorKind::Io);
        }
        Ok(info)
    }
}

fn temporary_sibling(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{}.part", std::process::id()));
    dest.with_file_name(name)
}
