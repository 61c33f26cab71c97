//! String and blob resources.

use exn::ResultExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::instrument;

use crate::db::ResourceDb;
use crate::error::{ErrorKind, ResourceKind, Result};

/// A value stored under a resource name.
///
/// Objects are JSON objects or arrays kept in the string namespace in their
/// serialized form.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceValue {
    String(String),
    Blob(Vec<u8>),
    Object(Value),
}

impl ResourceValue {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::String(_) | Self::Object(_) => ResourceKind::String,
            Self::Blob(_) => ResourceKind::Blob,
        }
    }
}

impl From<&str> for ResourceValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for ResourceValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<u8>> for ResourceValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Blob(value)
    }
}

impl From<Value> for ResourceValue {
    fn from(value: Value) -> Self {
        Self::Object(value)
    }
}

pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() || name.chars().any(char::is_control) {
        exn::bail!(ErrorKind::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Map a failed insert onto the error the caller can act on.
pub(crate) fn insert_error(err: sqlx::Error, kind: ResourceKind, name: &str) -> crate::error::Error {
    if let sqlx::Error::Database(db_err) = &err
        && db_err.is_unique_violation()
    {
        return exn::Exn::from(ErrorKind::AlreadyExists(kind, name.to_string()));
    }
    exn::Exn::from(err).raise(ErrorKind::Database)
}

impl ResourceDb {
    pub(crate) async fn delete_resource(&self, kind: ResourceKind, name: &str) -> Result<()> {
        self.ensure_writable()?;
        let sql = format!("DELETE FROM {} WHERE name = ?1", kind.table());
        let result = sqlx::query(&sql).bind(name).execute(self.pool()).await.or_raise(|| ErrorKind::Database)?;
        if result.rows_affected() == 0 {
            exn::bail!(ErrorKind::NotFound(kind, name.to_string()));
        }
        tracing::debug!(%kind, name, "removed resource");
        Ok(())
    }

    async fn resource_names(&self, kind: ResourceKind) -> Result<Vec<String>> {
        let sql = format!("SELECT name FROM {} ORDER BY name", kind.table());
        sqlx::query_scalar(&sql).fetch_all(self.pool()).await.or_raise(|| ErrorKind::Database)
    }

    /// Add a new string resource. Fails if the name is already taken.
    #[instrument(skip(self, value))]
    pub async fn add_string(&self, name: &str, value: &str) -> Result<()> {
        self.ensure_writable()?;
        validate_name(name)?;
        sqlx::query("INSERT INTO strings (name, value) VALUES (?1, ?2)")
            .bind(name)
            .bind(value)
            .execute(self.pool())
            .await
            .map_err(|e| insert_error(e, ResourceKind::String, name))?;
        Ok(())
    }

    /// Replace the value of an existing string resource.
    #[instrument(skip(self, value))]
    pub async fn update_string(&self, name: &str, value: &str) -> Result<()> {
        self.ensure_writable()?;
        let result = sqlx::query("UPDATE strings SET value = ?2 WHERE name = ?1")
            .bind(name)
            .bind(value)
            .execute(self.pool())
            .await
            .or_raise(|| ErrorKind::Database)?;
        if result.rows_affected() == 0 {
            exn::bail!(ErrorKind::NotFound(ResourceKind::String, name.to_string()));
        }
        Ok(())
    }

    pub async fn remove_string(&self, name: &str) -> Result<()> {
        self.delete_resource(ResourceKind::String, name).await
    }

    pub async fn get_string(&self, name: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT value FROM strings WHERE name = ?1")
            .bind(name)
            .fetch_optional(self.pool())
            .await
            .or_raise(|| ErrorKind::Database)
    }

    pub async fn string_names(&self) -> Result<Vec<String>> {
        self.resource_names(ResourceKind::String).await
    }

    /// Add a new blob resource. Fails if the name is already taken.
    #[instrument(skip(self, value), fields(size = value.len()))]
    pub async fn add_blob(&self, name: &str, value: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        validate_name(name)?;
        sqlx::query("INSERT INTO blobs (name, value) VALUES (?1, ?2)")
            .bind(name)
            .bind(value)
            .execute(self.pool())
            .await
            .map_err(|e| insert_error(e, ResourceKind::Blob, name))?;
        Ok(())
    }

    /// Replace the value of an existing blob resource.
    #[instrument(skip(self, value), fields(size = value.len()))]
    pub async fn update_blob(&self, name: &str, value: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        let result = sqlx::query("UPDATE blobs SET value = ?2 WHERE name = ?1")
            .bind(name)
            .bind(value)
            .execute(self.pool())
            .await
            .or_raise(|| ErrorKind::Database)?;
        if result.rows_affected() == 0 {
            exn::bail!(ErrorKind::NotFound(ResourceKind::Blob, name.to_string()));
        }
        Ok(())
    }

    pub async fn remove_blob(&self, name: &str) -> Result<()> {
        self.delete_resource(ResourceKind::Blob, name).await
    }

    pub async fn get_blob(&self, name: &str) -> Result<Option<Vec<u8>>> {
        sqlx::query_scalar("SELECT value FROM blobs WHERE name = ?1")
            .bind(name)
            .fetch_optional(self.pool())
            .await
            .or_raise(|| ErrorKind::Database)
    }

    pub async fn blob_names(&self) -> Result<Vec<String>> {
        self.resource_names(ResourceKind::Blob).await
    }

    /// Add a string, blob or object resource.
    pub async fn add_value(&self, name: &str, value: &ResourceValue) -> Result<()> {
        match value {
            ResourceValue::String(s) => self.add_string(name, s).await,
            ResourceValue::Blob(b) => self.add_blob(name, b).await,
            ResourceValue::Object(v) => self.add_string(name, &serialize_object(v)?).await,
        }
    }

    /// Replace a string, blob or object resource.
    pub async fn update_value(&self, name: &str, value: &ResourceValue) -> Result<()> {
        match value {
            ResourceValue::String(s) => self.update_string(name, s).await,
            ResourceValue::Blob(b) => self.update_blob(name, b).await,
            ResourceValue::Object(v) => self.update_string(name, &serialize_object(v)?).await,
        }
    }

    /// Read a string resource back as a typed object.
    pub async fn get_object<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let Some(raw) = self.get_string(name).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw).map(Some).or_raise(|| ErrorKind::InvalidData)
    }
}

fn serialize_object(value: &Value) -> Result<String> {
    if !(value.is_object() || value.is_array()) {
        exn::bail!(ErrorKind::InvalidValue("objects must be a JSON object or array"));
    }
    serde_json::to_string(value).or_raise(|| ErrorKind::InvalidData)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::OpenMode;
    use serde_json::json;

    async fn writable() -> (tempfile::TempDir, ResourceDb) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test-1.0.0.wsdb");
        ResourceDb::create_empty(&path).await.unwrap();
        let db = ResourceDb::open(&path, OpenMode::ReadWrite).await.unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn test_string_lifecycle() {
        let (_dir, db) = writable().await;
        db.add_string("greeting", "hello").await.unwrap();
        assert_eq!(db.get_string("greeting").await.unwrap().as_deref(), Some("hello"));

        let err = db.add_string("greeting", "again").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::AlreadyExists(ResourceKind::String, _)));

        db.update_string("greeting", "goodbye").await.unwrap();
        assert_eq!(db.get_string("greeting").await.unwrap().as_deref(), Some("goodbye"));

        db.remove_string("greeting").await.unwrap();
        assert_eq!(db.get_string("greeting").await.unwrap(), None);
        let err = db.remove_string("greeting").await.unwrap_err();
        assert!((*err).to_string().contains("does not exist"));
        db.close().await;
    }

    #[tokio::test]
    async fn test_update_missing_string() {
        let (_dir, db) = writable().await;
        let err = db.update_string("missing", "x").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(ResourceKind::String, name) if name == "missing"));
        db.close().await;
    }

    #[tokio::test]
    async fn test_namespaces_are_independent() {
        let (_dir, db) = writable().await;
        db.add_string("shared", "text").await.unwrap();
        db.add_blob("shared", &[1, 2, 3]).await.unwrap();
        assert_eq!(db.get_blob("shared").await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(db.get_string("shared").await.unwrap().as_deref(), Some("text"));
        db.remove_blob("shared").await.unwrap();
        assert_eq!(db.get_string("shared").await.unwrap().as_deref(), Some("text"));
        db.close().await;
    }

    #[tokio::test]
    async fn test_blob_lifecycle() {
        let (_dir, db) = writable().await;
        db.add_blob("image", &[0xde, 0xad]).await.unwrap();
        db.update_blob("image", &[0xbe, 0xef]).await.unwrap();
        assert_eq!(db.get_blob("image").await.unwrap(), Some(vec![0xbe, 0xef]));
        assert_eq!(db.blob_names().await.unwrap(), vec!["image".to_string()]);
        let err = db.update_blob("other", &[]).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(ResourceKind::Blob, _)));
        db.close().await;
    }

    #[tokio::test]
    async fn test_objects() {
        let (_dir, db) = writable().await;
        let value = json!({"fonts": ["Arial", "Helvetica"], "size": 12});
        db.add_value("styles", &ResourceValue::from(value.clone())).await.unwrap();
        let back: Value = db.get_object("styles").await.unwrap().unwrap();
        assert_eq!(back, value);

        let err = db.add_value("scalar", &ResourceValue::Object(json!(42))).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidValue(_)));
        db.close().await;
    }

    #[tokio::test]
    async fn test_invalid_names() {
        let (_dir, db) = writable().await;
        for name in ["", "   ", "line\nbreak"] {
            let err = db.add_string(name, "x").await.unwrap_err();
            assert!(matches!(&*err, ErrorKind::InvalidName(_)), "{name:?}");
        }
        db.close().await;
    }

    #[tokio::test]
    async fn test_readonly_rejects_mutation() {
        let (dir, db) = writable().await;
        db.add_string("a", "b").await.unwrap();
        db.close().await;
        let db = ResourceDb::open(dir.path().join("test-1.0.0.wsdb"), OpenMode::Readonly).await.unwrap();
        assert_eq!(db.get_string("a").await.unwrap().as_deref(), Some("b"));
        let err = db.add_string("c", "d").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::ReadOnly(_)));
        db.close().await;
    }
}
